//! Tunnel event types

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Correlates all frames of one tunneled request. Minted fresh per request,
/// scoped to the lifetime of one control channel.
pub type RequestId = uuid::Uuid;

/// Ordered multimap of header name/value pairs, in wire order.
pub type HeaderList = Vec<(String, String)>;

/// Which HTTP major version a tunneled request is carried as end-to-end.
///
/// `Http2` requests may carry trailers and interleave request body frames
/// after the response has started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Flavor {
    Http1,
    Http2,
}

/// Which on-wire event-name family a frame belongs to.
///
/// The families are semantically identical modulo pseudo-headers and
/// trailers; peers exist that only speak one of them, so both must be
/// understood.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFamily {
    Http1,
    Http2,
}

impl From<Flavor> for WireFamily {
    fn from(flavor: Flavor) -> Self {
        match flavor {
            Flavor::Http1 => WireFamily::Http1,
            Flavor::Http2 => WireFamily::Http2,
        }
    }
}

/// Sent once per tunneled request, edge to agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub method: String,
    /// URI reference including the query string.
    pub path: String,
    pub headers: HeaderList,
    pub flavor: Flavor,
}

/// Sent once per response, agent to edge, before any body frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseDescriptor {
    pub status_code: u16,
    /// Reason phrase; empty is allowed and common for HTTP/2 origins.
    pub status_message: String,
    pub headers: HeaderList,
}

/// One typed message on the control channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TunnelEvent {
    Request {
        id: RequestId,
        descriptor: RequestDescriptor,
    },
    RequestData {
        id: RequestId,
        data: Bytes,
    },
    RequestDataBatch {
        id: RequestId,
        chunks: Vec<Bytes>,
    },
    RequestEnd {
        id: RequestId,
    },
    RequestError {
        id: RequestId,
        message: String,
    },
    Response {
        id: RequestId,
        descriptor: ResponseDescriptor,
    },
    ResponseData {
        id: RequestId,
        data: Bytes,
    },
    ResponseDataBatch {
        id: RequestId,
        chunks: Vec<Bytes>,
    },
    ResponseEnd {
        id: RequestId,
    },
    ResponseError {
        id: RequestId,
        message: String,
    },
    /// Delivered before `ResponseEnd`, HTTP/2 flavor only.
    ResponseTrailers {
        id: RequestId,
        trailers: HeaderList,
    },
    Ping,
    Pong,
}

impl TunnelEvent {
    /// The request id this frame belongs to; `None` for ping/pong.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            TunnelEvent::Request { id, .. }
            | TunnelEvent::RequestData { id, .. }
            | TunnelEvent::RequestDataBatch { id, .. }
            | TunnelEvent::RequestEnd { id }
            | TunnelEvent::RequestError { id, .. }
            | TunnelEvent::Response { id, .. }
            | TunnelEvent::ResponseData { id, .. }
            | TunnelEvent::ResponseDataBatch { id, .. }
            | TunnelEvent::ResponseEnd { id }
            | TunnelEvent::ResponseError { id, .. }
            | TunnelEvent::ResponseTrailers { id, .. } => Some(*id),
            TunnelEvent::Ping | TunnelEvent::Pong => None,
        }
    }
}
