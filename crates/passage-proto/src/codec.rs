//! Wire codec for control-channel frames
//!
//! Frame layout: a one-byte event-name length, the ASCII event name, then
//! the event's positional arguments as a bincode-encoded tuple. The
//! transport (WebSocket binary messages) already delimits frames, so no
//! outer length prefix is needed.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::event::{
    RequestDescriptor, RequestId, ResponseDescriptor, TunnelEvent, WireFamily,
};
use crate::ProtoError;

/// Upper bound on one encoded frame. Producers chunk bodies well below
/// this; anything larger is a protocol violation.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

const HTTP2_PREFIX: &str = "http2-";

fn base_name(event: &TunnelEvent) -> &'static str {
    match event {
        TunnelEvent::Request { .. } => "request",
        TunnelEvent::RequestData { .. } => "request-data",
        TunnelEvent::RequestDataBatch { .. } => "request-data-batch",
        TunnelEvent::RequestEnd { .. } => "request-end",
        TunnelEvent::RequestError { .. } => "request-error",
        TunnelEvent::Response { .. } => "response",
        TunnelEvent::ResponseData { .. } => "response-data",
        TunnelEvent::ResponseDataBatch { .. } => "response-data-batch",
        TunnelEvent::ResponseEnd { .. } => "response-end",
        TunnelEvent::ResponseError { .. } => "response-error",
        TunnelEvent::ResponseTrailers { .. } => "response-trailers",
        TunnelEvent::Ping => "ping",
        TunnelEvent::Pong => "pong",
    }
}

/// Encode one event for the given wire family.
///
/// Ping/pong are family-less and always use their bare names. Every other
/// event is prefixed with `http2-` when the family is [`WireFamily::Http2`].
pub fn encode_event(event: &TunnelEvent, family: WireFamily) -> Result<Bytes, ProtoError> {
    let base = base_name(event);
    let prefixed;
    let name = match (event, family) {
        (TunnelEvent::Ping | TunnelEvent::Pong, _) => base,
        (_, WireFamily::Http1) => base,
        (_, WireFamily::Http2) => {
            prefixed = format!("{HTTP2_PREFIX}{base}");
            &prefixed
        }
    };

    let payload = match event {
        TunnelEvent::Request { id, descriptor } => bincode::serialize(&(id, descriptor))?,
        TunnelEvent::RequestData { id, data } => bincode::serialize(&(id, data))?,
        TunnelEvent::RequestDataBatch { id, chunks } => bincode::serialize(&(id, chunks))?,
        TunnelEvent::RequestEnd { id } => bincode::serialize(&(id,))?,
        TunnelEvent::RequestError { id, message } => bincode::serialize(&(id, message))?,
        TunnelEvent::Response { id, descriptor } => bincode::serialize(&(id, descriptor))?,
        TunnelEvent::ResponseData { id, data } => bincode::serialize(&(id, data))?,
        TunnelEvent::ResponseDataBatch { id, chunks } => bincode::serialize(&(id, chunks))?,
        TunnelEvent::ResponseEnd { id } => bincode::serialize(&(id,))?,
        TunnelEvent::ResponseError { id, message } => bincode::serialize(&(id, message))?,
        TunnelEvent::ResponseTrailers { id, trailers } => bincode::serialize(&(id, trailers))?,
        TunnelEvent::Ping | TunnelEvent::Pong => Vec::new(),
    };

    let total = 1 + name.len() + payload.len();
    if total > MAX_FRAME_SIZE {
        return Err(ProtoError::FrameTooLarge(total));
    }
    if !name.is_ascii() || name.len() > u8::MAX as usize {
        return Err(ProtoError::InvalidEventName);
    }

    let mut buf = BytesMut::with_capacity(total);
    buf.put_u8(name.len() as u8);
    buf.put_slice(name.as_bytes());
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Decode one frame, accepting both wire families.
///
/// Returns the unified event plus the family it arrived as, so replies can
/// be emitted with matching names.
pub fn decode_event(mut buf: Bytes) -> Result<(TunnelEvent, WireFamily), ProtoError> {
    if buf.len() > MAX_FRAME_SIZE {
        return Err(ProtoError::FrameTooLarge(buf.len()));
    }
    if buf.is_empty() {
        return Err(ProtoError::Truncated);
    }

    let name_len = buf.get_u8() as usize;
    if buf.remaining() < name_len {
        return Err(ProtoError::Truncated);
    }
    let name_bytes = buf.split_to(name_len);
    let name =
        std::str::from_utf8(&name_bytes).map_err(|_| ProtoError::InvalidEventName)?;

    let (family, base) = match name.strip_prefix(HTTP2_PREFIX) {
        Some(rest) => (WireFamily::Http2, rest),
        None => (WireFamily::Http1, name),
    };

    let event = match base {
        "request" => {
            let (id, descriptor): (RequestId, RequestDescriptor) = bincode::deserialize(&buf)?;
            TunnelEvent::Request { id, descriptor }
        }
        "request-data" => {
            let (id, data): (RequestId, Bytes) = bincode::deserialize(&buf)?;
            TunnelEvent::RequestData { id, data }
        }
        "request-data-batch" => {
            let (id, chunks): (RequestId, Vec<Bytes>) = bincode::deserialize(&buf)?;
            TunnelEvent::RequestDataBatch { id, chunks }
        }
        "request-end" => {
            let (id,): (RequestId,) = bincode::deserialize(&buf)?;
            TunnelEvent::RequestEnd { id }
        }
        "request-error" => {
            let (id, message): (RequestId, String) = bincode::deserialize(&buf)?;
            TunnelEvent::RequestError { id, message }
        }
        "response" => {
            let (id, descriptor): (RequestId, ResponseDescriptor) = bincode::deserialize(&buf)?;
            TunnelEvent::Response { id, descriptor }
        }
        "response-data" => {
            let (id, data): (RequestId, Bytes) = bincode::deserialize(&buf)?;
            TunnelEvent::ResponseData { id, data }
        }
        "response-data-batch" => {
            let (id, chunks): (RequestId, Vec<Bytes>) = bincode::deserialize(&buf)?;
            TunnelEvent::ResponseDataBatch { id, chunks }
        }
        "response-end" => {
            let (id,): (RequestId,) = bincode::deserialize(&buf)?;
            TunnelEvent::ResponseEnd { id }
        }
        "response-error" => {
            let (id, message): (RequestId, String) = bincode::deserialize(&buf)?;
            TunnelEvent::ResponseError { id, message }
        }
        "response-trailers" => {
            let (id, trailers): (RequestId, Vec<(String, String)>) = bincode::deserialize(&buf)?;
            TunnelEvent::ResponseTrailers { id, trailers }
        }
        "ping" => TunnelEvent::Ping,
        "pong" => TunnelEvent::Pong,
        other => return Err(ProtoError::UnknownEvent(other.to_string())),
    };

    Ok((event, family))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Flavor;

    fn descriptor() -> RequestDescriptor {
        RequestDescriptor {
            method: "POST".to_string(),
            path: "/api/v1/upload?retry=1".to_string(),
            headers: vec![
                ("host".to_string(), "example.test".to_string()),
                ("content-type".to_string(), "application/grpc".to_string()),
            ],
            flavor: Flavor::Http2,
        }
    }

    #[test]
    fn test_request_roundtrip_http1() {
        let id = uuid::Uuid::new_v4();
        let event = TunnelEvent::Request {
            id,
            descriptor: RequestDescriptor {
                flavor: Flavor::Http1,
                ..descriptor()
            },
        };

        let encoded = encode_event(&event, WireFamily::Http1).unwrap();
        let (decoded, family) = decode_event(encoded).unwrap();

        assert_eq!(decoded, event);
        assert_eq!(family, WireFamily::Http1);
    }

    #[test]
    fn test_request_roundtrip_http2_prefixed_name() {
        let id = uuid::Uuid::new_v4();
        let event = TunnelEvent::Request {
            id,
            descriptor: descriptor(),
        };

        let encoded = encode_event(&event, WireFamily::Http2).unwrap();
        // On-wire name carries the prefix.
        let name_len = encoded[0] as usize;
        let name = std::str::from_utf8(&encoded[1..1 + name_len]).unwrap();
        assert_eq!(name, "http2-request");

        let (decoded, family) = decode_event(encoded).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(family, WireFamily::Http2);
    }

    #[test]
    fn test_data_roundtrip_preserves_binary_payload() {
        let id = uuid::Uuid::new_v4();
        let payload: Vec<u8> = (0..=255).collect();
        let event = TunnelEvent::ResponseData {
            id,
            data: Bytes::from(payload.clone()),
        };

        for family in [WireFamily::Http1, WireFamily::Http2] {
            let (decoded, _) = decode_event(encode_event(&event, family).unwrap()).unwrap();
            match decoded {
                TunnelEvent::ResponseData { id: got, data } => {
                    assert_eq!(got, id);
                    assert_eq!(&data[..], &payload[..]);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn test_batch_roundtrip() {
        let id = uuid::Uuid::new_v4();
        let event = TunnelEvent::RequestDataBatch {
            id,
            chunks: vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")],
        };

        let (decoded, _) = decode_event(encode_event(&event, WireFamily::Http1).unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_trailers_roundtrip() {
        let id = uuid::Uuid::new_v4();
        let event = TunnelEvent::ResponseTrailers {
            id,
            trailers: vec![("grpc-status".to_string(), "0".to_string())],
        };

        let encoded = encode_event(&event, WireFamily::Http2).unwrap();
        let name_len = encoded[0] as usize;
        assert_eq!(
            std::str::from_utf8(&encoded[1..1 + name_len]).unwrap(),
            "http2-response-trailers"
        );

        let (decoded, _) = decode_event(encoded).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_ping_pong_unprefixed() {
        for event in [TunnelEvent::Ping, TunnelEvent::Pong] {
            let encoded = encode_event(&event, WireFamily::Http2).unwrap();
            let name_len = encoded[0] as usize;
            let name = std::str::from_utf8(&encoded[1..1 + name_len]).unwrap();
            assert!(!name.starts_with("http2-"));

            let (decoded, _) = decode_event(encoded).unwrap();
            assert_eq!(decoded, event);
        }
    }

    #[test]
    fn test_unknown_event() {
        let mut buf = bytes::BytesMut::new();
        buf.put_u8(7);
        buf.put_slice(b"upgrade");
        let err = decode_event(buf.freeze()).unwrap_err();
        assert!(matches!(err, ProtoError::UnknownEvent(name) if name == "upgrade"));
    }

    #[test]
    fn test_truncated_frame() {
        assert!(matches!(
            decode_event(Bytes::new()),
            Err(ProtoError::Truncated)
        ));

        let mut buf = bytes::BytesMut::new();
        buf.put_u8(20);
        buf.put_slice(b"short");
        assert!(matches!(
            decode_event(buf.freeze()),
            Err(ProtoError::Truncated)
        ));
    }

    #[test]
    fn test_status_line_fields_survive() {
        let id = uuid::Uuid::new_v4();
        let event = TunnelEvent::Response {
            id,
            descriptor: ResponseDescriptor {
                status_code: 101,
                status_message: "Switching Protocols".to_string(),
                headers: vec![("upgrade".to_string(), "websocket".to_string())],
            },
        };

        let (decoded, _) = decode_event(encode_event(&event, WireFamily::Http1).unwrap()).unwrap();
        assert_eq!(decoded, event);
    }
}
