//! Control channel between the edge and one agent
//!
//! One ordered, reliable, full-duplex message stream carries every tunneled
//! request for an agent. This crate owns the channel lifecycle (reader,
//! writer, heartbeat), the per-request stream registry, and the transport
//! seam the edge and agent plug their WebSocket halves into.

pub mod channel;
pub mod inflight;
pub mod transport;
pub mod ws;

pub use channel::{spawn, Channel, ChannelConfig, ChannelHandle, ChannelState, IncomingRequest};
pub use inflight::{Inflight, StreamFrame};
pub use transport::{memory_pair, FrameSink, FrameSource};
pub use ws::split_websocket;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Control channel closed")]
    Closed,

    #[error("Control channel is draining")]
    Draining,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Proto(#[from] passage_proto::ProtoError),
}
