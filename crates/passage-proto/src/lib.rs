//! Tunnel protocol: event model and wire codec for the control channel.
//!
//! Every message on the control channel is one event-named frame with
//! positional arguments. Two wire families exist for historical reasons
//! (`request` vs `http2-request`); both are encoded and decoded here, and
//! the rest of the system works with the unified [`TunnelEvent`] plus the
//! [`Flavor`] field on the request descriptor.

mod codec;
mod event;
pub mod headers;

pub use codec::{decode_event, encode_event, MAX_FRAME_SIZE};
pub use event::{
    Flavor, HeaderList, RequestDescriptor, RequestId, ResponseDescriptor, TunnelEvent, WireFamily,
};

use thiserror::Error;

/// Protocol-level errors for encoding and decoding control-channel frames.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Unknown event name: {0}")]
    UnknownEvent(String),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Truncated frame")]
    Truncated,

    #[error("Event name is not ASCII")]
    InvalidEventName,

    #[error("Invalid header {0:?}")]
    InvalidHeader(String),

    #[error("Payload codec error: {0}")]
    Payload(#[from] bincode::Error),
}
