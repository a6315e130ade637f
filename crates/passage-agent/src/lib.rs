//! Tunnel agent: the private end of the tunnel
//!
//! Connects outbound to the edge, keeps the control channel alive across
//! network failures, and forwards tunneled requests into the co-located
//! origin server as HTTP/1 or HTTP/2 depending on each request's flavor.

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod origin_http1;
pub mod origin_http2;

use thiserror::Error;

/// Body chunk ceiling for tunnel data frames.
pub(crate) const DATA_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum AgentError {
    /// The local origin cannot be reached. The exact text is part of the
    /// tunnel contract; the edge converts it into a 502.
    #[error("Local client not connected")]
    OriginUnavailable,

    #[error("Origin error: {0}")]
    Origin(String),

    #[error("Tunnel error: {0}")]
    Channel(#[from] passage_control::ChannelError),

    #[error("Tunnel server rejected the agent: {0}")]
    AuthenticationRejected(String),

    #[error("Failed to reach tunnel server: {0}")]
    Connect(String),

    #[error("Invalid tunnel server URL: {0}")]
    InvalidUrl(String),
}

impl AgentError {
    /// Message carried on a `RES_ERROR` frame for this failure.
    pub fn wire_message(&self) -> String {
        self.to_string()
    }
}
