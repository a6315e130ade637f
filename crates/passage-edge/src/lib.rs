//! Edge server: public entry point of the tunnel
//!
//! Terminates public HTTP/1, HTTP/2, and WebSocket-upgrade traffic,
//! admits agents onto control channels at the reserved endpoint, and
//! dispatches everything else through the matching agent's tunnel.

pub mod config;
pub mod dispatch;
pub mod handshake;
pub mod server;
pub mod tls;

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use thiserror::Error;

use passage_auth::TokenVerifier;
use passage_control::{ChannelConfig, ChannelHandle};
use passage_routing::AgentRegistry;

/// Reserved path for the control-channel endpoint.
pub const CONTROL_PATH: &str = "/$web_tunnel";

/// Path of the token issuer endpoint.
pub const JWT_GENERATOR_PATH: &str = "/tunnel_jwt_generator";

pub type BodyError = Box<dyn std::error::Error + Send + Sync>;
pub type OutBody = BoxBody<Bytes, BodyError>;

/// Shared state of one edge process. Owned explicitly, never global.
pub struct EdgeState {
    pub registry: AgentRegistry<ChannelHandle>,
    pub verifier: TokenVerifier,
    pub secret_key: String,
    pub verify_token: String,
    /// Optional `(username, password)` for the token issuer endpoint.
    pub issuer_credentials: Option<(String, String)>,
    pub channel_config: ChannelConfig,
}

impl EdgeState {
    pub fn new(config: &config::EdgeConfig) -> Arc<Self> {
        Arc::new(Self {
            registry: AgentRegistry::new(),
            verifier: TokenVerifier::new(config.secret_key.as_bytes(), &config.verify_token),
            secret_key: config.secret_key.clone(),
            verify_token: config.verify_token.clone(),
            issuer_credentials: config.issuer_credentials(),
            channel_config: ChannelConfig::default(),
        })
    }
}

#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("Failed to bind port {port}: {reason}")]
    Bind { port: u16, reason: String },
}

/// Fixed-content response body.
pub fn full(text: impl Into<Bytes>) -> OutBody {
    Full::new(text.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty() -> OutBody {
    full(Bytes::new())
}
