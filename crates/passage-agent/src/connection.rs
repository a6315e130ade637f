//! Outbound control-channel connection and reconnect loop
//!
//! The agent retries forever with exponential backoff; every new channel
//! performs a fresh handshake and re-registration, and requests in flight
//! on a lost channel do not resume. Authentication rejections are fatal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, info, warn};

use passage_control::{split_websocket, Channel, ChannelConfig};

use crate::config::AgentConfig;
use crate::origin_http2::H2Origin;
use crate::{dispatcher, AgentError};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Exponential backoff between reconnection attempts.
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempt: usize,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            attempt: 0,
        }
    }

    pub async fn wait(&mut self) {
        self.attempt += 1;
        debug!(
            attempt = self.attempt,
            delay_ms = self.current.as_millis() as u64,
            "Waiting before reconnect"
        );
        sleep(self.current).await;
        self.current = (self.current * 2).min(self.max);
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(5))
    }
}

/// Run the agent until shutdown is signalled or authentication fails.
pub async fn run(
    config: AgentConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), AgentError> {
    let origin = Arc::new(H2Origin::new(config.clone()));
    let mut backoff = Backoff::default();

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        match connect(&config).await {
            Ok(channel) => {
                info!(server = %config.server_url, "Tunnel established");
                backoff.reset();
                let handle = channel.handle.clone();

                tokio::select! {
                    _ = dispatcher::serve(channel, origin.clone(), config.clone()) => {
                        warn!("Tunnel connection lost, reconnecting");
                    }
                    _ = shutdown.changed() => {
                        info!("Draining tunnel before shutdown");
                        handle.drain_and_close(DRAIN_TIMEOUT).await;
                        return Ok(());
                    }
                }
            }
            Err(err @ AgentError::AuthenticationRejected(_)) => return Err(err),
            Err(err @ AgentError::InvalidUrl(_)) => return Err(err),
            Err(err) => warn!(%err, "Tunnel connect failed"),
        }

        tokio::select! {
            _ = backoff.wait() => {}
            _ = shutdown.changed() => return Ok(()),
        }
    }
}

/// One handshake attempt: WebSocket upgrade carrying the bearer token and
/// the registration headers.
pub async fn connect(config: &AgentConfig) -> Result<Channel, AgentError> {
    let url = config.control_url()?;

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| AgentError::Connect(e.to_string()))?;
    {
        let headers = request.headers_mut();
        headers.insert(
            "authorization",
            format!("Bearer {}", config.auth_token)
                .parse()
                .map_err(|_| AgentError::Connect("invalid auth token".to_string()))?,
        );
        headers.insert(
            "path-prefix",
            config
                .path_prefix
                .parse()
                .map_err(|_| AgentError::Connect("invalid path prefix".to_string()))?,
        );
        headers.insert("supports-http2", "true".parse().expect("static header"));
    }

    let (ws, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|err| match err {
            WsError::Http(response)
                if response.status() == http::StatusCode::UNAUTHORIZED
                    || response.status() == http::StatusCode::FORBIDDEN =>
            {
                let body = response
                    .into_body()
                    .map(|b| String::from_utf8_lossy(&b).into_owned())
                    .unwrap_or_default();
                AgentError::AuthenticationRejected(body)
            }
            WsError::Http(response) => {
                let status = response.status();
                let body = response
                    .into_body()
                    .map(|b| String::from_utf8_lossy(&b).into_owned())
                    .unwrap_or_default();
                AgentError::Connect(format!("{status}: {body}"))
            }
            other => AgentError::Connect(other.to_string()),
        })?;

    let (sink, source) = split_websocket(ws);
    Ok(passage_control::spawn(sink, source, ChannelConfig::default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backoff_doubles_to_cap() {
        tokio::time::pause();
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(35));

        backoff.wait().await;
        assert_eq!(backoff.current, Duration::from_millis(20));
        backoff.wait().await;
        assert_eq!(backoff.current, Duration::from_millis(35));
        backoff.wait().await;
        assert_eq!(backoff.current, Duration::from_millis(35));
        assert_eq!(backoff.attempt(), 3);

        backoff.reset();
        assert_eq!(backoff.current, Duration::from_millis(10));
        assert_eq!(backoff.attempt(), 0);
    }
}
