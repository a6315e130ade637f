//! Agent configuration, taken from the environment

use clap::Parser;
use url::Url;

use crate::AgentError;

/// Reserved control-channel path on the edge.
pub const CONTROL_PATH: &str = "/$web_tunnel";

/// Tunnel agent forwarding a local origin through a public edge.
#[derive(Parser, Debug, Clone)]
#[command(name = "passage-agent", about = "Reverse tunnel agent", version)]
pub struct AgentConfig {
    /// Edge server URL (http, https, ws, or wss).
    #[arg(long, env = "TUNNEL_SERVER_URL")]
    pub server_url: String,

    /// Bearer token presented at the control-channel handshake.
    #[arg(long, env = "TUNNEL_AUTH_TOKEN")]
    pub auth_token: String,

    /// Port of the local origin server.
    #[arg(long, env = "LOCAL_PORT")]
    pub local_port: u16,

    /// Host of the local origin server.
    #[arg(long, env = "LOCAL_HOST", default_value = "localhost")]
    pub local_host: String,

    /// Path prefix this agent claims on its host; empty claims the whole
    /// host.
    #[arg(long, env = "PATH_PREFIX", default_value = "")]
    pub path_prefix: String,

    /// Skip TLS certificate verification toward the local origin.
    #[arg(long, env = "INSECURE")]
    pub insecure: bool,

    /// Verbose logging.
    #[arg(long, env = "DEBUG")]
    pub debug: bool,
}

impl AgentConfig {
    /// The WebSocket URL of the control endpoint, derived from the
    /// configured server URL.
    pub fn control_url(&self) -> Result<Url, AgentError> {
        let mut url =
            Url::parse(&self.server_url).map_err(|e| AgentError::InvalidUrl(e.to_string()))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(AgentError::InvalidUrl(format!(
                    "unsupported scheme {other}"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| AgentError::InvalidUrl(self.server_url.clone()))?;
        url.set_path(CONTROL_PATH);
        url.set_query(None);
        Ok(url)
    }

    /// `host:port` of the local origin.
    pub fn origin_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(server_url: &str) -> AgentConfig {
        AgentConfig::try_parse_from([
            "passage-agent",
            "--server-url",
            server_url,
            "--auth-token",
            "tok",
            "--local-port",
            "8080",
        ])
        .unwrap()
    }

    #[test]
    fn test_control_url_schemes() {
        assert_eq!(
            config("https://edge.example.com").control_url().unwrap().as_str(),
            "wss://edge.example.com/$web_tunnel"
        );
        assert_eq!(
            config("http://edge.example.com:3000").control_url().unwrap().as_str(),
            "ws://edge.example.com:3000/$web_tunnel"
        );
        assert_eq!(
            config("wss://edge.example.com/ignored?x=1")
                .control_url()
                .unwrap()
                .as_str(),
            "wss://edge.example.com/$web_tunnel"
        );
        assert!(config("ftp://edge.example.com").control_url().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = config("https://edge.example.com");
        assert_eq!(config.local_host, "localhost");
        assert_eq!(config.path_prefix, "");
        assert!(!config.insecure);
        assert_eq!(config.origin_addr(), "localhost:8080");
    }
}
