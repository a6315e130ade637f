//! Edge configuration, taken from the environment

use clap::Parser;
use std::path::PathBuf;

/// Publicly reachable tunnel edge server.
#[derive(Parser, Debug, Clone)]
#[command(name = "passage-edge", about = "Reverse tunnel edge server", version)]
pub struct EdgeConfig {
    /// Public listen port.
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// TLS private key path. Together with the certificate this enables
    /// HTTP/2 + HTTP/1 on the same port via ALPN.
    #[arg(long, env = "SSL_KEY_PATH")]
    pub ssl_key_path: Option<PathBuf>,

    /// TLS certificate chain path.
    #[arg(long, env = "SSL_CERT_PATH")]
    pub ssl_cert_path: Option<PathBuf>,

    /// Secret used to sign and verify agent admission tokens.
    #[arg(long, env = "SECRET_KEY")]
    pub secret_key: String,

    /// Fixed claim value an admission token must carry.
    #[arg(long, env = "VERIFY_TOKEN")]
    pub verify_token: String,

    /// Username for the token issuer endpoint; endpoint is disabled when
    /// unset.
    #[arg(long, env = "JWT_GENERATOR_USERNAME")]
    pub jwt_generator_username: Option<String>,

    /// Password for the token issuer endpoint.
    #[arg(long, env = "JWT_GENERATOR_PASSWORD")]
    pub jwt_generator_password: Option<String>,
}

impl EdgeConfig {
    pub fn issuer_credentials(&self) -> Option<(String, String)> {
        match (&self.jwt_generator_username, &self.jwt_generator_password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        }
    }

    pub fn tls_paths(&self) -> Option<(&PathBuf, &PathBuf)> {
        self.ssl_cert_path.as_ref().zip(self.ssl_key_path.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec!["passage-edge", "--secret-key", "s3cret", "--verify-token", "vt"]
    }

    #[test]
    fn test_defaults() {
        let config = EdgeConfig::try_parse_from(base_args()).unwrap();
        assert_eq!(config.port, 3000);
        assert!(config.tls_paths().is_none());
        assert!(config.issuer_credentials().is_none());
    }

    #[test]
    fn test_issuer_credentials_require_both() {
        let mut args = base_args();
        args.extend(["--jwt-generator-username", "admin"]);
        let config = EdgeConfig::try_parse_from(args).unwrap();
        assert!(config.issuer_credentials().is_none());

        let mut args = base_args();
        args.extend([
            "--jwt-generator-username",
            "admin",
            "--jwt-generator-password",
            "pw",
        ]);
        let config = EdgeConfig::try_parse_from(args).unwrap();
        assert_eq!(
            config.issuer_credentials(),
            Some(("admin".to_string(), "pw".to_string()))
        );
    }
}
