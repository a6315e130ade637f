//! TLS termination for the public listener

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::EdgeError;

/// Build the TLS acceptor for the public port. ALPN advertises `h2` and
/// `http/1.1` so one port serves both HTTP majors.
pub fn build_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, EdgeError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| EdgeError::Tls(format!("failed to read certificates: {e}")))?;
    if certs.is_empty() {
        return Err(EdgeError::Tls(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))
        .map_err(|e| EdgeError::Tls(format!("failed to read private key: {e}")))?
        .ok_or_else(|| {
            EdgeError::Tls(format!("no private key found in {}", key_path.display()))
        })?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| EdgeError::Tls(e.to_string()))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    info!(cert = %cert_path.display(), "TLS enabled, serving HTTP/2 and HTTP/1.1 via ALPN");
    Ok(TlsAcceptor::from(Arc::new(config)))
}
