//! HTTP/2 path to the local origin
//!
//! One HTTP/2 connection is shared by all http2-flavored requests. TLS is
//! preferred (ALPN `h2`, optionally without certificate verification for
//! self-signed local origins) with a cleartext fallback. Requests are
//! genuinely full-duplex: the request body keeps streaming while the
//! response comes back, and origin trailers ride through for gRPC.

use std::future::poll_fn;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use h2::client::SendRequest;
use http::{Request, Version};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use passage_control::{ChannelHandle, IncomingRequest, StreamFrame};
use passage_proto::{headers, ResponseDescriptor, TunnelEvent, WireFamily};

use crate::config::AgentConfig;
use crate::origin_http1::send_data_chunks;
use crate::{AgentError, DATA_CHUNK};

const CONNECT_ATTEMPTS: usize = 3;
const CONNECT_BACKOFF: Duration = Duration::from_millis(200);

/// Shared HTTP/2 connection to the local origin, re-established on demand
/// with bounded backoff.
pub struct H2Origin {
    config: AgentConfig,
    sender: Mutex<Option<SendRequest<Bytes>>>,
}

impl H2Origin {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            sender: Mutex::new(None),
        }
    }

    /// A ready stream handle on the shared connection, reconnecting if the
    /// previous connection died.
    pub async fn sender(&self) -> Result<SendRequest<Bytes>, AgentError> {
        let mut guard = self.sender.lock().await;

        if let Some(existing) = guard.clone() {
            match existing.ready().await {
                Ok(ready) => return Ok(ready),
                Err(err) => {
                    debug!(%err, "Origin HTTP/2 connection gone, reconnecting");
                    *guard = None;
                }
            }
        }

        let mut delay = CONNECT_BACKOFF;
        for attempt in 1..=CONNECT_ATTEMPTS {
            match self.connect().await {
                Ok(sender) => {
                    *guard = Some(sender.clone());
                    return Ok(sender);
                }
                Err(err) => {
                    debug!(attempt, %err, "Origin HTTP/2 connect failed");
                    if attempt < CONNECT_ATTEMPTS {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(AgentError::OriginUnavailable)
    }

    /// TLS preferred, cleartext fallback.
    async fn connect(&self) -> Result<SendRequest<Bytes>, AgentError> {
        match self.connect_tls().await {
            Ok(sender) => Ok(sender),
            Err(err) => {
                debug!(%err, "TLS to origin failed, trying cleartext HTTP/2");
                self.connect_cleartext().await
            }
        }
    }

    async fn connect_tls(&self) -> Result<SendRequest<Bytes>, AgentError> {
        let tcp = TcpStream::connect(self.config.origin_addr())
            .await
            .map_err(|e| AgentError::Origin(e.to_string()))?;

        let connector = tls_connector(self.config.insecure);
        let server_name = ServerName::try_from(self.config.local_host.clone())
            .map_err(|e| AgentError::Origin(format!("invalid origin host: {e}")))?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| AgentError::Origin(e.to_string()))?;

        let (sender, connection) = h2::client::handshake(tls)
            .await
            .map_err(|e| AgentError::Origin(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!(%err, "Origin HTTP/2 connection ended");
            }
        });
        Ok(sender)
    }

    async fn connect_cleartext(&self) -> Result<SendRequest<Bytes>, AgentError> {
        let tcp = TcpStream::connect(self.config.origin_addr())
            .await
            .map_err(|e| AgentError::Origin(e.to_string()))?;
        let (sender, connection) = h2::client::handshake(tcp)
            .await
            .map_err(|e| AgentError::Origin(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!(%err, "Origin HTTP/2 connection ended");
            }
        });
        Ok(sender)
    }
}

fn tls_connector(insecure: bool) -> TlsConnector {
    let mut config = if insecure {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerification::new()))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    config.alpn_protocols = vec![b"h2".to_vec()];
    TlsConnector::from(Arc::new(config))
}

pub async fn forward(
    handle: &ChannelHandle,
    origin: &H2Origin,
    request: IncomingRequest,
) -> Result<(), AgentError> {
    let IncomingRequest {
        id,
        descriptor,
        frames,
    } = request;
    let family = WireFamily::from(descriptor.flavor);
    let grpc = headers::is_grpc(&descriptor.headers);

    let mut sender = origin.sender().await?;

    // Pseudo-headers come from the descriptor: method, path, the Host
    // header as authority, https as scheme.
    let authority = headers::host(&descriptor.headers)
        .map(str::to_string)
        .unwrap_or_else(|| origin.config.origin_addr());
    let uri = http::Uri::builder()
        .scheme("https")
        .authority(authority)
        .path_and_query(descriptor.path.as_str())
        .build()
        .map_err(|e| AgentError::Origin(format!("invalid request target: {e}")))?;

    let mut builder = Request::builder()
        .method(descriptor.method.as_str())
        .uri(uri)
        .version(Version::HTTP_2);
    if let Some(map) = builder.headers_mut() {
        for (name, value) in &descriptor.headers {
            if name.starts_with(':') || headers::is_connection_scoped(name) {
                continue;
            }
            // `te` survives only as `trailers`.
            if name.eq_ignore_ascii_case("te") && !value.contains("trailers") {
                continue;
            }
            let parsed = http::HeaderName::from_bytes(name.as_bytes())
                .ok()
                .zip(http::HeaderValue::from_bytes(value.as_bytes()).ok());
            if let Some((name, value)) = parsed {
                map.append(name, value);
            }
        }
        if grpc && !map.contains_key("te") {
            map.insert("te", http::HeaderValue::from_static("trailers"));
        }
    }
    let origin_request = builder
        .body(())
        .map_err(|e| AgentError::Origin(e.to_string()))?;

    let (response_fut, send_body) = sender
        .send_request(origin_request, false)
        .map_err(|e| AgentError::Origin(e.to_string()))?;

    let (abort_tx, mut abort_rx) = watch::channel(false);
    tokio::spawn(pump_h2_body(frames, send_body, abort_tx));

    // The request body keeps streaming while we wait for and relay the
    // response; that is what makes the http2 flavor full-duplex.
    let response = tokio::select! {
        response = response_fut => response.map_err(|e| AgentError::Origin(e.to_string()))?,
        _ = abort_rx.changed() => {
            debug!(%id, "Request aborted before origin response");
            return Ok(());
        }
    };

    let (parts, mut recv_body) = response.into_parts();
    let descriptor = ResponseDescriptor {
        status_code: parts.status.as_u16(),
        status_message: String::new(),
        headers: headers::from_header_map(&parts.headers),
    };
    handle
        .send(TunnelEvent::Response { id, descriptor }, family)
        .await?;

    let mut flow = recv_body.flow_control().clone();
    loop {
        let chunk = tokio::select! {
            chunk = recv_body.data() => chunk,
            _ = abort_rx.changed() => {
                debug!(%id, "Request aborted, dropping origin response");
                return Ok(());
            }
        };
        match chunk {
            Some(Ok(data)) => {
                let _ = flow.release_capacity(data.len());
                if !data.is_empty() {
                    send_data_chunks(handle, id, family, data).await?;
                }
            }
            Some(Err(err)) => {
                warn!(%id, %err, "Origin HTTP/2 body error");
                return Err(AgentError::Origin(err.to_string()));
            }
            None => break,
        }
    }

    match recv_body.trailers().await {
        Ok(Some(trailers)) => {
            handle
                .send(
                    TunnelEvent::ResponseTrailers {
                        id,
                        trailers: headers::from_header_map(&trailers),
                    },
                    family,
                )
                .await?;
        }
        Ok(None) => {}
        Err(err) => return Err(AgentError::Origin(err.to_string())),
    }

    handle
        .send(TunnelEvent::ResponseEnd { id }, family)
        .await?;
    Ok(())
}

/// Feed request frames into the origin stream under h2 flow control; a
/// peer abort resets the stream and flips the abort flag.
async fn pump_h2_body(
    mut frames: mpsc::Receiver<StreamFrame>,
    mut send_body: h2::SendStream<Bytes>,
    abort_tx: watch::Sender<bool>,
) {
    let mut ended = false;
    loop {
        match frames.recv().await {
            Some(StreamFrame::Data(mut data)) if !ended => {
                while !data.is_empty() {
                    send_body.reserve_capacity(data.len().min(DATA_CHUNK));
                    let granted = poll_fn(|cx| send_body.poll_capacity(cx)).await;
                    match granted {
                        Some(Ok(n)) if n > 0 => {
                            let piece = data.split_to(n.min(data.len()));
                            if send_body.send_data(piece, false).is_err() {
                                let _ = abort_tx.send(true);
                                return;
                            }
                        }
                        _ => {
                            let _ = abort_tx.send(true);
                            return;
                        }
                    }
                }
            }
            Some(StreamFrame::End) if !ended => {
                ended = true;
                if send_body.send_data(Bytes::new(), true).is_err() {
                    let _ = abort_tx.send(true);
                    return;
                }
            }
            Some(StreamFrame::Error(_)) | Some(StreamFrame::Disconnected) | None => {
                send_body.send_reset(h2::Reason::CANCEL);
                let _ = abort_tx.send(true);
                return;
            }
            Some(_) => {}
        }
    }
}

mod danger {
    //! Certificate verifier for `INSECURE` mode: accepts any origin
    //! certificate while still checking signature well-formedness.

    use tokio_rustls::rustls;
    use tokio_rustls::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use tokio_rustls::rustls::{DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub struct NoVerification(rustls::crypto::CryptoProvider);

    impl NoVerification {
        pub fn new() -> Self {
            Self(rustls::crypto::aws_lc_rs::default_provider())
        }
    }

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}
