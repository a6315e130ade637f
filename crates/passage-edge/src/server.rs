//! Public listener and per-connection HTTP serving

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::{dispatch, handshake, EdgeError, EdgeState, OutBody, CONTROL_PATH, JWT_GENERATOR_PATH};

pub struct EdgeServer {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    state: Arc<EdgeState>,
}

impl EdgeServer {
    pub async fn bind(
        addr: SocketAddr,
        tls: Option<TlsAcceptor>,
        state: Arc<EdgeState>,
    ) -> Result<Self, EdgeError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| EdgeError::Bind {
            port: addr.port(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            listener,
            tls,
            state,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, EdgeError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop; runs until the process shuts down.
    pub async fn serve(self) -> Result<(), EdgeError> {
        info!(
            addr = %self.local_addr()?,
            tls = self.tls.is_some(),
            "Edge server listening"
        );

        loop {
            let (stream, peer) = self.listener.accept().await?;
            let state = self.state.clone();
            let tls = self.tls.clone();

            tokio::spawn(async move {
                match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            serve_connection(TokioIo::new(tls_stream), peer, true, state).await
                        }
                        Err(err) => warn!(%peer, %err, "TLS handshake failed"),
                    },
                    None => serve_connection(TokioIo::new(stream), peer, false, state).await,
                }
            });
        }
    }
}

async fn serve_connection<I>(io: I, peer: SocketAddr, tls: bool, state: Arc<EdgeState>)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let service = service_fn(move |req: hyper::Request<Incoming>| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(route(state, req, peer, tls).await) }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    if let Err(err) = builder.serve_connection_with_upgrades(io, service).await {
        debug!(%peer, %err, "Connection ended with error");
    }
}

async fn route(
    state: Arc<EdgeState>,
    req: hyper::Request<Incoming>,
    peer: SocketAddr,
    tls: bool,
) -> hyper::Response<OutBody> {
    match req.uri().path() {
        CONTROL_PATH => handshake::accept_control(state, req).await,
        JWT_GENERATOR_PATH => handshake::issue_token(&state, &req),
        _ => dispatch::proxy_request(state, req, peer, tls).await,
    }
}
