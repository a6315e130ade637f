//! HTTP/1 path to the local origin
//!
//! Each tunneled request opens its own origin connection. Upgrade
//! requests (WebSocket) are carried through: the origin's 101 goes back
//! as the response descriptor and the upgraded connection is spliced to
//! the request's tunnel pipes.

use bytes::Bytes;
use futures_util::SinkExt;
use http::{Method, Request, Response};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use passage_control::{ChannelHandle, IncomingRequest, StreamFrame};
use passage_proto::{headers, RequestId, ResponseDescriptor, TunnelEvent, WireFamily};

use crate::config::AgentConfig;
use crate::{AgentError, DATA_CHUNK};

type BodyError = Box<dyn std::error::Error + Send + Sync>;
type OriginBody = BoxBody<Bytes, BodyError>;

fn empty_body() -> OriginBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub async fn forward(
    handle: &ChannelHandle,
    config: &AgentConfig,
    request: IncomingRequest,
) -> Result<(), AgentError> {
    let IncomingRequest {
        id,
        descriptor,
        frames,
    } = request;
    let family = WireFamily::from(descriptor.flavor);

    let stream = TcpStream::connect(config.origin_addr())
        .await
        .map_err(|err| {
            debug!(%err, addr = %config.origin_addr(), "Origin connect failed");
            AgentError::OriginUnavailable
        })?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|_| AgentError::OriginUnavailable)?;
    tokio::spawn(async move {
        if let Err(err) = conn.with_upgrades().await {
            debug!(%err, "Origin connection ended");
        }
    });

    let is_upgrade = headers::get(&descriptor.headers, "upgrade").is_some();

    let mut builder = Request::builder()
        .method(descriptor.method.as_str())
        .uri(descriptor.path.as_str());
    if let Some(map) = builder.headers_mut() {
        for (name, value) in headers::to_header_map(&descriptor.headers).iter() {
            map.append(name.clone(), value.clone());
        }
    }

    if is_upgrade {
        let req = builder
            .body(empty_body())
            .map_err(|e| AgentError::Origin(e.to_string()))?;
        let response = sender
            .send_request(req)
            .await
            .map_err(|e| AgentError::Origin(e.to_string()))?;

        if response.status() == http::StatusCode::SWITCHING_PROTOCOLS {
            send_response_head(handle, id, family, &response).await?;
            let upgraded = hyper::upgrade::on(response)
                .await
                .map_err(|e| AgentError::Origin(e.to_string()))?;
            splice_upgraded(TokioIo::new(upgraded), frames, handle, id, family).await;
            return Ok(());
        }
        return relay_origin_response(handle, id, family, response, None).await;
    }

    let (abort_tx, abort_rx) = watch::channel(false);
    let body = if bodyless(&descriptor.method, &descriptor.headers) {
        // No request body expected; keep watching the pipe for aborts.
        tokio::spawn(watch_for_abort(frames, abort_tx));
        empty_body()
    } else {
        let (body_tx, body_rx) = futures_channel::mpsc::channel(16);
        tokio::spawn(pump_origin_body(frames, body_tx, abort_tx));
        StreamBody::new(body_rx).boxed()
    };

    let req = builder
        .body(body)
        .map_err(|e| AgentError::Origin(e.to_string()))?;
    let response = sender
        .send_request(req)
        .await
        .map_err(|e| AgentError::Origin(e.to_string()))?;

    relay_origin_response(handle, id, family, response, Some(abort_rx)).await
}

/// Methods that carry no body unless the headers say otherwise.
fn bodyless(method: &str, header_list: &passage_proto::HeaderList) -> bool {
    let no_body_method = matches!(
        method.parse::<Method>().ok(),
        Some(Method::GET | Method::HEAD | Method::DELETE | Method::OPTIONS | Method::TRACE)
    );
    no_body_method
        && headers::get(header_list, "content-length").is_none()
        && headers::get(header_list, "transfer-encoding").is_none()
}

/// Feed inbound request frames into the origin request body.
async fn pump_origin_body(
    mut frames: mpsc::Receiver<StreamFrame>,
    mut body_tx: futures_channel::mpsc::Sender<Result<Frame<Bytes>, BodyError>>,
    abort_tx: watch::Sender<bool>,
) {
    loop {
        match frames.recv().await {
            Some(StreamFrame::Data(data)) => {
                if body_tx.send(Ok(Frame::data(data))).await.is_err() {
                    return;
                }
            }
            Some(StreamFrame::End) => {
                drop(body_tx);
                // Keep the pipe open for a post-body abort.
                watch_for_abort(frames, abort_tx).await;
                return;
            }
            Some(StreamFrame::Error(message)) => {
                let _ = body_tx.send(Err(message.into())).await;
                let _ = abort_tx.send(true);
                return;
            }
            Some(StreamFrame::Disconnected) | None => {
                let _ = body_tx
                    .send(Err("tunnel connection closed".into()))
                    .await;
                let _ = abort_tx.send(true);
                return;
            }
            Some(_) => {}
        }
    }
}

async fn watch_for_abort(mut frames: mpsc::Receiver<StreamFrame>, abort_tx: watch::Sender<bool>) {
    loop {
        match frames.recv().await {
            Some(StreamFrame::Error(_)) | Some(StreamFrame::Disconnected) => {
                let _ = abort_tx.send(true);
                return;
            }
            None => return,
            Some(_) => {}
        }
    }
}

async fn send_response_head(
    handle: &ChannelHandle,
    id: RequestId,
    family: WireFamily,
    response: &Response<Incoming>,
) -> Result<(), AgentError> {
    let descriptor = ResponseDescriptor {
        status_code: response.status().as_u16(),
        status_message: response
            .status()
            .canonical_reason()
            .unwrap_or_default()
            .to_string(),
        headers: headers::from_header_map(response.headers()),
    };
    handle
        .send(TunnelEvent::Response { id, descriptor }, family)
        .await?;
    Ok(())
}

/// Stream the origin response back through the tunnel. An abort signal
/// from the request pipe cancels the relay mid-body.
async fn relay_origin_response(
    handle: &ChannelHandle,
    id: RequestId,
    family: WireFamily,
    response: Response<Incoming>,
    abort_rx: Option<watch::Receiver<bool>>,
) -> Result<(), AgentError> {
    send_response_head(handle, id, family, &response).await?;
    let mut body = response.into_body();
    let mut abort_rx = abort_rx;

    loop {
        let next = match abort_rx.as_mut() {
            Some(abort) => {
                tokio::select! {
                    frame = body.frame() => frame,
                    _ = abort.changed() => {
                        debug!(%id, "Request aborted, dropping origin response");
                        return Ok(());
                    }
                }
            }
            None => body.frame().await,
        };

        match next {
            Some(Ok(frame)) => {
                if let Ok(data) = frame.into_data() {
                    if !data.is_empty() {
                        send_data_chunks(handle, id, family, data).await?;
                    }
                }
                // HTTP/1 flavored responses carry no trailers.
            }
            Some(Err(err)) => {
                warn!(%id, %err, "Origin body error");
                return Err(AgentError::Origin(err.to_string()));
            }
            None => break,
        }
    }

    handle
        .send(TunnelEvent::ResponseEnd { id }, family)
        .await?;
    Ok(())
}

pub(crate) async fn send_data_chunks(
    handle: &ChannelHandle,
    id: RequestId,
    family: WireFamily,
    mut data: Bytes,
) -> Result<(), AgentError> {
    while data.len() > DATA_CHUNK {
        let piece = data.split_to(DATA_CHUNK);
        handle
            .send(TunnelEvent::ResponseData { id, data: piece }, family)
            .await?;
    }
    if !data.is_empty() {
        handle
            .send(TunnelEvent::ResponseData { id, data }, family)
            .await?;
    }
    Ok(())
}

/// Raw byte splice between the upgraded origin connection and the
/// request's tunnel pipes; ends as soon as either side closes.
async fn splice_upgraded<I>(
    io: I,
    mut frames: mpsc::Receiver<StreamFrame>,
    handle: &ChannelHandle,
    id: RequestId,
    family: WireFamily,
) where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(io);

    let tunnel_to_origin = async {
        loop {
            match frames.recv().await {
                Some(StreamFrame::Data(data)) => {
                    if writer.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Some(StreamFrame::End)
                | Some(StreamFrame::Error(_))
                | Some(StreamFrame::Disconnected)
                | None => {
                    let _ = writer.shutdown().await;
                    break;
                }
                Some(_) => {}
            }
        }
    };

    let origin_to_tunnel = async {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    let _ = handle.send(TunnelEvent::ResponseEnd { id }, family).await;
                    break;
                }
                Ok(n) => {
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    if handle
                        .send(TunnelEvent::ResponseData { id, data }, family)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(err) => {
                    let _ = handle
                        .send(
                            TunnelEvent::ResponseError {
                                id,
                                message: format!("origin socket error: {err}"),
                            },
                            family,
                        )
                        .await;
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = tunnel_to_origin => {}
        _ = origin_to_tunnel => {}
    }
}
