//! Edge dispatcher: public request in, tunnel frames out
//!
//! One function per public request. The request is resolved to an agent,
//! streamed into the tunnel under a fresh request id, and the agent's
//! response frames are streamed back out. WebSocket upgrades ride the same
//! path and splice the upgraded client socket to the request pipes.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::SinkExt;
use http::{header, Request, Response, StatusCode, Version};
use hyper::body::{Frame, Incoming};
use hyper_util::rt::TokioIo;
use http_body_util::{BodyExt, StreamBody};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use passage_control::{ChannelHandle, StreamFrame};
use passage_proto::headers;
use passage_proto::{
    Flavor, HeaderList, RequestDescriptor, RequestId, ResponseDescriptor, TunnelEvent, WireFamily,
};

use crate::{full, EdgeState, OutBody};

/// Body chunk ceiling for tunnel data frames.
const DATA_CHUNK: usize = 64 * 1024;

/// Dispatch one public request through the tunnel.
pub async fn proxy_request(
    state: Arc<EdgeState>,
    req: Request<Incoming>,
    peer: SocketAddr,
    tls: bool,
) -> Response<OutBody> {
    let Some(host) = request_host(&req) else {
        return plain(StatusCode::NOT_FOUND, "Not Found");
    };

    let Some(registration) = state.registry.resolve(&host, req.uri().path()) else {
        debug!(%host, path = req.uri().path(), "No agent for request");
        return plain(StatusCode::NOT_FOUND, "Not Found");
    };

    let id: RequestId = Uuid::new_v4();
    let handle = registration.target;

    let mut header_list = headers::from_header_map(req.headers());
    if headers::host(&header_list).is_none() {
        header_list.push(("host".to_string(), host.clone()));
    }
    apply_forwarded_headers(&mut header_list, peer, tls, &host);

    let flavor = choose_flavor(req.version(), &header_list, registration.caps_http2);
    let family = WireFamily::from(flavor);

    let descriptor = RequestDescriptor {
        method: req.method().to_string(),
        path: req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        headers: header_list,
        flavor,
    };

    let mut frames = match handle.open_stream(id) {
        Ok(frames) => frames,
        Err(err) => {
            debug!(%id, %err, "Agent channel not accepting requests");
            return plain(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable");
        }
    };

    let is_upgrade =
        req.version() <= Version::HTTP_11 && req.headers().contains_key(header::UPGRADE);
    if is_upgrade {
        return tunnel_upgrade(req, handle, id, family, descriptor, frames).await;
    }

    if handle
        .send(TunnelEvent::Request { id, descriptor }, family)
        .await
        .is_err()
    {
        handle.release(&id);
        return plain(StatusCode::BAD_GATEWAY, "Request error");
    }

    {
        let handle = handle.clone();
        let body = req.into_body();
        tokio::spawn(pump_request_body(body, handle, id, family));
    }

    // RESPONSE precedes all other response-side frames for this id.
    loop {
        match frames.recv().await {
            Some(StreamFrame::Response(descriptor)) => {
                return relay_response(descriptor, frames, handle, id, family, false);
            }
            Some(StreamFrame::Data(_) | StreamFrame::Trailers(_)) => {
                warn!(%id, "Body frame before response descriptor, ignoring");
            }
            Some(StreamFrame::End) | Some(StreamFrame::Error(_)) => {
                handle.release(&id);
                return plain(StatusCode::BAD_GATEWAY, "Request error");
            }
            Some(StreamFrame::Disconnected) | None => {
                handle.release(&id);
                return plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
            }
        }
    }
}

/// Pump the public request body into the tunnel, honoring writer
/// backpressure frame by frame.
async fn pump_request_body(
    mut body: Incoming,
    handle: ChannelHandle,
    id: RequestId,
    family: WireFamily,
) {
    loop {
        match body.frame().await {
            Some(Ok(frame)) => {
                if let Ok(data) = frame.into_data() {
                    if !data.is_empty() && send_chunks(&handle, id, family, data).await.is_err() {
                        return;
                    }
                }
                // Incoming request trailers have no tunnel representation.
            }
            Some(Err(err)) => {
                let _ = handle
                    .send(
                        TunnelEvent::RequestError {
                            id,
                            message: format!("client body error: {err}"),
                        },
                        family,
                    )
                    .await;
                return;
            }
            None => {
                let _ = handle.send(TunnelEvent::RequestEnd { id }, family).await;
                return;
            }
        }
    }
}

async fn send_chunks(
    handle: &ChannelHandle,
    id: RequestId,
    family: WireFamily,
    mut data: Bytes,
) -> Result<(), passage_control::ChannelError> {
    while data.len() > DATA_CHUNK {
        let piece = data.split_to(DATA_CHUNK);
        handle
            .send(TunnelEvent::RequestData { id, data: piece }, family)
            .await?;
    }
    if !data.is_empty() {
        handle
            .send(TunnelEvent::RequestData { id, data }, family)
            .await?;
    }
    Ok(())
}

/// Build the public response and keep relaying body frames behind it.
fn relay_response(
    descriptor: ResponseDescriptor,
    frames: mpsc::Receiver<StreamFrame>,
    handle: ChannelHandle,
    id: RequestId,
    family: WireFamily,
    force_close: bool,
) -> Response<OutBody> {
    let status =
        StatusCode::from_u16(descriptor.status_code).unwrap_or(StatusCode::BAD_GATEWAY);
    let (_, header_list) = headers::split_status(descriptor.headers);

    let mut builder = Response::builder().status(status);
    if let Some(map) = builder.headers_mut() {
        for (name, value) in headers::to_header_map(&header_list).iter() {
            // Connection-scoped headers are per hop; the public server
            // frames the body itself.
            if headers::is_connection_scoped(name.as_str()) {
                continue;
            }
            map.append(name.clone(), value.clone());
        }
        if force_close {
            map.insert(header::CONNECTION, header::HeaderValue::from_static("close"));
        }
    }

    let (body_tx, body_rx) = futures_channel::mpsc::channel(16);
    tokio::spawn(relay_response_body(frames, handle, id, family, body_tx));

    builder
        .body(StreamBody::new(body_rx).boxed())
        .unwrap_or_else(|err| {
            warn!(%err, "Malformed response head from agent");
            plain(StatusCode::BAD_GATEWAY, "Request error")
        })
}

type BodyItem = Result<Frame<Bytes>, crate::BodyError>;

async fn relay_response_body(
    mut frames: mpsc::Receiver<StreamFrame>,
    handle: ChannelHandle,
    id: RequestId,
    family: WireFamily,
    mut body_tx: futures_channel::mpsc::Sender<BodyItem>,
) {
    loop {
        match frames.recv().await {
            Some(StreamFrame::Data(data)) => {
                if body_tx.send(Ok(Frame::data(data))).await.is_err() {
                    // Public client went away before RES_END.
                    let _ = handle
                        .send(
                            TunnelEvent::RequestError {
                                id,
                                message: "socket hang up".to_string(),
                            },
                            family,
                        )
                        .await;
                    break;
                }
            }
            Some(StreamFrame::Trailers(trailers)) => {
                let map = headers::to_header_map(&trailers);
                if body_tx.send(Ok(Frame::trailers(map))).await.is_err() {
                    break;
                }
            }
            Some(StreamFrame::End) => break,
            Some(StreamFrame::Error(message)) => {
                // Headers are already out; abort the stream.
                let _ = body_tx.send(Err(message.into())).await;
                break;
            }
            Some(StreamFrame::Disconnected) | None => {
                let _ = body_tx
                    .send(Err("tunnel connection closed".into()))
                    .await;
                break;
            }
            Some(StreamFrame::Response(_)) => {
                warn!(%id, "Duplicate response descriptor, ignoring");
            }
        }
    }
    handle.release(&id);
}

/// Tunnel an HTTP/1.1 `Upgrade` request (WebSocket or similar). The
/// agent's status line and headers go back verbatim; 101 switches the
/// client socket over to raw splicing.
async fn tunnel_upgrade(
    req: Request<Incoming>,
    handle: ChannelHandle,
    id: RequestId,
    family: WireFamily,
    descriptor: RequestDescriptor,
    mut frames: mpsc::Receiver<StreamFrame>,
) -> Response<OutBody> {
    let upgrade = hyper::upgrade::on(req);

    if handle
        .send(TunnelEvent::Request { id, descriptor }, family)
        .await
        .is_err()
    {
        handle.release(&id);
        return plain(StatusCode::BAD_GATEWAY, "Request error");
    }

    loop {
        match frames.recv().await {
            Some(StreamFrame::Response(descriptor)) => {
                if descriptor.status_code != 101 {
                    // Not switching protocols; relay and close the socket.
                    return relay_response(descriptor, frames, handle, id, family, true);
                }

                let (_, header_list) = headers::split_status(descriptor.headers);
                let mut builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
                if let Some(map) = builder.headers_mut() {
                    for (name, value) in headers::to_header_map(&header_list).iter() {
                        map.append(name.clone(), value.clone());
                    }
                }
                let response = match builder.body(crate::empty()) {
                    Ok(response) => response,
                    Err(err) => {
                        warn!(%err, "Malformed 101 head from agent");
                        handle.release(&id);
                        return plain(StatusCode::BAD_GATEWAY, "Request error");
                    }
                };

                tokio::spawn(async move {
                    match upgrade.await {
                        Ok(upgraded) => {
                            splice(TokioIo::new(upgraded), frames, &handle, id, family).await;
                        }
                        Err(err) => {
                            warn!(%id, %err, "Client upgrade failed");
                            let _ = handle
                                .send(
                                    TunnelEvent::RequestError {
                                        id,
                                        message: "client upgrade failed".to_string(),
                                    },
                                    family,
                                )
                                .await;
                        }
                    }
                    handle.release(&id);
                });

                return response;
            }
            Some(StreamFrame::Error(_)) | Some(StreamFrame::End) => {
                handle.release(&id);
                return plain(StatusCode::BAD_GATEWAY, "Request error");
            }
            Some(StreamFrame::Disconnected) | None => {
                handle.release(&id);
                return plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
            }
            Some(StreamFrame::Data(_) | StreamFrame::Trailers(_)) => {
                warn!(%id, "Body frame before 101 response, ignoring");
            }
        }
    }
}

/// Bidirectional splice between the upgraded client socket and the
/// request's tunnel pipes. Ends as soon as either direction closes.
async fn splice<I>(
    io: I,
    mut frames: mpsc::Receiver<StreamFrame>,
    handle: &ChannelHandle,
    id: RequestId,
    family: WireFamily,
) where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(io);

    let client_to_agent = async {
        let mut buf = vec![0u8; DATA_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    let _ = handle.send(TunnelEvent::RequestEnd { id }, family).await;
                    break;
                }
                Ok(n) => {
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    if handle
                        .send(TunnelEvent::RequestData { id, data }, family)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(err) => {
                    let _ = handle
                        .send(
                            TunnelEvent::RequestError {
                                id,
                                message: format!("socket error: {err}"),
                            },
                            family,
                        )
                        .await;
                    break;
                }
            }
        }
    };

    let agent_to_client = async {
        loop {
            match frames.recv().await {
                Some(StreamFrame::Data(data)) => {
                    if writer.write_all(&data).await.is_err() {
                        let _ = handle
                            .send(
                                TunnelEvent::RequestError {
                                    id,
                                    message: "socket hang up".to_string(),
                                },
                                family,
                            )
                            .await;
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
                Some(StreamFrame::Response(_) | StreamFrame::Trailers(_)) => {}
            }
        }
    };

    tokio::select! {
        _ = client_to_agent => {}
        _ = agent_to_client => {}
    }
}

/// Pick the tunnel flavor for a public request.
pub fn choose_flavor(version: Version, header_list: &HeaderList, caps_http2: bool) -> Flavor {
    let wants_http2 = version == Version::HTTP_2 || headers::is_grpc(header_list);
    if wants_http2 && caps_http2 {
        Flavor::Http2
    } else {
        Flavor::Http1
    }
}

/// Routing host: the `Host` header, or the URI authority for HTTP/2.
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
}

/// Append the forwarding headers, comma-merging with any prior values.
pub fn apply_forwarded_headers(
    header_list: &mut HeaderList,
    peer: SocketAddr,
    tls: bool,
    host: &str,
) {
    append_merge(header_list, "x-forwarded-for", peer.ip().to_string());
    append_merge(
        header_list,
        "x-forwarded-port",
        if tls { "443" } else { "80" }.to_string(),
    );
    append_merge(
        header_list,
        "x-forwarded-proto",
        if tls { "https" } else { "http" }.to_string(),
    );
    if headers::get(header_list, "x-forwarded-host").is_none() {
        header_list.push(("x-forwarded-host".to_string(), host.to_string()));
    }
}

fn append_merge(header_list: &mut HeaderList, name: &str, value: String) {
    match header_list
        .iter_mut()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
    {
        Some(entry) => entry.1 = format!("{}, {}", entry.1, value),
        None => header_list.push((name.to_string(), value)),
    }
}

fn plain(status: StatusCode, body: &'static str) -> Response<OutBody> {
    Response::builder()
        .status(status)
        .body(full(body))
        .expect("static response")
}
