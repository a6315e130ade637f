//! End-to-end tests: public HTTP client → edge → control channel → agent

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser as _;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use passage_auth::{sign_token, TunnelClaims};
use passage_control::{split_websocket, Channel, ChannelConfig, StreamFrame};
use passage_edge::config::EdgeConfig;
use passage_edge::server::EdgeServer;
use passage_edge::EdgeState;
use passage_proto::{ResponseDescriptor, TunnelEvent, WireFamily};

const SECRET: &str = "test_secret_key";
const VERIFY: &str = "test_verify_claim";

async fn start_edge() -> SocketAddr {
    let config = EdgeConfig::try_parse_from([
        "passage-edge",
        "--secret-key",
        SECRET,
        "--verify-token",
        VERIFY,
    ])
    .unwrap();
    let state = EdgeState::new(&config);
    let server = EdgeServer::bind("127.0.0.1:0".parse().unwrap(), None, state)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve().await;
    });
    addr
}

fn agent_token() -> String {
    sign_token(SECRET.as_bytes(), &TunnelClaims::new(VERIFY)).unwrap()
}

async fn connect_agent(
    addr: SocketAddr,
    host: &str,
    prefix: &str,
    token: &str,
) -> Result<Channel, tokio_tungstenite::tungstenite::Error> {
    let mut request = format!("ws://{addr}/$web_tunnel")
        .into_client_request()
        .unwrap();
    let headers = request.headers_mut();
    headers.insert("host", host.parse().unwrap());
    headers.insert(
        "authorization",
        format!("Bearer {token}").parse().unwrap(),
    );
    headers.insert("path-prefix", prefix.parse().unwrap());
    headers.insert("supports-http2", "true".parse().unwrap());

    let (ws, _) = tokio_tungstenite::connect_async(request).await?;
    let (sink, source) = split_websocket(ws);
    Ok(passage_control::spawn(sink, source, ChannelConfig::default()))
}

enum AgentBehavior {
    Static(&'static str),
    Echo,
}

/// Minimal agent dispatcher for tests: serves fixed content or echoes the
/// request body.
fn run_agent(channel: Channel, behavior: AgentBehavior) {
    let handle = channel.handle.clone();
    let mut incoming = channel.incoming;
    tokio::spawn(async move {
        let behavior = Arc::new(behavior);
        while let Some(mut request) = incoming.recv().await {
            let handle = handle.clone();
            let behavior = behavior.clone();
            tokio::spawn(async move {
                let family = WireFamily::from(request.descriptor.flavor);
                let id = request.id;

                let mut body = Vec::new();
                while let Some(frame) = request.frames.recv().await {
                    match frame {
                        StreamFrame::Data(data) => body.extend_from_slice(&data),
                        StreamFrame::End => break,
                        StreamFrame::Error(_) | StreamFrame::Disconnected => return,
                        _ => {}
                    }
                }

                let payload = match behavior.as_ref() {
                    AgentBehavior::Static(text) => Bytes::from_static(text.as_bytes()),
                    AgentBehavior::Echo => Bytes::from(body),
                };

                handle
                    .send(
                        TunnelEvent::Response {
                            id,
                            descriptor: ResponseDescriptor {
                                status_code: 200,
                                status_message: "OK".to_string(),
                                headers: vec![(
                                    "content-type".to_string(),
                                    "text/plain".to_string(),
                                )],
                            },
                        },
                        family,
                    )
                    .await
                    .unwrap();
                handle
                    .send(TunnelEvent::ResponseData { id, data: payload }, family)
                    .await
                    .unwrap();
                handle
                    .send(TunnelEvent::ResponseEnd { id }, family)
                    .await
                    .unwrap();
                handle.release(&id);
            });
        }
    });
}

fn http_client() -> Client<hyper_util::client::legacy::connect::HttpConnector, Full<Bytes>> {
    Client::builder(TokioExecutor::new()).build_http()
}

fn get(addr: SocketAddr, host: &str, path: &str) -> http::Request<Full<Bytes>> {
    http::Request::builder()
        .uri(format!("http://{addr}{path}"))
        .header("host", host)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

#[tokio::test]
async fn test_simple_get_through_tunnel() {
    let addr = start_edge().await;
    let channel = connect_agent(addr, "example.test", "", &agent_token())
        .await
        .unwrap();
    run_agent(channel, AgentBehavior::Static("hi\n"));

    let client = http_client();
    let response = client.request(get(addr, "example.test", "/hello")).await.unwrap();
    assert_eq!(response.status(), 200);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"hi\n");
}

#[tokio::test]
async fn test_routing_miss_is_404() {
    let addr = start_edge().await;

    let client = http_client();
    let response = client
        .request(get(addr, "unknown.test", "/hello"))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"Not Found");
}

#[tokio::test]
async fn test_streaming_post_echoes_bytes() {
    let addr = start_edge().await;
    let channel = connect_agent(addr, "echo.test", "", &agent_token())
        .await
        .unwrap();
    run_agent(channel, AgentBehavior::Echo);

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let request = http::Request::builder()
        .method("POST")
        .uri(format!("http://{addr}/upload"))
        .header("host", "echo.test")
        .body(Full::new(Bytes::from(payload.clone())))
        .unwrap();

    let client = http_client();
    let response = client.request(request).await.unwrap();
    assert_eq!(response.status(), 200);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.len(), payload.len());
    assert_eq!(&body[..], &payload[..]);
}

#[tokio::test]
async fn test_longest_prefix_routing() {
    let addr = start_edge().await;
    let token = agent_token();

    let root = connect_agent(addr, "h.test", "", &token).await.unwrap();
    run_agent(root, AgentBehavior::Static("root"));

    let api = connect_agent(addr, "h.test", "/api_v1", &token).await.unwrap();
    run_agent(api, AgentBehavior::Static("api"));

    let client = http_client();

    let response = client.request(get(addr, "h.test", "/api_v1/x")).await.unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"api");

    let response = client.request(get(addr, "h.test", "/other")).await.unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"root");
}

#[tokio::test]
async fn test_duplicate_registration_rejected() {
    let addr = start_edge().await;
    let token = agent_token();

    let first = connect_agent(addr, "dup.test", "/p", &token).await.unwrap();
    run_agent(first, AgentBehavior::Static("original"));

    let err = connect_agent(addr, "dup.test", "/p", &token)
        .await
        .err()
        .expect("duplicate handshake must be refused");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 409);
            let body = response.into_body().unwrap_or_default();
            assert_eq!(
                String::from_utf8_lossy(&body),
                "dup.test has a existing connection"
            );
        }
        other => panic!("expected HTTP rejection, got {other:?}"),
    }

    // The original registration keeps serving.
    let client = http_client();
    let response = client.request(get(addr, "dup.test", "/p/x")).await.unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"original");
}

#[tokio::test]
async fn test_bad_token_rejected_with_authentication_error() {
    let addr = start_edge().await;

    let bogus = sign_token(b"wrong_secret", &TunnelClaims::new(VERIFY)).unwrap();
    let err = connect_agent(addr, "auth.test", "", &bogus)
        .await
        .err()
        .expect("bad token must be refused");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 403);
            let body = response.into_body().unwrap_or_default();
            assert_eq!(String::from_utf8_lossy(&body), "Authentication error");
        }
        other => panic!("expected HTTP rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_websocket_upgrade_splices_raw_bytes() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let addr = start_edge().await;
    let channel = connect_agent(addr, "ws.test", "", &agent_token())
        .await
        .unwrap();

    // Agent that answers 101 and echoes spliced bytes back.
    let handle = channel.handle.clone();
    let mut incoming = channel.incoming;
    tokio::spawn(async move {
        while let Some(mut request) = incoming.recv().await {
            let handle = handle.clone();
            tokio::spawn(async move {
                let id = request.id;
                let family = WireFamily::from(request.descriptor.flavor);
                handle
                    .send(
                        TunnelEvent::Response {
                            id,
                            descriptor: ResponseDescriptor {
                                status_code: 101,
                                status_message: "Switching Protocols".to_string(),
                                headers: vec![
                                    ("connection".to_string(), "Upgrade".to_string()),
                                    ("upgrade".to_string(), "echo".to_string()),
                                ],
                            },
                        },
                        family,
                    )
                    .await
                    .unwrap();
                while let Some(frame) = request.frames.recv().await {
                    match frame {
                        StreamFrame::Data(data) => {
                            handle
                                .send(TunnelEvent::ResponseData { id, data }, family)
                                .await
                                .unwrap();
                        }
                        StreamFrame::End
                        | StreamFrame::Error(_)
                        | StreamFrame::Disconnected => break,
                        _ => {}
                    }
                }
                let _ = handle.send(TunnelEvent::ResponseEnd { id }, family).await;
            });
        }
    });

    let mut socket = tokio::net::TcpStream::connect(addr).await.unwrap();
    socket
        .write_all(
            b"GET /live HTTP/1.1\r\n\
              host: ws.test\r\n\
              connection: Upgrade\r\n\
              upgrade: echo\r\n\r\n",
        )
        .await
        .unwrap();

    // Status line and headers come back on the raw socket.
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        socket.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("HTTP/1.1 101"), "unexpected head: {head}");
    assert!(head.to_ascii_lowercase().contains("upgrade: echo"));

    // After 101 the socket is spliced in both directions.
    socket.write_all(b"marco").await.unwrap();
    let mut reply = [0u8; 5];
    socket.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"marco");
}

#[tokio::test]
async fn test_agent_disconnect_before_response_is_500() {
    let addr = start_edge().await;
    let channel = connect_agent(addr, "drop.test", "", &agent_token())
        .await
        .unwrap();

    // An agent that accepts the request, then drops its channel.
    let handle = channel.handle.clone();
    let mut incoming = channel.incoming;
    tokio::spawn(async move {
        let _request = incoming.recv().await;
        handle.close_now();
    });

    let client = http_client();
    let response = client.request(get(addr, "drop.test", "/x")).await.unwrap();
    assert_eq!(response.status(), 500);
}
