//! Agent admission at the reserved control endpoint
//!
//! The agent arrives as a WebSocket upgrade carrying a bearer token plus
//! the `path-prefix` and `supports-http2` handshake headers; the `Host`
//! header is the routing key. Verification failures and duplicate
//! registrations are rejected before the upgrade, so the socket never
//! outlives a refused handshake.

use std::sync::Arc;

use http::{header, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{info, warn};

use passage_auth::{sign_token, TunnelClaims};
use passage_control::split_websocket;
use passage_routing::{Registration, RouteKey};

use crate::{empty, full, EdgeState, OutBody};

/// Handle a request to the reserved control path.
pub async fn accept_control(state: Arc<EdgeState>, req: Request<Incoming>) -> Response<OutBody> {
    let ws_key = match websocket_key(&req) {
        Some(key) => key.to_string(),
        None => return plain(StatusCode::BAD_REQUEST, "WebSocket upgrade required"),
    };

    // Bearer token, verified against the server secret and the fixed claim.
    let token = bearer_token(&req);
    let authenticated = token
        .and_then(|token| state.verifier.verify(token).ok())
        .is_some();
    if !authenticated {
        warn!("Agent handshake failed authentication");
        return plain(StatusCode::FORBIDDEN, "Authentication error");
    }

    let Some(host) = header_str(&req, header::HOST.as_str()) else {
        return plain(StatusCode::BAD_REQUEST, "Host header required");
    };
    let path_prefix = header_str(&req, "path-prefix").unwrap_or_default();
    let caps_http2 = header_str(&req, "supports-http2") == Some("true");

    let key = RouteKey::new(host, path_prefix);

    // Friendly pre-upgrade duplicate check; the register() after the
    // upgrade is the authoritative one.
    if state.registry.contains(&key) {
        warn!(host = %key.host, prefix = %key.path_prefix, "Duplicate agent registration refused");
        return plain(
            StatusCode::CONFLICT,
            format!("{} has a existing connection", key.host),
        );
    }

    let upgrade = hyper::upgrade::on(req);
    let accept = derive_accept_key(ws_key.as_bytes());

    tokio::spawn(async move {
        let upgraded = match upgrade.await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                warn!(%err, "Control channel upgrade failed");
                return;
            }
        };

        let ws =
            WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
        let (sink, source) = split_websocket(ws);
        let channel = passage_control::spawn(sink, source, state.channel_config.clone());
        let handle = channel.handle.clone();
        // The edge never receives REQUEST frames; dropping the receiver
        // makes the channel answer any with an error.
        drop(channel.incoming);

        let registration = Registration {
            key: key.clone(),
            caps_http2,
            target: handle.clone(),
        };
        if let Err(err) = state.registry.register(registration) {
            // Lost the pre-check race; tear the fresh channel down.
            warn!(%err, "Registration race lost, closing channel");
            handle.close_now();
            return;
        }

        info!(host = %key.host, prefix = %key.path_prefix, caps_http2, "Agent connected");
        handle.closed().await;
        state.registry.remove(&key);
        info!(host = %key.host, prefix = %key.path_prefix, "Agent disconnected");
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept)
        .body(empty())
        .expect("static response")
}

/// `GET /tunnel_jwt_generator?username=U&password=P`
pub fn issue_token(state: &EdgeState, req: &Request<Incoming>) -> Response<OutBody> {
    let Some((expected_user, expected_pass)) = &state.issuer_credentials else {
        return plain(StatusCode::NOT_FOUND, "Not Found");
    };

    let query = req.uri().query().unwrap_or_default();
    let mut username = None;
    let mut password = None;
    for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match name.as_ref() {
            "username" => username = Some(value.into_owned()),
            "password" => password = Some(value.into_owned()),
            _ => {}
        }
    }

    if username.as_deref() == Some(expected_user) && password.as_deref() == Some(expected_pass) {
        match sign_token(
            state.secret_key.as_bytes(),
            &TunnelClaims::new(&state.verify_token),
        ) {
            Ok(token) => plain(StatusCode::OK, token),
            Err(err) => {
                warn!(%err, "Token signing failed");
                plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        }
    } else {
        plain(StatusCode::UNAUTHORIZED, "Forbidden")
    }
}

fn plain(status: StatusCode, body: impl Into<String>) -> Response<OutBody> {
    Response::builder()
        .status(status)
        .body(full(body.into().into_bytes()))
        .expect("static response")
}

fn header_str<'a>(req: &'a Request<Incoming>, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

fn websocket_key<'a>(req: &'a Request<Incoming>) -> Option<&'a str> {
    let upgrading = header_str(req, header::UPGRADE.as_str())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if !upgrading {
        return None;
    }
    header_str(req, header::SEC_WEBSOCKET_KEY.as_str())
}

fn bearer_token<'a>(req: &'a Request<Incoming>) -> Option<&'a str> {
    header_str(req, header::AUTHORIZATION.as_str())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}
