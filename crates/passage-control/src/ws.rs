//! WebSocket halves of the control channel
//!
//! Both ends carry control frames as WebSocket binary messages. The edge
//! wraps the upgraded server-side stream, the agent wraps its outbound
//! client stream; either way the split halves plug into the channel core
//! through the transport seam.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

use crate::transport::{FrameSink, FrameSource};
use crate::ChannelError;

/// Split an established WebSocket into channel transport halves.
pub fn split_websocket<S>(ws: WebSocketStream<S>) -> (WsFrameSink<S>, WsFrameSource<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, source) = ws.split();
    (WsFrameSink(sink), WsFrameSource(source))
}

pub struct WsFrameSink<S>(SplitSink<WebSocketStream<S>, Message>);

pub struct WsFrameSource<S>(SplitStream<WebSocketStream<S>>);

#[async_trait]
impl<S> FrameSink for WsFrameSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, frame: Bytes) -> Result<(), ChannelError> {
        trace!(len = frame.len(), "Sending control frame");
        // `send` flushes the message; returning from here is the drain
        // signal the backpressure rule requires.
        self.0
            .send(Message::Binary(frame.to_vec()))
            .await
            .map_err(ws_error)
    }

    async fn close(&mut self) {
        let _ = self.0.close().await;
    }
}

#[async_trait]
impl<S> FrameSource for WsFrameSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<Bytes>, ChannelError> {
        loop {
            match self.0.next().await {
                Some(Ok(Message::Binary(data))) => {
                    trace!(len = data.len(), "Received control frame");
                    return Ok(Some(Bytes::from(data)));
                }
                // Transport-level ping/pong is handled by tungstenite;
                // protocol liveness uses its own ping/pong events.
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => {
                    debug!("WebSocket close received");
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    debug!(?other, "Ignoring non-binary WebSocket message");
                    continue;
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(None),
                Some(Err(err)) => return Err(ws_error(err)),
                None => return Ok(None),
            }
        }
    }
}

fn ws_error(err: WsError) -> ChannelError {
    ChannelError::Transport(err.to_string())
}
