//! Transport seam for the control channel
//!
//! The channel core only needs a framed byte pipe: ordered delivery of
//! whole binary messages with send-side backpressure. The edge and agent
//! plug in their WebSocket halves (`ws` module); tests use the in-memory
//! pair below.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::ChannelError;

/// Write half of a framed transport. `send` resolves once the frame has
/// been handed to the transport and flushed; awaiting it is the drain
/// signal the backpressure rule relies on.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Bytes) -> Result<(), ChannelError>;
    async fn close(&mut self);
}

/// Read half of a framed transport. `Ok(None)` is a clean end of stream.
#[async_trait]
pub trait FrameSource: Send {
    async fn recv(&mut self) -> Result<Option<Bytes>, ChannelError>;
}

/// In-process transport: two connected endpoints over bounded channels.
/// The bounded capacity stands in for the socket buffer, so backpressure
/// behaves like the real thing.
pub fn memory_pair(
    capacity: usize,
) -> (
    (MemorySink, MemorySource),
    (MemorySink, MemorySource),
) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        (MemorySink(a_tx), MemorySource(a_rx)),
        (MemorySink(b_tx), MemorySource(b_rx)),
    )
}

pub struct MemorySink(mpsc::Sender<Bytes>);

pub struct MemorySource(mpsc::Receiver<Bytes>);

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Bytes) -> Result<(), ChannelError> {
        self.0
            .send(frame)
            .await
            .map_err(|_| ChannelError::Closed)
    }

    async fn close(&mut self) {}
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<Bytes>, ChannelError> {
        Ok(self.0.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pair_delivers_in_order() {
        let ((mut a_sink, _a_src), (_b_sink, mut b_src)) = memory_pair(8);

        a_sink.send(Bytes::from_static(b"one")).await.unwrap();
        a_sink.send(Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(b_src.recv().await.unwrap().unwrap(), "one");
        assert_eq!(b_src.recv().await.unwrap().unwrap(), "two");
    }

    #[tokio::test]
    async fn test_memory_pair_end_of_stream() {
        let ((a_sink, _a_src), (_b_sink, mut b_src)) = memory_pair(1);
        drop(a_sink);
        assert!(b_src.recv().await.unwrap().is_none());
    }
}
