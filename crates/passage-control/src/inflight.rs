//! Per-request stream registry
//!
//! One concurrent map per channel, request id to the sender half of that
//! request's inbound frame pipe. The channel reader routes every decoded
//! frame straight to its pipe; dispatchers own the receiver halves.

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use passage_proto::{HeaderList, RequestId, ResponseDescriptor};

/// Frames delivered to one request's pipe, already demultiplexed.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    /// Status and headers; edge side only, precedes all other frames.
    Response(ResponseDescriptor),
    Data(Bytes),
    /// HTTP/2 flavor only, delivered before `End`.
    Trailers(HeaderList),
    /// Half-close: no more frames in this direction except `Error`.
    End,
    /// Abort sent by the peer. Terminal.
    Error(String),
    /// Synthetic failure: the control channel itself is gone. Terminal.
    Disconnected,
}

/// Buffered frames per request before the reader suspends. Small on
/// purpose: a slow consumer should stall the channel reader, which is how
/// backpressure reaches the other end.
pub const STREAM_BUFFER: usize = 32;

/// Request-id → live pipe map for one control channel.
pub struct Inflight {
    streams: DashMap<RequestId, mpsc::Sender<StreamFrame>>,
}

impl Inflight {
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
        }
    }

    /// Create the pipe for a request and return its receiver half.
    /// A second open for a live id replaces the stale pipe.
    pub fn open(&self, id: RequestId) -> mpsc::Receiver<StreamFrame> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        if self.streams.insert(id, tx).is_some() {
            debug!(%id, "Replaced stale stream entry");
        }
        rx
    }

    /// Drop a request's pipe. Safe to call for ids already gone.
    pub fn release(&self, id: &RequestId) -> bool {
        self.streams.remove(id).is_some()
    }

    /// Deliver one frame to its request, suspending on a full pipe.
    /// Returns false when the id is unknown or its consumer is gone.
    pub async fn route(&self, id: &RequestId, frame: StreamFrame) -> bool {
        let tx = match self.streams.get(id) {
            Some(entry) => entry.value().clone(),
            None => return false,
        };

        if tx.send(frame).await.is_err() {
            // Consumer dropped its receiver; reap the entry.
            self.streams.remove(id);
            return false;
        }
        true
    }

    /// Fail every live request with a synthetic disconnect and clear the
    /// map. Used on channel closure; receivers that cannot take another
    /// frame still observe the drop of their sender as end-of-stream.
    pub fn fail_all(&self) {
        let ids: Vec<RequestId> = self.streams.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.streams.remove(&id) {
                let _ = tx.try_send(StreamFrame::Disconnected);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

impl Default for Inflight {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_route_release() {
        let inflight = Inflight::new();
        let id = uuid::Uuid::new_v4();
        let mut rx = inflight.open(id);

        assert!(inflight.route(&id, StreamFrame::Data(Bytes::from_static(b"x"))).await);
        assert_eq!(rx.recv().await, Some(StreamFrame::Data(Bytes::from_static(b"x"))));

        assert!(inflight.release(&id));
        assert!(!inflight.release(&id));
        assert!(!inflight.route(&id, StreamFrame::End).await);
    }

    #[tokio::test]
    async fn test_route_unknown_id() {
        let inflight = Inflight::new();
        assert!(!inflight.route(&uuid::Uuid::new_v4(), StreamFrame::End).await);
    }

    #[tokio::test]
    async fn test_route_reaps_dropped_consumer() {
        let inflight = Inflight::new();
        let id = uuid::Uuid::new_v4();
        let rx = inflight.open(id);
        drop(rx);

        assert!(!inflight.route(&id, StreamFrame::End).await);
        assert!(inflight.is_empty());
    }

    #[tokio::test]
    async fn test_fail_all_delivers_synthetic_error() {
        let inflight = Inflight::new();
        let a = uuid::Uuid::new_v4();
        let b = uuid::Uuid::new_v4();
        let mut rx_a = inflight.open(a);
        let mut rx_b = inflight.open(b);

        inflight.fail_all();
        assert!(inflight.is_empty());

        for rx in [&mut rx_a, &mut rx_b] {
            assert_eq!(rx.recv().await, Some(StreamFrame::Disconnected));
            assert_eq!(rx.recv().await, None);
        }
    }

    #[tokio::test]
    async fn test_isolation_between_ids() {
        let inflight = Inflight::new();
        let a = uuid::Uuid::new_v4();
        let b = uuid::Uuid::new_v4();
        let mut rx_a = inflight.open(a);
        let mut rx_b = inflight.open(b);

        inflight
            .route(&a, StreamFrame::Data(Bytes::from_static(b"for-a")))
            .await;
        inflight.route(&b, StreamFrame::End).await;

        assert_eq!(
            rx_a.recv().await,
            Some(StreamFrame::Data(Bytes::from_static(b"for-a")))
        );
        assert_eq!(rx_b.recv().await, Some(StreamFrame::End));

        // Releasing one id leaves the other untouched.
        inflight.release(&a);
        assert!(inflight.route(&b, StreamFrame::End).await);
    }
}
