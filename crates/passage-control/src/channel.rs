//! Channel lifecycle: reader, writer, heartbeat
//!
//! Three tasks per channel. The writer is the single serialization point
//! for outgoing frames; the reader demultiplexes inbound frames by request
//! id into the inflight registry; the heartbeater probes liveness and
//! closes the channel after prolonged silence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use passage_proto::{
    decode_event, encode_event, RequestDescriptor, RequestId, TunnelEvent, WireFamily,
};

use crate::inflight::{Inflight, StreamFrame};
use crate::transport::{FrameSink, FrameSource};
use crate::ChannelError;

/// Channel tuning. Defaults satisfy the heartbeat-every-25s requirement
/// with room to spare.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub heartbeat_interval: Duration,
    /// Silence threshold; two missed heartbeat intervals plus slack.
    pub liveness_timeout: Duration,
    pub drain_timeout: Duration,
    /// Outbound frame buffer; `send` suspends when full.
    pub send_buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(20),
            liveness_timeout: Duration::from_secs(50),
            drain_timeout: Duration::from_secs(30),
            send_buffer: 64,
        }
    }
}

/// Lifecycle states, traversed strictly in order. Connecting and
/// authenticating belong to the handshake that precedes [`spawn`]; a
/// spawned channel starts out ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Authenticating,
    Ready,
    Draining,
    Closed,
}

/// A tunneled request announced by the peer, handed to the dispatcher
/// with the receiver half of its frame pipe.
pub struct IncomingRequest {
    pub id: RequestId,
    pub descriptor: RequestDescriptor,
    pub frames: mpsc::Receiver<StreamFrame>,
}

/// A live channel: the shared handle plus the stream of requests the peer
/// opens. The edge drops `incoming` (it never receives `REQUEST`); the
/// agent feeds it to its dispatcher.
pub struct Channel {
    pub handle: ChannelHandle,
    pub incoming: mpsc::Receiver<IncomingRequest>,
}

struct Shared {
    state: watch::Sender<ChannelState>,
    inflight: Inflight,
    closed: AtomicBool,
}

impl Shared {
    fn mark_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.send_replace(ChannelState::Closed);
        self.inflight.fail_all();
    }
}

/// Cloneable handle used by dispatchers to emit frames and manage
/// per-request pipes.
#[derive(Clone)]
pub struct ChannelHandle {
    outbound: mpsc::Sender<(TunnelEvent, WireFamily)>,
    shared: Arc<Shared>,
}

impl ChannelHandle {
    /// Emit one frame. Suspends on writer backpressure; this suspension is
    /// what propagates a slow peer back to the local producer.
    pub async fn send(&self, event: TunnelEvent, family: WireFamily) -> Result<(), ChannelError> {
        if self.state() == ChannelState::Closed {
            return Err(ChannelError::Closed);
        }
        self.outbound
            .send((event, family))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Register a request id and get the receiver for its inbound frames.
    /// Refused while draining or closed.
    pub fn open_stream(&self, id: RequestId) -> Result<mpsc::Receiver<StreamFrame>, ChannelError> {
        match self.state() {
            ChannelState::Ready => Ok(self.shared.inflight.open(id)),
            ChannelState::Draining => Err(ChannelError::Draining),
            _ => Err(ChannelError::Closed),
        }
    }

    /// Drop a request's pipe once both halves are done.
    pub fn release(&self, id: &RequestId) {
        self.shared.inflight.release(id);
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    pub fn inflight_len(&self) -> usize {
        self.shared.inflight.len()
    }

    /// Resolve once the channel reaches `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.shared.state.subscribe();
        loop {
            if *rx.borrow() == ChannelState::Closed {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop accepting new requests, wait for inflight work to finish up to
    /// the drain timeout, then close.
    pub async fn drain_and_close(&self, timeout: Duration) {
        let _ = self
            .shared
            .state
            .send_if_modified(|state| match state {
                ChannelState::Ready => {
                    *state = ChannelState::Draining;
                    true
                }
                _ => false,
            });

        let deadline = Instant::now() + timeout;
        while !self.shared.inflight.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.close_now();
    }

    /// Immediately fail all inflight requests and tear the channel down.
    pub fn close_now(&self) {
        self.shared.mark_closed();
    }
}

/// Start the channel tasks over an established, authenticated transport.
pub fn spawn<Si, So>(sink: Si, source: So, config: ChannelConfig) -> Channel
where
    Si: FrameSink + 'static,
    So: FrameSource + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::channel(config.send_buffer);
    let (incoming_tx, incoming_rx) = mpsc::channel(32);
    let (state_tx, _) = watch::channel(ChannelState::Ready);

    let shared = Arc::new(Shared {
        state: state_tx,
        inflight: Inflight::new(),
        closed: AtomicBool::new(false),
    });

    let handle = ChannelHandle {
        outbound: outbound_tx.clone(),
        shared: shared.clone(),
    };

    let last_rx = Arc::new(Mutex::new(Instant::now()));

    tokio::spawn(writer_task(sink, outbound_rx, shared.clone()));
    tokio::spawn(reader_task(
        source,
        shared.clone(),
        incoming_tx,
        outbound_tx.clone(),
        last_rx.clone(),
    ));
    tokio::spawn(heartbeat_task(
        outbound_tx,
        shared,
        last_rx,
        config,
    ));

    Channel {
        handle,
        incoming: incoming_rx,
    }
}

async fn writer_task<Si: FrameSink>(
    mut sink: Si,
    mut rx: mpsc::Receiver<(TunnelEvent, WireFamily)>,
    shared: Arc<Shared>,
) {
    let mut state_rx = shared.state.subscribe();
    loop {
        tokio::select! {
            next = rx.recv() => {
                let Some((event, family)) = next else { break };
                let bytes = match encode_event(&event, family) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(%err, "Dropping unencodable frame");
                        continue;
                    }
                };
                if let Err(err) = sink.send(bytes).await {
                    debug!(%err, "Writer transport ended");
                    break;
                }
            }
            _ = closed_signal(&mut state_rx) => break,
        }
    }
    sink.close().await;
    shared.mark_closed();
}

async fn reader_task<So: FrameSource>(
    mut source: So,
    shared: Arc<Shared>,
    incoming_tx: mpsc::Sender<IncomingRequest>,
    outbound_tx: mpsc::Sender<(TunnelEvent, WireFamily)>,
    last_rx: Arc<Mutex<Instant>>,
) {
    let mut state_rx = shared.state.subscribe();
    loop {
        tokio::select! {
            next = source.recv() => {
                match next {
                    Ok(Some(bytes)) => {
                        *last_rx.lock().unwrap() = Instant::now();
                        match decode_event(bytes) {
                            Ok((event, family)) => {
                                handle_inbound(event, family, &shared, &incoming_tx, &outbound_tx)
                                    .await;
                            }
                            Err(err) => {
                                warn!(%err, "Protocol violation on control channel");
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("Control channel ended by peer");
                        break;
                    }
                    Err(err) => {
                        debug!(%err, "Reader transport ended");
                        break;
                    }
                }
            }
            _ = closed_signal(&mut state_rx) => break,
        }
    }
    shared.mark_closed();
}

async fn handle_inbound(
    event: TunnelEvent,
    family: WireFamily,
    shared: &Arc<Shared>,
    incoming_tx: &mpsc::Sender<IncomingRequest>,
    outbound_tx: &mpsc::Sender<(TunnelEvent, WireFamily)>,
) {
    match event {
        TunnelEvent::Ping => {
            let _ = outbound_tx.send((TunnelEvent::Pong, family)).await;
        }
        TunnelEvent::Pong => {}

        TunnelEvent::Request { id, descriptor } => {
            if *shared.state.borrow() != ChannelState::Ready {
                let _ = outbound_tx
                    .send((
                        TunnelEvent::ResponseError {
                            id,
                            message: "tunnel is shutting down".to_string(),
                        },
                        family,
                    ))
                    .await;
                return;
            }
            let frames = shared.inflight.open(id);
            let request = IncomingRequest {
                id,
                descriptor,
                frames,
            };
            if incoming_tx.send(request).await.is_err() {
                // No dispatcher on this side; a REQUEST here is a peer bug.
                warn!(%id, "No request dispatcher attached, rejecting");
                shared.inflight.release(&id);
                let _ = outbound_tx
                    .send((
                        TunnelEvent::ResponseError {
                            id,
                            message: "unexpected request".to_string(),
                        },
                        family,
                    ))
                    .await;
            }
        }

        TunnelEvent::RequestData { id, data } => {
            route(shared, &id, StreamFrame::Data(data)).await;
        }
        TunnelEvent::RequestDataBatch { id, chunks } => {
            for chunk in chunks {
                if !route(shared, &id, StreamFrame::Data(chunk)).await {
                    break;
                }
            }
        }
        TunnelEvent::RequestEnd { id } => {
            route(shared, &id, StreamFrame::End).await;
        }
        TunnelEvent::RequestError { id, message } => {
            route(shared, &id, StreamFrame::Error(message)).await;
            shared.inflight.release(&id);
        }

        TunnelEvent::Response { id, descriptor } => {
            route(shared, &id, StreamFrame::Response(descriptor)).await;
        }
        TunnelEvent::ResponseData { id, data } => {
            route(shared, &id, StreamFrame::Data(data)).await;
        }
        TunnelEvent::ResponseDataBatch { id, chunks } => {
            for chunk in chunks {
                if !route(shared, &id, StreamFrame::Data(chunk)).await {
                    break;
                }
            }
        }
        TunnelEvent::ResponseTrailers { id, trailers } => {
            route(shared, &id, StreamFrame::Trailers(trailers)).await;
        }
        TunnelEvent::ResponseEnd { id } => {
            route(shared, &id, StreamFrame::End).await;
        }
        TunnelEvent::ResponseError { id, message } => {
            route(shared, &id, StreamFrame::Error(message)).await;
            shared.inflight.release(&id);
        }
    }
}

async fn route(shared: &Arc<Shared>, id: &RequestId, frame: StreamFrame) -> bool {
    let delivered = shared.inflight.route(id, frame).await;
    if !delivered {
        debug!(%id, "Dropped frame for unknown or finished request");
    }
    delivered
}

async fn heartbeat_task(
    outbound_tx: mpsc::Sender<(TunnelEvent, WireFamily)>,
    shared: Arc<Shared>,
    last_rx: Arc<Mutex<Instant>>,
    config: ChannelConfig,
) {
    let mut state_rx = shared.state.subscribe();
    let mut tick = tokio::time::interval(config.heartbeat_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let silence = last_rx.lock().unwrap().elapsed();
                if silence > config.liveness_timeout {
                    warn!(silence_secs = silence.as_secs(), "Peer silent past liveness timeout, closing channel");
                    break;
                }
                if outbound_tx.send((TunnelEvent::Ping, WireFamily::Http1)).await.is_err() {
                    break;
                }
            }
            _ = closed_signal(&mut state_rx) => return,
        }
    }
    shared.mark_closed();
}

async fn closed_signal(rx: &mut watch::Receiver<ChannelState>) {
    loop {
        if *rx.borrow() == ChannelState::Closed {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
