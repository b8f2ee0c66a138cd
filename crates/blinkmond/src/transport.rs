//! Ordered WebSocket channel to the remote frame processor.
//!
//! Socket I/O runs on two tokio tasks. The acquisition thread talks to them
//! only through the [`Outbox`] (non-blocking sends guarded by the
//! backpressure policy) and a queue of [`TransportEvent`]s it drains between
//! frames.
//!
//! Backpressure: a binary frame is accepted only while the channel is OPEN
//! and the previous frame has been flushed to the socket. Anything else is
//! dropped on the spot; nothing is queued for retry.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// Inbound events buffered between drains of the acquisition loop.
const EVENT_QUEUE_DEPTH: usize = 64;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connect to {url} failed: {source}")]
    Connect {
        url: String,
        source: WsError,
    },
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),
    #[error("connection closed by remote ({0})")]
    ClosedByRemote(String),
    #[error("websocket: {0}")]
    WebSocket(#[from] WsError),
}

/// Channel lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl TransportState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Per-frame metrics, sent as a JSON text message.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub timestamp: f64,
    pub ear_value: Option<f64>,
    pub event_onset: bool,
    pub event_end: bool,
}

#[derive(Debug)]
pub enum OutboundMessage {
    BinaryFrame(Vec<u8>),
    Metrics(MetricsRecord),
}

#[derive(Debug)]
pub enum InboundMessage {
    /// Annotated image for display.
    AnnotatedFrame(Vec<u8>),
    /// Free-form text. Non-JSON payloads arrive as a JSON string.
    Text(serde_json::Value),
}

#[derive(Debug)]
pub enum TransportEvent {
    Message(InboundMessage),
    /// The channel reached CLOSED. `Ok` only after a local `close()`.
    Closed(Result<(), TransportError>),
}

/// What happened to a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Channel not OPEN.
    DroppedNotOpen,
    /// A previous frame is still waiting to be flushed.
    DroppedPending,
    /// Outbox at capacity.
    DroppedFull,
}

impl SendOutcome {
    pub fn is_queued(self) -> bool {
        self == SendOutcome::Queued
    }
}

struct Shared {
    state: AtomicU8,
    frame_pending: AtomicBool,
}

impl Shared {
    fn state(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: TransportState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Move to `Closing` unless already closing or closed.
    fn begin_close(&self) {
        let _ = self.state.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
            match TransportState::from_u8(v) {
                TransportState::Connecting | TransportState::Open => {
                    Some(TransportState::Closing as u8)
                }
                _ => None,
            }
        });
    }
}

/// Non-blocking sending half, usable from any thread.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<OutboundMessage>,
    shared: Arc<Shared>,
}

impl Outbox {
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let shared = Arc::new(Shared {
            state: AtomicU8::new(TransportState::Connecting as u8),
            frame_pending: AtomicBool::new(false),
        });
        (Self { tx, shared }, rx)
    }

    pub fn state(&self) -> TransportState {
        self.shared.state()
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: TransportState) {
        self.shared.set_state(state);
    }

    /// Stand-in for the writer finishing a frame.
    #[cfg(test)]
    pub(crate) fn mark_flushed(&self) {
        self.shared.frame_pending.store(false, Ordering::SeqCst);
    }

    /// True when a frame sent now would be accepted.
    pub fn frame_slot_free(&self) -> bool {
        self.state() == TransportState::Open && !self.shared.frame_pending.load(Ordering::SeqCst)
    }

    /// Queue an encoded frame, or drop it under backpressure.
    pub fn send_frame(&self, bytes: Vec<u8>) -> SendOutcome {
        if self.state() != TransportState::Open {
            return SendOutcome::DroppedNotOpen;
        }
        if self
            .shared
            .frame_pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return SendOutcome::DroppedPending;
        }
        match self.tx.try_send(OutboundMessage::BinaryFrame(bytes)) {
            Ok(()) => SendOutcome::Queued,
            Err(e) => {
                self.shared.frame_pending.store(false, Ordering::SeqCst);
                match e {
                    mpsc::error::TrySendError::Full(_) => SendOutcome::DroppedFull,
                    mpsc::error::TrySendError::Closed(_) => SendOutcome::DroppedNotOpen,
                }
            }
        }
    }

    /// Queue a metrics record. Dropped only if the channel is not OPEN or
    /// the outbox is full.
    pub fn send_metrics(&self, record: MetricsRecord) -> SendOutcome {
        if self.state() != TransportState::Open {
            return SendOutcome::DroppedNotOpen;
        }
        match self.tx.try_send(OutboundMessage::Metrics(record)) {
            Ok(()) => SendOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::DroppedFull,
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::DroppedNotOpen,
        }
    }
}

/// A connected WebSocket channel.
///
/// Dropping it (or calling [`FrameTransport::close`]) sends a close frame.
/// There is no reconnection; a new transport needs a new `connect`.
pub struct FrameTransport {
    url: String,
    outbox: Outbox,
    events: mpsc::Receiver<TransportEvent>,
    close_tx: Option<oneshot::Sender<()>>,
}

impl FrameTransport {
    /// Connect to `url`, failing if the handshake does not finish in `timeout`.
    pub async fn connect(
        url: &str,
        timeout: Duration,
        outbox_capacity: usize,
    ) -> Result<Self, TransportError> {
        let (outbox, outbound_rx) = Outbox::channel(outbox_capacity);
        tracing::info!(url, "connecting transport");

        let handshake = tokio_tungstenite::connect_async(url);
        let (socket, _response) = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| TransportError::ConnectTimeout(url.to_string()))?
            .map_err(|source| TransportError::Connect {
                url: url.to_string(),
                source,
            })?;

        outbox.shared.set_state(TransportState::Open);
        tracing::info!(url, "transport open");

        let (sink, stream) = socket.split();
        let (event_tx, events) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (close_tx, close_rx) = oneshot::channel();

        tokio::spawn(run_writer(
            sink,
            outbound_rx,
            close_rx,
            Arc::clone(&outbox.shared),
            event_tx.clone(),
        ));
        tokio::spawn(run_reader(stream, Arc::clone(&outbox.shared), event_tx));

        Ok(Self {
            url: url.to_string(),
            outbox,
            events,
            close_tx: Some(close_tx),
        })
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn state(&self) -> TransportState {
        self.outbox.state()
    }

    /// Next buffered event without waiting.
    pub fn try_next_event(&mut self) -> Option<TransportEvent> {
        self.events.try_recv().ok()
    }

    /// Wait for the next event. `None` once both I/O tasks have exited.
    #[cfg(test)]
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    /// Begin an orderly close: the writer sends a close frame and stops.
    pub fn close(mut self) {
        self.begin_close();
    }

    fn begin_close(&mut self) {
        if let Some(close_tx) = self.close_tx.take() {
            tracing::info!(url = %self.url, state = ?self.state(), "closing transport");
            self.outbox.shared.begin_close();
            let _ = close_tx.send(());
        }
    }
}

impl Drop for FrameTransport {
    fn drop(&mut self) {
        self.begin_close();
    }
}

async fn run_writer<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<OutboundMessage>,
    mut close_rx: oneshot::Receiver<()>,
    shared: Arc<Shared>,
    events: mpsc::Sender<TransportEvent>,
) where
    S: futures_util::Sink<Message, Error = WsError> + Unpin,
{
    loop {
        let msg = tokio::select! {
            _ = &mut close_rx => break,
            msg = outbound.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let (result, was_frame) = match msg {
            OutboundMessage::BinaryFrame(bytes) => {
                tracing::trace!(bytes = bytes.len(), "sending frame");
                (sink.send(Message::Binary(bytes)).await, true)
            }
            OutboundMessage::Metrics(record) => match serde_json::to_string(&record) {
                Ok(json) => (sink.send(Message::Text(json)).await, false),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to serialize metrics record");
                    continue;
                }
            },
        };
        if was_frame {
            shared.frame_pending.store(false, Ordering::SeqCst);
        }

        if let Err(e) = result {
            if peer_closed(&e) {
                // The reader reports the close.
                tracing::debug!(error = %e, "transport writer stopped by peer close");
            } else if shared.state() == TransportState::Open {
                tracing::error!(error = %e, "transport write failed");
                shared.set_state(TransportState::Closed);
                let _ = events.send(TransportEvent::Closed(Err(e.into()))).await;
            }
            return;
        }
    }

    shared.begin_close();
    if let Err(e) = sink.close().await {
        tracing::debug!(error = %e, "close handshake did not complete");
    }
    tracing::debug!("transport writer exited");
}

async fn run_reader<S>(mut stream: S, shared: Arc<Shared>, events: mpsc::Sender<TransportEvent>)
where
    S: futures_util::Stream<Item = Result<Message, WsError>> + Unpin,
{
    let mut reported = false;
    while let Some(next) = stream.next().await {
        let msg = match next {
            Ok(msg) => msg,
            Err(e) => {
                let outcome = match shared.state() {
                    TransportState::Open => Err(TransportError::WebSocket(e)),
                    _ => Ok(()),
                };
                report_closed(&shared, &events, outcome, &mut reported).await;
                break;
            }
        };

        let inbound = match msg {
            Message::Binary(bytes) => InboundMessage::AnnotatedFrame(bytes),
            Message::Text(text) => InboundMessage::Text(
                serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text)),
            ),
            Message::Close(frame) => {
                let reason = frame
                    .map(|f| format!("{}: {}", f.code, f.reason))
                    .unwrap_or_else(|| "no close frame".to_string());
                let outcome = closed_outcome(&shared, reason);
                report_closed(&shared, &events, outcome, &mut reported).await;
                // Keep polling: tungstenite flushes the close reply on the next read.
                continue;
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };
        if reported {
            continue;
        }
        if events.try_send(TransportEvent::Message(inbound)).is_err() {
            tracing::warn!("inbound queue full, dropping message");
        }
    }

    let outcome = closed_outcome(&shared, "stream ended".to_string());
    report_closed(&shared, &events, outcome, &mut reported).await;
    tracing::debug!("transport reader exited");
}

/// Move to `Closed` and emit the terminal event, once.
async fn report_closed(
    shared: &Shared,
    events: &mpsc::Sender<TransportEvent>,
    outcome: Result<(), TransportError>,
    reported: &mut bool,
) {
    if std::mem::replace(reported, true) {
        return;
    }
    shared.set_state(TransportState::Closed);
    match &outcome {
        Ok(()) => tracing::info!("transport closed"),
        Err(e) => tracing::warn!(error = %e, "transport closed unexpectedly"),
    }
    let _ = events.send(TransportEvent::Closed(outcome)).await;
}

fn peer_closed(e: &WsError) -> bool {
    matches!(
        e,
        WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(ProtocolError::SendAfterClosing)
    )
}

/// A close is clean only if we initiated it.
fn closed_outcome(shared: &Shared, reason: String) -> Result<(), TransportError> {
    match shared.state() {
        TransportState::Closing | TransportState::Closed => Ok(()),
        _ => Err(TransportError::ClosedByRemote(reason)),
    }
}
