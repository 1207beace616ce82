//! Test support: an in-memory transport pair and a recording callback.
//!
//! [`memory_transport`] returns the server half (a [`Transport`]) and a
//! [`MemoryPeer`] that plays the remote client. The peer can inject frames
//! and errors, observe every frame the writer produced, fail or stall
//! writes, and count overlapping writes.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll, Waker};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Sink, Stream};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, watch};

use crate::errors::{ConnectionError, TransportError};
use crate::websocket::callback::{RequestMeta, WebSocketCallback};
use crate::websocket::identity::ConnectionId;
use crate::websocket::transport::{Frame, Transport};

#[derive(Default)]
struct Shared {
    fail_writes: AtomicBool,
    closing: AtomicBool,
    refused: AtomicUsize,
    stalled: AtomicBool,
    stall_waker: Mutex<Option<Waker>>,
    unflushed: AtomicUsize,
    overlapping: AtomicUsize,
    sink_closed: AtomicBool,
}

/// Create a connected transport/peer pair.
pub fn memory_transport() -> (MemoryTransport, MemoryPeer) {
    let (to_server, from_peer) = mpsc::unbounded_channel();
    let (to_peer, from_server) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared::default());
    (
        MemoryTransport {
            inbound: from_peer,
            outbound: Some(to_peer),
            shared: Arc::clone(&shared),
        },
        MemoryPeer {
            inbound: Some(to_server),
            outbound: from_server,
            shared,
        },
    )
}

/// Server half of an in-memory transport.
pub struct MemoryTransport {
    inbound: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    shared: Arc<Shared>,
}

fn write_failed() -> TransportError {
    TransportError::io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "write failed",
    ))
}

impl Transport for MemoryTransport {}

impl Stream for MemoryTransport {
    type Item = Result<Frame, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inbound.poll_recv(cx)
    }
}

impl Sink<Frame> for MemoryTransport {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.shared.fail_writes.load(Ordering::Acquire) {
            return Poll::Ready(Err(write_failed()));
        }
        if self.shared.closing.load(Ordering::Acquire) {
            let _ = self.shared.refused.fetch_add(1, Ordering::AcqRel);
            return Poll::Ready(Err(TransportError::Closed));
        }
        if self.outbound.is_none() {
            return Poll::Ready(Err(TransportError::Closed));
        }
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, frame: Frame) -> Result<(), Self::Error> {
        if self.shared.fail_writes.load(Ordering::Acquire) {
            return Err(write_failed());
        }
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if self.shared.unflushed.fetch_add(1, Ordering::AcqRel) > 0 {
            let _ = self.shared.overlapping.fetch_add(1, Ordering::AcqRel);
        }
        match &self.outbound {
            Some(tx) => tx.send(frame).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.shared.stalled.load(Ordering::Acquire) {
            *self.shared.stall_waker.lock() = Some(cx.waker().clone());
            if self.shared.stalled.load(Ordering::Acquire) {
                return Poll::Pending;
            }
        }
        self.shared.unflushed.store(0, Ordering::Release);
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.shared.unflushed.store(0, Ordering::Release);
        self.shared.sink_closed.store(true, Ordering::Release);
        self.outbound = None;
        Poll::Ready(Ok(()))
    }
}

/// Remote end of an in-memory transport.
pub struct MemoryPeer {
    inbound: Option<mpsc::UnboundedSender<Result<Frame, TransportError>>>,
    outbound: mpsc::UnboundedReceiver<Frame>,
    shared: Arc<Shared>,
}

impl MemoryPeer {
    /// Deliver a frame to the server. Returns `false` once the server side
    /// stopped reading or the peer hung up.
    pub fn send(&self, frame: Frame) -> bool {
        self.inbound
            .as_ref()
            .is_some_and(|tx| tx.send(Ok(frame)).is_ok())
    }

    /// Make the server's next read fail with `error`.
    pub fn send_error(&self, error: TransportError) -> bool {
        self.inbound
            .as_ref()
            .is_some_and(|tx| tx.send(Err(error)).is_ok())
    }

    /// A cloneable handle for injecting frames from another task.
    pub fn sender(&self) -> PeerSender {
        PeerSender {
            inbound: self.inbound.clone(),
        }
    }

    /// End the inbound stream, as if the peer dropped the socket.
    pub fn hang_up(&mut self) {
        self.inbound = None;
    }

    /// Next frame written by the server; `None` once the sink is closed or
    /// dropped.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.outbound.recv().await
    }

    /// Next already-written frame, without waiting.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.outbound.try_recv().ok()
    }

    /// Next frame that is not a ping or pong.
    pub async fn next_data(&mut self) -> Option<Frame> {
        loop {
            match self.outbound.recv().await? {
                Frame::Ping(_) | Frame::Pong(_) => {}
                frame => return Some(frame),
            }
        }
    }

    /// Fail every subsequent server write.
    pub fn fail_writes(&self) {
        self.shared.fail_writes.store(true, Ordering::Release);
    }

    /// Refuse every subsequent server write with [`TransportError::Closed`],
    /// as a transport does once its own close handshake has begun.
    pub fn begin_closing(&self) {
        self.shared.closing.store(true, Ordering::Release);
    }

    /// Writes refused since [`MemoryPeer::begin_closing`].
    pub fn refused_writes(&self) -> usize {
        self.shared.refused.load(Ordering::Acquire)
    }

    /// Hold server writes in flush until [`MemoryPeer::resume_writes`].
    pub fn stall_writes(&self) {
        self.shared.stalled.store(true, Ordering::Release);
    }

    /// Release stalled writes.
    pub fn resume_writes(&self) {
        self.shared.stalled.store(false, Ordering::Release);
        if let Some(waker) = self.shared.stall_waker.lock().take() {
            waker.wake();
        }
    }

    /// Writes started while an earlier write was still unflushed.
    pub fn overlapping_writes(&self) -> usize {
        self.shared.overlapping.load(Ordering::Acquire)
    }

    /// Whether the server closed its sink.
    pub fn sink_closed(&self) -> bool {
        self.shared.sink_closed.load(Ordering::Acquire)
    }
}

/// Frame injector detached from a [`MemoryPeer`].
#[derive(Clone)]
pub struct PeerSender {
    inbound: Option<mpsc::UnboundedSender<Result<Frame, TransportError>>>,
}

impl PeerSender {
    /// Deliver a frame to the server. Returns `false` once the server side
    /// stopped reading.
    pub fn send(&self, frame: Frame) -> bool {
        self.inbound
            .as_ref()
            .is_some_and(|tx| tx.send(Ok(frame)).is_ok())
    }
}

/// A callback invocation observed by [`RecordingCallback`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallbackEvent {
    /// `on_admit` returned `true`.
    Admitted(ConnectionId),
    /// `on_text`, lossily decoded.
    Text(ConnectionId, String),
    /// `on_binary`.
    Binary(ConnectionId, Bytes),
    /// `on_error`, rendered with `Display`.
    Error(ConnectionId, String),
    /// `on_disconnect`.
    Disconnected(ConnectionId),
}

/// Holds `on_disconnect` for one connection until released.
#[derive(Default)]
pub struct DisconnectGate {
    entered: Notify,
    release: Notify,
}

impl DisconnectGate {
    /// Wait until `on_disconnect` is blocked on this gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let the blocked `on_disconnect` return.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// A [`WebSocketCallback`] that records every invocation.
pub struct RecordingCallback {
    admit: AtomicBool,
    events: Mutex<Vec<CallbackEvent>>,
    version: watch::Sender<u64>,
    gates: Mutex<Vec<(ConnectionId, Arc<DisconnectGate>)>>,
}

impl Default for RecordingCallback {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingCallback {
    /// Admit everything.
    pub fn new() -> Self {
        Self {
            admit: AtomicBool::new(true),
            events: Mutex::new(Vec::new()),
            version: watch::channel(0).0,
            gates: Mutex::new(Vec::new()),
        }
    }

    /// Reject every later admission.
    pub fn reject_all(&self) {
        self.admit.store(false, Ordering::Release);
    }

    /// Make `on_disconnect` for `id` block until the gate is released.
    pub fn block_disconnect(&self, id: &ConnectionId) -> Arc<DisconnectGate> {
        let gate = Arc::new(DisconnectGate::default());
        self.gates.lock().push((id.clone(), Arc::clone(&gate)));
        gate
    }

    /// Every event so far, in order.
    pub fn events(&self) -> Vec<CallbackEvent> {
        self.events.lock().clone()
    }

    /// Identifiers admitted so far, in order.
    pub fn admitted(&self) -> Vec<ConnectionId> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                CallbackEvent::Admitted(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Text messages received so far.
    pub fn texts(&self) -> Vec<(ConnectionId, String)> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                CallbackEvent::Text(id, text) => Some((id.clone(), text.clone())),
                _ => None,
            })
            .collect()
    }

    /// Rendered errors received so far.
    pub fn errors(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                CallbackEvent::Error(_, err) => Some(err.clone()),
                _ => None,
            })
            .collect()
    }

    /// How many times `on_disconnect` ran for `id`.
    pub fn disconnects(&self, id: &ConnectionId) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, CallbackEvent::Disconnected(d) if d == id))
            .count()
    }

    /// Wait until `predicate` holds over the recorded events.
    pub async fn wait_until(&self, mut predicate: impl FnMut(&[CallbackEvent]) -> bool) {
        let mut rx = self.version.subscribe();
        let _ = rx.wait_for(|_| predicate(&self.events.lock())).await;
    }

    /// Wait until `on_disconnect` ran for `id`.
    pub async fn wait_for_disconnect(&self, id: &ConnectionId) {
        self.wait_until(|events| {
            events
                .iter()
                .any(|event| matches!(event, CallbackEvent::Disconnected(d) if d == id))
        })
        .await;
    }

    fn record(&self, event: CallbackEvent) {
        self.events.lock().push(event);
        self.version.send_modify(|v| *v += 1);
    }
}

#[async_trait]
impl WebSocketCallback for RecordingCallback {
    async fn on_admit(&self, id: &ConnectionId, _request: &RequestMeta) -> bool {
        let admit = self.admit.load(Ordering::Acquire);
        if admit {
            self.record(CallbackEvent::Admitted(id.clone()));
        }
        admit
    }

    async fn on_text(&self, id: &ConnectionId, data: Bytes) {
        self.record(CallbackEvent::Text(
            id.clone(),
            String::from_utf8_lossy(&data).into_owned(),
        ));
    }

    async fn on_binary(&self, id: &ConnectionId, data: Bytes) {
        self.record(CallbackEvent::Binary(id.clone(), data));
    }

    async fn on_disconnect(&self, id: &ConnectionId) {
        self.record(CallbackEvent::Disconnected(id.clone()));
        let gate = self
            .gates
            .lock()
            .iter()
            .find(|(gated, _)| gated == id)
            .map(|(_, gate)| Arc::clone(gate));
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
    }

    async fn on_error(&self, id: &ConnectionId, error: &ConnectionError) {
        self.record(CallbackEvent::Error(id.clone(), error.to_string()));
    }
}
