//! One admitted WebSocket connection.
//!
//! Each connection runs exactly two tasks:
//!
//! - the **reader** owns the stream half, enforces the read deadline and
//!   message size limit, delivers data to the callback in arrival order,
//!   and records pongs;
//! - the **writer** owns the sink half and is the only code that writes to
//!   the transport: queued data, pong replies (for transports that do not
//!   answer pings themselves), heartbeat pings, and the final close frame.
//!
//! Every failure path and every explicit close converge on
//! [`Connection::close`], whose body runs once.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::callback::WebSocketCallback;
use super::envelope::{Envelope, Payload};
use super::heartbeat::{Heartbeat, HeartbeatAction};
use super::identity::ConnectionId;
use super::registry::Registry;
use super::transport::{Frame, Transport};
use crate::config::WebSocketConfig;
use crate::errors::{ConnectionError, TransportError};

/// Why a connection was torn down.
#[derive(Debug, Clone)]
pub enum CloseReason {
    /// Closed through the controller.
    Requested,
    /// The peer sent a close frame or the stream ended.
    PeerClosed,
    /// A read or write failed, or the read deadline expired.
    Transport(TransportError),
    /// Too many pings went unanswered.
    HeartbeatTimeout,
    /// The server is shutting down.
    Shutdown,
}

impl CloseReason {
    /// The error reported to `on_error`, if this reason is a failure.
    pub fn to_error(&self, id: &ConnectionId) -> Option<ConnectionError> {
        match self {
            Self::Transport(source) => Some(ConnectionError::Transport {
                id: id.clone(),
                source: source.clone(),
            }),
            Self::HeartbeatTimeout => Some(ConnectionError::HeartbeatTimeout(id.clone())),
            Self::Requested | Self::PeerClosed | Self::Shutdown => None,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => f.write_str("requested"),
            Self::PeerClosed => f.write_str("peer_closed"),
            Self::Transport(err) => write!(f, "transport: {err}"),
            Self::HeartbeatTimeout => f.write_str("heartbeat_timeout"),
            Self::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Shared state of one admitted connection.
pub struct Connection {
    id: ConnectionId,
    config: Arc<WebSocketConfig>,
    callback: Arc<dyn WebSocketCallback>,
    registry: Weak<Registry>,
    /// Sequence numbers of queued envelopes, in write order.
    outbound: mpsc::Sender<u64>,
    pending: Mutex<HashMap<u64, Envelope>>,
    next_seq: AtomicU64,
    heartbeat: Heartbeat,
    closed: Mutex<bool>,
    cancel: CancellationToken,
    connected_at: DateTime<Utc>,
}

/// Receiving ends handed to the tasks once the connection is registered.
pub struct Driver {
    outbound: mpsc::Receiver<u64>,
}

impl Driver {
    /// Split `transport` and spawn the reader and writer tasks.
    pub fn start<T: Transport>(self, connection: &Arc<Connection>, transport: T) {
        let (sink, stream) = transport.split();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        drop(tokio::spawn(run_writer(
            Arc::clone(connection),
            sink,
            self.outbound,
            control_rx,
        )));
        drop(tokio::spawn(run_reader(
            Arc::clone(connection),
            stream,
            (!T::ANSWERS_PINGS).then_some(control_tx),
        )));
    }
}

impl Connection {
    /// Build an unstarted connection. Nothing touches a transport until
    /// [`Driver::start`] runs.
    pub fn new(
        id: ConnectionId,
        config: Arc<WebSocketConfig>,
        callback: Arc<dyn WebSocketCallback>,
        registry: Weak<Registry>,
    ) -> (Arc<Self>, Driver) {
        let (outbound, outbound_rx) = mpsc::channel(config.send_queue_capacity.max(1));
        let connection = Arc::new(Self {
            id,
            heartbeat: Heartbeat::new(config.missed_heartbeat_threshold),
            config,
            callback,
            registry,
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            closed: Mutex::new(false),
            cancel: CancellationToken::new(),
            connected_at: Utc::now(),
        });
        (
            connection,
            Driver {
                outbound: outbound_rx,
            },
        )
    }

    /// Connection identifier.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// When the connection was admitted.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Whether teardown has started.
    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    /// Pings sent since the last pong.
    pub fn missed_heartbeats(&self) -> u32 {
        self.heartbeat.missed()
    }

    /// Queue `payload` and wait for the writer to report the outcome of its
    /// transport write.
    ///
    /// Returns [`ConnectionError::Closed`] when the connection is closing,
    /// and [`ConnectionError::Transport`] when the write itself failed.
    pub async fn send(&self, payload: Payload) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed(self.id.clone()));
        }

        // nothing is parked until the queue has room, so a caller dropped
        // while waiting leaves no pending entry behind
        let Ok(permit) = self.outbound.reserve().await else {
            return Err(ConnectionError::Closed(self.id.clone()));
        };

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (envelope, done) = Envelope::new(seq, payload);
        let _ = self.pending.lock().insert(seq, envelope);
        permit.send(seq);

        // the writer may have drained the queue for the last time before the
        // permit was used; teardown drains `pending` only after setting the flag
        if self.is_closed() && self.take_pending(seq).is_some() {
            return Err(ConnectionError::Closed(self.id.clone()));
        }

        done.await
            .unwrap_or_else(|_| Err(ConnectionError::Closed(self.id.clone())))
    }

    /// Tear the connection down. Returns `true` only for the call that ran
    /// the teardown; concurrent and later calls return `false` at once.
    pub async fn close(self: &Arc<Self>, reason: CloseReason) -> bool {
        {
            let mut closed = self.closed.lock();
            if *closed {
                return false;
            }
            *closed = true;
        }

        self.cancel.cancel();

        if let Some(registry) = self.registry.upgrade() {
            let _ = registry.remove(self);
        }

        let abandoned: Vec<Envelope> = self.pending.lock().drain().map(|(_, e)| e).collect();
        let abandoned_count = abandoned.len();
        for envelope in abandoned {
            envelope.resolve(Err(ConnectionError::Closed(self.id.clone())));
        }

        let age_ms = (Utc::now() - self.connected_at).num_milliseconds();
        info!(
            conn_id = %self.id,
            reason = %reason,
            age_ms,
            abandoned = abandoned_count,
            "websocket connection closed"
        );

        if let Some(err) = reason.to_error(&self.id) {
            self.callback.on_error(&self.id, &err).await;
        }
        self.callback.on_disconnect(&self.id).await;
        true
    }

    fn take_pending(&self, seq: u64) -> Option<Envelope> {
        self.pending.lock().remove(&seq)
    }
}

/// One transport write bounded by `wait`.
async fn write_frame<S>(sink: &mut S, frame: Frame, wait: Duration) -> Result<(), TransportError>
where
    S: Sink<Frame, Error = TransportError> + Unpin,
{
    match tokio::time::timeout(wait, sink.send(frame)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout),
    }
}

async fn run_writer<S>(
    connection: Arc<Connection>,
    mut sink: S,
    mut outbound: mpsc::Receiver<u64>,
    mut control: mpsc::UnboundedReceiver<Bytes>,
) where
    S: Sink<Frame, Error = TransportError> + Unpin,
{
    let id = connection.id.clone();
    let write_wait = connection.config.write_wait;
    let period = connection.config.ping_period();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = connection.cancel.cancelled() => break,
            Some(data) = control.recv() => {
                match write_frame(&mut sink, Frame::Pong(data), write_wait).await {
                    Ok(()) => {}
                    Err(TransportError::Closed) => {
                        debug!(conn_id = %id, "pong skipped, transport closing");
                    }
                    Err(err) => {
                        let _ = connection.close(CloseReason::Transport(err)).await;
                        break;
                    }
                }
            }
            seq = outbound.recv() => {
                let Some(seq) = seq else { break };
                // abandoned by teardown
                let Some(envelope) = connection.take_pending(seq) else { continue };
                let (payload, completion) = envelope.into_parts();
                match write_frame(&mut sink, payload.into(), write_wait).await {
                    Ok(()) => completion.resolve(Ok(())),
                    Err(err) => {
                        warn!(conn_id = %id, seq, error = %err, "websocket write failed");
                        completion.resolve(Err(ConnectionError::Transport {
                            id: id.clone(),
                            source: err.clone(),
                        }));
                        let _ = connection.close(CloseReason::Transport(err)).await;
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                match connection.heartbeat.check() {
                    HeartbeatAction::Expired => {
                        warn!(
                            conn_id = %id,
                            missed = connection.heartbeat.missed(),
                            threshold = connection.heartbeat.threshold(),
                            "websocket heartbeat expired"
                        );
                        let _ = connection.close(CloseReason::HeartbeatTimeout).await;
                        break;
                    }
                    HeartbeatAction::SendPing => {
                        match write_frame(&mut sink, Frame::Ping(Bytes::new()), write_wait).await {
                            Ok(()) => connection.heartbeat.ping_sent(),
                            Err(err) => {
                                let _ = connection.close(CloseReason::Transport(err)).await;
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    outbound.close();
    while let Ok(seq) = outbound.try_recv() {
        if let Some(envelope) = connection.take_pending(seq) {
            envelope.resolve(Err(ConnectionError::Closed(id.clone())));
        }
    }

    if let Err(err) = write_frame(&mut sink, Frame::Close, write_wait).await {
        debug!(conn_id = %id, error = %err, "close frame not delivered");
    }
    match tokio::time::timeout(write_wait, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(conn_id = %id, error = %err, "transport close failed"),
        Err(_) => debug!(conn_id = %id, "transport close timed out"),
    }
}

/// `pong_replies` is `None` when the transport answers pings itself.
async fn run_reader<St>(
    connection: Arc<Connection>,
    mut stream: St,
    pong_replies: Option<mpsc::UnboundedSender<Bytes>>,
) where
    St: Stream<Item = Result<Frame, TransportError>> + Unpin,
{
    let id = connection.id.clone();
    let limit = connection.config.max_message_size;
    let pong_wait = connection.config.pong_wait;

    let reason = loop {
        let deadline = Instant::now() + pong_wait;
        let next = tokio::select! {
            biased;
            () = connection.cancel.cancelled() => return,
            next = tokio::time::timeout_at(deadline, stream.next()) => next,
        };

        let frame = match next {
            Err(_) => break CloseReason::Transport(TransportError::Timeout),
            Ok(None) | Ok(Some(Err(TransportError::Closed))) => break CloseReason::PeerClosed,
            Ok(Some(Err(err))) => break CloseReason::Transport(err),
            Ok(Some(Ok(frame))) => frame,
        };

        if let Some(size) = frame.data_len() {
            if size > limit {
                break CloseReason::Transport(TransportError::MessageTooLarge { size, limit });
            }
        }

        match frame {
            Frame::Text(text) => connection.callback.on_text(&id, Bytes::from(text)).await,
            Frame::Binary(data) => connection.callback.on_binary(&id, data).await,
            Frame::Ping(data) => {
                if let Some(replies) = &pong_replies {
                    // writer already gone means teardown is underway
                    let _ = replies.send(data);
                }
            }
            Frame::Pong(_) => connection.heartbeat.record_pong(),
            Frame::Close => break CloseReason::PeerClosed,
        }
    };

    debug!(conn_id = %id, reason = %reason, "websocket reader stopped");
    let _ = connection.close(reason).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CallbackEvent, MemoryPeer, RecordingCallback, memory_transport};
    use assert_matches::assert_matches;

    fn config() -> WebSocketConfig {
        WebSocketConfig {
            pong_wait: Duration::from_secs(10),
            write_wait: Duration::from_secs(1),
            missed_heartbeat_threshold: 2,
            ..WebSocketConfig::default()
        }
    }

    fn start(config: WebSocketConfig) -> (Arc<Connection>, MemoryPeer, Arc<RecordingCallback>) {
        let callback = Arc::new(RecordingCallback::new());
        let (connection, driver) = Connection::new(
            ConnectionId::from("conn_1"),
            Arc::new(config),
            callback.clone(),
            Weak::new(),
        );
        let (transport, peer) = memory_transport();
        driver.start(&connection, transport);
        (connection, peer, callback)
    }

    #[tokio::test]
    async fn send_reaches_peer() {
        let (connection, mut peer, _callback) = start(config());

        connection.send(Payload::Text("hello".into())).await.unwrap();
        connection
            .send(Payload::Binary(Bytes::from_static(b"\x01\x02")))
            .await
            .unwrap();

        assert_eq!(peer.next_data().await, Some(Frame::Text("hello".into())));
        assert_eq!(
            peer.next_data().await,
            Some(Frame::Binary(Bytes::from_static(b"\x01\x02")))
        );
    }

    #[tokio::test]
    async fn inbound_data_reaches_callback_in_order() {
        let (_connection, peer, callback) = start(config());

        assert!(peer.send(Frame::Text("one".into())));
        assert!(peer.send(Frame::Binary(Bytes::from_static(b"two"))));
        assert!(peer.send(Frame::Text("three".into())));

        callback.wait_until(|events| events.len() >= 3).await;
        assert_eq!(
            callback.events(),
            vec![
                CallbackEvent::Text(ConnectionId::from("conn_1"), "one".into()),
                CallbackEvent::Binary(ConnectionId::from("conn_1"), Bytes::from_static(b"two")),
                CallbackEvent::Text(ConnectionId::from("conn_1"), "three".into()),
            ]
        );
    }

    #[tokio::test]
    async fn close_runs_teardown_once() {
        let (connection, mut peer, callback) = start(config());

        assert!(connection.close(CloseReason::Requested).await);
        assert!(!connection.close(CloseReason::Requested).await);
        assert!(connection.is_closed());

        assert_eq!(callback.disconnects(&ConnectionId::from("conn_1")), 1);
        assert!(callback.errors().is_empty());

        // writer flushes a close frame and releases the sink
        assert_eq!(peer.next_data().await, Some(Frame::Close));
        assert_eq!(peer.recv().await, None);
        assert!(peer.sink_closed());
    }

    #[tokio::test]
    async fn send_after_close_is_rejected() {
        let (connection, _peer, _callback) = start(config());
        let _ = connection.close(CloseReason::Requested).await;

        let err = connection.send(Payload::Text("late".into())).await.unwrap_err();
        assert_matches!(err, ConnectionError::Closed(_));
    }

    #[tokio::test]
    async fn peer_close_frame_tears_down() {
        let (connection, peer, callback) = start(config());

        assert!(peer.send(Frame::Close));
        callback.wait_for_disconnect(connection.id()).await;

        assert!(connection.is_closed());
        assert!(callback.errors().is_empty());
    }

    #[tokio::test]
    async fn peer_hang_up_tears_down() {
        let (connection, mut peer, callback) = start(config());

        peer.hang_up();
        callback.wait_for_disconnect(connection.id()).await;
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let (_connection, mut peer, _callback) = start(config());

        assert!(peer.send(Frame::Ping(Bytes::from_static(b"hb"))));
        assert_eq!(peer.recv().await, Some(Frame::Pong(Bytes::from_static(b"hb"))));
    }

    #[tokio::test]
    async fn pong_refused_by_closing_transport_is_tolerated() {
        let (connection, peer, callback) = start(config());
        peer.begin_closing();

        assert!(peer.send(Frame::Ping(Bytes::from_static(b"hb"))));
        tokio::time::timeout(Duration::from_secs(5), async {
            while peer.refused_writes() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("pong write never attempted");
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(!connection.is_closed());
        assert!(callback.errors().is_empty());
        assert_eq!(callback.disconnects(connection.id()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pong_write_past_deadline_tears_down() {
        let (connection, peer, callback) = start(config());
        peer.stall_writes();
        let started = Instant::now();

        assert!(peer.send(Frame::Ping(Bytes::from_static(b"hb"))));
        callback.wait_for_disconnect(connection.id()).await;

        // write wait (1s), well before the 10s read deadline
        assert!(started.elapsed() < Duration::from_secs(5));
        let errors = callback.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("deadline exceeded"));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_pong_wait_still_runs_the_writer() {
        let (connection, mut peer, callback) = start(WebSocketConfig {
            pong_wait: Duration::ZERO,
            ..config()
        });

        callback.wait_for_disconnect(connection.id()).await;
        assert_eq!(peer.next_data().await, Some(Frame::Close));
        assert_eq!(callback.errors().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_sends_leave_nothing_pending() {
        let (connection, peer, _callback) = start(WebSocketConfig {
            send_queue_capacity: 1,
            write_wait: Duration::from_secs(30),
            ..config()
        });
        peer.stall_writes();

        for i in 0..50 {
            let outcome = tokio::time::timeout(
                Duration::from_millis(1),
                connection.send(Payload::Text(format!("m{i}"))),
            )
            .await;
            assert!(outcome.is_err(), "send {i} completed against a stalled peer");
        }

        // at most the one envelope queued behind the stalled write
        assert!(connection.pending.lock().len() <= 1);
        assert!(!connection.is_closed());
    }

    #[tokio::test]
    async fn oversized_message_is_fatal() {
        let (connection, peer, callback) = start(WebSocketConfig {
            max_message_size: 4,
            ..config()
        });

        assert!(peer.send(Frame::Binary(Bytes::from_static(b"12345"))));
        callback.wait_for_disconnect(connection.id()).await;

        let errors = callback.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("5 bytes exceeds limit of 4"));
        assert!(callback.texts().is_empty());
    }

    #[tokio::test]
    async fn write_failure_reports_to_sender_and_on_error() {
        let (connection, peer, callback) = start(config());
        peer.fail_writes();

        let err = connection.send(Payload::Text("x".into())).await.unwrap_err();
        assert_matches!(err, ConnectionError::Transport { .. });

        callback.wait_for_disconnect(connection.id()).await;
        assert_eq!(callback.errors().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_write_hits_write_deadline() {
        let (connection, peer, callback) = start(config());
        peer.stall_writes();

        let err = connection.send(Payload::Text("x".into())).await.unwrap_err();
        assert_matches!(err, ConnectionError::Transport { .. });

        callback.wait_for_disconnect(connection.id()).await;
        let errors = callback.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("deadline exceeded"));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_hits_read_deadline() {
        let (connection, _peer, callback) = start(config());

        callback.wait_for_disconnect(connection.id()).await;
        let errors = callback.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("deadline exceeded"));
    }

    #[tokio::test(start_paused = true)]
    async fn pong_resets_missed_heartbeats() {
        let (connection, mut peer, _callback) = start(config());

        // first ping at 90% of pong wait
        assert_eq!(peer.recv().await, Some(Frame::Ping(Bytes::new())));
        tokio::task::yield_now().await;
        assert_eq!(connection.missed_heartbeats(), 1);

        assert!(peer.send(Frame::Pong(Bytes::new())));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(connection.missed_heartbeats(), 0);
        assert!(!connection.is_closed());
    }

    #[tokio::test]
    async fn pending_sends_resolve_closed_on_teardown() {
        let (connection, peer, _callback) = start(WebSocketConfig {
            write_wait: Duration::from_secs(30),
            ..config()
        });
        peer.stall_writes();

        let mut senders = Vec::new();
        for i in 0..4 {
            let connection = Arc::clone(&connection);
            senders.push(tokio::spawn(async move {
                connection.send(Payload::Text(format!("m{i}"))).await
            }));
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(connection.close(CloseReason::Requested).await);
        peer.resume_writes();

        for sender in senders {
            let outcome = sender.await.unwrap();
            // the one write already in flight may still land
            if let Err(err) = outcome {
                assert_matches!(err, ConnectionError::Closed(_));
            }
        }
    }

    #[test]
    fn close_reason_error_mapping() {
        let id = ConnectionId::from("c");
        assert!(CloseReason::Requested.to_error(&id).is_none());
        assert!(CloseReason::PeerClosed.to_error(&id).is_none());
        assert!(CloseReason::Shutdown.to_error(&id).is_none());
        assert_matches!(
            CloseReason::HeartbeatTimeout.to_error(&id),
            Some(ConnectionError::HeartbeatTimeout(_))
        );
        assert_matches!(
            CloseReason::Transport(TransportError::Timeout).to_error(&id),
            Some(ConnectionError::Transport {
                source: TransportError::Timeout,
                ..
            })
        );
        assert_eq!(CloseReason::HeartbeatTimeout.to_string(), "heartbeat_timeout");
    }
}
