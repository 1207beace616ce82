//! Connection manager: admission, lookup by identifier, and broadcast.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::callback::{RequestMeta, WebSocketCallback};
use super::connection::{CloseReason, Connection};
use super::envelope::Payload;
use super::identity::{ConnectionId, IdGenerator};
use super::registry::Registry;
use super::transport::Transport;
use crate::config::WebSocketConfig;
use crate::errors::ConnectionError;

/// Result of offering an upgraded transport to the manager.
#[derive(Debug)]
pub enum Admission<T> {
    /// The connection is registered and its tasks are running.
    Admitted(ConnectionId),
    /// The callback declined (or the identifier collided). The transport is
    /// handed back for the caller to close.
    Rejected(T),
}

impl<T> Admission<T> {
    /// Identifier of an admitted connection.
    pub fn id(&self) -> Option<&ConnectionId> {
        match self {
            Self::Admitted(id) => Some(id),
            Self::Rejected(_) => None,
        }
    }
}

/// Per-recipient outcome of a broadcast.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Recipients whose write succeeded.
    pub delivered: Vec<ConnectionId>,
    /// Recipients that failed, typically because they disconnected while
    /// the broadcast was in flight.
    pub failed: Vec<(ConnectionId, ConnectionError)>,
}

impl BroadcastReport {
    /// Whether every recipient received the message.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Cloneable handle for sending to, closing, and inspecting the
/// connections of one endpoint.
#[derive(Clone, Default)]
pub struct WebSocketController {
    registry: Arc<Registry>,
}

impl WebSocketController {
    /// Send a text message to `id`, waiting for the write outcome.
    pub async fn send_text(
        &self,
        id: &ConnectionId,
        text: impl Into<String>,
    ) -> Result<(), ConnectionError> {
        self.send(id, Payload::Text(text.into())).await
    }

    /// Send a binary message to `id`, waiting for the write outcome.
    pub async fn send_binary(
        &self,
        id: &ConnectionId,
        data: impl Into<Bytes>,
    ) -> Result<(), ConnectionError> {
        self.send(id, Payload::Binary(data.into())).await
    }

    /// Send `payload` to `id`. Fails with [`ConnectionError::NotFound`] when
    /// no such connection is live.
    pub async fn send(&self, id: &ConnectionId, payload: Payload) -> Result<(), ConnectionError> {
        let connection = self
            .registry
            .get(id)
            .ok_or_else(|| ConnectionError::NotFound(id.clone()))?;
        connection.send(payload).await
    }

    /// Close `id`. Succeeds when the connection is torn down by this call or
    /// was already tearing down.
    pub async fn close(&self, id: &ConnectionId) -> Result<(), ConnectionError> {
        let connection = self
            .registry
            .get(id)
            .ok_or_else(|| ConnectionError::NotFound(id.clone()))?;
        if !connection.close(CloseReason::Requested).await {
            debug!(conn_id = %id, "close raced an in-progress teardown");
        }
        Ok(())
    }

    /// Send a text message to every live connection.
    pub async fn broadcast_text(&self, text: impl Into<String>) -> BroadcastReport {
        self.broadcast(Payload::Text(text.into())).await
    }

    /// Send a binary message to every live connection.
    pub async fn broadcast_binary(&self, data: impl Into<Bytes>) -> BroadcastReport {
        self.broadcast(Payload::Binary(data.into())).await
    }

    /// Send `payload` to a snapshot of the live connections concurrently.
    pub async fn broadcast(&self, payload: Payload) -> BroadcastReport {
        let ids = self.registry.ids();
        let outcomes = join_all(ids.into_iter().map(|id| {
            let payload = payload.clone();
            async move {
                let outcome = self.send(&id, payload).await;
                (id, outcome)
            }
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(()) => report.delivered.push(id),
                Err(err) => report.failed.push((id, err)),
            }
        }
        if !report.is_complete() {
            debug!(
                delivered = report.delivered.len(),
                failed = report.failed.len(),
                "broadcast partially delivered"
            );
        }
        report
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Whether `id` is live.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.registry.contains(id)
    }

    /// Snapshot of live identifiers.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.registry.ids()
    }

    /// Tear down every live connection with the shutdown reason. Returns the
    /// number of teardowns this call performed.
    pub async fn close_all(&self) -> usize {
        let connections = self.registry.snapshot();
        let closed = join_all(
            connections
                .iter()
                .map(|connection| connection.close(CloseReason::Shutdown)),
        )
        .await;
        closed.into_iter().filter(|performed| *performed).count()
    }
}

/// Owns admission for one endpoint class.
pub struct WebSocketManager {
    controller: WebSocketController,
    callback: Arc<dyn WebSocketCallback>,
    config: Arc<WebSocketConfig>,
    ids: IdGenerator,
}

impl WebSocketManager {
    /// Create a manager around an existing callback.
    pub fn new(config: WebSocketConfig, callback: Arc<dyn WebSocketCallback>) -> Self {
        Self {
            controller: WebSocketController::default(),
            callback,
            config: Arc::new(config),
            ids: IdGenerator::new(),
        }
    }

    /// Create a manager whose callback needs the endpoint's controller, for
    /// example to relay messages between connections.
    pub fn new_cyclic<C, F>(config: WebSocketConfig, build: F) -> Self
    where
        C: WebSocketCallback,
        F: FnOnce(WebSocketController) -> C,
    {
        let controller = WebSocketController::default();
        let callback: Arc<dyn WebSocketCallback> = Arc::new(build(controller.clone()));
        Self {
            controller,
            callback,
            config: Arc::new(config),
            ids: IdGenerator::new(),
        }
    }

    /// Handle for operations on this manager's connections.
    pub fn controller(&self) -> WebSocketController {
        self.controller.clone()
    }

    /// Resolved configuration.
    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    /// Offer an upgraded transport. On acceptance the connection is
    /// registered before its tasks start.
    pub async fn admit<T: Transport>(&self, transport: T, request: RequestMeta) -> Admission<T> {
        let id = self.ids.next_id(request.peer_addr, Utc::now());

        if !self.callback.on_admit(&id, &request).await {
            debug!(conn_id = %id, peer = ?request.peer_addr, "websocket admission declined");
            return Admission::Rejected(transport);
        }

        let registry = &self.controller.registry;
        let (connection, driver) = Connection::new(
            id.clone(),
            Arc::clone(&self.config),
            Arc::clone(&self.callback),
            Arc::downgrade(registry),
        );
        if let Err(err) = registry.insert_unique(Arc::clone(&connection)) {
            warn!(conn_id = %id, error = %err, "websocket admission refused");
            return Admission::Rejected(transport);
        }

        driver.start(&connection, transport);
        info!(
            conn_id = %id,
            peer = ?request.peer_addr,
            live = registry.len(),
            "websocket connection admitted"
        );
        Admission::Admitted(id)
    }

    /// See [`WebSocketController::send_text`].
    pub async fn send_text(
        &self,
        id: &ConnectionId,
        text: impl Into<String>,
    ) -> Result<(), ConnectionError> {
        self.controller.send_text(id, text).await
    }

    /// See [`WebSocketController::send_binary`].
    pub async fn send_binary(
        &self,
        id: &ConnectionId,
        data: impl Into<Bytes>,
    ) -> Result<(), ConnectionError> {
        self.controller.send_binary(id, data).await
    }

    /// See [`WebSocketController::close`].
    pub async fn close(&self, id: &ConnectionId) -> Result<(), ConnectionError> {
        self.controller.close(id).await
    }

    /// See [`WebSocketController::broadcast_text`].
    pub async fn broadcast_text(&self, text: impl Into<String>) -> BroadcastReport {
        self.controller.broadcast_text(text).await
    }

    /// See [`WebSocketController::close_all`].
    pub async fn close_all(&self) -> usize {
        self.controller.close_all().await
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.controller.connection_count()
    }
}
