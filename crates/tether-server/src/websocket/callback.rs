//! Application callback capability.

use std::collections::HashMap;
use std::net::SocketAddr;

use async_trait::async_trait;
use axum::http::HeaderMap;
use bytes::Bytes;

use super::identity::ConnectionId;
use crate::errors::ConnectionError;

/// Handshake-time view of the upgrade request, handed to
/// [`WebSocketCallback::on_admit`].
#[derive(Clone, Debug, Default)]
pub struct RequestMeta {
    /// Remote address, when the listener recorded it.
    pub peer_addr: Option<SocketAddr>,
    /// Request headers.
    pub headers: HeaderMap,
    /// Decoded query parameters.
    pub query: HashMap<String, String>,
}

impl RequestMeta {
    /// Header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Query parameter by name.
    pub fn form_value(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }
}

/// Application hooks for one endpoint.
///
/// `on_text` and `on_binary` are awaited inline by the connection's reader,
/// so a slow handler delays later inbound messages for that connection
/// only. Hooks may call back into the
/// [`WebSocketController`](super::manager::WebSocketController), including
/// sending to the connection being served.
#[async_trait]
pub trait WebSocketCallback: Send + Sync + 'static {
    /// Decide whether to accept the upgrade. `id` is the identifier the
    /// connection will carry if admitted.
    async fn on_admit(&self, id: &ConnectionId, request: &RequestMeta) -> bool;

    /// A complete text message arrived.
    async fn on_text(&self, id: &ConnectionId, data: Bytes);

    /// A complete binary message arrived.
    async fn on_binary(&self, id: &ConnectionId, data: Bytes);

    /// The connection was torn down. Fires exactly once per admitted
    /// connection.
    async fn on_disconnect(&self, id: &ConnectionId);

    /// The connection failed. Followed by `on_disconnect`.
    async fn on_error(&self, id: &ConnectionId, error: &ConnectionError) {
        tracing::warn!(conn_id = %id, error = %error, "websocket connection failed");
    }
}
