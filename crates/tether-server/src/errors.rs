//! Connection error taxonomy.
//!
//! Admission rejection is not an error: it is the
//! [`Admission::Rejected`](crate::websocket::manager::Admission) outcome.

use std::sync::Arc;

use thiserror::Error;

use crate::websocket::identity::ConnectionId;

/// Failure reported by the underlying duplex transport.
///
/// Cloneable so one failed write can be reported both to the caller that
/// issued it and to the `on_error` hook.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The transport has already closed or started its own close handshake.
    #[error("transport closed")]
    Closed,
    /// A read or write did not complete within its deadline.
    #[error("transport deadline exceeded")]
    Timeout,
    /// An inbound message exceeded the configured limit.
    #[error("message of {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge {
        /// Size of the offending message.
        size: usize,
        /// Configured maximum.
        limit: usize,
    },
    /// Any other I/O or protocol failure.
    #[error("transport I/O failure: {0}")]
    Io(#[source] Arc<dyn std::error::Error + Send + Sync>),
}

impl TransportError {
    /// Wrap an arbitrary error as [`TransportError::Io`].
    pub fn io(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// Errors surfaced by connection operations and the `on_error` hook.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// No live connection has this identifier. Expected when racing a
    /// disconnect.
    #[error("connection {0} not found")]
    NotFound(ConnectionId),
    /// The connection is closing or closed; the message was not written.
    #[error("connection {0} closed")]
    Closed(ConnectionId),
    /// The transport failed; the connection is torn down.
    #[error("transport error on connection {id}: {source}")]
    Transport {
        /// Affected connection.
        id: ConnectionId,
        /// Underlying failure.
        #[source]
        source: TransportError,
    },
    /// The peer stopped answering pings.
    #[error("connection {0} exceeded the missed heartbeat threshold")]
    HeartbeatTimeout(ConnectionId),
    /// The derived identifier was already registered.
    #[error("connection id {0} already registered")]
    DuplicateId(ConnectionId),
}

impl ConnectionError {
    /// Identifier of the connection the error concerns.
    pub fn connection_id(&self) -> &ConnectionId {
        match self {
            Self::NotFound(id)
            | Self::Closed(id)
            | Self::HeartbeatTimeout(id)
            | Self::DuplicateId(id)
            | Self::Transport { id, .. } => id,
        }
    }

    /// Whether the error tore the connection down (as opposed to describing
    /// a connection that was already gone).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::HeartbeatTimeout(_))
    }
}

/// Errors from assembling or starting a [`TetherServer`](crate::server::TetherServer).
#[derive(Debug, Error)]
pub enum ServerError {
    /// Two endpoints were registered on one path.
    #[error("websocket endpoint already registered at {0}")]
    DuplicateRoute(String),
    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },
}
