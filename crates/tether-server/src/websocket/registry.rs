//! Live connection registry.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::connection::Connection;
use super::identity::ConnectionId;
use crate::errors::ConnectionError;

/// Concurrent map of admitted connections.
///
/// Entries are added only at admission and removed only by the owning
/// connection's teardown. Lookups clone the `Arc` out so no shard guard is
/// ever held across an `.await`.
#[derive(Default)]
pub struct Registry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a newly admitted connection, refusing an identifier that is
    /// already live.
    pub fn insert_unique(&self, connection: Arc<Connection>) -> Result<(), ConnectionError> {
        match self.connections.entry(connection.id().clone()) {
            Entry::Occupied(entry) => Err(ConnectionError::DuplicateId(entry.key().clone())),
            Entry::Vacant(entry) => {
                let _ = entry.insert(connection);
                Ok(())
            }
        }
    }

    /// Look up a live connection.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove `connection` if it is still the entry registered under its
    /// identifier. Returns whether an entry was removed.
    pub fn remove(&self, connection: &Arc<Connection>) -> bool {
        self.connections
            .remove_if(connection.id(), |_, current| Arc::ptr_eq(current, connection))
            .is_some()
    }

    /// Whether `id` is live.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Snapshot of live identifiers.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Snapshot of live connections.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is live.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebSocketConfig;
    use crate::testing::RecordingCallback;

    fn detached(id: &str) -> Arc<Connection> {
        let (connection, _driver) = Connection::new(
            ConnectionId::from(id),
            Arc::new(WebSocketConfig::default()),
            Arc::new(RecordingCallback::new()),
            std::sync::Weak::new(),
        );
        connection
    }

    #[test]
    fn insert_and_lookup() {
        let registry = Registry::new();
        assert!(registry.is_empty());

        registry.insert_unique(detached("a")).unwrap();
        registry.insert_unique(detached("b")).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains(&ConnectionId::from("a")));
        assert_eq!(registry.get(&ConnectionId::from("b")).unwrap().id().as_str(), "b");
        assert!(registry.get(&ConnectionId::from("c")).is_none());

        let mut ids = registry.ids();
        ids.sort();
        assert_eq!(ids, vec![ConnectionId::from("a"), ConnectionId::from("b")]);
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[test]
    fn duplicate_id_is_refused() {
        let registry = Registry::new();
        let first = detached("dup");
        registry.insert_unique(Arc::clone(&first)).unwrap();

        let err = registry.insert_unique(detached("dup")).unwrap_err();
        assert!(matches!(err, ConnectionError::DuplicateId(ref id) if id.as_str() == "dup"));
        assert!(Arc::ptr_eq(&registry.get(&ConnectionId::from("dup")).unwrap(), &first));
    }

    #[test]
    fn remove_requires_same_connection() {
        let registry = Registry::new();
        let live = detached("x");
        let stale = detached("x");
        registry.insert_unique(Arc::clone(&live)).unwrap();

        assert!(!registry.remove(&stale));
        assert!(registry.contains(&ConnectionId::from("x")));

        assert!(registry.remove(&live));
        assert!(!registry.remove(&live));
        assert!(registry.is_empty());
    }
}
