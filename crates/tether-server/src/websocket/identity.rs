//! Connection identifiers.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Opaque identifier of an admitted connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Return the inner string as a slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume self and return the inner `String`.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::ops::Deref for ConnectionId {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ConnectionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Derives connection identifiers from peer address and admission time.
///
/// The digest also covers a per-generator counter, so two admissions from
/// the same peer within one clock tick still get distinct identifiers.
#[derive(Debug, Default)]
pub struct IdGenerator {
    counter: AtomicU64,
}

impl IdGenerator {
    /// Create a generator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next identifier for a connection from `peer` admitted at `at`.
    pub fn next_id(&self, peer: Option<SocketAddr>, at: DateTime<Utc>) -> ConnectionId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let peer = peer.map_or_else(|| "unknown".to_owned(), |p| p.to_string());
        let nanos = at.timestamp_nanos_opt().unwrap_or_else(|| at.timestamp_micros());

        let digest = Sha256::new()
            .chain_update(peer.as_bytes())
            .chain_update(b"@")
            .chain_update(nanos.to_be_bytes())
            .chain_update(b"#")
            .chain_update(n.to_be_bytes())
            .finalize();
        ConnectionId(format!("{digest:x}"))
    }
}
