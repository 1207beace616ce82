//! WebSocket connection management: admission, per-connection reader and
//! writer tasks, heartbeat, and teardown.

pub mod callback;
pub mod connection;
pub mod envelope;
pub mod heartbeat;
pub mod identity;
pub mod manager;
pub mod registry;
pub mod transport;
pub mod upgrade;
