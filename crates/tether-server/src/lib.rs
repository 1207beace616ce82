//! # tether-server
//!
//! Persistent WebSocket connection management over axum.
//!
//! - Admission of upgraded sockets through an application callback
//! - One reader task and one writer task per connection; every transport
//!   write (data, ping, pong, close) goes through the writer
//! - Ping/pong heartbeat with a missed-pong threshold
//! - Idempotent teardown reachable from any failure or an explicit close
//! - `TetherServer` hosts named endpoints, a `/health` route and graceful
//!   shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod server;
pub mod shutdown;
pub mod testing;
pub mod websocket;

pub use config::WebSocketConfig;
pub use errors::{ConnectionError, ServerError, TransportError};
pub use server::TetherServer;
pub use shutdown::ShutdownCoordinator;
pub use websocket::callback::{RequestMeta, WebSocketCallback};
pub use websocket::envelope::{MessageKind, Payload};
pub use websocket::identity::ConnectionId;
pub use websocket::manager::{Admission, BroadcastReport, WebSocketController, WebSocketManager};
pub use websocket::transport::{Frame, Transport};
