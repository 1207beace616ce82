//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`
//! so a settings file only needs to name the values it changes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tether_logging::{LogFormat, LogLevel};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "websockets": { "chat": { "pongWaitSecs": 30 } }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// Listener settings.
    pub server: ServerSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
    /// WebSocket tuning per connection class, keyed by class name.
    pub websockets: HashMap<String, WebSocketSettings>,
}

impl TetherSettings {
    /// Settings for a named WebSocket class.
    ///
    /// Unknown classes get all-default settings, matching how an endpoint
    /// registered without configuration behaves.
    pub fn websocket(&self, class: &str) -> WebSocketSettings {
        if let Some(ws) = self.websockets.get(class) {
            ws.clone()
        } else {
            tracing::debug!(class, "no websocket settings for class, using defaults");
            WebSocketSettings::default()
        }
    }
}

/// Server network settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Seconds to wait for tasks to finish on shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            shutdown_timeout_secs: 30,
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level written to stderr.
    pub level: LogLevel,
    /// Output format.
    pub format: LogFormat,
}

/// Tuning for one class of WebSocket endpoint.
///
/// Every field is optional and defaults independently; `0` is treated the
/// same as absent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebSocketSettings {
    /// Upper bound on the HTTP upgrade exchange, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handshake_timeout_secs: Option<u64>,
    /// Transport read buffer, in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_buffer_size: Option<usize>,
    /// Transport write buffer, in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_buffer_size: Option<usize>,
    /// Largest inbound message accepted, in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_message_size: Option<usize>,
    /// How long the peer may stay silent before the read deadline expires.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pong_wait_secs: Option<u64>,
    /// Deadline for a single transport write, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_wait_secs: Option<u64>,
    /// Unanswered pings tolerated before the peer is presumed dead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missed_heartbeat_threshold: Option<u32>,
    /// Outbound messages that may queue per connection before senders wait.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_queue_capacity: Option<usize>,
    /// Subprotocols offered during the handshake, in preference order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subprotocols: Vec<String>,
    /// Reject upgrades whose `Origin` host differs from `Host`.
    pub check_origin: bool,
}
