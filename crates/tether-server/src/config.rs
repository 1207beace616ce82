//! Resolved per-endpoint WebSocket configuration.

use std::time::Duration;

use tether_settings::WebSocketSettings;

/// Default time the peer may stay silent before the read deadline expires.
pub const DEFAULT_PONG_WAIT: Duration = Duration::from_secs(5);
/// Default deadline for one transport write.
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(10);
/// Default upper bound on the upgrade exchange.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default largest inbound message, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 2048;
/// Default number of unanswered pings tolerated.
pub const DEFAULT_MISSED_HEARTBEAT_THRESHOLD: u32 = 10;
/// Default transport buffer size, in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;
/// Default outbound queue depth per connection.
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 256;
/// Shortest heartbeat interval, whatever the pong wait.
pub const MIN_PING_PERIOD: Duration = Duration::from_millis(10);

/// Configuration for one class of WebSocket endpoint, with every default
/// applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebSocketConfig {
    /// Upper bound on the HTTP upgrade exchange.
    pub handshake_timeout: Duration,
    /// Transport read buffer, in bytes.
    pub read_buffer_size: usize,
    /// Transport write buffer, in bytes.
    pub write_buffer_size: usize,
    /// Largest inbound message accepted, in bytes.
    pub max_message_size: usize,
    /// Read deadline, extended by every inbound frame.
    pub pong_wait: Duration,
    /// Deadline for a single transport write.
    pub write_wait: Duration,
    /// Unanswered pings tolerated before teardown.
    pub missed_heartbeat_threshold: u32,
    /// Bounded outbound queue depth; senders wait once it is full.
    pub send_queue_capacity: usize,
    /// Subprotocols offered during the handshake.
    pub subprotocols: Vec<String>,
    /// Reject upgrades whose `Origin` host differs from `Host`.
    pub check_origin: bool,
}

impl WebSocketConfig {
    /// Resolve settings, treating absent and zero values as "use default".
    pub fn from_settings(settings: &WebSocketSettings) -> Self {
        fn pick<T: PartialEq + Default + Copy>(value: Option<T>, default: T) -> T {
            value.filter(|v| *v != T::default()).unwrap_or(default)
        }

        Self {
            handshake_timeout: settings
                .handshake_timeout_secs
                .filter(|s| *s > 0)
                .map_or(DEFAULT_HANDSHAKE_TIMEOUT, Duration::from_secs),
            read_buffer_size: pick(settings.read_buffer_size, DEFAULT_BUFFER_SIZE),
            write_buffer_size: pick(settings.write_buffer_size, DEFAULT_BUFFER_SIZE),
            max_message_size: pick(settings.max_message_size, DEFAULT_MAX_MESSAGE_SIZE),
            pong_wait: settings
                .pong_wait_secs
                .filter(|s| *s > 0)
                .map_or(DEFAULT_PONG_WAIT, Duration::from_secs),
            write_wait: settings
                .write_wait_secs
                .filter(|s| *s > 0)
                .map_or(DEFAULT_WRITE_WAIT, Duration::from_secs),
            missed_heartbeat_threshold: pick(
                settings.missed_heartbeat_threshold,
                DEFAULT_MISSED_HEARTBEAT_THRESHOLD,
            ),
            send_queue_capacity: pick(settings.send_queue_capacity, DEFAULT_SEND_QUEUE_CAPACITY),
            subprotocols: settings.subprotocols.clone(),
            check_origin: settings.check_origin,
        }
    }

    /// Interval between pings: 90% of the pong wait, so at least one ping
    /// lands inside every pong-wait window. Never below
    /// [`MIN_PING_PERIOD`].
    pub fn ping_period(&self) -> Duration {
        (self.pong_wait * 9 / 10).max(MIN_PING_PERIOD)
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self::from_settings(&WebSocketSettings::default())
    }
}
