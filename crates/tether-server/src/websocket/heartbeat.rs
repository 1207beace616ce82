//! Ping/pong liveness accounting.
//!
//! The writer task consults [`Heartbeat::check`] on every ping-period tick;
//! the reader task calls [`Heartbeat::record_pong`] whenever a pong arrives.
//! Only pongs count as proof of life: a peer that keeps sending data but
//! never answers pings is still evicted.

use std::sync::atomic::{AtomicU32, Ordering};

/// What the writer should do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Write a ping, then call [`Heartbeat::ping_sent`].
    SendPing,
    /// Too many pings went unanswered; tear the connection down without
    /// pinging again.
    Expired,
}

/// Missed-pong counter for one connection.
#[derive(Debug)]
pub struct Heartbeat {
    missed: AtomicU32,
    threshold: u32,
}

impl Heartbeat {
    /// Create a monitor tolerating `threshold` unanswered pings.
    pub fn new(threshold: u32) -> Self {
        Self {
            missed: AtomicU32::new(0),
            threshold,
        }
    }

    /// Decide the action for the current tick.
    pub fn check(&self) -> HeartbeatAction {
        if self.missed.load(Ordering::Acquire) > self.threshold {
            HeartbeatAction::Expired
        } else {
            HeartbeatAction::SendPing
        }
    }

    /// Count a ping that reached the transport.
    pub fn ping_sent(&self) {
        let _ = self.missed.fetch_add(1, Ordering::AcqRel);
    }

    /// A pong arrived: the peer is alive.
    pub fn record_pong(&self) {
        self.missed.store(0, Ordering::Release);
    }

    /// Pings sent since the last pong.
    pub fn missed(&self) -> u32 {
        self.missed.load(Ordering::Acquire)
    }

    /// Configured tolerance.
    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}
