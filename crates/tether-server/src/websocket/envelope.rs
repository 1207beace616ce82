//! Outbound message envelopes.

use bytes::Bytes;
use tokio::sync::oneshot;

use super::transport::Frame;
use crate::errors::ConnectionError;

/// Outcome of one transmission attempt.
pub type SendOutcome = Result<(), ConnectionError>;

/// Data message kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    /// UTF-8 text.
    Text,
    /// Opaque bytes.
    Binary,
}

/// Outbound data payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    /// UTF-8 text.
    Text(String),
    /// Opaque bytes.
    Binary(Bytes),
}

impl Payload {
    /// Kind of this payload.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text(_) => MessageKind::Text,
            Self::Binary(_) => MessageKind::Binary,
        }
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) => data.len(),
        }
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Payload> for Frame {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Text(text) => Frame::Text(text),
            Payload::Binary(data) => Frame::Binary(data),
        }
    }
}

/// An in-flight outbound message and the signal that reports its outcome.
///
/// Resolving consumes the envelope, so each outcome is delivered at most
/// once. Dropping an unresolved envelope makes the waiting sender observe
/// the connection as closed.
#[derive(Debug)]
pub struct Envelope {
    seq: u64,
    payload: Payload,
    done: oneshot::Sender<SendOutcome>,
}

impl Envelope {
    /// Create an envelope and the receiver its sender waits on.
    pub fn new(seq: u64, payload: Payload) -> (Self, oneshot::Receiver<SendOutcome>) {
        let (done, rx) = oneshot::channel();
        (Self { seq, payload, done }, rx)
    }

    /// Sequence number, unique within its connection.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Kind of the payload.
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Split into the payload and a completion handle for the writer.
    pub fn into_parts(self) -> (Payload, Completion) {
        (
            self.payload,
            Completion {
                seq: self.seq,
                done: self.done,
            },
        )
    }

    /// Report `outcome` without writing.
    pub fn resolve(self, outcome: SendOutcome) {
        let (_, completion) = self.into_parts();
        completion.resolve(outcome);
    }
}

/// Completion half of an envelope whose payload has been taken for writing.
#[derive(Debug)]
pub struct Completion {
    seq: u64,
    done: oneshot::Sender<SendOutcome>,
}

impl Completion {
    /// Sequence number of the originating envelope.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Deliver the outcome to the waiting sender.
    pub fn resolve(self, outcome: SendOutcome) {
        // the sender may have been cancelled; nobody is left to tell
        let _ = self.done.send(outcome);
    }
}
