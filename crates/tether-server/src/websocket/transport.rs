//! Duplex transport abstraction.
//!
//! A [`Transport`] is anything that yields inbound [`Frame`]s and accepts
//! outbound ones. Connections split it into a stream half owned by the
//! reader task and a sink half owned by the writer task.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::error::{CapacityError, Error as WsError};

use crate::errors::TransportError;

/// One WebSocket frame as seen by the connection manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 data message.
    Text(String),
    /// Binary data message.
    Binary(Bytes),
    /// Ping control frame.
    Ping(Bytes),
    /// Pong control frame.
    Pong(Bytes),
    /// Close control frame.
    Close,
}

impl Frame {
    /// Payload length of data frames; `None` for control frames.
    pub fn data_len(&self) -> Option<usize> {
        match self {
            Self::Text(text) => Some(text.len()),
            Self::Binary(data) => Some(data.len()),
            Self::Ping(_) | Self::Pong(_) | Self::Close => None,
        }
    }
}

/// A full-duplex framed transport.
pub trait Transport:
    Stream<Item = Result<Frame, TransportError>>
    + Sink<Frame, Error = TransportError>
    + Send
    + Unpin
    + 'static
{
    /// The transport queues a pong for every ping it reads, so the writer
    /// must not send one of its own.
    const ANSWERS_PINGS: bool = false;
}

/// [`Transport`] over an upgraded axum [`WebSocket`].
pub struct AxumTransport {
    socket: WebSocket,
}

impl AxumTransport {
    /// Wrap an upgraded socket.
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

// tungstenite replies to pings while reading
impl Transport for AxumTransport {
    const ANSWERS_PINGS: bool = true;
}

impl Stream for AxumTransport {
    type Item = Result<Frame, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.socket
            .poll_next_unpin(cx)
            .map(|item| item.map(|res| res.map(from_message).map_err(map_axum_error)))
    }
}

impl Sink<Frame> for AxumTransport {
    type Error = TransportError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.socket.poll_ready_unpin(cx).map_err(map_axum_error)
    }

    fn start_send(mut self: Pin<&mut Self>, frame: Frame) -> Result<(), Self::Error> {
        self.socket
            .start_send_unpin(into_message(frame))
            .map_err(map_axum_error)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.socket.poll_flush_unpin(cx).map_err(map_axum_error)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.socket.poll_close_unpin(cx).map_err(map_axum_error)
    }
}

fn from_message(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text.as_str().to_owned()),
        Message::Binary(data) => Frame::Binary(data),
        Message::Ping(data) => Frame::Ping(data),
        Message::Pong(data) => Frame::Pong(data),
        Message::Close(_) => Frame::Close,
    }
}

fn into_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data),
        Frame::Ping(data) => Message::Ping(data),
        Frame::Pong(data) => Message::Pong(data),
        Frame::Close => Message::Close(None),
    }
}

/// Classify an axum socket error, recovering tungstenite's close and
/// capacity errors when the inner error is one.
fn map_axum_error(err: axum::Error) -> TransportError {
    match err.into_inner().downcast::<WsError>() {
        Ok(ws) => match *ws {
            WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
            WsError::Capacity(CapacityError::MessageTooLong { size, max_size }) => {
                TransportError::MessageTooLarge {
                    size,
                    limit: max_size,
                }
            }
            other => TransportError::io(other),
        },
        Err(other) => TransportError::Io(Arc::from(other)),
    }
}
