//! WebSocket side of the bridge.
//!
//! Inbound messages from either WebSocket stack are normalized into
//! [`SocketEvent`]s. Outbound frames go through a [`FrameSink`]: the
//! server side sends each frame as one binary message, the client side as
//! one text message.

use async_trait::async_trait;
use axum::extract::ws;
use bytes::Bytes;
use futures::{Sink, SinkExt};
use tokio_tungstenite::tungstenite::{self, protocol::frame::coding::CloseCode};

use crate::error::{BridgeError, Result};
use crate::writer::FrameSink;

/// Why a session closed its WebSocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly close requested by the local side.
    Normal,
    /// The worker exited on its own.
    ProcessExited,
    /// The worker failed to start or reported an error.
    ProcessError,
    /// The peer broke the framing contract.
    ProtocolViolation,
    /// The host is shutting down or reinitializing.
    Shutdown,
}

impl CloseReason {
    /// WebSocket close code sent to the peer.
    pub fn code(self) -> u16 {
        match self {
            Self::Normal | Self::ProcessExited => 1000,
            Self::Shutdown => 1001,
            Self::ProtocolViolation => 1002,
            Self::ProcessError => 1011,
        }
    }

    /// Close reason text sent to the peer.
    pub fn message(self) -> &'static str {
        match self {
            Self::Normal => "Normal closure",
            Self::ProcessExited => "Child process exited",
            Self::ProcessError => "Child process error",
            Self::ProtocolViolation => "Protocol violation",
            Self::Shutdown => "Proxy shutting down",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

/// Payload of one inbound data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundChunk {
    /// Text message, forwarded as its UTF-8 bytes.
    Text(String),
    /// Binary message, forwarded as is.
    Binary(Bytes),
}

impl InboundChunk {
    /// Raw bytes carried by the message.
    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Text(text) => Bytes::from(text),
            Self::Binary(bytes) => bytes,
        }
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }
}

/// One inbound WebSocket message, stripped of stack-specific types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// Text or binary payload.
    Data(InboundChunk),
    /// Ping, pong or raw frame; handled by the WebSocket stack itself.
    Control,
    /// Close frame, with code and reason when the peer sent them.
    Closed(Option<(u16, String)>),
}

impl From<ws::Message> for SocketEvent {
    fn from(message: ws::Message) -> Self {
        match message {
            ws::Message::Text(text) => Self::Data(InboundChunk::Text(text.as_str().to_owned())),
            ws::Message::Binary(bytes) => Self::Data(InboundChunk::Binary(bytes)),
            ws::Message::Ping(_) | ws::Message::Pong(_) => Self::Control,
            ws::Message::Close(frame) => {
                Self::Closed(frame.map(|f| (f.code, f.reason.as_str().to_owned())))
            }
        }
    }
}

impl From<tungstenite::Message> for SocketEvent {
    fn from(message: tungstenite::Message) -> Self {
        match message {
            tungstenite::Message::Text(text) => {
                Self::Data(InboundChunk::Text(text.as_str().to_owned()))
            }
            tungstenite::Message::Binary(bytes) => Self::Data(InboundChunk::Binary(bytes)),
            tungstenite::Message::Ping(_)
            | tungstenite::Message::Pong(_)
            | tungstenite::Message::Frame(_) => Self::Control,
            tungstenite::Message::Close(frame) => {
                Self::Closed(frame.map(|f| (u16::from(f.code), f.reason.as_str().to_owned())))
            }
        }
    }
}

/// Server-side sink: one binary message per frame.
pub struct ServerSocketSink<S> {
    sink: S,
    closed: bool,
}

impl<S> ServerSocketSink<S> {
    /// Wrap the sending half of an accepted socket.
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            closed: false,
        }
    }
}

#[async_trait]
impl<S> FrameSink for ServerSocketSink<S>
where
    S: Sink<ws::Message, Error = axum::Error> + Unpin + Send + 'static,
{
    async fn send_frame(&mut self, frame: Bytes) -> Result<()> {
        if self.closed {
            return Err(BridgeError::ConnectionClosed);
        }
        self.sink.send(ws::Message::Binary(frame)).await?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        // The socket lifecycle belongs to the session.
        Ok(())
    }

    async fn close(&mut self, reason: CloseReason) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let frame = ws::CloseFrame {
            code: reason.code(),
            reason: reason.message().to_string().into(),
        };
        // The peer may already be gone; closing is best effort.
        if let Err(err) = self.sink.send(ws::Message::Close(Some(frame))).await {
            tracing::debug!(error = %err, "Close frame not delivered");
        }
        let _ = self.sink.close().await;
        Ok(())
    }
}

/// Client-side sink: one text message per frame.
pub struct ClientSocketSink<S> {
    sink: S,
    closed: bool,
}

impl<S> ClientSocketSink<S> {
    /// Wrap the sending half of a connected socket.
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            closed: false,
        }
    }
}

#[async_trait]
impl<S> FrameSink for ClientSocketSink<S>
where
    S: Sink<tungstenite::Message, Error = tungstenite::Error> + Unpin + Send + 'static,
{
    async fn send_frame(&mut self, frame: Bytes) -> Result<()> {
        if self.closed {
            return Err(BridgeError::ConnectionClosed);
        }
        let text = String::from_utf8(frame.to_vec())
            .map_err(|err| BridgeError::Protocol(format!("frame is not valid UTF-8: {err}")))?;
        self.sink.send(tungstenite::Message::Text(text.into())).await?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        // A socket has no half-close; ending the stream keeps it open.
        Ok(())
    }

    async fn close(&mut self, reason: CloseReason) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let frame = tungstenite::protocol::CloseFrame {
            code: CloseCode::from(reason.code()),
            reason: reason.message().to_string().into(),
        };
        if let Err(err) = self.sink.send(tungstenite::Message::Close(Some(frame))).await {
            tracing::debug!(error = %err, "Close frame not delivered");
        }
        let _ = self.sink.close().await;
        Ok(())
    }
}
