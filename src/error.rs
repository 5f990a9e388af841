//! Error types for lsp-ws-bridge.

use thiserror::Error;

/// Main error type for all bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// I/O error on a pipe, socket or process stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Framing violation reported by the peer's byte stream.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Header block without a parsable `Content-Length`.
    #[error("Malformed header: {header:?}")]
    MalformedHeader {
        /// Lossy text of the rejected header block.
        header: String,
    },

    /// Declared `Content-Length` above the configured maximum.
    #[error("Payload size {declared} exceeds maximum {max}")]
    PayloadTooLarge {
        /// Length announced by the header.
        declared: usize,
        /// Configured limit.
        max: usize,
    },

    /// The worker process could not be started.
    #[error("Failed to spawn worker `{program}`: {source}")]
    Spawn {
        /// Program that was executed.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// WebSocket layer error (either side).
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The channel behind a reader or writer is gone.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Whether this error means the peer broke the framing contract.
    ///
    /// Sessions close with a protocol-error reason for these instead of
    /// treating them as plain transport failures.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_) | Self::MalformedHeader { .. } | Self::PayloadTooLarge { .. }
        )
    }
}

impl From<axum::Error> for BridgeError {
    fn from(err: axum::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BridgeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

/// Result type alias using BridgeError.
pub type Result<T> = std::result::Result<T, BridgeError>;
