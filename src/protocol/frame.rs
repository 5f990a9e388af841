//! Frame codec: message → framed bytes and framed bytes → message.
//!
//! Both directions are pure functions. The decode side never owns the
//! buffer; it reports how many bytes a step consumed and leaves trimming
//! to the caller ([`FrameBuffer`](super::FrameBuffer)).
//!
//! # Example
//!
//! ```
//! use lsp_ws_bridge::protocol::{decode_one, encode_message, DecodeStep, DEFAULT_MAX_CONTENT_LENGTH};
//! use serde_json::json;
//!
//! let msg = json!({"jsonrpc": "2.0", "method": "ping"});
//! let bytes = encode_message(&msg).unwrap();
//!
//! match decode_one(&bytes, DEFAULT_MAX_CONTENT_LENGTH) {
//!     DecodeStep::Message { message, consumed } => {
//!         assert_eq!(message, msg);
//!         assert_eq!(consumed, bytes.len());
//!     }
//!     other => panic!("unexpected step: {other:?}"),
//! }
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde_json::Value;

use super::wire_format::{encode_header, find_header_end, parse_content_length, TERMINATOR_LEN};
use crate::error::Result;

/// Outcome of one decode attempt against the front of a buffer.
#[derive(Debug)]
pub enum DecodeStep {
    /// More bytes are needed; nothing may be trimmed.
    Incomplete,
    /// A complete, well-formed frame.
    Message {
        /// Parsed payload.
        message: Value,
        /// Header + terminator + payload bytes.
        consumed: usize,
    },
    /// A header block without a usable `Content-Length`.
    MalformedHeader {
        /// Raw header bytes (terminator excluded).
        header: Bytes,
        /// Header + terminator bytes.
        consumed: usize,
    },
    /// Complete frame whose payload is not valid JSON.
    MalformedPayload {
        /// Parser error.
        error: serde_json::Error,
        /// Header + terminator + payload bytes.
        consumed: usize,
    },
    /// Declared length above the allowed maximum.
    Oversized {
        /// Length announced by the header.
        declared: usize,
        /// Allowed maximum.
        max: usize,
    },
}

impl DecodeStep {
    /// Bytes the caller should trim off the front of its buffer.
    ///
    /// `Incomplete` and `Oversized` consume nothing.
    pub fn consumed(&self) -> usize {
        match self {
            Self::Incomplete | Self::Oversized { .. } => 0,
            Self::Message { consumed, .. }
            | Self::MalformedHeader { consumed, .. }
            | Self::MalformedPayload { consumed, .. } => *consumed,
        }
    }
}

/// Serialize `message` to JSON and prefix it with its header.
///
/// The announced length is the UTF-8 byte length of the JSON text.
///
/// # Errors
///
/// Returns `BridgeError::Json` if the value cannot be serialized.
pub fn encode_message<T: Serialize + ?Sized>(message: &T) -> Result<Bytes> {
    let payload = serde_json::to_vec(message)?;
    Ok(build_frame(&payload))
}

/// Frame an already-serialized payload.
pub fn build_frame(payload: &[u8]) -> Bytes {
    let header = encode_header(payload.len());
    let mut buf = BytesMut::with_capacity(header.len() + payload.len());
    buf.put_slice(header.as_bytes());
    buf.put_slice(payload);
    buf.freeze()
}

/// Attempt to decode one frame from the front of `buf`.
pub fn decode_one(buf: &[u8], max_content_length: usize) -> DecodeStep {
    let Some(header_end) = find_header_end(buf) else {
        return DecodeStep::Incomplete;
    };

    let header = &buf[..header_end];
    let content_start = header_end + TERMINATOR_LEN;

    let Some(content_length) = parse_content_length(header) else {
        return DecodeStep::MalformedHeader {
            header: Bytes::copy_from_slice(header),
            consumed: content_start,
        };
    };

    if content_length > max_content_length {
        return DecodeStep::Oversized {
            declared: content_length,
            max: max_content_length,
        };
    }

    let Some(content_end) = content_start.checked_add(content_length) else {
        return DecodeStep::Oversized {
            declared: content_length,
            max: max_content_length,
        };
    };
    if buf.len() < content_end {
        return DecodeStep::Incomplete;
    }

    match serde_json::from_slice(&buf[content_start..content_end]) {
        Ok(message) => DecodeStep::Message {
            message,
            consumed: content_end,
        },
        Err(error) => DecodeStep::MalformedPayload {
            error,
            consumed: content_end,
        },
    }
}
