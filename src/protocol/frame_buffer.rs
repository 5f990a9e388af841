//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` so trimming a consumed frame off the front is a
//! cheap pointer advance. The buffer is owned by exactly one reader and is
//! mutated only by appending arrivals and trimming consumed frames.
//!
//! # Example
//!
//! ```
//! use lsp_ws_bridge::protocol::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new();
//!
//! // Data arrives in arbitrary chunks
//! assert!(buffer.push(b"Content-Length: 2\r\n").unwrap().is_empty());
//! let messages = buffer.push(b"\r\n{}").unwrap();
//! assert_eq!(messages.len(), 1);
//! assert!(buffer.is_empty());
//! ```

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::frame::{decode_one, DecodeStep};
use super::wire_format::{find_header_end, DEFAULT_MAX_CONTENT_LENGTH, TERMINATOR_LEN};
use crate::error::{BridgeError, Result};

/// What to do with a header block that has no usable `Content-Length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderPolicy {
    /// Treat it as a protocol violation; the reader fails and the owning
    /// session closes.
    #[default]
    Reject,
    /// Discard the header span and keep scanning.
    Skip,
}

/// Recoverable decode anomalies, reported to the diagnostic hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A header block was discarded under [`HeaderPolicy::Skip`].
    MalformedHeaderSkipped {
        /// Lossy text of the discarded header.
        header: String,
    },
    /// A complete frame carried invalid JSON and was dropped.
    MalformedPayloadDropped {
        /// Payload length in bytes.
        length: usize,
        /// Parser error message.
        error: String,
    },
}

/// Callback receiving [`Diagnostic`]s.
pub type DiagnosticHook = Box<dyn FnMut(&Diagnostic) + Send>;

/// Result of one bounded extraction pass.
#[derive(Debug, Default)]
pub struct Batch {
    /// Messages decoded in this pass, in byte order.
    pub messages: Vec<Value>,
    /// The step limit was hit; more complete frames may be buffered.
    pub more_pending: bool,
}

/// Outcome of one extraction step.
#[derive(Debug)]
enum Extracted {
    Message(Value),
    Skipped,
    NeedMore,
}

/// Buffer for accumulating incoming bytes and extracting complete messages.
pub struct FrameBuffer {
    /// Accumulated, not yet consumed bytes.
    buffer: BytesMut,
    /// Maximum allowed payload size.
    max_content_length: usize,
    /// Malformed header handling.
    header_policy: HeaderPolicy,
    /// Optional observer for skipped input.
    diagnostic: Option<DiagnosticHook>,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max payload: 1GB, malformed headers rejected.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_CONTENT_LENGTH, HeaderPolicy::default())
    }

    /// Create a frame buffer with a custom payload limit and header policy.
    pub fn with_limits(max_content_length: usize, header_policy: HeaderPolicy) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            max_content_length,
            header_policy,
            diagnostic: None,
        }
    }

    /// Install (or replace) the diagnostic hook.
    pub fn set_diagnostic(&mut self, hook: DiagnosticHook) {
        self.diagnostic = Some(hook);
    }

    /// Append data without extracting anything.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Push data into the buffer and extract every complete message.
    ///
    /// Unbounded; readers that must limit work per arrival use
    /// [`extend`](Self::extend) with [`extract_batch`](Self::extract_batch).
    ///
    /// # Errors
    ///
    /// Returns a protocol error on an oversized frame, or on a malformed
    /// header under [`HeaderPolicy::Reject`].
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Value>> {
        self.extend(data);
        Ok(self.extract_batch(usize::MAX)?.messages)
    }

    /// Run at most `max_steps` decode steps.
    ///
    /// Every step that consumes bytes counts, including skipped frames.
    ///
    /// # Errors
    ///
    /// Same as [`push`](Self::push). Messages decoded before the failing
    /// step are discarded along with the error; the reader is unusable
    /// afterwards.
    pub fn extract_batch(&mut self, max_steps: usize) -> Result<Batch> {
        let mut batch = Batch::default();
        let mut steps = 0;

        loop {
            if steps >= max_steps {
                batch.more_pending = !self.buffer.is_empty();
                return Ok(batch);
            }
            steps += 1;

            match self.extract_one()? {
                Extracted::Message(message) => batch.messages.push(message),
                Extracted::Skipped => {}
                Extracted::NeedMore => return Ok(batch),
            }
        }
    }

    fn extract_one(&mut self) -> Result<Extracted> {
        match decode_one(&self.buffer, self.max_content_length) {
            DecodeStep::Incomplete => Ok(Extracted::NeedMore),

            DecodeStep::Message { message, consumed } => {
                let _ = self.buffer.split_to(consumed);
                Ok(Extracted::Message(message))
            }

            DecodeStep::MalformedHeader { header, consumed } => {
                let header = String::from_utf8_lossy(&header).into_owned();
                match self.header_policy {
                    HeaderPolicy::Reject => Err(BridgeError::MalformedHeader { header }),
                    HeaderPolicy::Skip => {
                        let _ = self.buffer.split_to(consumed);
                        tracing::warn!(header = %header, "Skipping header without Content-Length");
                        self.report(Diagnostic::MalformedHeaderSkipped { header });
                        Ok(Extracted::Skipped)
                    }
                }
            }

            DecodeStep::MalformedPayload { error, consumed } => {
                let payload = self.buffer.split_to(consumed);
                let length = payload.len() - header_len(&payload);
                tracing::debug!(length, error = %error, "Dropping frame with malformed JSON payload");
                self.report(Diagnostic::MalformedPayloadDropped {
                    length,
                    error: error.to_string(),
                });
                Ok(Extracted::Skipped)
            }

            DecodeStep::Oversized { declared, max } => {
                Err(BridgeError::PayloadTooLarge { declared, max })
            }
        }
    }

    fn report(&mut self, diagnostic: Diagnostic) {
        if let Some(hook) = self.diagnostic.as_mut() {
            hook(&diagnostic);
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Discard all buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Header + terminator length of a frame known to contain one.
fn header_len(frame: &[u8]) -> usize {
    find_header_end(frame)
        .map(|end| end + TERMINATOR_LEN)
        .unwrap_or(0)
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("buffered", &self.buffer.len())
            .field("max_content_length", &self.max_content_length)
            .field("header_policy", &self.header_policy)
            .finish_non_exhaustive()
    }
}
