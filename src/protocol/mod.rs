//! Protocol module - Content-Length framing.
//!
//! This module implements the LSP-style framing shared by both transports:
//! - Header encoding and `Content-Length` extraction
//! - Pure encode/decode functions for single frames
//! - Frame buffer for accumulating partial reads

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{build_frame, decode_one, encode_message, DecodeStep};
pub use frame_buffer::{Batch, Diagnostic, DiagnosticHook, FrameBuffer, HeaderPolicy};
pub use wire_format::{
    encode_header, find_header_end, parse_content_length, CONTENT_LENGTH,
    DEFAULT_MAX_CONTENT_LENGTH, DEFAULT_MAX_FRAMES_PER_TICK, HEADER_TERMINATOR, TERMINATOR_LEN,
};
