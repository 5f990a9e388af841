//! Wire format constants and header parsing.
//!
//! A frame on the wire looks like:
//! ```text
//! Content-Length: <decimal digits>\r\n
//! [Other-Header: ignored\r\n]
//! \r\n
//! <exactly Content-Length bytes of UTF-8 JSON>
//! ```
//!
//! The next frame's header starts right after the last payload byte.

/// Field name carrying the payload length (matched case-insensitively).
pub const CONTENT_LENGTH: &str = "Content-Length";

/// Sequence terminating the header block.
pub const HEADER_TERMINATOR: &[u8; 4] = b"\r\n\r\n";

/// Length of [`HEADER_TERMINATOR`].
pub const TERMINATOR_LEN: usize = HEADER_TERMINATOR.len();

/// Default maximum payload size (1 GB).
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 1_073_741_824;

/// Default number of decode steps one `on_data` batch may run.
pub const DEFAULT_MAX_FRAMES_PER_TICK: usize = 100;

/// Encode the header block announcing `content_length` payload bytes.
///
/// # Example
///
/// ```
/// use lsp_ws_bridge::protocol::encode_header;
///
/// assert_eq!(encode_header(17), "Content-Length: 17\r\n\r\n");
/// ```
pub fn encode_header(content_length: usize) -> String {
    format!("{CONTENT_LENGTH}: {content_length}\r\n\r\n")
}

/// Locate the first header terminator in `buf`.
///
/// Returns the offset of the `\r` starting `\r\n\r\n`.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(TERMINATOR_LEN)
        .position(|window| window == HEADER_TERMINATOR)
}

/// Extract the `Content-Length` value from a header block.
///
/// Matches `Content-Length:` case-insensitively anywhere in the block,
/// skips whitespace, then reads decimal digits. Occurrences without
/// digits are skipped in favour of a later one. Returns `None` when no
/// occurrence yields a value that fits in `usize`.
///
/// # Example
///
/// ```
/// use lsp_ws_bridge::protocol::parse_content_length;
///
/// assert_eq!(parse_content_length(b"content-length:42"), Some(42));
/// assert_eq!(parse_content_length(b"Content-Type: text/plain"), None);
/// ```
pub fn parse_content_length(header: &[u8]) -> Option<usize> {
    let name = CONTENT_LENGTH.as_bytes();
    let field_len = name.len() + 1;
    if header.len() < field_len {
        return None;
    }

    for start in 0..=(header.len() - field_len) {
        let field = &header[start..start + field_len];
        if !field[..name.len()].eq_ignore_ascii_case(name) || field[name.len()] != b':' {
            continue;
        }

        let rest = &header[start + field_len..];
        let value = skip_whitespace(rest);
        let digits = value.iter().take_while(|b| b.is_ascii_digit()).count();
        if digits == 0 {
            continue;
        }

        return parse_decimal(&value[..digits]);
    }

    None
}

fn skip_whitespace(bytes: &[u8]) -> &[u8] {
    let skipped = bytes
        .iter()
        .take_while(|b| b.is_ascii_whitespace())
        .count();
    &bytes[skipped..]
}

fn parse_decimal(digits: &[u8]) -> Option<usize> {
    digits.iter().try_fold(0usize, |acc, digit| {
        acc.checked_mul(10)?
            .checked_add(usize::from(digit - b'0'))
    })
}
