//! Token/target preamble at the start of raw TCP streams and UDP datagrams.
//!
//! The authenticated tunnel client injects the bearer token and destination
//! into the first bytes of every flow. Two encodings are accepted:
//!
//! ```text
//! binary:  "ZTF1" | u16 BE token len | token | u16 BE target len | target | payload...
//! text:    "TOKEN:<token>\n" "HOST:<target>\n" payload...
//! ```
//!
//! Text markers are only recognized as the first and second line. Anything
//! after the `HOST:` line is payload and is never scanned for markers.

use thiserror::Error;

/// Upper bound on preamble size; bytes beyond this without a complete
/// preamble abort the flow.
pub const MAX_PREAMBLE_LEN: usize = 8 * 1024;

/// Magic prefix of the length-prefixed encoding
pub const BINARY_MAGIC: &[u8; 4] = b"ZTF1";

const TOKEN_MARKER: &[u8] = b"TOKEN:";
const HOST_MARKER: &[u8] = b"HOST:";

/// Errors produced while decoding a preamble.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreambleError {
    /// First line is not a `TOKEN:` line, or the token is empty.
    #[error("missing token")]
    MissingToken,
    /// Second line is not a `HOST:` line, or the target is empty.
    #[error("missing target")]
    MissingTarget,
    /// Token or target is not valid UTF-8.
    #[error("preamble is not valid UTF-8")]
    InvalidUtf8,
    /// No complete preamble within [`MAX_PREAMBLE_LEN`] bytes.
    #[error("preamble exceeds {MAX_PREAMBLE_LEN} bytes")]
    TooLong,
    /// The input ended before the preamble was complete.
    #[error("truncated preamble")]
    Incomplete,
}

/// Decoded preamble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preamble {
    /// Bearer token
    pub token: String,
    /// Destination designator (`host:port`)
    pub target: String,
    /// Number of bytes the preamble occupied; payload starts here
    pub header_len: usize,
}

impl Preamble {
    /// Incrementally decode from the start of a stream.
    ///
    /// `Ok(None)` means more bytes are needed.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>, PreambleError> {
        let result = if buf.starts_with(BINARY_MAGIC) {
            parse_binary(buf)
        } else if BINARY_MAGIC.starts_with(buf) && buf.len() < BINARY_MAGIC.len() {
            Ok(None)
        } else {
            parse_text(buf)
        };

        match result {
            Ok(None) if buf.len() >= MAX_PREAMBLE_LEN => Err(PreambleError::TooLong),
            Ok(Some(p)) if p.header_len > MAX_PREAMBLE_LEN => Err(PreambleError::TooLong),
            other => other,
        }
    }

    /// Decode a buffer that is known to be complete (a UDP datagram).
    pub fn parse_complete(buf: &[u8]) -> Result<Self, PreambleError> {
        Self::parse(buf)?.ok_or(PreambleError::Incomplete)
    }

    /// Encode using the text markers
    #[must_use]
    pub fn encode_text(token: &str, target: &str) -> Vec<u8> {
        format!("TOKEN:{token}\nHOST:{target}\n").into_bytes()
    }

    /// Encode using the length-prefixed form. Fields longer than `u16::MAX`
    /// are truncated, which the decoder will then reject as too long anyway.
    #[must_use]
    pub fn encode_binary(token: &str, target: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + token.len() + target.len());
        out.extend_from_slice(BINARY_MAGIC);
        for field in [token.as_bytes(), target.as_bytes()] {
            let len = u16::try_from(field.len()).unwrap_or(u16::MAX);
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(&field[..usize::from(len)]);
        }
        out
    }
}

fn parse_binary(buf: &[u8]) -> Result<Option<Preamble>, PreambleError> {
    let mut pos = BINARY_MAGIC.len();
    let Some(token) = read_field(buf, &mut pos)? else {
        return Ok(None);
    };
    let Some(target) = read_field(buf, &mut pos)? else {
        return Ok(None);
    };
    finish(token, target, pos)
}

fn read_field<'a>(buf: &'a [u8], pos: &mut usize) -> Result<Option<&'a [u8]>, PreambleError> {
    let Some(len_bytes) = buf.get(*pos..*pos + 2) else {
        return Ok(None);
    };
    let len = usize::from(u16::from_be_bytes([len_bytes[0], len_bytes[1]]));
    if *pos + 2 + len > MAX_PREAMBLE_LEN {
        return Err(PreambleError::TooLong);
    }
    let Some(field) = buf.get(*pos + 2..*pos + 2 + len) else {
        return Ok(None);
    };
    *pos += 2 + len;
    Ok(Some(field))
}

fn parse_text(buf: &[u8]) -> Result<Option<Preamble>, PreambleError> {
    if !prefix_compatible(buf, TOKEN_MARKER) {
        return Err(PreambleError::MissingToken);
    }
    let Some(first_end) = line_end(buf, 0) else {
        return Ok(None);
    };
    let token = buf[..first_end]
        .strip_prefix(TOKEN_MARKER)
        .ok_or(PreambleError::MissingToken)?;

    let second_start = first_end + 1;
    if !prefix_compatible(&buf[second_start..], HOST_MARKER) {
        return Err(PreambleError::MissingTarget);
    }
    let Some(second_end) = line_end(buf, second_start) else {
        return Ok(None);
    };
    let target = buf[second_start..second_end]
        .strip_prefix(HOST_MARKER)
        .ok_or(PreambleError::MissingTarget)?;

    finish(strip_cr(token), strip_cr(target), second_end + 1)
}

/// `true` when `buf` starts with `marker` or is a (possibly empty) prefix of it
fn prefix_compatible(buf: &[u8], marker: &[u8]) -> bool {
    if buf.len() >= marker.len() {
        buf.starts_with(marker)
    } else {
        marker.starts_with(buf)
    }
}

fn line_end(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..].iter().position(|&b| b == b'\n').map(|i| from + i)
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn finish(token: &[u8], target: &[u8], header_len: usize) -> Result<Option<Preamble>, PreambleError> {
    let token = std::str::from_utf8(token).map_err(|_| PreambleError::InvalidUtf8)?.trim();
    let target = std::str::from_utf8(target).map_err(|_| PreambleError::InvalidUtf8)?.trim();
    if token.is_empty() {
        return Err(PreambleError::MissingToken);
    }
    if target.is_empty() {
        return Err(PreambleError::MissingTarget);
    }
    Ok(Some(Preamble {
        token: token.to_string(),
        target: target.to_string(),
        header_len,
    }))
}
