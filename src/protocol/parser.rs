//! Zero-Copy RESP Reply Parser
//!
//! Replies are decoded in two passes over the read buffer:
//!
//! 1. `frame_len` walks the headers and reports how many bytes the next
//!    complete reply occupies, or `None` if more data is needed. Nothing
//!    is allocated in this pass, so partial replies cost nothing to retry.
//! 2. Once a whole reply is buffered, exactly that many bytes are split off
//!    the buffer and frozen into `Bytes`; bulk strings are then sliced out
//!    of it without copying.
//!
//! The caller drives it like this:
//! - `Ok(Some(value))`: one reply decoded and removed from the buffer
//! - `Ok(None)`: incomplete, read more from the socket
//! - `Err(ParseError)`: the stream is corrupt and the connection is unusable

use crate::protocol::types::{prefix, RespValue, CRLF};
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Errors that can occur during RESP parsing.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// Unknown type prefix byte
    #[error("unknown type prefix: {0:#04x}")]
    UnknownPrefix(u8),

    /// Invalid integer format in a header or integer reply
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Invalid UTF-8 in a simple string or error message
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Bulk string length is negative (but not -1 for nil)
    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    /// Array length is negative (but not -1 for nil)
    #[error("invalid array length: {0}")]
    InvalidArrayLength(i64),

    /// Protocol violation (missing CRLF, too deep, etc.)
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// A bulk string exceeds the configured maximum
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size for a single bulk string (512 MB, same as Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum array nesting depth. CLUSTER SLOTS nests three levels deep;
/// anything near this bound is a corrupt stream.
pub const MAX_NESTING_DEPTH: usize = 32;

/// Incremental RESP decoder.
#[derive(Debug, Clone)]
pub struct RespParser {
    max_bulk: usize,
}

impl Default for RespParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RespParser {
    pub fn new() -> Self {
        Self {
            max_bulk: MAX_BULK_SIZE,
        }
    }

    /// Lowers the bulk-string size limit.
    pub fn with_max_bulk(mut self, max_bulk: usize) -> Self {
        self.max_bulk = max_bulk;
        self
    }

    /// Decodes one reply from the front of `buf`, consuming its bytes.
    pub fn decode(&self, buf: &mut BytesMut) -> ParseResult<Option<RespValue>> {
        let len = match self.frame_len(buf, 0)? {
            Some(len) => len,
            None => return Ok(None),
        };

        let frame = buf.split_to(len).freeze();
        let mut pos = 0;
        let value = self.read_value(&frame, &mut pos)?;
        debug_assert_eq!(pos, len);
        Ok(Some(value))
    }

    /// Length in bytes of the complete reply at the start of `buf`.
    fn frame_len(&self, buf: &[u8], depth: usize) -> ParseResult<Option<usize>> {
        if buf.is_empty() {
            return Ok(None);
        }
        if depth > MAX_NESTING_DEPTH {
            return Err(ParseError::ProtocolError(format!(
                "maximum nesting depth exceeded: {}",
                MAX_NESTING_DEPTH
            )));
        }

        let line_end = match find_crlf(&buf[1..]) {
            Some(pos) => 1 + pos,
            None => return Ok(None),
        };
        let header = line_end + 2;

        match buf[0] {
            prefix::SIMPLE_STRING | prefix::ERROR | prefix::INTEGER => Ok(Some(header)),
            prefix::BULK_STRING => {
                let len = parse_int(&buf[1..line_end])?;
                if len == -1 {
                    return Ok(Some(header));
                }
                let len = self.checked_bulk_len(len)?;
                let total = header + len + 2;
                if buf.len() < total {
                    return Ok(None);
                }
                if &buf[header + len..total] != CRLF {
                    return Err(ParseError::ProtocolError(
                        "bulk string missing trailing CRLF".to_string(),
                    ));
                }
                Ok(Some(total))
            }
            prefix::ARRAY => {
                let count = parse_int(&buf[1..line_end])?;
                if count == -1 {
                    return Ok(Some(header));
                }
                if count < 0 {
                    return Err(ParseError::InvalidArrayLength(count));
                }
                let mut total = header;
                for _ in 0..count {
                    match self.frame_len(&buf[total..], depth + 1)? {
                        Some(n) => total += n,
                        None => return Ok(None),
                    }
                }
                Ok(Some(total))
            }
            other => Err(ParseError::UnknownPrefix(other)),
        }
    }

    /// Builds the value from a frame already known to be complete.
    fn read_value(&self, frame: &Bytes, pos: &mut usize) -> ParseResult<RespValue> {
        let kind = frame[*pos];
        let start = *pos + 1;
        let line_end = start
            + find_crlf(&frame[start..])
                .ok_or_else(|| ParseError::ProtocolError("truncated header".to_string()))?;
        let line = &frame[start..line_end];
        *pos = line_end + 2;

        match kind {
            prefix::SIMPLE_STRING => Ok(RespValue::SimpleString(utf8(line)?)),
            prefix::ERROR => Ok(RespValue::Error(utf8(line)?)),
            prefix::INTEGER => Ok(RespValue::Integer(parse_int(line)?)),
            prefix::BULK_STRING => {
                let len = parse_int(line)?;
                if len == -1 {
                    return Ok(RespValue::Null);
                }
                let len = self.checked_bulk_len(len)?;
                let data = frame.slice(*pos..*pos + len);
                *pos += len + 2;
                Ok(RespValue::BulkString(data))
            }
            prefix::ARRAY => {
                let count = parse_int(line)?;
                if count == -1 {
                    return Ok(RespValue::Null);
                }
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    items.push(self.read_value(frame, pos)?);
                }
                Ok(RespValue::Array(items))
            }
            other => Err(ParseError::UnknownPrefix(other)),
        }
    }

    fn checked_bulk_len(&self, len: i64) -> ParseResult<usize> {
        if len < 0 {
            return Err(ParseError::InvalidBulkLength(len));
        }
        let len = len as usize;
        if len > self.max_bulk {
            return Err(ParseError::MessageTooLarge {
                size: len,
                max: self.max_bulk,
            });
        }
        Ok(len)
    }
}

/// Position of the first CRLF in the buffer.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

fn parse_int(line: &[u8]) -> ParseResult<i64> {
    let s = std::str::from_utf8(line).map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
    s.parse()
        .map_err(|_| ParseError::InvalidInteger(s.to_string()))
}

fn utf8(line: &[u8]) -> ParseResult<String> {
    std::str::from_utf8(line)
        .map(str::to_string)
        .map_err(|e| ParseError::InvalidUtf8(e.to_string()))
}

/// Parses a single reply from a byte slice, returning it with the number of
/// bytes it occupied.
pub fn parse_message(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    let mut owned = BytesMut::from(buf);
    let before = owned.len();
    let parsed = RespParser::new().decode(&mut owned)?;
    Ok(parsed.map(|value| (value, before - owned.len())))
}
