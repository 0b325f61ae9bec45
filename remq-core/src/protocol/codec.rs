//! Codec implementation for encoding commands and decoding RESP replies.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{Command, RespValue};
use crate::error::{RemqError, Result};

/// Largest bulk string accepted from the wire.
pub const MAX_BULK_LENGTH: usize = 512 * 1024 * 1024;
/// Deepest array nesting accepted from the wire.
pub const MAX_NESTING_DEPTH: usize = 32;

const CRLF: &[u8] = b"\r\n";

/// Codec for the RESP wire protocol.
///
/// Implements the `tokio_util::codec::{Encoder, Decoder}` traits for use
/// with tokio's framed I/O. Commands encode as arrays of bulk strings; any
/// [`RespValue`] can be encoded as well, which is what a server side uses.
#[derive(Debug, Default, Clone, Copy)]
pub struct RespCodec {
    _private: (),
}

impl RespCodec {
    /// Creates a new codec instance.
    pub fn new() -> Self {
        Self { _private: () }
    }
}

fn put_length(dst: &mut BytesMut, prefix: u8, len: usize) {
    dst.put_u8(prefix);
    dst.put_slice(len.to_string().as_bytes());
    dst.put_slice(CRLF);
}

fn put_bulk(dst: &mut BytesMut, data: &[u8]) {
    put_length(dst, b'$', data.len());
    dst.put_slice(data);
    dst.put_slice(CRLF);
}

fn put_line(dst: &mut BytesMut, prefix: u8, line: &str) -> Result<()> {
    if line.contains(|c: char| c == '\r' || c == '\n') {
        return Err(RemqError::Protocol(
            "status and error lines must not contain CR or LF".to_string(),
        ));
    }
    dst.put_u8(prefix);
    dst.put_slice(line.as_bytes());
    dst.put_slice(CRLF);
    Ok(())
}

fn encode_value(value: &RespValue, dst: &mut BytesMut) -> Result<()> {
    match value {
        RespValue::SimpleString(s) => put_line(dst, b'+', s)?,
        RespValue::Error(s) => put_line(dst, b'-', s)?,
        RespValue::Integer(n) => {
            dst.put_u8(b':');
            dst.put_slice(n.to_string().as_bytes());
            dst.put_slice(CRLF);
        }
        RespValue::BulkString(data) => put_bulk(dst, data),
        RespValue::Nil => dst.put_slice(b"$-1\r\n"),
        RespValue::Array(items) => {
            put_length(dst, b'*', items.len());
            for item in items {
                encode_value(item, dst)?;
            }
        }
    }
    Ok(())
}

impl Encoder<Command> for RespCodec {
    type Error = RemqError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<()> {
        let args = item.arguments();
        put_length(dst, b'*', args.len() + 1);
        put_bulk(dst, item.name().as_bytes());
        for arg in args {
            put_bulk(dst, arg);
        }
        Ok(())
    }
}

impl Encoder<RespValue> for RespCodec {
    type Error = RemqError;

    fn encode(&mut self, item: RespValue, dst: &mut BytesMut) -> Result<()> {
        encode_value(&item, dst)
    }
}

/// Outcome of parsing at a position: the value and the position after it.
type Parsed = Option<(RespValue, usize)>;

fn find_line(src: &[u8], start: usize) -> Option<(usize, usize)> {
    src[start..]
        .windows(2)
        .position(|w| w == CRLF)
        .map(|offset| (start + offset, start + offset + 2))
}

fn parse_text(line: &[u8]) -> Result<String> {
    String::from_utf8(line.to_vec())
        .map_err(|e| RemqError::Protocol(format!("invalid UTF-8 in reply line: {}", e)))
}

fn parse_integer(line: &[u8]) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            RemqError::Protocol(format!(
                "invalid integer: {:?}",
                String::from_utf8_lossy(line)
            ))
        })
}

fn parse_value(src: &[u8], start: usize, depth: usize) -> Result<Parsed> {
    if depth > MAX_NESTING_DEPTH {
        return Err(RemqError::Protocol("reply nested too deeply".to_string()));
    }
    if start >= src.len() {
        return Ok(None);
    }
    let Some((line_end, next)) = find_line(src, start + 1) else {
        return Ok(None);
    };
    let line = &src[start + 1..line_end];

    match src[start] {
        b'+' => Ok(Some((RespValue::SimpleString(parse_text(line)?), next))),
        b'-' => Ok(Some((RespValue::Error(parse_text(line)?), next))),
        b':' => Ok(Some((RespValue::Integer(parse_integer(line)?), next))),
        b'$' => {
            let len = parse_integer(line)?;
            if len == -1 {
                return Ok(Some((RespValue::Nil, next)));
            }
            let len = usize::try_from(len)
                .map_err(|_| RemqError::Protocol(format!("invalid bulk length: {}", len)))?;
            if len > MAX_BULK_LENGTH {
                return Err(RemqError::Protocol(format!(
                    "bulk string of {} bytes exceeds limit",
                    len
                )));
            }
            let end = next + len;
            if src.len() < end + 2 {
                return Ok(None);
            }
            if &src[end..end + 2] != CRLF {
                return Err(RemqError::Protocol(
                    "bulk string not terminated by CRLF".to_string(),
                ));
            }
            let data = Bytes::copy_from_slice(&src[next..end]);
            Ok(Some((RespValue::BulkString(data), end + 2)))
        }
        b'*' => {
            let count = parse_integer(line)?;
            if count == -1 {
                return Ok(Some((RespValue::Nil, next)));
            }
            let count = usize::try_from(count)
                .map_err(|_| RemqError::Protocol(format!("invalid array length: {}", count)))?;
            let mut items = Vec::with_capacity(count.min(1024));
            let mut position = next;
            for _ in 0..count {
                match parse_value(src, position, depth + 1)? {
                    Some((item, after)) => {
                        items.push(item);
                        position = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(items), position)))
        }
        other => Err(RemqError::Protocol(format!(
            "unknown reply type byte: 0x{:02x}",
            other
        ))),
    }
}

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = RemqError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match parse_value(src, 0, 0)? {
            Some((value, consumed)) => {
                src.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}
