//! RESP framing for the key-value store and sentinel protocol.
//!
//! [`RespCodec`] plugs into `tokio_util::codec::Framed`, so connections read
//! and write whole [`RespValue`]s the same way the rest of the crate handles
//! framed TCP streams.

use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound for a single bulk string or array frame.
pub const MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// Upper bound on array element count.
const MAX_ARRAY_LEN: usize = 1024 * 1024;

/// A single RESP value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+OK\r\n`
    SimpleString(String),
    /// `-ERR message\r\n`
    Error(String),
    /// `:123\r\n`
    Integer(i64),
    /// `$5\r\nhello\r\n`
    BulkString(Vec<u8>),
    /// `*2\r\n...`
    Array(Vec<RespValue>),
    /// `$-1\r\n` or `*-1\r\n`
    Null,
}

impl RespValue {
    /// Build a command array from its arguments.
    pub fn command<I, A>(args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        RespValue::Array(
            args.into_iter()
                .map(|a| RespValue::BulkString(a.as_ref().to_vec()))
                .collect(),
        )
    }

    /// Text view of a simple or bulk string.
    pub fn as_text(&self) -> Option<String> {
        match self {
            RespValue::SimpleString(s) => Some(s.clone()),
            RespValue::BulkString(b) => String::from_utf8(b.clone()).ok(),
            _ => None,
        }
    }
}

/// RESP framing errors.
#[derive(Debug, thiserror::Error)]
pub enum RespError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid RESP format: {0}")]
    InvalidFormat(String),
    #[error("Invalid RESP type byte: {0:#04x}")]
    InvalidType(u8),
    #[error("Frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),
}

/// Framed codec for [`RespValue`].
#[derive(Debug, Default, Clone, Copy)]
pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = RespError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RespValue>, RespError> {
        match parse(src, 0)? {
            Some((value, consumed)) => {
                src.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<RespValue> for RespCodec {
    type Error = RespError;

    fn encode(&mut self, item: RespValue, dst: &mut BytesMut) -> Result<(), RespError> {
        write_value(&item, dst);
        Ok(())
    }
}

fn write_value(value: &RespValue, dst: &mut BytesMut) {
    match value {
        RespValue::SimpleString(s) => {
            dst.put_u8(b'+');
            dst.put_slice(s.as_bytes());
            dst.put_slice(b"\r\n");
        }
        RespValue::Error(e) => {
            dst.put_u8(b'-');
            dst.put_slice(e.as_bytes());
            dst.put_slice(b"\r\n");
        }
        RespValue::Integer(i) => {
            dst.put_slice(format!(":{i}\r\n").as_bytes());
        }
        RespValue::BulkString(bytes) => {
            dst.put_slice(format!("${}\r\n", bytes.len()).as_bytes());
            dst.put_slice(bytes);
            dst.put_slice(b"\r\n");
        }
        RespValue::Array(items) => {
            dst.put_slice(format!("*{}\r\n", items.len()).as_bytes());
            for item in items {
                write_value(item, dst);
            }
        }
        RespValue::Null => dst.put_slice(b"$-1\r\n"),
    }
}

/// Parse one value starting at `pos`. Returns the value and the offset just
/// past it, or `None` if the buffer does not yet hold a complete frame.
fn parse(buf: &[u8], pos: usize) -> Result<Option<(RespValue, usize)>, RespError> {
    let Some((line, next)) = read_line(buf, pos) else {
        return Ok(None);
    };
    if line.is_empty() {
        return Err(RespError::InvalidFormat("empty line".to_string()));
    }

    let body = &line[1..];
    match line[0] {
        b'+' => Ok(Some((RespValue::SimpleString(utf8(body)?), next))),
        b'-' => Ok(Some((RespValue::Error(utf8(body)?), next))),
        b':' => Ok(Some((RespValue::Integer(parse_int(body)?), next))),
        b'$' => {
            let len = parse_int(body)?;
            if len == -1 {
                return Ok(Some((RespValue::Null, next)));
            }
            let len = checked_len(len)?;
            if len > MAX_FRAME_SIZE {
                return Err(RespError::FrameTooLarge(len));
            }
            let end = next + len;
            if buf.len() < end + 2 {
                return Ok(None);
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err(RespError::InvalidFormat(
                    "expected CRLF after bulk string".to_string(),
                ));
            }
            Ok(Some((RespValue::BulkString(buf[next..end].to_vec()), end + 2)))
        }
        b'*' => {
            let count = parse_int(body)?;
            if count == -1 {
                return Ok(Some((RespValue::Null, next)));
            }
            let count = checked_len(count)?;
            if count > MAX_ARRAY_LEN {
                return Err(RespError::InvalidFormat(format!(
                    "array too large: {count} elements"
                )));
            }
            let mut items = Vec::with_capacity(count);
            let mut cursor = next;
            for _ in 0..count {
                match parse(buf, cursor)? {
                    Some((item, after)) => {
                        items.push(item);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(items), cursor)))
        }
        other => Err(RespError::InvalidType(other)),
    }
}

fn read_line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let rest = buf.get(pos..)?;
    let idx = rest.windows(2).position(|w| w == b"\r\n")?;
    Some((&rest[..idx], pos + idx + 2))
}

fn utf8(bytes: &[u8]) -> Result<String, RespError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| RespError::InvalidFormat("line is not valid UTF-8".to_string()))
}

fn parse_int(bytes: &[u8]) -> Result<i64, RespError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| RespError::InvalidFormat("integer is not valid UTF-8".to_string()))?;
    text.parse::<i64>()
        .map_err(|_| RespError::InvalidFormat(format!("invalid integer: {text}")))
}

fn checked_len(len: i64) -> Result<usize, RespError> {
    usize::try_from(len).map_err(|_| RespError::InvalidFormat(format!("invalid length: {len}")))
}
