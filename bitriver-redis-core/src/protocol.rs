//! RESP2 protocol implementation
//!
//! This module implements the Redis Serialization Protocol (RESP2) for
//! encoding commands and replies and decoding them incrementally from a
//! read buffer. Decoding never consumes a partial value: when the buffer
//! ends mid-value the decoder returns `Ok(None)` and the caller reads more.

use crate::error::{RedisError, RedisResult};
use crate::value::RespValue;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;

const CRLF: &[u8] = b"\r\n";

/// Largest bulk string accepted from the wire (512 MiB)
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Longest status, error, integer or header line accepted (64 KiB)
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Deepest array nesting accepted in one reply
pub const MAX_NESTING: usize = 512;

/// Upper bound on the capacity reserved up front for a decoded array
const MAX_ARRAY_PREALLOC: usize = 1024;

/// Encodes RESP values into bytes
pub struct RespEncoder;

impl RespEncoder {
    /// Encode a RESP value into a buffer
    ///
    /// # Errors
    ///
    /// Returns a protocol error if a status or error line contains CR or LF,
    /// which would desynchronize the reader.
    pub fn encode(value: &RespValue, buf: &mut BytesMut) -> RedisResult<()> {
        match value {
            RespValue::SimpleString(s) => {
                check_line(s)?;
                buf.put_u8(b'+');
                buf.put_slice(s.as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Error(e) => {
                check_line(e)?;
                buf.put_u8(b'-');
                buf.put_slice(e.as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Integer(i) => {
                buf.put_u8(b':');
                buf.put_slice(i.to_string().as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::BulkString(data) => put_bulk(buf, data),
            RespValue::Null => buf.put_slice(b"$-1\r\n"),
            RespValue::NullArray => buf.put_slice(b"*-1\r\n"),
            RespValue::Array(arr) => {
                put_header(buf, b'*', arr.len());
                for item in arr {
                    Self::encode(item, buf)?;
                }
            }
        }
        Ok(())
    }

    /// Encode a command as an array of bulk strings
    #[must_use]
    pub fn encode_command(command: &str, args: &[Bytes]) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            16 + command.len() + args.iter().map(|a| a.len() + 16).sum::<usize>(),
        );
        put_header(&mut buf, b'*', 1 + args.len());
        put_bulk(&mut buf, command.as_bytes());
        for arg in args {
            put_bulk(&mut buf, arg);
        }
        buf.freeze()
    }
}

fn check_line(line: &str) -> RedisResult<()> {
    if line.bytes().any(|b| b == b'\r' || b == b'\n') {
        return Err(RedisError::Protocol(
            "Line value must not contain CR or LF".to_string(),
        ));
    }
    Ok(())
}

fn put_header(buf: &mut BytesMut, prefix: u8, len: usize) {
    buf.put_u8(prefix);
    buf.put_slice(len.to_string().as_bytes());
    buf.put_slice(CRLF);
}

fn put_bulk(buf: &mut BytesMut, data: &[u8]) {
    put_header(buf, b'$', data.len());
    buf.put_slice(data);
    buf.put_slice(CRLF);
}

/// Decodes RESP values from bytes
pub struct RespDecoder;

impl RespDecoder {
    /// Decode one RESP value from a buffer
    ///
    /// On `Ok(Some(_))` the cursor sits just past the value. On `Ok(None)`
    /// the cursor position is unspecified and the caller must retry from
    /// the original position once more bytes arrive.
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Protocol`] for malformed framing, arrays nested
    /// deeper than [`MAX_NESTING`] and lines longer than [`MAX_LINE_LEN`].
    pub fn decode(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespValue>> {
        Self::decode_value(buf, 0)
    }

    /// Decode one value from the front of `buf`, consuming its bytes
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Protocol`] for malformed framing.
    pub fn decode_from(buf: &mut BytesMut) -> RedisResult<Option<RespValue>> {
        let mut cursor = Cursor::new(&buf[..]);
        match Self::decode(&mut cursor)? {
            Some(value) => {
                let pos = cursor.position() as usize;
                buf.advance(pos);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn decode_value(buf: &mut Cursor<&[u8]>, depth: usize) -> RedisResult<Option<RespValue>> {
        if !buf.has_remaining() {
            return Ok(None);
        }

        let type_byte = buf.chunk()[0];
        buf.advance(1);

        match type_byte {
            b'+' => Ok(Self::read_line(buf)?
                .map(|line| utf8(line).map(RespValue::SimpleString))
                .transpose()?),
            b'-' => Ok(Self::read_line(buf)?
                .map(|line| utf8(line).map(RespValue::Error))
                .transpose()?),
            b':' => Ok(Self::read_line(buf)?
                .map(|line| parse_number(&line, "integer").map(RespValue::Integer))
                .transpose()?),
            b'$' => Self::decode_bulk_string(buf),
            b'*' => Self::decode_array(buf, depth),
            _ => Err(invalid_type(type_byte)),
        }
    }

    fn decode_bulk_string(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespValue>> {
        let len = match Self::read_line(buf)? {
            Some(line) => parse_number(&line, "bulk string length")?,
            None => return Ok(None),
        };

        let Some(len) = bulk_len(len)? else {
            return Ok(Some(RespValue::Null));
        };
        if buf.remaining() < len + 2 {
            return Ok(None);
        }

        let data = Bytes::copy_from_slice(&buf.chunk()[..len]);
        buf.advance(len);

        if &buf.chunk()[..2] != CRLF {
            return Err(unterminated_bulk());
        }
        buf.advance(2);

        Ok(Some(RespValue::BulkString(data)))
    }

    fn decode_array(buf: &mut Cursor<&[u8]>, depth: usize) -> RedisResult<Option<RespValue>> {
        let len = match Self::read_line(buf)? {
            Some(line) => parse_number(&line, "array length")?,
            None => return Ok(None),
        };

        let Some(len) = array_len(len)? else {
            return Ok(Some(RespValue::NullArray));
        };
        if len > 0 {
            check_depth(depth + 1)?;
        }

        let mut arr = Vec::with_capacity(len.min(MAX_ARRAY_PREALLOC));
        for _ in 0..len {
            match Self::decode_value(buf, depth + 1)? {
                Some(value) => arr.push(value),
                None => return Ok(None),
            }
        }

        Ok(Some(RespValue::Array(arr)))
    }

    fn read_line(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<Vec<u8>>> {
        let start = buf.position() as usize;
        let slice = buf.get_ref();

        match find_line_end(slice, start)? {
            Some(end) => {
                let line = slice[start..end].to_vec();
                buf.set_position((end + 2) as u64);
                Ok(Some(line))
            }
            None => Ok(None),
        }
    }
}

/// Incremental reader for one reply at a time
///
/// Keeps the scan position across reads so a reply that arrives in many
/// pieces is walked once. Only when the whole frame is buffered is it
/// decoded into a [`RespValue`]. The buffer must only grow at the back
/// between calls.
#[derive(Debug, Default)]
pub struct FrameReader {
    /// Offset just past the last fully scanned element
    pos: usize,
    /// Elements still expected by each open array, innermost last
    open: Vec<usize>,
}

impl FrameReader {
    /// Create a reader positioned at the start of a frame
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next complete value off the front of `buf`
    ///
    /// Returns `Ok(None)` until the frame is complete.
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Protocol`] for malformed framing. The reader
    /// and the buffer are unusable afterwards.
    pub fn next_value(&mut self, buf: &mut BytesMut) -> RedisResult<Option<RespValue>> {
        let Some(frame_len) = self.scan(buf)? else {
            return Ok(None);
        };
        self.pos = 0;
        self.open.clear();

        let frame = buf.split_to(frame_len);
        let mut cursor = Cursor::new(&frame[..]);
        match RespDecoder::decode(&mut cursor)? {
            Some(value) => Ok(Some(value)),
            None => Err(RedisError::Protocol("Truncated frame".to_string())),
        }
    }

    /// Advance over complete elements; the frame length once it ends
    fn scan(&mut self, buf: &[u8]) -> RedisResult<Option<usize>> {
        while self.pos < buf.len() {
            let type_byte = buf[self.pos];
            let Some(line_end) = find_line_end(buf, self.pos + 1)? else {
                return Ok(None);
            };
            let after_line = line_end + 2;

            match type_byte {
                b'+' | b'-' => self.pos = after_line,
                b':' => {
                    parse_number(&buf[self.pos + 1..line_end], "integer")?;
                    self.pos = after_line;
                }
                b'$' => {
                    let len = parse_number(&buf[self.pos + 1..line_end], "bulk string length")?;
                    match bulk_len(len)? {
                        None => self.pos = after_line,
                        Some(len) => {
                            if buf.len() < after_line + len + 2 {
                                return Ok(None);
                            }
                            if &buf[after_line + len..after_line + len + 2] != CRLF {
                                return Err(unterminated_bulk());
                            }
                            self.pos = after_line + len + 2;
                        }
                    }
                }
                b'*' => {
                    let len = parse_number(&buf[self.pos + 1..line_end], "array length")?;
                    self.pos = after_line;
                    match array_len(len)? {
                        Some(len) if len > 0 => {
                            check_depth(self.open.len() + 1)?;
                            self.open.push(len);
                            continue;
                        }
                        _ => {}
                    }
                }
                other => return Err(invalid_type(other)),
            }

            // One element finished; close every array it completes.
            loop {
                match self.open.last_mut() {
                    None => return Ok(Some(self.pos)),
                    Some(remaining) => {
                        *remaining -= 1;
                        if *remaining > 0 {
                            break;
                        }
                        self.open.pop();
                    }
                }
            }
        }
        Ok(None)
    }
}

/// Index of the CR ending the line that starts at `start`
fn find_line_end(buf: &[u8], start: usize) -> RedisResult<Option<usize>> {
    if start >= buf.len() {
        return Ok(None);
    }
    let limit = buf.len().min(start + MAX_LINE_LEN + 2);
    match buf[start..limit].windows(2).position(|window| window == CRLF) {
        Some(offset) => Ok(Some(start + offset)),
        None if limit - start >= MAX_LINE_LEN + 2 => Err(RedisError::Protocol(format!(
            "Line exceeds {MAX_LINE_LEN} bytes without CRLF"
        ))),
        None => Ok(None),
    }
}

/// Payload length of a bulk string header; `None` for the nil bulk
fn bulk_len(len: i64) -> RedisResult<Option<usize>> {
    if len == -1 {
        return Ok(None);
    }
    if len < 0 {
        return Err(RedisError::Protocol(format!(
            "Negative bulk string length: {len}"
        )));
    }
    if len > MAX_BULK_LEN {
        return Err(RedisError::Protocol(format!(
            "Bulk string length {len} exceeds {MAX_BULK_LEN}"
        )));
    }
    Ok(Some(len as usize))
}

/// Element count of an array header; `None` for the nil array
fn array_len(len: i64) -> RedisResult<Option<usize>> {
    if len == -1 {
        return Ok(None);
    }
    usize::try_from(len)
        .map(Some)
        .map_err(|_| RedisError::Protocol(format!("Negative array length: {len}")))
}

fn check_depth(depth: usize) -> RedisResult<()> {
    if depth > MAX_NESTING {
        return Err(RedisError::Protocol(format!(
            "Arrays nested deeper than {MAX_NESTING}"
        )));
    }
    Ok(())
}

fn invalid_type(type_byte: u8) -> RedisError {
    RedisError::Protocol(format!("Invalid RESP type byte: {:?}", type_byte as char))
}

fn unterminated_bulk() -> RedisError {
    RedisError::Protocol("Bulk string not terminated by CRLF".to_string())
}

fn utf8(line: Vec<u8>) -> RedisResult<String> {
    String::from_utf8(line).map_err(|e| RedisError::Protocol(format!("Invalid UTF-8: {e}")))
}

fn parse_number(line: &[u8], what: &str) -> RedisResult<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            RedisError::Protocol(format!(
                "Invalid {what}: {:?}",
                String::from_utf8_lossy(line)
            ))
        })
}
