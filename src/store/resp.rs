//! Minimal RESP (REdis Serialization Protocol) codec for talking to shards.
//!
//! Commands go out as arrays of bulk strings. Replies are read with
//! [`RespReader`], which understands every RESP2 type.

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// Largest reply accepted from a shard. Counter replies are a few bytes.
pub const DEFAULT_MAX_REPLY_SIZE: usize = 1024 * 1024;

/// RESP data type
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple string: +OK\r\n
    SimpleString(Bytes),
    /// Error: -ERR message\r\n
    Error(Bytes),
    /// Integer: :123\r\n
    Integer(i64),
    /// Bulk string: $5\r\nhello\r\n
    BulkString(Bytes),
    /// Array: *2\r\n:1\r\n:2\r\n
    Array(Vec<RespValue>),
    /// Null bulk string or null array: $-1\r\n
    Null,
}

impl RespValue {
    /// Short type name for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            RespValue::SimpleString(_) => "simple string",
            RespValue::Error(_) => "error",
            RespValue::Integer(_) => "integer",
            RespValue::BulkString(_) => "bulk string",
            RespValue::Array(_) => "array",
            RespValue::Null => "null",
        }
    }
}

/// RESP parsing error
#[derive(Debug, thiserror::Error)]
pub enum RespError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid RESP format: {0}")]
    InvalidFormat(String),
    #[error("Connection closed by peer")]
    UnexpectedEof,
    #[error("Integer overflow")]
    IntegerOverflow,
    #[error("Reply too large: {0} bytes (max: {1} bytes)")]
    ReplyTooLarge(usize, usize),
    #[error("Invalid RESP type: {0:#04x}")]
    InvalidType(u8),
}

impl RespError {
    /// Whether the failure came from the transport rather than the bytes on it.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, RespError::Io(_) | RespError::UnexpectedEof)
    }
}

/// Encode a command as a RESP array of bulk strings.
pub fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }
    buf
}

/// Reads RESP replies from a byte stream.
pub struct RespReader<R: AsyncRead + Unpin + Send> {
    reader: BufReader<R>,
    max_bytes: usize,
    bytes_read: usize,
}

impl<R: AsyncRead + Unpin + Send> RespReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_bytes(reader, DEFAULT_MAX_REPLY_SIZE)
    }

    pub fn with_max_bytes(reader: R, max_bytes: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            max_bytes,
            bytes_read: 0,
        }
    }

    /// Read one complete reply.
    pub async fn read_reply(&mut self) -> Result<RespValue, RespError> {
        self.bytes_read = 0;
        self.read_value().await
    }

    fn check_reply_size(&mut self, additional: usize) -> Result<(), RespError> {
        self.bytes_read = self.bytes_read.saturating_add(additional);
        if self.bytes_read > self.max_bytes {
            Err(RespError::ReplyTooLarge(self.bytes_read, self.max_bytes))
        } else {
            Ok(())
        }
    }

    // Boxed so array elements can recurse.
    fn read_value(&mut self) -> BoxFuture<'_, Result<RespValue, RespError>> {
        async move {
            // One byte past the budget is enough to tell an oversized line
            let budget = self.max_bytes.saturating_sub(self.bytes_read) as u64 + 1;
            let mut line = String::new();
            let n = (&mut self.reader).take(budget).read_line(&mut line).await?;
            if n == 0 {
                return Err(RespError::UnexpectedEof);
            }
            self.check_reply_size(n)?;

            let line = line
                .strip_suffix("\r\n")
                .ok_or_else(|| RespError::InvalidFormat("Line not terminated by CRLF".into()))?;
            let tag = line
                .as_bytes()
                .first()
                .copied()
                .ok_or_else(|| RespError::InvalidFormat("Empty line".into()))?;
            if !tag.is_ascii() {
                return Err(RespError::InvalidType(tag));
            }
            let rest = &line[1..];

            match tag {
                b'+' => Ok(RespValue::SimpleString(Bytes::from(rest.to_string()))),
                b'-' => Ok(RespValue::Error(Bytes::from(rest.to_string()))),
                b':' => parse_integer(rest).map(RespValue::Integer),
                b'$' => self.read_bulk(rest).await,
                b'*' => self.read_array(rest).await,
                other => Err(RespError::InvalidType(other)),
            }
        }
        .boxed()
    }

    async fn read_bulk(&mut self, header: &str) -> Result<RespValue, RespError> {
        let len = parse_integer(header)?;
        if len == -1 {
            return Ok(RespValue::Null);
        }
        if len < 0 {
            return Err(RespError::InvalidFormat(format!(
                "Invalid bulk string length: {}",
                len
            )));
        }

        let len = len as usize;
        self.check_reply_size(len + 2)?;

        let mut payload = vec![0u8; len + 2];
        self.reader.read_exact(&mut payload).await?;
        if !payload.ends_with(b"\r\n") {
            return Err(RespError::InvalidFormat(
                "Expected \\r\\n after bulk string".into(),
            ));
        }
        payload.truncate(len);
        Ok(RespValue::BulkString(Bytes::from(payload)))
    }

    async fn read_array(&mut self, header: &str) -> Result<RespValue, RespError> {
        let count = parse_integer(header)?;
        if count == -1 {
            return Ok(RespValue::Null);
        }
        if count < 0 {
            return Err(RespError::InvalidFormat(format!(
                "Invalid array length: {}",
                count
            )));
        }

        // Every element takes at least 3 bytes, which bounds the allocation
        let count = count as usize;
        self.check_reply_size(count.saturating_mul(3))?;

        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.read_value().await?);
        }
        Ok(RespValue::Array(items))
    }
}

fn parse_integer(text: &str) -> Result<i64, RespError> {
    let wide = text
        .parse::<i128>()
        .map_err(|_| RespError::InvalidFormat(format!("Invalid integer: {}", text)))?;
    i64::try_from(wide).map_err(|_| RespError::IntegerOverflow)
}
