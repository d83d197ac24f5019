//! Protocol codec
//!
//! Encoding of commands and incremental decoding of replies for the
//! memcached text protocol.
//!
//! ## Wire Format
//!
//! ### Commands
//! ```text
//! <verb> <key> <flags> <exptime> <bytes>\r\n<data>\r\n     (set/add/replace/append/prepend)
//! get <key1> [<key2> ...]\r\n
//! delete <key>\r\n
//! incr|decr <key> <delta>\r\n
//! touch <key> <exptime>\r\n
//! version\r\n
//! flush_all [<delay>]\r\n
//! ```
//!
//! ### Retrieval Reply
//! ```text
//! VALUE <key> <flags> <bytes> [<cas>]\r\n
//! <data>\r\n
//! ... (repeated, any order, any subset of the requested keys)
//! END\r\n
//! ```
//!
//! Data blocks are length-delimited, never line-delimited: the declared
//! byte count is taken literally so payloads may contain CRLF.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{Command, Item, Reply, StoreMode};
use crate::error::{Error, Result};

/// Longest reply line accepted before the stream is declared corrupt
pub const MAX_LINE_LENGTH: usize = 8 * 1024;

/// Largest data block a `VALUE` header may announce (memcached's `-I` ceiling)
pub const MAX_DATA_LENGTH: usize = 1024 * 1024 * 1024;

const CRLF: &[u8] = b"\r\n";

// =============================================================================
// Command Encoding
// =============================================================================

/// Encode a command to bytes
pub fn encode_command(command: &Command) -> Bytes {
    let mut buf = BytesMut::with_capacity(encoded_len_hint(command));

    match command {
        Command::Store {
            mode,
            key,
            flags,
            exptime,
            data,
        } => {
            let verb = match mode {
                StoreMode::Set => "set",
                StoreMode::Add => "add",
                StoreMode::Replace => "replace",
                StoreMode::Append => "append",
                StoreMode::Prepend => "prepend",
            };
            buf.put_slice(
                format!("{} {} {} {} {}", verb, key, flags, exptime, data.len()).as_bytes(),
            );
            buf.put_slice(CRLF);
            buf.put_slice(data);
        }
        Command::Get { keys } => {
            buf.put_slice(b"get");
            for key in keys {
                buf.put_u8(b' ');
                buf.put_slice(key.as_bytes());
            }
        }
        Command::Delete { key } => {
            buf.put_slice(format!("delete {}", key).as_bytes());
        }
        Command::Incr { key, delta } => {
            buf.put_slice(format!("incr {} {}", key, delta).as_bytes());
        }
        Command::Decr { key, delta } => {
            buf.put_slice(format!("decr {} {}", key, delta).as_bytes());
        }
        Command::Touch { key, exptime } => {
            buf.put_slice(format!("touch {} {}", key, exptime).as_bytes());
        }
        Command::Version => buf.put_slice(b"version"),
        Command::FlushAll { delay } => match delay {
            Some(d) => buf.put_slice(format!("flush_all {}", d).as_bytes()),
            None => buf.put_slice(b"flush_all"),
        },
    }

    buf.put_slice(CRLF);
    buf.freeze()
}

fn encoded_len_hint(command: &Command) -> usize {
    let keys: usize = command.keys().iter().map(|k| k.len() + 1).sum();
    let data = match command {
        Command::Store { data, .. } => data.len() + 2,
        _ => 0,
    };
    48 + keys + data
}

/// Check that a key can travel on the text protocol
///
/// Keys must be non-empty, at most `max_len` bytes and free of spaces and
/// control characters.
pub fn validate_key(key: &str, max_len: usize) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidKey("key is empty".to_string()));
    }
    if key.len() > max_len {
        return Err(Error::InvalidKey(format!(
            "key is {} bytes (max {})",
            key.len(),
            max_len
        )));
    }
    if let Some(b) = key.bytes().find(|b| *b <= b' ' || *b == 0x7f) {
        return Err(Error::InvalidKey(format!(
            "key '{}' contains forbidden byte 0x{:02x}",
            key.escape_debug(),
            b
        )));
    }
    Ok(())
}

// =============================================================================
// Reply Decoding
// =============================================================================

/// Incremental reply parser
///
/// Bytes accumulate in a caller-owned `BytesMut`; `parse` consumes
/// exactly one complete reply per successful call and leaves partial
/// input untouched. Complete `VALUE` blocks of a retrieval reply are
/// consumed as they arrive and held here until `END`.
#[derive(Debug, Default)]
pub struct ReplyParser {
    values: Option<Vec<Item>>,
}

/// A reply line copied out of the buffer
enum Line {
    Value {
        key: String,
        flags: u32,
        len: usize,
        cas: Option<u64>,
    },
    End,
    Single(Reply),
}

impl ReplyParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to parse one complete reply from the front of `buf`
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Reply>> {
        loop {
            let line_len = match find_crlf(buf) {
                Some(n) => n,
                None => {
                    if buf.len() > MAX_LINE_LENGTH {
                        self.reset();
                        return Err(Error::Protocol(format!(
                            "reply line exceeds {} bytes",
                            MAX_LINE_LENGTH
                        )));
                    }
                    return Ok(None);
                }
            };

            let line = match parse_line(&buf[..line_len]) {
                Ok(line) => line,
                Err(e) => {
                    self.reset();
                    return Err(e);
                }
            };

            match line {
                Line::Value {
                    key,
                    flags,
                    len,
                    cas,
                } => {
                    let total = match (line_len + 2)
                        .checked_add(len)
                        .and_then(|n| n.checked_add(2))
                    {
                        Some(total) => total,
                        None => {
                            self.reset();
                            return Err(Error::Protocol(format!(
                                "data block for '{}' overflows the buffer size",
                                key
                            )));
                        }
                    };
                    if buf.len() < total {
                        return Ok(None);
                    }
                    if &buf[total - 2..total] != CRLF {
                        self.reset();
                        return Err(Error::Protocol(format!(
                            "data block for '{}' is not terminated by CRLF",
                            key
                        )));
                    }

                    buf.advance(line_len + 2);
                    let data = buf.split_to(len).freeze();
                    buf.advance(2);

                    self.values.get_or_insert_with(Vec::new).push(Item {
                        key,
                        flags,
                        data,
                        cas,
                    });
                }
                Line::End => {
                    buf.advance(line_len + 2);
                    return Ok(Some(Reply::Values(self.values.take().unwrap_or_default())));
                }
                Line::Single(reply) => {
                    if self.values.is_some() {
                        self.reset();
                        return Err(Error::Protocol(format!(
                            "unexpected {} inside a retrieval reply",
                            reply.name()
                        )));
                    }
                    buf.advance(line_len + 2);
                    return Ok(Some(reply));
                }
            }
        }
    }

    /// True while part of a retrieval reply has been consumed
    pub fn in_progress(&self) -> bool {
        self.values.is_some()
    }

    /// Drop any partially assembled reply
    pub fn reset(&mut self) {
        self.values = None;
    }
}

/// Length of the first line in `buf`, excluding its CRLF
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

fn parse_line(raw: &[u8]) -> Result<Line> {
    let line = std::str::from_utf8(raw)
        .map_err(|_| Error::Protocol("reply line is not valid UTF-8".to_string()))?;

    let (word, rest) = match line.split_once(' ') {
        Some((w, r)) => (w, r),
        None => (line, ""),
    };

    let reply = match word {
        "VALUE" => return parse_value_header(rest),
        "END" => return Ok(Line::End),
        "STORED" => Reply::Stored,
        "NOT_STORED" => Reply::NotStored,
        "EXISTS" => Reply::Exists,
        "NOT_FOUND" => Reply::NotFound,
        "DELETED" => Reply::Deleted,
        "TOUCHED" => Reply::Touched,
        "OK" => Reply::Ok,
        "VERSION" => Reply::Version(rest.to_string()),
        "ERROR" => Reply::Error,
        "CLIENT_ERROR" => Reply::ClientError(rest.to_string()),
        "SERVER_ERROR" => Reply::ServerError(rest.to_string()),
        _ if !line.is_empty() && line.trim_end().bytes().all(|b| b.is_ascii_digit()) => {
            let n = line
                .trim_end()
                .parse::<u64>()
                .map_err(|e| Error::Protocol(format!("invalid counter value '{}': {}", line, e)))?;
            Reply::Number(n)
        }
        _ => {
            return Err(Error::Protocol(format!(
                "unexpected reply line '{}'",
                line.escape_debug()
            )))
        }
    };

    Ok(Line::Single(reply))
}

fn parse_value_header(rest: &str) -> Result<Line> {
    let mut fields = rest.split(' ');
    let malformed = || Error::Protocol(format!("malformed VALUE header 'VALUE {}'", rest));

    let key = fields.next().filter(|k| !k.is_empty()).ok_or_else(malformed)?;
    let flags = fields
        .next()
        .and_then(|f| f.parse::<u32>().ok())
        .ok_or_else(malformed)?;
    let len = fields
        .next()
        .and_then(|l| l.parse::<usize>().ok())
        .ok_or_else(malformed)?;
    if len > MAX_DATA_LENGTH {
        return Err(Error::Protocol(format!(
            "VALUE header for '{}' announces {} bytes (max {})",
            key, len, MAX_DATA_LENGTH
        )));
    }
    let cas = match fields.next() {
        Some(c) => Some(c.parse::<u64>().map_err(|_| malformed())?),
        None => None,
    };
    if fields.next().is_some() {
        return Err(malformed());
    }

    Ok(Line::Value {
        key: key.to_string(),
        flags,
        len,
        cas,
    })
}

// =============================================================================
// Stream-based I/O helpers
// =============================================================================

/// Write a command to a stream
pub fn write_command<W: Write>(writer: &mut W, command: &Command) -> Result<()> {
    writer.write_all(&encode_command(command))?;
    writer.flush()?;
    Ok(())
}

/// Read one complete reply from a stream
///
/// Blocks until a complete reply is received or an error occurs.
pub fn read_reply<R: Read>(reader: &mut R) -> Result<Reply> {
    let mut parser = ReplyParser::new();
    let mut buf = BytesMut::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        if let Some(reply) = parser.parse(&mut buf)? {
            return Ok(reply);
        }
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            return Err(Error::Connectivity(
                "connection closed before a complete reply".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}
