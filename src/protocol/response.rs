//! Reply definitions
//!
//! Structured replies parsed from the server's byte stream.

use bytes::Bytes;

use crate::error::{Error, Result};

/// One `VALUE` block of a retrieval reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: String,
    pub flags: u32,
    pub data: Bytes,

    /// Present when the server appended a CAS unique
    pub cas: Option<u64>,
}

/// A complete reply to one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Stored,
    NotStored,
    Exists,
    NotFound,
    Deleted,
    Touched,
    Ok,

    /// Every `VALUE` block up to and including the terminating `END`
    Values(Vec<Item>),

    /// New value after `incr`/`decr`
    Number(u64),

    Version(String),

    /// `ERROR`: unknown command
    Error,
    ClientError(String),
    ServerError(String),
}

impl Reply {
    /// Turn error lines into `Err`, pass everything else through
    pub fn into_result(self) -> Result<Reply> {
        match self {
            Reply::Error => Err(Error::Client("server does not know the command".to_string())),
            Reply::ClientError(msg) => Err(Error::Client(msg)),
            Reply::ServerError(msg) => Err(Error::from_server_message(&msg)),
            other => Ok(other),
        }
    }

    /// Short name used in logs and unexpected-reply errors
    pub fn name(&self) -> &'static str {
        match self {
            Reply::Stored => "STORED",
            Reply::NotStored => "NOT_STORED",
            Reply::Exists => "EXISTS",
            Reply::NotFound => "NOT_FOUND",
            Reply::Deleted => "DELETED",
            Reply::Touched => "TOUCHED",
            Reply::Ok => "OK",
            Reply::Values(_) => "VALUE/END",
            Reply::Number(_) => "<number>",
            Reply::Version(_) => "VERSION",
            Reply::Error => "ERROR",
            Reply::ClientError(_) => "CLIENT_ERROR",
            Reply::ServerError(_) => "SERVER_ERROR",
        }
    }
}
