//! Protocol Module
//!
//! The memcached ASCII (text) protocol.
//!
//! ## Commands
//! - set / add / replace / append / prepend: `<verb> <key> <flags> <exptime> <bytes>` + data block
//! - get: `get <key>*`
//! - delete, incr, decr, touch
//! - version, flush_all
//!
//! ## Replies
//! - Single line: STORED, NOT_STORED, EXISTS, NOT_FOUND, DELETED, TOUCHED, OK,
//!   VERSION, a decimal number, ERROR, CLIENT_ERROR, SERVER_ERROR
//! - Retrieval: `VALUE` blocks terminated by `END`
//!
//! Every line ends with CRLF. The server answers commands on one
//! connection strictly in the order they were sent.

mod command;
mod response;
mod codec;

pub use command::{Command, CommandType, StoreMode};
pub use response::{Item, Reply};
pub use codec::{
    encode_command, read_reply, validate_key, write_command, ReplyParser, MAX_DATA_LENGTH,
    MAX_LINE_LENGTH,
};
