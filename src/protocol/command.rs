//! Command definitions
//!
//! Logical commands sent to a memcached server.

use bytes::Bytes;

/// Command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Get,
    Delete,
    Incr,
    Decr,
    Touch,
    Version,
    FlushAll,
}

impl CommandType {
    /// Wire verb for this command
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Set => "set",
            CommandType::Add => "add",
            CommandType::Replace => "replace",
            CommandType::Append => "append",
            CommandType::Prepend => "prepend",
            CommandType::Get => "get",
            CommandType::Delete => "delete",
            CommandType::Incr => "incr",
            CommandType::Decr => "decr",
            CommandType::Touch => "touch",
            CommandType::Version => "version",
            CommandType::FlushAll => "flush_all",
        }
    }
}

/// Storage command variants sharing the `<verb> <key> <flags> <exptime> <bytes>` form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Store unconditionally
    Set,
    /// Store only if the key does not exist
    Add,
    /// Store only if the key exists
    Replace,
    /// Append data to an existing item
    Append,
    /// Prepend data to an existing item
    Prepend,
}

/// A command to send
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Store a payload
    Store {
        mode: StoreMode,
        key: String,
        flags: u32,
        exptime: u32,
        data: Bytes,
    },

    /// Retrieve one or more keys
    Get { keys: Vec<String> },

    /// Delete a key
    Delete { key: String },

    /// Increment a numeric value
    Incr { key: String, delta: u64 },

    /// Decrement a numeric value (memcached clamps at zero)
    Decr { key: String, delta: u64 },

    /// Update the expiration of an item
    Touch { key: String, exptime: u32 },

    /// Ask for the server version (health probe)
    Version,

    /// Invalidate every item, optionally after a delay in seconds
    FlushAll { delay: Option<u32> },
}

impl Command {
    /// Get the command type
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Store { mode, .. } => match mode {
                StoreMode::Set => CommandType::Set,
                StoreMode::Add => CommandType::Add,
                StoreMode::Replace => CommandType::Replace,
                StoreMode::Append => CommandType::Append,
                StoreMode::Prepend => CommandType::Prepend,
            },
            Command::Get { .. } => CommandType::Get,
            Command::Delete { .. } => CommandType::Delete,
            Command::Incr { .. } => CommandType::Incr,
            Command::Decr { .. } => CommandType::Decr,
            Command::Touch { .. } => CommandType::Touch,
            Command::Version => CommandType::Version,
            Command::FlushAll { .. } => CommandType::FlushAll,
        }
    }

    /// Keys this command touches
    pub fn keys(&self) -> Vec<&str> {
        match self {
            Command::Store { key, .. }
            | Command::Delete { key }
            | Command::Incr { key, .. }
            | Command::Decr { key, .. }
            | Command::Touch { key, .. } => vec![key.as_str()],
            Command::Get { keys } => keys.iter().map(String::as_str).collect(),
            Command::Version | Command::FlushAll { .. } => Vec::new(),
        }
    }
}
