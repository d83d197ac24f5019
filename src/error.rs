//! Error types for memcast
//!
//! Provides a unified error type for all operations. Errors are `Clone`
//! because a single connection failure has to be delivered to every
//! command that was queued on that connection.

use thiserror::Error;

/// Result type alias using Error
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for memcast operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    // -------------------------------------------------------------------------
    // Network Errors
    // -------------------------------------------------------------------------
    /// Socket refused, reset or closed, or the owning server is marked dead
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// The optional per-command deadline passed before a reply arrived
    #[error("Timeout: {0}")]
    Timeout(String),

    // -------------------------------------------------------------------------
    // Protocol Errors
    // -------------------------------------------------------------------------
    /// Malformed or unexpected reply from the server
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server-reported failure (`SERVER_ERROR ...`)
    #[error("Server error: {0}")]
    Server(String),

    /// Server rejected the command (`CLIENT_ERROR ...` or `ERROR`)
    #[error("Client error: {0}")]
    Client(String),

    /// Payload larger than the server or the client accepts
    #[error("Value too large: {0}")]
    ValueTooLarge(String),

    // -------------------------------------------------------------------------
    // Value Errors
    // -------------------------------------------------------------------------
    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Client is shut down")]
    Shutdown,
}

impl Error {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Error::Connectivity(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    pub fn is_value_too_large(&self) -> bool {
        matches!(self, Error::ValueTooLarge(_))
    }

    /// Map a `SERVER_ERROR` message to the matching kind
    pub(crate) fn from_server_message(message: &str) -> Self {
        if message.contains("too large") {
            Error::ValueTooLarge(message.to_string())
        } else {
            Error::Server(message.to_string())
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Error::Timeout(err.to_string())
            }
            _ => Error::Connectivity(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Codec(err.to_string())
    }
}
