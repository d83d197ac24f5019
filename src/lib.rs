//! # memcast
//!
//! A memcached client for the ASCII protocol with:
//! - Consistent-hash routing over weighted servers
//! - Pipelined connections with strict FIFO reply matching
//! - Typed values that survive the round trip (string, number, JSON, binary)
//! - Multi-key gets fanned out per server and aggregated
//! - Server health tracking with backoff and retry probes
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Client                               │
//! │        (get / set / delete / incr / decr / multi-get)        │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ route(key)
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                      Server Pool                             │
//! │          (hash rings, health, lazy connections)              │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │ Connection  │   ...    │ Connection  │
//!   │ (FIFO queue)│          │ (FIFO queue)│
//!   └──────┬──────┘          └──────┬──────┘
//!          │                        │
//!          ▼                        ▼
//!   ┌─────────────────────────────────────┐
//!   │   Protocol Codec  +  Value Codec    │
//!   └─────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use memcast::{Client, Config};
//!
//! let client = Client::connect(Config::single("127.0.0.1:11211")?)?;
//! assert!(client.set("greeting", "hello", 60).wait()?);
//! let value = client.get("greeting").wait()?;
//! assert_eq!(value.as_ref().and_then(|v| v.as_str()), Some("hello"));
//! client.end();
//! # Ok::<(), memcast::Error>(())
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod value;
pub mod protocol;
pub mod network;
pub mod pool;
pub mod client;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Error, Result};
pub use config::{Config, ServerAddr, ServerConfig};
pub use value::Value;
pub use client::{Client, MultiGet, Pending, ServerFailure};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of memcast
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
