//! Network Module
//!
//! Streams and pipelined connections to memcached servers.
//!
//! ## Architecture
//! - One I/O thread per connection reads replies
//! - Callers write commands directly under the connection's write lock
//! - Replies are matched to commands strictly first-in, first-out

mod transport;
mod connection;

pub use transport::{Stream, TcpTransport, Transport};
pub use connection::{Completion, Connection, ConnectionObserver, PendingCommand, Phase};
