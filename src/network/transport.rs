//! Transport
//!
//! The byte-stream capability the connections are built on. The default
//! implementation is plain TCP; tests and embedders can supply their own.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::config::ServerAddr;

/// An established byte stream to one server
///
/// The stream itself is the write half. `reader` hands out an independent
/// read half for the connection's I/O thread, and `shutdown` must unblock
/// that reader from another thread.
pub trait Stream: Write + Send {
    /// Independent read half of this stream
    fn reader(&self) -> io::Result<Box<dyn Read + Send>>;

    /// Close both directions
    fn shutdown(&self) -> io::Result<()>;

    /// Bound blocking reads on this stream and the read halves it handed out
    ///
    /// `None` blocks forever.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

/// Opens streams to servers
pub trait Transport: Send + Sync + 'static {
    fn connect(&self, addr: &ServerAddr, timeout: Duration) -> io::Result<Box<dyn Stream>>;
}

// =============================================================================
// TCP
// =============================================================================

/// TCP transport with Nagle disabled
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

impl Transport for TcpTransport {
    fn connect(&self, addr: &ServerAddr, timeout: Duration) -> io::Result<Box<dyn Stream>> {
        let mut last_err = None;

        for socket_addr in (addr.host.as_str(), addr.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&socket_addr, timeout) {
                Ok(stream) => {
                    // Disable Nagle's algorithm for low latency
                    stream.set_nodelay(true)?;
                    return Ok(Box::new(stream));
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} did not resolve to any address", addr),
            )
        }))
    }
}

impl Stream for TcpStream {
    fn reader(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout.filter(|t| !t.is_zero()))
    }
}
