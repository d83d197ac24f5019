//! Connection
//!
//! One stream to one server with an ordered queue of in-flight commands.
//!
//! ## Locking
//! - `writer` serializes "push onto the queue, then write the bytes", so
//!   the queue order is always the wire order.
//! - `state` guards the queue and the receive buffer. The I/O thread
//!   only needs this lock, so a slow socket write never stalls reply
//!   processing.
//!
//! Lock order is `writer` then `state`. Completion callbacks run after
//! both are released, so a callback may safely issue new commands or
//! close the connection.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::mem;
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};

use super::transport::{Stream, Transport};
use crate::config::ServerAddr;
use crate::error::{Error, Result};
use crate::protocol::{CommandType, Reply, ReplyParser};

/// Bytes read from the stream per syscall
const READ_CHUNK: usize = 16 * 1024;

/// Receives the reply (or failure) of one command, exactly once
pub type Completion = Box<dyn FnOnce(Result<Reply>) + Send + 'static>;

/// Health notifications from a connection to whoever owns it
pub trait ConnectionObserver: Send + Sync {
    fn connection_established(&self, addr: &ServerAddr);

    /// Called once per connection, when it fails without being asked to close
    fn connection_failed(&self, addr: &ServerAddr, error: &Error);
}

// =============================================================================
// Pending Command
// =============================================================================

/// A command waiting for its reply
pub struct PendingCommand {
    kind: CommandType,
    keys: Vec<String>,
    deadline: Option<Instant>,
    completion: Option<Completion>,
}

impl PendingCommand {
    pub fn new(kind: CommandType, keys: Vec<String>, completion: Completion) -> Self {
        Self {
            kind,
            keys,
            deadline: None,
            completion: Some(completion),
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn kind(&self) -> CommandType {
        self.kind
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Already completed with a timeout; its reply will be discarded
    pub fn is_expired(&self) -> bool {
        self.completion.is_none()
    }

    fn take_completion(&mut self) -> Option<Completion> {
        self.completion.take()
    }

    fn complete(mut self, result: Result<Reply>) {
        if let Some(completion) = self.take_completion() {
            completion(result);
        }
    }
}

impl std::fmt::Debug for PendingCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCommand")
            .field("kind", &self.kind)
            .field("keys", &self.keys)
            .field("deadline", &self.deadline)
            .field("expired", &self.is_expired())
            .finish()
    }
}

// =============================================================================
// Connection
// =============================================================================

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Stream not established yet; writes go to the outbox
    Connecting,
    Open,
    /// Graceful close requested; no new commands accepted
    Draining,
    Closed,
}

struct WriteHalf {
    stream: Option<Box<dyn Stream>>,

    /// Commands written before the stream was established, in order
    outbox: Vec<Bytes>,
}

struct Inflight {
    phase: Phase,
    queue: VecDeque<PendingCommand>,
    buffer: BytesMut,
    parser: ReplyParser,
}

/// A pipelined connection to one memcached server
pub struct Connection {
    addr: ServerAddr,
    writer: Mutex<WriteHalf>,
    state: Mutex<Inflight>,

    /// Signalled whenever the queue becomes empty
    drained: Condvar,

    observer: Arc<dyn ConnectionObserver>,

    /// The thread reading replies; completions run on it
    io_thread: OnceLock<ThreadId>,
    self_ref: Weak<Connection>,
}

impl Connection {
    /// Create a connection and start its I/O thread
    ///
    /// Commands can be enqueued immediately; they are written once the
    /// stream is established.
    pub fn open(
        addr: ServerAddr,
        transport: Arc<dyn Transport>,
        connect_timeout: Duration,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Result<Arc<Self>> {
        let conn = Arc::new_cyclic(|self_ref| Self {
            addr: addr.clone(),
            writer: Mutex::new(WriteHalf {
                stream: None,
                outbox: Vec::new(),
            }),
            state: Mutex::new(Inflight {
                phase: Phase::Connecting,
                queue: VecDeque::new(),
                buffer: BytesMut::with_capacity(READ_CHUNK),
                parser: ReplyParser::new(),
            }),
            drained: Condvar::new(),
            observer,
            io_thread: OnceLock::new(),
            self_ref: self_ref.clone(),
        });

        let io = Arc::clone(&conn);
        thread::Builder::new()
            .name(format!("memcast-{}", addr))
            .spawn(move || io.run(transport, connect_timeout))
            .map_err(|e| Error::Connectivity(format!("failed to spawn I/O thread: {}", e)))?;

        Ok(conn)
    }

    /// Queue a command and write its encoded bytes
    ///
    /// The command is completed with an error right away if the
    /// connection no longer accepts commands.
    pub fn enqueue(&self, command: PendingCommand, bytes: Bytes) {
        let mut writer = self.writer.lock();
        {
            let mut state = self.state.lock();
            let refused = match state.phase {
                Phase::Draining => Some(Error::Shutdown),
                Phase::Closed => Some(Error::Connectivity(format!(
                    "connection to {} is closed",
                    self.addr
                ))),
                Phase::Connecting | Phase::Open => None,
            };
            if let Some(error) = refused {
                drop(state);
                drop(writer);
                command.complete(Err(error));
                return;
            }
            tracing::trace!("{} <- {} {:?}", self.addr, command.kind.as_str(), command.keys);
            state.queue.push_back(command);
        }

        let half = &mut *writer;
        let written = match half.stream.as_mut() {
            Some(stream) => stream.write_all(&bytes).and_then(|_| stream.flush()),
            None => {
                half.outbox.push(bytes);
                Ok(())
            }
        };

        if let Err(e) = written {
            drop(writer);
            self.teardown(e.into(), false);
        }
    }

    /// Feed inbound bytes and complete every command whose reply is now whole
    pub fn on_data(&self, bytes: &[u8]) {
        let mut completed: Vec<(Completion, Result<Reply>)> = Vec::new();
        let mut desync = None;

        {
            let mut state = self.state.lock();
            state.buffer.extend_from_slice(bytes);

            loop {
                let Inflight {
                    buffer,
                    parser,
                    queue,
                    ..
                } = &mut *state;

                match parser.parse(buffer) {
                    Ok(Some(reply)) => match queue.pop_front() {
                        Some(mut command) => {
                            tracing::trace!("{} -> {} for {}", self.addr, reply.name(), command.kind.as_str());
                            match command.take_completion() {
                                Some(completion) => completed.push((completion, reply.into_result())),
                                None => tracing::debug!(
                                    "{}: discarding late {} reply for expired {}",
                                    self.addr,
                                    reply.name(),
                                    command.kind.as_str()
                                ),
                            }
                        }
                        None => {
                            desync = Some(Error::Protocol(format!(
                                "unsolicited {} reply from {}",
                                reply.name(),
                                self.addr
                            )));
                            break;
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        desync = Some(e);
                        break;
                    }
                }
            }

            if state.queue.is_empty() {
                self.drained.notify_all();
            }
        }

        for (completion, result) in completed {
            completion(result);
        }

        if let Some(error) = desync {
            tracing::warn!("{}: reply stream out of sync: {}", self.addr, error);
            self.teardown(error, false);
            return;
        }

        // A close requested from a completion finishes once the last reply is in
        let finished = {
            let state = self.state.lock();
            state.phase == Phase::Draining && state.queue.is_empty()
        };
        if finished {
            tracing::debug!("{}: drained, closing", self.addr);
            self.teardown(Error::Shutdown, true);
        }
    }

    /// The server closed the stream
    pub fn on_close(&self) {
        self.teardown(
            Error::Connectivity(format!("connection to {} closed by server", self.addr)),
            false,
        );
    }

    /// The stream reported an error
    pub fn on_error(&self, error: Error) {
        self.teardown(error, false);
    }

    /// Fail every command whose deadline is at or before `now`
    ///
    /// Expired commands keep their queue slot so that their late reply is
    /// consumed in order. Returns how many commands timed out.
    pub fn expire(&self, now: Instant) -> usize {
        let expired: Vec<(Completion, CommandType)> = {
            let mut state = self.state.lock();
            state
                .queue
                .iter_mut()
                .filter(|c| c.deadline.map_or(false, |d| d <= now))
                .filter_map(|c| c.take_completion().map(|done| (done, c.kind)))
                .collect()
        };

        let count = expired.len();
        for (completion, kind) in expired {
            completion(Err(Error::Timeout(format!(
                "{} on {} got no reply before its deadline",
                kind.as_str(),
                self.addr
            ))));
        }
        count
    }

    /// Deadline of the command at the head of the queue, if it already
    /// timed out
    ///
    /// A server that stopped answering leaves its expired commands at the
    /// front of the queue.
    pub fn overdue_since(&self) -> Option<Instant> {
        let state = self.state.lock();
        state
            .queue
            .front()
            .filter(|c| c.is_expired())
            .and_then(|c| c.deadline)
    }

    /// Stop accepting commands, wait for outstanding replies, then close
    ///
    /// Commands still queued after `timeout` fail with `Error::Shutdown`.
    /// Returns `true` if the queue drained in time.
    ///
    /// Called from a completion callback, i.e. on the thread that reads
    /// the replies, `close` cannot wait. It returns `false` at once and the
    /// connection closes when the last reply arrives or `timeout` passes.
    pub fn close(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let drained = {
            let mut state = self.state.lock();
            if state.phase == Phase::Closed {
                return true;
            }
            state.phase = Phase::Draining;

            if !state.queue.is_empty() && self.on_io_thread() {
                drop(state);
                self.close_at(timeout);
                return false;
            }

            while !state.queue.is_empty() {
                if self.drained.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
            state.queue.is_empty()
        };

        if !drained {
            tracing::warn!("{}: closing with replies still outstanding", self.addr);
        }
        self.teardown(Error::Shutdown, true);
        drained
    }

    /// Close immediately, failing everything queued
    pub fn abort(&self) {
        self.teardown(Error::Shutdown, true);
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn addr(&self) -> &ServerAddr {
        &self.addr
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// Commands awaiting a reply, expired ones included
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == Phase::Closed
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// I/O thread body: connect, flush the outbox, then read until close
    fn run(self: Arc<Self>, transport: Arc<dyn Transport>, connect_timeout: Duration) {
        let _ = self.io_thread.set(thread::current().id());

        let mut reader = match self.establish(transport.as_ref(), connect_timeout) {
            Ok(Some(reader)) => reader,
            Ok(None) => return,
            Err(error) => {
                tracing::warn!("{}: {}", self.addr, error);
                self.teardown(error, false);
                return;
            }
        };

        tracing::debug!("Connection established to {}", self.addr);
        self.observer.connection_established(&self.addr);

        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => {
                    self.on_close();
                    return;
                }
                Ok(n) => self.on_data(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.on_error(e.into());
                    return;
                }
            }
        }
    }

    /// Connect and publish the stream; `None` if closed meanwhile
    fn establish(
        &self,
        transport: &dyn Transport,
        connect_timeout: Duration,
    ) -> Result<Option<Box<dyn Read + Send>>> {
        let mut stream = transport
            .connect(&self.addr, connect_timeout)
            .map_err(|e| Error::Connectivity(format!("connect to {} failed: {}", self.addr, e)))?;
        let reader = stream.reader()?;

        let mut writer = self.writer.lock();
        for bytes in mem::take(&mut writer.outbox) {
            stream.write_all(&bytes)?;
        }
        stream.flush()?;

        let mut state = self.state.lock();
        match state.phase {
            Phase::Closed => {
                let _ = stream.shutdown();
                return Ok(None);
            }
            Phase::Connecting => state.phase = Phase::Open,
            Phase::Open | Phase::Draining => {}
        }
        writer.stream = Some(stream);

        Ok(Some(reader))
    }

    fn on_io_thread(&self) -> bool {
        self.io_thread.get() == Some(&thread::current().id())
    }

    /// Tear down a draining connection once `timeout` passes
    fn close_at(&self, timeout: Duration) {
        let conn = self.self_ref.clone();
        let spawned = thread::Builder::new()
            .name(format!("memcast-drain-{}", self.addr))
            .spawn(move || {
                thread::sleep(timeout);
                if let Some(conn) = conn.upgrade() {
                    if !conn.is_closed() {
                        tracing::warn!("{}: closing with replies still outstanding", conn.addr);
                        conn.teardown(Error::Shutdown, true);
                    }
                }
            });

        if let Err(e) = spawned {
            tracing::warn!("{}: could not wait for outstanding replies: {}", self.addr, e);
            self.teardown(Error::Shutdown, true);
        }
    }

    /// Close the stream and fail every queued command exactly once
    ///
    /// Only unrequested closes are reported to the observer.
    fn teardown(&self, error: Error, requested: bool) {
        let (failed, report) = {
            let mut writer = self.writer.lock();
            if let Some(stream) = writer.stream.take() {
                let _ = stream.shutdown();
            }
            writer.outbox.clear();

            let mut state = self.state.lock();
            let report = !requested && state.phase != Phase::Closed;
            state.phase = Phase::Closed;
            state.buffer.clear();
            state.parser.reset();

            let failed: Vec<Completion> = state
                .queue
                .drain(..)
                .filter_map(|mut c| c.take_completion())
                .collect();
            self.drained.notify_all();

            (failed, report)
        };

        if report {
            tracing::warn!(
                "Connection to {} failed ({} commands affected): {}",
                self.addr,
                failed.len(),
                error
            );
            self.observer.connection_failed(&self.addr, &error);
        } else if !failed.is_empty() {
            tracing::debug!("{}: failing {} queued commands: {}", self.addr, failed.len(), error);
        }

        for completion in failed {
            completion(Err(error.clone()));
        }
    }
}
