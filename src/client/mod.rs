//! Client Module
//!
//! The public entry point. Routes every operation to the server owning
//! its key and turns protocol replies into typed results.
//!
//! ## Responsibilities
//! - Validate keys and encode values before anything is sent
//! - Resolve the owning server through the pool
//! - Split multi-key gets per server and aggregate the replies
//! - Refuse new work after `end()`
//!
//! Every operation exists in two forms: one returning a [`Pending`]
//! handle and a `*_with` form taking a callback. Either way the result is
//! delivered exactly once. A command that fails before reaching a
//! connection (invalid key, dead server, client ended) completes on the
//! calling thread.

mod multi;
mod pending;

pub use multi::{MultiGet, ServerFailure};
pub use pending::{Callback, Pending};

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use self::multi::AggregationContext;
use crate::config::{Config, ServerAddr};
use crate::error::{Error, Result};
use crate::network::{Completion, PendingCommand, TcpTransport, Transport};
use crate::pool::{Health, ServerPool};
use crate::protocol::{encode_command, validate_key, Command, Reply, StoreMode};
use crate::value::{self, Value};

/// Longest TTL memcached treats as relative; larger values are unix times
pub const MAX_RELATIVE_TTL: u32 = 60 * 60 * 24 * 30;

/// A memcached client over a pool of servers
pub struct Client {
    pool: Arc<ServerPool>,
    ended: AtomicBool,
}

impl Client {
    /// Connect over TCP
    ///
    /// Connections are opened lazily, on the first command routed to
    /// each server.
    pub fn connect(config: Config) -> Result<Self> {
        Self::with_transport(config, Arc::new(TcpTransport))
    }

    /// Use a custom transport
    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        let servers = config.servers.len();
        let pool = ServerPool::new(config, transport)?;
        tracing::info!("memcast client v{} over {} servers", crate::VERSION, servers);

        Ok(Self {
            pool,
            ended: AtomicBool::new(false),
        })
    }

    // =========================================================================
    // Storage
    // =========================================================================

    /// Store `value` under `key` for `ttl` seconds (0 = no expiry)
    pub fn set(&self, key: &str, value: impl Into<Value>, ttl: u32) -> Pending<bool> {
        self.pending(|cb| self.store_with(StoreMode::Set, key, value.into(), ttl, cb))
    }

    pub fn set_with<F>(&self, key: &str, value: impl Into<Value>, ttl: u32, callback: F)
    where
        F: FnOnce(Result<bool>) + Send + 'static,
    {
        self.store_with(StoreMode::Set, key, value.into(), ttl, Box::new(callback))
    }

    /// Store only if `key` does not exist yet
    pub fn add(&self, key: &str, value: impl Into<Value>, ttl: u32) -> Pending<bool> {
        self.pending(|cb| self.store_with(StoreMode::Add, key, value.into(), ttl, cb))
    }

    pub fn add_with<F>(&self, key: &str, value: impl Into<Value>, ttl: u32, callback: F)
    where
        F: FnOnce(Result<bool>) + Send + 'static,
    {
        self.store_with(StoreMode::Add, key, value.into(), ttl, Box::new(callback))
    }

    /// Store only if `key` already exists
    pub fn replace(&self, key: &str, value: impl Into<Value>, ttl: u32) -> Pending<bool> {
        self.pending(|cb| self.store_with(StoreMode::Replace, key, value.into(), ttl, cb))
    }

    pub fn replace_with<F>(&self, key: &str, value: impl Into<Value>, ttl: u32, callback: F)
    where
        F: FnOnce(Result<bool>) + Send + 'static,
    {
        self.store_with(StoreMode::Replace, key, value.into(), ttl, Box::new(callback))
    }

    /// Append the encoded payload to an existing item; its flag is kept
    pub fn append(&self, key: &str, value: impl Into<Value>) -> Pending<bool> {
        self.pending(|cb| self.store_with(StoreMode::Append, key, value.into(), 0, cb))
    }

    pub fn append_with<F>(&self, key: &str, value: impl Into<Value>, callback: F)
    where
        F: FnOnce(Result<bool>) + Send + 'static,
    {
        self.store_with(StoreMode::Append, key, value.into(), 0, Box::new(callback))
    }

    /// Prepend the encoded payload to an existing item; its flag is kept
    pub fn prepend(&self, key: &str, value: impl Into<Value>) -> Pending<bool> {
        self.pending(|cb| self.store_with(StoreMode::Prepend, key, value.into(), 0, cb))
    }

    pub fn prepend_with<F>(&self, key: &str, value: impl Into<Value>, callback: F)
    where
        F: FnOnce(Result<bool>) + Send + 'static,
    {
        self.store_with(StoreMode::Prepend, key, value.into(), 0, Box::new(callback))
    }

    fn store_with(&self, mode: StoreMode, key: &str, value: Value, ttl: u32, callback: Callback<bool>) {
        let (data, flags) = match value::encode(&value) {
            Ok(encoded) => encoded,
            Err(e) => return callback(Err(e)),
        };

        let max = self.pool.config().max_value_size;
        if data.len() > max {
            return callback(Err(Error::ValueTooLarge(format!(
                "{} bytes for '{}' exceeds the {} byte limit",
                data.len(),
                key,
                max
            ))));
        }

        let command = Command::Store {
            mode,
            key: key.to_string(),
            flags,
            exptime: expiry(ttl),
            data,
        };

        self.dispatch(command, callback, |reply| match reply {
            Reply::Stored => Ok(true),
            Reply::NotStored | Reply::Exists | Reply::NotFound => Ok(false),
            other => Err(unexpected(&other, "storage")),
        })
    }

    // =========================================================================
    // Retrieval
    // =========================================================================

    /// Value stored under `key`, `None` on a miss
    pub fn get(&self, key: &str) -> Pending<Option<Value>> {
        self.pending(|cb| self.get_with(key, cb))
    }

    pub fn get_with<F>(&self, key: &str, callback: F)
    where
        F: FnOnce(Result<Option<Value>>) + Send + 'static,
    {
        let wanted = key.to_string();
        let command = Command::Get {
            keys: vec![key.to_string()],
        };

        self.dispatch(command, Box::new(callback), move |reply| match reply {
            Reply::Values(items) => items
                .into_iter()
                .find(|item| item.key == wanted)
                .map(|item| value::decode(item.data, item.flags))
                .transpose(),
            other => Err(unexpected(&other, "get")),
        })
    }

    /// Values of several keys, fetched with one `get` per server
    pub fn get_multi<I, S>(&self, keys: I) -> Pending<MultiGet>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.pending(|cb| self.get_multi_with(keys, cb))
    }

    pub fn get_multi_with<I, S, F>(&self, keys: I, callback: F)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: FnOnce(Result<MultiGet>) + Send + 'static,
    {
        if let Err(e) = self.check_open() {
            return callback(Err(e));
        }

        let mut seen = HashSet::new();
        let requested: Vec<String> = keys
            .into_iter()
            .map(|k| k.as_ref().to_string())
            .filter(|k| seen.insert(k.clone()))
            .collect();

        let mut result = MultiGet::new(requested.clone());
        let mut by_server: BTreeMap<ServerAddr, Vec<String>> = BTreeMap::new();
        let mut unroutable: BTreeMap<ServerAddr, (Vec<String>, Error)> = BTreeMap::new();

        for key in requested {
            if let Err(e) = validate_key(&key, self.pool.config().max_key_size) {
                result.fail_key(key, e);
                continue;
            }
            match self.pool.route(&key) {
                Ok(addr) => by_server.entry(addr).or_default().push(key),
                Err(e) => match self.pool.owner(&key) {
                    Some(owner) => unroutable
                        .entry(owner.clone())
                        .or_insert_with(|| (Vec::new(), e))
                        .0
                        .push(key),
                    None => result.fail_key(key, e),
                },
            }
        }

        for (server, (keys, error)) in unroutable {
            result.fail_server(server, keys, error);
        }

        tracing::trace!("multi-get fanned out to {} servers", by_server.len());

        let Some(context) = AggregationContext::start(result, by_server.len(), Box::new(callback)) else {
            return;
        };

        for (addr, keys) in by_server {
            let ctx = Arc::clone(&context);
            let server = addr.clone();
            let sub_keys = keys.clone();
            let completion: Completion = Box::new(move |reply| ctx.merge(&server, sub_keys, reply));
            self.send(&addr, Command::Get { keys }, completion);
        }
    }

    // =========================================================================
    // Deletion and Counters
    // =========================================================================

    /// Delete `key`; `false` if it did not exist
    pub fn delete(&self, key: &str) -> Pending<bool> {
        self.pending(|cb| self.delete_with(key, cb))
    }

    pub fn delete_with<F>(&self, key: &str, callback: F)
    where
        F: FnOnce(Result<bool>) + Send + 'static,
    {
        let command = Command::Delete {
            key: key.to_string(),
        };
        self.dispatch(command, Box::new(callback), |reply| match reply {
            Reply::Deleted => Ok(true),
            Reply::NotFound => Ok(false),
            other => Err(unexpected(&other, "delete")),
        })
    }

    /// Increment a numeric value; `None` if `key` does not exist
    pub fn incr(&self, key: &str, delta: u64) -> Pending<Option<u64>> {
        self.pending(|cb| self.incr_with(key, delta, cb))
    }

    pub fn incr_with<F>(&self, key: &str, delta: u64, callback: F)
    where
        F: FnOnce(Result<Option<u64>>) + Send + 'static,
    {
        let command = Command::Incr {
            key: key.to_string(),
            delta,
        };
        self.dispatch(command, Box::new(callback), counter_reply)
    }

    /// Decrement a numeric value (memcached stops at zero); `None` if
    /// `key` does not exist
    pub fn decr(&self, key: &str, delta: u64) -> Pending<Option<u64>> {
        self.pending(|cb| self.decr_with(key, delta, cb))
    }

    pub fn decr_with<F>(&self, key: &str, delta: u64, callback: F)
    where
        F: FnOnce(Result<Option<u64>>) + Send + 'static,
    {
        let command = Command::Decr {
            key: key.to_string(),
            delta,
        };
        self.dispatch(command, Box::new(callback), counter_reply)
    }

    /// Reset the expiry of `key`; `false` if it does not exist
    pub fn touch(&self, key: &str, ttl: u32) -> Pending<bool> {
        self.pending(|cb| self.touch_with(key, ttl, cb))
    }

    pub fn touch_with<F>(&self, key: &str, ttl: u32, callback: F)
    where
        F: FnOnce(Result<bool>) + Send + 'static,
    {
        let command = Command::Touch {
            key: key.to_string(),
            exptime: expiry(ttl),
        };
        self.dispatch(command, Box::new(callback), |reply| match reply {
            Reply::Touched => Ok(true),
            Reply::NotFound => Ok(false),
            other => Err(unexpected(&other, "touch")),
        })
    }

    // =========================================================================
    // Server-wide
    // =========================================================================

    /// Invalidate every item on every alive server
    ///
    /// Reports one result per configured server.
    pub fn flush_all(&self) -> Pending<Vec<(ServerAddr, Result<()>)>> {
        let (pending, callback) = Pending::channel();
        if let Err(e) = self.check_open() {
            callback(Err(e));
            return pending;
        }

        let servers = self.pool.server_addrs();
        let outstanding = Arc::new(AtomicUsize::new(servers.len()));
        let results = Arc::new(Mutex::new(Vec::with_capacity(servers.len())));
        let done = Arc::new(Mutex::new(Some(callback)));

        for addr in servers {
            let outstanding = Arc::clone(&outstanding);
            let results = Arc::clone(&results);
            let done = Arc::clone(&done);
            let server = addr.clone();

            let completion: Completion = Box::new(move |reply| {
                let result = reply.and_then(|r| match r {
                    Reply::Ok => Ok(()),
                    other => Err(unexpected(&other, "flush_all")),
                });
                results.lock().push((server, result));

                if outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let mut all = std::mem::take(&mut *results.lock());
                    all.sort_by(|a, b| a.0.cmp(&b.0));
                    if let Some(cb) = done.lock().take() {
                        cb(Ok(all));
                    }
                }
            });

            match self.pool.health(&addr) {
                Some(Health::Alive) => {
                    self.send(&addr, Command::FlushAll { delay: None }, completion)
                }
                health => completion(Err(Error::Connectivity(format!(
                    "server {} is {}",
                    addr,
                    health.map_or_else(|| "unknown".to_string(), |h| h.to_string())
                )))),
            }
        }

        pending
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Release every connection
    ///
    /// Waits up to `shutdown_timeout` for outstanding replies. Operations
    /// issued afterwards fail with `Error::Shutdown`.
    pub fn end(&self) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("Ending client");
        self.pool.shutdown(self.pool.config().shutdown_timeout);
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// The server pool (health and routing introspection)
    pub fn pool(&self) -> &ServerPool {
        &self.pool
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn check_open(&self) -> Result<()> {
        if self.is_ended() {
            Err(Error::Shutdown)
        } else {
            Ok(())
        }
    }

    fn pending<T, F>(&self, issue: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(Callback<T>),
    {
        let (pending, callback) = Pending::channel();
        issue(callback);
        pending
    }

    /// Route a single-key command and hand its reply to `interpret`
    fn dispatch<T, F>(&self, command: Command, callback: Callback<T>, interpret: F)
    where
        T: 'static,
        F: FnOnce(Reply) -> Result<T> + Send + 'static,
    {
        if let Err(e) = self.check_open() {
            return callback(Err(e));
        }

        let key = match command.keys().first() {
            Some(key) => key.to_string(),
            None => return callback(Err(Error::InvalidKey("command has no key".to_string()))),
        };
        if let Err(e) = validate_key(&key, self.pool.config().max_key_size) {
            return callback(Err(e));
        }

        let addr = match self.pool.route(&key) {
            Ok(addr) => addr,
            Err(e) => return callback(Err(e)),
        };

        self.send(
            &addr,
            command,
            Box::new(move |reply| callback(reply.and_then(interpret))),
        );
    }

    /// Enqueue an encoded command on the connection to `addr`
    fn send(&self, addr: &ServerAddr, command: Command, completion: Completion) {
        let conn = match self.pool.connection(addr) {
            Ok(conn) => conn,
            Err(e) => return completion(Err(e)),
        };

        let deadline = self
            .pool
            .config()
            .command_timeout
            .map(|timeout| Instant::now() + timeout);
        let bytes = encode_command(&command);
        let keys = command.keys().into_iter().map(str::to_string).collect();

        conn.enqueue(
            PendingCommand::new(command.command_type(), keys, completion).with_deadline(deadline),
            bytes,
        );
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.end();
    }
}

fn counter_reply(reply: Reply) -> Result<Option<u64>> {
    match reply {
        Reply::Number(n) => Ok(Some(n)),
        Reply::NotFound => Ok(None),
        other => Err(unexpected(&other, "incr/decr")),
    }
}

fn unexpected(reply: &Reply, operation: &str) -> Error {
    Error::Protocol(format!("unexpected {} reply to {}", reply.name(), operation))
}

/// Relative TTLs beyond 30 days must be sent as absolute unix times
fn expiry(ttl: u32) -> u32 {
    if ttl <= MAX_RELATIVE_TTL {
        return ttl;
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    u32::try_from(now + u64::from(ttl)).unwrap_or(u32::MAX)
}
