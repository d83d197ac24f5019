//! Multi-key retrieval
//!
//! A multi-get is split into one `get` per owning server. Each sub-reply
//! is merged into a shared `AggregationContext`; the caller is completed
//! once, when the last sub-request has finished.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::pending::Callback;
use crate::config::ServerAddr;
use crate::error::{Error, Result};
use crate::protocol::Reply;
use crate::value::{self, Value};

/// Keys that could not be served because their server failed
#[derive(Debug, Clone, PartialEq)]
pub struct ServerFailure {
    pub server: ServerAddr,
    pub keys: Vec<String>,
    pub error: Error,
}

/// Result of a multi-key get
///
/// A requested key ends up in exactly one of three places: `values`
/// (hit), `errors` (its server or its payload failed) or neither (a
/// plain cache miss).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultiGet {
    requested: Vec<String>,
    values: HashMap<String, Value>,
    errors: HashMap<String, Error>,
    failures: Vec<ServerFailure>,
}

impl MultiGet {
    pub(crate) fn new(requested: Vec<String>) -> Self {
        Self {
            requested,
            ..Default::default()
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn values(&self) -> &HashMap<String, Value> {
        &self.values
    }

    pub fn into_values(self) -> HashMap<String, Value> {
        self.values
    }

    /// Why `key` could not be retrieved, if it failed
    pub fn error(&self, key: &str) -> Option<&Error> {
        self.errors.get(key)
    }

    pub fn errors(&self) -> &HashMap<String, Error> {
        &self.errors
    }

    /// Requested, answered by its server, and absent
    pub fn is_miss(&self, key: &str) -> bool {
        self.requested.iter().any(|k| k == key)
            && !self.values.contains_key(key)
            && !self.errors.contains_key(key)
    }

    /// Server-level failures with the keys they affected
    pub fn failures(&self) -> &[ServerFailure] {
        &self.failures
    }

    /// True when every requested key was answered (hit or miss)
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn requested(&self) -> &[String] {
        &self.requested
    }

    /// Number of hits
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Record a failure that affected `keys` on `server`
    pub(crate) fn fail_server(&mut self, server: ServerAddr, keys: Vec<String>, error: Error) {
        for key in &keys {
            self.errors.insert(key.clone(), error.clone());
        }
        self.failures.push(ServerFailure {
            server,
            keys,
            error,
        });
    }

    pub(crate) fn fail_key(&mut self, key: String, error: Error) {
        self.errors.insert(key, error);
    }
}

// =============================================================================
// Aggregation
// =============================================================================

/// Shared state of one multi-get fan-out
pub(crate) struct AggregationContext {
    outstanding: AtomicUsize,
    result: Mutex<MultiGet>,
    done: Mutex<Option<Callback<MultiGet>>>,
}

impl AggregationContext {
    /// Context expecting `subrequests` calls to `merge`
    ///
    /// `result` may already carry per-key failures found before dispatch.
    /// With zero sub-requests the caller is completed immediately.
    pub fn start(result: MultiGet, subrequests: usize, done: Callback<MultiGet>) -> Option<Arc<Self>> {
        if subrequests == 0 {
            done(Ok(result));
            return None;
        }
        Some(Arc::new(Self {
            outstanding: AtomicUsize::new(subrequests),
            result: Mutex::new(result),
            done: Mutex::new(Some(done)),
        }))
    }

    /// Merge one server's sub-reply for `keys`
    pub fn merge(&self, server: &ServerAddr, keys: Vec<String>, reply: Result<Reply>) {
        {
            let mut result = self.result.lock();
            match reply {
                Ok(Reply::Values(items)) => {
                    let wanted: HashSet<&str> = keys.iter().map(String::as_str).collect();
                    for item in items {
                        if !wanted.contains(item.key.as_str()) {
                            tracing::debug!("{} returned unrequested key '{}'", server, item.key);
                            continue;
                        }
                        match value::decode(item.data, item.flags) {
                            Ok(v) => {
                                result.values.insert(item.key, v);
                            }
                            Err(e) => result.fail_key(item.key, e),
                        }
                    }
                }
                Ok(other) => result.fail_server(
                    server.clone(),
                    keys,
                    Error::Protocol(format!("unexpected {} reply to get", other.name())),
                ),
                Err(e) => result.fail_server(server.clone(), keys, e),
            }
        }
        self.finish_one();
    }

    fn finish_one(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let result = mem::take(&mut *self.result.lock());
        if let Some(done) = self.done.lock().take() {
            done(Ok(result));
        }
    }
}
