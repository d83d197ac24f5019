//! Server health records
//!
//! ```text
//!            failures >= threshold
//!   Alive ─────────────────────────▶ Dead ◀──────┐
//!     ▲                               │          │ probe failed
//!     │ probe succeeded               │ backoff  │
//!     └──────────────── Retrying ◀────┘ elapsed ─┘
//! ```

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::{Config, ServerAddr};

/// Routing health of a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Alive,
    Dead,
    /// A retry probe is in flight
    Retrying,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Health::Alive => "alive",
            Health::Dead => "dead",
            Health::Retrying => "retrying",
        };
        f.write_str(s)
    }
}

/// Thresholds and backoff for health transitions
#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    pub failure_threshold: u32,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub max_retries: Option<u32>,
}

impl HealthPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            retry_delay: config.retry_delay,
            max_retry_delay: config.max_retry_delay,
            max_retries: config.max_retries,
        }
    }

    /// `retry_delay * 2^attempts`, capped at `max_retry_delay`
    pub fn backoff(&self, attempts: u32) -> Duration {
        self.retry_delay
            .saturating_mul(2u32.saturating_pow(attempts))
            .min(self.max_retry_delay)
    }
}

/// Point-in-time copy of a server's health
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub health: Health,
    pub failures: u32,
    pub last_failure: Option<Instant>,

    /// When the next retry probe may run
    pub retry_at: Option<Instant>,

    pub retry_attempts: u32,

    /// Retries exhausted; never probed again
    pub permanently_dead: bool,
}

impl Default for ServerStatus {
    fn default() -> Self {
        Self {
            health: Health::Alive,
            failures: 0,
            last_failure: None,
            retry_at: None,
            retry_attempts: 0,
            permanently_dead: false,
        }
    }
}

/// A configured server and its health
#[derive(Debug)]
pub struct Server {
    addr: ServerAddr,
    weight: u32,
    status: Mutex<ServerStatus>,
}

impl Server {
    pub fn new(addr: ServerAddr, weight: u32) -> Self {
        Self {
            addr,
            weight,
            status: Mutex::new(ServerStatus::default()),
        }
    }

    pub fn addr(&self) -> &ServerAddr {
        &self.addr
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn health(&self) -> Health {
        self.status.lock().health
    }

    pub fn status(&self) -> ServerStatus {
        self.status.lock().clone()
    }

    /// Count a connection failure; returns `true` if the server just died
    pub fn record_failure(&self, now: Instant, policy: &HealthPolicy) -> bool {
        let mut status = self.status.lock();
        status.failures = status.failures.saturating_add(1);
        status.last_failure = Some(now);

        if status.health == Health::Alive && status.failures >= policy.failure_threshold {
            status.health = Health::Dead;
            status.retry_attempts = 0;
            status.retry_at = Some(now + policy.backoff(0));
            return true;
        }
        false
    }

    /// A connection was established
    pub fn record_success(&self) {
        let mut status = self.status.lock();
        if status.health == Health::Alive {
            status.failures = 0;
        }
    }

    /// Move a dead server whose backoff has elapsed to `Retrying`
    ///
    /// Returns `true` if the caller should run a probe.
    pub fn begin_probe(&self, now: Instant) -> bool {
        let mut status = self.status.lock();
        match (status.health, status.retry_at) {
            (Health::Dead, Some(at)) if at <= now && !status.permanently_dead => {
                status.health = Health::Retrying;
                true
            }
            _ => false,
        }
    }

    /// Promote to `Alive`; returns `true` if the health changed
    pub fn probe_succeeded(&self) -> bool {
        let mut status = self.status.lock();
        let changed = status.health != Health::Alive;
        *status = ServerStatus::default();
        changed
    }

    /// Back to `Dead` with a longer backoff, or permanently dead once
    /// retries are exhausted
    pub fn probe_failed(&self, now: Instant, policy: &HealthPolicy) {
        let mut status = self.status.lock();
        status.health = Health::Dead;
        status.last_failure = Some(now);
        status.retry_attempts = status.retry_attempts.saturating_add(1);

        match policy.max_retries {
            Some(max) if status.retry_attempts >= max => {
                status.permanently_dead = true;
                status.retry_at = None;
            }
            _ => status.retry_at = Some(now + policy.backoff(status.retry_attempts)),
        }
    }
}
