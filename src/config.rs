//! Configuration for memcast
//!
//! Centralized configuration with sensible defaults. A client is built
//! from a list of servers plus the pool and protocol limits below.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default memcached port
pub const DEFAULT_PORT: u16 = 11211;

/// Address of one memcached server
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

impl ServerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One configured server with its ring weight
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub addr: ServerAddr,

    /// Relative share of the key space (number of ring points multiplier)
    pub weight: u32,
}

impl ServerConfig {
    pub fn new(addr: ServerAddr, weight: u32) -> Self {
        Self { addr, weight }
    }
}

/// Parses `host`, `host:port` or `host:port:weight`
impl FromStr for ServerConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().split(':');
        let host = parts
            .next()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::Config(format!("missing host in '{}'", s)))?;

        let port = match parts.next() {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| Error::Config(format!("invalid port in '{}'", s)))?,
            None => DEFAULT_PORT,
        };

        let weight = match parts.next() {
            Some(w) => w
                .parse::<u32>()
                .map_err(|_| Error::Config(format!("invalid weight in '{}'", s)))?,
            None => 1,
        };

        if parts.next().is_some() {
            return Err(Error::Config(format!("unexpected trailing segment in '{}'", s)));
        }

        Ok(Self::new(ServerAddr::new(host, port), weight))
    }
}

/// Main configuration for a memcast client
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Topology
    // -------------------------------------------------------------------------
    /// Servers making up the hash ring
    pub servers: Vec<ServerConfig>,

    /// Virtual nodes per unit of weight
    pub points_per_weight: u32,

    /// Route keys of dead servers to the next live ring point instead of
    /// failing fast
    pub fallback_routing: bool,

    // -------------------------------------------------------------------------
    // Health
    // -------------------------------------------------------------------------
    /// Consecutive connection failures before a server is marked dead
    pub failure_threshold: u32,

    /// Delay before the first retry probe of a dead server
    pub retry_delay: Duration,

    /// Upper bound for the exponential retry backoff
    pub max_retry_delay: Duration,

    /// Probes before a dead server is given up on (None = retry forever)
    pub max_retries: Option<u32>,

    /// How often deadlines are swept and retry probes scheduled
    pub maintenance_interval: Duration,

    // -------------------------------------------------------------------------
    // Network
    // -------------------------------------------------------------------------
    /// Timeout for establishing a connection
    pub connect_timeout: Duration,

    /// Optional deadline applied to every command
    pub command_timeout: Option<Duration>,

    /// How long `end()` waits for outstanding replies
    pub shutdown_timeout: Duration,

    // -------------------------------------------------------------------------
    // Protocol Limits
    // -------------------------------------------------------------------------
    /// Maximum key length in bytes
    pub max_key_size: usize,

    /// Maximum encoded value size in bytes
    pub max_value_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            points_per_weight: 160,
            fallback_routing: false,
            failure_threshold: 5,
            retry_delay: Duration::from_secs(30),
            max_retry_delay: Duration::from_secs(30 * 60),
            max_retries: None,
            maintenance_interval: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(5),
            command_timeout: None,
            shutdown_timeout: Duration::from_secs(5),
            max_key_size: 250,
            max_value_size: 1024 * 1024, // 1 MB
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Single-server shorthand
    pub fn single(server: &str) -> Result<Config> {
        Config::builder().server(server).build()
    }

    /// Multi-server shorthand, every server with weight 1 unless the
    /// string carries one
    pub fn multi<I, S>(servers: I) -> Result<Config>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        servers
            .into_iter()
            .fold(Config::builder(), |builder, s| builder.server(s.as_ref()))
            .build()
    }

    /// Check the configuration for values the pool cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::Config("at least one server is required".to_string()));
        }
        for server in &self.servers {
            if server.weight == 0 {
                return Err(Error::Config(format!("server {} has zero weight", server.addr)));
            }
        }
        for (i, server) in self.servers.iter().enumerate() {
            if self.servers[..i].iter().any(|s| s.addr == server.addr) {
                return Err(Error::Config(format!("server {} listed twice", server.addr)));
            }
        }
        if self.points_per_weight == 0 {
            return Err(Error::Config("points_per_weight must be positive".to_string()));
        }
        if self.failure_threshold == 0 {
            return Err(Error::Config("failure_threshold must be positive".to_string()));
        }
        if self.maintenance_interval.is_zero() {
            return Err(Error::Config("maintenance_interval must be positive".to_string()));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
    error: Option<Error>,
}

impl ConfigBuilder {
    /// Add a server given as `host[:port[:weight]]`
    pub fn server(mut self, server: &str) -> Self {
        match server.parse::<ServerConfig>() {
            Ok(s) => self.config.servers.push(s),
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
        self
    }

    /// Add a server with an explicit weight
    pub fn weighted_server(mut self, host: impl Into<String>, port: u16, weight: u32) -> Self {
        self.config
            .servers
            .push(ServerConfig::new(ServerAddr::new(host, port), weight));
        self
    }

    pub fn points_per_weight(mut self, points: u32) -> Self {
        self.config.points_per_weight = points;
        self
    }

    /// Opt into redirecting keys of dead servers to live neighbours
    pub fn fallback_routing(mut self, enabled: bool) -> Self {
        self.config.fallback_routing = enabled;
        self
    }

    pub fn failure_threshold(mut self, failures: u32) -> Self {
        self.config.failure_threshold = failures;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.config.max_retry_delay = delay;
        self
    }

    pub fn max_retries(mut self, retries: Option<u32>) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.config.maintenance_interval = interval;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.command_timeout = timeout;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn max_key_size(mut self, size: usize) -> Self {
        self.config.max_key_size = size;
        self
    }

    pub fn max_value_size(mut self, size: usize) -> Self {
        self.config.max_value_size = size;
        self
    }

    pub fn build(self) -> Result<Config> {
        if let Some(e) = self.error {
            return Err(e);
        }
        self.config.validate()?;
        Ok(self.config)
    }
}
