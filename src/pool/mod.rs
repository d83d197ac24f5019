//! Server Pool
//!
//! Owns the configured servers, the hash rings used to route keys, and
//! one lazily opened connection per server.
//!
//! ## Routing
//! - The *full* ring covers every configured server and never changes.
//! - The *active* ring covers alive servers only. It is rebuilt on every
//!   health transition and published as a fresh `Arc`, so a lookup sees
//!   either the old ring or the new one.
//!
//! By default a key is routed on the full ring and fails fast when its
//! owner is not alive. With fallback routing the active ring is used and
//! keys of a dead server move to its ring neighbours.
//!
//! ## Maintenance
//! A background thread ticks every `maintenance_interval` to expire
//! command deadlines, to drop connections to servers that stopped
//! answering and to launch retry probes for dead servers.

mod ring;
mod server;

pub use ring::{hash_key, HashRing};
pub use server::{Health, HealthPolicy, Server, ServerStatus};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Sender};
use parking_lot::{Mutex, RwLock};

use crate::config::{Config, ServerAddr};
use crate::error::{Error, Result};
use crate::network::{Connection, ConnectionObserver, Transport};
use crate::protocol::{read_reply, write_command, Command, Reply};

/// Servers, rings and connections of one client
pub struct ServerPool {
    config: Config,
    policy: HealthPolicy,
    transport: Arc<dyn Transport>,

    servers: BTreeMap<ServerAddr, Server>,
    full_ring: HashRing,
    active_ring: RwLock<Arc<HashRing>>,

    connections: Mutex<HashMap<ServerAddr, Arc<Connection>>>,
    closed: AtomicBool,

    maintenance: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
    self_ref: Weak<ServerPool>,
}

impl ServerPool {
    /// Build the pool and start its maintenance thread
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        config.validate()?;

        let servers: BTreeMap<ServerAddr, Server> = config
            .servers
            .iter()
            .map(|s| (s.addr.clone(), Server::new(s.addr.clone(), s.weight)))
            .collect();

        let full_ring = HashRing::new(
            config.servers.iter().map(|s| (&s.addr, s.weight)),
            config.points_per_weight,
        );

        let pool = Arc::new_cyclic(|self_ref| Self {
            policy: HealthPolicy::from_config(&config),
            active_ring: RwLock::new(Arc::new(full_ring.clone())),
            full_ring,
            servers,
            transport,
            connections: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            maintenance: Mutex::new(None),
            self_ref: self_ref.clone(),
            config,
        });

        pool.start_maintenance()?;

        tracing::debug!(
            "Server pool ready: {} servers, {} ring points",
            pool.servers.len(),
            pool.full_ring.len()
        );

        Ok(pool)
    }

    // =========================================================================
    // Routing
    // =========================================================================

    /// Server that should handle `key` under the current health state
    pub fn route(&self, key: &str) -> Result<ServerAddr> {
        if self.config.fallback_routing {
            let ring = Arc::clone(&self.active_ring.read());
            return ring
                .route(key)
                .cloned()
                .ok_or_else(|| Error::Connectivity("no servers are alive".to_string()));
        }

        let owner = self
            .full_ring
            .route(key)
            .ok_or_else(|| Error::Connectivity("no servers configured".to_string()))?;

        match self.servers.get(owner).map(Server::health) {
            Some(Health::Alive) => Ok(owner.clone()),
            Some(health) => Err(Error::Connectivity(format!("server {} is {}", owner, health))),
            None => Err(Error::Connectivity(format!("server {} is not in the pool", owner))),
        }
    }

    /// Configured owner of `key`, ignoring health
    pub fn owner(&self, key: &str) -> Option<&ServerAddr> {
        self.full_ring.route(key)
    }

    /// The ring currently used for fallback routing
    pub fn active_ring(&self) -> Arc<HashRing> {
        Arc::clone(&self.active_ring.read())
    }

    pub fn full_ring(&self) -> &HashRing {
        &self.full_ring
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Connection to `addr`, opened on first use
    pub fn connection(&self, addr: &ServerAddr) -> Result<Arc<Connection>> {
        if !self.servers.contains_key(addr) {
            return Err(Error::Connectivity(format!("server {} is not in the pool", addr)));
        }

        let mut connections = self.connections.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        if let Some(conn) = connections.get(addr) {
            if !conn.is_closed() {
                return Ok(Arc::clone(conn));
            }
        }

        let observer: Arc<dyn ConnectionObserver> = Arc::new(PoolObserver {
            pool: self.self_ref.clone(),
        });
        let conn = Connection::open(
            addr.clone(),
            Arc::clone(&self.transport),
            self.config.connect_timeout,
            observer,
        )?;
        connections.insert(addr.clone(), Arc::clone(&conn));

        Ok(conn)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    // =========================================================================
    // Health Transitions
    // =========================================================================

    /// A connection to `addr` failed
    pub fn on_connection_failure(&self, addr: &ServerAddr) {
        let Some(server) = self.servers.get(addr) else {
            return;
        };

        {
            let mut connections = self.connections.lock();
            if connections.get(addr).map_or(false, |c| c.is_closed()) {
                connections.remove(addr);
            }
        }

        if server.record_failure(Instant::now(), &self.policy) {
            let status = server.status();
            tracing::info!(
                "Server {} marked dead after {} failures, retry in {:?}",
                addr,
                status.failures,
                status.retry_at.map(|at| at.saturating_duration_since(Instant::now()))
            );
            self.rebuild_active_ring();
        }
    }

    /// A connection to `addr` was established
    pub fn on_connection_established(&self, addr: &ServerAddr) {
        if let Some(server) = self.servers.get(addr) {
            server.record_success();
        }
    }

    /// A retry probe reached `addr`; the server routes again
    pub fn on_retry_probe_success(&self, addr: &ServerAddr) {
        let Some(server) = self.servers.get(addr) else {
            return;
        };
        if server.probe_succeeded() {
            tracing::info!("Server {} is alive again", addr);
            self.rebuild_active_ring();
        }
    }

    /// A retry probe of `addr` failed
    pub fn on_retry_probe_failure(&self, addr: &ServerAddr, error: &Error) {
        let Some(server) = self.servers.get(addr) else {
            return;
        };
        server.probe_failed(Instant::now(), &self.policy);

        let status = server.status();
        if status.permanently_dead {
            tracing::warn!(
                "Server {} removed after {} failed retries: {}",
                addr,
                status.retry_attempts,
                error
            );
        } else {
            tracing::debug!("Retry probe of {} failed: {}", addr, error);
        }
    }

    fn rebuild_active_ring(&self) {
        let mut active = self.active_ring.write();
        let ring = HashRing::new(
            self.servers
                .values()
                .filter(|s| s.health() == Health::Alive)
                .map(|s| (s.addr(), s.weight())),
            self.config.points_per_weight,
        );
        tracing::debug!("Active ring rebuilt with {} servers", ring.servers().len());
        *active = Arc::new(ring);
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    fn start_maintenance(&self) -> Result<()> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let ticker = channel::tick(self.config.maintenance_interval);
        let pool = self.self_ref.clone();

        let handle = thread::Builder::new()
            .name("memcast-maintenance".to_string())
            .spawn(move || loop {
                crossbeam::select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticker) -> tick => {
                        let (Ok(now), Some(pool)) = (tick, pool.upgrade()) else {
                            break;
                        };
                        pool.maintain(now);
                    }
                }
            })
            .map_err(|e| Error::Connectivity(format!("failed to spawn maintenance thread: {}", e)))?;

        *self.maintenance.lock() = Some((stop_tx, handle));
        Ok(())
    }

    /// Expire overdue commands, drop stalled connections and launch due
    /// retry probes
    ///
    /// A connection is stalled when its oldest command stays unanswered
    /// for another full `command_timeout` after its deadline. Dropping it
    /// counts as a connection failure.
    pub fn maintain(&self, now: Instant) {
        let connections: Vec<Arc<Connection>> = self.connections.lock().values().cloned().collect();
        for conn in connections {
            let expired = conn.expire(now);
            if expired > 0 {
                tracing::debug!("{} commands on {} timed out", expired, conn.addr());
            }

            let (Some(grace), Some(since)) = (self.config.command_timeout, conn.overdue_since())
            else {
                continue;
            };
            let silent = now.saturating_duration_since(since);
            if silent >= grace {
                tracing::warn!(
                    "{} has left a reply outstanding for {:?} past its deadline",
                    conn.addr(),
                    silent
                );
                conn.on_error(Error::Timeout(format!(
                    "{} stopped answering ({} commands queued)",
                    conn.addr(),
                    conn.pending()
                )));
            }
        }

        if self.closed.load(Ordering::Acquire) {
            return;
        }
        for server in self.servers.values() {
            if server.begin_probe(now) {
                self.spawn_probe(server.addr().clone());
            }
        }
    }

    fn spawn_probe(&self, addr: ServerAddr) {
        let pool = self.self_ref.clone();
        let transport = Arc::clone(&self.transport);
        let timeout = self.config.connect_timeout;
        let target = addr.clone();

        tracing::debug!("Probing dead server {}", addr);
        let spawned = thread::Builder::new()
            .name(format!("memcast-probe-{}", addr))
            .spawn(move || {
                let addr = target;
                let result = probe(transport.as_ref(), &addr, timeout);
                let Some(pool) = pool.upgrade() else {
                    return;
                };
                match result {
                    Ok(version) => {
                        tracing::debug!("Probe of {} answered version {}", addr, version);
                        pool.on_retry_probe_success(&addr);
                    }
                    Err(e) => pool.on_retry_probe_failure(&addr, &e),
                }
            });

        if let Err(e) = spawned {
            tracing::warn!("Could not spawn probe thread: {}", e);
            self.on_retry_probe_failure(&addr, &Error::Connectivity(e.to_string()));
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stop maintenance and close every connection gracefully
    ///
    /// All connections share one `timeout` budget.
    pub fn shutdown(&self, timeout: Duration) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some((stop, handle)) = self.maintenance.lock().take() {
            let _ = stop.send(());
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        let deadline = Instant::now() + timeout;
        let connections: Vec<Arc<Connection>> =
            self.connections.lock().drain().map(|(_, c)| c).collect();

        for conn in connections {
            let remaining = deadline.saturating_duration_since(Instant::now());
            conn.close(remaining);
        }

        tracing::debug!("Server pool shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn server_addrs(&self) -> Vec<ServerAddr> {
        self.servers.keys().cloned().collect()
    }

    pub fn status(&self, addr: &ServerAddr) -> Option<ServerStatus> {
        self.servers.get(addr).map(Server::status)
    }

    pub fn health(&self, addr: &ServerAddr) -> Option<Health> {
        self.servers.get(addr).map(Server::health)
    }

    /// Servers currently on the active ring
    pub fn alive_servers(&self) -> Vec<ServerAddr> {
        self.active_ring.read().servers().to_vec()
    }
}

impl Drop for ServerPool {
    fn drop(&mut self) {
        if let Some((stop, _)) = self.maintenance.get_mut().take() {
            let _ = stop.send(());
        }
    }
}

/// Forwards connection events to the pool without keeping it alive
struct PoolObserver {
    pool: Weak<ServerPool>,
}

impl ConnectionObserver for PoolObserver {
    fn connection_established(&self, addr: &ServerAddr) {
        if let Some(pool) = self.pool.upgrade() {
            pool.on_connection_established(addr);
        }
    }

    fn connection_failed(&self, addr: &ServerAddr, _error: &Error) {
        if let Some(pool) = self.pool.upgrade() {
            pool.on_connection_failure(addr);
        }
    }
}

/// Connect and ask for the version; any well-formed answer is healthy
///
/// The answer must arrive within `timeout` as well.
fn probe(transport: &dyn Transport, addr: &ServerAddr, timeout: Duration) -> Result<String> {
    let mut stream = transport
        .connect(addr, timeout)
        .map_err(|e| Error::Connectivity(format!("connect to {} failed: {}", addr, e)))?;
    stream.set_read_timeout(Some(timeout))?;
    let mut reader = stream.reader()?;

    write_command(&mut stream, &Command::Version)?;
    let reply = read_reply(&mut reader);
    let _ = stream.shutdown();

    match reply? {
        Reply::Version(version) => Ok(version),
        other => Err(Error::Protocol(format!(
            "unexpected {} reply to version probe",
            other.name()
        ))),
    }
}
