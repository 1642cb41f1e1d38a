//! Collaborator interfaces the transport core consumes.
//!
//! None of these are implemented by the engine itself in production; the
//! hosting node wires in its own. The simple implementations here back the
//! engine's defaults and its tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};

use crate::address::Address;
use crate::error::{Result, TransportError};

// ── Time ─────────────────────────────────────────────────────────────────────

/// Monotonic time source for timers and cleanup. Values are offsets from an
/// arbitrary fixed epoch.
pub trait TimeService: Send + Sync {
    fn current_time(&self) -> Duration;
}

/// Wall-clock-independent monotonic time.
#[derive(Debug, Clone)]
pub struct SystemTimeService {
    epoch: Instant,
}

impl SystemTimeService {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemTimeService {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeService for SystemTimeService {
    fn current_time(&self) -> Duration {
        self.epoch.elapsed()
    }
}

/// Time that only moves when told to. Clones share the clock.
#[derive(Debug, Clone, Default)]
pub struct ManualTimeService {
    nanos: Arc<AtomicU64>,
}

impl ManualTimeService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_add(by, Ordering::SeqCst);
    }

    /// Move to `at`. Never moves backwards.
    pub fn set(&self, at: Duration) {
        let at = u64::try_from(at.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_max(at, Ordering::SeqCst);
    }
}

impl TimeService for ManualTimeService {
    fn current_time(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

// ── Connections ──────────────────────────────────────────────────────────────

/// Maps logical addresses to transport-level connection strings.
pub trait ConnectionProvider: Send + Sync {
    fn resolve(&self, address: &Address) -> Option<String>;

    /// Establish (or reuse) a connection and return its connection string.
    fn connect(&self, address: &Address) -> Result<String>;

    fn disconnect(&self, address: &Address);

    fn is_connected(&self, address: &Address) -> bool;
}

/// Fixed routing table. Clones share the table.
#[derive(Debug, Clone, Default)]
pub struct StaticConnectionProvider {
    routes: Arc<DashMap<Address, String>>,
    connected: Arc<DashSet<Address>>,
}

impl StaticConnectionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route(&self, address: Address, connection: impl Into<String>) {
        self.routes.insert(address, connection.into());
    }

    pub fn remove_route(&self, address: &Address) {
        self.routes.remove(address);
        self.connected.remove(address);
    }
}

impl ConnectionProvider for StaticConnectionProvider {
    fn resolve(&self, address: &Address) -> Option<String> {
        self.routes.get(address).map(|r| r.value().clone())
    }

    fn connect(&self, address: &Address) -> Result<String> {
        let connection = self.resolve(address).ok_or_else(|| {
            TransportError::fault(anyhow::anyhow!("no route to {address}"))
        })?;
        if self.connected.insert(address.clone()) {
            tracing::debug!(peer = %address, connection = %connection, "connected");
        }
        Ok(connection)
    }

    fn disconnect(&self, address: &Address) {
        if self.connected.remove(address).is_some() {
            tracing::debug!(peer = %address, "disconnected");
        }
    }

    fn is_connected(&self, address: &Address) -> bool {
        self.connected.contains(address)
    }
}

// ── Liveness & cleanup ───────────────────────────────────────────────────────

/// Membership view: which nodes are currently reachable.
pub trait LiveNodeProvider: Send + Sync {
    fn is_live(&self, node: &Address) -> bool;
}

/// Answers whether pending state addressed to or from `node` may be dropped.
pub trait CleanupManager: Send + Sync {
    fn can_cleanup(&self, node: &Address) -> bool;
}

/// Gives up on exactly the nodes the provider no longer reports as live.
pub struct LiveNodeCleanupManager<P> {
    provider: P,
}

impl<P: LiveNodeProvider> LiveNodeCleanupManager<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }
}

impl<P: LiveNodeProvider> CleanupManager for LiveNodeCleanupManager<P> {
    fn can_cleanup(&self, node: &Address) -> bool {
        !self.provider.is_live(node)
    }
}

/// Never gives up on anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCleanup;

impl CleanupManager for NoCleanup {
    fn can_cleanup(&self, _node: &Address) -> bool {
        false
    }
}

/// Explicitly maintained live set. Clones share the set.
#[derive(Debug, Clone, Default)]
pub struct LiveNodeSet {
    nodes: Arc<DashSet<Address>>,
}

impl LiveNodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, node: Address) {
        self.nodes.insert(node);
    }

    pub fn leave(&self, node: &Address) {
        self.nodes.remove(node);
    }
}

impl LiveNodeProvider for LiveNodeSet {
    fn is_live(&self, node: &Address) -> bool {
        self.nodes.contains(node)
    }
}
