//! Backend server objects.
//!
//! A `Server` is shared between services, monitors and live backend
//! sessions through an `Arc`; the monitor thread owns status-bit updates
//! while routers read them. Destruction is deferred: `deactivate` marks the
//! server inactive and the last reference dropping frees it.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::RwLock;
use serde::Deserialize;

bitflags! {
    /// Server status bitset, published by monitors and read by routers
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ServerStatus: u32 {
        const RUNNING = 1;
        const MASTER = 1 << 1;
        const SLAVE = 1 << 2;
        const MAINTENANCE = 1 << 3;
        const DRAINING = 1 << 4;
        const AUTH_ERROR = 1 << 5;
        const RELAY = 1 << 6;
        const WAS_MASTER = 1 << 7;
        const DISK_SPACE_EXHAUSTED = 1 << 8;
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = vec![];
        if self.contains(ServerStatus::MAINTENANCE) {
            parts.push("Maintenance");
        }
        if self.contains(ServerStatus::MASTER) {
            parts.push("Master");
        }
        if self.contains(ServerStatus::SLAVE) {
            parts.push("Slave");
        }
        if self.contains(ServerStatus::RELAY) {
            parts.push("Relay Master");
        }
        if self.contains(ServerStatus::DRAINING) {
            parts.push("Draining");
        }
        if self.contains(ServerStatus::AUTH_ERROR) {
            parts.push("Auth Error");
        }
        if self.contains(ServerStatus::WAS_MASTER) {
            parts.push("Was Master");
        }
        if self.contains(ServerStatus::RUNNING) {
            parts.push("Running");
        } else {
            parts.push("Down");
        }
        write!(f, "{}", parts.join(", "))
    }
}

/// Network endpoint of a server
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix { socket: String },
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Endpoint::Unix { socket } => write!(f, "{}", socket),
        }
    }
}

/// Per-server counters, updated with relaxed atomics
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Currently open backend connections
    pub connections: AtomicUsize,
    /// Total sessions ever routed here
    pub total_sessions: AtomicU64,
    /// Requests currently in flight
    pub current_ops: AtomicUsize,
}

/// Exponentially decaying average of backend response times, feeding the
/// adaptive slave-selection criterion.
#[derive(Debug)]
pub struct ResponseTimeAverage {
    average_us: RwLock<f64>,
}

impl Default for ResponseTimeAverage {
    fn default() -> Self {
        Self {
            average_us: RwLock::new(0.0),
        }
    }
}

impl ResponseTimeAverage {
    const ALPHA: f64 = 0.04;

    pub fn observe(&self, micros: f64) {
        let mut avg = self.average_us.write();
        if *avg == 0.0 {
            *avg = micros;
        } else {
            *avg = *avg * (1.0 - Self::ALPHA) + micros * Self::ALPHA;
        }
    }

    pub fn average_us(&self) -> f64 {
        *self.average_us.read()
    }
}

/// A backend database server
#[derive(Debug)]
pub struct Server {
    pub name: String,
    pub endpoint: Endpoint,
    pub protocol: String,
    status: AtomicU32,
    /// (major, minor, patch) packed; 0 until the monitor has seen it
    version: AtomicU64,
    version_string: RwLock<String>,
    /// Seconds behind master, -1 when unknown
    replication_lag: AtomicI64,
    /// Priority tier; lower is preferred
    rank: AtomicI32,
    /// Deprecated weighting, accepted and ignored
    weight: AtomicI32,
    active: AtomicBool,
    pub stats: ServerStats,
    pub response_time: ResponseTimeAverage,
}

pub const RANK_PRIMARY: i32 = 1;
pub const RANK_SECONDARY: i32 = 2;

impl Server {
    pub fn new(name: impl Into<String>, endpoint: Endpoint) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            endpoint,
            protocol: "mariadb".to_string(),
            status: AtomicU32::new(0),
            version: AtomicU64::new(0),
            version_string: RwLock::new(String::new()),
            replication_lag: AtomicI64::new(-1),
            rank: AtomicI32::new(RANK_PRIMARY),
            weight: AtomicI32::new(0),
            active: AtomicBool::new(true),
            stats: ServerStats::default(),
            response_time: ResponseTimeAverage::default(),
        })
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus::from_bits_truncate(self.status.load(Ordering::Relaxed))
    }

    pub fn set_status(&self, status: ServerStatus) {
        self.status.store(status.bits(), Ordering::Relaxed);
    }

    pub fn add_status(&self, bits: ServerStatus) {
        self.status.fetch_or(bits.bits(), Ordering::Relaxed);
    }

    pub fn clear_status(&self, bits: ServerStatus) {
        self.status.fetch_and(!bits.bits(), Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.status().contains(ServerStatus::RUNNING)
    }

    pub fn is_master(&self) -> bool {
        let s = self.status();
        s.contains(ServerStatus::RUNNING | ServerStatus::MASTER)
            && !s.contains(ServerStatus::MAINTENANCE)
    }

    pub fn is_slave(&self) -> bool {
        let s = self.status();
        s.contains(ServerStatus::RUNNING | ServerStatus::SLAVE)
            && !s.contains(ServerStatus::MAINTENANCE)
    }

    /// Usable for new connections: running, not in maintenance, not draining
    pub fn is_usable(&self) -> bool {
        let s = self.status();
        s.contains(ServerStatus::RUNNING)
            && !s.intersects(ServerStatus::MAINTENANCE | ServerStatus::DRAINING)
    }

    pub fn is_in_maintenance(&self) -> bool {
        self.status().contains(ServerStatus::MAINTENANCE)
    }

    pub fn replication_lag(&self) -> i64 {
        self.replication_lag.load(Ordering::Relaxed)
    }

    pub fn set_replication_lag(&self, seconds: i64) {
        self.replication_lag.store(seconds, Ordering::Relaxed);
    }

    pub fn rank(&self) -> i32 {
        self.rank.load(Ordering::Relaxed)
    }

    pub fn set_rank(&self, rank: i32) {
        self.rank.store(rank, Ordering::Relaxed);
    }

    pub fn weight(&self) -> i32 {
        self.weight.load(Ordering::Relaxed)
    }

    pub fn set_weight(&self, weight: i32) {
        self.weight.store(weight, Ordering::Relaxed);
    }

    pub fn version(&self) -> (u16, u16, u16) {
        let v = self.version.load(Ordering::Relaxed);
        (
            ((v >> 32) & 0xFFFF) as u16,
            ((v >> 16) & 0xFFFF) as u16,
            (v & 0xFFFF) as u16,
        )
    }

    pub fn set_version(&self, major: u16, minor: u16, patch: u16, full: &str) {
        let packed = ((major as u64) << 32) | ((minor as u64) << 16) | patch as u64;
        self.version.store(packed, Ordering::Relaxed);
        *self.version_string.write() = full.to_string();
    }

    pub fn version_string(&self) -> String {
        self.version_string.read().clone()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Mark for destruction; the object is freed when the last backend
    /// session drops its Arc
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Relaxed);
        self.set_status(ServerStatus::empty());
    }

    pub fn connection_opened(&self) {
        self.stats.connections.fetch_add(1, Ordering::Relaxed);
        self.stats.total_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.stats.connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn op_started(&self) {
        self.stats.current_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn op_finished(&self) {
        self.stats.current_ops.fetch_sub(1, Ordering::Relaxed);
    }
}
