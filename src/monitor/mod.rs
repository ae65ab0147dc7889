//! Replication cluster monitor.
//!
//! One monitor instance runs on its own task, polls its servers every
//! `monitor_interval`, rebuilds the topology, elects the master and
//! publishes status bits the routers read. Cluster-modifying operations
//! (failover, switchover, rejoin) run inside the monitor loop; an admin
//! posts manual commands through a mailbox drained at the top of each tick.

mod failover;
mod info;
mod topology;

pub use info::{GtidList, ServerInfo, SlaveConnection};
pub use topology::{elect_master, find_cycles, TopologyNode};

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendConnection, BackendTimeouts};
use crate::config::MonitorConfig;
use crate::server::{Server, ServerStatus};

/// Result of a manual monitor command, JSON for the admin surface
pub type CommandResult = Result<serde_json::Value, String>;

/// Manual commands posted into the monitor loop
pub enum MonitorCommand {
    Failover {
        reply: oneshot::Sender<CommandResult>,
    },
    Switchover {
        new_master: Option<String>,
        old_master: Option<String>,
        reply: oneshot::Sender<CommandResult>,
    },
    Rejoin {
        server: String,
        reply: oneshot::Sender<CommandResult>,
    },
    ResetReplication {
        master: Option<String>,
        reply: oneshot::Sender<CommandResult>,
    },
}

/// Shared handle to a running monitor, stored in the registry
pub struct MonitorHandle {
    pub name: String,
    config: RwLock<MonitorConfig>,
    servers: RwLock<Vec<Arc<Server>>>,
    command_tx: RwLock<Option<mpsc::Sender<MonitorCommand>>>,
    cancel: CancellationToken,
}

impl MonitorHandle {
    /// A handle without a running loop, for bootstrap and tests
    pub fn detached(name: impl Into<String>, servers: Vec<Arc<Server>>) -> Self {
        Self {
            name: name.into(),
            config: RwLock::new(MonitorConfig {
                module: "mariadbmon".to_string(),
                user: String::new(),
                password: String::new(),
                servers: vec![],
                monitor_interval_ms: 2000,
                failcount: 5,
                auto_failover: false,
                auto_rejoin: false,
                verify_master_failure: false,
                master_failure_timeout_s: 10,
                failover_timeout_s: 90,
                switchover_timeout_s: 90,
                excluded_servers: vec![],
                promotion_sql_file: None,
                passive: false,
                enforce_simple_topology: false,
                ignore_external_masters: false,
                assume_unique_hostnames: true,
                cluster_operation_disable_timer_s: 0,
            }),
            servers: RwLock::new(servers),
            command_tx: RwLock::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn servers(&self) -> Vec<Arc<Server>> {
        self.servers.read().clone()
    }

    pub fn config(&self) -> MonitorConfig {
        self.config.read().clone()
    }

    pub fn update_config(&self, config: MonitorConfig) {
        *self.config.write() = config;
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn execute(&self, build: impl FnOnce(oneshot::Sender<CommandResult>) -> MonitorCommand) -> CommandResult {
        let tx = self
            .command_tx
            .read()
            .clone()
            .ok_or_else(|| format!("Monitor '{}' is not running", self.name))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(build(reply_tx))
            .await
            .map_err(|_| "Monitor loop has stopped".to_string())?;
        reply_rx
            .await
            .map_err(|_| "Monitor dropped the command".to_string())?
    }

    pub async fn failover(&self) -> CommandResult {
        self.execute(|reply| MonitorCommand::Failover { reply }).await
    }

    pub async fn switchover(
        &self,
        new_master: Option<String>,
        old_master: Option<String>,
    ) -> CommandResult {
        self.execute(|reply| MonitorCommand::Switchover {
            new_master,
            old_master,
            reply,
        })
        .await
    }

    pub async fn rejoin(&self, server: String) -> CommandResult {
        self.execute(|reply| MonitorCommand::Rejoin { server, reply }).await
    }

    pub async fn reset_replication(&self, master: Option<String>) -> CommandResult {
        self.execute(|reply| MonitorCommand::ResetReplication { master, reply })
            .await
    }
}

/// Spawn a monitor task and return its handle
pub fn spawn_monitor(
    name: impl Into<String>,
    config: MonitorConfig,
    servers: Vec<Arc<Server>>,
) -> Arc<MonitorHandle> {
    let name = name.into();
    let (tx, rx) = mpsc::channel(8);

    let handle = Arc::new(MonitorHandle {
        name: name.clone(),
        config: RwLock::new(config.clone()),
        servers: RwLock::new(servers.clone()),
        command_tx: RwLock::new(Some(tx)),
        cancel: CancellationToken::new(),
    });

    let cancel = handle.cancel.clone();
    let loop_handle = handle.clone();
    tokio::spawn(async move {
        let mut monitor = MariadbMonitor::new(name, loop_handle, servers, rx);
        monitor.run(cancel).await;
    });

    handle
}

/// Per-server monitor state
struct MonitoredServer {
    server: Arc<Server>,
    conn: Option<BackendConnection>,
    info: ServerInfo,
}

impl MonitoredServer {
    fn new(server: Arc<Server>) -> Self {
        Self {
            server,
            conn: None,
            info: ServerInfo::default(),
        }
    }

    fn endpoint_matches(&self, host: &str, port: u16) -> bool {
        match &self.server.endpoint {
            crate::server::Endpoint::Tcp { host: h, port: p } => h == host && *p == port,
            crate::server::Endpoint::Unix { .. } => false,
        }
    }
}

/// The MariaDB replication monitor loop
pub(crate) struct MariadbMonitor {
    name: String,
    handle: Arc<MonitorHandle>,
    servers: Vec<MonitoredServer>,
    command_rx: mpsc::Receiver<MonitorCommand>,
    master: Option<usize>,
    last_cluster_operation: Option<Instant>,
}

impl MariadbMonitor {
    fn new(
        name: String,
        handle: Arc<MonitorHandle>,
        servers: Vec<Arc<Server>>,
        command_rx: mpsc::Receiver<MonitorCommand>,
    ) -> Self {
        Self {
            name,
            handle,
            servers: servers.into_iter().map(MonitoredServer::new).collect(),
            command_rx,
            master: None,
            last_cluster_operation: None,
        }
    }

    fn config(&self) -> MonitorConfig {
        self.handle.config()
    }

    async fn run(&mut self, cancel: CancellationToken) {
        let interval = Duration::from_millis(self.config().monitor_interval_ms);
        info!(monitor = %self.name, interval_ms = interval.as_millis() as u64, "Monitor started");

        // Stagger start so co-located monitors don't probe in lockstep
        use rand::Rng;
        let jitter = rand::thread_rng().gen_range(0..interval.as_millis().max(1) as u64);
        tokio::time::sleep(Duration::from_millis(jitter)).await;

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(monitor = %self.name, "Monitor stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    async fn tick(&mut self) {
        // Manual commands run first, with fresh topology from last tick
        while let Ok(command) = self.command_rx.try_recv() {
            self.handle_command(command).await;
        }

        self.update_server_info().await;
        self.update_topology();

        let config = self.config();
        if config.auto_failover && self.master_failure_confirmed() && self.operations_allowed() {
            info!(monitor = %self.name, "Master failure confirmed, starting automatic failover");
            match self.do_failover().await {
                Ok(new_master) => {
                    info!(monitor = %self.name, new_master = %new_master, "Automatic failover complete");
                    self.last_cluster_operation = Some(Instant::now());
                }
                Err(e) => warn!(monitor = %self.name, error = %e, "Automatic failover failed"),
            }
        }

        if config.auto_rejoin && self.operations_allowed() {
            self.auto_rejoin().await;
        }
    }

    async fn handle_command(&mut self, command: MonitorCommand) {
        match command {
            MonitorCommand::Failover { reply } => {
                let result = if !self.operations_allowed() {
                    Err(self.gating_error())
                } else {
                    self.update_server_info().await;
                    self.update_topology();
                    self.do_failover().await.map(|new_master| {
                        self.last_cluster_operation = Some(Instant::now());
                        serde_json::json!({ "new_master": new_master })
                    })
                };
                let _ = reply.send(result);
            }
            MonitorCommand::Switchover {
                new_master,
                old_master,
                reply,
            } => {
                let result = if !self.operations_allowed() {
                    Err(self.gating_error())
                } else {
                    self.update_server_info().await;
                    self.update_topology();
                    self.do_switchover(new_master, old_master).await.map(|new_master| {
                        self.last_cluster_operation = Some(Instant::now());
                        serde_json::json!({ "new_master": new_master })
                    })
                };
                let _ = reply.send(result);
            }
            MonitorCommand::Rejoin { server, reply } => {
                let result = if !self.operations_allowed() {
                    Err(self.gating_error())
                } else {
                    self.do_rejoin(&server).await.map(|_| {
                        serde_json::json!({ "rejoined": server })
                    })
                };
                let _ = reply.send(result);
            }
            MonitorCommand::ResetReplication { master, reply } => {
                let result = if !self.operations_allowed() {
                    Err(self.gating_error())
                } else {
                    self.do_reset_replication(master).await.map(|m| {
                        serde_json::json!({ "master": m })
                    })
                };
                let _ = reply.send(result);
            }
        }
    }

    /// Cluster-modifying operations are gated on monitor mode and timing.
    ///
    /// `assume_unique_hostnames` is a requirement of the automatic
    /// operations; manual commands stay available without it.
    fn operations_allowed(&self) -> bool {
        let config = self.config();
        if config.passive {
            return false;
        }
        if !config.assume_unique_hostnames && (config.auto_failover || config.auto_rejoin) {
            return false;
        }
        if let Some(last) = self.last_cluster_operation {
            if last.elapsed() < Duration::from_secs(config.cluster_operation_disable_timer_s) {
                return false;
            }
        }
        true
    }

    fn gating_error(&self) -> String {
        let config = self.config();
        if config.passive {
            format!("Monitor '{}' is in passive mode", self.name)
        } else if !config.assume_unique_hostnames && (config.auto_failover || config.auto_rejoin) {
            "auto_failover and auto_rejoin require assume_unique_hostnames".to_string()
        } else {
            "Cluster operations temporarily disabled after previous operation".to_string()
        }
    }

    /// Poll every server, refreshing stale connections
    async fn update_server_info(&mut self) {
        let config = self.config();
        let timeouts = BackendTimeouts {
            connect: Duration::from_millis(config.monitor_interval_ms.min(3000)),
            read: Duration::from_millis(config.monitor_interval_ms.max(2000)),
            write: Duration::from_millis(config.monitor_interval_ms.max(2000)),
        };

        for ms in &mut self.servers {
            if ms.conn.as_ref().map(|c| c.is_broken()).unwrap_or(true) {
                let addr = ms.server.endpoint.to_string();
                match BackendConnection::connect(&addr, &config.user, &config.password, None, timeouts)
                    .await
                {
                    Ok(conn) => ms.conn = Some(conn),
                    Err(e) => {
                        debug!(monitor = %self.name, server = %ms.server.name, error = %e, "Monitor connect failed");
                        ms.conn = None;
                    }
                }
            }

            let probed = match ms.conn.as_mut() {
                Some(conn) => info::probe_server(conn).await,
                None => Err(crate::backend::ConnectionError::Disconnected),
            };

            match probed {
                Ok(mut new_info) => {
                    new_info.fail_count = 0;
                    new_info.io_disconnected_since = ms.info.io_disconnected_since;
                    ms.info = new_info;

                    if !ms.info.version.is_empty() {
                        let (maj, min, patch) = parse_version(&ms.info.version);
                        ms.server.set_version(maj, min, patch, &ms.info.version);
                    }
                }
                Err(e) => {
                    debug!(monitor = %self.name, server = %ms.server.name, error = %e, "Monitor probe failed");
                    ms.conn = None;
                    ms.info.reachable = false;
                    ms.info.fail_count = ms.info.fail_count.saturating_add(1);
                }
            }
        }

        // Track how long each slave's IO thread has been away from the
        // current master, for verify_master_failure
        if let Some(master_idx) = self.master {
            let (mhost, mport) = match &self.servers[master_idx].server.endpoint {
                crate::server::Endpoint::Tcp { host, port } => (host.clone(), *port),
                crate::server::Endpoint::Unix { .. } => return,
            };
            for (i, ms) in self.servers.iter_mut().enumerate() {
                if i == master_idx || !ms.info.reachable {
                    continue;
                }
                let connected = ms.info.is_replicating_from(&mhost, mport);
                if connected {
                    ms.info.io_disconnected_since = None;
                } else if ms.info.has_slave_connection_to(&mhost, mport)
                    && ms.info.io_disconnected_since.is_none()
                {
                    ms.info.io_disconnected_since = Some(Instant::now());
                }
            }
        }
    }

    /// Rebuild the topology graph, elect the master and publish status bits
    fn update_topology(&mut self) {
        let nodes = self.build_nodes();
        let elected = topology::elect_master(&nodes, self.master);

        if elected != self.master {
            match (self.master, elected) {
                (Some(old), Some(new)) => info!(
                    monitor = %self.name,
                    old_master = %self.servers[old].server.name,
                    new_master = %self.servers[new].server.name,
                    "Master changed"
                ),
                (None, Some(new)) => info!(
                    monitor = %self.name,
                    master = %self.servers[new].server.name,
                    "Master selected"
                ),
                (Some(old), None) => warn!(
                    monitor = %self.name,
                    old_master = %self.servers[old].server.name,
                    "No master available"
                ),
                (None, None) => {}
            }
        }

        let prev_master = self.master;
        self.master = elected;

        for (i, ms) in self.servers.iter().enumerate() {
            let mut status = ServerStatus::empty();
            let old_status = ms.server.status();

            // Maintenance is operator-owned; the monitor preserves it
            if old_status.contains(ServerStatus::MAINTENANCE) {
                status |= ServerStatus::MAINTENANCE;
            }
            if old_status.contains(ServerStatus::DRAINING) {
                status |= ServerStatus::DRAINING;
            }

            if ms.info.reachable {
                status |= ServerStatus::RUNNING;
            }
            if matches!(ms.info.disk_space_free_ratio, Some(ratio) if ratio < 0.05) {
                status |= ServerStatus::DISK_SPACE_EXHAUSTED;
            }

            if Some(i) == elected {
                status |= ServerStatus::MASTER;
            } else if ms.info.reachable
                && elected
                    .map(|m| self.replicates_transitively(&nodes, i, m))
                    .unwrap_or(false)
            {
                status |= ServerStatus::SLAVE;
                // A slave that itself feeds other slaves is a relay
                if nodes.iter().any(|n| n.masters.contains(&i)) {
                    status |= ServerStatus::RELAY;
                }
            }

            // The deposed master keeps a trace of its old role
            let was_master_before = old_status
                .intersects(ServerStatus::MASTER | ServerStatus::WAS_MASTER)
                || prev_master == Some(i);
            if was_master_before && Some(i) != elected {
                status |= ServerStatus::WAS_MASTER;
            }

            ms.server.set_status(status);
            ms.server
                .set_replication_lag(ms.info.replication_lag().unwrap_or(if Some(i) == elected {
                    0
                } else {
                    -1
                }));
        }
    }

    fn replicates_transitively(&self, nodes: &[TopologyNode], from: usize, to: usize) -> bool {
        let mut visited = vec![false; nodes.len()];
        let mut queue = vec![from];
        while let Some(v) = queue.pop() {
            if v == to {
                return true;
            }
            if visited[v] {
                continue;
            }
            visited[v] = true;
            queue.extend(nodes[v].masters.iter().copied());
        }
        false
    }

    fn build_nodes(&self) -> Vec<TopologyNode> {
        self.servers
            .iter()
            .map(|ms| {
                let mut masters = Vec::new();
                let mut has_external_master = false;
                for sc in &ms.info.slave_connections {
                    let target = self
                        .servers
                        .iter()
                        .position(|other| other.endpoint_matches(&sc.master_host, sc.master_port));
                    match target {
                        Some(idx) if sc.io_running || sc.sql_running => masters.push(idx),
                        Some(_) => {}
                        None => has_external_master = true,
                    }
                }
                TopologyNode {
                    name: ms.server.name.clone(),
                    reachable: ms.info.reachable,
                    in_maintenance: ms.server.is_in_maintenance(),
                    read_only: ms.info.read_only,
                    rank: ms.server.rank(),
                    was_master: ms.server.status().contains(ServerStatus::WAS_MASTER),
                    masters,
                    has_external_master,
                }
            })
            .collect()
    }

    /// Master has been down `failcount` consecutive loops, and (when
    /// verification is on) every surviving slave's IO thread has been
    /// disconnected from it for at least `master_failure_timeout`.
    fn master_failure_confirmed(&self) -> bool {
        let config = self.config();
        let Some(master_idx) = self.master else {
            return false;
        };
        let master = &self.servers[master_idx];
        if master.info.reachable || master.info.fail_count < config.failcount {
            return false;
        }

        if config.verify_master_failure {
            let timeout = Duration::from_secs(config.master_failure_timeout_s);
            for (i, ms) in self.servers.iter().enumerate() {
                if i == master_idx || !ms.info.reachable {
                    continue;
                }
                match ms.info.io_disconnected_since {
                    Some(since) if since.elapsed() >= timeout => {}
                    // A slave still attached (or too recently detached)
                    // means the master may only be unreachable to us
                    _ => return false,
                }
            }
        }

        true
    }
}

fn parse_version(version: &str) -> (u16, u16, u16) {
    let numeric: String = version
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let mut parts = numeric.split('.');
    let major = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (major, minor, patch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("10.6.11-MariaDB-log"), (10, 6, 11));
        assert_eq!(parse_version("8.0.32"), (8, 0, 32));
        assert_eq!(parse_version("garbage"), (0, 0, 0));
    }

    #[test]
    fn test_detached_handle_rejects_commands() {
        let handle = MonitorHandle::detached("repl", vec![]);
        let result = futures::executor::block_on(handle.failover());
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("not running"));
    }

    fn test_monitor(handle: Arc<MonitorHandle>) -> MariadbMonitor {
        let (_tx, rx) = mpsc::channel(1);
        MariadbMonitor::new("repl".to_string(), handle, vec![], rx)
    }

    #[test]
    fn test_unique_hostnames_only_gates_auto_operations() {
        let handle = Arc::new(MonitorHandle::detached("repl", vec![]));
        let mut config = handle.config();
        config.assume_unique_hostnames = false;
        handle.update_config(config.clone());

        // Manual commands stay available when the auto-features are off
        let monitor = test_monitor(handle.clone());
        assert!(monitor.operations_allowed());

        config.auto_failover = true;
        handle.update_config(config.clone());
        assert!(!monitor.operations_allowed());

        config.auto_failover = false;
        config.auto_rejoin = true;
        handle.update_config(config.clone());
        assert!(!monitor.operations_allowed());

        // With the requirement satisfied the gate opens again
        config.assume_unique_hostnames = true;
        handle.update_config(config);
        assert!(monitor.operations_allowed());
    }

    #[test]
    fn test_passive_blocks_all_operations() {
        let handle = Arc::new(MonitorHandle::detached("repl", vec![]));
        let mut config = handle.config();
        config.passive = true;
        handle.update_config(config);

        let monitor = test_monitor(handle);
        assert!(!monitor.operations_allowed());
        assert!(monitor.gating_error().contains("passive"));
    }
}
