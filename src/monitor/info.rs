//! Per-server state collected by the monitor each tick.

use std::collections::HashMap;
use std::time::Instant;

use tracing::debug;

use crate::backend::{BackendConnection, ConnectionError};

/// A MariaDB GTID position: `domain-server_id-sequence`, possibly one per
/// replication domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GtidList {
    /// domain -> (server_id, sequence)
    positions: HashMap<u64, (u64, u64)>,
}

impl GtidList {
    /// Parse "0-1-42" or "0-1-42,1-2-100"
    pub fn parse(s: &str) -> Self {
        let mut positions = HashMap::new();
        for part in s.split(',') {
            let fields: Vec<&str> = part.trim().split('-').collect();
            if fields.len() != 3 {
                continue;
            }
            if let (Ok(domain), Ok(server), Ok(seq)) = (
                fields[0].parse::<u64>(),
                fields[1].parse::<u64>(),
                fields[2].parse::<u64>(),
            ) {
                positions.insert(domain, (server, seq));
            }
        }
        Self { positions }
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn sequence(&self, domain: u64) -> Option<u64> {
        self.positions.get(&domain).map(|(_, seq)| *seq)
    }

    pub fn domains(&self) -> impl Iterator<Item = u64> + '_ {
        self.positions.keys().copied()
    }

    /// Ahead of `other` in `domain`: strictly larger sequence, or any
    /// sequence where the other has none.
    pub fn is_ahead_of(&self, other: &GtidList, domain: u64) -> bool {
        match (self.sequence(domain), other.sequence(domain)) {
            (Some(a), Some(b)) => a > b,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// Caught up to `other` in every domain the other has seen
    pub fn has_reached(&self, other: &GtidList) -> bool {
        other.domains().all(|d| {
            match (self.sequence(d), other.sequence(d)) {
                (Some(a), Some(b)) => a >= b,
                _ => false,
            }
        })
    }

}

impl std::fmt::Display for GtidList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts: Vec<(u64, u64, u64)> = self
            .positions
            .iter()
            .map(|(d, (s, q))| (*d, *s, *q))
            .collect();
        parts.sort_unstable();
        let joined = parts
            .iter()
            .map(|(d, s, q)| format!("{}-{}-{}", d, s, q))
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "{}", joined)
    }
}

/// One row of SHOW ALL SLAVES STATUS
#[derive(Debug, Clone)]
pub struct SlaveConnection {
    pub master_host: String,
    pub master_port: u16,
    pub io_running: bool,
    pub sql_running: bool,
    pub seconds_behind_master: Option<i64>,
    pub using_gtid: bool,
}

/// Everything the monitor knows about one server
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    pub server_id: Option<u64>,
    pub read_only: bool,
    pub log_bin: bool,
    pub gtid_current_pos: GtidList,
    pub slave_connections: Vec<SlaveConnection>,
    pub version: String,
    pub reachable: bool,
    /// Free disk fraction from information_schema.DISKS, when the plugin
    /// is installed
    pub disk_space_free_ratio: Option<f64>,
    /// Consecutive ticks this server has been unreachable
    pub fail_count: u32,
    /// When the IO thread towards the master was last seen connected
    pub io_disconnected_since: Option<Instant>,
}

impl ServerInfo {
    pub fn is_replicating_from(&self, host: &str, port: u16) -> bool {
        self.slave_connections
            .iter()
            .any(|s| s.master_host == host && s.master_port == port && s.io_running)
    }

    pub fn has_slave_connection_to(&self, host: &str, port: u16) -> bool {
        self.slave_connections
            .iter()
            .any(|s| s.master_host == host && s.master_port == port)
    }

    pub fn replication_lag(&self) -> Option<i64> {
        self.slave_connections
            .iter()
            .filter_map(|s| s.seconds_behind_master)
            .max()
    }
}

/// Run the per-tick probe queries against one server.
pub async fn probe_server(conn: &mut BackendConnection) -> Result<ServerInfo, ConnectionError> {
    let mut info = ServerInfo {
        reachable: true,
        ..Default::default()
    };

    let rs = conn.query("SELECT @@server_id, @@read_only, @@version").await?;
    if let Some(row) = rs.rows.first() {
        info.server_id = row.first().and_then(|v| v.as_deref()).and_then(|v| v.parse().ok());
        info.read_only = row
            .get(1)
            .and_then(|v| v.as_deref())
            .map(|v| v == "1" || v.eq_ignore_ascii_case("ON"))
            .unwrap_or(false);
        info.version = row
            .get(2)
            .and_then(|v| v.clone())
            .unwrap_or_default();
    }

    let rs = conn.query("SELECT @@gtid_current_pos").await?;
    if let Some(pos) = rs.scalar() {
        info.gtid_current_pos = GtidList::parse(pos);
    }

    let rs = conn.query("SHOW VARIABLES LIKE 'log_bin'").await?;
    if let Some(row) = rs.rows.first() {
        info.log_bin = row
            .get(1)
            .and_then(|v| v.as_deref())
            .map(|v| v.eq_ignore_ascii_case("ON"))
            .unwrap_or(false);
    }

    // Optional: the DISKS plugin is not always installed
    if let Ok(rs) = conn
        .query("SELECT SUM(total) AS total, SUM(available) AS available FROM information_schema.DISKS")
        .await
    {
        if rs.error.is_none() {
            let total: f64 = rs.value(0, "total").and_then(|v| v.parse().ok()).unwrap_or(0.0);
            let available: f64 = rs
                .value(0, "available")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0);
            if total > 0.0 {
                info.disk_space_free_ratio = Some(available / total);
            }
        }
    }

    let rs = conn.query("SHOW ALL SLAVES STATUS").await?;
    for row in 0..rs.rows.len() {
        let master_host = rs.value(row, "Master_Host").unwrap_or("").to_string();
        let master_port: u16 = rs
            .value(row, "Master_Port")
            .and_then(|v| v.parse().ok())
            .unwrap_or(3306);
        let io_running = rs
            .value(row, "Slave_IO_Running")
            .map(|v| v.eq_ignore_ascii_case("Yes"))
            .unwrap_or(false);
        let sql_running = rs
            .value(row, "Slave_SQL_Running")
            .map(|v| v.eq_ignore_ascii_case("Yes"))
            .unwrap_or(false);
        let seconds_behind_master = rs
            .value(row, "Seconds_Behind_Master")
            .and_then(|v| v.parse().ok());
        let using_gtid = rs
            .value(row, "Using_Gtid")
            .map(|v| !v.eq_ignore_ascii_case("No"))
            .unwrap_or(false);

        debug!(
            master = %master_host,
            io = io_running,
            sql = sql_running,
            "Slave connection"
        );

        info.slave_connections.push(SlaveConnection {
            master_host,
            master_port,
            io_running,
            sql_running,
            seconds_behind_master,
            using_gtid,
        });
    }

    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gtid_parse_single() {
        let g = GtidList::parse("0-1-42");
        assert_eq!(g.sequence(0), Some(42));
        assert_eq!(g.to_string(), "0-1-42");
    }

    #[test]
    fn test_gtid_parse_multi_domain() {
        let g = GtidList::parse("0-1-42,1-2-100");
        assert_eq!(g.sequence(0), Some(42));
        assert_eq!(g.sequence(1), Some(100));
    }

    #[test]
    fn test_gtid_parse_garbage() {
        assert!(GtidList::parse("").is_empty());
        assert!(GtidList::parse("not-a-gtid-at-all-x").is_empty());
        assert!(GtidList::parse("1-2").is_empty());
    }

    #[test]
    fn test_gtid_ordering() {
        let a = GtidList::parse("0-1-100");
        let b = GtidList::parse("0-1-42");
        assert!(a.is_ahead_of(&b, 0));
        assert!(!b.is_ahead_of(&a, 0));
        assert!(!a.is_ahead_of(&a, 0));
    }

    #[test]
    fn test_gtid_has_reached() {
        let master = GtidList::parse("0-1-100,1-1-50");
        let caught_up = GtidList::parse("0-2-100,1-2-50");
        let behind = GtidList::parse("0-2-99,1-2-50");
        assert!(caught_up.has_reached(&master));
        assert!(!behind.has_reached(&master));
    }

    #[test]
    fn test_server_info_replication_lag() {
        let info = ServerInfo {
            slave_connections: vec![
                SlaveConnection {
                    master_host: "a".into(),
                    master_port: 3306,
                    io_running: true,
                    sql_running: true,
                    seconds_behind_master: Some(3),
                    using_gtid: true,
                },
                SlaveConnection {
                    master_host: "b".into(),
                    master_port: 3306,
                    io_running: true,
                    sql_running: true,
                    seconds_behind_master: Some(7),
                    using_gtid: true,
                },
            ],
            ..Default::default()
        };
        assert_eq!(info.replication_lag(), Some(7));
        assert!(info.is_replicating_from("a", 3306));
        assert!(!info.is_replicating_from("c", 3306));
    }
}
