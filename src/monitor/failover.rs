//! Cluster-modifying operations: failover, switchover, rejoin and
//! replication reset. All run inside the monitor loop and are bounded by
//! the configured operation timeouts; exceeding the budget aborts and
//! leaves the cluster unchanged from the monitor's point of view.

use std::time::Duration;

use tracing::{info, warn};

use super::info::GtidList;
use super::MariadbMonitor;
use crate::server::{Endpoint, ServerStatus};

impl MariadbMonitor {
    /// Promote the most advanced slave after master failure.
    ///
    /// Returns the name of the new master.
    pub(super) async fn do_failover(&mut self) -> Result<String, String> {
        let config = self.config();
        let timeout = Duration::from_secs(config.failover_timeout_s);

        let old_master = self.master;
        let target = self.select_promotion_target(old_master, &config.excluded_servers)?;

        let result = tokio::time::timeout(timeout, async {
            self.promote(target, &config.promotion_sql_file).await?;
            self.redirect_slaves(target, old_master).await;
            Ok::<(), String>(())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(format!(
                    "Failover exceeded failover_timeout ({}s), cluster unchanged",
                    config.failover_timeout_s
                ))
            }
        }

        // Publish the outcome immediately instead of waiting a tick
        if let Some(old) = old_master {
            let server = &self.servers[old].server;
            server.clear_status(ServerStatus::MASTER);
            server.add_status(ServerStatus::WAS_MASTER);
        }
        let new_master = &self.servers[target].server;
        new_master.set_status(ServerStatus::RUNNING | ServerStatus::MASTER);
        self.master = Some(target);
        crate::metrics::metrics().failovers.inc();

        Ok(new_master.name.clone())
    }

    /// Manual master swap: demote the old master, wait for the replacement
    /// to catch up, then promote and redirect.
    pub(super) async fn do_switchover(
        &mut self,
        new_master: Option<String>,
        old_master: Option<String>,
    ) -> Result<String, String> {
        let config = self.config();
        let timeout = Duration::from_secs(config.switchover_timeout_s);

        let old_idx = match old_master {
            Some(name) => self.index_of(&name)?,
            None => self.master.ok_or("No current master to demote")?,
        };
        if Some(old_idx) != self.master {
            return Err(format!(
                "'{}' is not the current master",
                self.servers[old_idx].server.name
            ));
        }

        let new_idx = match new_master {
            Some(name) => {
                let idx = self.index_of(&name)?;
                if idx == old_idx {
                    return Err("Old and new master are the same server".to_string());
                }
                if !self.servers[idx].info.reachable {
                    return Err(format!("'{}' is not reachable", name));
                }
                idx
            }
            None => self.select_promotion_target(Some(old_idx), &config.excluded_servers)?,
        };

        let result = tokio::time::timeout(timeout, async {
            // Stop writes on the old master before reading its final GTID
            self.exec_on(old_idx, "SET GLOBAL read_only=1").await?;

            let target_gtid = self.current_gtid(old_idx).await?;
            self.wait_for_catchup(new_idx, &target_gtid).await?;

            self.promote(new_idx, &config.promotion_sql_file).await?;
            self.redirect_slaves(new_idx, Some(old_idx)).await;

            // The old master becomes a slave of the new one
            if let Err(e) = self.point_to_master(old_idx, new_idx).await {
                warn!(monitor = %self.name_for_log(), error = %e, "Failed to redirect old master");
            }
            Ok::<(), String>(())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                // Reopen writes on the old master; the swap did not happen
                let _ = self.exec_on(old_idx, "SET GLOBAL read_only=0").await;
                return Err(e);
            }
            Err(_) => {
                let _ = self.exec_on(old_idx, "SET GLOBAL read_only=0").await;
                return Err(format!(
                    "Switchover exceeded switchover_timeout ({}s)",
                    config.switchover_timeout_s
                ));
            }
        }

        let old = &self.servers[old_idx].server;
        old.clear_status(ServerStatus::MASTER);
        old.add_status(ServerStatus::WAS_MASTER | ServerStatus::SLAVE);
        let new = &self.servers[new_idx].server;
        new.set_status(ServerStatus::RUNNING | ServerStatus::MASTER);
        self.master = Some(new_idx);

        Ok(new.name.clone())
    }

    /// Point a stray server back at the current master
    pub(super) async fn do_rejoin(&mut self, server: &str) -> Result<(), String> {
        let master_idx = self.master.ok_or("No master to rejoin to")?;
        let idx = self.index_of(server)?;
        if idx == master_idx {
            return Err("Server is the current master".to_string());
        }
        self.point_to_master(idx, master_idx).await?;
        self.exec_on(idx, "SET GLOBAL read_only=1").await.ok();
        info!(
            monitor = %self.name_for_log(),
            server = %self.servers[idx].server.name,
            "Server rejoined"
        );
        Ok(())
    }

    /// Tear down replication everywhere and rebuild it under one master
    pub(super) async fn do_reset_replication(
        &mut self,
        master: Option<String>,
    ) -> Result<String, String> {
        let master_idx = match master {
            Some(name) => self.index_of(&name)?,
            None => self
                .master
                .or_else(|| (0..self.servers.len()).find(|&i| self.servers[i].info.reachable))
                .ok_or("No reachable server to promote")?,
        };

        for i in 0..self.servers.len() {
            if !self.servers[i].info.reachable {
                continue;
            }
            let _ = self.exec_on(i, "STOP ALL SLAVES").await;
            let _ = self.exec_on(i, "RESET SLAVE ALL").await;
        }

        self.exec_on(master_idx, "SET GLOBAL read_only=0").await?;

        for i in 0..self.servers.len() {
            if i == master_idx || !self.servers[i].info.reachable {
                continue;
            }
            if let Err(e) = self.point_to_master(i, master_idx).await {
                warn!(
                    monitor = %self.name_for_log(),
                    server = %self.servers[i].server.name,
                    error = %e,
                    "Failed to reattach after reset"
                );
            }
        }

        self.master = Some(master_idx);
        Ok(self.servers[master_idx].server.name.clone())
    }

    /// Redirect every surviving slave of the old master to the new one
    async fn auto_rejoin_candidates(&self) -> Vec<usize> {
        let config = self.config();
        let Some(master_idx) = self.master else {
            return vec![];
        };
        let (mhost, mport) = match self.endpoint_parts(master_idx) {
            Some(parts) => parts,
            None => return vec![],
        };

        self.servers
            .iter()
            .enumerate()
            .filter(|(i, ms)| {
                if *i == master_idx || !ms.info.reachable {
                    return false;
                }
                // No slave thread at all: candidate
                if ms.info.slave_connections.is_empty() {
                    return true;
                }
                // Attached to something that is not the master: only with
                // enforce_simple_topology
                let attached_to_master = ms.info.has_slave_connection_to(&mhost, mport);
                !attached_to_master && config.enforce_simple_topology
            })
            .map(|(i, _)| i)
            .collect()
    }

    pub(super) async fn auto_rejoin(&mut self) {
        let candidates = self.auto_rejoin_candidates().await;
        for idx in candidates {
            let name = self.servers[idx].server.name.clone();
            match self.do_rejoin(&name).await {
                Ok(()) => info!(monitor = %self.name_for_log(), server = %name, "Auto-rejoin complete"),
                Err(e) => warn!(monitor = %self.name_for_log(), server = %name, error = %e, "Auto-rejoin failed"),
            }
        }
    }

    /// Most advanced reachable slave by GTID in the failed master's
    /// domain, excluding `excluded_servers`; ties broken by rank, then name.
    fn select_promotion_target(
        &self,
        old_master: Option<usize>,
        excluded: &[String],
    ) -> Result<usize, String> {
        let domain = old_master
            .and_then(|idx| self.servers[idx].info.gtid_current_pos.domains().min())
            .unwrap_or(0);

        let mut candidates: Vec<usize> = (0..self.servers.len())
            .filter(|&i| {
                Some(i) != old_master
                    && self.servers[i].info.reachable
                    && !self.servers[i].server.is_in_maintenance()
                    && !excluded.contains(&self.servers[i].server.name)
            })
            .collect();

        if candidates.is_empty() {
            return Err("No eligible promotion candidate".to_string());
        }

        candidates.sort_by(|&a, &b| {
            let seq_a = self.servers[a].info.gtid_current_pos.sequence(domain).unwrap_or(0);
            let seq_b = self.servers[b].info.gtid_current_pos.sequence(domain).unwrap_or(0);
            seq_b
                .cmp(&seq_a)
                .then_with(|| self.servers[a].server.rank().cmp(&self.servers[b].server.rank()))
                .then_with(|| self.servers[a].server.name.cmp(&self.servers[b].server.name))
        });

        Ok(candidates[0])
    }

    async fn promote(&mut self, idx: usize, promotion_sql_file: &Option<String>) -> Result<(), String> {
        info!(
            monitor = %self.name_for_log(),
            server = %self.servers[idx].server.name,
            "Promoting server"
        );
        self.exec_on(idx, "STOP ALL SLAVES").await?;
        self.exec_on(idx, "RESET SLAVE ALL").await?;
        self.exec_on(idx, "SET GLOBAL read_only=0").await?;

        if let Some(path) = promotion_sql_file {
            match std::fs::read_to_string(path) {
                Ok(content) => {
                    for stmt in content.split(';') {
                        let stmt = stmt.trim();
                        if stmt.is_empty() {
                            continue;
                        }
                        if let Err(e) = self.exec_on(idx, stmt).await {
                            warn!(
                                monitor = %self.name_for_log(),
                                statement = %stmt,
                                error = %e,
                                "Promotion SQL statement failed"
                            );
                        }
                    }
                }
                Err(e) => {
                    warn!(monitor = %self.name_for_log(), path = %path, error = %e, "Cannot read promotion_sql_file");
                }
            }
        }
        Ok(())
    }

    async fn redirect_slaves(&mut self, new_master: usize, old_master: Option<usize>) {
        for i in 0..self.servers.len() {
            if i == new_master || Some(i) == old_master || !self.servers[i].info.reachable {
                continue;
            }
            if let Err(e) = self.point_to_master(i, new_master).await {
                warn!(
                    monitor = %self.name_for_log(),
                    server = %self.servers[i].server.name,
                    error = %e,
                    "Failed to redirect slave"
                );
            }
        }
    }

    async fn point_to_master(&mut self, idx: usize, master_idx: usize) -> Result<(), String> {
        let (host, port) = self
            .endpoint_parts(master_idx)
            .ok_or("Master has no TCP endpoint")?;
        let config = self.config();

        self.exec_on(idx, "STOP ALL SLAVES").await?;
        let change = format!(
            "CHANGE MASTER TO MASTER_HOST='{}', MASTER_PORT={}, MASTER_USER='{}', \
             MASTER_PASSWORD='{}', MASTER_USE_GTID=slave_pos",
            host, port, config.user, config.password
        );
        self.exec_on(idx, &change).await?;
        self.exec_on(idx, "START SLAVE").await?;
        Ok(())
    }

    async fn wait_for_catchup(&mut self, idx: usize, target: &GtidList) -> Result<(), String> {
        loop {
            let current = self.current_gtid(idx).await?;
            if current.has_reached(target) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn current_gtid(&mut self, idx: usize) -> Result<GtidList, String> {
        let conn = self.servers[idx]
            .conn
            .as_mut()
            .ok_or("Server connection lost")?;
        let rs = conn
            .query("SELECT @@gtid_current_pos")
            .await
            .map_err(|e| e.to_string())?;
        Ok(GtidList::parse(rs.scalar().unwrap_or("")))
    }

    async fn exec_on(&mut self, idx: usize, sql: &str) -> Result<(), String> {
        let name = self.servers[idx].server.name.clone();
        let conn = self.servers[idx]
            .conn
            .as_mut()
            .ok_or_else(|| format!("No connection to '{}'", name))?;
        conn.execute(sql)
            .await
            .map_err(|e| format!("'{}' on {}: {}", sql, name, e))
    }

    fn endpoint_parts(&self, idx: usize) -> Option<(String, u16)> {
        match &self.servers[idx].server.endpoint {
            Endpoint::Tcp { host, port } => Some((host.clone(), *port)),
            Endpoint::Unix { .. } => None,
        }
    }

    fn index_of(&self, name: &str) -> Result<usize, String> {
        self.servers
            .iter()
            .position(|ms| ms.server.name == name)
            .ok_or_else(|| format!("Server '{}' is not monitored by this monitor", name))
    }

    fn name_for_log(&self) -> &str {
        &self.name
    }
}
