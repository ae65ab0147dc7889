//! Schema-based shard router.
//!
//! Maintains a database-name to server map built by broadcasting
//! SHOW DATABASES to every backend. `USE` pins the session to the owning
//! shard, qualified names route per statement, SHOW DATABASES/TABLES are
//! broadcast and their rows unioned into a single result set.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info, warn};

use super::{ClientWriter, ResponseTracker, RouterSession};
use crate::backend::{BackendCloseReason, BackendSession, BackendTimeouts};
use crate::classifier::Classifier;
use crate::config::ServiceConfig;
use crate::error::ProxyError;
use crate::protocol::{put_lenenc_int, put_lenenc_str, Command, EofPacket, ErrPacket, OkPacket, Packet};
use crate::server::Server;
use crate::service::{Registry, Service};
use crate::session::history::SessionCommandHistory;

/// Databases present on every shard; never treated as duplicates
const SYSTEM_DATABASES: [&str; 4] = ["information_schema", "mysql", "performance_schema", "sys"];

/// db name -> owning server, with staleness tracking
#[derive(Debug, Default)]
pub struct ShardMap {
    map: HashMap<String, String>,
    built_at: Option<Instant>,
}

impl ShardMap {
    pub fn lookup(&self, db: &str) -> Option<&str> {
        self.map.get(&db.to_lowercase()).map(|s| s.as_str())
    }

    pub fn databases(&self) -> Vec<String> {
        let mut dbs: Vec<String> = self.map.keys().cloned().collect();
        dbs.sort();
        dbs
    }

    pub fn is_stale(&self, refresh_interval: Duration) -> bool {
        match self.built_at {
            Some(at) => at.elapsed() >= refresh_interval,
            None => true,
        }
    }

    /// Record a (db, server) pair. A db seen on two servers is a
    /// duplicate: fatal unless configured to skip.
    pub fn insert(
        &mut self,
        db: &str,
        server: &str,
        ignore_duplicates: bool,
    ) -> Result<(), ProxyError> {
        let key = db.to_lowercase();
        if SYSTEM_DATABASES.contains(&key.as_str()) {
            self.map.entry(key).or_insert_with(|| server.to_string());
            return Ok(());
        }
        match self.map.get(&key) {
            Some(owner) if owner != server => {
                if ignore_duplicates {
                    warn!(db = %db, first = %owner, second = %server, "Duplicate database, keeping first");
                    Ok(())
                } else {
                    Err(ProxyError::ConfigValidation(format!(
                        "Duplicate database name '{}' found on servers '{}' and '{}'",
                        db, owner, server
                    )))
                }
            }
            _ => {
                self.map.insert(key, server.to_string());
                Ok(())
            }
        }
    }

    pub fn mark_built(&mut self) {
        self.built_at = Some(Instant::now());
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.built_at = None;
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Distinct database names referenced by a statement's tables
fn referenced_databases(tables: &[String]) -> BTreeSet<String> {
    tables
        .iter()
        .filter_map(|t| {
            t.rsplit_once('.')
                .map(|(db, _)| db.trim_matches('`').to_lowercase())
        })
        .collect()
}

pub struct SchemaRouterSession {
    session_id: u64,
    service: Arc<Service>,
    registry: Arc<Registry>,
    classifier: Classifier,
    config: ServiceConfig,
    timeouts: BackendTimeouts,

    backends: HashMap<String, BackendSession>,
    shard_map: ShardMap,
    current_db: Option<String>,
    history: SessionCommandHistory,
    tracker: ResponseTracker,
    client_capabilities: u32,
}

impl SchemaRouterSession {
    pub fn new(
        session_id: u64,
        service: Arc<Service>,
        registry: Arc<Registry>,
        current_db: Option<String>,
        client_capabilities: u32,
    ) -> Self {
        let config = service.params();
        let timeouts = BackendTimeouts {
            connect: Duration::from_millis(config.connect_timeout_ms),
            read: Duration::from_millis(config.read_timeout_ms),
            write: Duration::from_millis(config.write_timeout_ms),
        };
        let classifier = Classifier::new(service.classifier_cache_enabled());
        let history = SessionCommandHistory::new(config.disable_sescmd_history);

        Self {
            session_id,
            service,
            registry,
            classifier,
            config,
            timeouts,
            backends: HashMap::new(),
            shard_map: ShardMap::default(),
            current_db,
            history,
            tracker: ResponseTracker::new(),
            client_capabilities,
        }
    }

    fn servers(&self) -> Vec<Arc<Server>> {
        self.service
            .servers(&self.registry)
            .into_iter()
            .filter(|s| s.is_usable())
            .collect()
    }

    async fn acquire_backend(&mut self, server: Arc<Server>) -> Result<(), ProxyError> {
        if self.backends.contains_key(&server.name) {
            return Ok(());
        }
        let mut backend = BackendSession::connect(
            server.clone(),
            &self.config.user,
            &self.config.password,
            None,
            self.timeouts,
        )
        .await
        .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?;

        backend
            .replay_history(&self.history)
            .await
            .map_err(|e| ProxyError::BackendUnavailable(format!("history replay: {}", e)))?;

        self.backends.insert(server.name.clone(), backend);
        Ok(())
    }

    /// Build the shard map by asking every backend what it has
    async fn refresh_shard_map(&mut self) -> Result<(), ProxyError> {
        let servers = self.servers();
        if servers.is_empty() {
            return Err(ProxyError::RoutingPolicy(
                "No usable servers for shard discovery".to_string(),
            ));
        }

        let mut fresh = ShardMap::default();
        for server in servers {
            self.acquire_backend(server.clone()).await?;
            let databases = self.query_databases(&server.name).await?;
            for db in databases {
                fresh.insert(&db, &server.name, self.config.ignore_duplicate_databases)?;
            }
        }
        fresh.mark_built();

        info!(
            session_id = self.session_id,
            databases = fresh.len(),
            "Shard map refreshed"
        );
        self.shard_map = fresh;
        Ok(())
    }

    /// SHOW DATABASES against one backend, rows collected
    async fn query_databases(&mut self, name: &str) -> Result<Vec<String>, ProxyError> {
        let mut backend = self.take_backend(name)?;
        let result = async {
            backend
                .write(Packet::query("SHOW DATABASES"), None)
                .await
                .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?;
            self.tracker.request_sent();

            let mut rows = Vec::new();
            let mut past_fields = false;
            loop {
                let (packet, reply, complete) = match backend.read_reply_packet().await {
                    Ok(v) => v,
                    Err(e) => {
                        self.tracker.request_aborted();
                        return Err(ProxyError::BackendUnavailable(e.to_string()));
                    }
                };
                match reply.state {
                    crate::protocol::ReplyState::ReadingRows if past_fields => {
                        if let Some((db, _)) = crate::protocol::get_lenenc_str(&packet.payload) {
                            rows.push(db);
                        }
                    }
                    crate::protocol::ReplyState::ReadingRows => past_fields = true,
                    _ => {}
                }
                if complete {
                    self.tracker.reply_complete();
                    if let Some(err) = reply.last_error {
                        return Err(ProxyError::BackendUnavailable(err.error_message));
                    }
                    return Ok(rows);
                }
            }
        }
        .await;
        self.put_backend(name, backend);
        result
    }

    fn take_backend(&mut self, name: &str) -> Result<BackendSession, ProxyError> {
        self.backends
            .remove(name)
            .ok_or_else(|| ProxyError::BackendUnavailable(format!("backend '{}' lost", name)))
    }

    fn put_backend(&mut self, name: &str, backend: BackendSession) {
        if backend.in_use() {
            self.backends.insert(name.to_string(), backend);
        }
    }

    async fn ensure_map_fresh(&mut self) -> Result<(), ProxyError> {
        if self
            .shard_map
            .is_stale(Duration::from_secs(self.config.refresh_interval_s))
        {
            self.refresh_shard_map().await?;
        }
        Ok(())
    }

    /// Resolve a db to its shard, refreshing the map once on a miss
    async fn shard_for(&mut self, db: &str) -> Result<String, ProxyError> {
        self.ensure_map_fresh().await?;
        if let Some(server) = self.shard_map.lookup(db) {
            return Ok(server.to_string());
        }
        self.refresh_shard_map().await?;
        self.shard_map
            .lookup(db)
            .map(|s| s.to_string())
            .ok_or_else(|| {
                ProxyError::auth(
                    crate::error::AuthFailureKind::FailedDb,
                    "",
                    format!("Unknown database '{}'", db),
                )
            })
    }

    /// Forward to one backend and stream the reply
    async fn forward(
        &mut self,
        name: &str,
        packet: Packet,
        client: &mut dyn ClientWriter,
    ) -> Result<(), ProxyError> {
        let mut backend = self.take_backend(name)?;
        let result = async {
            let expects = backend
                .write(packet, None)
                .await
                .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?;
            if !expects {
                return Ok(());
            }
            self.tracker.request_sent();
            loop {
                let (packet, _, complete) = match backend.read_reply_packet().await {
                    Ok(v) => v,
                    Err(e) => {
                        self.tracker.request_aborted();
                        return Err(ProxyError::BackendUnavailable(e.to_string()));
                    }
                };
                client.send(packet).await?;
                if complete {
                    self.tracker.reply_complete();
                    return Ok(());
                }
            }
        }
        .await;
        self.put_backend(name, backend);
        result
    }

    /// `USE db`: forward to the owning shard only, remember the pin
    async fn route_use(
        &mut self,
        db: &str,
        packet: Packet,
        client: &mut dyn ClientWriter,
    ) -> Result<(), ProxyError> {
        let db = db.trim().trim_matches('`').to_string();
        let shard = match self.shard_for(&db).await {
            Ok(s) => s,
            Err(_) => {
                let err = ErrPacket::unknown_database(&db);
                client
                    .send(err.encode(1, self.client_capabilities))
                    .await?;
                return Ok(());
            }
        };

        let server = self
            .servers()
            .into_iter()
            .find(|s| s.name == shard)
            .ok_or_else(|| ProxyError::BackendUnavailable(format!("shard '{}' gone", shard)))?;
        self.acquire_backend(server).await?;

        // The database switch is session state: replayed on any backend
        // acquired later
        self.history.add(packet.payload.clone());
        self.forward(&shard, packet, client).await?;
        self.current_db = Some(db.clone());
        debug!(session_id = self.session_id, db = %db, shard = %shard, "Session pinned to shard");
        Ok(())
    }

    /// SHOW DATABASES: answer from the union of all shards
    async fn route_show_databases(&mut self, client: &mut dyn ClientWriter) -> Result<(), ProxyError> {
        self.refresh_shard_map().await?;
        let databases = self.shard_map.databases();
        send_single_column_resultset(client, "Database", &databases).await
    }

    /// SHOW TABLES and friends: broadcast, union the first column
    async fn route_broadcast_union(
        &mut self,
        packet: Packet,
        column_name: &str,
        client: &mut dyn ClientWriter,
    ) -> Result<(), ProxyError> {
        self.ensure_map_fresh().await?;
        let servers = self.servers();
        let mut rows: BTreeSet<String> = BTreeSet::new();

        for server in servers {
            self.acquire_backend(server.clone()).await?;
            let collected = self
                .collect_first_column(&server.name, packet.clone())
                .await;
            match collected {
                Ok(values) => rows.extend(values),
                Err(e) => {
                    warn!(
                        session_id = self.session_id,
                        server = %server.name,
                        error = %e,
                        "Broadcast shard failed"
                    );
                }
            }
        }

        let rows: Vec<String> = rows.into_iter().collect();
        send_single_column_resultset(client, column_name, &rows).await
    }

    async fn collect_first_column(
        &mut self,
        name: &str,
        packet: Packet,
    ) -> Result<Vec<String>, ProxyError> {
        let mut backend = self.take_backend(name)?;
        let result = async {
            backend
                .write(packet, None)
                .await
                .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?;
            self.tracker.request_sent();
            let mut rows = Vec::new();
            let mut past_fields = false;
            loop {
                let (p, reply, complete) = match backend.read_reply_packet().await {
                    Ok(v) => v,
                    Err(e) => {
                        self.tracker.request_aborted();
                        return Err(ProxyError::BackendUnavailable(e.to_string()));
                    }
                };
                match reply.state {
                    crate::protocol::ReplyState::ReadingRows if past_fields => {
                        if let Some((v, _)) = crate::protocol::get_lenenc_str(&p.payload) {
                            rows.push(v);
                        }
                    }
                    crate::protocol::ReplyState::ReadingRows => past_fields = true,
                    _ => {}
                }
                if complete {
                    self.tracker.reply_complete();
                    return Ok(rows);
                }
            }
        }
        .await;
        self.put_backend(name, backend);
        result
    }

    /// Session commands go to every connected backend
    async fn route_to_all(
        &mut self,
        packet: Packet,
        client: &mut dyn ClientWriter,
    ) -> Result<(), ProxyError> {
        let position = self.history.add(packet.payload.clone());

        if self.backends.is_empty() {
            // Apply to the first usable shard; later backends replay it
            let server = self.servers().into_iter().next().ok_or_else(|| {
                ProxyError::RoutingPolicy("No usable servers".to_string())
            })?;
            self.acquire_backend(server).await?;
        }

        let names: Vec<String> = self.backends.keys().cloned().collect();
        let mut replied = false;

        for name in names {
            let mut backend = match self.take_backend(&name) {
                Ok(b) => b,
                Err(_) => continue,
            };
            match backend
                .execute_session_command(position, packet.payload.clone())
                .await
            {
                Ok(true) => {
                    self.tracker.request_sent();
                    let mut failed = false;
                    loop {
                        let (p, _, complete) = match backend.read_reply_packet().await {
                            Ok(v) => v,
                            Err(_) => {
                                self.tracker.request_aborted();
                                failed = true;
                                break;
                            }
                        };
                        if !replied {
                            client.send(p).await?;
                        }
                        if complete {
                            self.tracker.reply_complete();
                            break;
                        }
                    }
                    if !failed {
                        replied = true;
                        self.put_backend(&name, backend);
                    } else {
                        backend.close(BackendCloseReason::BackendFailure);
                        self.put_backend(&name, backend);
                    }
                }
                Ok(false) => self.put_backend(&name, backend),
                Err(_) => {
                    backend.close(BackendCloseReason::BackendFailure);
                    self.put_backend(&name, backend);
                }
            }
        }

        if !replied {
            let ok = OkPacket::new();
            client.send(ok.encode(1, self.client_capabilities)).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RouterSession for SchemaRouterSession {
    async fn route_query(
        &mut self,
        packet: Packet,
        client: &mut dyn ClientWriter,
    ) -> Result<(), ProxyError> {
        let c = self.classifier.classify(&packet.payload, "");
        let command = Command::from(c.command);

        // COM_INIT_DB and textual USE pin the session to a shard
        if command == Command::InitDb {
            let db = String::from_utf8_lossy(&packet.payload[1..]).to_string();
            return self.route_use(&db, packet, client).await;
        }
        if command == Command::Query {
            let sql = String::from_utf8_lossy(&packet.payload[1..]).to_string();
            let upper = sql.trim().to_uppercase();
            if upper.starts_with("USE ") {
                let db = sql.trim()[4..].trim().trim_end_matches(';').to_string();
                return self.route_use(&db, packet, client).await;
            }
            if upper.starts_with("SHOW DATABASES") || upper.starts_with("SHOW SCHEMAS") {
                return self.route_show_databases(client).await;
            }
            if upper.starts_with("SHOW TABLES") {
                let column = match &self.current_db {
                    Some(db) => format!("Tables_in_{}", db),
                    None => "Tables_in_".to_string(),
                };
                return self.route_broadcast_union(packet, &column, client).await;
            }
        }

        // Session commands fan out to every shard
        if c.type_mask.is_session_command() {
            return self.route_to_all(packet, client).await;
        }

        // Qualified names decide the shard; several distinct dbs in one
        // statement cannot be routed
        let databases = referenced_databases(&c.tables);
        let target_db = match databases.len() {
            0 => self.current_db.clone(),
            1 => databases.into_iter().next(),
            _ => {
                let err = ErrPacket::new(
                    1105,
                    "HY000",
                    &format!(
                        "Cross-database query targets {} databases and cannot be routed",
                        databases.len()
                    ),
                );
                client.send(err.encode(1, self.client_capabilities)).await?;
                return Ok(());
            }
        };

        let db = match target_db {
            Some(db) => db,
            None => {
                // No database context at all: use the first shard
                let server = self.servers().into_iter().next().ok_or_else(|| {
                    ProxyError::RoutingPolicy("No usable servers".to_string())
                })?;
                self.acquire_backend(server.clone()).await?;
                return self.forward(&server.name, packet, client).await;
            }
        };

        let shard = match self.shard_for(&db).await {
            Ok(s) => s,
            Err(ProxyError::AuthFailure { message, .. }) => {
                let err = ErrPacket::new(1049, "42000", &message);
                client.send(err.encode(1, self.client_capabilities)).await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let server = self
            .servers()
            .into_iter()
            .find(|s| s.name == shard)
            .ok_or_else(|| ProxyError::BackendUnavailable(format!("shard '{}' gone", shard)))?;
        self.acquire_backend(server).await?;
        self.forward(&shard, packet, client).await
    }

    fn close(&mut self) {
        for (_, mut backend) in self.backends.drain() {
            backend.close(BackendCloseReason::SessionClosed);
        }
    }
}

/// Emit a synthesized one-column result set with sequence ids 1,2,3,...
async fn send_single_column_resultset(
    client: &mut dyn ClientWriter,
    column_name: &str,
    rows: &[String],
) -> Result<(), ProxyError> {
    let mut seq = 1u8;
    let mut next_seq = || {
        let s = seq;
        seq = seq.wrapping_add(1);
        s
    };

    // Column count
    let mut buf = BytesMut::new();
    put_lenenc_int(&mut buf, 1);
    client.send(Packet::new(next_seq(), buf.freeze())).await?;

    // Column definition
    client
        .send(Packet::new(next_seq(), column_definition(column_name)))
        .await?;

    // EOF after definitions
    client
        .send(EofPacket::default().encode(next_seq()))
        .await?;

    for row in rows {
        let mut buf = BytesMut::new();
        put_lenenc_str(&mut buf, row);
        client.send(Packet::new(next_seq(), buf.freeze())).await?;
    }

    client
        .send(EofPacket::default().encode(next_seq()))
        .await?;
    Ok(())
}

/// Protocol::ColumnDefinition41 for a VAR_STRING column
fn column_definition(name: &str) -> Bytes {
    let mut buf = BytesMut::new();
    put_lenenc_str(&mut buf, "def");
    put_lenenc_str(&mut buf, "information_schema");
    put_lenenc_str(&mut buf, "");
    put_lenenc_str(&mut buf, "");
    put_lenenc_str(&mut buf, name);
    put_lenenc_str(&mut buf, name);
    buf.put_u8(0x0c); // fixed-length fields
    buf.put_u16_le(0x21); // utf8_general_ci
    buf.put_u32_le(255); // column length
    buf.put_u8(0xFD); // MYSQL_TYPE_VAR_STRING
    buf.put_u16_le(0); // flags
    buf.put_u8(0); // decimals
    buf.put_u16_le(0); // filler
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_map_lookup_case_insensitive() {
        let mut map = ShardMap::default();
        map.insert("Alpha", "b1", false).unwrap();
        assert_eq!(map.lookup("alpha"), Some("b1"));
        assert_eq!(map.lookup("ALPHA"), Some("b1"));
        assert_eq!(map.lookup("beta"), None);
    }

    #[test]
    fn test_shard_map_duplicate_is_fatal() {
        let mut map = ShardMap::default();
        map.insert("shop", "b1", false).unwrap();
        let err = map.insert("shop", "b2", false).unwrap_err();
        let packet = err.to_err_packet();
        assert_eq!(packet.error_code, 1105);
        assert!(packet.error_message.contains("Duplicate database name 'shop'"));
    }

    #[test]
    fn test_shard_map_duplicate_skipped_when_configured() {
        let mut map = ShardMap::default();
        map.insert("shop", "b1", true).unwrap();
        map.insert("shop", "b2", true).unwrap();
        // First owner wins
        assert_eq!(map.lookup("shop"), Some("b1"));
    }

    #[test]
    fn test_shard_map_system_databases_never_duplicate() {
        let mut map = ShardMap::default();
        map.insert("mysql", "b1", false).unwrap();
        map.insert("mysql", "b2", false).unwrap();
        map.insert("information_schema", "b1", false).unwrap();
        map.insert("information_schema", "b2", false).unwrap();
        assert_eq!(map.lookup("mysql"), Some("b1"));
    }

    #[test]
    fn test_shard_map_staleness() {
        let mut map = ShardMap::default();
        assert!(map.is_stale(Duration::from_secs(300)));
        map.mark_built();
        assert!(!map.is_stale(Duration::from_secs(300)));
        assert!(map.is_stale(Duration::from_secs(0)));
    }

    #[test]
    fn test_referenced_databases() {
        let tables = vec![
            "alpha.t".to_string(),
            "beta.u".to_string(),
            "plain_table".to_string(),
            "alpha.v".to_string(),
        ];
        let dbs = referenced_databases(&tables);
        assert_eq!(dbs.len(), 2);
        assert!(dbs.contains("alpha"));
        assert!(dbs.contains("beta"));
    }

    #[test]
    fn test_referenced_databases_unqualified_only() {
        let tables = vec!["t".to_string(), "u".to_string()];
        assert!(referenced_databases(&tables).is_empty());
    }

    #[test]
    fn test_column_definition_shape() {
        let def = column_definition("Database");
        // Must start with lenenc "def"
        let (catalog, _) = crate::protocol::get_lenenc_str(&def).unwrap();
        assert_eq!(catalog, "def");
    }
}
