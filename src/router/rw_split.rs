//! Read/write-split router session.
//!
//! Writes go to the master, reads to a slave picked by the configured
//! criterion. The session tracks transactions (with replay on master
//! failure), causal reads via MASTER_GTID_WAIT, session-command fan-out
//! with history replay on newly acquired backends, and prepared-statement
//! id mapping across backends.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use super::{select_slave, ClientWriter, ResponseTracker, RouteTarget, RouterSession, RoutingHint};
use crate::backend::{BackendCloseReason, BackendSession, BackendTimeouts, ConnectionError};
use crate::classifier::{Classification, Classifier, TypeMask};
use crate::config::{MasterFailureMode, ServiceConfig};
use crate::error::ProxyError;
use crate::protocol::{rewrite_statement_id, Command, Packet, PrepareOk, Reply};
use crate::server::Server;
use crate::service::{Registry, Service};
use crate::session::history::SessionCommandHistory;

/// Transaction phase within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrxPhase {
    #[default]
    Inactive,
    ActiveRw,
    ActiveRo,
    Ending,
}

/// Causal-read bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum WaitGtid {
    #[default]
    None,
    /// MASTER_GTID_WAIT reply failed; the statement is being retried on
    /// the master
    RetryingOnMaster,
}

/// Replay buffer and checksum for the open transaction
#[derive(Default)]
struct TrxContext {
    phase: TrxPhase,
    /// Node the transaction is pinned to
    target: Option<String>,
    /// Completed statements, the BEGIN included
    statements: Vec<Bytes>,
    /// Running SHA1 over the result bytes streamed to the client
    checksum: Sha1,
    /// Cumulative size of statements and replies
    size: u64,
    can_replay: bool,
    attempts: u32,
    /// Read-only-looking transaction opportunistically started on a slave
    optimistic: bool,
}

impl TrxContext {
    fn begin(&mut self, read_only: bool, optimistic: bool, can_replay: bool) {
        *self = TrxContext {
            phase: if read_only || optimistic {
                TrxPhase::ActiveRo
            } else {
                TrxPhase::ActiveRw
            },
            can_replay,
            optimistic,
            ..Default::default()
        };
    }

    fn is_active(&self) -> bool {
        matches!(self.phase, TrxPhase::ActiveRw | TrxPhase::ActiveRo)
    }

    fn record_statement(&mut self, payload: &Bytes, max_size: u64) {
        if !self.can_replay {
            return;
        }
        self.size += payload.len() as u64;
        if self.size > max_size {
            // Too big to replay; a later master failure ends the session
            self.can_replay = false;
            self.statements.clear();
            return;
        }
        self.statements.push(payload.clone());
    }

    fn record_result_bytes(&mut self, bytes: &[u8], max_size: u64) {
        if !self.can_replay {
            return;
        }
        self.size += bytes.len() as u64;
        if self.size > max_size {
            self.can_replay = false;
            self.statements.clear();
            return;
        }
        self.checksum.update(bytes);
    }

    fn end(&mut self) {
        *self = TrxContext::default();
    }
}

/// Prepared-statement id mapping: the client sees internal ids; each
/// backend has its own.
#[derive(Debug, Default)]
struct PsTracker {
    next_internal: u32,
    /// internal id -> original COM_STMT_PREPARE payload
    prepare_payloads: HashMap<u32, Bytes>,
    /// internal id -> backend name -> backend-local id
    backend_ids: HashMap<u32, HashMap<String, u32>>,
}

impl PsTracker {
    fn new_statement(&mut self, prepare_payload: Bytes) -> u32 {
        self.next_internal += 1;
        let id = self.next_internal;
        self.prepare_payloads.insert(id, prepare_payload);
        self.backend_ids.insert(id, HashMap::new());
        id
    }

    fn record_backend_id(&mut self, internal: u32, backend: &str, backend_id: u32) {
        if let Some(map) = self.backend_ids.get_mut(&internal) {
            map.insert(backend.to_string(), backend_id);
        }
    }

    fn backend_id(&self, internal: u32, backend: &str) -> Option<u32> {
        self.backend_ids.get(&internal)?.get(backend).copied()
    }

    fn forget(&mut self, internal: u32) {
        self.prepare_payloads.remove(&internal);
        self.backend_ids.remove(&internal);
    }
}

/// Outcome of forwarding a statement to the master
enum MasterForward {
    /// The reply reached the client
    Streamed(Reply),
    /// An ignorable error was swallowed before the client saw it; the
    /// statement must be retried or the transaction replayed
    Consumed(crate::protocol::ErrPacket),
}

/// Errors the router consumes and retries rather than surfacing: the
/// WSREP-not-ready probe answer and server-triggered rollbacks.
fn is_ignorable_error(err: &crate::protocol::ErrPacket) -> bool {
    err.is_transient() || err.is_rollback_trigger()
}

/// The routing decision for one statement; pure and unit-testable
pub(crate) fn decide_target(
    mask: TypeMask,
    hint: Option<&RoutingHint>,
    trx: TrxPhase,
) -> RouteTarget {
    if let Some(hint) = hint {
        return match hint {
            RoutingHint::ToMaster => RouteTarget::Master,
            RoutingHint::ToSlave => RouteTarget::Slave,
            RoutingHint::ToServer(name) => RouteTarget::NamedServer(name.clone()),
            RoutingHint::MaxLag(lag) => RouteTarget::RlagMax(*lag),
        };
    }

    if trx == TrxPhase::ActiveRw {
        return RouteTarget::Master;
    }
    if trx == TrxPhase::ActiveRo && mask.is_read_only() {
        // Stay on the node the transaction opened on
        return RouteTarget::LastUsed;
    }

    if mask.is_master_only() || mask.intersects(TypeMask::COMMIT | TypeMask::ROLLBACK) {
        return RouteTarget::Master;
    }
    if mask.is_session_command() {
        return RouteTarget::All;
    }

    RouteTarget::Slave
}

pub struct RwSplitSession {
    session_id: u64,
    service: Arc<Service>,
    registry: Arc<Registry>,
    classifier: Classifier,
    config: ServiceConfig,
    timeouts: BackendTimeouts,

    backends: HashMap<String, BackendSession>,
    master_name: Option<String>,
    last_used: Option<String>,
    locked_rank: Option<i32>,

    history: SessionCommandHistory,
    tracker: ResponseTracker,
    trx: TrxContext,
    wait_gtid: WaitGtid,
    last_gtid: Option<String>,
    sql_mode: String,
    current_db: Option<String>,
    ps: PsTracker,
    /// Ring of recent statements for diagnostics
    retained: VecDeque<String>,
    last_keepalive: Instant,
}

impl RwSplitSession {
    pub fn new(
        session_id: u64,
        service: Arc<Service>,
        registry: Arc<Registry>,
        current_db: Option<String>,
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
            master_name: None,
            last_used: None,
            locked_rank: None,
            history,
            tracker: ResponseTracker::new(),
            trx: TrxContext::default(),
            wait_gtid: WaitGtid::None,
            last_gtid: None,
            sql_mode: String::new(),
            current_db,
            ps: PsTracker::default(),
            retained: VecDeque::new(),
            last_keepalive: Instant::now(),
        }
    }

    fn servers(&self) -> Vec<Arc<Server>> {
        self.service.servers(&self.registry)
    }

    fn find_master(&self) -> Option<Arc<Server>> {
        self.servers().into_iter().find(|s| s.is_master())
    }

    fn router_connections(&self) -> super::RouterConnections {
        self.backends
            .keys()
            .map(|name| (name.clone(), 1usize))
            .collect()
    }

    /// Connect to a server, replaying session-command history first.
    ///
    /// With history disabled a backend cannot be acquired once session
    /// commands have been issued.
    async fn acquire_backend(&mut self, server: Arc<Server>) -> Result<(), ProxyError> {
        if self.backends.contains_key(&server.name) {
            return Ok(());
        }
        if self.history.is_disabled() && self.history.latest_position() > 0 {
            return Err(ProxyError::RoutingPolicy(
                "Cannot acquire new backend mid-session: session command history is disabled"
                    .to_string(),
            ));
        }

        let mut backend = BackendSession::connect(
            server.clone(),
            &self.config.user,
            &self.config.password,
            self.current_db.as_deref(),
            self.timeouts,
        )
        .await
        .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?;

        backend
            .replay_history(&self.history)
            .await
            .map_err(|e| ProxyError::BackendUnavailable(format!("history replay: {}", e)))?;

        debug!(
            session_id = self.session_id,
            server = %server.name,
            "Backend acquired"
        );
        self.backends.insert(server.name.clone(), backend);
        Ok(())
    }

    async fn ensure_master(&mut self) -> Result<String, ProxyError> {
        if let Some(name) = &self.master_name {
            if self
                .backends
                .get(name)
                .map(|b| b.in_use() && b.server().is_master())
                .unwrap_or(false)
            {
                return Ok(name.clone());
            }
            self.backends.remove(&name.clone());
            self.master_name = None;
        }

        let master = self.find_master().ok_or_else(|| {
            ProxyError::RoutingPolicy("No master server available".to_string())
        })?;
        self.acquire_backend(master.clone()).await?;
        self.master_name = Some(master.name.clone());
        Ok(master.name.clone())
    }

    async fn ensure_slave(&mut self, max_rlag: i64) -> Result<String, ProxyError> {
        // Prefer a slave we already hold
        let existing: Option<String> = self
            .backends
            .iter()
            .find(|(_, b)| b.in_use() && b.server().is_slave())
            .map(|(name, _)| name.clone());
        if let Some(name) = existing {
            return Ok(name);
        }

        let picked = select_slave(
            &self.servers(),
            self.config.slave_selection_criteria,
            max_rlag,
            self.locked_rank,
            &self.router_connections(),
        );

        match picked {
            Some(server) => {
                self.locked_rank.get_or_insert(server.rank());
                self.acquire_backend(server.clone()).await?;
                Ok(server.name.clone())
            }
            // Master serves reads when no slave qualifies
            None => self.ensure_master().await,
        }
    }

    /// Take a backend out of the map for exclusive use during streaming
    fn take_backend(&mut self, name: &str) -> Result<BackendSession, ProxyError> {
        self.backends
            .remove(name)
            .ok_or_else(|| ProxyError::BackendUnavailable(format!("backend '{}' lost", name)))
    }

    fn put_backend(&mut self, name: &str, backend: BackendSession) {
        if backend.in_use() {
            self.backends.insert(name.to_string(), backend);
        } else if Some(name) == self.master_name.as_deref() {
            self.master_name = None;
        }
    }

    /// Stream one reply from `backend`. Packets go to `client` when given;
    /// sequence ids are rewritten when `seq_from` is set; payload bytes are
    /// collected into `capture` (bounded by the replay size limit) so the
    /// caller can fold a *completed* reply into the transaction checksum.
    async fn stream_reply(
        &mut self,
        backend: &mut BackendSession,
        client: Option<&mut dyn ClientWriter>,
        mut seq_from: Option<u8>,
        mut capture: Option<&mut Vec<u8>>,
    ) -> Result<Reply, ConnectionError> {
        let mut client = client;
        let capture_limit = self.config.transaction_replay_max_size as usize + 1;
        loop {
            let (mut packet, reply, complete) = match backend.read_reply_packet().await {
                Ok(v) => v,
                Err(e) => {
                    // The outstanding request will never complete
                    self.tracker.request_aborted();
                    return Err(e);
                }
            };

            if let Some(buf) = capture.as_mut() {
                if buf.len() < capture_limit {
                    let take = (capture_limit - buf.len()).min(packet.payload.len());
                    buf.extend_from_slice(&packet.payload[..take]);
                }
            }

            if let Some(seq) = seq_from.as_mut() {
                packet.sequence_id = *seq;
                *seq = seq.wrapping_add(1);
            }

            if let Some(w) = client.as_deref_mut() {
                w.send(packet).await.map_err(|e| {
                    ConnectionError::Io(format!("client write failed: {}", e))
                })?;
            }

            if complete {
                let elapsed = backend
                    .last_write_ts()
                    .map(|t| t.elapsed().as_micros() as f64)
                    .unwrap_or(0.0);
                backend.server().response_time.observe(elapsed);
                self.tracker.reply_complete();
                return Ok(reply);
            }
        }
    }

    /// Forward a packet to one backend and stream its reply
    async fn forward(
        &mut self,
        name: &str,
        packet: Packet,
        client: &mut dyn ClientWriter,
        record_trx: bool,
    ) -> Result<Reply, ProxyError> {
        let mut backend = self.take_backend(name)?;
        let result = self
            .forward_on(&mut backend, packet, client, record_trx)
            .await;
        self.put_backend(name, backend);
        result
    }

    async fn forward_on(
        &mut self,
        backend: &mut BackendSession,
        packet: Packet,
        client: &mut dyn ClientWriter,
        record_trx: bool,
    ) -> Result<Reply, ProxyError> {
        let payload = packet.payload.clone();
        let expects = backend
            .write(packet, None)
            .await
            .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?;
        if !expects {
            return Ok(empty_reply());
        }
        self.tracker.request_sent();

        let mut capture = if record_trx { Some(Vec::new()) } else { None };
        let reply = self
            .stream_reply(backend, Some(client), None, capture.as_mut())
            .await
            .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?;

        // Only completed replies feed the replay buffer; an interrupted
        // statement must not taint the checksum
        if let Some(buf) = capture {
            if self.trx.is_active() {
                let max = self.config.transaction_replay_max_size;
                self.trx.record_result_bytes(&buf, max);
                self.trx.record_statement(&payload, max);
            }
        }
        self.pick_up_session_track(&reply);
        Ok(reply)
    }

    /// Forward a packet to the master backend, consuming ignorable errors.
    ///
    /// The first reply packet is inspected before anything reaches the
    /// client: a WSREP-not-ready or rollback-trigger error arriving as the
    /// whole reply is swallowed and handed back so the caller can retry or
    /// replay, exactly as if the backend connection had broken.
    async fn forward_master(
        &mut self,
        name: &str,
        packet: Packet,
        client: &mut dyn ClientWriter,
        record_trx: bool,
    ) -> Result<MasterForward, ProxyError> {
        let mut backend = self.take_backend(name)?;
        let result = self
            .forward_master_on(&mut backend, packet, client, record_trx)
            .await;
        if matches!(result, Ok(MasterForward::Consumed(_))) {
            backend.close(BackendCloseReason::BackendFailure);
        }
        self.put_backend(name, backend);
        result
    }

    async fn forward_master_on(
        &mut self,
        backend: &mut BackendSession,
        packet: Packet,
        client: &mut dyn ClientWriter,
        record_trx: bool,
    ) -> Result<MasterForward, ProxyError> {
        let payload = packet.payload.clone();
        let expects = backend
            .write(packet, None)
            .await
            .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?;
        if !expects {
            return Ok(MasterForward::Streamed(empty_reply()));
        }
        self.tracker.request_sent();

        let (first, reply, complete) = match backend.read_reply_packet().await {
            Ok(v) => v,
            Err(e) => {
                self.tracker.request_aborted();
                return Err(ProxyError::BackendUnavailable(e.to_string()));
            }
        };

        if complete {
            self.observe_response_time(backend);
            self.tracker.reply_complete();

            if let Some(err) = reply.last_error.clone() {
                if is_ignorable_error(&err) {
                    return Ok(MasterForward::Consumed(err));
                }
            }

            let first_payload = first.payload.clone();
            client.send(first).await?;
            self.pick_up_session_track(&reply);
            if record_trx && self.trx.is_active() {
                let max = self.config.transaction_replay_max_size;
                self.trx.record_result_bytes(&first_payload, max);
                self.trx.record_statement(&payload, max);
            }
            return Ok(MasterForward::Streamed(reply));
        }

        // Multi-packet reply: the first packet is already committed to the
        // client, the rest streams as usual
        let mut capture = if record_trx { Some(Vec::new()) } else { None };
        if let Some(buf) = capture.as_mut() {
            let limit = self.config.transaction_replay_max_size as usize + 1;
            let take = limit.min(first.payload.len());
            buf.extend_from_slice(&first.payload[..take]);
        }
        client.send(first).await?;

        let reply = self
            .stream_reply(backend, Some(client), None, capture.as_mut())
            .await
            .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?;

        if let Some(buf) = capture {
            if self.trx.is_active() {
                let max = self.config.transaction_replay_max_size;
                self.trx.record_result_bytes(&buf, max);
                self.trx.record_statement(&payload, max);
            }
        }
        self.pick_up_session_track(&reply);
        Ok(MasterForward::Streamed(reply))
    }

    fn observe_response_time(&self, backend: &BackendSession) {
        let elapsed = backend
            .last_write_ts()
            .map(|t| t.elapsed().as_micros() as f64)
            .unwrap_or(0.0);
        backend.server().response_time.observe(elapsed);
    }

    fn pick_up_session_track(&mut self, reply: &Reply) {
        if let Some(gtid) = &reply.session_track.last_gtid {
            self.last_gtid = Some(gtid.clone());
        }
        if let Some(schema) = &reply.session_track.schema {
            self.current_db = Some(schema.clone());
        }
        if let Some(mode) = reply.session_track.sql_mode() {
            self.sql_mode = mode.to_string();
        }
        if let Some(state) = reply.session_track.trx_state {
            if !state.is_active() && self.trx.phase == TrxPhase::Ending {
                self.trx.end();
            }
        }
    }

    /// Route to the master, with WSREP retry and transaction replay on
    /// failure.
    async fn route_to_master(
        &mut self,
        packet: Packet,
        client: &mut dyn ClientWriter,
    ) -> Result<(), ProxyError> {
        // An optimistic read-only transaction hitting its first write is
        // rolled back on the slave and restarted on the master
        if self.trx.is_active() && self.trx.optimistic {
            if let Some(slave) = self.trx.target.take() {
                self.rollback_optimistic(&slave).await;
                return self.replay_transaction(Some(packet), client).await;
            }
        }

        let record = self.trx.is_active();
        let master = match self.ensure_master().await {
            Ok(name) => name,
            Err(e) => return self.handle_no_master(e, client).await,
        };
        self.trx.target.get_or_insert_with(|| master.clone());
        self.last_used = Some(master.clone());

        match self.forward_master(&master, packet.clone(), client, record).await {
            Ok(MasterForward::Streamed(_)) => Ok(()),
            Ok(MasterForward::Consumed(err)) => {
                // Treat the backend as broken and run the same recovery as
                // a lost connection: replay the transaction or retry the
                // statement
                warn!(
                    session_id = self.session_id,
                    error_code = err.error_code,
                    error = %err.error_message,
                    rollback = err.is_rollback_trigger(),
                    "Ignorable backend error consumed, retrying"
                );
                self.backends.remove(&master);
                self.master_name = None;
                self.retry_or_replay(packet, client).await
            }
            Err(e) if e.is_recoverable() => {
                debug!(session_id = self.session_id, error = %e, "Master failed mid-statement");
                self.backends.remove(&master);
                self.master_name = None;
                self.retry_or_replay(packet, client).await
            }
            Err(e) => Err(e),
        }
    }

    async fn retry_or_replay(
        &mut self,
        packet: Packet,
        client: &mut dyn ClientWriter,
    ) -> Result<(), ProxyError> {
        if self.trx.is_active() {
            self.replay_transaction(Some(packet), client).await
        } else if self.config.delayed_retry {
            let deadline = Instant::now() + Duration::from_secs(self.config.delayed_retry_timeout_s);
            loop {
                match self.ensure_master().await {
                    Ok(master) => {
                        self.last_used = Some(master.clone());
                        self.forward(&master, packet, client, false).await?;
                        return Ok(());
                    }
                    Err(e) => {
                        if Instant::now() >= deadline {
                            return Err(e);
                        }
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            }
        } else {
            let master = self.ensure_master().await?;
            self.last_used = Some(master.clone());
            self.forward(&master, packet, client, false).await?;
            Ok(())
        }
    }

    async fn handle_no_master(
        &mut self,
        err: ProxyError,
        client: &mut dyn ClientWriter,
    ) -> Result<(), ProxyError> {
        match self.config.master_failure_mode {
            // The session dies as soon as a statement needs the master
            MasterFailureMode::FailInstantly | MasterFailureMode::FailOnWrite => Err(err),
            MasterFailureMode::ErrorOnWrite => {
                // The session survives for reads; the write gets an error
                let packet = err
                    .to_err_packet()
                    .encode(1, crate::protocol::capabilities::CLIENT_PROTOCOL_41);
                client.send(packet).await?;
                Ok(())
            }
        }
    }

    async fn rollback_optimistic(&mut self, slave: &str) {
        info!(
            session_id = self.session_id,
            "Optimistic transaction turned out to write, restarting on master"
        );
        if let Ok(mut backend) = self.take_backend(slave) {
            if backend.write(Packet::query("ROLLBACK"), None).await.unwrap_or(false) {
                self.tracker.request_sent();
                let _ = self.stream_reply(&mut backend, None, None, None).await;
            }
            self.put_backend(slave, backend);
        }
    }

    /// Route a read to a slave, prepending MASTER_GTID_WAIT for causal
    /// reads after a write.
    async fn route_to_slave(
        &mut self,
        packet: Packet,
        client: &mut dyn ClientWriter,
        max_rlag: i64,
    ) -> Result<(), ProxyError> {
        let name = self.ensure_slave(max_rlag).await?;
        self.last_used = Some(name.clone());

        let causal = self.config.causal_reads
            && self.last_gtid.is_some()
            && self.wait_gtid == WaitGtid::None
            && self.backends.get(&name).map(|b| b.server().is_slave()).unwrap_or(false);

        if !causal {
            match self.forward(&name, packet.clone(), client, false).await {
                Ok(_) => {
                    self.wait_gtid = WaitGtid::None;
                    Ok(())
                }
                Err(e) if e.is_recoverable() => {
                    // Idempotent read: try one other backend
                    self.backends.remove(&name);
                    let retry = self.ensure_slave(max_rlag).await?;
                    self.forward(&retry, packet, client, false).await?;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        } else {
            self.causal_read(&name, packet, client).await
        }
    }

    /// Causal read: pipeline `SELECT MASTER_GTID_WAIT(...)` before the
    /// user statement, discard the first result and renumber the second
    /// from sequence 1.
    async fn causal_read(
        &mut self,
        name: &str,
        packet: Packet,
        client: &mut dyn ClientWriter,
    ) -> Result<(), ProxyError> {
        let Some(gtid) = self.last_gtid.clone() else {
            return self.forward(name, packet, client, false).await.map(|_| ());
        };
        let wait = Packet::query(&format!(
            "SELECT MASTER_GTID_WAIT('{}', {})",
            gtid, self.config.causal_reads_timeout_s
        ));

        let mut backend = self.take_backend(name)?;
        let result: Result<Option<Reply>, ProxyError> = async {
            backend
                .write(wait, None)
                .await
                .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?;
            self.tracker.request_sent();
            backend.write(packet.clone(), None).await.map_err(|e| {
                self.tracker.request_aborted();
                ProxyError::BackendUnavailable(e.to_string())
            })?;
            self.tracker.request_sent();

            // First reply belongs to MASTER_GTID_WAIT and is discarded
            let wait_reply = self
                .stream_reply(&mut backend, None, None, None)
                .await
                .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?;

            if wait_reply.is_error() {
                // Slave could not sync in time; drain the pipelined user
                // statement and retry it on the master
                let _ = self.stream_reply(&mut backend, None, None, None).await;
                self.wait_gtid = WaitGtid::RetryingOnMaster;
                return Ok(None);
            }

            let reply = self
                .stream_reply(&mut backend, Some(client), Some(1), None)
                .await
                .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?;
            Ok(Some(reply))
        }
        .await;

        self.put_backend(name, backend);

        match result? {
            Some(reply) => {
                self.pick_up_session_track(&reply);
                self.wait_gtid = WaitGtid::None;
                Ok(())
            }
            None => {
                // At most one master retry per statement
                debug!(session_id = self.session_id, "MASTER_GTID_WAIT failed, retrying on master");
                let master = self.ensure_master().await?;
                self.last_used = Some(master.clone());
                self.forward(&master, packet, client, false).await?;
                self.wait_gtid = WaitGtid::None;
                Ok(())
            }
        }
    }

    /// Session command: record in history, apply to every backend, answer
    /// the client from the first reply.
    async fn route_to_all(
        &mut self,
        packet: Packet,
        client: &mut dyn ClientWriter,
    ) -> Result<(), ProxyError> {
        let position = self.history.add(packet.payload.clone());

        if self.backends.is_empty() {
            // Nothing connected yet; pick up a backend so the command has
            // somewhere to live
            let name = match self.ensure_slave(self.config.max_slave_replication_lag).await {
                Ok(n) => n,
                Err(_) => self.ensure_master().await?,
            };
            self.last_used = Some(name);
        }

        let names: Vec<String> = self.backends.keys().cloned().collect();
        let mut replied = false;
        let mut first_error: Option<ProxyError> = None;

        for name in names {
            let mut backend = match self.take_backend(&name) {
                Ok(b) => b,
                Err(_) => continue,
            };

            let send = backend
                .execute_session_command(position, packet.payload.clone())
                .await;

            match send {
                Ok(true) => {
                    self.tracker.request_sent();
                    let dest: Option<&mut dyn ClientWriter> = if !replied {
                        Some(&mut *client)
                    } else {
                        None
                    };
                    match self.stream_reply(&mut backend, dest, None, None).await {
                        Ok(reply) => {
                            if !replied {
                                self.pick_up_session_track(&reply);
                                replied = true;
                            }
                            self.put_backend(&name, backend);
                        }
                        Err(e) => {
                            warn!(
                                session_id = self.session_id,
                                server = %name,
                                error = %e,
                                "Session command failed on backend"
                            );
                            backend.close(BackendCloseReason::BackendFailure);
                            self.put_backend(&name, backend);
                            if first_error.is_none() {
                                first_error = Some(ProxyError::BackendUnavailable(e.to_string()));
                            }
                        }
                    }
                }
                Ok(false) => self.put_backend(&name, backend),
                Err(e) => {
                    backend.close(BackendCloseReason::BackendFailure);
                    self.put_backend(&name, backend);
                    if first_error.is_none() {
                        first_error = Some(ProxyError::BackendUnavailable(e.to_string()));
                    }
                }
            }
        }

        if !replied {
            match first_error {
                Some(e) => Err(e),
                None => Err(ProxyError::RoutingPolicy(
                    "No backend available for session command".to_string(),
                )),
            }
        } else {
            Ok(())
        }
    }

    async fn route_to_named(
        &mut self,
        name: &str,
        packet: Packet,
        client: &mut dyn ClientWriter,
    ) -> Result<(), ProxyError> {
        let server = self
            .servers()
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| {
                ProxyError::RoutingPolicy(format!("Hinted server '{}' is not a target", name))
            })?;
        if !server.is_usable() {
            return Err(ProxyError::RoutingPolicy(format!(
                "Hinted server '{}' is not usable",
                name
            )));
        }
        self.acquire_backend(server).await?;
        self.last_used = Some(name.to_string());
        self.forward(name, packet, client, self.trx.is_active()).await?;
        Ok(())
    }

    /// COM_STMT_PREPARE goes to every connected backend; the client sees
    /// the internal id.
    async fn route_prepare(
        &mut self,
        packet: Packet,
        client: &mut dyn ClientWriter,
    ) -> Result<(), ProxyError> {
        // Make sure at least the master holds the statement
        let master = self.ensure_master().await?;
        self.last_used = Some(master.clone());

        let internal = self.ps.new_statement(packet.payload.clone());
        let names: Vec<String> = self.backends.keys().cloned().collect();
        let mut replied = false;

        for name in names {
            let mut backend = match self.take_backend(&name) {
                Ok(b) => b,
                Err(_) => continue,
            };
            let send = backend.write(packet.clone(), None).await;
            match send {
                Ok(true) => {
                    self.tracker.request_sent();
                    let reply = if !replied {
                        // Stream to the client with the id rewritten
                        let r = self
                            .stream_prepare_reply(&mut backend, client, internal)
                            .await;
                        replied = r.is_ok();
                        r
                    } else {
                        self.stream_reply(&mut backend, None, None, None)
                            .await
                            .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))
                    };
                    match reply {
                        Ok(r) => {
                            if let Some(ok) = r.prepare_ok {
                                self.ps.record_backend_id(internal, &name, ok.statement_id);
                            }
                            self.put_backend(&name, backend);
                        }
                        Err(_) => {
                            backend.close(BackendCloseReason::BackendFailure);
                            self.put_backend(&name, backend);
                        }
                    }
                }
                _ => {
                    backend.close(BackendCloseReason::BackendFailure);
                    self.put_backend(&name, backend);
                }
            }
        }

        if replied {
            Ok(())
        } else {
            Err(ProxyError::BackendUnavailable(
                "No backend completed the prepare".to_string(),
            ))
        }
    }

    async fn stream_prepare_reply(
        &mut self,
        backend: &mut BackendSession,
        client: &mut dyn ClientWriter,
        internal: u32,
    ) -> Result<Reply, ProxyError> {
        loop {
            let (mut packet, reply, complete) = backend
                .read_reply_packet()
                .await
                .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?;

            // First packet carries the backend-local statement id
            if packet.first_byte() == Some(0x00) && reply.prepare_ok.is_some() {
                let mut payload = packet.payload.to_vec();
                PrepareOk::rewrite_statement_id(&mut payload, internal);
                packet = Packet::new(packet.sequence_id, payload);
            }

            client.send(packet).await?;

            if complete {
                self.tracker.reply_complete();
                return Ok(reply);
            }
        }
    }

    /// Prepared-statement commands resolve their target through the id map
    async fn route_ps_command(
        &mut self,
        c: &Classification,
        packet: Packet,
        client: &mut dyn ClientWriter,
    ) -> Result<(), ProxyError> {
        let internal = c.statement_id.unwrap_or(0);
        let command = Command::from(c.command);

        // Execution follows the normal decision table; metadata commands
        // stick to wherever the statement lives
        let name = if self.trx.is_active() {
            self.ensure_master().await?
        } else if command == Command::StmtExecute || command == Command::StmtBulkExecute {
            self.ensure_slave(self.config.max_slave_replication_lag).await?
        } else {
            match &self.last_used {
                Some(n) if self.backends.contains_key(n) => n.clone(),
                _ => self.ensure_master().await?,
            }
        };

        // Late preparation: the chosen backend may not hold the statement
        if self.ps.backend_id(internal, &name).is_none() {
            if let Some(payload) = self.ps.prepare_payloads.get(&internal).cloned() {
                let mut backend = self.take_backend(&name)?;
                let prep = async {
                    backend
                        .write(Packet::new(0, payload), None)
                        .await
                        .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?;
                    self.tracker.request_sent();
                    self.stream_reply(&mut backend, None, None, None)
                        .await
                        .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))
                }
                .await;
                match prep {
                    Ok(reply) => {
                        if let Some(ok) = reply.prepare_ok {
                            self.ps.record_backend_id(internal, &name, ok.statement_id);
                        }
                        self.put_backend(&name, backend);
                    }
                    Err(e) => {
                        backend.close(BackendCloseReason::BackendFailure);
                        self.put_backend(&name, backend);
                        return Err(e);
                    }
                }
            }
        }

        let backend_id = self.ps.backend_id(internal, &name).ok_or_else(|| {
            ProxyError::RoutingPolicy(format!("Unknown prepared statement {}", internal))
        })?;

        let rewritten = Packet::new(
            packet.sequence_id,
            rewrite_statement_id(&packet.payload, backend_id),
        );

        self.last_used = Some(name.clone());

        if command == Command::StmtClose {
            // No reply; fan the close out to every backend holding the id
            let names: Vec<String> = self.backends.keys().cloned().collect();
            for n in names {
                if let Some(bid) = self.ps.backend_id(internal, &n) {
                    if let Ok(mut backend) = self.take_backend(&n) {
                        let p = Packet::new(0, rewrite_statement_id(&packet.payload, bid));
                        let _ = backend.write(p, None).await;
                        self.put_backend(&n, backend);
                    }
                }
            }
            self.ps.forget(internal);
            return Ok(());
        }

        self.forward(&name, rewritten, client, self.trx.is_active()).await?;
        Ok(())
    }

    /// Replay the buffered transaction on a fresh master. When `pending`
    /// is set it is the interrupted statement, re-issued (and streamed to
    /// the client) after the replay checks out.
    async fn replay_transaction(
        &mut self,
        pending: Option<Packet>,
        client: &mut dyn ClientWriter,
    ) -> Result<(), ProxyError> {
        if !self.config.transaction_replay || !self.trx.can_replay {
            return Err(ProxyError::FatalSession(
                "Transaction cannot be replayed".to_string(),
            ));
        }
        self.trx.attempts += 1;
        if self.trx.attempts > self.config.transaction_replay_attempts {
            return Err(ProxyError::FatalSession(format!(
                "Transaction replay limit ({}) exceeded",
                self.config.transaction_replay_attempts
            )));
        }

        info!(
            session_id = self.session_id,
            attempt = self.trx.attempts,
            statements = self.trx.statements.len(),
            "Replaying transaction"
        );
        crate::metrics::metrics().trx_replays.inc();

        // Open a new master, honoring the delayed-retry budget
        let deadline = Instant::now() + Duration::from_secs(self.config.delayed_retry_timeout_s);
        let master = loop {
            match self.ensure_master().await {
                Ok(name) => break name,
                Err(e) => {
                    if !self.config.delayed_retry || Instant::now() >= deadline {
                        return Err(e);
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        };
        self.trx.target = Some(master.clone());
        self.trx.optimistic = false;
        self.trx.phase = TrxPhase::ActiveRw;

        // Nothing was delivered yet: just retry the interrupted statement
        if self.trx.statements.is_empty() {
            if let Some(packet) = pending {
                self.forward(&master, packet, client, true).await?;
            }
            return Ok(());
        }

        let statements = self.trx.statements.clone();
        let mut replay_checksum = Sha1::new();
        let mut backend = self.take_backend(&master)?;

        let replay_result: Result<(), ProxyError> = async {
            for payload in &statements {
                backend
                    .write(Packet::new(0, payload.clone()), None)
                    .await
                    .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?;
                self.tracker.request_sent();
                loop {
                    let (packet, reply, complete) = backend
                        .read_reply_packet()
                        .await
                        .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?;
                    replay_checksum.update(&packet.payload);
                    if complete {
                        self.tracker.reply_complete();
                        if let Some(err) = reply.last_error {
                            return Err(ProxyError::BackendUnavailable(format!(
                                "replayed statement failed: {}",
                                err.error_message
                            )));
                        }
                        break;
                    }
                }
            }
            Ok(())
        }
        .await;

        match replay_result {
            Ok(()) => self.put_backend(&master, backend),
            Err(e) => {
                backend.close(BackendCloseReason::BackendFailure);
                self.put_backend(&master, backend);
                return Err(e);
            }
        }

        let original = self.trx.checksum.clone().finalize();
        let replayed = replay_checksum.finalize();
        if original != replayed {
            return Err(ProxyError::FatalSession(
                "Transaction checksum mismatch encountered when replaying transaction".to_string(),
            ));
        }
        info!(session_id = self.session_id, "Transaction replay checksums match");

        if let Some(packet) = pending {
            self.forward(&master, packet, client, true).await?;
        }
        Ok(())
    }

    /// Ping backends idle past `connection_keepalive`
    pub async fn keepalive(&mut self) {
        let interval = Duration::from_secs(self.config.connection_keepalive_s);
        if self.last_keepalive.elapsed() < interval {
            return;
        }
        self.last_keepalive = Instant::now();

        let names: Vec<String> = self.backends.keys().cloned().collect();
        for name in names {
            let idle = self
                .backends
                .get(&name)
                .and_then(|b| b.last_write_ts())
                .map(|t| t.elapsed() >= interval)
                .unwrap_or(true);
            if !idle {
                continue;
            }
            if let Ok(mut backend) = self.take_backend(&name) {
                if backend.is_waiting_result() {
                    self.put_backend(&name, backend);
                    continue;
                }
                match backend.ping().await {
                    Ok(()) => self.put_backend(&name, backend),
                    Err(e) => {
                        debug!(server = %name, error = %e, "Keepalive ping failed");
                        backend.close(BackendCloseReason::BackendFailure);
                        self.put_backend(&name, backend);
                    }
                }
            }
        }
    }

    fn retain_statement(&mut self, payload: &Bytes) {
        if self.config.retain_last_statements == 0 {
            return;
        }
        if payload.first() == Some(&0x03) {
            let sql = String::from_utf8_lossy(&payload[1..]).to_string();
            if self.retained.len() >= self.config.retain_last_statements {
                self.retained.pop_front();
            }
            self.retained.push_back(sql);
        }
    }

    /// Recent statements, oldest first
    pub fn retained_statements(&self) -> Vec<String> {
        self.retained.iter().cloned().collect()
    }
}

fn empty_reply() -> Reply {
    Reply {
        command: Command::Query,
        state: crate::protocol::ReplyState::Done,
        last_error: None,
        affected_rows: 0,
        last_insert_id: 0,
        server_status: 0,
        session_track: Default::default(),
        field_count: 0,
        result_bytes: 0,
        is_local_infile: false,
        prepare_ok: None,
    }
}

#[async_trait::async_trait]
impl RouterSession for RwSplitSession {
    async fn route_query(
        &mut self,
        packet: Packet,
        client: &mut dyn ClientWriter,
    ) -> Result<(), ProxyError> {
        self.keepalive().await;
        self.retain_statement(&packet.payload);

        let c = self.classifier.classify(&packet.payload, &self.sql_mode);
        if let Some(mode) = &c.sql_mode_after {
            self.sql_mode = mode.clone();
        }

        let command = Command::from(c.command);
        let mask = c.type_mask;

        // Prepared-statement commands resolve through the id map
        if command == Command::StmtPrepare {
            return self.route_prepare(packet, client).await;
        }
        if c.statement_id.is_some() {
            return self.route_ps_command(&c, packet, client).await;
        }

        // Transaction bookkeeping ahead of routing
        if mask.contains(TypeMask::BEGIN_TRX) {
            let optimistic = self.config.optimistic_trx && !mask.contains(TypeMask::WRITE);
            self.trx
                .begin(c.read_only_trx, optimistic, self.config.transaction_replay);
        } else if mask.intersects(TypeMask::COMMIT | TypeMask::ROLLBACK) {
            self.trx.phase = TrxPhase::Ending;
        }

        let sql_hint = if command == Command::Query {
            let sql = String::from_utf8_lossy(&packet.payload[1..]).to_string();
            RoutingHint::parse(&sql)
        } else {
            None
        };

        let target = decide_target(mask, sql_hint.as_ref(), self.trx.phase);

        let target_label = match &target {
            RouteTarget::Master => "master",
            RouteTarget::Slave | RouteTarget::RlagMax(_) => "slave",
            RouteTarget::All => "all",
            RouteTarget::NamedServer(_) => "named",
            RouteTarget::LastUsed => "last_used",
        };
        crate::metrics::metrics()
            .queries_routed
            .with_label_values(&[target_label])
            .inc();

        let result = match target {
            RouteTarget::Master => self.route_to_master(packet, client).await,
            RouteTarget::Slave => {
                let r = self
                    .route_to_slave(packet, client, self.config.max_slave_replication_lag)
                    .await;
                // Optimistic read-only transactions pin to the slave that
                // opened them
                if r.is_ok() && self.trx.is_active() && self.trx.target.is_none() {
                    self.trx.target = self.last_used.clone();
                }
                r
            }
            RouteTarget::RlagMax(lag) => self.route_to_slave(packet, client, lag).await,
            RouteTarget::All => self.route_to_all(packet, client).await,
            RouteTarget::NamedServer(name) => self.route_to_named(&name, packet, client).await,
            RouteTarget::LastUsed => {
                let name = match &self.trx.target {
                    Some(n) if self.backends.contains_key(n) => n.clone(),
                    _ => match &self.last_used {
                        Some(n) if self.backends.contains_key(n) => n.clone(),
                        _ => self.ensure_slave(self.config.max_slave_replication_lag).await?,
                    },
                };
                self.forward(&name, packet, client, self.trx.is_active())
                    .await
                    .map(|_| ())
            }
        };

        // COMMIT/ROLLBACK completed: the transaction context is done
        if self.trx.phase == TrxPhase::Ending && result.is_ok() {
            self.trx.end();
        }

        result
    }

    fn close(&mut self) {
        for (_, mut backend) in self.backends.drain() {
            backend.close(BackendCloseReason::SessionClosed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decide_target_reads_go_to_slave() {
        let t = decide_target(TypeMask::READ, None, TrxPhase::Inactive);
        assert_eq!(t, RouteTarget::Slave);
    }

    #[test]
    fn test_decide_target_writes_go_to_master() {
        for mask in [
            TypeMask::WRITE,
            TypeMask::GSYSVAR_WRITE,
            TypeMask::CREATE_TMP_TABLE | TypeMask::WRITE,
            TypeMask::PREPARE_NAMED_STMT,
        ] {
            assert_eq!(
                decide_target(mask, None, TrxPhase::Inactive),
                RouteTarget::Master,
                "{:?}",
                mask
            );
        }
    }

    #[test]
    fn test_decide_target_session_writes_broadcast() {
        for mask in [
            TypeMask::SESSION_WRITE,
            TypeMask::USERVAR_WRITE | TypeMask::SESSION_WRITE,
        ] {
            assert_eq!(
                decide_target(mask, None, TrxPhase::Inactive),
                RouteTarget::All
            );
        }
    }

    #[test]
    fn test_decide_target_rw_trx_locks_to_master() {
        assert_eq!(
            decide_target(TypeMask::READ, None, TrxPhase::ActiveRw),
            RouteTarget::Master
        );
    }

    #[test]
    fn test_decide_target_ro_trx_stays_on_node() {
        assert_eq!(
            decide_target(TypeMask::READ, None, TrxPhase::ActiveRo),
            RouteTarget::LastUsed
        );
        // A write inside a read-only transaction escapes to the master
        assert_eq!(
            decide_target(TypeMask::WRITE, None, TrxPhase::ActiveRo),
            RouteTarget::Master
        );
    }

    #[test]
    fn test_decide_target_hint_overrides() {
        assert_eq!(
            decide_target(TypeMask::WRITE, Some(&RoutingHint::ToSlave), TrxPhase::Inactive),
            RouteTarget::Slave
        );
        assert_eq!(
            decide_target(
                TypeMask::READ,
                Some(&RoutingHint::ToServer("db3".into())),
                TrxPhase::Inactive,
            ),
            RouteTarget::NamedServer("db3".into())
        );
    }

    #[test]
    fn test_decide_target_commit_goes_to_master() {
        assert_eq!(
            decide_target(TypeMask::COMMIT, None, TrxPhase::Ending),
            RouteTarget::Master
        );
    }

    #[test]
    fn test_trx_context_checksum_accumulates() {
        let mut trx = TrxContext::default();
        trx.begin(false, false, true);
        assert_eq!(trx.phase, TrxPhase::ActiveRw);

        trx.record_result_bytes(b"result-a", u64::MAX);
        let after_a = trx.checksum.clone().finalize();
        trx.record_result_bytes(b"result-b", u64::MAX);
        let after_b = trx.checksum.clone().finalize();
        assert_ne!(after_a, after_b);

        // Equal inputs give equal checksums
        let mut other = TrxContext::default();
        other.begin(false, false, true);
        other.record_result_bytes(b"result-a", u64::MAX);
        other.record_result_bytes(b"result-b", u64::MAX);
        assert_eq!(after_b, other.checksum.clone().finalize());
    }

    #[test]
    fn test_trx_context_size_limit_disables_replay() {
        let mut trx = TrxContext::default();
        trx.begin(false, false, true);
        trx.record_statement(&Bytes::from(vec![0u8; 100]), 150);
        assert!(trx.can_replay);
        assert_eq!(trx.statements.len(), 1);

        // Crossing the limit silently marks the trx non-replayable
        trx.record_statement(&Bytes::from(vec![0u8; 100]), 150);
        assert!(!trx.can_replay);
        assert!(trx.statements.is_empty());

        // Later data is ignored
        trx.record_result_bytes(b"xyz", 150);
        assert!(!trx.can_replay);
    }

    #[test]
    fn test_trx_begin_read_only() {
        let mut trx = TrxContext::default();
        trx.begin(true, false, true);
        assert_eq!(trx.phase, TrxPhase::ActiveRo);
        trx.end();
        assert_eq!(trx.phase, TrxPhase::Inactive);
    }

    #[test]
    fn test_ignorable_errors() {
        use crate::protocol::ErrPacket;

        let wsrep = ErrPacket::new(1047, "08S01", "WSREP has not yet prepared node for application use");
        assert!(is_ignorable_error(&wsrep));

        let deadlock = ErrPacket::new(1213, "40001", "Deadlock found when trying to get lock");
        assert!(is_ignorable_error(&deadlock));

        // Ordinary errors reach the client untouched
        let syntax = ErrPacket::new(1064, "42000", "You have an error in your SQL syntax");
        assert!(!is_ignorable_error(&syntax));
        let denied = ErrPacket::new(1045, "28000", "Access denied");
        assert!(!is_ignorable_error(&denied));
    }

    #[test]
    fn test_ps_tracker_id_mapping() {
        let mut ps = PsTracker::default();
        let a = ps.new_statement(Bytes::from_static(b"\x16SELECT ?"));
        let b = ps.new_statement(Bytes::from_static(b"\x16SELECT ?, ?"));
        assert_ne!(a, b);

        ps.record_backend_id(a, "db1", 100);
        ps.record_backend_id(a, "db2", 7);
        assert_eq!(ps.backend_id(a, "db1"), Some(100));
        assert_eq!(ps.backend_id(a, "db2"), Some(7));
        assert_eq!(ps.backend_id(a, "db3"), None);
        assert_eq!(ps.backend_id(b, "db1"), None);

        ps.forget(a);
        assert_eq!(ps.backend_id(a, "db1"), None);
    }
}
