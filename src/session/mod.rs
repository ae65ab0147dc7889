//! Client sessions.
//!
//! A session owns the client-facing protocol state, the router session and
//! (through it) the backend sessions. It drives the handshake, applies the
//! filter chain in both directions and maps router errors to MySQL ERR
//! packets.

pub mod history;
mod state;

pub use state::{CloseReason, SessionPhase, SessionState};

use std::sync::Arc;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendConnection, BackendTimeouts};
use crate::error::{AuthFailureKind, ProxyError};
use crate::filter::{Capabilities, FilterAction, FilterSession};
use crate::metrics::metrics;
use crate::protocol::{
    verify_with_stored_hash, AuthSwitchRequest, ClientCommand, ErrPacket, HandshakeResponse,
    InitialHandshake, KillQuery, KillScope, KillTarget, OkPacket, Packet, PacketAccumulator,
    PacketCodec, SCRAMBLE_SIZE,
};
use crate::router::{
    capabilities_for, ClientWriter, RouterSession, RwSplitSession, SchemaRouterSession,
};
use crate::service::{Listener, Registry};

/// Live sessions by thread id, for KILL routing
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<u64, SessionHandle>,
}

#[derive(Clone)]
pub struct SessionHandle {
    pub username: String,
    pub cancel: CancellationToken,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: u64, username: &str) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.sessions.insert(
            id,
            SessionHandle {
                username: username.to_string(),
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    pub fn deregister(&self, id: u64) {
        self.sessions.remove(&id);
    }

    /// Kill by thread id; true when a session was found
    pub fn kill_id(&self, id: u64) -> bool {
        match self.sessions.get(&id) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Kill every session of a user; returns how many were signalled
    pub fn kill_user(&self, user: &str) -> usize {
        let mut killed = 0;
        for entry in self.sessions.iter() {
            if entry.value().username == user {
                entry.value().cancel.cancel();
                killed += 1;
            }
        }
        killed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Reply-direction filter application + client socket
struct FilteredClientWriter<'a, S> {
    framed: &'a mut Framed<S, PacketCodec>,
    filters: &'a mut [Box<dyn FilterSession>],
}

#[async_trait::async_trait]
impl<'a, S> ClientWriter for FilteredClientWriter<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, packet: Packet) -> Result<(), ProxyError> {
        let mut packet = packet;
        // Reply filters run in reverse chain order
        for filter in self.filters.iter_mut().rev() {
            packet = filter.client_reply(packet);
        }
        self.framed.send(packet).await.map_err(ProxyError::Io)?;
        Ok(())
    }
}

/// One client connection
pub struct Session {
    pub id: u64,
    pub state: SessionState,
    listener: Arc<Listener>,
    registry: Arc<Registry>,
    sessions: Arc<SessionRegistry>,
    filters: Vec<Box<dyn FilterSession>>,
    router: Option<Box<dyn RouterSession>>,
    client_host: String,
    scramble: [u8; SCRAMBLE_SIZE],
    /// Capability union of router and filters, snapshotted at session
    /// start; never re-read after a broadcast update
    capabilities: Capabilities,
}

/// Canonicalise the client address so host grants match regardless of
/// whether the socket reported an IPv4 or an IPv4-mapped IPv6 peer.
fn canonical_host(host: &str) -> String {
    match host.parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        Ok(ip) => ip.to_string(),
        Err(_) => host.to_string(),
    }
}

impl Session {
    pub fn new(
        id: u64,
        listener: Arc<Listener>,
        registry: Arc<Registry>,
        sessions: Arc<SessionRegistry>,
        client_host: String,
    ) -> Self {
        Self {
            id,
            state: SessionState::new(),
            listener,
            registry,
            sessions,
            filters: Vec::new(),
            router: None,
            client_host: canonical_host(&client_host),
            scramble: [0u8; SCRAMBLE_SIZE],
            capabilities: Capabilities::empty(),
        }
    }

    /// Drive the whole session: handshake, authentication, command loop.
    pub async fn run<S>(mut self, client_stream: S) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let service = self.listener.service.clone();
        service.session_started();
        let mut client = Framed::new(client_stream, PacketCodec::new());

        let result = self.run_inner(&mut client).await;

        if let Err(e) = &result {
            let reason = match e {
                ProxyError::AuthFailure { .. } => CloseReason::AuthFailure,
                ProxyError::WireFormat(_) => CloseReason::RoutingFailed,
                ProxyError::BackendUnavailable(_) => CloseReason::BackendFailure,
                ProxyError::RoutingPolicy(_) | ProxyError::FatalSession(_) => {
                    CloseReason::RoutingFailed
                }
                _ => CloseReason::RoutingFailed,
            };
            self.state.stop(reason);

            // Every failure the client sees is a well-formed ERR packet
            let seq = if matches!(e, ProxyError::AuthFailure { .. }) { 2 } else { 1 };
            let packet = e.to_err_packet().encode(seq, self.state.capability_flags);
            let _ = client.send(packet).await;
        } else {
            self.state.stop(CloseReason::ClientQuit);
        }

        if let Some(mut router) = self.router.take() {
            router.close();
        }
        self.sessions.deregister(self.id);
        self.state.stopped();
        service.session_ended();
        info!(
            session_id = self.id,
            reason = ?self.state.close_reason,
            "Session ended"
        );
        result
    }

    async fn run_inner<S>(&mut self, client: &mut Framed<S, PacketCodec>) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if self.listener.service.at_connection_limit() {
            return Err(ProxyError::RoutingPolicy(format!(
                "Too many connections to service '{}'",
                self.listener.service.name
            )));
        }
        if self.listener.is_host_blocked(&self.client_host) {
            return Err(ProxyError::auth(
                AuthFailureKind::Generic,
                "",
                format!("Host '{}' is blocked", self.client_host),
            ));
        }

        self.handshake(client).await?;
        self.state.start();
        let cancel = self.sessions.register(self.id, &self.state.username);
        metrics().sessions_started.inc();

        // Filter-chain instances for this session
        for (_, filter) in self.listener.service.filters() {
            self.filters.push(filter.new_session());
        }

        // The router session; capability snapshot happens here
        let service = self.listener.service.clone();
        self.capabilities = service.capabilities() | capabilities_for(&service.router);
        let router: Box<dyn RouterSession> = match service.router.as_str() {
            "schemarouter" => Box::new(SchemaRouterSession::new(
                self.id,
                service.clone(),
                self.registry.clone(),
                self.state.database.clone(),
                self.state.capability_flags,
            )),
            _ => Box::new(RwSplitSession::new(
                self.id,
                service.clone(),
                self.registry.clone(),
                self.state.database.clone(),
            )),
        };
        self.router = Some(router);

        let session_id = self.id;
        tokio::select! {
            r = self.command_loop(client) => r,
            _ = cancel.cancelled() => {
                debug!(session_id, "Session killed");
                Err(ProxyError::FatalSession("session killed by administrator".to_string()))
            }
        }
    }

    /// Server-side handshake: greeting, response, scramble verification.
    async fn handshake<S>(&mut self, client: &mut Framed<S, PacketCodec>) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let version = self
            .registry
            .servers()
            .first()
            .map(|s| s.version_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "10.6.11-MariaDB-bifrost".to_string());

        let handshake = InitialHandshake::new(self.id as u32, &version, self.listener.has_tls());
        self.scramble = handshake.scramble;
        client.send(handshake.encode()).await.map_err(ProxyError::Io)?;

        let response_packet = client
            .next()
            .await
            .ok_or_else(|| ProxyError::WireFormat("client closed during handshake".into()))?
            .map_err(ProxyError::Io)?;

        // An SSLRequest-sized packet wants a TLS upgrade; the TLS wrapper
        // is outside this core
        if HandshakeResponse::is_ssl_request(&response_packet.payload) {
            return Err(ProxyError::auth(
                AuthFailureKind::FailedSsl,
                "",
                "Access without SSL denied".to_string(),
            ));
        }

        let response = HandshakeResponse::parse(&response_packet.payload).ok_or_else(|| {
            ProxyError::auth(AuthFailureKind::BadHandshake, "", "Bad handshake".to_string())
        })?;

        debug!(
            session_id = self.id,
            username = %response.username,
            database = ?response.database,
            plugin = %response.auth_plugin_name,
            "Received handshake response"
        );

        self.state.set_from_handshake(
            response.username.clone(),
            response.database.clone(),
            response.capability_flags,
            response.character_set,
        );

        // Plugin mismatch: switch the client to native password
        let (token, ok_seq) = if response.auth_plugin_name != "mysql_native_password" {
            let switch = AuthSwitchRequest::new(self.scramble);
            client
                .send(switch.encode(response_packet.sequence_id.wrapping_add(1)))
                .await
                .map_err(ProxyError::Io)?;
            let answer = client
                .next()
                .await
                .ok_or_else(|| ProxyError::WireFormat("client closed during auth switch".into()))?
                .map_err(ProxyError::Io)?;
            if answer.payload.len() != SCRAMBLE_SIZE && !answer.payload.is_empty() {
                return Err(ProxyError::auth(
                    AuthFailureKind::BadHandshake,
                    response.username.clone(),
                    "Malformed auth switch response".to_string(),
                ));
            }
            (answer.payload.to_vec(), answer.sequence_id.wrapping_add(1))
        } else {
            (
                response.auth_response.clone(),
                response_packet.sequence_id.wrapping_add(1),
            )
        };

        self.authenticate(&response.username, &token, response.database.as_deref())
            .await?;

        self.listener.clear_auth_failures(&self.client_host);
        let ok = OkPacket::new();
        client
            .send(ok.encode(ok_seq, self.state.capability_flags))
            .await
            .map_err(ProxyError::Io)?;

        info!(
            session_id = self.id,
            username = %self.state.username,
            "Client authenticated"
        );
        Ok(())
    }

    /// Check the credentials against the service's user cache, loading or
    /// refreshing it when needed.
    async fn authenticate(
        &mut self,
        username: &str,
        token: &[u8],
        database: Option<&str>,
    ) -> Result<(), ProxyError> {
        let service = self.listener.service.clone();
        let cache = service.user_cache.clone();

        if cache.user_count() == 0 {
            self.load_user_cache().await;
        }

        let mut entry = cache.match_user(username, &self.client_host, database);

        // A miss may mean the cache is stale; refresh once, throttled
        if entry.is_none() && cache.refresh_allowed() {
            self.load_user_cache().await;
            entry = cache.match_user(username, &self.client_host, database);
        }

        let entry = match entry {
            Some(e) => e,
            None => {
                metrics().auth_failures.inc();
                self.listener.record_auth_failure(&self.client_host);
                // Distinguish a bad database from a bad user where we can
                if let Some(db) = database {
                    if cache.user_count() > 0
                        && cache.match_user(username, &self.client_host, None).is_some()
                        && !cache.database_exists(db)
                    {
                        return Err(ProxyError::auth(
                            AuthFailureKind::FailedDb,
                            username,
                            format!("Unknown database '{}'", db),
                        ));
                    }
                }
                return Err(ProxyError::auth(
                    AuthFailureKind::Generic,
                    username,
                    format!(
                        "Access denied for user '{}'@'{}'",
                        username, self.client_host
                    ),
                ));
            }
        };

        let valid = if entry.password.is_empty() {
            token.is_empty()
        } else {
            verify_with_stored_hash(token, &self.scramble, &entry.password)
        };

        if !valid {
            metrics().auth_failures.inc();
            self.listener.record_auth_failure(&self.client_host);
            return Err(ProxyError::auth(
                AuthFailureKind::Generic,
                username,
                format!(
                    "Access denied for user '{}'@'{}' (using password: {})",
                    username,
                    self.client_host,
                    if token.is_empty() { "NO" } else { "YES" }
                ),
            ));
        }

        Ok(())
    }

    /// Load the user cache from the first reachable target server
    async fn load_user_cache(&self) {
        let service = self.listener.service.clone();
        let params = service.params();
        let timeouts = BackendTimeouts::default();

        for server in service.servers(&self.registry) {
            if !server.is_usable() && !server.is_running() {
                continue;
            }
            let addr = server.endpoint.to_string();
            match BackendConnection::connect(&addr, &params.user, &params.password, None, timeouts)
                .await
            {
                Ok(mut conn) => match service.user_cache.load_from_backend(&mut conn).await {
                    Ok(count) => {
                        debug!(
                            session_id = self.id,
                            server = %server.name,
                            users = count,
                            "User cache loaded"
                        );
                        // The service's own user always works as fallback
                        service.user_cache.inject_service_user(
                            &params.user,
                            &crate::protocol::stored_hash_for_password(&params.password),
                        );
                        return;
                    }
                    Err(e) => {
                        warn!(session_id = self.id, server = %server.name, error = %e, "User load failed")
                    }
                },
                Err(e) => {
                    debug!(session_id = self.id, server = %server.name, error = %e, "User load connect failed")
                }
            }
        }
    }

    /// Main command loop: one logical packet in, one routed reply out.
    async fn command_loop<S>(
        &mut self,
        client: &mut Framed<S, PacketCodec>,
    ) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut accumulator = PacketAccumulator::new();

        loop {
            let wire_packet = match client.next().await {
                Some(Ok(p)) => p,
                Some(Err(e)) => {
                    warn!(session_id = self.id, error = %e, "Client read error");
                    return Err(ProxyError::Io(e));
                }
                None => {
                    debug!(session_id = self.id, "Client disconnected");
                    return Ok(());
                }
            };

            // Routers requiring contiguous input get the logical command
            // reassembled across continuation packets
            let packet = if self.capabilities.contains(Capabilities::CONTIGUOUS_INPUT) {
                match accumulator.push(wire_packet) {
                    Some(p) => p,
                    None => continue,
                }
            } else {
                wire_packet
            };

            let command = ClientCommand::parse(&packet.payload);

            match &command {
                ClientCommand::Quit => {
                    debug!(session_id = self.id, "Client sent QUIT");
                    return Ok(());
                }
                ClientCommand::Ping => {
                    let ok = OkPacket::new();
                    client
                        .send(ok.encode(1, self.state.capability_flags))
                        .await
                        .map_err(ProxyError::Io)?;
                    continue;
                }
                ClientCommand::SetOption(value) => {
                    // 0 enables multi-statements, 1 disables
                    self.state.multi_statements = *value == 0;
                }
                ClientCommand::ProcessKill(id) => {
                    self.execute_kill(client, KillTarget::Id(*id), KillScope::Connection)
                        .await?;
                    continue;
                }
                ClientCommand::Query(sql) if KillQuery::is_kill_query(sql) => {
                    match KillQuery::parse(sql) {
                        Some(kill) => {
                            self.execute_kill(client, kill.target, kill.scope).await?;
                        }
                        None => {
                            let err = ErrPacket::new(
                                1064,
                                "42000",
                                "You have an error in your SQL syntax near 'KILL'",
                            );
                            client
                                .send(err.encode(1, self.state.capability_flags))
                                .await
                                .map_err(ProxyError::Io)?;
                        }
                    }
                    continue;
                }
                ClientCommand::ChangeUser {
                    username,
                    auth_response,
                    database,
                    ..
                } => {
                    // Re-authentication against the same scramble
                    let username = username.clone();
                    let auth_response = auth_response.clone();
                    let database = database.clone();
                    match self
                        .authenticate(&username, &auth_response, database.as_deref())
                        .await
                    {
                        Ok(()) => {
                            self.state.username = username;
                            self.state.database = database;
                            // Backends keep their service credentials; the
                            // identity change is proxy-local
                            let ok = OkPacket::new();
                            client
                                .send(ok.encode(1, self.state.capability_flags))
                                .await
                                .map_err(ProxyError::Io)?;
                        }
                        Err(e) => {
                            let err = e.to_err_packet();
                            client
                                .send(err.encode(1, self.state.capability_flags))
                                .await
                                .map_err(ProxyError::Io)?;
                        }
                    }
                    continue;
                }
                ClientCommand::InitDb(db) => {
                    self.state.change_database(db.clone());
                }
                _ => {}
            }

            self.dispatch(client, packet).await?;
        }
    }

    /// Run the query-direction filter chain, then hand to the router
    async fn dispatch<S>(
        &mut self,
        client: &mut Framed<S, PacketCodec>,
        packet: Packet,
    ) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut packet = packet;
        for filter in self.filters.iter_mut() {
            match filter.route_query(packet) {
                FilterAction::Continue(p) => packet = p,
                FilterAction::Block(err) => {
                    client
                        .send(err.encode(1, self.state.capability_flags))
                        .await
                        .map_err(ProxyError::Io)?;
                    return Ok(());
                }
            }
        }

        let router = self
            .router
            .as_mut()
            .ok_or_else(|| ProxyError::RoutingPolicy("No router session".to_string()))?;

        let mut writer = FilteredClientWriter {
            framed: client,
            filters: &mut self.filters,
        };

        metrics().queries_total.inc();
        router.route_query(packet, &mut writer).await
    }

    async fn execute_kill<S>(
        &mut self,
        client: &mut Framed<S, PacketCodec>,
        target: KillTarget,
        scope: KillScope,
    ) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        // Query-scope kills would need per-statement interruption; both
        // scopes cancel the target session here
        let _ = scope;
        let found = match &target {
            KillTarget::Id(id) => self.sessions.kill_id(*id),
            KillTarget::User(user) => self.sessions.kill_user(user) > 0,
        };

        let packet = if found {
            OkPacket::new().encode(1, self.state.capability_flags)
        } else {
            match target {
                KillTarget::Id(id) => ErrPacket::new(
                    1094,
                    "HY000",
                    &format!("Unknown thread id: {}", id),
                )
                .encode(1, self.state.capability_flags),
                KillTarget::User(_) => OkPacket::new().encode(1, self.state.capability_flags),
            }
        };
        client.send(packet).await.map_err(ProxyError::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_host() {
        assert_eq!(canonical_host("10.0.0.1"), "10.0.0.1");
        assert_eq!(canonical_host("::ffff:127.0.0.1"), "127.0.0.1");
        assert_eq!(canonical_host("::1"), "::1");
        assert_eq!(canonical_host("not-an-ip.example"), "not-an-ip.example");
    }

    #[test]
    fn test_session_registry_kill_by_id() {
        let registry = SessionRegistry::new();
        let token = registry.register(7, "alice");
        assert!(!token.is_cancelled());

        assert!(registry.kill_id(7));
        assert!(token.is_cancelled());
        assert!(!registry.kill_id(99));
    }

    #[test]
    fn test_session_registry_kill_by_user() {
        let registry = SessionRegistry::new();
        let t1 = registry.register(1, "app");
        let t2 = registry.register(2, "app");
        let t3 = registry.register(3, "admin");

        assert_eq!(registry.kill_user("app"), 2);
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
        assert!(!t3.is_cancelled());
    }

    #[test]
    fn test_session_registry_deregister() {
        let registry = SessionRegistry::new();
        registry.register(5, "x");
        assert_eq!(registry.len(), 1);
        registry.deregister(5);
        assert!(registry.is_empty());
        assert!(!registry.kill_id(5));
    }
}
