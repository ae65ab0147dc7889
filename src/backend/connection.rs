use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, error};

use crate::protocol::{
    capabilities, compute_auth_response, get_lenenc_int, is_eof_packet, is_err_packet,
    is_ok_packet, AuthSwitchRequest, ErrPacket, HandshakeResponse, InitialHandshake, Packet,
    PacketCodec,
};

/// Separate timeouts for the phases of a backend exchange
#[derive(Debug, Clone, Copy)]
pub struct BackendTimeouts {
    pub connect: Duration,
    pub read: Duration,
    pub write: Duration,
}

impl Default for BackendTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(3000),
            read: Duration::from_millis(10_000),
            write: Duration::from_millis(10_000),
        }
    }
}

/// Outbound MySQL connection to one backend server.
///
/// The proxy speaks the client side of the protocol here: it parses the
/// backend's handshake, answers with mysql_native_password credentials and
/// then relays packets.
pub struct BackendConnection {
    framed: Framed<TcpStream, PacketCodec>,
    capabilities: u32,
    server_version: String,
    thread_id: u32,
    timeouts: BackendTimeouts,
    created_at: Instant,
    last_used_at: Instant,
    broken: bool,
}

impl BackendConnection {
    /// Connect and authenticate against a backend
    pub async fn connect(
        addr: &str,
        user: &str,
        password: &str,
        database: Option<&str>,
        timeouts: BackendTimeouts,
    ) -> Result<Self, ConnectionError> {
        debug!(addr = %addr, "Connecting to backend");

        let stream = tokio::time::timeout(timeouts.connect, TcpStream::connect(addr))
            .await
            .map_err(|_| ConnectionError::Timeout("connect".into()))?
            .map_err(|e| {
                error!(addr = %addr, error = %e, "Failed to connect to backend");
                ConnectionError::Connect(e.to_string())
            })?;
        stream.set_nodelay(true).ok();

        let mut framed = Framed::new(stream, PacketCodec::new());

        let handshake_packet = tokio::time::timeout(timeouts.read, framed.next())
            .await
            .map_err(|_| ConnectionError::Timeout("handshake".into()))?
            .ok_or(ConnectionError::Disconnected)?
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        let backend_handshake = InitialHandshake::parse(&handshake_packet.payload)
            .ok_or_else(|| ConnectionError::Protocol("Invalid backend handshake".into()))?;

        debug!(
            server_version = %backend_handshake.server_version,
            "Received backend handshake"
        );

        let scramble = backend_handshake.auth_plugin_data().to_vec();
        let auth_response = compute_auth_response(password, &scramble);

        let mut caps = capabilities::DEFAULT_CAPABILITIES & backend_handshake.capability_flags;
        if database.is_some() {
            caps |= capabilities::CLIENT_CONNECT_WITH_DB;
        }

        let response = HandshakeResponse {
            capability_flags: caps,
            extra_capability_flags: backend_handshake.extra_capability_flags,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x21,
            username: user.to_string(),
            auth_response,
            database: database.map(|s| s.to_string()),
            auth_plugin_name: backend_handshake.auth_plugin_name.clone(),
        };

        framed
            .send(response.encode(1))
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        let mut reply = tokio::time::timeout(timeouts.read, framed.next())
            .await
            .map_err(|_| ConnectionError::Timeout("auth".into()))?
            .ok_or(ConnectionError::Disconnected)?
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        // Backend may switch plugins; answer with a token for its scramble
        if reply.first_byte() == Some(0xFE) {
            if let Some(switch) = AuthSwitchRequest::parse(&reply.payload) {
                let token = compute_auth_response(password, &switch.scramble);
                let seq = reply.sequence_id.wrapping_add(1);
                framed
                    .send(Packet::new(seq, token))
                    .await
                    .map_err(|e| ConnectionError::Io(e.to_string()))?;
                reply = tokio::time::timeout(timeouts.read, framed.next())
                    .await
                    .map_err(|_| ConnectionError::Timeout("auth switch".into()))?
                    .ok_or(ConnectionError::Disconnected)?
                    .map_err(|e| ConnectionError::Io(e.to_string()))?;
            }
        }

        if is_err_packet(&reply.payload) {
            let err = ErrPacket::parse(&reply.payload)
                .unwrap_or_else(|| ErrPacket::new(1045, "28000", "Access denied"));
            error!(
                addr = %addr,
                error_code = err.error_code,
                error_message = %err.error_message,
                "Backend authentication failed"
            );
            return Err(ConnectionError::Auth(err.error_message));
        }

        if !is_ok_packet(&reply.payload) {
            return Err(ConnectionError::Protocol(
                "Expected OK packet from backend".into(),
            ));
        }

        debug!(addr = %addr, "Backend authentication successful");

        let now = Instant::now();
        Ok(Self {
            framed,
            capabilities: caps,
            server_version: backend_handshake.server_version,
            thread_id: backend_handshake.connection_id,
            timeouts,
            created_at: now,
            last_used_at: now,
            broken: false,
        })
    }

    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Backend-side thread id, needed to KILL queries on this connection
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_used_at.elapsed()
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Send a packet to the backend
    pub async fn send(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        self.last_used_at = Instant::now();
        match tokio::time::timeout(self.timeouts.write, self.framed.send(packet)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.broken = true;
                Err(ConnectionError::Io(e.to_string()))
            }
            Err(_) => {
                self.broken = true;
                Err(ConnectionError::Timeout("write".into()))
            }
        }
    }

    /// Receive a packet from the backend
    pub async fn recv(&mut self) -> Result<Packet, ConnectionError> {
        match tokio::time::timeout(self.timeouts.read, self.framed.next()).await {
            Ok(Some(Ok(packet))) => Ok(packet),
            Ok(Some(Err(e))) => {
                self.broken = true;
                Err(ConnectionError::Io(e.to_string()))
            }
            Ok(None) => {
                self.broken = true;
                Err(ConnectionError::Disconnected)
            }
            Err(_) => {
                self.broken = true;
                Err(ConnectionError::Timeout("read".into()))
            }
        }
    }

    /// Execute a text query and collect the result set.
    ///
    /// Only for internal probes (monitor queries, shard-map discovery,
    /// user-cache loads); client traffic is streamed, never collected.
    pub async fn query(&mut self, sql: &str) -> Result<ResultSet, ConnectionError> {
        self.send(Packet::query(sql)).await?;
        self.read_result_set().await
    }

    /// Execute a statement where only success matters
    pub async fn execute(&mut self, sql: &str) -> Result<(), ConnectionError> {
        let rs = self.query(sql).await?;
        match rs.error {
            Some(err) => Err(ConnectionError::Query(err.error_message)),
            None => Ok(()),
        }
    }

    async fn read_result_set(&mut self) -> Result<ResultSet, ConnectionError> {
        let first = self.recv().await?;

        if is_err_packet(&first.payload) {
            return Ok(ResultSet {
                columns: vec![],
                rows: vec![],
                error: ErrPacket::parse(&first.payload),
            });
        }

        if is_ok_packet(&first.payload) {
            return Ok(ResultSet::default());
        }

        let (column_count, _) = get_lenenc_int(&first.payload)
            .ok_or_else(|| ConnectionError::Protocol("Bad column count".into()))?;

        let mut columns = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            let def = self.recv().await?;
            columns.push(parse_column_name(&def.payload));
        }

        // EOF between definitions and rows unless deprecated
        if self.capabilities & capabilities::CLIENT_DEPRECATE_EOF == 0 {
            let _eof = self.recv().await?;
        }

        let mut rows = Vec::new();
        loop {
            let packet = self.recv().await?;
            if is_err_packet(&packet.payload) {
                return Ok(ResultSet {
                    columns,
                    rows,
                    error: ErrPacket::parse(&packet.payload),
                });
            }
            let terminal = if self.capabilities & capabilities::CLIENT_DEPRECATE_EOF != 0 {
                packet.first_byte() == Some(0xFE)
            } else {
                is_eof_packet(&packet.payload, self.capabilities)
            };
            if terminal {
                break;
            }
            rows.push(parse_row(&packet.payload, column_count as usize));
        }

        Ok(ResultSet {
            columns,
            rows,
            error: None,
        })
    }
}

/// Collected result of an internal probe query
#[derive(Debug, Default)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    pub error: Option<ErrPacket>,
}

impl ResultSet {
    /// First column of the first row
    pub fn scalar(&self) -> Option<&str> {
        self.rows.first()?.first()?.as_deref()
    }

    /// Value of a named column in the given row
    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))?;
        self.rows.get(row)?.get(idx)?.as_deref()
    }
}

/// Column definition: catalog, schema, table, org_table, name, ... as
/// length-encoded strings; the display name is the fifth.
fn parse_column_name(payload: &[u8]) -> String {
    let mut rest = payload;
    for i in 0..5 {
        match crate::protocol::get_lenenc_str(rest) {
            Some((s, n)) => {
                if i == 4 {
                    return s;
                }
                rest = &rest[n..];
            }
            None => break,
        }
    }
    String::new()
}

/// Text-protocol row: one length-encoded string per column, 0xFB for NULL
fn parse_row(payload: &[u8], columns: usize) -> Vec<Option<String>> {
    let mut values = Vec::with_capacity(columns);
    let mut rest = payload;
    for _ in 0..columns {
        if rest.first() == Some(&0xFB) {
            values.push(None);
            rest = &rest[1..];
            continue;
        }
        match crate::protocol::get_lenenc_str(rest) {
            Some((s, n)) => {
                values.push(Some(s));
                rest = &rest[n..];
            }
            None => {
                values.push(None);
                break;
            }
        }
    }
    values
}

/// Connection errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Timeout during {0}")]
    Timeout(String),

    #[error("Connection disconnected")]
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use crate::protocol::put_lenenc_str;

    #[test]
    fn test_parse_column_name() {
        let mut buf = BytesMut::new();
        for s in ["def", "shop", "t", "t", "price", "price"] {
            put_lenenc_str(&mut buf, s);
        }
        assert_eq!(parse_column_name(&buf), "price");
    }

    #[test]
    fn test_parse_row_with_null() {
        let mut buf = BytesMut::new();
        put_lenenc_str(&mut buf, "1");
        buf.extend_from_slice(&[0xFB]);
        put_lenenc_str(&mut buf, "three");
        let row = parse_row(&buf, 3);
        assert_eq!(
            row,
            vec![Some("1".to_string()), None, Some("three".to_string())]
        );
    }

    #[test]
    fn test_result_set_accessors() {
        let rs = ResultSet {
            columns: vec!["Slave_IO_Running".to_string(), "Master_Host".to_string()],
            rows: vec![vec![Some("Yes".to_string()), Some("10.0.0.1".to_string())]],
            error: None,
        };
        assert_eq!(rs.scalar(), Some("Yes"));
        assert_eq!(rs.value(0, "master_host"), Some("10.0.0.1"));
        assert_eq!(rs.value(0, "missing"), None);
    }
}
