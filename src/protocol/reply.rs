//! Backend reply reassembly.
//!
//! A reply begins with OK (0x00), ERR (0xff), EOF/AuthSwitch (0xfe),
//! LOCAL INFILE (0xfb) or a length-encoded column count. The decoder walks
//! the packet stream (column definitions, EOF, rows, terminal EOF/OK) and
//! exposes the extracted session-track items that feed the router's
//! transaction state machine.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::packet::{capabilities::*, status::*, Command, Packet};

/// Decode a length-encoded integer, returning (value, bytes consumed)
pub fn get_lenenc_int(data: &[u8]) -> Option<(u64, usize)> {
    match *data.first()? {
        v @ 0..=0xFA => Some((v as u64, 1)),
        0xFB => None, // NULL marker, not an integer
        0xFC if data.len() >= 3 => Some((u16::from_le_bytes([data[1], data[2]]) as u64, 3)),
        0xFD if data.len() >= 4 => {
            Some((u32::from_le_bytes([data[1], data[2], data[3], 0]) as u64, 4))
        }
        0xFE if data.len() >= 9 => Some((
            u64::from_le_bytes([
                data[1], data[2], data[3], data[4], data[5], data[6], data[7], data[8],
            ]),
            9,
        )),
        _ => None,
    }
}

/// Decode a length-encoded string, returning (value, bytes consumed)
pub fn get_lenenc_str(data: &[u8]) -> Option<(String, usize)> {
    let (len, header) = get_lenenc_int(data)?;
    let len = len as usize;
    if data.len() < header + len {
        return None;
    }
    let s = String::from_utf8_lossy(&data[header..header + len]).to_string();
    Some((s, header + len))
}

/// Encode a length-encoded integer
pub fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
    if value < 251 {
        buf.put_u8(value as u8);
    } else if value < 65536 {
        buf.put_u8(0xFC);
        buf.put_u16_le(value as u16);
    } else if value < 16777216 {
        buf.put_u8(0xFD);
        buf.put_u8((value & 0xFF) as u8);
        buf.put_u8(((value >> 8) & 0xFF) as u8);
        buf.put_u8(((value >> 16) & 0xFF) as u8);
    } else {
        buf.put_u8(0xFE);
        buf.put_u64_le(value);
    }
}

/// Encode a length-encoded string
pub fn put_lenenc_str(buf: &mut BytesMut, value: &str) {
    put_lenenc_int(buf, value.len() as u64);
    buf.extend_from_slice(value.as_bytes());
}

bitflags! {
    /// Transaction state reported via the session tracker
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TrxState: u16 {
        const TX_EXPLICIT = 1;
        const TX_IMPLICIT = 2;
        const TX_READ_TRX = 4;
        const TX_READ_UNSAFE = 8;
        const TX_WRITE_TRX = 16;
        const TX_WRITE_UNSAFE = 32;
        const TX_STMT_UNSAFE = 64;
        const TX_RESULT_SET = 128;
        const TX_WITH_SNAPSHOT = 256;
        const TX_LOCKED_TABLES = 512;
    }
}

impl TrxState {
    /// Parse the 8-character state string ("T_______", "I__w____", ...)
    pub fn parse(s: &str) -> Self {
        let mut state = TrxState::empty();
        for c in s.chars() {
            match c {
                'T' => state |= TrxState::TX_EXPLICIT,
                'I' => state |= TrxState::TX_IMPLICIT,
                'r' => state |= TrxState::TX_READ_TRX,
                'R' => state |= TrxState::TX_READ_UNSAFE,
                'w' => state |= TrxState::TX_WRITE_TRX,
                'W' => state |= TrxState::TX_WRITE_UNSAFE,
                's' => state |= TrxState::TX_STMT_UNSAFE,
                'S' => state |= TrxState::TX_RESULT_SET,
                'L' => state |= TrxState::TX_LOCKED_TABLES,
                _ => {}
            }
        }
        state
    }

    pub fn is_active(&self) -> bool {
        self.intersects(TrxState::TX_EXPLICIT | TrxState::TX_IMPLICIT)
    }
}

/// Session-track items decoded from an OK packet
#[derive(Debug, Clone, Default)]
pub struct SessionTrack {
    /// SESSION_TRACK_SCHEMA
    pub schema: Option<String>,
    /// SESSION_TRACK_GTIDS or the last_gtid system variable
    pub last_gtid: Option<String>,
    /// SESSION_TRACK_TRANSACTION_STATE
    pub trx_state: Option<TrxState>,
    /// SESSION_TRACK_TRANSACTION_CHARACTERISTICS
    pub trx_characteristics: Option<String>,
    /// Tracked system variables (autocommit, sql_mode, ...)
    pub variables: Vec<(String, String)>,
}

impl SessionTrack {
    pub fn autocommit(&self) -> Option<bool> {
        self.variables
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("autocommit"))
            .map(|(_, v)| v.eq_ignore_ascii_case("ON") || v == "1")
    }

    pub fn sql_mode(&self) -> Option<&str> {
        self.variables
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("sql_mode"))
            .map(|(_, v)| v.as_str())
    }
}

const SESSION_TRACK_SYSTEM_VARIABLES: u8 = 0x00;
const SESSION_TRACK_SCHEMA: u8 = 0x01;
const SESSION_TRACK_STATE_CHANGE: u8 = 0x02;
const SESSION_TRACK_GTIDS: u8 = 0x03;
const SESSION_TRACK_TRANSACTION_CHARACTERISTICS: u8 = 0x04;
const SESSION_TRACK_TRANSACTION_STATE: u8 = 0x05;

/// OK packet
#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
    pub session_track: SessionTrack,
}

impl OkPacket {
    pub fn new() -> Self {
        Self {
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            ..Default::default()
        }
    }

    pub fn in_transaction(mut self) -> Self {
        self.status_flags |= SERVER_STATUS_IN_TRANS;
        self
    }

    pub fn encode(&self, sequence_id: u8, capabilities: u32) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(0x00);
        put_lenenc_int(&mut buf, self.affected_rows);
        put_lenenc_int(&mut buf, self.last_insert_id);

        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u16_le(self.status_flags);
            buf.put_u16_le(self.warnings);
        }

        Packet::new(sequence_id, buf.freeze())
    }

    /// Parse an OK payload, decoding session-track items when the
    /// SESSION_TRACK capability was negotiated.
    pub fn parse(payload: &[u8], capabilities: u32) -> Option<Self> {
        if payload.first() != Some(&0x00) && payload.first() != Some(&0xFE) {
            return None;
        }

        let mut buf = &payload[1..];
        let (affected_rows, n) = get_lenenc_int(buf)?;
        buf = &buf[n..];
        let (last_insert_id, n) = get_lenenc_int(buf)?;
        buf = &buf[n..];

        let mut ok = OkPacket {
            affected_rows,
            last_insert_id,
            ..Default::default()
        };

        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            if buf.len() < 4 {
                return Some(ok);
            }
            ok.status_flags = u16::from_le_bytes([buf[0], buf[1]]);
            ok.warnings = u16::from_le_bytes([buf[2], buf[3]]);
            buf = &buf[4..];
        }

        if capabilities & CLIENT_SESSION_TRACK != 0 {
            if let Some((info, n)) = get_lenenc_str(buf) {
                ok.info = info;
                buf = &buf[n..];
            }
            if ok.status_flags & SERVER_SESSION_STATE_CHANGED != 0 {
                if let Some((total, n)) = get_lenenc_int(buf) {
                    let end = (n + total as usize).min(buf.len());
                    Self::parse_state_changes(&buf[n..end], &mut ok.session_track);
                }
            }
        } else if !buf.is_empty() {
            ok.info = String::from_utf8_lossy(buf).to_string();
        }

        Some(ok)
    }

    fn parse_state_changes(mut data: &[u8], track: &mut SessionTrack) {
        while data.len() >= 2 {
            let entry_type = data[0];
            let Some((len, n)) = get_lenenc_int(&data[1..]) else {
                return;
            };
            let start = 1 + n;
            let end = start + len as usize;
            if data.len() < end {
                return;
            }
            let body = &data[start..end];

            match entry_type {
                SESSION_TRACK_SYSTEM_VARIABLES => {
                    if let Some((name, n)) = get_lenenc_str(body) {
                        if let Some((value, _)) = get_lenenc_str(&body[n..]) {
                            if name.eq_ignore_ascii_case("last_gtid") {
                                track.last_gtid = Some(value);
                            } else {
                                track.variables.push((name, value));
                            }
                        }
                    }
                }
                SESSION_TRACK_SCHEMA => {
                    if let Some((schema, _)) = get_lenenc_str(body) {
                        track.schema = Some(schema);
                    }
                }
                SESSION_TRACK_GTIDS => {
                    // One byte of encoding format, then the GTID list
                    if body.len() > 1 {
                        if let Some((gtid, _)) = get_lenenc_str(&body[1..]) {
                            track.last_gtid = Some(gtid);
                        }
                    }
                }
                SESSION_TRACK_TRANSACTION_CHARACTERISTICS => {
                    if let Some((chars, _)) = get_lenenc_str(body) {
                        track.trx_characteristics = Some(chars);
                    }
                }
                SESSION_TRACK_TRANSACTION_STATE => {
                    if let Some((state, _)) = get_lenenc_str(body) {
                        track.trx_state = Some(TrxState::parse(&state));
                    }
                }
                SESSION_TRACK_STATE_CHANGE => {}
                _ => {}
            }

            data = &data[end..];
        }
    }
}

/// ERR packet
#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    pub fn new(error_code: u16, sql_state: &str, error_message: &str) -> Self {
        Self {
            error_code,
            sql_state: sql_state.to_string(),
            error_message: error_message.to_string(),
        }
    }

    /// ERR 1045 the proxy sends on authentication failure
    pub fn access_denied(user: &str, host: &str, using_password: bool) -> Self {
        Self::new(
            1045,
            "28000",
            &format!(
                "Access denied for user '{}'@'{}' (using password: {})",
                user,
                host,
                if using_password { "YES" } else { "NO" }
            ),
        )
    }

    /// ERR 1927 the proxy sends when it kills a session itself
    pub fn connection_killed(reason: &str) -> Self {
        Self::new(1927, "08S01", &format!("Connection killed by Bifrost: {}", reason))
    }

    /// ERR 1049 for an unknown or unmapped database
    pub fn unknown_database(db: &str) -> Self {
        Self::new(1049, "42000", &format!("Unknown database '{}'", db))
    }

    pub fn encode(&self, sequence_id: u8, capabilities: u32) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(0xFF);
        buf.put_u16_le(self.error_code);

        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u8(b'#');
            buf.extend_from_slice(self.sql_state.as_bytes());
        }

        buf.extend_from_slice(self.error_message.as_bytes());

        Packet::new(sequence_id, buf.freeze())
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.first() != Some(&0xFF) {
            return None;
        }

        let mut buf = &payload[1..];
        if buf.len() < 2 {
            return None;
        }

        let error_code = buf.get_u16_le();

        let (sql_state, error_message) = if !buf.is_empty() && buf[0] == b'#' && buf.len() >= 6 {
            let sql_state = String::from_utf8_lossy(&buf[1..6]).to_string();
            let error_message = String::from_utf8_lossy(&buf[6..]).to_string();
            (sql_state, error_message)
        } else {
            ("HY000".to_string(), String::from_utf8_lossy(buf).to_string())
        };

        Some(Self {
            error_code,
            sql_state,
            error_message,
        })
    }

    /// WSREP-not-ready and similar errors are consumed by the router and
    /// retried instead of being surfaced to the client.
    pub fn is_transient(&self) -> bool {
        self.error_code == 1047
            && self.sql_state == "08S01"
            && self.error_message.contains("WSREP has not yet prepared node")
    }

    /// The server rolled the transaction back on its own: SQLSTATE class
    /// 40 (deadlock, serialization failure). The router replays the
    /// transaction instead of surfacing the error.
    pub fn is_rollback_trigger(&self) -> bool {
        self.sql_state.starts_with("40")
    }
}

/// EOF packet (pre-DEPRECATE_EOF)
#[derive(Debug, Clone, Default)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

impl EofPacket {
    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();
        buf.put_u8(0xFE);
        buf.put_u16_le(self.warnings);
        buf.put_u16_le(self.status_flags);
        Packet::new(sequence_id, buf.freeze())
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.first() != Some(&0xFE) || payload.len() >= 9 {
            return None;
        }
        if payload.len() < 5 {
            return Some(Self::default());
        }
        Some(Self {
            warnings: u16::from_le_bytes([payload[1], payload[2]]),
            status_flags: u16::from_le_bytes([payload[3], payload[4]]),
        })
    }
}

pub fn is_ok_packet(payload: &Bytes) -> bool {
    !payload.is_empty() && payload[0] == 0x00
}

pub fn is_err_packet(payload: &Bytes) -> bool {
    !payload.is_empty() && payload[0] == 0xFF
}

pub fn is_eof_packet(payload: &Bytes, capabilities: u32) -> bool {
    if capabilities & CLIENT_DEPRECATE_EOF != 0 {
        false
    } else {
        !payload.is_empty() && payload[0] == 0xFE && payload.len() < 9
    }
}

/// Reply reassembly state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyState {
    Start,
    ReadingFields { remaining: u64 },
    AwaitingFieldEof,
    ReadingRows,
    Done,
}

/// COM_STMT_PREPARE first-response header
#[derive(Debug, Clone, Copy)]
pub struct PrepareOk {
    pub statement_id: u32,
    pub num_columns: u16,
    pub num_params: u16,
    pub warnings: u16,
}

impl PrepareOk {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 12 || payload[0] != 0x00 {
            return None;
        }
        Some(Self {
            statement_id: u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]),
            num_columns: u16::from_le_bytes([payload[5], payload[6]]),
            num_params: u16::from_le_bytes([payload[7], payload[8]]),
            warnings: u16::from_le_bytes([payload[10], payload[11]]),
        })
    }

    /// Rewrite the statement id inside a prepare response payload
    pub fn rewrite_statement_id(payload: &mut [u8], id: u32) {
        if payload.len() >= 5 && payload[0] == 0x00 {
            payload[1..5].copy_from_slice(&id.to_le_bytes());
        }
    }
}

/// The reassembled view of one command-reply exchange
#[derive(Debug, Clone)]
pub struct Reply {
    pub command: Command,
    pub state: ReplyState,
    pub last_error: Option<ErrPacket>,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub server_status: u16,
    pub session_track: SessionTrack,
    pub field_count: u64,
    /// Total payload bytes seen, for replay-size accounting
    pub result_bytes: u64,
    pub is_local_infile: bool,
    pub prepare_ok: Option<PrepareOk>,
}

impl Reply {
    pub fn is_complete(&self) -> bool {
        self.state == ReplyState::Done
    }

    pub fn is_error(&self) -> bool {
        self.last_error.is_some()
    }
}

/// Walks the packet stream of a single reply.
///
/// Constructed per forwarded command with the backend's negotiated
/// capabilities (DEPRECATE_EOF changes the stream shape). Multi-result
/// replies loop back to Start on SERVER_MORE_RESULTS_EXISTS.
#[derive(Debug)]
pub struct ReplyDecoder {
    capabilities: u32,
    reply: Reply,
}

impl ReplyDecoder {
    pub fn new(command: Command, capabilities: u32) -> Self {
        Self {
            capabilities,
            reply: Reply {
                command,
                state: ReplyState::Start,
                last_error: None,
                affected_rows: 0,
                last_insert_id: 0,
                server_status: 0,
                session_track: SessionTrack::default(),
                field_count: 0,
                result_bytes: 0,
                is_local_infile: false,
                prepare_ok: None,
            },
        }
    }

    pub fn reply(&self) -> &Reply {
        &self.reply
    }

    fn deprecate_eof(&self) -> bool {
        self.capabilities & CLIENT_DEPRECATE_EOF != 0
    }

    /// Process one backend packet; returns true when the reply is complete.
    pub fn process(&mut self, packet: &Packet) -> bool {
        self.reply.result_bytes += packet.payload.len() as u64;

        match self.reply.state {
            ReplyState::Start => self.process_start(packet),
            ReplyState::ReadingFields { remaining } => {
                let remaining = remaining - 1;
                if remaining == 0 {
                    // A prepare reply ends with its definitions; a resultset
                    // continues with rows
                    self.reply.state = if self.reply.command == Command::StmtPrepare {
                        ReplyState::Done
                    } else if self.deprecate_eof() {
                        ReplyState::ReadingRows
                    } else {
                        ReplyState::AwaitingFieldEof
                    };
                } else {
                    self.reply.state = ReplyState::ReadingFields { remaining };
                }
            }
            ReplyState::AwaitingFieldEof => {
                self.reply.state = ReplyState::ReadingRows;
            }
            ReplyState::ReadingRows => self.process_row(packet),
            ReplyState::Done => {}
        }

        self.reply.is_complete()
    }

    fn process_start(&mut self, packet: &Packet) {
        let payload = &packet.payload;
        match payload.first() {
            Some(&0x00) if self.reply.command == Command::StmtPrepare => {
                // COM_STMT_PREPARE_OK header, then params + columns each
                // followed by EOF unless DEPRECATE_EOF is on
                if let Some(ok) = PrepareOk::parse(payload) {
                    let eof = if self.deprecate_eof() { 0 } else { 1 };
                    let mut left = 0u64;
                    if ok.num_params > 0 {
                        left += ok.num_params as u64 + eof;
                    }
                    if ok.num_columns > 0 {
                        left += ok.num_columns as u64 + eof;
                    }
                    self.reply.prepare_ok = Some(ok);
                    if left == 0 {
                        self.reply.state = ReplyState::Done;
                    } else {
                        self.reply.state = ReplyState::ReadingFields { remaining: left };
                    }
                } else {
                    self.reply.state = ReplyState::Done;
                }
            }
            Some(&0x00) => {
                if let Some(ok) = OkPacket::parse(payload, self.capabilities) {
                    self.reply.affected_rows = ok.affected_rows;
                    self.reply.last_insert_id = ok.last_insert_id;
                    self.reply.server_status = ok.status_flags;
                    self.merge_track(ok.session_track);
                    if ok.status_flags & SERVER_MORE_RESULTS_EXISTS != 0 {
                        self.reply.state = ReplyState::Start;
                    } else {
                        self.reply.state = ReplyState::Done;
                    }
                } else {
                    self.reply.state = ReplyState::Done;
                }
            }
            Some(&0xFF) => {
                self.reply.last_error = ErrPacket::parse(payload);
                self.reply.state = ReplyState::Done;
            }
            Some(&0xFB) => {
                // LOCAL INFILE request: client sends file data, the final
                // OK/ERR still arrives on this stream
                self.reply.is_local_infile = true;
            }
            Some(_) => {
                if let Some((count, _)) = get_lenenc_int(payload) {
                    self.reply.field_count = count;
                    if count == 0 {
                        self.reply.state = ReplyState::Done;
                    } else {
                        self.reply.state = ReplyState::ReadingFields { remaining: count };
                    }
                } else {
                    self.reply.state = ReplyState::Done;
                }
            }
            None => {}
        }
    }

    fn process_row(&mut self, packet: &Packet) {
        let payload = &packet.payload;
        let terminal = if self.deprecate_eof() {
            // Terminal packet is an OK with 0xFE header
            payload.first() == Some(&0xFE) && payload.len() < super::packet::MAX_PACKET_SIZE
        } else {
            payload.first() == Some(&0xFE) && payload.len() < 9
        };

        if is_err_packet(payload) {
            self.reply.last_error = ErrPacket::parse(payload);
            self.reply.state = ReplyState::Done;
            return;
        }

        if terminal {
            let status = if self.deprecate_eof() {
                OkPacket::parse(payload, self.capabilities)
                    .map(|ok| {
                        self.merge_track(ok.session_track.clone());
                        ok.status_flags
                    })
                    .unwrap_or(0)
            } else {
                EofPacket::parse(payload).map(|e| e.status_flags).unwrap_or(0)
            };
            self.reply.server_status = status;
            if status & SERVER_MORE_RESULTS_EXISTS != 0 {
                self.reply.state = ReplyState::Start;
            } else {
                self.reply.state = ReplyState::Done;
            }
        }
    }

    fn merge_track(&mut self, track: SessionTrack) {
        let dst = &mut self.reply.session_track;
        if track.schema.is_some() {
            dst.schema = track.schema;
        }
        if track.last_gtid.is_some() {
            dst.last_gtid = track.last_gtid;
        }
        if track.trx_state.is_some() {
            dst.trx_state = track.trx_state;
        }
        if track.trx_characteristics.is_some() {
            dst.trx_characteristics = track.trx_characteristics;
        }
        dst.variables.extend(track.variables);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_with_track(status: u16, entries: &[(u8, Vec<u8>)]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(0x00);
        put_lenenc_int(&mut buf, 1); // affected
        put_lenenc_int(&mut buf, 0); // insert id
        buf.put_u16_le(status);
        buf.put_u16_le(0); // warnings
        put_lenenc_str(&mut buf, ""); // info

        let mut track = BytesMut::new();
        for (ty, body) in entries {
            track.put_u8(*ty);
            put_lenenc_int(&mut track, body.len() as u64);
            track.extend_from_slice(body);
        }
        put_lenenc_int(&mut buf, track.len() as u64);
        buf.extend_from_slice(&track);
        buf.to_vec()
    }

    const CAPS: u32 = CLIENT_PROTOCOL_41 | CLIENT_SESSION_TRACK;

    #[test]
    fn test_ok_parse_basic() {
        let ok = OkPacket {
            affected_rows: 3,
            last_insert_id: 7,
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            ..Default::default()
        };
        let packet = ok.encode(1, CLIENT_PROTOCOL_41);
        let parsed = OkPacket::parse(&packet.payload, CLIENT_PROTOCOL_41).unwrap();
        assert_eq!(parsed.affected_rows, 3);
        assert_eq!(parsed.last_insert_id, 7);
        assert_eq!(parsed.status_flags, SERVER_STATUS_AUTOCOMMIT);
    }

    #[test]
    fn test_ok_parse_gtid_tracker() {
        let mut body = BytesMut::new();
        put_lenenc_str(&mut body, "last_gtid");
        put_lenenc_str(&mut body, "0-1-42");
        let payload = ok_with_track(
            SERVER_SESSION_STATE_CHANGED,
            &[(SESSION_TRACK_SYSTEM_VARIABLES, body.to_vec())],
        );

        let ok = OkPacket::parse(&payload, CAPS).unwrap();
        assert_eq!(ok.session_track.last_gtid.as_deref(), Some("0-1-42"));
    }

    #[test]
    fn test_ok_parse_trx_state_tracker() {
        let mut body = BytesMut::new();
        put_lenenc_str(&mut body, "T_____S_");
        let payload = ok_with_track(
            SERVER_SESSION_STATE_CHANGED,
            &[(SESSION_TRACK_TRANSACTION_STATE, body.to_vec())],
        );

        let ok = OkPacket::parse(&payload, CAPS).unwrap();
        let state = ok.session_track.trx_state.unwrap();
        assert!(state.contains(TrxState::TX_EXPLICIT));
        assert!(state.contains(TrxState::TX_RESULT_SET));
        assert!(state.is_active());
    }

    #[test]
    fn test_ok_parse_schema_tracker() {
        let mut body = BytesMut::new();
        put_lenenc_str(&mut body, "shop");
        let payload = ok_with_track(
            SERVER_SESSION_STATE_CHANGED,
            &[(SESSION_TRACK_SCHEMA, body.to_vec())],
        );
        let ok = OkPacket::parse(&payload, CAPS).unwrap();
        assert_eq!(ok.session_track.schema.as_deref(), Some("shop"));
    }

    #[test]
    fn test_trx_state_parse() {
        assert_eq!(TrxState::parse("________"), TrxState::empty());
        assert!(TrxState::parse("I_______").contains(TrxState::TX_IMPLICIT));
        let s = TrxState::parse("T_r_w___");
        assert!(s.contains(TrxState::TX_EXPLICIT | TrxState::TX_READ_TRX | TrxState::TX_WRITE_TRX));
    }

    #[test]
    fn test_err_roundtrip() {
        let err = ErrPacket::new(1064, "42000", "You have an error in your SQL syntax");
        let packet = err.encode(1, CLIENT_PROTOCOL_41);
        let parsed = ErrPacket::parse(&packet.payload).unwrap();
        assert_eq!(parsed.error_code, 1064);
        assert_eq!(parsed.sql_state, "42000");
        assert_eq!(parsed.error_message, err.error_message);
    }

    #[test]
    fn test_err_transient_detection() {
        let wsrep = ErrPacket::new(1047, "08S01", "WSREP has not yet prepared node for application use");
        assert!(wsrep.is_transient());
        let other = ErrPacket::new(1047, "08S01", "Unknown command");
        assert!(!other.is_transient());
    }

    #[test]
    fn test_err_rollback_trigger_detection() {
        let deadlock = ErrPacket::new(1213, "40001", "Deadlock found when trying to get lock");
        assert!(deadlock.is_rollback_trigger());
        assert!(!deadlock.is_transient());

        // Lock wait timeout does not roll the transaction back
        let lock_wait = ErrPacket::new(1205, "HY000", "Lock wait timeout exceeded");
        assert!(!lock_wait.is_rollback_trigger());

        let wsrep = ErrPacket::new(1047, "08S01", "WSREP has not yet prepared node");
        assert!(!wsrep.is_rollback_trigger());
    }

    fn field_packet() -> Packet {
        Packet::new(2, vec![3u8, b'd', b'e', b'f'])
    }

    fn eof_packet(status: u16) -> Packet {
        EofPacket {
            warnings: 0,
            status_flags: status,
        }
        .encode(4)
    }

    #[test]
    fn test_decoder_ok_reply() {
        let mut decoder = ReplyDecoder::new(Command::Query, CLIENT_PROTOCOL_41);
        let ok = OkPacket::new().encode(1, CLIENT_PROTOCOL_41);
        assert!(decoder.process(&ok));
        assert!(decoder.reply().is_complete());
        assert!(!decoder.reply().is_error());
    }

    #[test]
    fn test_decoder_resultset() {
        let mut decoder = ReplyDecoder::new(Command::Query, CLIENT_PROTOCOL_41);

        // column count = 2
        assert!(!decoder.process(&Packet::new(1, vec![2u8])));
        assert!(!decoder.process(&field_packet()));
        assert!(!decoder.process(&field_packet()));
        // EOF after fields
        assert!(!decoder.process(&eof_packet(0)));
        // two rows
        assert!(!decoder.process(&Packet::new(5, vec![1u8, b'a'])));
        assert!(!decoder.process(&Packet::new(6, vec![1u8, b'b'])));
        // terminal EOF
        assert!(decoder.process(&eof_packet(0)));
        assert_eq!(decoder.reply().field_count, 2);
    }

    #[test]
    fn test_decoder_multi_result() {
        let mut decoder = ReplyDecoder::new(Command::Query, CLIENT_PROTOCOL_41);
        let more = OkPacket {
            status_flags: SERVER_MORE_RESULTS_EXISTS,
            ..Default::default()
        }
        .encode(1, CLIENT_PROTOCOL_41);
        assert!(!decoder.process(&more));
        let done = OkPacket::new().encode(2, CLIENT_PROTOCOL_41);
        assert!(decoder.process(&done));
    }

    #[test]
    fn test_decoder_err_reply() {
        let mut decoder = ReplyDecoder::new(Command::Query, CLIENT_PROTOCOL_41);
        let err = ErrPacket::new(1146, "42S02", "Table 'a.b' doesn't exist")
            .encode(1, CLIENT_PROTOCOL_41);
        assert!(decoder.process(&err));
        assert_eq!(decoder.reply().last_error.as_ref().unwrap().error_code, 1146);
    }

    #[test]
    fn test_decoder_prepare_reply() {
        let mut decoder = ReplyDecoder::new(Command::StmtPrepare, CLIENT_PROTOCOL_41);

        // PREPARE_OK: stmt_id=9, 1 column, 2 params
        let mut payload = vec![0u8; 12];
        payload[1..5].copy_from_slice(&9u32.to_le_bytes());
        payload[5..7].copy_from_slice(&1u16.to_le_bytes());
        payload[7..9].copy_from_slice(&2u16.to_le_bytes());
        assert!(!decoder.process(&Packet::new(1, payload)));

        let ok = decoder.reply().prepare_ok.unwrap();
        assert_eq!(ok.statement_id, 9);

        // 2 params + EOF + 1 column + EOF
        assert!(!decoder.process(&field_packet()));
        assert!(!decoder.process(&field_packet()));
        assert!(!decoder.process(&eof_packet(0)));
        assert!(!decoder.process(&field_packet()));
        assert!(decoder.process(&eof_packet(0)));
    }

    #[test]
    fn test_decoder_local_infile() {
        let mut decoder = ReplyDecoder::new(Command::Query, CLIENT_PROTOCOL_41);
        assert!(!decoder.process(&Packet::new(1, vec![0xFBu8, b'/', b'f'])));
        assert!(decoder.reply().is_local_infile);
        let ok = OkPacket::new().encode(3, CLIENT_PROTOCOL_41);
        assert!(decoder.process(&ok));
    }

    #[test]
    fn test_prepare_ok_rewrite() {
        let mut payload = vec![0u8; 12];
        payload[1..5].copy_from_slice(&100u32.to_le_bytes());
        PrepareOk::rewrite_statement_id(&mut payload, 7);
        assert_eq!(PrepareOk::parse(&payload).unwrap().statement_id, 7);
    }
}
