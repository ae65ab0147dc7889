use bytes::{Bytes, BytesMut};

/// MySQL packet header size: 3 bytes length + 1 byte sequence
pub const PACKET_HEADER_SIZE: usize = 4;
/// Maximum packet payload size (16MB - 1)
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;
/// Size of a HandshakeResponse up to and including the 23 filler bytes.
/// A client payload of exactly this size is an SSLRequest, not a response.
pub const AUTH_PACKET_BASE_SIZE: usize = 32;
/// Full scramble length for mysql_native_password
pub const SCRAMBLE_SIZE: usize = 20;

/// MySQL wire protocol packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// Build a COM_QUERY packet with sequence 0
    pub fn query(sql: &str) -> Self {
        let mut payload = Vec::with_capacity(sql.len() + 1);
        payload.push(0x03);
        payload.extend_from_slice(sql.as_bytes());
        Self::new(0, payload)
    }

    /// Zero-payload COM_PING used for backend keepalive
    pub fn ping() -> Self {
        Self::new(0, vec![0x0e])
    }

    /// First payload byte, if any
    pub fn first_byte(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    /// A payload of exactly 2^24-1 bytes signals a continuation packet
    pub fn is_continued(&self) -> bool {
        self.payload.len() == MAX_PACKET_SIZE
    }
}

/// Reassembles a logical message split across continuation packets.
///
/// A payload of exactly 2^24-1 bytes means the message continues in the next
/// packet; the logical payload is the concatenation up to and including the
/// first packet shorter than 2^24-1 (a zero-length trailer is valid).
#[derive(Debug, Default)]
pub struct PacketAccumulator {
    pending: BytesMut,
    first_seq: u8,
    in_progress: bool,
}

impl PacketAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one wire packet; returns the completed logical packet when the
    /// message ends, None while a continuation is outstanding.
    pub fn push(&mut self, packet: Packet) -> Option<Packet> {
        if !self.in_progress {
            if !packet.is_continued() {
                return Some(packet);
            }
            self.first_seq = packet.sequence_id;
            self.in_progress = true;
            self.pending.extend_from_slice(&packet.payload);
            return None;
        }

        let done = !packet.is_continued();
        self.pending.extend_from_slice(&packet.payload);
        if done {
            self.in_progress = false;
            let payload = self.pending.split().freeze();
            Some(Packet::new(self.first_seq, payload))
        } else {
            None
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }
}

/// Split a logical payload back into wire packets, numbering from `start_seq`.
pub fn split_into_packets(payload: &[u8], start_seq: u8) -> Vec<Packet> {
    let mut out = Vec::new();
    let mut seq = start_seq;
    let mut rest = payload;
    loop {
        let take = rest.len().min(MAX_PACKET_SIZE);
        let (chunk, tail) = rest.split_at(take);
        out.push(Packet::new(seq, chunk.to_vec()));
        seq = seq.wrapping_add(1);
        rest = tail;
        if rest.is_empty() {
            // A full-size final chunk needs an empty trailer packet
            if take == MAX_PACKET_SIZE {
                out.push(Packet::new(seq, Vec::new()));
            }
            break;
        }
    }
    out
}

/// MySQL capability flags
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_NO_SCHEMA: u32 = 1 << 4;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_ODBC: u32 = 1 << 6;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_IGNORE_SPACE: u32 = 1 << 8;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_IGNORE_SIGPIPE: u32 = 1 << 12;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_RESERVED: u32 = 1 << 14;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_SESSION_TRACK: u32 = 1 << 23;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Capabilities the proxy advertises to clients.
    ///
    /// CLIENT_MULTI_STATEMENTS is off by default and toggled per session via
    /// COM_SET_OPTION. CLIENT_SSL is added only when the listener carries TLS
    /// material.
    pub const DEFAULT_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_FOUND_ROWS
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_LOCAL_FILES
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_RESULTS
        | CLIENT_PS_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_SESSION_TRACK;
}

/// MariaDB 10.2+ extended capabilities, carried in the last 4 bytes of the
/// handshake filler when the server version advertises MariaDB.
#[allow(dead_code)]
pub mod mariadb_capabilities {
    pub const MARIADB_CLIENT_PROGRESS: u32 = 1 << 0;
    pub const MARIADB_CLIENT_COM_MULTI: u32 = 1 << 1;
    pub const MARIADB_CLIENT_STMT_BULK_OPERATIONS: u32 = 1 << 2;
    pub const MARIADB_CLIENT_EXTENDED_METADATA: u32 = 1 << 3;
    pub const MARIADB_CLIENT_CACHE_METADATA: u32 = 1 << 4;

    pub const DEFAULT_EXTRA_CAPABILITIES: u32 = MARIADB_CLIENT_STMT_BULK_OPERATIONS;
}

/// Server status flags carried in OK/EOF packets
#[allow(dead_code)]
pub mod status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_SESSION_STATE_CHANGED: u16 = 0x4000;
}

/// MySQL command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Sleep = 0x00,
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    FieldList = 0x04,
    CreateDb = 0x05,
    DropDb = 0x06,
    Refresh = 0x07,
    Shutdown = 0x08,
    Statistics = 0x09,
    ProcessInfo = 0x0a,
    Connect = 0x0b,
    ProcessKill = 0x0c,
    Debug = 0x0d,
    Ping = 0x0e,
    Time = 0x0f,
    DelayedInsert = 0x10,
    ChangeUser = 0x11,
    BinlogDump = 0x12,
    TableDump = 0x13,
    ConnectOut = 0x14,
    RegisterSlave = 0x15,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtSendLongData = 0x18,
    StmtClose = 0x19,
    StmtReset = 0x1a,
    SetOption = 0x1b,
    StmtFetch = 0x1c,
    Daemon = 0x1d,
    BinlogDumpGtid = 0x1e,
    ResetConnection = 0x1f,
    StmtBulkExecute = 0xfa,
    Unknown = 0xff,
}

impl Command {
    /// Whether this command elicits a reply from the server
    pub fn expects_response(&self) -> bool {
        !matches!(
            self,
            Command::StmtSendLongData | Command::StmtClose | Command::Quit
        )
    }
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Command::Sleep,
            0x01 => Command::Quit,
            0x02 => Command::InitDb,
            0x03 => Command::Query,
            0x04 => Command::FieldList,
            0x05 => Command::CreateDb,
            0x06 => Command::DropDb,
            0x07 => Command::Refresh,
            0x08 => Command::Shutdown,
            0x09 => Command::Statistics,
            0x0a => Command::ProcessInfo,
            0x0b => Command::Connect,
            0x0c => Command::ProcessKill,
            0x0d => Command::Debug,
            0x0e => Command::Ping,
            0x0f => Command::Time,
            0x10 => Command::DelayedInsert,
            0x11 => Command::ChangeUser,
            0x12 => Command::BinlogDump,
            0x13 => Command::TableDump,
            0x14 => Command::ConnectOut,
            0x15 => Command::RegisterSlave,
            0x16 => Command::StmtPrepare,
            0x17 => Command::StmtExecute,
            0x18 => Command::StmtSendLongData,
            0x19 => Command::StmtClose,
            0x1a => Command::StmtReset,
            0x1b => Command::SetOption,
            0x1c => Command::StmtFetch,
            0x1d => Command::Daemon,
            0x1e => Command::BinlogDumpGtid,
            0x1f => Command::ResetConnection,
            0xfa => Command::StmtBulkExecute,
            _ => Command::Unknown,
        }
    }
}
