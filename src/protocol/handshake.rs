use bytes::{Buf, BufMut, BytesMut};
use sha1::{Digest, Sha1};

use super::packet::{capabilities::*, Packet, AUTH_PACKET_BASE_SIZE, SCRAMBLE_SIZE};

/// MySQL initial handshake packet (protocol version 10)
///
/// The proxy sends this to clients (server side) and parses it from
/// backends (client side). The 10-byte reserved filler carries 4 bytes of
/// MariaDB extended capabilities when the peer is MariaDB 10.2+.
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub scramble: [u8; SCRAMBLE_SIZE],
    pub capability_flags: u32,
    pub extra_capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin_name: String,
}

impl InitialHandshake {
    /// Create a handshake for a new client session.
    ///
    /// `connection_id` is the session id truncated to 32 bits. SSL is
    /// advertised only when the listener carries TLS material.
    pub fn new(connection_id: u32, version: &str, with_ssl: bool) -> Self {
        let mut scramble = [0u8; SCRAMBLE_SIZE];
        use rand::RngCore;
        let mut rng = rand::thread_rng();
        // Scramble bytes must be non-zero printable-ish; zero terminates
        // the string in old clients
        rng.fill_bytes(&mut scramble);
        for b in scramble.iter_mut() {
            if *b == 0 {
                *b = 0x5a;
            }
        }

        let mut caps = DEFAULT_CAPABILITIES;
        if with_ssl {
            caps |= CLIENT_SSL;
        }

        Self {
            protocol_version: 10,
            server_version: version.to_string(),
            connection_id,
            scramble,
            capability_flags: caps,
            extra_capability_flags: super::packet::mariadb_capabilities::DEFAULT_EXTRA_CAPABILITIES,
            character_set: 0x21, // utf8_general_ci
            status_flags: super::packet::status::SERVER_STATUS_AUTOCOMMIT,
            auth_plugin_name: "mysql_native_password".to_string(),
        }
    }

    fn is_mariadb(&self) -> bool {
        self.server_version.contains("MariaDB") || self.server_version.contains("mariadb")
    }

    /// Full 20-byte scramble
    pub fn auth_plugin_data(&self) -> &[u8] {
        &self.scramble
    }

    /// Encode to packet (sequence 0)
    pub fn encode(&self) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(self.protocol_version);

        buf.extend_from_slice(self.server_version.as_bytes());
        buf.put_u8(0);

        buf.put_u32_le(self.connection_id);

        // Scramble part 1 (8 bytes) + filler
        buf.extend_from_slice(&self.scramble[..8]);
        buf.put_u8(0);

        // Capability flags (lower 2 bytes)
        buf.put_u16_le((self.capability_flags & 0xFFFF) as u16);

        buf.put_u8(self.character_set);
        buf.put_u16_le(self.status_flags);

        // Capability flags (upper 2 bytes)
        buf.put_u16_le(((self.capability_flags >> 16) & 0xFFFF) as u16);

        // Scramble length (8 + 12 + terminator)
        buf.put_u8((SCRAMBLE_SIZE + 1) as u8);

        // 10 bytes reserved; the last 4 carry MariaDB extended capabilities
        buf.extend_from_slice(&[0u8; 6]);
        if self.is_mariadb() {
            buf.put_u32_le(self.extra_capability_flags);
        } else {
            buf.extend_from_slice(&[0u8; 4]);
        }

        // Scramble part 2 (12 bytes) + terminator
        buf.extend_from_slice(&self.scramble[8..]);
        buf.put_u8(0);

        buf.extend_from_slice(self.auth_plugin_name.as_bytes());
        buf.put_u8(0);

        Packet::new(0, buf.freeze())
    }

    /// Parse from a backend's handshake payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 46 {
            return None;
        }

        let mut buf = payload;

        let protocol_version = buf.get_u8();

        let null_pos = buf.iter().position(|&b| b == 0)?;
        let server_version = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance(null_pos + 1);

        if buf.len() < 44 {
            return None;
        }

        let connection_id = buf.get_u32_le();

        let mut scramble = [0u8; SCRAMBLE_SIZE];
        scramble[..8].copy_from_slice(&buf[..8]);
        buf.advance(8);

        // Filler
        buf.advance(1);

        let capability_flags_lower = buf.get_u16_le() as u32;
        let character_set = buf.get_u8();
        let status_flags = buf.get_u16_le();
        let capability_flags_upper = buf.get_u16_le() as u32;
        let capability_flags = capability_flags_lower | (capability_flags_upper << 16);

        let _auth_plugin_data_len = buf.get_u8();

        // Reserved: 6 zero bytes then 4 bytes of MariaDB extended caps
        buf.advance(6);
        let extra_capability_flags = buf.get_u32_le();

        // Scramble part 2 (12 bytes + NUL)
        if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            if buf.len() < 13 {
                return None;
            }
            scramble[8..].copy_from_slice(&buf[..12]);
            buf.advance(13);
        }

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..null_pos]).to_string()
        } else {
            "mysql_native_password".to_string()
        };

        Some(Self {
            protocol_version,
            server_version,
            connection_id,
            scramble,
            capability_flags,
            extra_capability_flags,
            character_set,
            status_flags,
            auth_plugin_name,
        })
    }
}

/// MySQL handshake response packet (client -> server)
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub capability_flags: u32,
    pub extra_capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: String,
}

impl HandshakeResponse {
    /// A payload of exactly AUTH_PACKET_BASE_SIZE bytes is an SSLRequest:
    /// the client wants to upgrade before sending credentials.
    pub fn is_ssl_request(payload: &[u8]) -> bool {
        payload.len() == AUTH_PACKET_BASE_SIZE
            && payload.len() >= 4
            && (u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) & CLIENT_SSL)
                != 0
    }

    /// Parse from packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() <= AUTH_PACKET_BASE_SIZE {
            return None;
        }

        let mut buf = payload;

        let capability_flags = buf.get_u32_le();
        let max_packet_size = buf.get_u32_le();
        let character_set = buf.get_u8();

        // 23 reserved bytes; MariaDB clients put extended capabilities in
        // the last 4 when the CLIENT_MYSQL-less dialect is spoken
        let extra_capability_flags =
            u32::from_le_bytes([buf[19], buf[20], buf[21], buf[22]]);
        buf.advance(23);

        let null_pos = buf.iter().position(|&b| b == 0)?;
        let username = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance(null_pos + 1);

        let auth_response = if capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0
            || capability_flags & CLIENT_SECURE_CONNECTION != 0
        {
            if buf.is_empty() {
                return None;
            }
            let len = buf.get_u8() as usize;
            if buf.len() < len {
                return None;
            }
            let data = buf[..len].to_vec();
            buf.advance(len);
            data
        } else {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let data = buf[..null_pos].to_vec();
            buf.advance((null_pos + 1).min(buf.len()));
            data
        };

        let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let db = String::from_utf8_lossy(&buf[..null_pos]).to_string();
            buf.advance((null_pos + 1).min(buf.len()));
            if db.is_empty() {
                None
            } else {
                Some(db)
            }
        } else {
            None
        };

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..null_pos]).to_string()
        } else {
            "mysql_native_password".to_string()
        };

        Some(Self {
            capability_flags,
            extra_capability_flags,
            max_packet_size,
            character_set,
            username,
            auth_response,
            database,
            auth_plugin_name,
        })
    }

    /// Encode to packet (proxy acting as client towards a backend)
    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u32_le(self.capability_flags);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.character_set);

        // Reserved (23 bytes, last 4 carry extended caps)
        buf.extend_from_slice(&[0u8; 19]);
        buf.put_u32_le(self.extra_capability_flags);

        buf.extend_from_slice(self.username.as_bytes());
        buf.put_u8(0);

        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.put_u8(self.auth_response.len() as u8);
            buf.extend_from_slice(&self.auth_response);
        } else {
            buf.extend_from_slice(&self.auth_response);
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            if let Some(ref db) = self.database {
                buf.extend_from_slice(db.as_bytes());
            }
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        Packet::new(sequence_id, buf.freeze())
    }
}

/// AuthSwitchRequest: sent when the client picked a plugin other than
/// mysql_native_password. The answer must be exactly 20 scramble bytes.
#[derive(Debug, Clone)]
pub struct AuthSwitchRequest {
    pub plugin_name: String,
    pub scramble: [u8; SCRAMBLE_SIZE],
}

impl AuthSwitchRequest {
    pub fn new(scramble: [u8; SCRAMBLE_SIZE]) -> Self {
        Self {
            plugin_name: "mysql_native_password".to_string(),
            scramble,
        }
    }

    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();
        buf.put_u8(0xFE);
        buf.extend_from_slice(self.plugin_name.as_bytes());
        buf.put_u8(0);
        buf.extend_from_slice(&self.scramble);
        buf.put_u8(0);
        Packet::new(sequence_id, buf.freeze())
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.first() != Some(&0xFE) || payload.len() < 2 {
            return None;
        }
        let buf = &payload[1..];
        let null_pos = buf.iter().position(|&b| b == 0)?;
        let plugin_name = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        let rest = &buf[null_pos + 1..];
        if rest.len() < SCRAMBLE_SIZE {
            return None;
        }
        let mut scramble = [0u8; SCRAMBLE_SIZE];
        scramble.copy_from_slice(&rest[..SCRAMBLE_SIZE]);
        Some(Self {
            plugin_name,
            scramble,
        })
    }
}

/// Compute the mysql_native_password token the client sends:
/// `SHA1(password) XOR SHA1(scramble || SHA1(SHA1(password)))`
pub fn compute_auth_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let hash1 = Sha1::digest(password.as_bytes());
    let hash2 = Sha1::digest(hash1);

    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(hash2);
    let hash3 = hasher.finalize();

    hash1
        .iter()
        .zip(hash3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Verify a client token against a plaintext password (server side).
pub fn verify_auth_response(token: &[u8], scramble: &[u8], password: &str) -> bool {
    let expected = compute_auth_response(password, scramble);
    expected == token
}

/// Verify a client token against a stored double-SHA1 hash, the format
/// the mysql.user password column uses (`*` + 40 hex chars).
///
/// Recovers `SHA1(password) = token XOR SHA1(scramble || stored)` and
/// checks `SHA1(recovered) == stored`.
pub fn verify_with_stored_hash(token: &[u8], scramble: &[u8], stored: &str) -> bool {
    let hex = stored.strip_prefix('*').unwrap_or(stored);
    let Some(stored_hash) = decode_hex_sha1(hex) else {
        return false;
    };
    if token.len() != 20 {
        // Empty token only matches an empty stored password
        return token.is_empty() && hex.is_empty();
    }

    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(stored_hash);
    let mask = hasher.finalize();

    let recovered: Vec<u8> = token.iter().zip(mask.iter()).map(|(a, b)| a ^ b).collect();
    let check = Sha1::digest(&recovered);
    check.as_slice() == stored_hash
}

fn decode_hex_sha1(hex: &str) -> Option<[u8; 20]> {
    if hex.len() != 40 {
        return None;
    }
    let mut out = [0u8; 20];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let s = std::str::from_utf8(chunk).ok()?;
        out[i] = u8::from_str_radix(s, 16).ok()?;
    }
    Some(out)
}

/// Format a plaintext password as the mysql.user stored hash
pub fn stored_hash_for_password(password: &str) -> String {
    if password.is_empty() {
        return String::new();
    }
    let hash = Sha1::digest(Sha1::digest(password.as_bytes()));
    let mut out = String::with_capacity(41);
    out.push('*');
    for b in hash {
        out.push_str(&format!("{:02X}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_roundtrip() {
        let hs = InitialHandshake::new(42, "10.6.11-MariaDB-bifrost", false);
        let packet = hs.encode();
        let parsed = InitialHandshake::parse(&packet.payload).unwrap();

        assert_eq!(parsed.protocol_version, 10);
        assert_eq!(parsed.connection_id, 42);
        assert_eq!(parsed.server_version, hs.server_version);
        assert_eq!(parsed.scramble, hs.scramble);
        assert_eq!(parsed.auth_plugin_name, "mysql_native_password");
        assert_eq!(parsed.extra_capability_flags, hs.extra_capability_flags);
    }

    #[test]
    fn test_handshake_ssl_bit() {
        let plain = InitialHandshake::new(1, "10.6.11-MariaDB", false);
        assert_eq!(plain.capability_flags & CLIENT_SSL, 0);

        let tls = InitialHandshake::new(1, "10.6.11-MariaDB", true);
        assert_ne!(tls.capability_flags & CLIENT_SSL, 0);
    }

    #[test]
    fn test_handshake_response_roundtrip() {
        let scramble = [7u8; SCRAMBLE_SIZE];
        let response = HandshakeResponse {
            capability_flags: DEFAULT_CAPABILITIES | CLIENT_CONNECT_WITH_DB,
            extra_capability_flags: 0,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x21,
            username: "app".to_string(),
            auth_response: compute_auth_response("secret", &scramble),
            database: Some("orders".to_string()),
            auth_plugin_name: "mysql_native_password".to_string(),
        };

        let packet = response.encode(1);
        let parsed = HandshakeResponse::parse(&packet.payload).unwrap();
        assert_eq!(parsed.username, "app");
        assert_eq!(parsed.database.as_deref(), Some("orders"));
        assert_eq!(parsed.auth_response, response.auth_response);
    }

    #[test]
    fn test_ssl_request_detection() {
        let mut payload = vec![0u8; AUTH_PACKET_BASE_SIZE];
        payload[..4].copy_from_slice(&(CLIENT_SSL | CLIENT_PROTOCOL_41).to_le_bytes());
        assert!(HandshakeResponse::is_ssl_request(&payload));

        // Same size without the SSL bit is just a malformed response
        let payload = vec![0u8; AUTH_PACKET_BASE_SIZE];
        assert!(!HandshakeResponse::is_ssl_request(&payload));

        // A real response is longer
        assert!(!HandshakeResponse::is_ssl_request(&vec![0u8; 50]));
    }

    #[test]
    fn test_auth_verify_plaintext() {
        let scramble = [3u8; SCRAMBLE_SIZE];
        let token = compute_auth_response("hunter2", &scramble);
        assert!(verify_auth_response(&token, &scramble, "hunter2"));
        assert!(!verify_auth_response(&token, &scramble, "hunter3"));
    }

    #[test]
    fn test_auth_verify_stored_hash() {
        let scramble = [9u8; SCRAMBLE_SIZE];
        let stored = stored_hash_for_password("s3cret");
        let token = compute_auth_response("s3cret", &scramble);
        assert!(verify_with_stored_hash(&token, &scramble, &stored));
        let bad = compute_auth_response("other", &scramble);
        assert!(!verify_with_stored_hash(&bad, &scramble, &stored));
    }

    #[test]
    fn test_empty_password() {
        let scramble = [1u8; SCRAMBLE_SIZE];
        assert!(compute_auth_response("", &scramble).is_empty());
        assert!(verify_auth_response(&[], &scramble, ""));
        assert!(!verify_auth_response(&[], &scramble, "nonempty"));
    }

    #[test]
    fn test_auth_switch_roundtrip() {
        let req = AuthSwitchRequest::new([5u8; SCRAMBLE_SIZE]);
        let packet = req.encode(2);
        assert_eq!(packet.payload[0], 0xFE);
        let parsed = AuthSwitchRequest::parse(&packet.payload).unwrap();
        assert_eq!(parsed.plugin_name, "mysql_native_password");
        assert_eq!(parsed.scramble, req.scramble);
    }
}
