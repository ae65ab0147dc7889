use bytes::Bytes;

use super::packet::Command;

/// Parsed command from client
#[derive(Debug, Clone)]
pub enum ClientCommand {
    Query(String),
    InitDb(String),
    Quit,
    Ping,
    ChangeUser {
        username: String,
        auth_response: Vec<u8>,
        database: Option<String>,
        charset: u8,
        auth_plugin_name: String,
    },
    /// COM_SET_OPTION: 0 enables multi-statements, 1 disables
    SetOption(u16),
    StmtPrepare(String),
    StmtExecute {
        statement_id: u32,
    },
    StmtSendLongData {
        statement_id: u32,
    },
    StmtClose {
        statement_id: u32,
    },
    StmtReset {
        statement_id: u32,
    },
    StmtFetch {
        statement_id: u32,
        num_rows: u32,
    },
    StmtBulkExecute {
        statement_id: u32,
    },
    ProcessKill(u64),
    ResetConnection,
    FieldList {
        table: String,
        wildcard: String,
    },
    Unknown(u8, Bytes),
}

impl ClientCommand {
    /// Parse command from packet payload
    pub fn parse(payload: &Bytes) -> Self {
        if payload.is_empty() {
            return ClientCommand::Unknown(0, Bytes::new());
        }

        let cmd = Command::from(payload[0]);
        let data = payload.slice(1..);

        match cmd {
            Command::Query => {
                let sql = String::from_utf8_lossy(&data).to_string();
                ClientCommand::Query(sql)
            }
            Command::InitDb => {
                let db = String::from_utf8_lossy(&data).to_string();
                ClientCommand::InitDb(db)
            }
            Command::Quit => ClientCommand::Quit,
            Command::Ping => ClientCommand::Ping,
            Command::ChangeUser => Self::parse_change_user(&data)
                .unwrap_or_else(|| ClientCommand::Unknown(payload[0], data)),
            Command::SetOption => {
                if data.len() >= 2 {
                    ClientCommand::SetOption(u16::from_le_bytes([data[0], data[1]]))
                } else {
                    ClientCommand::Unknown(payload[0], data)
                }
            }
            Command::StmtPrepare => {
                ClientCommand::StmtPrepare(String::from_utf8_lossy(&data).to_string())
            }
            Command::StmtExecute => match read_u32(&data) {
                Some(id) => ClientCommand::StmtExecute { statement_id: id },
                None => ClientCommand::Unknown(payload[0], data),
            },
            Command::StmtSendLongData => match read_u32(&data) {
                Some(id) => ClientCommand::StmtSendLongData { statement_id: id },
                None => ClientCommand::Unknown(payload[0], data),
            },
            Command::StmtClose => match read_u32(&data) {
                Some(id) => ClientCommand::StmtClose { statement_id: id },
                None => ClientCommand::Unknown(payload[0], data),
            },
            Command::StmtReset => match read_u32(&data) {
                Some(id) => ClientCommand::StmtReset { statement_id: id },
                None => ClientCommand::Unknown(payload[0], data),
            },
            Command::StmtFetch => {
                if data.len() >= 8 {
                    ClientCommand::StmtFetch {
                        statement_id: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
                        num_rows: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
                    }
                } else {
                    ClientCommand::Unknown(payload[0], data)
                }
            }
            Command::StmtBulkExecute => match read_u32(&data) {
                Some(id) => ClientCommand::StmtBulkExecute { statement_id: id },
                None => ClientCommand::Unknown(payload[0], data),
            },
            Command::ProcessKill => {
                if data.len() >= 4 {
                    let id = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                    ClientCommand::ProcessKill(id as u64)
                } else {
                    ClientCommand::Unknown(payload[0], data)
                }
            }
            Command::ResetConnection => ClientCommand::ResetConnection,
            Command::FieldList => {
                let null_pos = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                let table = String::from_utf8_lossy(&data[..null_pos]).to_string();
                let wildcard = if null_pos + 1 < data.len() {
                    String::from_utf8_lossy(&data[null_pos + 1..]).to_string()
                } else {
                    String::new()
                };
                ClientCommand::FieldList { table, wildcard }
            }
            _ => ClientCommand::Unknown(payload[0], data),
        }
    }

    fn parse_change_user(data: &[u8]) -> Option<Self> {
        let null_pos = data.iter().position(|&b| b == 0)?;
        let username = String::from_utf8_lossy(&data[..null_pos]).to_string();
        let mut rest = &data[null_pos + 1..];

        let auth_len = *rest.first()? as usize;
        rest = &rest[1..];
        if rest.len() < auth_len {
            return None;
        }
        let auth_response = rest[..auth_len].to_vec();
        rest = &rest[auth_len..];

        let null_pos = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let db = String::from_utf8_lossy(&rest[..null_pos]).to_string();
        let database = if db.is_empty() { None } else { Some(db) };
        rest = &rest[(null_pos + 1).min(rest.len())..];

        let charset = if rest.len() >= 2 {
            let c = rest[0];
            rest = &rest[2..];
            c
        } else {
            0x21
        };

        let auth_plugin_name = if !rest.is_empty() {
            let null_pos = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
            String::from_utf8_lossy(&rest[..null_pos]).to_string()
        } else {
            "mysql_native_password".to_string()
        };

        Some(ClientCommand::ChangeUser {
            username,
            auth_response,
            database,
            charset,
            auth_plugin_name,
        })
    }

    /// The raw command byte this variant corresponds to
    pub fn command(&self) -> Command {
        match self {
            ClientCommand::Query(_) => Command::Query,
            ClientCommand::InitDb(_) => Command::InitDb,
            ClientCommand::Quit => Command::Quit,
            ClientCommand::Ping => Command::Ping,
            ClientCommand::ChangeUser { .. } => Command::ChangeUser,
            ClientCommand::SetOption(_) => Command::SetOption,
            ClientCommand::StmtPrepare(_) => Command::StmtPrepare,
            ClientCommand::StmtExecute { .. } => Command::StmtExecute,
            ClientCommand::StmtSendLongData { .. } => Command::StmtSendLongData,
            ClientCommand::StmtClose { .. } => Command::StmtClose,
            ClientCommand::StmtReset { .. } => Command::StmtReset,
            ClientCommand::StmtFetch { .. } => Command::StmtFetch,
            ClientCommand::StmtBulkExecute { .. } => Command::StmtBulkExecute,
            ClientCommand::ProcessKill(_) => Command::ProcessKill,
            ClientCommand::ResetConnection => Command::ResetConnection,
            ClientCommand::FieldList { .. } => Command::FieldList,
            ClientCommand::Unknown(b, _) => Command::from(*b),
        }
    }

    /// Statement id for the prepared-statement commands
    pub fn statement_id(&self) -> Option<u32> {
        match self {
            ClientCommand::StmtExecute { statement_id }
            | ClientCommand::StmtSendLongData { statement_id }
            | ClientCommand::StmtClose { statement_id }
            | ClientCommand::StmtReset { statement_id }
            | ClientCommand::StmtFetch { statement_id, .. }
            | ClientCommand::StmtBulkExecute { statement_id } => Some(*statement_id),
            _ => None,
        }
    }
}

fn read_u32(data: &[u8]) -> Option<u32> {
    if data.len() >= 4 {
        Some(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
    } else {
        None
    }
}

/// Rewrite the statement id in a prepared-statement command payload,
/// returning the new payload. Used when per-backend ids differ from the
/// id handed to the client.
pub fn rewrite_statement_id(payload: &Bytes, new_id: u32) -> Bytes {
    if payload.len() < 5 {
        return payload.clone();
    }
    let mut out = payload.to_vec();
    out[1..5].copy_from_slice(&new_id.to_le_bytes());
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(bytes: Vec<u8>) -> Bytes {
        Bytes::from(bytes)
    }

    #[test]
    fn test_parse_query() {
        let cmd = ClientCommand::parse(&payload(b"\x03SELECT 1".to_vec()));
        assert!(matches!(cmd, ClientCommand::Query(ref sql) if sql == "SELECT 1"));
    }

    #[test]
    fn test_parse_stmt_execute() {
        let mut p = vec![0x17];
        p.extend_from_slice(&5u32.to_le_bytes());
        p.extend_from_slice(&[0, 1, 0, 0, 0]); // flags + iteration count
        let cmd = ClientCommand::parse(&payload(p));
        assert!(matches!(cmd, ClientCommand::StmtExecute { statement_id: 5 }));
    }

    #[test]
    fn test_parse_set_option() {
        let cmd = ClientCommand::parse(&payload(vec![0x1b, 0x00, 0x00]));
        assert!(matches!(cmd, ClientCommand::SetOption(0)));
        let cmd = ClientCommand::parse(&payload(vec![0x1b, 0x01, 0x00]));
        assert!(matches!(cmd, ClientCommand::SetOption(1)));
    }

    #[test]
    fn test_parse_change_user() {
        let mut p = vec![0x11];
        p.extend_from_slice(b"newuser\0");
        p.push(3);
        p.extend_from_slice(&[0xaa, 0xbb, 0xcc]);
        p.extend_from_slice(b"newdb\0");
        p.extend_from_slice(&[0x21, 0x00]);
        p.extend_from_slice(b"mysql_native_password\0");

        match ClientCommand::parse(&payload(p)) {
            ClientCommand::ChangeUser {
                username,
                auth_response,
                database,
                charset,
                auth_plugin_name,
            } => {
                assert_eq!(username, "newuser");
                assert_eq!(auth_response, vec![0xaa, 0xbb, 0xcc]);
                assert_eq!(database.as_deref(), Some("newdb"));
                assert_eq!(charset, 0x21);
                assert_eq!(auth_plugin_name, "mysql_native_password");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_process_kill() {
        let mut p = vec![0x0c];
        p.extend_from_slice(&99u32.to_le_bytes());
        let cmd = ClientCommand::parse(&payload(p));
        assert!(matches!(cmd, ClientCommand::ProcessKill(99)));
    }

    #[test]
    fn test_rewrite_statement_id() {
        let mut p = vec![0x17];
        p.extend_from_slice(&1u32.to_le_bytes());
        p.extend_from_slice(&[0]);
        let rewritten = rewrite_statement_id(&Bytes::from(p), 42);
        let cmd = ClientCommand::parse(&rewritten);
        assert_eq!(cmd.statement_id(), Some(42));
    }

    #[test]
    fn test_truncated_stmt_command_is_unknown() {
        let cmd = ClientCommand::parse(&payload(vec![0x19, 0x01]));
        assert!(matches!(cmd, ClientCommand::Unknown(0x19, _)));
    }
}
