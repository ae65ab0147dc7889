//! Session-command history.
//!
//! A session command is a server-visible state change (SET, USE, charset,
//! prepared statement metadata commands) that must be applied to every
//! backend the session uses. Commands receive monotonically increasing
//! positions; a backend joining mid-session replays everything past its
//! own position before taking new queries.

use bytes::Bytes;

use crate::protocol::Command;

/// One recorded session command
#[derive(Debug, Clone)]
pub struct SessionCommand {
    pub position: u64,
    pub payload: Bytes,
}

impl SessionCommand {
    pub fn command(&self) -> Command {
        self.payload
            .first()
            .map(|&b| Command::from(b))
            .unwrap_or(Command::Unknown)
    }

    /// Key identifying the logical state this command sets; a later command
    /// with the same key supersedes this one.
    fn compression_key(&self) -> Option<String> {
        match self.command() {
            Command::InitDb => Some("use".to_string()),
            Command::Query => {
                let sql = String::from_utf8_lossy(&self.payload[1..]);
                let trimmed = sql.trim();
                let mut words = trimmed.split_whitespace();
                let first = words.next()?.to_ascii_uppercase();
                match first.as_str() {
                    "USE" => Some("use".to_string()),
                    "SET" => {
                        // SET <var> = ... keyed per variable
                        let rest = trimmed[3..].trim_start();
                        let var: String = rest
                            .chars()
                            .take_while(|c| !c.is_whitespace() && *c != '=')
                            .collect();
                        if var.is_empty() {
                            None
                        } else {
                            Some(format!("set {}", var.to_ascii_lowercase()))
                        }
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

/// Ordered history of session commands with superseded-entry compression
#[derive(Debug, Default)]
pub struct SessionCommandHistory {
    commands: Vec<SessionCommand>,
    next_position: u64,
    /// disable_sescmd_history: when set, history is not recorded and
    /// backends cannot be acquired mid-session
    disabled: bool,
}

impl SessionCommandHistory {
    pub fn new(disabled: bool) -> Self {
        Self {
            commands: Vec::new(),
            next_position: 1,
            disabled,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Record a session command, returning its position.
    ///
    /// An earlier command setting the same logical state (same `USE`
    /// target slot, same `SET` variable) is dropped; the replacement keeps
    /// the new, larger position so replay ordering is preserved.
    pub fn add(&mut self, payload: Bytes) -> u64 {
        let position = self.next_position;
        self.next_position += 1;

        let cmd = SessionCommand { position, payload };

        if !self.disabled {
            if let Some(key) = cmd.compression_key() {
                self.commands
                    .retain(|c| c.compression_key().as_deref() != Some(key.as_str()));
            }
            self.commands.push(cmd);
        }

        position
    }

    /// Commands a backend at `position` still has to replay, in order
    pub fn after(&self, position: u64) -> impl Iterator<Item = &SessionCommand> {
        self.commands.iter().filter(move |c| c.position > position)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Position of the newest recorded command
    pub fn latest_position(&self) -> u64 {
        self.next_position - 1
    }
}
