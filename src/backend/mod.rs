//! Backend sessions.
//!
//! One `BackendSession` exists per (client session, backend server) pair.
//! It owns the outbound connection, tracks the replies it still owes the
//! router and knows how far through the session-command history its server
//! state is.

mod connection;

pub use connection::{BackendConnection, BackendTimeouts, ConnectionError, ResultSet};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::protocol::{Command, Packet, Reply, ReplyDecoder};
use crate::server::Server;
use crate::session::history::SessionCommandHistory;

/// Backend session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    NotInUse,
    Connecting,
    InUse,
    WaitingResult,
    ReplayingHistory,
    Closed,
}

/// Why a backend session was closed, kept for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendCloseReason {
    Normal,
    SessionClosed,
    BackendFailure,
    ReplayFailed,
    Fenced,
}

/// What kind of reply a forwarded packet will produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingResponse {
    /// Reply is streamed to the client
    Client,
    /// Session-command reply, consumed internally
    SessionCommand(u64),
}

pub struct BackendSession {
    server: Arc<Server>,
    conn: Option<BackendConnection>,
    state: BackendState,
    /// Position of the newest session command applied to this backend
    sescmd_position: u64,
    pending: VecDeque<PendingResponse>,
    decoder: Option<ReplyDecoder>,
    last_write: Option<Instant>,
    num_selects: u64,
    bytes_forwarded: u64,
    close_reason: Option<BackendCloseReason>,
}

impl BackendSession {
    /// Open a connection to the server and authenticate
    pub async fn connect(
        server: Arc<Server>,
        user: &str,
        password: &str,
        database: Option<&str>,
        timeouts: BackendTimeouts,
    ) -> Result<Self, ConnectionError> {
        let addr = server.endpoint.to_string();
        let conn = BackendConnection::connect(&addr, user, password, database, timeouts).await?;
        server.connection_opened();

        Ok(Self {
            server,
            conn: Some(conn),
            state: BackendState::InUse,
            sescmd_position: 0,
            pending: VecDeque::new(),
            decoder: None,
            last_write: None,
            num_selects: 0,
            bytes_forwarded: 0,
            close_reason: None,
        })
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn state(&self) -> BackendState {
        self.state
    }

    pub fn in_use(&self) -> bool {
        matches!(
            self.state,
            BackendState::InUse | BackendState::WaitingResult | BackendState::ReplayingHistory
        )
    }

    pub fn is_waiting_result(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn session_command_position(&self) -> u64 {
        self.sescmd_position
    }

    pub fn has_session_commands(&self) -> bool {
        self.pending
            .iter()
            .any(|p| matches!(p, PendingResponse::SessionCommand(_)))
    }

    pub fn session_command_count(&self) -> usize {
        self.pending
            .iter()
            .filter(|p| matches!(p, PendingResponse::SessionCommand(_)))
            .count()
    }

    pub fn last_write_ts(&self) -> Option<Instant> {
        self.last_write
    }

    pub fn num_selects(&self) -> u64 {
        self.num_selects
    }

    pub fn bytes_forwarded(&self) -> u64 {
        self.bytes_forwarded
    }

    pub fn close_reason(&self) -> Option<BackendCloseReason> {
        self.close_reason
    }

    pub fn thread_id(&self) -> Option<u32> {
        self.conn.as_ref().map(|c| c.thread_id())
    }

    pub fn capabilities(&self) -> u32 {
        self.conn.as_ref().map(|c| c.capabilities()).unwrap_or(0)
    }

    fn conn_mut(&mut self) -> Result<&mut BackendConnection, ConnectionError> {
        self.conn.as_mut().ok_or(ConnectionError::Disconnected)
    }

    /// Forward a packet. Returns whether a reply is expected.
    ///
    /// `session_command_position` is set when this is a session command
    /// whose reply must be consumed internally rather than streamed.
    pub async fn write(
        &mut self,
        packet: Packet,
        session_command_position: Option<u64>,
    ) -> Result<bool, ConnectionError> {
        let command = packet
            .first_byte()
            .map(Command::from)
            .unwrap_or(Command::Unknown);

        if command == Command::Query {
            let sql_start = packet.payload.get(1..8).unwrap_or(&[]);
            if sql_start
                .iter()
                .take(6)
                .map(|b| b.to_ascii_uppercase())
                .eq(*b"SELECT")
            {
                self.num_selects += 1;
            }
        }

        let expects = command.expects_response();
        self.server.op_started();
        self.last_write = Some(Instant::now());

        let result = self.conn_mut()?.send(packet).await;
        if let Err(e) = result {
            self.server.op_finished();
            self.close(BackendCloseReason::BackendFailure);
            return Err(e);
        }

        if expects {
            match session_command_position {
                Some(pos) => {
                    self.sescmd_position = self.sescmd_position.max(pos);
                    self.pending.push_back(PendingResponse::SessionCommand(pos));
                }
                None => self.pending.push_back(PendingResponse::Client),
            }
            if self.decoder.is_none() {
                self.decoder = Some(ReplyDecoder::new(command, self.capabilities()));
            }
            self.state = BackendState::WaitingResult;
        } else {
            self.server.op_finished();
            // Position advances even for commands that produce no reply
            if let Some(pos) = session_command_position {
                self.sescmd_position = self.sescmd_position.max(pos);
            }
        }

        Ok(expects)
    }

    /// Read the next packet of the in-flight reply.
    ///
    /// Returns the packet, the decoder's view of the reply and whether the
    /// reply is now complete. Completion acknowledges the write.
    pub async fn read_reply_packet(&mut self) -> Result<(Packet, Reply, bool), ConnectionError> {
        let packet = match self.conn_mut()?.recv().await {
            Ok(p) => p,
            Err(e) => {
                self.server.op_finished();
                self.close(BackendCloseReason::BackendFailure);
                return Err(e);
            }
        };
        self.bytes_forwarded += packet.payload.len() as u64;

        let decoder = match self.decoder.as_mut() {
            Some(d) => d,
            None => {
                // Unsolicited packet; treat as protocol failure
                self.close(BackendCloseReason::BackendFailure);
                return Err(ConnectionError::Protocol("Unexpected backend packet".into()));
            }
        };

        let complete = decoder.process(&packet);
        let reply = decoder.reply().clone();
        if complete {
            self.ack_write();
        }
        Ok((packet, reply, complete))
    }

    /// A complete reply arrived; advance the pending queue
    pub fn ack_write(&mut self) {
        self.decoder = None;
        self.pending.pop_front();
        self.server.op_finished();
        if self.pending.is_empty() && self.state == BackendState::WaitingResult {
            self.state = BackendState::InUse;
        } else if !self.pending.is_empty() {
            // Interleaved commands: arm the decoder for the next reply
            self.decoder = Some(ReplyDecoder::new(Command::Query, self.capabilities()));
        }
    }

    /// Replay session commands past this backend's position, in order,
    /// discarding their responses. A failed replay closes the backend.
    pub async fn replay_history(
        &mut self,
        history: &SessionCommandHistory,
    ) -> Result<(), ConnectionError> {
        if history.after(self.sescmd_position).next().is_none() {
            return Ok(());
        }

        self.state = BackendState::ReplayingHistory;
        let commands: Vec<(u64, Bytes)> = history
            .after(self.sescmd_position)
            .map(|c| (c.position, c.payload.clone()))
            .collect();

        for (position, payload) in commands {
            debug!(
                server = %self.server.name,
                position,
                "Replaying session command"
            );
            let packet = Packet::new(0, payload);
            let expects = self.write(packet, Some(position)).await?;
            if expects {
                loop {
                    let (_, reply, complete) = self.read_reply_packet().await?;
                    if complete {
                        if let Some(err) = reply.last_error {
                            warn!(
                                server = %self.server.name,
                                position,
                                error = %err.error_message,
                                "Session command replay failed"
                            );
                            self.close(BackendCloseReason::ReplayFailed);
                            return Err(ConnectionError::Query(err.error_message));
                        }
                        break;
                    }
                }
            }
        }

        self.state = BackendState::InUse;
        Ok(())
    }

    /// Execute one newly recorded session command on this backend.
    ///
    /// Returns whether a reply is expected; the reply, when it comes, is
    /// consumed via `read_reply_packet` like any other.
    pub async fn execute_session_command(
        &mut self,
        position: u64,
        payload: Bytes,
    ) -> Result<bool, ConnectionError> {
        self.write(Packet::new(0, payload), Some(position)).await
    }

    /// True when the pending reply at the queue head belongs to a session
    /// command and must not be streamed to the client.
    pub fn reply_is_internal(&self) -> bool {
        matches!(
            self.pending.front(),
            Some(PendingResponse::SessionCommand(_))
        )
    }

    /// Zero-payload ping keeping an idle connection alive
    pub async fn ping(&mut self) -> Result<(), ConnectionError> {
        self.write(Packet::ping(), Some(self.sescmd_position)).await?;
        loop {
            let (_, _, complete) = self.read_reply_packet().await?;
            if complete {
                return Ok(());
            }
        }
    }

    /// Release the connection and record why
    pub fn close(&mut self, reason: BackendCloseReason) {
        if self.state == BackendState::Closed {
            return;
        }
        if self.conn.take().is_some() {
            self.server.connection_closed();
        }
        // Outstanding ops will never finish
        for _ in 0..self.pending.len() {
            self.server.op_finished();
        }
        self.pending.clear();
        self.decoder = None;
        self.state = BackendState::Closed;
        self.close_reason = Some(reason);
        debug!(server = %self.server.name, reason = ?reason, "Backend session closed");
    }
}

impl Drop for BackendSession {
    fn drop(&mut self) {
        self.close(BackendCloseReason::SessionClosed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Endpoint;

    fn idle_backend() -> BackendSession {
        BackendSession {
            server: Server::new("db1", Endpoint::tcp("127.0.0.1", 3306)),
            conn: None,
            state: BackendState::InUse,
            sescmd_position: 0,
            pending: VecDeque::new(),
            decoder: None,
            last_write: None,
            num_selects: 0,
            bytes_forwarded: 0,
            close_reason: None,
        }
    }

    #[test]
    fn test_pending_response_bookkeeping() {
        let mut b = idle_backend();
        b.pending.push_back(PendingResponse::Client);
        b.state = BackendState::WaitingResult;
        b.server.op_started();
        assert!(b.is_waiting_result());
        assert!(!b.reply_is_internal());

        b.ack_write();
        assert!(!b.is_waiting_result());
        assert_eq!(b.state, BackendState::InUse);
    }

    #[test]
    fn test_session_command_counting() {
        let mut b = idle_backend();
        b.pending.push_back(PendingResponse::SessionCommand(1));
        b.pending.push_back(PendingResponse::Client);
        b.pending.push_back(PendingResponse::SessionCommand(2));

        assert!(b.has_session_commands());
        assert_eq!(b.session_command_count(), 2);
        assert!(b.reply_is_internal());
    }

    #[test]
    fn test_close_records_reason_once() {
        let mut b = idle_backend();
        b.close(BackendCloseReason::BackendFailure);
        assert_eq!(b.close_reason(), Some(BackendCloseReason::BackendFailure));
        assert_eq!(b.state(), BackendState::Closed);

        // A later close does not overwrite the original reason
        b.close(BackendCloseReason::Normal);
        assert_eq!(b.close_reason(), Some(BackendCloseReason::BackendFailure));
    }

    #[test]
    fn test_in_use_states() {
        let mut b = idle_backend();
        assert!(b.in_use());
        b.state = BackendState::ReplayingHistory;
        assert!(b.in_use());
        b.close(BackendCloseReason::Normal);
        assert!(!b.in_use());
    }
}
