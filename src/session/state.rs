//! Per-session client-protocol state.

/// Client session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Created,
    Started,
    Stopping,
    Stopped,
}

/// Why the session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    RoutingFailed,
    HandshakeFailed,
    ClientQuit,
    BackendFailure,
    AuthFailure,
    Timeout,
}

/// State negotiated with and tracked for one client
#[derive(Debug, Default)]
pub struct SessionState {
    pub username: String,
    pub database: Option<String>,
    /// Client capability flags from the handshake response
    pub capability_flags: u32,
    pub character_set: u8,
    /// Toggled via COM_SET_OPTION
    pub multi_statements: bool,
    pub phase: SessionPhase,
    pub close_reason: Option<CloseReason>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_from_handshake(
        &mut self,
        username: String,
        database: Option<String>,
        capabilities: u32,
        charset: u8,
    ) {
        self.username = username;
        self.database = database;
        self.capability_flags = capabilities;
        self.character_set = charset;
    }

    pub fn start(&mut self) {
        self.phase = SessionPhase::Started;
    }

    pub fn stop(&mut self, reason: CloseReason) {
        if self.close_reason.is_none() {
            self.close_reason = Some(reason);
        }
        self.phase = match self.phase {
            SessionPhase::Stopped => SessionPhase::Stopped,
            _ => SessionPhase::Stopping,
        };
    }

    pub fn stopped(&mut self) {
        self.phase = SessionPhase::Stopped;
    }

    pub fn change_database(&mut self, db: String) {
        self.database = Some(db);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let mut state = SessionState::new();
        assert_eq!(state.phase, SessionPhase::Created);
        state.start();
        assert_eq!(state.phase, SessionPhase::Started);
        state.stop(CloseReason::ClientQuit);
        assert_eq!(state.phase, SessionPhase::Stopping);
        state.stopped();
        assert_eq!(state.phase, SessionPhase::Stopped);
    }

    #[test]
    fn test_first_close_reason_wins() {
        let mut state = SessionState::new();
        state.stop(CloseReason::BackendFailure);
        state.stop(CloseReason::ClientQuit);
        assert_eq!(state.close_reason, Some(CloseReason::BackendFailure));
    }
}
