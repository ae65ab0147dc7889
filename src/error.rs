//! Proxy-wide error taxonomy.
//!
//! Every error surfaced to a client is rendered as a MySQL ERR packet with
//! a plausible code and SQLSTATE. Backends and filters never panic across
//! component boundaries; boundary operations return these kinds.

use thiserror::Error;

use crate::protocol::ErrPacket;

/// Why authentication failed; each subtype maps to a numbered ERR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailureKind {
    NoSession,
    FailedDb,
    FailedSsl,
    SslIncomplete,
    BadHandshake,
    Generic,
}

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed packet header, truncated payload, unexpected packet in
    /// state. Fatal to the offending connection.
    #[error("wire format error: {0}")]
    WireFormat(String),

    #[error("authentication failure ({kind:?}): {message}")]
    AuthFailure {
        kind: AuthFailureKind,
        user: String,
        message: String,
    },

    /// Connect/read/write failure or unexpected hangup on a backend.
    /// Recovered locally by the router where possible.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// No eligible backend for the routing decision
    #[error("routing policy: {0}")]
    RoutingPolicy(String),

    #[error("config validation: {0}")]
    ConfigValidation(String),

    /// WSREP-not-ready and rollback-trigger errors; consumed by the router
    /// and retried, never surfaced raw
    #[error("transient error: {0}")]
    TransientRetryable(String),

    /// Checksum mismatch during replay, replay budget exhausted
    #[error("fatal session error: {0}")]
    FatalSession(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub fn auth(kind: AuthFailureKind, user: impl Into<String>, message: impl Into<String>) -> Self {
        ProxyError::AuthFailure {
            kind,
            user: user.into(),
            message: message.into(),
        }
    }

    /// Render as the ERR packet the client sees
    pub fn to_err_packet(&self) -> ErrPacket {
        match self {
            ProxyError::WireFormat(_) => ErrPacket::connection_killed("malformed packet"),
            ProxyError::AuthFailure { kind, user, message } => match kind {
                AuthFailureKind::FailedDb => ErrPacket::new(1049, "42000", message),
                AuthFailureKind::FailedSsl | AuthFailureKind::SslIncomplete => {
                    ErrPacket::new(1045, "28000", message)
                }
                AuthFailureKind::BadHandshake => ErrPacket::new(1043, "08S01", "Bad handshake"),
                AuthFailureKind::NoSession | AuthFailureKind::Generic => {
                    ErrPacket::access_denied(user, "%", true)
                }
            },
            ProxyError::BackendUnavailable(msg) => {
                ErrPacket::new(2003, "HY000", &format!("Can't connect to backend server: {}", msg))
            }
            ProxyError::RoutingPolicy(msg) => ErrPacket::new(1927, "08S01", msg),
            ProxyError::ConfigValidation(msg) => ErrPacket::new(1105, "HY000", msg),
            ProxyError::TransientRetryable(msg) => ErrPacket::new(1105, "HY000", msg),
            ProxyError::FatalSession(msg) => ErrPacket::connection_killed(msg),
            ProxyError::Io(e) => ErrPacket::new(2013, "HY000", &format!("Lost connection: {}", e)),
        }
    }

    /// Locally recoverable by rerouting or replay
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProxyError::BackendUnavailable(_) | ProxyError::TransientRetryable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failure_packets() {
        let err = ProxyError::auth(AuthFailureKind::Generic, "bob", "denied");
        let packet = err.to_err_packet();
        assert_eq!(packet.error_code, 1045);
        assert_eq!(packet.sql_state, "28000");

        let err = ProxyError::auth(AuthFailureKind::FailedDb, "bob", "Unknown database 'x'");
        assert_eq!(err.to_err_packet().error_code, 1049);
    }

    #[test]
    fn test_fatal_session_is_1927() {
        let err = ProxyError::FatalSession("Transaction checksum mismatch".to_string());
        let packet = err.to_err_packet();
        assert_eq!(packet.error_code, 1927);
        assert!(packet.error_message.contains("checksum mismatch"));
    }

    #[test]
    fn test_recoverability() {
        assert!(ProxyError::BackendUnavailable("gone".into()).is_recoverable());
        assert!(ProxyError::TransientRetryable("wsrep".into()).is_recoverable());
        assert!(!ProxyError::WireFormat("bad".into()).is_recoverable());
    }
}
