//! Listeners: bound endpoints accepting client connections for one service.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::warn;

use super::Service;
use crate::config::ListenerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    Listening,
    Stopped,
}

pub struct Listener {
    pub name: String,
    pub config: ListenerConfig,
    pub service: Arc<Service>,
    state: RwLock<ListenerState>,
    /// Auth failures per source host; hosts past the limit are blocked
    auth_failures: DashMap<String, u32>,
}

impl Listener {
    pub fn new(name: impl Into<String>, config: ListenerConfig, service: Arc<Service>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            config,
            service,
            state: RwLock::new(ListenerState::Created),
            auth_failures: DashMap::new(),
        })
    }

    pub fn state(&self) -> ListenerState {
        *self.state.read()
    }

    pub fn set_state(&self, state: ListenerState) {
        *self.state.write() = state;
    }

    /// The endpoint this listener binds: unix socket wins over address:port
    pub fn bind_address(&self) -> String {
        match &self.config.socket {
            Some(socket) => socket.clone(),
            None => format!("{}:{}", self.config.address, self.config.port),
        }
    }

    /// TLS material present: SSL is advertised in the handshake
    pub fn has_tls(&self) -> bool {
        self.config.ssl_cert.is_some() && self.config.ssl_key.is_some()
    }

    /// Record an authentication failure; returns true when the host just
    /// crossed `max_auth_errors_until_block`.
    pub fn record_auth_failure(&self, host: &str) -> bool {
        let mut entry = self.auth_failures.entry(host.to_string()).or_insert(0);
        *entry += 1;
        let blocked = *entry == self.config.max_auth_errors_until_block;
        if blocked {
            warn!(
                listener = %self.name,
                host = %host,
                failures = *entry,
                "Host blocked after repeated authentication failures"
            );
        }
        blocked
    }

    pub fn is_host_blocked(&self, host: &str) -> bool {
        self.auth_failures
            .get(host)
            .map(|v| *v >= self.config.max_auth_errors_until_block)
            .unwrap_or(false)
    }

    /// Successful authentication clears the failure count
    pub fn clear_auth_failures(&self, host: &str) {
        self.auth_failures.remove(host);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Capabilities;
    use crate::service::ServiceTargets;

    fn listener(max_failures: u32) -> Arc<Listener> {
        let service_config = toml::from_str(
            r#"
            router = "readwritesplit"
            user = "proxy"
            password = "secret"
        "#,
        )
        .unwrap();
        let service = Service::new(
            "svc",
            service_config,
            ServiceTargets::Servers(vec![]),
            Capabilities::empty(),
        );
        let config: ListenerConfig = toml::from_str(&format!(
            r#"
            service = "svc"
            port = 4006
            max_auth_errors_until_block = {}
        "#,
            max_failures
        ))
        .unwrap();
        Listener::new("l1", config, service)
    }

    #[test]
    fn test_host_blocking() {
        let l = listener(3);
        assert!(!l.is_host_blocked("10.0.0.9"));
        assert!(!l.record_auth_failure("10.0.0.9"));
        assert!(!l.record_auth_failure("10.0.0.9"));
        // Third failure crosses the limit
        assert!(l.record_auth_failure("10.0.0.9"));
        assert!(l.is_host_blocked("10.0.0.9"));

        // Other hosts unaffected
        assert!(!l.is_host_blocked("10.0.0.10"));

        l.clear_auth_failures("10.0.0.9");
        assert!(!l.is_host_blocked("10.0.0.9"));
    }

    #[test]
    fn test_bind_address_prefers_socket() {
        let mut l = listener(3);
        assert_eq!(l.bind_address(), "0.0.0.0:4006");
        let inner = Arc::get_mut(&mut l).unwrap();
        inner.config.socket = Some("/tmp/bifrost.sock".to_string());
        assert_eq!(l.bind_address(), "/tmp/bifrost.sock");
    }

    #[test]
    fn test_state_transitions() {
        let l = listener(3);
        assert_eq!(l.state(), ListenerState::Created);
        l.set_state(ListenerState::Listening);
        assert_eq!(l.state(), ListenerState::Listening);
        l.set_state(ListenerState::Stopped);
        assert_eq!(l.state(), ListenerState::Stopped);
    }
}
