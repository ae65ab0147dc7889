//! Services: the binding between listeners, a router and target servers.

mod listener;
mod registry;

pub use listener::{Listener, ListenerState};
pub use registry::Registry;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::ServiceConfig;
use crate::filter::{Capabilities, Filter, FilterDef};
use crate::server::Server;
use crate::users::UserCache;

/// Where a service's backend set comes from: an explicit server list or
/// exactly one monitor, never both.
#[derive(Debug, Clone)]
pub enum ServiceTargets {
    Servers(Vec<Arc<Server>>),
    Cluster(String),
}

#[derive(Debug, Default)]
pub struct ServiceStats {
    pub n_sessions: AtomicU64,
    pub n_current: AtomicUsize,
}

pub struct Service {
    pub name: String,
    pub router: String,
    params: RwLock<ServiceConfig>,
    targets: RwLock<ServiceTargets>,
    filters: RwLock<Vec<(FilterDef, Arc<dyn Filter>)>>,
    pub user_cache: Arc<UserCache>,
    pub stats: ServiceStats,
    /// Router capability set; a session unions this with its filters' at
    /// creation and never re-reads it
    base_capabilities: Capabilities,
    active: AtomicBool,
}

impl Service {
    pub fn new(
        name: impl Into<String>,
        params: ServiceConfig,
        targets: ServiceTargets,
        base_capabilities: Capabilities,
    ) -> Arc<Self> {
        let user_cache = Arc::new(UserCache::new(std::time::Duration::from_secs(
            params.users_refresh_time_s,
        )));
        Arc::new(Self {
            name: name.into(),
            router: params.router.clone(),
            params: RwLock::new(params),
            targets: RwLock::new(targets),
            filters: RwLock::new(Vec::new()),
            user_cache,
            stats: ServiceStats::default(),
            base_capabilities,
            active: AtomicBool::new(true),
        })
    }

    pub fn params(&self) -> ServiceConfig {
        self.params.read().clone()
    }

    pub fn update_params(&self, params: ServiceConfig) {
        *self.params.write() = params;
    }

    pub fn targets(&self) -> ServiceTargets {
        self.targets.read().clone()
    }

    pub fn set_targets(&self, targets: ServiceTargets) {
        *self.targets.write() = targets;
    }

    /// Resolve the current target servers through the registry. A service
    /// backed by a monitor sees the monitor's member set.
    pub fn servers(&self, registry: &Registry) -> Vec<Arc<Server>> {
        match &*self.targets.read() {
            ServiceTargets::Servers(list) => list.clone(),
            ServiceTargets::Cluster(monitor) => registry.monitor_servers(monitor),
        }
    }

    pub fn filters(&self) -> Vec<(FilterDef, Arc<dyn Filter>)> {
        self.filters.read().clone()
    }

    pub fn set_filters(&self, filters: Vec<(FilterDef, Arc<dyn Filter>)>) {
        *self.filters.write() = filters;
    }

    pub fn has_filters(&self) -> bool {
        !self.filters.read().is_empty()
    }

    /// Union of router and filter capabilities, snapshotted by sessions
    pub fn capabilities(&self) -> Capabilities {
        let mut caps = self.base_capabilities;
        for (_, f) in self.filters.read().iter() {
            caps |= f.capabilities();
        }
        caps
    }

    /// Classifier result caching is off when any filter masks string
    /// arguments as fields
    pub fn classifier_cache_enabled(&self) -> bool {
        !self
            .filters
            .read()
            .iter()
            .any(|(_, f)| f.disables_classifier_cache())
    }

    pub fn session_started(&self) {
        self.stats.n_sessions.fetch_add(1, Ordering::Relaxed);
        self.stats.n_current.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_ended(&self) {
        self.stats.n_current.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn current_sessions(&self) -> usize {
        self.stats.n_current.load(Ordering::Relaxed)
    }

    /// max_connections enforcement; zero means unlimited
    pub fn at_connection_limit(&self) -> bool {
        let max = self.params.read().max_connections;
        max > 0 && self.current_sessions() >= max
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Endpoint;

    fn service_config() -> ServiceConfig {
        toml::from_str(
            r#"
            router = "readwritesplit"
            user = "proxy"
            password = "secret"
            max_connections = 2
        "#,
        )
        .unwrap()
    }

    #[test]
    fn test_connection_limit() {
        let svc = Service::new(
            "split",
            service_config(),
            ServiceTargets::Servers(vec![]),
            Capabilities::empty(),
        );
        assert!(!svc.at_connection_limit());
        svc.session_started();
        svc.session_started();
        assert!(svc.at_connection_limit());
        svc.session_ended();
        assert!(!svc.at_connection_limit());
    }

    #[test]
    fn test_targets_resolution() {
        let registry = Registry::new();
        let s1 = Server::new("db1", Endpoint::tcp("10.0.0.1", 3306));
        registry.add_server(s1.clone());

        let svc = Service::new(
            "split",
            service_config(),
            ServiceTargets::Servers(vec![s1.clone()]),
            Capabilities::empty(),
        );
        assert_eq!(svc.servers(&registry).len(), 1);

        // Cluster-backed service reads the monitor's member set
        svc.set_targets(ServiceTargets::Cluster("repl".to_string()));
        assert!(svc.servers(&registry).is_empty());
        registry.set_monitor_servers("repl", vec![s1]);
        assert_eq!(svc.servers(&registry).len(), 1);
    }

    #[test]
    fn test_capability_union() {
        let svc = Service::new(
            "split",
            service_config(),
            ServiceTargets::Servers(vec![]),
            Capabilities::TRANSACTION_TRACKING,
        );
        let def = FilterDef {
            name: "log".to_string(),
            module: "qlafilter".to_string(),
            parameters: Default::default(),
        };
        let filter = crate::filter::build_filter(&def).unwrap();
        svc.set_filters(vec![(def, filter)]);

        let caps = svc.capabilities();
        assert!(caps.contains(Capabilities::TRANSACTION_TRACKING));
        assert!(caps.contains(Capabilities::CONTIGUOUS_INPUT));
    }
}
