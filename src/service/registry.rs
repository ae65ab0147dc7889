//! Process-wide object registry.
//!
//! Constructed at startup and handed to components by reference; the
//! runtime config plane is the only writer after bootstrap and serializes
//! itself with its own lock.

use std::sync::Arc;

use dashmap::DashMap;

use super::{Listener, Service};
use crate::filter::FilterDef;
use crate::monitor::MonitorHandle;
use crate::server::Server;

#[derive(Default)]
pub struct Registry {
    servers: DashMap<String, Arc<Server>>,
    services: DashMap<String, Arc<Service>>,
    listeners: DashMap<String, Arc<Listener>>,
    filters: DashMap<String, FilterDef>,
    monitors: DashMap<String, Arc<MonitorHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // Servers

    pub fn add_server(&self, server: Arc<Server>) {
        self.servers.insert(server.name.clone(), server);
    }

    pub fn server(&self, name: &str) -> Option<Arc<Server>> {
        self.servers.get(name).map(|s| s.clone())
    }

    pub fn remove_server(&self, name: &str) -> Option<Arc<Server>> {
        self.servers.remove(name).map(|(_, s)| s)
    }

    pub fn servers(&self) -> Vec<Arc<Server>> {
        self.servers.iter().map(|s| s.clone()).collect()
    }

    /// Services holding an explicit reference to this server
    pub fn services_using_server(&self, name: &str) -> Vec<String> {
        self.services
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .servers(self)
                    .iter()
                    .any(|s| s.name == name)
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// The monitor watching this server, if any; a server may appear in at
    /// most one monitor
    pub fn monitor_of_server(&self, name: &str) -> Option<String> {
        self.monitors
            .iter()
            .find(|m| m.value().servers().iter().any(|s| s.name == name))
            .map(|m| m.key().clone())
    }

    // Services

    pub fn add_service(&self, service: Arc<Service>) {
        self.services.insert(service.name.clone(), service);
    }

    pub fn service(&self, name: &str) -> Option<Arc<Service>> {
        self.services.get(name).map(|s| s.clone())
    }

    pub fn remove_service(&self, name: &str) -> Option<Arc<Service>> {
        self.services.remove(name).map(|(_, s)| s)
    }

    pub fn services(&self) -> Vec<Arc<Service>> {
        self.services.iter().map(|s| s.clone()).collect()
    }

    // Listeners

    pub fn add_listener(&self, listener: Arc<Listener>) {
        self.listeners.insert(listener.name.clone(), listener);
    }

    pub fn listener(&self, name: &str) -> Option<Arc<Listener>> {
        self.listeners.get(name).map(|l| l.clone())
    }

    pub fn remove_listener(&self, name: &str) -> Option<Arc<Listener>> {
        self.listeners.remove(name).map(|(_, l)| l)
    }

    pub fn listeners(&self) -> Vec<Arc<Listener>> {
        self.listeners.iter().map(|l| l.clone()).collect()
    }

    pub fn listeners_for_service(&self, service: &str) -> Vec<String> {
        self.listeners
            .iter()
            .filter(|l| l.value().service.name == service)
            .map(|l| l.key().clone())
            .collect()
    }

    // Filters

    pub fn add_filter(&self, def: FilterDef) {
        self.filters.insert(def.name.clone(), def);
    }

    pub fn filter(&self, name: &str) -> Option<FilterDef> {
        self.filters.get(name).map(|f| f.clone())
    }

    pub fn remove_filter(&self, name: &str) -> Option<FilterDef> {
        self.filters.remove(name).map(|(_, f)| f)
    }

    /// Services whose filter chain references this filter
    pub fn services_using_filter(&self, name: &str) -> Vec<String> {
        self.services
            .iter()
            .filter(|s| s.value().filters().iter().any(|(def, _)| def.name == name))
            .map(|s| s.key().clone())
            .collect()
    }

    // Monitors

    pub fn add_monitor(&self, handle: Arc<MonitorHandle>) {
        self.monitors.insert(handle.name.clone(), handle);
    }

    pub fn monitor(&self, name: &str) -> Option<Arc<MonitorHandle>> {
        self.monitors.get(name).map(|m| m.clone())
    }

    pub fn remove_monitor(&self, name: &str) -> Option<Arc<MonitorHandle>> {
        self.monitors.remove(name).map(|(_, m)| m)
    }

    pub fn monitors(&self) -> Vec<Arc<MonitorHandle>> {
        self.monitors.iter().map(|m| m.clone()).collect()
    }

    /// Member servers of a monitor, for cluster-backed services
    pub fn monitor_servers(&self, name: &str) -> Vec<Arc<Server>> {
        self.monitors
            .get(name)
            .map(|m| m.servers())
            .unwrap_or_default()
    }

    /// Test/bootstrap helper: register a bare monitor handle with a fixed
    /// server set and no running loop.
    pub fn set_monitor_servers(&self, name: &str, servers: Vec<Arc<Server>>) {
        self.add_monitor(Arc::new(MonitorHandle::detached(name, servers)));
    }

    pub fn services_using_monitor(&self, name: &str) -> Vec<String> {
        self.services
            .iter()
            .filter(|s| {
                matches!(s.value().targets(), super::ServiceTargets::Cluster(ref m) if m == name)
            })
            .map(|s| s.key().clone())
            .collect()
    }
}
