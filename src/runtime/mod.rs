//! Runtime configuration plane.
//!
//! Create/alter/destroy of servers, services, listeners, monitors and
//! filters driven by JSON:API bodies. Every mutation runs under one global
//! lock, validates its body and relationships, applies atomically and
//! persists the object to `<persistdir>/<name>.cnf` (write to a temp file,
//! then rename). Errors accumulate per request and come back as a JSON:API
//! errors array.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{ListenerConfig, MonitorConfig, ServerConfig, ServiceConfig};
use crate::filter::{build_filter, FilterDef};
use crate::monitor::spawn_monitor;
use crate::router::capabilities_for;
use crate::server::{Endpoint, Server, ServerStatus};
use crate::service::{Listener, Registry, Service, ServiceTargets};

/// Parameters of a service that may change at runtime; everything else is
/// static and rejected on alter.
const SERVICE_MUTABLE: [&str; 12] = [
    "user",
    "password",
    "max_connections",
    "retain_last_statements",
    "max_slave_replication_lag",
    "causal_reads",
    "causal_reads_timeout_s",
    "transaction_replay",
    "delayed_retry",
    "connection_keepalive_s",
    "slave_selection_criteria",
    "master_failure_mode",
];

const SERVER_MUTABLE: [&str; 2] = ["rank", "weight"];

const MONITOR_MUTABLE: [&str; 8] = [
    "user",
    "password",
    "monitor_interval_ms",
    "failcount",
    "auto_failover",
    "auto_rejoin",
    "verify_master_failure",
    "passive",
];

pub struct RuntimeManager {
    registry: Arc<Registry>,
    persistdir: PathBuf,
    /// One lock across every runtime mutation
    lock: Mutex<()>,
}

type RuntimeResult = Result<Value, Value>;

fn errors_json(errors: Vec<String>) -> Value {
    json!({
        "errors": errors
            .into_iter()
            .map(|detail| json!({ "detail": detail }))
            .collect::<Vec<_>>()
    })
}

/// Object names: `[A-Za-z0-9_.-]+`, no `@@` prefix
fn validate_name(name: &str, errors: &mut Vec<String>) {
    if name.is_empty() {
        errors.push("Object name must not be empty".to_string());
        return;
    }
    if name.starts_with("@@") {
        errors.push(format!("Name '{}' uses the reserved '@@' prefix", name));
        return;
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
    {
        errors.push(format!(
            "Name '{}' contains characters outside [A-Za-z0-9_.-]",
            name
        ));
    }
}

/// Parsed and pre-validated JSON:API body
struct Body {
    id: String,
    parameters: Map<String, Value>,
    relationships: Map<String, Value>,
}

fn parse_body(body: &Value, errors: &mut Vec<String>) -> Option<Body> {
    let data = match body.get("data") {
        Some(d) if d.is_object() => d,
        _ => {
            errors.push("Request body lacks a 'data' object".to_string());
            return None;
        }
    };

    let id = match data.get("id").and_then(|v| v.as_str()) {
        Some(id) => id.to_string(),
        None => {
            errors.push("'data.id' must be a string".to_string());
            return None;
        }
    };
    validate_name(&id, errors);

    let parameters = match data.pointer("/attributes/parameters") {
        Some(Value::Object(map)) => map.clone(),
        Some(_) => {
            errors.push("'data.attributes.parameters' must be an object".to_string());
            return None;
        }
        None => Map::new(),
    };

    let relationships = match data.get("relationships") {
        Some(Value::Object(map)) => map.clone(),
        Some(_) => {
            errors.push("'data.relationships' must be an object".to_string());
            return None;
        }
        None => Map::new(),
    };

    if errors.is_empty() {
        Some(Body {
            id,
            parameters,
            relationships,
        })
    } else {
        None
    }
}

/// Names referenced under `relationships.<kind>.data[].id`
fn relationship_ids(relationships: &Map<String, Value>, kind: &str) -> Vec<String> {
    relationships
        .get(kind)
        .and_then(|r| r.get("data"))
        .and_then(|d| d.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.get("id").and_then(|v| v.as_str()).map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

impl RuntimeManager {
    pub fn new(registry: Arc<Registry>, persistdir: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            persistdir: persistdir.into(),
            lock: Mutex::new(()),
        }
    }

    /// Crash-safe persistence: write `<name>.cnf.tmp`, then rename
    fn persist(&self, name: &str, object_type: &str, parameters: &Map<String, Value>) -> Result<(), String> {
        std::fs::create_dir_all(&self.persistdir)
            .map_err(|e| format!("Cannot create persistdir: {}", e))?;

        let mut content = format!("[{}]\ntype={}\n", name, object_type);
        for (key, value) in parameters {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            content.push_str(&format!("{}={}\n", key, rendered));
        }

        let tmp = self.persistdir.join(format!("{}.cnf.tmp", name));
        let dst = self.persistdir.join(format!("{}.cnf", name));
        std::fs::write(&tmp, content).map_err(|e| format!("Cannot write {}: {}", tmp.display(), e))?;
        std::fs::rename(&tmp, &dst)
            .map_err(|e| format!("Cannot rename into place: {}", e))?;
        Ok(())
    }

    fn unpersist(&self, name: &str) {
        let path = self.persistdir.join(format!("{}.cnf", name));
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to remove persisted config");
            }
        }
    }

    // ---- servers ----

    pub async fn create_server(&self, body: &Value) -> RuntimeResult {
        let _guard = self.lock.lock().await;
        let mut errors = Vec::new();

        let Some(parsed) = parse_body(body, &mut errors) else {
            return Err(errors_json(errors));
        };
        if self.registry.server(&parsed.id).is_some() {
            errors.push(format!("Server '{}' already exists", parsed.id));
            return Err(errors_json(errors));
        }

        let config: ServerConfig =
            match serde_json::from_value(Value::Object(parsed.parameters.clone())) {
                Ok(c) => c,
                Err(e) => {
                    errors.push(format!("Invalid server parameters: {}", e));
                    return Err(errors_json(errors));
                }
            };

        let endpoint = match &config.socket {
            Some(socket) => Endpoint::Unix {
                socket: socket.clone(),
            },
            None => Endpoint::tcp(config.host.clone(), config.port),
        };
        let server = Server::new(parsed.id.clone(), endpoint);
        server.set_rank(config.rank);
        server.set_weight(config.weight);

        if let Err(e) = self.persist(&parsed.id, "server", &parsed.parameters) {
            return Err(errors_json(vec![e]));
        }
        self.registry.add_server(server);
        info!(server = %parsed.id, "Server created at runtime");
        Ok(json!({ "data": { "id": parsed.id, "type": "servers" } }))
    }

    pub async fn alter_server(&self, name: &str, body: &Value) -> RuntimeResult {
        let _guard = self.lock.lock().await;
        let mut errors = Vec::new();

        let Some(server) = self.registry.server(name) else {
            return Err(errors_json(vec![format!("Server '{}' does not exist", name)]));
        };
        let Some(parsed) = parse_body(body, &mut errors) else {
            return Err(errors_json(errors));
        };

        // Only whitelisted keys are runtime-mutable
        for key in parsed.parameters.keys() {
            if !SERVER_MUTABLE.contains(&key.as_str()) {
                errors.push(format!("Parameter '{}' cannot be changed at runtime", key));
            }
        }
        if !errors.is_empty() {
            return Err(errors_json(errors));
        }

        // Stage, then apply; nothing changed on validation failure
        let mut staged_rank = server.rank();
        let mut staged_weight = server.weight();
        for (key, value) in &parsed.parameters {
            match (key.as_str(), value.as_i64()) {
                ("rank", Some(v)) => staged_rank = v as i32,
                ("weight", Some(v)) => staged_weight = v as i32,
                (k, None) => errors.push(format!("Parameter '{}' must be an integer", k)),
                _ => {}
            }
        }
        if !errors.is_empty() {
            return Err(errors_json(errors));
        }

        server.set_rank(staged_rank);
        server.set_weight(staged_weight);
        if let Err(e) = self.persist(name, "server", &parsed.parameters) {
            return Err(errors_json(vec![e]));
        }
        Ok(json!({ "data": { "id": name, "type": "servers" } }))
    }

    pub async fn destroy_server(&self, name: &str) -> RuntimeResult {
        let _guard = self.lock.lock().await;
        let mut errors = Vec::new();

        let Some(server) = self.registry.server(name) else {
            return Err(errors_json(vec![format!("Server '{}' does not exist", name)]));
        };

        let users = self.registry.services_using_server(name);
        if !users.is_empty() {
            errors.push(format!(
                "Server '{}' is in use by services: {}",
                name,
                users.join(", ")
            ));
        }
        if let Some(monitor) = self.registry.monitor_of_server(name) {
            errors.push(format!(
                "Server '{}' is monitored by '{}'",
                name, monitor
            ));
        }
        if !errors.is_empty() {
            return Err(errors_json(errors));
        }

        // Deferred destruction: live backend sessions keep their Arc until
        // they close
        server.deactivate();
        self.registry.remove_server(name);
        self.unpersist(name);
        info!(server = %name, "Server destroyed at runtime");
        Ok(json!({ "data": null }))
    }

    /// Maintenance and draining are operator actions on the status bits
    pub async fn set_server_maintenance(&self, name: &str, on: bool) -> RuntimeResult {
        let _guard = self.lock.lock().await;
        let Some(server) = self.registry.server(name) else {
            return Err(errors_json(vec![format!("Server '{}' does not exist", name)]));
        };
        if on {
            server.add_status(ServerStatus::MAINTENANCE);
        } else {
            server.clear_status(ServerStatus::MAINTENANCE);
        }
        Ok(json!({ "data": { "id": name, "status": server.status().to_string() } }))
    }

    // ---- services ----

    pub async fn create_service(&self, body: &Value) -> RuntimeResult {
        let _guard = self.lock.lock().await;
        let mut errors = Vec::new();

        let Some(parsed) = parse_body(body, &mut errors) else {
            return Err(errors_json(errors));
        };
        if self.registry.service(&parsed.id).is_some() {
            return Err(errors_json(vec![format!(
                "Service '{}' already exists",
                parsed.id
            )]));
        }

        let config: ServiceConfig =
            match serde_json::from_value(Value::Object(parsed.parameters.clone())) {
                Ok(c) => c,
                Err(e) => {
                    errors.push(format!("Invalid service parameters: {}", e));
                    return Err(errors_json(errors));
                }
            };

        // Targets: an explicit server list or exactly one monitor, never
        // both
        let server_names = relationship_ids(&parsed.relationships, "servers");
        let cluster = config.cluster.clone();
        if !server_names.is_empty() && cluster.is_some() {
            errors.push(
                "A service takes either explicit servers or a cluster monitor, not both"
                    .to_string(),
            );
        }

        let mut servers = Vec::new();
        for name in &server_names {
            match self.registry.server(name) {
                Some(s) => servers.push(s),
                None => errors.push(format!("Related server '{}' does not exist", name)),
            }
        }
        if let Some(monitor) = &cluster {
            if self.registry.monitor(monitor).is_none() {
                errors.push(format!("Cluster monitor '{}' does not exist", monitor));
            }
        }
        if !errors.is_empty() {
            return Err(errors_json(errors));
        }

        let targets = match cluster {
            Some(monitor) => ServiceTargets::Cluster(monitor),
            None => ServiceTargets::Servers(servers),
        };
        let service = Service::new(
            parsed.id.clone(),
            config.clone(),
            targets,
            capabilities_for(&config.router),
        );

        if let Err(e) = self.persist(&parsed.id, "service", &parsed.parameters) {
            return Err(errors_json(vec![e]));
        }
        self.registry.add_service(service);
        info!(service = %parsed.id, router = %config.router, "Service created at runtime");
        Ok(json!({ "data": { "id": parsed.id, "type": "services" } }))
    }

    pub async fn alter_service(&self, name: &str, body: &Value) -> RuntimeResult {
        let _guard = self.lock.lock().await;
        let mut errors = Vec::new();

        let Some(service) = self.registry.service(name) else {
            return Err(errors_json(vec![format!("Service '{}' does not exist", name)]));
        };
        let Some(parsed) = parse_body(body, &mut errors) else {
            return Err(errors_json(errors));
        };

        for key in parsed.parameters.keys() {
            if !SERVICE_MUTABLE.contains(&key.as_str()) {
                errors.push(format!(
                    "Service parameter '{}' cannot be changed at runtime",
                    key
                ));
            }
        }
        if !errors.is_empty() {
            return Err(errors_json(errors));
        }

        // Build a staged copy from the current parameters plus the diff;
        // swap in only when the whole thing deserializes
        let current = service.params();
        let mut merged = match ServiceParamsShim::from(&current) {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for (key, value) in &parsed.parameters {
            merged.insert(key.clone(), value.clone());
        }
        let staged: ServiceConfig = match serde_json::from_value(Value::Object(merged)) {
            Ok(c) => c,
            Err(e) => {
                return Err(errors_json(vec![format!(
                    "Invalid service parameters: {}",
                    e
                )]))
            }
        };

        service.update_params(staged);
        if let Err(e) = self.persist(name, "service", &parsed.parameters) {
            return Err(errors_json(vec![e]));
        }
        Ok(json!({ "data": { "id": name, "type": "services" } }))
    }

    pub async fn destroy_service(&self, name: &str) -> RuntimeResult {
        let _guard = self.lock.lock().await;
        let mut errors = Vec::new();

        let Some(service) = self.registry.service(name) else {
            return Err(errors_json(vec![format!("Service '{}' does not exist", name)]));
        };

        let listeners = self.registry.listeners_for_service(name);
        if !listeners.is_empty() {
            errors.push(format!(
                "Service '{}' still has listeners: {}",
                name,
                listeners.join(", ")
            ));
        }
        if service.current_sessions() > 0 {
            errors.push(format!(
                "Service '{}' still has {} active sessions",
                name,
                service.current_sessions()
            ));
        }
        if service.has_filters() {
            errors.push(format!(
                "Service '{}' still has filters in its chain",
                name
            ));
        }
        if !errors.is_empty() {
            return Err(errors_json(errors));
        }

        service.deactivate();
        self.registry.remove_service(name);
        self.unpersist(name);
        info!(service = %name, "Service destroyed at runtime");
        Ok(json!({ "data": null }))
    }

    /// Replace a service's filter chain with named filter definitions
    pub async fn set_service_filters(&self, name: &str, filter_names: &[String]) -> RuntimeResult {
        let _guard = self.lock.lock().await;
        let mut errors = Vec::new();

        let Some(service) = self.registry.service(name) else {
            return Err(errors_json(vec![format!("Service '{}' does not exist", name)]));
        };

        let mut chain = Vec::new();
        for fname in filter_names {
            match self.registry.filter(fname) {
                Some(def) => match build_filter(&def) {
                    Ok(filter) => chain.push((def, filter)),
                    Err(e) => errors.push(e),
                },
                None => errors.push(format!("Filter '{}' does not exist", fname)),
            }
        }
        if !errors.is_empty() {
            return Err(errors_json(errors));
        }

        service.set_filters(chain);
        Ok(json!({ "data": { "id": name, "type": "services" } }))
    }

    // ---- listeners ----

    pub async fn create_listener(&self, body: &Value) -> RuntimeResult {
        let _guard = self.lock.lock().await;
        let mut errors = Vec::new();

        let Some(parsed) = parse_body(body, &mut errors) else {
            return Err(errors_json(errors));
        };
        if self.registry.listener(&parsed.id).is_some() {
            return Err(errors_json(vec![format!(
                "Listener '{}' already exists",
                parsed.id
            )]));
        }

        let config: ListenerConfig =
            match serde_json::from_value(Value::Object(parsed.parameters.clone())) {
                Ok(c) => c,
                Err(e) => {
                    errors.push(format!("Invalid listener parameters: {}", e));
                    return Err(errors_json(errors));
                }
            };

        let Some(service) = self.registry.service(&config.service) else {
            return Err(errors_json(vec![format!(
                "Service '{}' does not exist",
                config.service
            )]));
        };

        let listener = Listener::new(parsed.id.clone(), config, service);
        if let Err(e) = self.persist(&parsed.id, "listener", &parsed.parameters) {
            return Err(errors_json(vec![e]));
        }
        self.registry.add_listener(listener);
        info!(listener = %parsed.id, "Listener created at runtime");
        Ok(json!({ "data": { "id": parsed.id, "type": "listeners" } }))
    }

    pub async fn destroy_listener(&self, name: &str) -> RuntimeResult {
        let _guard = self.lock.lock().await;
        let Some(listener) = self.registry.listener(name) else {
            return Err(errors_json(vec![format!(
                "Listener '{}' does not exist",
                name
            )]));
        };

        listener.set_state(crate::service::ListenerState::Stopped);
        self.registry.remove_listener(name);
        self.unpersist(name);
        info!(listener = %name, "Listener destroyed at runtime");
        Ok(json!({ "data": null }))
    }

    // ---- monitors ----

    pub async fn create_monitor(&self, body: &Value) -> RuntimeResult {
        let _guard = self.lock.lock().await;
        let mut errors = Vec::new();

        let Some(parsed) = parse_body(body, &mut errors) else {
            return Err(errors_json(errors));
        };
        if self.registry.monitor(&parsed.id).is_some() {
            return Err(errors_json(vec![format!(
                "Monitor '{}' already exists",
                parsed.id
            )]));
        }

        let config: MonitorConfig =
            match serde_json::from_value(Value::Object(parsed.parameters.clone())) {
                Ok(c) => c,
                Err(e) => {
                    errors.push(format!("Invalid monitor parameters: {}", e));
                    return Err(errors_json(errors));
                }
            };

        let mut server_names = relationship_ids(&parsed.relationships, "servers");
        if server_names.is_empty() {
            server_names = config.servers.clone();
        }

        let mut servers = Vec::new();
        for sname in &server_names {
            match self.registry.server(sname) {
                Some(s) => {
                    // A server belongs to at most one monitor
                    if let Some(other) = self.registry.monitor_of_server(sname) {
                        errors.push(format!(
                            "Server '{}' is already monitored by '{}'",
                            sname, other
                        ));
                    } else {
                        servers.push(s);
                    }
                }
                None => errors.push(format!("Related server '{}' does not exist", sname)),
            }
        }
        if !errors.is_empty() {
            return Err(errors_json(errors));
        }

        let handle = spawn_monitor(parsed.id.clone(), config, servers);
        if let Err(e) = self.persist(&parsed.id, "monitor", &parsed.parameters) {
            handle.stop();
            return Err(errors_json(vec![e]));
        }
        self.registry.add_monitor(handle);
        info!(monitor = %parsed.id, "Monitor created at runtime");
        Ok(json!({ "data": { "id": parsed.id, "type": "monitors" } }))
    }

    pub async fn alter_monitor(&self, name: &str, body: &Value) -> RuntimeResult {
        let _guard = self.lock.lock().await;
        let mut errors = Vec::new();

        let Some(handle) = self.registry.monitor(name) else {
            return Err(errors_json(vec![format!(
                "Monitor '{}' does not exist",
                name
            )]));
        };
        let Some(parsed) = parse_body(body, &mut errors) else {
            return Err(errors_json(errors));
        };

        for key in parsed.parameters.keys() {
            if !MONITOR_MUTABLE.contains(&key.as_str()) {
                errors.push(format!(
                    "Monitor parameter '{}' cannot be changed at runtime",
                    key
                ));
            }
        }
        if !errors.is_empty() {
            return Err(errors_json(errors));
        }

        let current = handle.config();
        let mut merged = match MonitorParamsShim::from(&current) {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for (key, value) in &parsed.parameters {
            merged.insert(key.clone(), value.clone());
        }
        let staged: MonitorConfig = match serde_json::from_value(Value::Object(merged)) {
            Ok(c) => c,
            Err(e) => {
                return Err(errors_json(vec![format!(
                    "Invalid monitor parameters: {}",
                    e
                )]))
            }
        };

        handle.update_config(staged);
        if let Err(e) = self.persist(name, "monitor", &parsed.parameters) {
            return Err(errors_json(vec![e]));
        }
        Ok(json!({ "data": { "id": name, "type": "monitors" } }))
    }

    pub async fn destroy_monitor(&self, name: &str) -> RuntimeResult {
        let _guard = self.lock.lock().await;
        let mut errors = Vec::new();

        let Some(handle) = self.registry.monitor(name) else {
            return Err(errors_json(vec![format!(
                "Monitor '{}' does not exist",
                name
            )]));
        };

        let dependents = self.registry.services_using_monitor(name);
        if !dependents.is_empty() {
            errors.push(format!(
                "Monitor '{}' provides servers to services: {}",
                name,
                dependents.join(", ")
            ));
            return Err(errors_json(errors));
        }

        handle.stop();
        self.registry.remove_monitor(name);
        self.unpersist(name);
        info!(monitor = %name, "Monitor destroyed at runtime");
        Ok(json!({ "data": null }))
    }

    // ---- filters ----

    pub async fn create_filter(&self, body: &Value) -> RuntimeResult {
        let _guard = self.lock.lock().await;
        let mut errors = Vec::new();

        let Some(parsed) = parse_body(body, &mut errors) else {
            return Err(errors_json(errors));
        };
        if self.registry.filter(&parsed.id).is_some() {
            return Err(errors_json(vec![format!(
                "Filter '{}' already exists",
                parsed.id
            )]));
        }

        let module = match parsed
            .parameters
            .get("module")
            .and_then(|v| v.as_str())
        {
            Some(m) => m.to_string(),
            None => {
                errors.push("'module' is a mandatory filter parameter".to_string());
                return Err(errors_json(errors));
            }
        };

        let mut filter_params = std::collections::HashMap::new();
        for (key, value) in &parsed.parameters {
            if key == "module" {
                continue;
            }
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            filter_params.insert(key.clone(), rendered);
        }

        let def = FilterDef {
            name: parsed.id.clone(),
            module,
            parameters: filter_params,
        };
        // Instantiation must succeed before the definition is accepted
        if let Err(e) = build_filter(&def) {
            return Err(errors_json(vec![e]));
        }

        if let Err(e) = self.persist(&parsed.id, "filter", &parsed.parameters) {
            return Err(errors_json(vec![e]));
        }
        self.registry.add_filter(def);
        info!(filter = %parsed.id, "Filter created at runtime");
        Ok(json!({ "data": { "id": parsed.id, "type": "filters" } }))
    }

    pub async fn destroy_filter(&self, name: &str) -> RuntimeResult {
        let _guard = self.lock.lock().await;

        if self.registry.filter(name).is_none() {
            return Err(errors_json(vec![format!(
                "Filter '{}' does not exist",
                name
            )]));
        }
        let users = self.registry.services_using_filter(name);
        if !users.is_empty() {
            return Err(errors_json(vec![format!(
                "Filter '{}' is in use by services: {}",
                name,
                users.join(", ")
            )]));
        }

        self.registry.remove_filter(name);
        self.unpersist(name);
        info!(filter = %name, "Filter destroyed at runtime");
        Ok(json!({ "data": null }))
    }
}

/// Serialization shims: the config structs only derive Deserialize, so
/// alters rebuild the merged parameter map by hand.
struct ServiceParamsShim;

impl ServiceParamsShim {
    fn from(c: &ServiceConfig) -> Value {
        json!({
            "router": c.router,
            "user": c.user,
            "password": c.password,
            "cluster": c.cluster,
            "max_connections": c.max_connections,
            "retain_last_statements": c.retain_last_statements,
            "max_slave_replication_lag": c.max_slave_replication_lag,
            "causal_reads": c.causal_reads,
            "causal_reads_timeout_s": c.causal_reads_timeout_s,
            "transaction_replay": c.transaction_replay,
            "transaction_replay_max_size": c.transaction_replay_max_size,
            "transaction_replay_attempts": c.transaction_replay_attempts,
            "optimistic_trx": c.optimistic_trx,
            "delayed_retry": c.delayed_retry,
            "delayed_retry_timeout_s": c.delayed_retry_timeout_s,
            "max_retry_interval_s": c.max_retry_interval_s,
            "disable_sescmd_history": c.disable_sescmd_history,
            "connection_keepalive_s": c.connection_keepalive_s,
            "refresh_interval_s": c.refresh_interval_s,
            "ignore_duplicate_databases": c.ignore_duplicate_databases,
            "users_refresh_time_s": c.users_refresh_time_s,
            "connect_timeout_ms": c.connect_timeout_ms,
            "read_timeout_ms": c.read_timeout_ms,
            "write_timeout_ms": c.write_timeout_ms,
        })
    }
}

struct MonitorParamsShim;

impl MonitorParamsShim {
    fn from(c: &MonitorConfig) -> Value {
        json!({
            "module": c.module,
            "user": c.user,
            "password": c.password,
            "servers": c.servers,
            "monitor_interval_ms": c.monitor_interval_ms,
            "failcount": c.failcount,
            "auto_failover": c.auto_failover,
            "auto_rejoin": c.auto_rejoin,
            "verify_master_failure": c.verify_master_failure,
            "master_failure_timeout_s": c.master_failure_timeout_s,
            "failover_timeout_s": c.failover_timeout_s,
            "switchover_timeout_s": c.switchover_timeout_s,
            "excluded_servers": c.excluded_servers,
            "promotion_sql_file": c.promotion_sql_file,
            "passive": c.passive,
            "enforce_simple_topology": c.enforce_simple_topology,
            "ignore_external_masters": c.ignore_external_masters,
            "assume_unique_hostnames": c.assume_unique_hostnames,
            "cluster_operation_disable_timer_s": c.cluster_operation_disable_timer_s,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (RuntimeManager, Arc<Registry>, tempfile::TempDir) {
        let registry = Arc::new(Registry::new());
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = RuntimeManager::new(registry.clone(), dir.path());
        (manager, registry, dir)
    }

    fn server_body(name: &str) -> Value {
        json!({
            "data": {
                "id": name,
                "type": "servers",
                "attributes": {
                    "parameters": { "host": "10.0.0.1", "port": 3306 }
                }
            }
        })
    }

    #[tokio::test]
    async fn test_create_server_persists() {
        let (manager, registry, dir) = manager();
        manager.create_server(&server_body("db1")).await.unwrap();

        assert!(registry.server("db1").is_some());
        let persisted = dir.path().join("db1.cnf");
        let content = std::fs::read_to_string(persisted).unwrap();
        assert!(content.starts_with("[db1]\ntype=server\n"));
        assert!(content.contains("host=10.0.0.1"));
        // No stray temp file left behind
        assert!(!dir.path().join("db1.cnf.tmp").exists());
    }

    #[tokio::test]
    async fn test_create_server_duplicate_rejected() {
        let (manager, _, _dir) = manager();
        manager.create_server(&server_body("db1")).await.unwrap();
        let err = manager.create_server(&server_body("db1")).await.unwrap_err();
        let detail = err["errors"][0]["detail"].as_str().unwrap();
        assert!(detail.contains("already exists"));
    }

    #[tokio::test]
    async fn test_invalid_names_rejected() {
        let (manager, _, _dir) = manager();
        for bad in ["@@internal", "has space", "semi;colon", ""] {
            let err = manager.create_server(&server_body(bad)).await.unwrap_err();
            assert!(err["errors"].as_array().is_some(), "{} accepted", bad);
        }
    }

    #[tokio::test]
    async fn test_malformed_body_accumulates_errors() {
        let (manager, _, _dir) = manager();
        let err = manager.create_server(&json!({"nonsense": 1})).await.unwrap_err();
        assert!(err["errors"][0]["detail"]
            .as_str()
            .unwrap()
            .contains("'data'"));

        let err = manager
            .create_server(&json!({"data": {"attributes": {}}}))
            .await
            .unwrap_err();
        assert!(err["errors"][0]["detail"].as_str().unwrap().contains("data.id"));
    }

    #[tokio::test]
    async fn test_alter_server_whitelist() {
        let (manager, registry, _dir) = manager();
        manager.create_server(&server_body("db1")).await.unwrap();

        // rank is mutable
        let ok = manager
            .alter_server(
                "db1",
                &json!({"data": {"id": "db1", "attributes": {"parameters": {"rank": 2}}}}),
            )
            .await;
        assert!(ok.is_ok());
        assert_eq!(registry.server("db1").unwrap().rank(), 2);

        // host is static
        let err = manager
            .alter_server(
                "db1",
                &json!({"data": {"id": "db1", "attributes": {"parameters": {"host": "other"}}}}),
            )
            .await
            .unwrap_err();
        assert!(err["errors"][0]["detail"]
            .as_str()
            .unwrap()
            .contains("cannot be changed"));
    }

    #[tokio::test]
    async fn test_destroy_server_reference_checks() {
        let (manager, registry, _dir) = manager();
        manager.create_server(&server_body("db1")).await.unwrap();

        // Referenced by a service: refused
        let service_body = json!({
            "data": {
                "id": "split",
                "attributes": {
                    "parameters": {
                        "router": "readwritesplit",
                        "user": "u",
                        "password": "p"
                    }
                },
                "relationships": {
                    "servers": { "data": [ { "id": "db1", "type": "servers" } ] }
                }
            }
        });
        manager.create_service(&service_body).await.unwrap();
        let err = manager.destroy_server("db1").await.unwrap_err();
        assert!(err["errors"][0]["detail"].as_str().unwrap().contains("in use"));

        // Drop the service, then the server goes
        manager.destroy_service("split").await.unwrap();
        manager.destroy_server("db1").await.unwrap();
        assert!(registry.server("db1").is_none());
    }

    #[tokio::test]
    async fn test_destroy_unlinks_persisted_file(){
        let (manager, _, dir) = manager();
        manager.create_server(&server_body("db1")).await.unwrap();
        assert!(dir.path().join("db1.cnf").exists());
        manager.destroy_server("db1").await.unwrap();
        assert!(!dir.path().join("db1.cnf").exists());
    }

    #[tokio::test]
    async fn test_service_requires_existing_relationships() {
        let (manager, _, _dir) = manager();
        let body = json!({
            "data": {
                "id": "svc",
                "attributes": {
                    "parameters": {
                        "router": "readwritesplit",
                        "user": "u",
                        "password": "p"
                    }
                },
                "relationships": {
                    "servers": { "data": [ { "id": "ghost", "type": "servers" } ] }
                }
            }
        });
        let err = manager.create_service(&body).await.unwrap_err();
        assert!(err["errors"][0]["detail"]
            .as_str()
            .unwrap()
            .contains("'ghost' does not exist"));
    }

    #[tokio::test]
    async fn test_service_servers_xor_cluster() {
        let (manager, _, _dir) = manager();
        manager.create_server(&server_body("db1")).await.unwrap();
        let body = json!({
            "data": {
                "id": "svc",
                "attributes": {
                    "parameters": {
                        "router": "readwritesplit",
                        "user": "u",
                        "password": "p",
                        "cluster": "mon1"
                    }
                },
                "relationships": {
                    "servers": { "data": [ { "id": "db1", "type": "servers" } ] }
                }
            }
        });
        let err = manager.create_service(&body).await.unwrap_err();
        let details: Vec<&str> = err["errors"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["detail"].as_str().unwrap())
            .collect();
        assert!(details.iter().any(|d| d.contains("not both")));
    }

    #[tokio::test]
    async fn test_alter_service_static_keys_rejected() {
        let (manager, registry, _dir) = manager();
        manager.create_server(&server_body("db1")).await.unwrap();
        let body = json!({
            "data": {
                "id": "svc",
                "attributes": {
                    "parameters": {
                        "router": "readwritesplit",
                        "user": "u",
                        "password": "p"
                    }
                },
                "relationships": {
                    "servers": { "data": [ { "id": "db1", "type": "servers" } ] }
                }
            }
        });
        manager.create_service(&body).await.unwrap();

        let err = manager
            .alter_service(
                "svc",
                &json!({"data": {"id": "svc", "attributes": {"parameters": {"router": "schemarouter"}}}}),
            )
            .await
            .unwrap_err();
        assert!(err["errors"][0]["detail"]
            .as_str()
            .unwrap()
            .contains("cannot be changed"));

        let ok = manager
            .alter_service(
                "svc",
                &json!({"data": {"id": "svc", "attributes": {"parameters": {"max_connections": 50}}}}),
            )
            .await;
        assert!(ok.is_ok());
        assert_eq!(registry.service("svc").unwrap().params().max_connections, 50);
        // Untouched parameters survive the merge
        assert_eq!(registry.service("svc").unwrap().params().user, "u");
    }

    #[tokio::test]
    async fn test_monitor_single_ownership_of_servers() {
        let (manager, _, _dir) = manager();
        manager.create_server(&server_body("db1")).await.unwrap();

        let monitor_body = |name: &str| {
            json!({
                "data": {
                    "id": name,
                    "attributes": {
                        "parameters": { "user": "mon", "password": "p", "servers": ["db1"] }
                    }
                }
            })
        };

        manager.create_monitor(&monitor_body("m1")).await.unwrap();
        let err = manager.create_monitor(&monitor_body("m2")).await.unwrap_err();
        assert!(err["errors"][0]["detail"]
            .as_str()
            .unwrap()
            .contains("already monitored"));
    }

    #[tokio::test]
    async fn test_filter_lifecycle() {
        let (manager, registry, _dir) = manager();
        let body = json!({
            "data": {
                "id": "logall",
                "attributes": { "parameters": { "module": "qlafilter" } }
            }
        });
        manager.create_filter(&body).await.unwrap();
        assert!(registry.filter("logall").is_some());

        // Unknown modules never get registered
        let bad = json!({
            "data": {
                "id": "nope",
                "attributes": { "parameters": { "module": "does_not_exist" } }
            }
        });
        assert!(manager.create_filter(&bad).await.is_err());
        assert!(registry.filter("nope").is_none());

        manager.destroy_filter("logall").await.unwrap();
        assert!(registry.filter("logall").is_none());
    }
}
