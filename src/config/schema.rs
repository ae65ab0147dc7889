use std::collections::HashMap;

use serde::Deserialize;

/// Bootstrap configuration: the object graph at startup.
///
/// Runtime changes arrive through the JSON plane and are persisted
/// separately under `persistdir`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
    #[serde(default)]
    pub listeners: HashMap<String, ListenerConfig>,
    #[serde(default)]
    pub monitors: HashMap<String, MonitorConfig>,
    #[serde(default)]
    pub filters: HashMap<String, FilterConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Directory for runtime-created object persistence
    #[serde(default = "default_persistdir")]
    pub persistdir: String,
    /// Version string advertised to clients
    #[serde(default = "default_version_string")]
    pub version_string: String,
}

fn default_persistdir() -> String {
    "/var/lib/bifrost/bifrost.cnf.d".to_string()
}

fn default_version_string() -> String {
    "10.6.11-MariaDB-bifrost".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            persistdir: default_persistdir(),
            version_string: default_version_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    /// Unix socket path; mutually exclusive with host/port in practice,
    /// socket wins when both are present
    #[serde(default)]
    pub socket: Option<String>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_rank")]
    pub rank: i32,
    /// Deprecated, accepted and ignored
    #[serde(default)]
    pub weight: i32,
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_protocol() -> String {
    "mariadb".to_string()
}

fn default_rank() -> i32 {
    1
}

/// Slave selection criteria for the read/write-split router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlaveSelectionCriteria {
    LeastGlobalConnections,
    #[default]
    LeastCurrentOperations,
    LeastRouterConnections,
    LeastBehindMaster,
    Adaptive,
}

/// What happens to a session when the master goes away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MasterFailureMode {
    #[default]
    FailInstantly,
    FailOnWrite,
    ErrorOnWrite,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Router module: "readwritesplit" or "schemarouter"
    pub router: String,
    pub user: String,
    pub password: String,
    /// Explicit target servers; mutually exclusive with `cluster`
    #[serde(default)]
    pub servers: Vec<String>,
    /// Derive targets from this monitor; mutually exclusive with `servers`
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_retain_last_statements")]
    pub retain_last_statements: usize,
    #[serde(default = "default_max_slave_replication_lag")]
    pub max_slave_replication_lag: i64,
    #[serde(default)]
    pub slave_selection_criteria: SlaveSelectionCriteria,
    #[serde(default)]
    pub master_failure_mode: MasterFailureMode,
    #[serde(default)]
    pub causal_reads: bool,
    #[serde(default = "default_causal_reads_timeout")]
    pub causal_reads_timeout_s: u64,
    #[serde(default)]
    pub transaction_replay: bool,
    #[serde(default = "default_trx_max_size")]
    pub transaction_replay_max_size: u64,
    #[serde(default = "default_trx_max_attempts")]
    pub transaction_replay_attempts: u32,
    #[serde(default)]
    pub optimistic_trx: bool,
    #[serde(default)]
    pub delayed_retry: bool,
    #[serde(default = "default_delayed_retry_timeout")]
    pub delayed_retry_timeout_s: u64,
    #[serde(default = "default_max_retry_interval")]
    pub max_retry_interval_s: u64,
    #[serde(default)]
    pub disable_sescmd_history: bool,
    #[serde(default = "default_connection_keepalive")]
    pub connection_keepalive_s: u64,
    /// schemarouter: refresh interval for the shard map
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_s: u64,
    /// schemarouter: duplicate databases are fatal unless set
    #[serde(default)]
    pub ignore_duplicate_databases: bool,
    #[serde(default = "default_users_refresh_time")]
    pub users_refresh_time_s: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_io_timeout")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_io_timeout")]
    pub write_timeout_ms: u64,
}

fn default_max_connections() -> usize {
    0 // unlimited
}

fn default_retain_last_statements() -> usize {
    0
}

fn default_max_slave_replication_lag() -> i64 {
    -1 // unlimited
}

fn default_causal_reads_timeout() -> u64 {
    10
}

fn default_trx_max_size() -> u64 {
    1024 * 1024
}

fn default_trx_max_attempts() -> u32 {
    5
}

fn default_delayed_retry_timeout() -> u64 {
    10
}

fn default_max_retry_interval() -> u64 {
    3600
}

fn default_connection_keepalive() -> u64 {
    300
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_users_refresh_time() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    3000
}

fn default_io_timeout() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub service: String,
    #[serde(default = "default_listen_address")]
    pub address: String,
    #[serde(default)]
    pub port: u16,
    /// Unix socket path; used instead of address/port when set
    #[serde(default)]
    pub socket: Option<String>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_authenticator")]
    pub authenticator: String,
    /// Paths to TLS material; presence enables SSL advertisement
    #[serde(default)]
    pub ssl_cert: Option<String>,
    #[serde(default)]
    pub ssl_key: Option<String>,
    #[serde(default)]
    pub ssl_ca: Option<String>,
    #[serde(default = "default_max_auth_errors")]
    pub max_auth_errors_until_block: u32,
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_authenticator() -> String {
    "mariadbauth".to_string()
}

fn default_max_auth_errors() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_module")]
    pub module: String,
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_ms: u64,
    #[serde(default = "default_failcount")]
    pub failcount: u32,
    #[serde(default)]
    pub auto_failover: bool,
    #[serde(default)]
    pub auto_rejoin: bool,
    #[serde(default)]
    pub verify_master_failure: bool,
    #[serde(default = "default_master_failure_timeout")]
    pub master_failure_timeout_s: u64,
    #[serde(default = "default_failover_timeout")]
    pub failover_timeout_s: u64,
    #[serde(default = "default_switchover_timeout")]
    pub switchover_timeout_s: u64,
    #[serde(default)]
    pub excluded_servers: Vec<String>,
    #[serde(default)]
    pub promotion_sql_file: Option<String>,
    #[serde(default)]
    pub passive: bool,
    #[serde(default)]
    pub enforce_simple_topology: bool,
    #[serde(default)]
    pub ignore_external_masters: bool,
    #[serde(default = "default_assume_unique_hostnames")]
    pub assume_unique_hostnames: bool,
    #[serde(default)]
    pub cluster_operation_disable_timer_s: u64,
}

fn default_monitor_module() -> String {
    "mariadbmon".to_string()
}

fn default_monitor_interval() -> u64 {
    2000
}

fn default_failcount() -> u32 {
    5
}

fn default_master_failure_timeout() -> u64 {
    10
}

fn default_failover_timeout() -> u64 {
    90
}

fn default_switchover_timeout() -> u64 {
    90
}

fn default_assume_unique_hostnames() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    pub module: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}
