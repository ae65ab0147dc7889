mod schema;

pub use schema::*;

use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [proxy]
            persistdir = "/tmp/bifrost.d"

            [servers.db1]
            host = "10.0.0.1"
            port = 3306
            rank = 1

            [servers.db2]
            host = "10.0.0.2"

            [services.split]
            router = "readwritesplit"
            user = "proxy"
            password = "secret"
            cluster = "repl"
            slave_selection_criteria = "LEAST_CURRENT_OPERATIONS"
            causal_reads = true
            transaction_replay = true

            [listeners.split-listener]
            service = "split"
            port = 4006

            [monitors.repl]
            user = "monitor"
            password = "secret"
            servers = ["db1", "db2"]
            auto_failover = true
            failcount = 3
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers["db2"].port, 3306);
        assert_eq!(config.servers["db1"].rank, 1);

        let svc = &config.services["split"];
        assert_eq!(svc.router, "readwritesplit");
        assert_eq!(svc.cluster.as_deref(), Some("repl"));
        assert!(svc.causal_reads);
        assert!(svc.transaction_replay);
        assert_eq!(
            svc.slave_selection_criteria,
            SlaveSelectionCriteria::LeastCurrentOperations
        );

        let mon = &config.monitors["repl"];
        assert_eq!(mon.module, "mariadbmon");
        assert_eq!(mon.failcount, 3);
        assert!(mon.auto_failover);
        assert!(mon.assume_unique_hostnames);
    }

    #[test]
    fn test_empty_config_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.servers.is_empty());
        assert!(config.proxy.persistdir.contains("bifrost"));
    }
}
