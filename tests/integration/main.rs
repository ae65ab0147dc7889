//! Integration test entry point.
//!
//! These tests drive a real MySQL/MariaDB backend through an in-process
//! proxy. Run with: BIFROST_RUN_INTEGRATION_TESTS=1 cargo test --test integration

mod proxy;
mod rw_split;
mod transaction;

use std::env;

/// Check if integration tests should run
pub fn should_run_integration_tests() -> bool {
    env::var("BIFROST_RUN_INTEGRATION_TESTS")
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// Get MySQL connection config from environment
pub fn get_mysql_config() -> MysqlTestConfig {
    MysqlTestConfig {
        host: env::var("BIFROST_TEST_MYSQL_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: env::var("BIFROST_TEST_MYSQL_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3306),
        user: env::var("BIFROST_TEST_MYSQL_USER").unwrap_or_else(|_| "root".to_string()),
        password: env::var("BIFROST_TEST_MYSQL_PASS").unwrap_or_default(),
        database: env::var("BIFROST_TEST_MYSQL_DB").unwrap_or_else(|_| "test".to_string()),
    }
}

/// MySQL test configuration
#[derive(Debug, Clone)]
pub struct MysqlTestConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl MysqlTestConfig {
    /// Connection URL for the mysql client crate, pointed at the proxy
    pub fn proxy_url(&self, proxy_port: u16) -> String {
        format!(
            "mysql://{}:{}@127.0.0.1:{}/{}",
            self.user, self.password, proxy_port, self.database
        )
    }
}
