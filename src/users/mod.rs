//! Authentication user cache.
//!
//! The service loads user/host/db grants from one of its backends into an
//! in-memory table and answers authentication lookups with MySQL wildcard
//! semantics (`%`/`_` host patterns, LIKE-on-db). Refreshes triggered by
//! failed authentication are throttled per `users_refresh_time`.

use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::backend::{BackendConnection, ConnectionError};

/// One grant row: (user, host, db, anydb, password)
#[derive(Debug, Clone)]
pub struct UserEntry {
    pub user: String,
    pub host: String,
    /// Database this grant covers; None with anydb covers everything
    pub db: Option<String>,
    pub anydb: bool,
    /// mysql.user password column: `*` + 40 hex chars, or empty
    pub password: String,
}

#[derive(Debug, Default)]
pub struct UserCache {
    users: RwLock<Vec<UserEntry>>,
    databases: RwLock<Vec<String>>,
    last_refresh: Mutex<Option<Instant>>,
    refresh_min_interval: Duration,
}

impl UserCache {
    pub fn new(users_refresh_time: Duration) -> Self {
        Self {
            users: RwLock::new(Vec::new()),
            databases: RwLock::new(Vec::new()),
            last_refresh: Mutex::new(None),
            refresh_min_interval: users_refresh_time,
        }
    }

    /// Find the grant matching (user, host, db).
    ///
    /// Lookup semantics mirror
    /// `WHERE user=? AND (?=host OR ? LIKE host)
    ///  AND (anydb=1 OR ? IN ('','information_schema') OR ? LIKE db) LIMIT 1`.
    pub fn match_user(&self, user: &str, host: &str, db: Option<&str>) -> Option<UserEntry> {
        let users = self.users.read();
        users
            .iter()
            .find(|e| {
                if e.user != user {
                    return false;
                }
                if !(e.host == host || like_match(&e.host, host)) {
                    return false;
                }
                match db {
                    None => true,
                    Some("") | Some("information_schema") => true,
                    Some(db) => {
                        e.anydb
                            || e.db
                                .as_deref()
                                .map(|pattern| pattern == db || like_match(pattern, db))
                                .unwrap_or(false)
                    }
                }
            })
            .cloned()
    }

    /// Whether a database is known to exist on the backends
    pub fn database_exists(&self, db: &str) -> bool {
        self.databases.read().iter().any(|d| d == db)
    }

    pub fn user_count(&self) -> usize {
        self.users.read().len()
    }

    /// Inject the service's own credentials as a fallback entry, so the
    /// monitor user can always connect through the proxy.
    pub fn inject_service_user(&self, user: &str, password_hash: &str) {
        let mut users = self.users.write();
        if users.iter().any(|e| e.user == user && e.host == "%") {
            return;
        }
        users.push(UserEntry {
            user: user.to_string(),
            host: "%".to_string(),
            db: None,
            anydb: true,
            password: password_hash.to_string(),
        });
    }

    /// Replace the cache contents (used by loads and tests)
    pub fn replace(&self, users: Vec<UserEntry>, databases: Vec<String>) {
        *self.users.write() = users;
        *self.databases.write() = databases;
        *self.last_refresh.lock() = Some(Instant::now());
    }

    /// Refresh throttle: returns true when enough time has passed since
    /// the last load, and reserves this slot.
    pub fn refresh_allowed(&self) -> bool {
        let mut last = self.last_refresh.lock();
        match *last {
            Some(at) if at.elapsed() < self.refresh_min_interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    /// Load grants from a backend into the cache.
    pub async fn load_from_backend(
        &self,
        conn: &mut BackendConnection,
    ) -> Result<usize, ConnectionError> {
        let mut entries: Vec<UserEntry> = Vec::new();

        // Global grants from mysql.user; a global SELECT means any db
        let user_rows = conn
            .query("SELECT user, host, password, select_priv FROM mysql.user")
            .await?;
        if let Some(err) = &user_rows.error {
            warn!(error = %err.error_message, "Failed to load mysql.user");
            return Err(ConnectionError::Query(err.error_message.clone()));
        }
        for row in 0..user_rows.rows.len() {
            let user = user_rows.value(row, "user").unwrap_or("").to_string();
            let host = user_rows.value(row, "host").unwrap_or("").to_string();
            let password = user_rows.value(row, "password").unwrap_or("").to_string();
            let anydb = user_rows
                .value(row, "select_priv")
                .map(|v| v.eq_ignore_ascii_case("Y"))
                .unwrap_or(false);
            entries.push(UserEntry {
                user,
                host,
                db: None,
                anydb,
                password,
            });
        }

        // Per-database grants; password joined from the global row
        for (table, query) in [
            ("mysql.db", "SELECT user, host, db FROM mysql.db"),
            (
                "mysql.tables_priv",
                "SELECT DISTINCT user, host, db FROM mysql.tables_priv",
            ),
        ] {
            let rows = match conn.query(query).await {
                Ok(rs) => rs,
                Err(e) => {
                    debug!(table, error = %e, "Skipping grant table");
                    continue;
                }
            };
            if rows.error.is_some() {
                continue;
            }
            for row in 0..rows.rows.len() {
                let user = rows.value(row, "user").unwrap_or("").to_string();
                let host = rows.value(row, "host").unwrap_or("").to_string();
                let db = rows.value(row, "db").unwrap_or("").to_string();
                let password = entries
                    .iter()
                    .find(|e| e.user == user && e.db.is_none())
                    .map(|e| e.password.clone())
                    .unwrap_or_default();
                entries.push(UserEntry {
                    user,
                    host,
                    db: Some(db),
                    anydb: false,
                    password,
                });
            }
        }

        let db_rows = conn.query("SHOW DATABASES").await?;
        let databases: Vec<String> = db_rows
            .rows
            .iter()
            .filter_map(|r| r.first().cloned().flatten())
            .collect();

        let count = entries.len();
        self.replace(entries, databases);
        info!(users = count, "User cache loaded");
        Ok(count)
    }
}

/// SQL LIKE with `%` (any run) and `_` (any single char)
pub fn like_match(pattern: &str, value: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let v: Vec<char> = value.chars().collect();
    like_match_at(&p, &v)
}

fn like_match_at(pattern: &[char], value: &[char]) -> bool {
    match pattern.first() {
        None => value.is_empty(),
        Some('%') => {
            // Try swallowing 0..=len chars
            (0..=value.len()).any(|skip| like_match_at(&pattern[1..], &value[skip..]))
        }
        Some('_') => !value.is_empty() && like_match_at(&pattern[1..], &value[1..]),
        Some(c) => value.first() == Some(c) && like_match_at(&pattern[1..], &value[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with(entries: Vec<UserEntry>) -> UserCache {
        let cache = UserCache::new(Duration::from_secs(30));
        cache.replace(entries, vec!["shop".to_string(), "crm".to_string()]);
        cache
    }

    fn entry(user: &str, host: &str, db: Option<&str>, anydb: bool) -> UserEntry {
        UserEntry {
            user: user.to_string(),
            host: host.to_string(),
            db: db.map(|s| s.to_string()),
            anydb,
            password: String::new(),
        }
    }

    #[test]
    fn test_like_match() {
        assert!(like_match("%", "anything"));
        assert!(like_match("10.0.0.%", "10.0.0.15"));
        assert!(!like_match("10.0.0.%", "10.0.1.15"));
        assert!(like_match("app_", "app1"));
        assert!(!like_match("app_", "app12"));
        assert!(like_match("a%c", "abc"));
        assert!(like_match("a%c", "ac"));
        assert!(!like_match("a%c", "ab"));
    }

    #[test]
    fn test_exact_host_match() {
        let cache = cache_with(vec![entry("app", "10.0.0.1", None, true)]);
        assert!(cache.match_user("app", "10.0.0.1", None).is_some());
        assert!(cache.match_user("app", "10.0.0.2", None).is_none());
        assert!(cache.match_user("other", "10.0.0.1", None).is_none());
    }

    #[test]
    fn test_wildcard_host() {
        let cache = cache_with(vec![entry("app", "10.0.%", None, true)]);
        assert!(cache.match_user("app", "10.0.0.1", None).is_some());
        assert!(cache.match_user("app", "10.1.0.1", None).is_none());
    }

    #[test]
    fn test_db_semantics() {
        let cache = cache_with(vec![entry("app", "%", Some("shop"), false)]);
        assert!(cache.match_user("app", "h", Some("shop")).is_some());
        assert!(cache.match_user("app", "h", Some("crm")).is_none());
        // Empty and information_schema always pass
        assert!(cache.match_user("app", "h", Some("")).is_some());
        assert!(cache.match_user("app", "h", Some("information_schema")).is_some());
        assert!(cache.match_user("app", "h", None).is_some());
    }

    #[test]
    fn test_anydb_overrides_db_check() {
        let cache = cache_with(vec![entry("admin", "%", None, true)]);
        assert!(cache.match_user("admin", "h", Some("whatever")).is_some());
    }

    #[test]
    fn test_db_like_pattern() {
        let cache = cache_with(vec![entry("app", "%", Some("shop%"), false)]);
        assert!(cache.match_user("app", "h", Some("shop_eu")).is_some());
        assert!(cache.match_user("app", "h", Some("crm")).is_none());
    }

    #[test]
    fn test_refresh_throttle() {
        let cache = UserCache::new(Duration::from_secs(3600));
        assert!(cache.refresh_allowed());
        // Second attempt inside the window is rejected
        assert!(!cache.refresh_allowed());
    }

    #[test]
    fn test_inject_service_user() {
        let cache = cache_with(vec![]);
        cache.inject_service_user("monitor", "*HASH");
        assert!(cache.match_user("monitor", "anywhere", None).is_some());
        // Injecting twice keeps one entry
        cache.inject_service_user("monitor", "*HASH");
        assert_eq!(cache.user_count(), 1);
    }

    #[test]
    fn test_database_exists() {
        let cache = cache_with(vec![]);
        assert!(cache.database_exists("shop"));
        assert!(!cache.database_exists("missing"));
    }
}
