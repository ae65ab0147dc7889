//! Query classification for routing decisions.
//!
//! Wraps the SQL parser behind the narrow contract the routers need: a
//! command byte, a statement type mask, referenced tables, the sql_mode
//! after execution and the prepared-statement id. Classification results
//! are cached per (statement, sql_mode) with bounded FIFO eviction.

use std::collections::{HashMap, VecDeque};

use bitflags::bitflags;
use bytes::Bytes;
use parking_lot::Mutex;
use sqlparser::ast::{SetExpr, Statement, TableFactor, TableWithJoins};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use tracing::trace;

use crate::protocol::ClientCommand;

bitflags! {
    /// Statement type mask driving the routing decision table
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TypeMask: u32 {
        const READ = 1;
        const WRITE = 1 << 1;
        const SESSION_WRITE = 1 << 2;
        const USERVAR_READ = 1 << 3;
        const USERVAR_WRITE = 1 << 4;
        const SYSVAR_READ = 1 << 5;
        const SYSVAR_WRITE = 1 << 6;
        const GSYSVAR_READ = 1 << 7;
        const GSYSVAR_WRITE = 1 << 8;
        const BEGIN_TRX = 1 << 9;
        const COMMIT = 1 << 10;
        const ROLLBACK = 1 << 11;
        const ENABLE_AUTOCOMMIT = 1 << 12;
        const DISABLE_AUTOCOMMIT = 1 << 13;
        const READ_TMP_TABLE = 1 << 14;
        const CREATE_TMP_TABLE = 1 << 15;
        const PREPARE_NAMED_STMT = 1 << 16;
        const PREPARE_STMT = 1 << 17;
        const EXEC_STMT = 1 << 18;
        const DEALLOC_STMT = 1 << 19;
    }
}

impl TypeMask {
    /// Masks that force the statement to the master
    pub fn is_master_only(&self) -> bool {
        self.intersects(
            TypeMask::WRITE
                | TypeMask::SYSVAR_WRITE
                | TypeMask::GSYSVAR_WRITE
                | TypeMask::CREATE_TMP_TABLE
                | TypeMask::PREPARE_NAMED_STMT,
        )
    }

    /// Masks applied to every backend the session uses
    pub fn is_session_command(&self) -> bool {
        !self.is_master_only()
            && self.intersects(
                TypeMask::SESSION_WRITE
                    | TypeMask::USERVAR_WRITE
                    | TypeMask::ENABLE_AUTOCOMMIT
                    | TypeMask::DISABLE_AUTOCOMMIT,
            )
    }

    pub fn is_read_only(&self) -> bool {
        !self.intersects(
            TypeMask::WRITE
                | TypeMask::SESSION_WRITE
                | TypeMask::USERVAR_WRITE
                | TypeMask::SYSVAR_WRITE
                | TypeMask::GSYSVAR_WRITE
                | TypeMask::CREATE_TMP_TABLE,
        )
    }
}

/// Result of classifying one client packet
#[derive(Debug, Clone, Default)]
pub struct Classification {
    pub command: u8,
    pub type_mask: TypeMask,
    /// Referenced tables, qualified names kept as `db.table`
    pub tables: Vec<String>,
    /// New sql_mode when the statement is `SET sql_mode = ...`
    pub sql_mode_after: Option<String>,
    /// Prepared-statement id for COM_STMT_EXECUTE and friends
    pub statement_id: Option<u32>,
    /// BEGIN declared READ ONLY
    pub read_only_trx: bool,
}

/// Classifier with a bounded per-session result cache
pub struct Classifier {
    dialect: MySqlDialect,
    cache: Mutex<ClassifyCache>,
    /// Disabled when a masking filter treats string arguments as fields
    cache_enabled: bool,
}

struct ClassifyCache {
    entries: HashMap<(String, String), Classification>,
    order: VecDeque<(String, String)>,
    capacity: usize,
}

impl ClassifyCache {
    fn get(&self, key: &(String, String)) -> Option<Classification> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: (String, String), value: Classification) {
        if self.entries.len() >= self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.entries.remove(&old);
            }
        }
        if self.entries.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
        }
    }
}

const DEFAULT_CACHE_CAPACITY: usize = 1024;

impl Default for Classifier {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Classifier {
    pub fn new(cache_enabled: bool) -> Self {
        Self {
            dialect: MySqlDialect {},
            cache: Mutex::new(ClassifyCache {
                entries: HashMap::new(),
                order: VecDeque::new(),
                capacity: DEFAULT_CACHE_CAPACITY,
            }),
            cache_enabled,
        }
    }

    /// Classify a client packet payload under the current sql_mode.
    pub fn classify(&self, payload: &Bytes, sql_mode: &str) -> Classification {
        let Some(&command) = payload.first() else {
            return Classification::default();
        };

        let parsed = ClientCommand::parse(payload);
        match parsed {
            ClientCommand::Query(ref sql) => {
                if self.cache_enabled {
                    let key = (sql.clone(), sql_mode.to_string());
                    if let Some(hit) = self.cache.lock().get(&key) {
                        trace!(sql = %sql, "Classification cache hit");
                        return hit;
                    }
                    let mut result = self.classify_sql(sql);
                    result.command = command;
                    self.cache.lock().insert(key, result.clone());
                    result
                } else {
                    let mut result = self.classify_sql(sql);
                    result.command = command;
                    result
                }
            }
            ClientCommand::InitDb(ref db) => Classification {
                command,
                type_mask: TypeMask::SESSION_WRITE,
                tables: vec![db.clone()],
                ..Default::default()
            },
            ClientCommand::ChangeUser { .. } | ClientCommand::SetOption(_) => Classification {
                command,
                type_mask: TypeMask::SESSION_WRITE,
                ..Default::default()
            },
            ClientCommand::StmtPrepare(_) => Classification {
                command,
                type_mask: TypeMask::PREPARE_STMT,
                ..Default::default()
            },
            ClientCommand::StmtExecute { statement_id }
            | ClientCommand::StmtBulkExecute { statement_id }
            | ClientCommand::StmtFetch { statement_id, .. } => Classification {
                command,
                type_mask: TypeMask::EXEC_STMT,
                statement_id: Some(statement_id),
                ..Default::default()
            },
            ClientCommand::StmtClose { statement_id } | ClientCommand::StmtReset { statement_id } => {
                Classification {
                    command,
                    type_mask: TypeMask::DEALLOC_STMT,
                    statement_id: Some(statement_id),
                    ..Default::default()
                }
            }
            ClientCommand::StmtSendLongData { statement_id } => Classification {
                command,
                statement_id: Some(statement_id),
                ..Default::default()
            },
            ClientCommand::Ping => Classification {
                command,
                type_mask: TypeMask::READ,
                ..Default::default()
            },
            _ => Classification {
                command,
                ..Default::default()
            },
        }
    }

    /// Classify a textual statement.
    ///
    /// Keyword dispatch determines the type mask (robust against syntax the
    /// parser rejects); the parser contributes the referenced tables.
    fn classify_sql(&self, sql: &str) -> Classification {
        let mut c = Classification::default();
        let trimmed = sql.trim();
        let upper = first_words_upper(trimmed, 4);
        let words: Vec<&str> = upper.split_whitespace().collect();
        let first = words.first().copied().unwrap_or("");

        match first {
            "SELECT" => {
                c.type_mask |= TypeMask::READ;
                if contains_keyword(trimmed, "FOR UPDATE")
                    || contains_keyword(trimmed, "LOCK IN SHARE MODE")
                {
                    c.type_mask |= TypeMask::WRITE;
                }
                if trimmed.contains("@@") {
                    if contains_keyword(trimmed, "@@global.") {
                        c.type_mask |= TypeMask::GSYSVAR_READ;
                    } else {
                        c.type_mask |= TypeMask::SYSVAR_READ;
                    }
                } else if has_user_variable(trimmed) {
                    c.type_mask |= TypeMask::USERVAR_READ;
                }
            }
            "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN" | "HANDLER" | "CHECKSUM" => {
                c.type_mask |= TypeMask::READ;
            }
            "INSERT" | "UPDATE" | "DELETE" | "REPLACE" | "TRUNCATE" | "LOAD" | "ALTER" | "DROP"
            | "RENAME" | "GRANT" | "REVOKE" | "CALL" | "OPTIMIZE" | "ANALYZE" | "FLUSH"
            | "LOCK" | "UNLOCK" | "XA" | "DO" => {
                c.type_mask |= TypeMask::WRITE;
            }
            "CREATE" => {
                if words.get(1) == Some(&"TEMPORARY") {
                    c.type_mask |= TypeMask::CREATE_TMP_TABLE | TypeMask::WRITE;
                } else {
                    c.type_mask |= TypeMask::WRITE;
                }
            }
            "BEGIN" | "START" => {
                c.type_mask |= TypeMask::BEGIN_TRX;
                if contains_keyword(trimmed, "READ ONLY") {
                    c.type_mask |= TypeMask::READ;
                    c.read_only_trx = true;
                } else if contains_keyword(trimmed, "READ WRITE") {
                    c.type_mask |= TypeMask::WRITE;
                }
            }
            "COMMIT" => c.type_mask |= TypeMask::COMMIT,
            "ROLLBACK" => c.type_mask |= TypeMask::ROLLBACK,
            "USE" => {
                c.type_mask |= TypeMask::SESSION_WRITE;
                if let Some(db) = trimmed.split_whitespace().nth(1) {
                    c.tables.push(db.trim_end_matches(';').trim_matches('`').to_string());
                }
            }
            "SET" => self.classify_set(trimmed, &mut c),
            "PREPARE" => c.type_mask |= TypeMask::PREPARE_NAMED_STMT,
            "EXECUTE" => c.type_mask |= TypeMask::EXEC_STMT,
            "DEALLOCATE" => c.type_mask |= TypeMask::DEALLOC_STMT,
            _ => {
                // Unrecognized statements go to the master
                c.type_mask |= TypeMask::WRITE;
            }
        }

        // Parser contributes table references; keyword result stands when
        // the statement does not parse
        if c.tables.is_empty() {
            match Parser::parse_sql(&self.dialect, trimmed) {
                Ok(statements) => {
                    if let Some(stmt) = statements.first() {
                        c.tables = extract_tables(stmt);
                    }
                }
                Err(e) => {
                    trace!(error = %e, "Statement not parseable, keyword classification stands");
                }
            }
        }

        c
    }

    fn classify_set(&self, sql: &str, c: &mut Classification) {
        let rest = sql[3..].trim_start();
        let rest_upper = first_words_upper(rest, 3);

        if rest.starts_with('@') && !rest.starts_with("@@") {
            c.type_mask |= TypeMask::USERVAR_WRITE | TypeMask::SESSION_WRITE;
            return;
        }

        if rest_upper.starts_with("GLOBAL") || rest.starts_with("@@global.") {
            c.type_mask |= TypeMask::GSYSVAR_WRITE;
            return;
        }

        if rest_upper.starts_with("AUTOCOMMIT")
            || rest.to_ascii_lowercase().starts_with("@@autocommit")
            || rest_upper.starts_with("SESSION AUTOCOMMIT")
        {
            let value = rest.split('=').nth(1).map(|v| v.trim()).unwrap_or("");
            let upper = value.to_ascii_uppercase();
            if upper.starts_with('0') || upper.starts_with("OFF") || upper.starts_with("FALSE") {
                c.type_mask |= TypeMask::DISABLE_AUTOCOMMIT | TypeMask::SESSION_WRITE;
            } else {
                c.type_mask |= TypeMask::ENABLE_AUTOCOMMIT | TypeMask::SESSION_WRITE;
            }
            return;
        }

        let lowered = rest.to_ascii_lowercase();
        if lowered.starts_with("sql_mode") || lowered.starts_with("session sql_mode")
            || lowered.starts_with("@@sql_mode") || lowered.starts_with("@@session.sql_mode")
        {
            c.type_mask |= TypeMask::SYSVAR_WRITE | TypeMask::SESSION_WRITE;
            if let Some(value) = rest.split('=').nth(1) {
                c.sql_mode_after = Some(
                    value
                        .trim()
                        .trim_end_matches(';')
                        .trim_matches(|ch| ch == '\'' || ch == '"')
                        .to_string(),
                );
            }
            return;
        }

        // Any other SET is a session-scoped variable write
        c.type_mask |= TypeMask::SYSVAR_WRITE | TypeMask::SESSION_WRITE;
    }
}

fn first_words_upper(s: &str, n: usize) -> String {
    s.split_whitespace()
        .take(n)
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase()
}

fn contains_keyword(sql: &str, keyword: &str) -> bool {
    sql.to_ascii_lowercase()
        .contains(&keyword.to_ascii_lowercase())
}

/// `@var` but not `@@sysvar`
fn has_user_variable(sql: &str) -> bool {
    let bytes = sql.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'@' {
            let prev_at = i > 0 && bytes[i - 1] == b'@';
            let next_at = bytes.get(i + 1) == Some(&b'@');
            if !prev_at && !next_at {
                return true;
            }
        }
    }
    false
}

fn extract_tables(stmt: &Statement) -> Vec<String> {
    match stmt {
        Statement::Query(query) => {
            let mut tables = vec![];
            if let SetExpr::Select(select) = query.body.as_ref() {
                for twj in &select.from {
                    tables.extend(tables_from_joins(twj));
                }
            }
            tables
        }
        Statement::Insert { table_name, .. } => vec![table_name.to_string()],
        Statement::Update { table, .. } => tables_from_joins(table),
        Statement::Delete { from, .. } => {
            from.iter().flat_map(tables_from_joins).collect()
        }
        _ => vec![],
    }
}

fn tables_from_joins(table_with_joins: &TableWithJoins) -> Vec<String> {
    let mut tables = vec![];
    if let TableFactor::Table { name, .. } = &table_with_joins.relation {
        tables.push(name.to_string());
    }
    for join in &table_with_joins.joins {
        if let TableFactor::Table { name, .. } = &join.relation {
            tables.push(name.to_string());
        }
    }
    tables
}
