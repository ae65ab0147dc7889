//! Parser for the textual KILL pseudo-query.
//!
//! Grammar: `KILL [HARD|SOFT] [CONNECTION|QUERY] (<id> | USER <name>) [;]`
//! Missing optional tokens default to SOFT and CONNECTION.

/// What the KILL targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillTarget {
    Id(u64),
    User(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KillScope {
    #[default]
    Connection,
    Query,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KillStrength {
    Hard,
    #[default]
    Soft,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillQuery {
    pub target: KillTarget,
    pub scope: KillScope,
    pub strength: KillStrength,
}

impl KillQuery {
    /// Parse a KILL statement; None for anything malformed.
    pub fn parse(sql: &str) -> Option<Self> {
        let sql = sql.trim().trim_end_matches(';').trim();
        let mut tokens = sql.split_whitespace();

        if !tokens.next()?.eq_ignore_ascii_case("KILL") {
            return None;
        }

        let mut strength = KillStrength::default();
        let mut scope = KillScope::default();

        let mut token = tokens.next()?;

        if token.eq_ignore_ascii_case("HARD") {
            strength = KillStrength::Hard;
            token = tokens.next()?;
        } else if token.eq_ignore_ascii_case("SOFT") {
            strength = KillStrength::Soft;
            token = tokens.next()?;
        }

        if token.eq_ignore_ascii_case("CONNECTION") {
            scope = KillScope::Connection;
            token = tokens.next()?;
        } else if token.eq_ignore_ascii_case("QUERY") {
            scope = KillScope::Query;
            token = tokens.next()?;
        }

        let target = if token.eq_ignore_ascii_case("USER") {
            let name = tokens.next()?;
            if !is_bare_name(name) {
                return None;
            }
            KillTarget::User(name.to_string())
        } else {
            // Must be a positive 64-bit integer
            let id: u64 = token.parse().ok()?;
            KillTarget::Id(id)
        };

        // Trailing tokens make the statement malformed
        if tokens.next().is_some() {
            return None;
        }

        Some(Self {
            target,
            scope,
            strength,
        })
    }

    /// Fast check whether a COM_QUERY starts with the KILL keyword
    pub fn is_kill_query(sql: &str) -> bool {
        sql.trim_start()
            .split_whitespace()
            .next()
            .map(|t| t.eq_ignore_ascii_case("KILL"))
            .unwrap_or(false)
    }
}

fn is_bare_name(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kill_id_defaults() {
        let k = KillQuery::parse("KILL 42").unwrap();
        assert_eq!(k.target, KillTarget::Id(42));
        assert_eq!(k.scope, KillScope::Connection);
        assert_eq!(k.strength, KillStrength::Soft);
    }

    #[test]
    fn test_kill_full_form() {
        let k = KillQuery::parse("kill hard query 7;").unwrap();
        assert_eq!(k.target, KillTarget::Id(7));
        assert_eq!(k.scope, KillScope::Query);
        assert_eq!(k.strength, KillStrength::Hard);
    }

    #[test]
    fn test_kill_user() {
        let k = KillQuery::parse("KILL SOFT CONNECTION USER app_rw").unwrap();
        assert_eq!(k.target, KillTarget::User("app_rw".to_string()));
        assert_eq!(k.scope, KillScope::Connection);
        assert_eq!(k.strength, KillStrength::Soft);
    }

    #[test]
    fn test_kill_user_without_scope() {
        let k = KillQuery::parse("KILL USER maintenance").unwrap();
        assert_eq!(k.target, KillTarget::User("maintenance".to_string()));
    }

    #[test]
    fn test_kill_malformed() {
        assert!(KillQuery::parse("KILL").is_none());
        assert!(KillQuery::parse("KILL -1").is_none());
        assert!(KillQuery::parse("KILL abc").is_none());
        assert!(KillQuery::parse("KILL 18446744073709551616").is_none()); // > u64::MAX
        assert!(KillQuery::parse("KILL USER").is_none());
        assert!(KillQuery::parse("KILL USER bad name").is_none());
        assert!(KillQuery::parse("KILL 42 extra").is_none());
        assert!(KillQuery::parse("SELECT 1").is_none());
    }

    #[test]
    fn test_kill_roundtrip_uniqueness() {
        // Every valid form parses to exactly one normalized structure
        for (sql, expect) in [
            ("KILL 1", (KillTarget::Id(1), KillScope::Connection, KillStrength::Soft)),
            ("KILL QUERY 1", (KillTarget::Id(1), KillScope::Query, KillStrength::Soft)),
            ("KILL HARD 1", (KillTarget::Id(1), KillScope::Connection, KillStrength::Hard)),
        ] {
            let k = KillQuery::parse(sql).unwrap();
            assert_eq!((k.target, k.scope, k.strength), expect, "{}", sql);
        }
    }

    #[test]
    fn test_is_kill_query() {
        assert!(KillQuery::is_kill_query("  kill 42"));
        assert!(KillQuery::is_kill_query("KILL USER foo"));
        assert!(!KillQuery::is_kill_query("SELECT * FROM killers"));
        assert!(!KillQuery::is_kill_query(""));
    }
}
