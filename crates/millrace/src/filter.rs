//! Table filtering
//!
//! A [`TableFilter`] decides which `database.table` pairs flow to the
//! producer. Patterns use glob syntax (`*` matches any run of
//! characters, `?` exactly one), are compiled once to case-insensitive
//! anchored regexes, and match either the bare table name or the
//! qualified `database.table` form. Exclude patterns win over include
//! patterns; an empty include list means "everything".

use regex::{Regex, RegexBuilder};
use thiserror::Error;

/// Error type for pattern operations.
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("invalid pattern: {0}")]
    InvalidRegex(#[from] regex::Error),
    #[error("empty pattern")]
    EmptyPattern,
}

/// A compiled pattern matcher.
///
/// Pre-compiles the glob to a regex so repeated matching never pays the
/// translation again.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    /// Original pattern string, for display and database prefiltering
    pattern: String,
    /// Compiled case-insensitive, anchored regex
    regex: Regex,
    /// Pattern is `*`: matches everything
    is_wildcard: bool,
}

impl PatternMatcher {
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::EmptyPattern);
        }
        let is_wildcard = pattern == "*";
        let regex = RegexBuilder::new(&glob_to_regex(pattern))
            .case_insensitive(true)
            .build()?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            is_wildcard,
        })
    }

    #[inline]
    pub fn matches(&self, text: &str) -> bool {
        if self.is_wildcard {
            return true;
        }
        self.regex.is_match(text)
    }

    /// Match a qualified name: the full `database.table` form first,
    /// then the bare table name so unqualified patterns apply in any
    /// database.
    pub fn matches_qualified(&self, database: &str, table: &str) -> bool {
        if self.is_wildcard {
            return true;
        }
        let qualified = format!("{database}.{table}");
        self.regex.is_match(&qualified) || self.regex.is_match(table)
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

/// Convert a glob pattern to an anchored regex: escapes regex
/// metacharacters, then `*` becomes `.*` and `?` becomes `.`.
fn glob_to_regex(pattern: &str) -> String {
    let escaped = regex::escape(pattern);
    let translated = escaped.replace(r"\*", ".*").replace(r"\?", ".");
    format!("^{translated}$")
}

/// One-shot glob match (case-insensitive). Compiles per call; prefer
/// [`PatternMatcher`] for hot paths.
#[inline]
pub fn pattern_match(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') && !pattern.contains('?') {
        return pattern.eq_ignore_ascii_case(text);
    }
    if pattern == "*" {
        return true;
    }
    match PatternMatcher::new(pattern) {
        Ok(matcher) => matcher.matches(text),
        Err(_) => false,
    }
}

/// Include/exclude filter over qualified table names.
#[derive(Debug, Clone, Default)]
pub struct TableFilter {
    include: Vec<PatternMatcher>,
    exclude: Vec<PatternMatcher>,
}

impl TableFilter {
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Result<Self, PatternError> {
        let include = include
            .iter()
            .map(|p| PatternMatcher::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        let exclude = exclude
            .iter()
            .map(|p| PatternMatcher::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { include, exclude })
    }

    /// Parse a CLI filter expression: comma-separated patterns, each
    /// optionally prefixed with `!` for exclusion.
    ///
    /// `shop.*, !shop.audit_*` includes everything under `shop` except
    /// audit tables.
    pub fn parse(expr: &str) -> Result<Self, PatternError> {
        let mut include = Vec::new();
        let mut exclude = Vec::new();
        for raw in expr.split(',') {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            match raw.strip_prefix('!') {
                Some(negated) => exclude.push(PatternMatcher::new(negated.trim())?),
                None => include.push(PatternMatcher::new(raw)?),
            }
        }
        Ok(Self { include, exclude })
    }

    pub fn matches(&self, database: &str, table: &str) -> bool {
        if self
            .exclude
            .iter()
            .any(|m| m.matches_qualified(database, table))
        {
            return false;
        }
        if self.include.is_empty() {
            return true;
        }
        self.include
            .iter()
            .any(|m| m.matches_qualified(database, table))
    }

    /// Whether any table under the database can match; used to skip DDL
    /// for fully excluded databases.
    pub fn matches_database(&self, database: &str) -> bool {
        if self.include.is_empty() {
            return true;
        }
        self.include.iter().any(|m| {
            match m.pattern().split_once('.') {
                Some((db_part, _)) => pattern_match(db_part, database),
                // table-only patterns can match in any database
                None => true,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matcher_compiles_globs() {
        let matcher = PatternMatcher::new("shop.audit_*").unwrap();
        assert!(matcher.matches("shop.audit_log"));
        assert!(matcher.matches("SHOP.AUDIT_LOG"));
        assert!(!matcher.matches("shop.users"));

        let matcher = PatternMatcher::new("user?").unwrap();
        assert!(matcher.matches("users"));
        assert!(!matcher.matches("user"));
        assert!(!matcher.matches("username"));
    }

    #[test]
    fn matcher_escapes_regex_metacharacters() {
        // the dot separates database and table; it must stay literal
        let matcher = PatternMatcher::new("shop.users").unwrap();
        assert!(matcher.matches("shop.users"));
        assert!(!matcher.matches("shopxusers"));

        let matcher = PatternMatcher::new("t[1]").unwrap();
        assert!(matcher.matches("t[1]"));
        assert!(!matcher.matches("t1"));
    }

    #[test]
    fn matcher_qualified_names() {
        let matcher = PatternMatcher::new("shop.*").unwrap();
        assert!(matcher.matches_qualified("shop", "users"));
        assert!(!matcher.matches_qualified("warehouse", "users"));

        // bare pattern matches the table in any database
        let matcher = PatternMatcher::new("users").unwrap();
        assert!(matcher.matches_qualified("shop", "users"));
        assert!(matcher.matches_qualified("warehouse", "users"));
    }

    #[test]
    fn matcher_rejects_empty() {
        assert!(matches!(
            PatternMatcher::new(""),
            Err(PatternError::EmptyPattern)
        ));
    }

    #[test]
    fn one_shot_pattern_match() {
        assert!(pattern_match("*", "anything"));
        assert!(pattern_match("shop.*", "shop.users"));
        assert!(pattern_match("SHOP.USERS", "shop.users"));
        assert!(!pattern_match("shop.audit_*", "shop.users"));
    }

    #[test]
    fn empty_filter_matches_all() {
        let filter = TableFilter::default();
        assert!(filter.matches("shop", "users"));
        assert!(filter.matches_database("anything"));
    }

    #[test]
    fn exclude_wins() {
        let filter = TableFilter::parse("shop.*, !shop.audit_*").unwrap();
        assert!(filter.matches("shop", "users"));
        assert!(!filter.matches("shop", "audit_log"));
        assert!(!filter.matches("warehouse", "pallets"));
    }

    #[test]
    fn bare_table_patterns() {
        let filter = TableFilter::parse("users").unwrap();
        assert!(filter.matches("shop", "users"));
        assert!(filter.matches("warehouse", "users"));
        assert!(!filter.matches("shop", "orders"));
    }

    #[test]
    fn database_prefilter() {
        let filter = TableFilter::parse("shop.*").unwrap();
        assert!(filter.matches_database("shop"));
        assert!(!filter.matches_database("warehouse"));

        let filter = TableFilter::parse("users").unwrap();
        assert!(filter.matches_database("anything"));
    }

    #[test]
    fn explicit_lists() {
        let filter = TableFilter::new(
            vec!["shop.*".to_string()],
            vec!["*.tmp_*".to_string()],
        )
        .unwrap();
        assert!(filter.matches("shop", "users"));
        assert!(!filter.matches("shop", "tmp_load"));
    }
}
