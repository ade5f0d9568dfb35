//! In-memory mirror of the upstream catalog
//!
//! A [`Schema`] is a snapshot: an ordered set of databases, each an
//! ordered set of tables, each an ordered sequence of columns. Snapshots
//! are copy-on-write with structural sharing: `copy()` clones only the
//! two outer spines of `Arc`s, and a delta application replaces just the
//! nodes on the mutated path. Mutating a copy never observably changes
//! any predecessor snapshot.

use crate::schema::columndef::ColumnDef;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Whether database and table names compare case-sensitively. The
/// upstream reports this via `lower_case_table_names`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseSensitivity {
    Sensitive,
    Insensitive,
}

impl CaseSensitivity {
    pub fn names_equal(self, a: &str, b: &str) -> bool {
        match self {
            CaseSensitivity::Sensitive => a == b,
            CaseSensitivity::Insensitive => a.eq_ignore_ascii_case(b),
        }
    }
}

/// A tracked table: ordered columns plus the table charset. Column index
/// is the identity used to pair binlog row images with names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub database: String,
    pub name: String,
    pub charset: String,
    pub columns: Vec<ColumnDef>,
    /// Primary-key column names, in key order.
    #[serde(default)]
    pub pk_columns: Vec<String>,
}

impl Table {
    pub fn new(database: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            name: name.into(),
            charset: "utf8mb4".to_string(),
            columns: Vec::new(),
            pk_columns: Vec::new(),
        }
    }

    pub fn with_charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = charset.into();
        self
    }

    pub fn with_columns(mut self, columns: Vec<ColumnDef>) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_pk(mut self, pk_columns: Vec<String>) -> Self {
        self.pk_columns = pk_columns;
        self
    }

    /// Find a column and its ordinal by name (column names in MySQL are
    /// always case-insensitive).
    pub fn find_column(&self, name: &str) -> Option<(usize, &ColumnDef)> {
        self.columns
            .iter()
            .enumerate()
            .find(|(_, c)| c.name.eq_ignore_ascii_case(name))
    }

    /// Report every divergence from `other`.
    pub fn diff(&self, out: &mut Vec<String>, other: &Table, left: &str, right: &str) {
        let context = format!("{}.{}", self.database, self.name);
        if self.charset != other.charset {
            out.push(format!(
                "{context}: charset {} ({left}) vs {} ({right})",
                self.charset, other.charset
            ));
        }
        if self.columns.len() != other.columns.len() {
            out.push(format!(
                "{context}: {} columns ({left}) vs {} ({right})",
                self.columns.len(),
                other.columns.len()
            ));
        }
        for (ours, theirs) in self.columns.iter().zip(other.columns.iter()) {
            ours.diff(out, theirs, &context);
        }
        if self.pk_columns != other.pk_columns {
            out.push(format!(
                "{context}: primary key {:?} ({left}) vs {:?} ({right})",
                self.pk_columns, other.pk_columns
            ));
        }
    }
}

/// A tracked database: ordered tables plus the database default charset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Database {
    pub name: String,
    pub charset: String,
    tables: Vec<Arc<Table>>,
    case: CaseSensitivity,
}

impl Database {
    pub fn new(name: impl Into<String>, charset: impl Into<String>, case: CaseSensitivity) -> Self {
        Self {
            name: name.into(),
            charset: charset.into(),
            tables: Vec::new(),
            case,
        }
    }

    pub fn find_table(&self, name: &str) -> Option<&Table> {
        self.tables
            .iter()
            .find(|t| self.case.names_equal(&t.name, name))
            .map(|t| t.as_ref())
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.find_table(name).is_some()
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.iter().map(|t| t.as_ref())
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Append a table. The caller is responsible for the duplicate check
    /// (deltas do it so they can honor IF NOT EXISTS).
    pub(crate) fn push_table(&mut self, table: Table) {
        self.tables.push(Arc::new(table));
    }

    pub(crate) fn remove_table(&mut self, name: &str) -> bool {
        let case = self.case;
        let before = self.tables.len();
        self.tables.retain(|t| !case.names_equal(&t.name, name));
        self.tables.len() != before
    }

    /// Copy-on-write access to a table for targeted mutation.
    pub(crate) fn table_mut(&mut self, name: &str) -> Option<&mut Table> {
        let case = self.case;
        self.tables
            .iter_mut()
            .find(|t| case.names_equal(&t.name, name))
            .map(Arc::make_mut)
    }
}

/// A snapshot of the tracked catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    databases: Vec<Arc<Database>>,
    pub case: CaseSensitivity,
    /// Server default charset, inherited by new databases that do not
    /// name one.
    pub charset: String,
}

impl Schema {
    pub fn new(case: CaseSensitivity) -> Self {
        Self {
            databases: Vec::new(),
            case,
            charset: "utf8mb4".to_string(),
        }
    }

    /// Cheap snapshot copy: clones the database spine, shares all nodes.
    pub fn copy(&self) -> Schema {
        self.clone()
    }

    pub fn find_database(&self, name: &str) -> Option<&Database> {
        self.databases
            .iter()
            .find(|d| self.case.names_equal(&d.name, name))
            .map(|d| d.as_ref())
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.find_database(name).is_some()
    }

    pub fn find_table(&self, database: &str, table: &str) -> Option<&Table> {
        self.find_database(database)?.find_table(table)
    }

    pub fn databases(&self) -> impl Iterator<Item = &Database> {
        self.databases.iter().map(|d| d.as_ref())
    }

    pub fn database_count(&self) -> usize {
        self.databases.len()
    }

    pub(crate) fn push_database(&mut self, database: Database) {
        self.databases.push(Arc::new(database));
    }

    pub(crate) fn remove_database(&mut self, name: &str) -> bool {
        let case = self.case;
        let before = self.databases.len();
        self.databases.retain(|d| !case.names_equal(&d.name, name));
        self.databases.len() != before
    }

    /// Copy-on-write access to a database for targeted mutation.
    pub(crate) fn database_mut(&mut self, name: &str) -> Option<&mut Database> {
        let case = self.case;
        self.databases
            .iter_mut()
            .find(|d| case.names_equal(&d.name, name))
            .map(Arc::make_mut)
    }

    /// Walk two snapshots and report every divergence as a line tagged
    /// with `left`/`right`. Logging and assertions only.
    pub fn diff(&self, out: &mut Vec<String>, other: &Schema, left: &str, right: &str) {
        for db in self.databases() {
            match other.find_database(&db.name) {
                None => out.push(format!("database `{}` only in {left}", db.name)),
                Some(theirs) => {
                    if db.charset != theirs.charset {
                        out.push(format!(
                            "database `{}`: charset {} ({left}) vs {} ({right})",
                            db.name, db.charset, theirs.charset
                        ));
                    }
                    for table in db.tables() {
                        match theirs.find_table(&table.name) {
                            None => out.push(format!(
                                "table `{}`.`{}` only in {left}",
                                db.name, table.name
                            )),
                            Some(t) => table.diff(out, t, left, right),
                        }
                    }
                    for table in theirs.tables() {
                        if db.find_table(&table.name).is_none() {
                            out.push(format!(
                                "table `{}`.`{}` only in {right}",
                                db.name, table.name
                            ));
                        }
                    }
                }
            }
        }
        for db in other.databases() {
            if self.find_database(&db.name).is_none() {
                out.push(format!("database `{}` only in {right}", db.name));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::columndef::ColumnDef;

    fn sample() -> Schema {
        let mut schema = Schema::new(CaseSensitivity::Sensitive);
        let mut db = Database::new("shop", "utf8mb4", CaseSensitivity::Sensitive);
        db.push_table(
            Table::new("shop", "users")
                .with_columns(vec![ColumnDef::int("id"), ColumnDef::varchar("name", 32)])
                .with_pk(vec!["id".into()]),
        );
        schema.push_database(db);
        schema
    }

    #[test]
    fn lookup() {
        let schema = sample();
        assert!(schema.has_database("shop"));
        assert!(!schema.has_database("SHOP"));
        let table = schema.find_table("shop", "users").unwrap();
        assert_eq!(table.columns.len(), 2);
        let (idx, col) = table.find_column("NAME").unwrap();
        assert_eq!(idx, 1);
        assert_eq!(col.name, "name");
    }

    #[test]
    fn case_insensitive_lookup() {
        let mut schema = Schema::new(CaseSensitivity::Insensitive);
        schema.push_database(Database::new("Shop", "utf8mb4", CaseSensitivity::Insensitive));
        assert!(schema.has_database("shop"));
        assert!(schema.has_database("SHOP"));
    }

    #[test]
    fn copy_is_independent() {
        let original = sample();
        let mut copy = original.copy();

        let db = copy.database_mut("shop").unwrap();
        let table = db.table_mut("users").unwrap();
        table.columns.push(ColumnDef::int("age"));

        assert_eq!(copy.find_table("shop", "users").unwrap().columns.len(), 3);
        assert_eq!(
            original.find_table("shop", "users").unwrap().columns.len(),
            2,
            "mutating the copy must not change the predecessor"
        );
    }

    #[test]
    fn copy_shares_untouched_nodes() {
        let original = sample();
        let copy = original.copy();
        let a = original.databases.first().unwrap();
        let b = copy.databases.first().unwrap();
        assert!(Arc::ptr_eq(a, b));
    }

    #[test]
    fn diff_reports_missing_and_changed() {
        let left = sample();
        let mut right = left.copy();
        {
            let db = right.database_mut("shop").unwrap();
            let t = db.table_mut("users").unwrap();
            t.columns[1] = ColumnDef::varchar("name", 64);
            db.push_table(Table::new("shop", "orders"));
        }

        let mut out = Vec::new();
        left.diff(&mut out, &right, "tracked", "live");
        assert!(out.iter().any(|l| l.contains("only in live")));
        assert!(out.iter().any(|l| l.contains("varchar(64)")));
    }

    #[test]
    fn remove_database_and_table() {
        let mut schema = sample();
        {
            let db = schema.database_mut("shop").unwrap();
            assert!(db.remove_table("users"));
            assert!(!db.remove_table("users"));
        }
        assert!(schema.remove_database("shop"));
        assert_eq!(schema.database_count(), 0);
    }
}
