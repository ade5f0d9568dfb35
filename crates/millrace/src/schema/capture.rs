//! Upstream schema capture
//!
//! Builds a full [`Schema`] snapshot by introspecting the live upstream's
//! INFORMATION_SCHEMA. Used for the very first snapshot, for operator
//! driven recapture, and to re-introspect a single table when a decode
//! mismatch suggests the mirror has drifted.

use crate::error::{MillraceError, Result};
use crate::position::Position;
use crate::schema::columndef::{ColumnDef, ColumnType};
use crate::schema::ddl;
use crate::schema::model::{CaseSensitivity, Database, Schema, Table};
use mysql_async::prelude::Queryable;
use mysql_async::Conn;
use std::collections::HashMap;
use tracing::{debug, info};

/// System databases that are never tracked.
const SYSTEM_DATABASES: [&str; 4] = ["information_schema", "performance_schema", "mysql", "sys"];

const SCHEMATA_SQL: &str = "SELECT SCHEMA_NAME, DEFAULT_CHARACTER_SET_NAME \
     FROM INFORMATION_SCHEMA.SCHEMATA";

const COLUMNS_SQL: &str = "SELECT TABLE_SCHEMA, TABLE_NAME, COLUMN_NAME, COLUMN_TYPE, \
            CHARACTER_SET_NAME, DATETIME_PRECISION \
     FROM INFORMATION_SCHEMA.COLUMNS \
     ORDER BY TABLE_SCHEMA, TABLE_NAME, ORDINAL_POSITION";

const PK_SQL: &str = "SELECT TABLE_SCHEMA, TABLE_NAME, COLUMN_NAME \
     FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE \
     WHERE CONSTRAINT_NAME = 'PRIMARY' \
     ORDER BY TABLE_SCHEMA, TABLE_NAME, ORDINAL_POSITION";

/// Read `lower_case_table_names` to learn how the upstream compares
/// database and table names.
pub async fn case_sensitivity(conn: &mut Conn) -> Result<CaseSensitivity> {
    let mode: Option<u8> = conn
        .query_first("SELECT @@lower_case_table_names")
        .await
        .map_err(MillraceError::from_mysql)?;
    Ok(match mode.unwrap_or(0) {
        0 => CaseSensitivity::Sensitive,
        _ => CaseSensitivity::Insensitive,
    })
}

/// Capture the upstream's current binlog coordinate (tail of the binlog,
/// plus the executed GTID set when `gtid_mode` is requested).
pub async fn capture_position(conn: &mut Conn, gtid_mode: bool) -> Result<Position> {
    let row: Option<mysql_async::Row> = conn
        .query_first("SHOW MASTER STATUS")
        .await
        .map_err(MillraceError::from_mysql)?;
    let row = row.ok_or_else(|| {
        MillraceError::upstream("SHOW MASTER STATUS returned no row; is binlog enabled?")
    })?;

    let file: String = row
        .get(0)
        .ok_or_else(|| MillraceError::upstream("SHOW MASTER STATUS missing File"))?;
    let offset: u64 = row
        .get(1)
        .ok_or_else(|| MillraceError::upstream("SHOW MASTER STATUS missing Position"))?;

    let mut position = Position::new(file, offset);
    if gtid_mode {
        let gtid: Option<String> = row.get("Executed_Gtid_Set");
        match gtid {
            Some(set) if !set.is_empty() => position = position.with_gtid(set),
            _ => {
                return Err(MillraceError::config(
                    "gtid mode requested but upstream reports no executed GTID set",
                ))
            }
        }
    }
    Ok(position)
}

/// Capture a full snapshot of every non-system database.
pub async fn capture(conn: &mut Conn, case: CaseSensitivity) -> Result<Schema> {
    let schemata: Vec<(String, String)> = conn
        .query(SCHEMATA_SQL)
        .await
        .map_err(MillraceError::from_mysql)?;

    let columns: Vec<(String, String, String, String, Option<String>, Option<u32>)> = conn
        .query(COLUMNS_SQL)
        .await
        .map_err(MillraceError::from_mysql)?;

    let pks: Vec<(String, String, String)> =
        conn.query(PK_SQL).await.map_err(MillraceError::from_mysql)?;

    let mut schema = Schema::new(case);
    let mut databases: HashMap<String, Database> = HashMap::new();
    let mut db_order: Vec<String> = Vec::new();

    for (name, charset) in schemata {
        if is_system(&name) {
            continue;
        }
        databases.insert(name.clone(), Database::new(name.clone(), charset, case));
        db_order.push(name);
    }

    let mut pk_map: HashMap<(String, String), Vec<String>> = HashMap::new();
    for (db, table, column) in pks {
        pk_map.entry((db, table)).or_default().push(column);
    }

    // columns arrive ordered by (schema, table, ordinal); accumulate one
    // table at a time
    let mut current: Option<Table> = None;
    for (db, table, column, column_type, charset, dt_precision) in columns {
        if is_system(&db) {
            continue;
        }
        let switch = match &current {
            Some(t) => t.database != db || t.name != table,
            None => true,
        };
        if switch {
            if let Some(done) = current.take() {
                attach_table(&mut databases, done);
            }
            let db_charset = databases
                .get(&db)
                .map(|d| d.charset.clone())
                .unwrap_or_else(|| "utf8mb4".to_string());
            let pk = pk_map.remove(&(db.clone(), table.clone())).unwrap_or_default();
            current = Some(
                Table::new(db.clone(), table.clone())
                    .with_charset(db_charset)
                    .with_pk(pk),
            );
        }
        let def = column_from_information_schema(&column, &column_type, charset, dt_precision)?;
        if let Some(t) = current.as_mut() {
            t.columns.push(def);
        }
    }
    if let Some(done) = current.take() {
        attach_table(&mut databases, done);
    }

    for name in db_order {
        if let Some(db) = databases.remove(&name) {
            schema.push_database(db);
        }
    }

    info!(
        databases = schema.database_count(),
        "captured upstream schema"
    );
    Ok(schema)
}

/// Re-introspect a single table; `None` when it no longer exists.
pub async fn capture_table(
    conn: &mut Conn,
    database: &str,
    table: &str,
) -> Result<Option<Table>> {
    let columns: Vec<(String, String, Option<String>, Option<u32>)> = conn
        .exec(
            "SELECT COLUMN_NAME, COLUMN_TYPE, CHARACTER_SET_NAME, DATETIME_PRECISION \
             FROM INFORMATION_SCHEMA.COLUMNS \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
             ORDER BY ORDINAL_POSITION",
            (database, table),
        )
        .await
        .map_err(MillraceError::from_mysql)?;
    if columns.is_empty() {
        return Ok(None);
    }

    let pk: Vec<String> = conn
        .exec(
            "SELECT COLUMN_NAME FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE \
             WHERE CONSTRAINT_NAME = 'PRIMARY' AND TABLE_SCHEMA = ? AND TABLE_NAME = ? \
             ORDER BY ORDINAL_POSITION",
            (database, table),
        )
        .await
        .map_err(MillraceError::from_mysql)?;

    let mut out = Table::new(database, table).with_pk(pk);
    for (name, column_type, charset, dt_precision) in columns {
        out.columns
            .push(column_from_information_schema(&name, &column_type, charset, dt_precision)?);
    }
    debug!(%database, %table, columns = out.columns.len(), "re-introspected table");
    Ok(Some(out))
}

fn is_system(db: &str) -> bool {
    SYSTEM_DATABASES
        .iter()
        .any(|s| s.eq_ignore_ascii_case(db))
}

fn attach_table(databases: &mut HashMap<String, Database>, table: Table) {
    if let Some(db) = databases.get_mut(&table.database) {
        db.push_table(table);
    }
}

/// Build a [`ColumnDef`] from the `COLUMN_TYPE` rendering, patching in
/// the charset and fractional-second precision that the rendering omits.
fn column_from_information_schema(
    name: &str,
    column_type: &str,
    charset: Option<String>,
    dt_precision: Option<u32>,
) -> Result<ColumnDef> {
    let mut kind = ddl::parse_column_type(column_type).map_err(MillraceError::DdlParse)?;
    match &mut kind {
        ColumnType::String { charset: cs, .. } => {
            if let Some(actual) = charset {
                *cs = actual;
            }
        }
        ColumnType::Time { fsp }
        | ColumnType::DateTime { fsp }
        | ColumnType::Timestamp { fsp } => {
            if let Some(p) = dt_precision {
                *fsp = p.min(6) as u8;
            }
        }
        _ => {}
    }
    Ok(ColumnDef::new(name, kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_databases_are_skipped() {
        assert!(is_system("mysql"));
        assert!(is_system("INFORMATION_SCHEMA"));
        assert!(!is_system("shop"));
    }

    #[test]
    fn column_from_information_schema_rendering() {
        let col =
            column_from_information_schema("n", "int(11)", None, None).unwrap();
        assert!(matches!(
            col.kind,
            ColumnType::Int {
                bytes: 4,
                signed: true
            }
        ));

        let col =
            column_from_information_schema("n", "bigint(20) unsigned", None, None).unwrap();
        assert!(matches!(col.kind, ColumnType::BigInt { signed: false }));

        let col = column_from_information_schema(
            "s",
            "varchar(50)",
            Some("latin1".to_string()),
            None,
        )
        .unwrap();
        assert!(
            matches!(&col.kind, ColumnType::String { length: 50, charset } if charset == "latin1")
        );

        let col = column_from_information_schema("t", "datetime", None, Some(6)).unwrap();
        assert!(matches!(col.kind, ColumnType::DateTime { fsp: 6 }));

        let col =
            column_from_information_schema("e", "enum('a','b')", None, None).unwrap();
        assert_eq!(
            col.kind,
            ColumnType::Enum {
                values: vec!["a".into(), "b".into()]
            }
        );
    }

    #[test]
    fn unknown_rendering_is_an_error() {
        assert!(column_from_information_schema("x", "frobnicator", None, None).is_err());
    }
}
