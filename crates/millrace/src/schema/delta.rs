//! Schema deltas
//!
//! Parsed DDL becomes a [`SchemaDelta`], a tagged variant whose
//! `apply` takes a snapshot and returns a new one, failing with
//! [`SchemaSyncError`] when the statement's preconditions do not hold
//! against the mirror. Deltas never mutate in place; predecessor
//! snapshots stay valid references after application.
//!
//! `CREATE ... IF NOT EXISTS` and `DROP ... IF EXISTS` degrade the
//! would-be error into a no-op. Everything else is a hard error: a
//! precondition failure means the mirror has drifted, and decoding rows
//! against a drifted mirror is worse than stopping.

use crate::error::SchemaSyncError;
use crate::schema::columndef::ColumnDef;
use crate::schema::model::{Database, Schema, Table};
use serde::{Deserialize, Serialize};

/// Where an added or repositioned column lands in the column sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnPosition {
    First,
    After(String),
    Last,
    /// Explicit 0-based ordinal.
    Index(usize),
}

/// A parsed DDL change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SchemaDelta {
    CreateDatabase {
        name: String,
        charset: Option<String>,
        if_not_exists: bool,
    },
    DropDatabase {
        name: String,
        if_exists: bool,
    },
    CreateTable {
        database: String,
        table: Table,
        if_not_exists: bool,
    },
    DropTable {
        database: String,
        table: String,
        if_exists: bool,
    },
    RenameTable {
        database: String,
        from: String,
        to_database: Option<String>,
        to: String,
    },
    AddColumn {
        database: String,
        table: String,
        def: ColumnDef,
        position: ColumnPosition,
    },
    DropColumn {
        database: String,
        table: String,
        column: String,
    },
    ChangeColumn {
        database: String,
        table: String,
        /// Name before the change; same as `def.name` for MODIFY.
        column: String,
        def: ColumnDef,
        position: Option<ColumnPosition>,
    },
    ModifyEncoding {
        database: String,
        /// None targets the database default charset.
        table: Option<String>,
        charset: String,
    },
}

impl SchemaDelta {
    /// Databases this delta touches, for filtering.
    pub fn databases(&self) -> Vec<&str> {
        match self {
            SchemaDelta::CreateDatabase { name, .. } | SchemaDelta::DropDatabase { name, .. } => {
                vec![name]
            }
            SchemaDelta::CreateTable { database, .. }
            | SchemaDelta::DropTable { database, .. }
            | SchemaDelta::AddColumn { database, .. }
            | SchemaDelta::DropColumn { database, .. }
            | SchemaDelta::ChangeColumn { database, .. }
            | SchemaDelta::ModifyEncoding { database, .. } => vec![database],
            SchemaDelta::RenameTable {
                database,
                to_database,
                ..
            } => match to_database {
                Some(to) if to != database => vec![database, to],
                _ => vec![database],
            },
        }
    }

    /// Apply to a snapshot, producing the successor snapshot.
    pub fn apply(&self, schema: &Schema) -> Result<Schema, SchemaSyncError> {
        let mut next = schema.copy();
        match self {
            SchemaDelta::CreateDatabase {
                name,
                charset,
                if_not_exists,
            } => {
                if next.has_database(name) {
                    if *if_not_exists {
                        return Ok(next);
                    }
                    return Err(SchemaSyncError::DuplicateName {
                        scope: "schema".to_string(),
                        name: name.clone(),
                    });
                }
                let charset = charset.clone().unwrap_or_else(|| next.charset.clone());
                let case = next.case;
                next.push_database(Database::new(name.clone(), charset, case));
            }

            SchemaDelta::DropDatabase { name, if_exists } => {
                if !next.remove_database(name) && !*if_exists {
                    return Err(SchemaSyncError::MissingDatabase(name.clone()));
                }
            }

            SchemaDelta::CreateTable {
                database,
                table,
                if_not_exists,
            } => {
                let db = next
                    .database_mut(database)
                    .ok_or_else(|| SchemaSyncError::MissingDatabase(database.clone()))?;
                if db.has_table(&table.name) {
                    if *if_not_exists {
                        return Ok(schema.copy());
                    }
                    return Err(SchemaSyncError::DuplicateName {
                        scope: format!("database `{database}`"),
                        name: table.name.clone(),
                    });
                }
                let mut table = table.clone();
                table.database = database.clone();
                db.push_table(table);
            }

            SchemaDelta::DropTable {
                database,
                table,
                if_exists,
            } => {
                if !next.has_database(database) {
                    if *if_exists {
                        return Ok(next);
                    }
                    return Err(SchemaSyncError::MissingDatabase(database.clone()));
                }
                let db = next
                    .database_mut(database)
                    .ok_or_else(|| SchemaSyncError::MissingDatabase(database.clone()))?;
                if !db.remove_table(table) && !*if_exists {
                    return Err(SchemaSyncError::MissingTable {
                        database: database.clone(),
                        table: table.clone(),
                    });
                }
            }

            SchemaDelta::RenameTable {
                database,
                from,
                to_database,
                to,
            } => {
                let target_db = to_database.clone().unwrap_or_else(|| database.clone());
                if !next.has_database(&target_db) {
                    return Err(SchemaSyncError::MissingDatabase(target_db));
                }
                if next.find_table(&target_db, to).is_some() {
                    return Err(SchemaSyncError::DuplicateName {
                        scope: format!("database `{target_db}`"),
                        name: to.clone(),
                    });
                }
                let mut moved = next
                    .find_table(database, from)
                    .ok_or_else(|| SchemaSyncError::MissingTable {
                        database: database.clone(),
                        table: from.clone(),
                    })?
                    .clone();
                moved.name = to.clone();
                moved.database = target_db.clone();

                // both databases were verified to exist above
                next.database_mut(database)
                    .ok_or_else(|| SchemaSyncError::MissingDatabase(database.clone()))?
                    .remove_table(from);
                next.database_mut(&target_db)
                    .ok_or_else(|| SchemaSyncError::MissingDatabase(target_db.clone()))?
                    .push_table(moved);
            }

            SchemaDelta::AddColumn {
                database,
                table,
                def,
                position,
            } => {
                let t = table_mut(&mut next, database, table)?;
                if t.find_column(&def.name).is_some() {
                    return Err(SchemaSyncError::DuplicateName {
                        scope: format!("table `{database}`.`{table}`"),
                        name: def.name.clone(),
                    });
                }
                let index = resolve_position(t, position, database, table)?;
                t.columns.insert(index, def.clone());
            }

            SchemaDelta::DropColumn {
                database,
                table,
                column,
            } => {
                let t = table_mut(&mut next, database, table)?;
                let (index, _) =
                    t.find_column(column)
                        .ok_or_else(|| SchemaSyncError::MissingColumn {
                            database: database.clone(),
                            table: table.clone(),
                            column: column.clone(),
                        })?;
                t.columns.remove(index);
                t.pk_columns.retain(|c| !c.eq_ignore_ascii_case(column));
            }

            SchemaDelta::ChangeColumn {
                database,
                table,
                column,
                def,
                position,
            } => {
                let t = table_mut(&mut next, database, table)?;
                let (index, _) =
                    t.find_column(column)
                        .ok_or_else(|| SchemaSyncError::MissingColumn {
                            database: database.clone(),
                            table: table.clone(),
                            column: column.clone(),
                        })?;
                if !def.name.eq_ignore_ascii_case(column) {
                    if let Some((other, _)) = t.find_column(&def.name) {
                        if other != index {
                            return Err(SchemaSyncError::DuplicateName {
                                scope: format!("table `{database}`.`{table}`"),
                                name: def.name.clone(),
                            });
                        }
                    }
                    let renamed = def.name.clone();
                    for pk in t.pk_columns.iter_mut() {
                        if pk.eq_ignore_ascii_case(column) {
                            *pk = renamed.clone();
                        }
                    }
                }
                t.columns.remove(index);
                let target = match position {
                    Some(p) => resolve_position(t, p, database, table)?,
                    None => index,
                };
                t.columns.insert(target, def.clone());
            }

            SchemaDelta::ModifyEncoding {
                database,
                table,
                charset,
            } => match table {
                Some(table) => {
                    let t = table_mut(&mut next, database, table)?;
                    t.charset = charset.clone();
                }
                None => {
                    let db = next
                        .database_mut(database)
                        .ok_or_else(|| SchemaSyncError::MissingDatabase(database.clone()))?;
                    db.charset = charset.clone();
                }
            },
        }
        Ok(next)
    }
}

fn table_mut<'a>(
    schema: &'a mut Schema,
    database: &str,
    table: &str,
) -> Result<&'a mut Table, SchemaSyncError> {
    let db = schema
        .database_mut(database)
        .ok_or_else(|| SchemaSyncError::MissingDatabase(database.to_string()))?;
    db.table_mut(table).ok_or_else(|| SchemaSyncError::MissingTable {
        database: database.to_string(),
        table: table.to_string(),
    })
}

fn resolve_position(
    table: &Table,
    position: &ColumnPosition,
    database: &str,
    table_name: &str,
) -> Result<usize, SchemaSyncError> {
    match position {
        ColumnPosition::First => Ok(0),
        ColumnPosition::Last => Ok(table.columns.len()),
        ColumnPosition::After(name) => {
            let (index, _) =
                table
                    .find_column(name)
                    .ok_or_else(|| SchemaSyncError::MissingColumn {
                        database: database.to_string(),
                        table: table_name.to_string(),
                        column: name.clone(),
                    })?;
            Ok(index + 1)
        }
        ColumnPosition::Index(index) => {
            if *index > table.columns.len() {
                return Err(SchemaSyncError::IndexOutOfRange {
                    database: database.to_string(),
                    table: table_name.to_string(),
                    index: *index,
                    len: table.columns.len(),
                });
            }
            Ok(*index)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::columndef::{ColumnDef, ColumnType};
    use crate::schema::model::CaseSensitivity;

    fn base_schema() -> Schema {
        let delta = SchemaDelta::CreateDatabase {
            name: "shop".into(),
            charset: None,
            if_not_exists: false,
        };
        delta.apply(&Schema::new(CaseSensitivity::Sensitive)).unwrap()
    }

    fn users_table() -> Table {
        Table::new("shop", "users")
            .with_columns(vec![ColumnDef::int("id"), ColumnDef::varchar("name", 32)])
    }

    fn with_users() -> Schema {
        SchemaDelta::CreateTable {
            database: "shop".into(),
            table: users_table(),
            if_not_exists: false,
        }
        .apply(&base_schema())
        .unwrap()
    }

    #[test]
    fn apply_never_mutates_input() {
        let schema = with_users();
        let before = schema.clone();

        let _ = SchemaDelta::AddColumn {
            database: "shop".into(),
            table: "users".into(),
            def: ColumnDef::int("age"),
            position: ColumnPosition::Last,
        }
        .apply(&schema)
        .unwrap();

        assert_eq!(schema, before);
    }

    #[test]
    fn duplicate_create_table_fails() {
        let schema = with_users();
        let err = SchemaDelta::CreateTable {
            database: "shop".into(),
            table: users_table(),
            if_not_exists: false,
        }
        .apply(&schema)
        .unwrap_err();
        assert!(matches!(err, SchemaSyncError::DuplicateName { .. }));
    }

    #[test]
    fn create_if_not_exists_is_noop() {
        let schema = with_users();
        let next = SchemaDelta::CreateTable {
            database: "shop".into(),
            table: Table::new("shop", "users"),
            if_not_exists: true,
        }
        .apply(&schema)
        .unwrap();
        assert_eq!(next, schema);
    }

    #[test]
    fn drop_missing_table() {
        let schema = base_schema();
        let err = SchemaDelta::DropTable {
            database: "shop".into(),
            table: "nope".into(),
            if_exists: false,
        }
        .apply(&schema)
        .unwrap_err();
        assert!(matches!(err, SchemaSyncError::MissingTable { .. }));

        let next = SchemaDelta::DropTable {
            database: "shop".into(),
            table: "nope".into(),
            if_exists: true,
        }
        .apply(&schema)
        .unwrap();
        assert_eq!(next, schema);
    }

    #[test]
    fn create_table_in_missing_database() {
        let err = SchemaDelta::CreateTable {
            database: "void".into(),
            table: users_table(),
            if_not_exists: false,
        }
        .apply(&Schema::new(CaseSensitivity::Sensitive))
        .unwrap_err();
        assert_eq!(err, SchemaSyncError::MissingDatabase("void".into()));
    }

    #[test]
    fn add_column_positions() {
        let schema = with_users();

        let next = SchemaDelta::AddColumn {
            database: "shop".into(),
            table: "users".into(),
            def: ColumnDef::int("age"),
            position: ColumnPosition::Index(2),
        }
        .apply(&schema)
        .unwrap();
        let cols: Vec<_> = next
            .find_table("shop", "users")
            .unwrap()
            .columns
            .iter()
            .map(|c| c.name.clone())
            .collect();
        assert_eq!(cols, vec!["id", "name", "age"]);

        let next = SchemaDelta::AddColumn {
            database: "shop".into(),
            table: "users".into(),
            def: ColumnDef::int("tenant"),
            position: ColumnPosition::First,
        }
        .apply(&next)
        .unwrap();
        assert_eq!(
            next.find_table("shop", "users").unwrap().columns[0].name,
            "tenant"
        );

        let next = SchemaDelta::AddColumn {
            database: "shop".into(),
            table: "users".into(),
            def: ColumnDef::int("score"),
            position: ColumnPosition::After("tenant".into()),
        }
        .apply(&next)
        .unwrap();
        assert_eq!(
            next.find_table("shop", "users").unwrap().columns[1].name,
            "score"
        );
    }

    #[test]
    fn add_column_index_out_of_range() {
        let err = SchemaDelta::AddColumn {
            database: "shop".into(),
            table: "users".into(),
            def: ColumnDef::int("age"),
            position: ColumnPosition::Index(5),
        }
        .apply(&with_users())
        .unwrap_err();
        assert!(matches!(err, SchemaSyncError::IndexOutOfRange { index: 5, .. }));
    }

    #[test]
    fn add_duplicate_column() {
        let err = SchemaDelta::AddColumn {
            database: "shop".into(),
            table: "users".into(),
            def: ColumnDef::int("id"),
            position: ColumnPosition::Last,
        }
        .apply(&with_users())
        .unwrap_err();
        assert!(matches!(err, SchemaSyncError::DuplicateName { .. }));
    }

    #[test]
    fn drop_column_updates_pk() {
        let schema = SchemaDelta::CreateTable {
            database: "shop".into(),
            table: users_table().with_pk(vec!["id".into()]),
            if_not_exists: false,
        }
        .apply(&base_schema())
        .unwrap();

        let next = SchemaDelta::DropColumn {
            database: "shop".into(),
            table: "users".into(),
            column: "id".into(),
        }
        .apply(&schema)
        .unwrap();
        let table = next.find_table("shop", "users").unwrap();
        assert_eq!(table.columns.len(), 1);
        assert!(table.pk_columns.is_empty());
    }

    #[test]
    fn change_column_renames_and_retypes() {
        let schema = with_users();
        let next = SchemaDelta::ChangeColumn {
            database: "shop".into(),
            table: "users".into(),
            column: "name".into(),
            def: ColumnDef::new(
                "full_name",
                ColumnType::String {
                    length: 128,
                    charset: "utf8mb4".into(),
                },
            ),
            position: None,
        }
        .apply(&schema)
        .unwrap();

        let table = next.find_table("shop", "users").unwrap();
        let (idx, col) = table.find_column("full_name").unwrap();
        assert_eq!(idx, 1, "MODIFY without position keeps the ordinal");
        assert!(matches!(col.kind, ColumnType::String { length: 128, .. }));
        assert!(table.find_column("name").is_none());
    }

    #[test]
    fn change_column_to_duplicate_name_fails() {
        let err = SchemaDelta::ChangeColumn {
            database: "shop".into(),
            table: "users".into(),
            column: "name".into(),
            def: ColumnDef::int("id"),
            position: None,
        }
        .apply(&with_users())
        .unwrap_err();
        assert!(matches!(err, SchemaSyncError::DuplicateName { .. }));
    }

    #[test]
    fn rename_table_across_databases() {
        let schema = SchemaDelta::CreateDatabase {
            name: "archive".into(),
            charset: None,
            if_not_exists: false,
        }
        .apply(&with_users())
        .unwrap();

        let next = SchemaDelta::RenameTable {
            database: "shop".into(),
            from: "users".into(),
            to_database: Some("archive".into()),
            to: "users_old".into(),
        }
        .apply(&schema)
        .unwrap();

        assert!(next.find_table("shop", "users").is_none());
        let moved = next.find_table("archive", "users_old").unwrap();
        assert_eq!(moved.database, "archive");
        assert_eq!(moved.columns.len(), 2);
    }

    #[test]
    fn modify_encoding() {
        let next = SchemaDelta::ModifyEncoding {
            database: "shop".into(),
            table: Some("users".into()),
            charset: "latin1".into(),
        }
        .apply(&with_users())
        .unwrap();
        assert_eq!(next.find_table("shop", "users").unwrap().charset, "latin1");

        let next = SchemaDelta::ModifyEncoding {
            database: "shop".into(),
            table: None,
            charset: "latin1".into(),
        }
        .apply(&next)
        .unwrap();
        assert_eq!(next.find_database("shop").unwrap().charset, "latin1");
    }

    #[test]
    fn deltas_roundtrip_json() {
        let delta = SchemaDelta::AddColumn {
            database: "shop".into(),
            table: "users".into(),
            def: ColumnDef::int("age"),
            position: ColumnPosition::After("name".into()),
        };
        let json = serde_json::to_string(&delta).unwrap();
        let back: SchemaDelta = serde_json::from_str(&json).unwrap();
        assert_eq!(delta, back);
    }
}
