//! MySQL-backed metadata stores
//!
//! The durable state this system owns lives in a companion metadata
//! database on a MySQL server (usually the upstream itself): `schemas`
//! holds snapshot/delta-chain entries, `databases`/`tables`/`columns`
//! hold normalized full snapshots, `positions` the per-client cursor and
//! `heartbeats` the recovery candidates. Snapshot writes are wrapped in
//! a transaction so readers never observe a partial snapshot.

use crate::error::{MillraceError, Result};
use crate::position::{Position, RecoveryInfo};
use crate::schema::columndef::{ColumnDef, ColumnType};
use crate::schema::delta::SchemaDelta;
use crate::schema::model::{CaseSensitivity, Database, Schema, Table};
use crate::store::position_store::PositionStore;
use crate::store::schema_store::SchemaStore;
use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Pool, TxOpts};
use tracing::{debug, info};

/// Bootstrap DDL for the metadata schema, one statement per entry.
/// `{db}` is substituted with the metadata database name.
const BOOTSTRAP: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS `{db}`.`schemas` (
        id BIGINT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY,
        server_id BIGINT UNSIGNED NOT NULL,
        binlog_file VARCHAR(255) NOT NULL,
        binlog_position BIGINT UNSIGNED NOT NULL,
        gtid_set TEXT,
        last_heartbeat BIGINT UNSIGNED,
        base_schema_id BIGINT UNSIGNED,
        deltas LONGTEXT,
        charset VARCHAR(64) NOT NULL DEFAULT 'utf8mb4',
        case_sensitive TINYINT(1) NOT NULL DEFAULT 1,
        INDEX schemas_by_position (server_id, binlog_file, binlog_position)
    ) ENGINE=InnoDB",
    "CREATE TABLE IF NOT EXISTS `{db}`.`databases` (
        id BIGINT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY,
        schema_id BIGINT UNSIGNED NOT NULL,
        name VARCHAR(255) NOT NULL,
        charset VARCHAR(64) NOT NULL,
        INDEX databases_by_schema (schema_id)
    ) ENGINE=InnoDB",
    "CREATE TABLE IF NOT EXISTS `{db}`.`tables` (
        id BIGINT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY,
        schema_id BIGINT UNSIGNED NOT NULL,
        database_id BIGINT UNSIGNED NOT NULL,
        name VARCHAR(255) NOT NULL,
        charset VARCHAR(64) NOT NULL,
        pk_columns TEXT,
        INDEX tables_by_schema (schema_id)
    ) ENGINE=InnoDB",
    "CREATE TABLE IF NOT EXISTS `{db}`.`columns` (
        id BIGINT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY,
        schema_id BIGINT UNSIGNED NOT NULL,
        table_id BIGINT UNSIGNED NOT NULL,
        name VARCHAR(255) NOT NULL,
        ordinal INT UNSIGNED NOT NULL,
        coltype VARCHAR(32) NOT NULL,
        is_signed TINYINT(1),
        charset VARCHAR(64),
        col_length INT UNSIGNED,
        num_precision TINYINT UNSIGNED,
        num_scale TINYINT UNSIGNED,
        fsp TINYINT UNSIGNED,
        enum_values TEXT,
        INDEX columns_by_table (schema_id, table_id)
    ) ENGINE=InnoDB",
    "CREATE TABLE IF NOT EXISTS `{db}`.`positions` (
        server_id BIGINT UNSIGNED NOT NULL,
        client_id VARCHAR(96) NOT NULL,
        binlog_file VARCHAR(255) NOT NULL,
        binlog_position BIGINT UNSIGNED NOT NULL,
        gtid_set TEXT,
        last_heartbeat_read BIGINT UNSIGNED,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            ON UPDATE CURRENT_TIMESTAMP,
        PRIMARY KEY (server_id, client_id)
    ) ENGINE=InnoDB",
    "CREATE TABLE IF NOT EXISTS `{db}`.`heartbeats` (
        server_id BIGINT UNSIGNED NOT NULL,
        client_id VARCHAR(96) NOT NULL,
        heartbeat BIGINT UNSIGNED NOT NULL,
        binlog_file VARCHAR(255) NOT NULL,
        binlog_position BIGINT UNSIGNED NOT NULL,
        gtid_set TEXT,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (server_id, client_id, heartbeat)
    ) ENGINE=InnoDB",
];

/// Create the metadata database and its tables if absent.
pub async fn ensure_metadata_schema(pool: &Pool, database: &str) -> Result<()> {
    let mut conn = pool.get_conn().await.map_err(MillraceError::from_mysql)?;
    conn.query_drop(format!("CREATE DATABASE IF NOT EXISTS `{database}`"))
        .await
        .map_err(MillraceError::from_mysql)?;
    for statement in BOOTSTRAP {
        conn.query_drop(statement.replace("{db}", database))
            .await
            .map_err(MillraceError::from_mysql)?;
    }
    info!(%database, "metadata schema ensured");
    Ok(())
}

// ---- row <-> model encoding, kept pure for unit testing ----

/// Flat `columns`-table row image for one column definition.
pub(crate) type ColumnRow = (
    String,         // name
    String,         // coltype
    Option<bool>,   // is_signed
    Option<String>, // charset
    Option<u32>,    // col_length
    Option<u8>,     // num_precision
    Option<u8>,     // num_scale
    Option<u8>,     // fsp
    Option<String>, // enum_values (JSON array)
);

pub(crate) fn column_row_from_def(def: &ColumnDef) -> Result<ColumnRow> {
    let name = def.name.clone();
    Ok(match &def.kind {
        ColumnType::Int { bytes, signed } => (
            name,
            "int".into(),
            Some(*signed),
            None,
            Some(u32::from(*bytes)),
            None,
            None,
            None,
            None,
        ),
        ColumnType::BigInt { signed } => (
            name,
            "bigint".into(),
            Some(*signed),
            None,
            None,
            None,
            None,
            None,
            None,
        ),
        ColumnType::Decimal { precision, scale } => (
            name,
            "decimal".into(),
            None,
            None,
            None,
            Some(*precision),
            Some(*scale),
            None,
            None,
        ),
        ColumnType::Float => (name, "float".into(), None, None, None, None, None, None, None),
        ColumnType::Double => (name, "double".into(), None, None, None, None, None, None, None),
        ColumnType::Bit { bits } => (
            name,
            "bit".into(),
            None,
            None,
            Some(u32::from(*bits)),
            None,
            None,
            None,
            None,
        ),
        ColumnType::String { length, charset } => (
            name,
            "string".into(),
            None,
            Some(charset.clone()),
            Some(*length),
            None,
            None,
            None,
            None,
        ),
        ColumnType::Binary { length } => (
            name,
            "binary".into(),
            None,
            None,
            Some(*length),
            None,
            None,
            None,
            None,
        ),
        ColumnType::Enum { values } => (
            name,
            "enum".into(),
            None,
            None,
            None,
            None,
            None,
            None,
            Some(serde_json::to_string(values)?),
        ),
        ColumnType::Set { values } => (
            name,
            "set".into(),
            None,
            None,
            None,
            None,
            None,
            None,
            Some(serde_json::to_string(values)?),
        ),
        ColumnType::Date => (name, "date".into(), None, None, None, None, None, None, None),
        ColumnType::Time { fsp } => (
            name,
            "time".into(),
            None,
            None,
            None,
            None,
            None,
            Some(*fsp),
            None,
        ),
        ColumnType::DateTime { fsp } => (
            name,
            "datetime".into(),
            None,
            None,
            None,
            None,
            None,
            Some(*fsp),
            None,
        ),
        ColumnType::Timestamp { fsp } => (
            name,
            "timestamp".into(),
            None,
            None,
            None,
            None,
            None,
            Some(*fsp),
            None,
        ),
        ColumnType::Year => (name, "year".into(), None, None, None, None, None, None, None),
        ColumnType::Json => (name, "json".into(), None, None, None, None, None, None, None),
        ColumnType::Geometry => (
            name,
            "geometry".into(),
            None,
            None,
            None,
            None,
            None,
            None,
            None,
        ),
    })
}

pub(crate) fn def_from_column_row(row: &ColumnRow) -> Result<ColumnDef> {
    let (name, coltype, is_signed, charset, col_length, precision, scale, fsp, enum_values) = row;
    let kind = match coltype.as_str() {
        "int" => ColumnType::Int {
            bytes: col_length.unwrap_or(4) as u8,
            signed: is_signed.unwrap_or(true),
        },
        "bigint" => ColumnType::BigInt {
            signed: is_signed.unwrap_or(true),
        },
        "decimal" => ColumnType::Decimal {
            precision: precision.unwrap_or(10),
            scale: scale.unwrap_or(0),
        },
        "float" => ColumnType::Float,
        "double" => ColumnType::Double,
        "bit" => ColumnType::Bit {
            bits: col_length.unwrap_or(1) as u16,
        },
        "string" => ColumnType::String {
            length: col_length.unwrap_or(0),
            charset: charset.clone().unwrap_or_else(|| "utf8mb4".to_string()),
        },
        "binary" => ColumnType::Binary {
            length: col_length.unwrap_or(0),
        },
        "enum" => ColumnType::Enum {
            values: parse_values(enum_values)?,
        },
        "set" => ColumnType::Set {
            values: parse_values(enum_values)?,
        },
        "date" => ColumnType::Date,
        "time" => ColumnType::Time {
            fsp: fsp.unwrap_or(0),
        },
        "datetime" => ColumnType::DateTime {
            fsp: fsp.unwrap_or(0),
        },
        "timestamp" => ColumnType::Timestamp {
            fsp: fsp.unwrap_or(0),
        },
        "year" => ColumnType::Year,
        "json" => ColumnType::Json,
        "geometry" => ColumnType::Geometry,
        other => {
            return Err(MillraceError::store(format!(
                "unknown persisted column type `{other}`"
            )))
        }
    };
    Ok(ColumnDef::new(name.clone(), kind))
}

fn parse_values(raw: &Option<String>) -> Result<Vec<String>> {
    match raw {
        Some(json) => Ok(serde_json::from_str(json)?),
        None => Ok(Vec::new()),
    }
}

// ---- position store ----

/// Position store backed by the metadata database.
pub struct MysqlPositionStore {
    pool: Pool,
    database: String,
    server_id: u64,
    client_id: String,
}

impl MysqlPositionStore {
    pub fn new(pool: Pool, database: impl Into<String>, server_id: u64, client_id: impl Into<String>) -> Self {
        Self {
            pool,
            database: database.into(),
            server_id,
            client_id: client_id.into(),
        }
    }

    fn table(&self, name: &str) -> String {
        format!("`{}`.`{}`", self.database, name)
    }
}

#[async_trait]
impl PositionStore for MysqlPositionStore {
    async fn get(&self) -> Result<Option<Position>> {
        let mut conn = self.pool.get_conn().await.map_err(MillraceError::from_mysql)?;
        let row: Option<(String, u64, Option<String>, Option<u64>)> = conn
            .exec_first(
                format!(
                    "SELECT binlog_file, binlog_position, gtid_set, last_heartbeat_read \
                     FROM {} WHERE server_id = ? AND client_id = ?",
                    self.table("positions")
                ),
                (self.server_id, &self.client_id),
            )
            .await
            .map_err(MillraceError::from_mysql)?;
        Ok(row.map(|(file, offset, gtid, heartbeat)| Position {
            binlog: crate::position::BinlogPosition::new(file, offset),
            gtid_set: gtid,
            last_heartbeat: heartbeat,
        }))
    }

    async fn set(&self, position: &Position) -> Result<()> {
        if let Some(current) = self.get().await? {
            if current.newer_than(position) {
                return Err(MillraceError::store(format!(
                    "refusing to rewind position from {current} to {position}"
                )));
            }
        }
        let mut conn = self.pool.get_conn().await.map_err(MillraceError::from_mysql)?;
        conn.exec_drop(
            format!(
                "REPLACE INTO {} \
                 (server_id, client_id, binlog_file, binlog_position, gtid_set, last_heartbeat_read) \
                 VALUES (?, ?, ?, ?, ?, ?)",
                self.table("positions")
            ),
            (
                self.server_id,
                &self.client_id,
                &position.binlog.file,
                position.binlog.offset,
                &position.gtid_set,
                position.last_heartbeat,
            ),
        )
        .await
        .map_err(MillraceError::from_mysql)?;

        if let Some(heartbeat) = position.last_heartbeat {
            conn.exec_drop(
                format!(
                    "REPLACE INTO {} \
                     (server_id, client_id, heartbeat, binlog_file, binlog_position, gtid_set) \
                     VALUES (?, ?, ?, ?, ?, ?)",
                    self.table("heartbeats")
                ),
                (
                    self.server_id,
                    &self.client_id,
                    heartbeat,
                    &position.binlog.file,
                    position.binlog.offset,
                    &position.gtid_set,
                ),
            )
            .await
            .map_err(MillraceError::from_mysql)?;
        }
        debug!(%position, "position committed");
        Ok(())
    }

    async fn recovery_info(&self) -> Result<Option<RecoveryInfo>> {
        let mut conn = self.pool.get_conn().await.map_err(MillraceError::from_mysql)?;
        let row: Option<(u64, u64, String, u64, Option<String>)> = conn
            .exec_first(
                format!(
                    "SELECT server_id, heartbeat, binlog_file, binlog_position, gtid_set \
                     FROM {} WHERE server_id <> ? AND client_id = ? AND binlog_file <> '' \
                     ORDER BY heartbeat DESC LIMIT 1",
                    self.table("heartbeats")
                ),
                (self.server_id, &self.client_id),
            )
            .await
            .map_err(MillraceError::from_mysql)?;
        Ok(row.map(|(server_id, heartbeat_id, file, offset, gtid)| RecoveryInfo {
            server_id,
            client_id: self.client_id.clone(),
            heartbeat_id,
            position: Position {
                binlog: crate::position::BinlogPosition::new(file, offset),
                gtid_set: gtid,
                last_heartbeat: Some(heartbeat_id),
            },
        }))
    }

    async fn other_client_position(&self) -> Result<Option<Position>> {
        let mut conn = self.pool.get_conn().await.map_err(MillraceError::from_mysql)?;
        let row: Option<(String, u64, Option<String>, Option<u64>)> = conn
            .exec_first(
                format!(
                    "SELECT binlog_file, binlog_position, gtid_set, last_heartbeat_read \
                     FROM {} WHERE server_id = ? AND client_id <> ? \
                     ORDER BY binlog_file DESC, binlog_position DESC LIMIT 1",
                    self.table("positions")
                ),
                (self.server_id, &self.client_id),
            )
            .await
            .map_err(MillraceError::from_mysql)?;
        Ok(row.map(|(file, offset, gtid, heartbeat)| Position {
            binlog: crate::position::BinlogPosition::new(file, offset),
            gtid_set: gtid,
            last_heartbeat: heartbeat,
        }))
    }

    async fn cleanup_old_recovery_infos(&self) -> Result<()> {
        let Some(current) = self.get().await? else {
            return Ok(());
        };
        let Some(watermark) = current.last_heartbeat else {
            return Ok(());
        };
        let mut conn = self.pool.get_conn().await.map_err(MillraceError::from_mysql)?;
        conn.exec_drop(
            format!(
                "DELETE FROM {} WHERE heartbeat <= ?",
                self.table("heartbeats")
            ),
            (watermark,),
        )
        .await
        .map_err(MillraceError::from_mysql)?;
        Ok(())
    }
}

// ---- schema store ----

/// Schema store backed by the metadata database.
pub struct MysqlSchemaStore {
    pool: Pool,
    database: String,
}

impl MysqlSchemaStore {
    pub fn new(pool: Pool, database: impl Into<String>) -> Self {
        Self {
            pool,
            database: database.into(),
        }
    }

    fn table(&self, name: &str) -> String {
        format!("`{}`.`{}`", self.database, name)
    }

    /// Load the `schemas` row header for an entry id.
    async fn entry_header(
        &self,
        conn: &mut mysql_async::Conn,
        id: u64,
    ) -> Result<Option<(u64, Position, Option<u64>, Option<String>, String, bool)>> {
        let row: Option<(
            u64,
            String,
            u64,
            Option<String>,
            Option<u64>,
            Option<u64>,
            Option<String>,
            String,
            bool,
        )> = conn
            .exec_first(
                format!(
                    "SELECT server_id, binlog_file, binlog_position, gtid_set, last_heartbeat, \
                            base_schema_id, deltas, charset, case_sensitive \
                     FROM {} WHERE id = ?",
                    self.table("schemas")
                ),
                (id,),
            )
            .await
            .map_err(MillraceError::from_mysql)?;
        Ok(row.map(
            |(server_id, file, offset, gtid, heartbeat, base, deltas, charset, case)| {
                let mut position = Position::new(file, offset);
                position.gtid_set = gtid;
                position.last_heartbeat = heartbeat;
                (server_id, position, base, deltas, charset, case)
            },
        ))
    }

    /// Load the normalized full snapshot stored for `schema_id`.
    async fn load_snapshot(
        &self,
        conn: &mut mysql_async::Conn,
        schema_id: u64,
        charset: String,
        case_sensitive: bool,
    ) -> Result<Schema> {
        let case = if case_sensitive {
            CaseSensitivity::Sensitive
        } else {
            CaseSensitivity::Insensitive
        };
        let mut schema = Schema::new(case);
        schema.charset = charset;

        let databases: Vec<(u64, String, String)> = conn
            .exec(
                format!(
                    "SELECT id, name, charset FROM {} WHERE schema_id = ? ORDER BY id",
                    self.table("databases")
                ),
                (schema_id,),
            )
            .await
            .map_err(MillraceError::from_mysql)?;

        for (database_id, db_name, db_charset) in databases {
            let mut database = Database::new(db_name.clone(), db_charset, case);

            let tables: Vec<(u64, String, String, Option<String>)> = conn
                .exec(
                    format!(
                        "SELECT id, name, charset, pk_columns \
                         FROM {} WHERE schema_id = ? AND database_id = ? ORDER BY id",
                        self.table("tables")
                    ),
                    (schema_id, database_id),
                )
                .await
                .map_err(MillraceError::from_mysql)?;

            for (table_id, table_name, table_charset, pk) in tables {
                let rows: Vec<ColumnRow> = conn
                    .exec(
                        format!(
                            "SELECT name, coltype, is_signed, charset, col_length, \
                                    num_precision, num_scale, fsp, enum_values \
                             FROM {} WHERE schema_id = ? AND table_id = ? ORDER BY ordinal",
                            self.table("columns")
                        ),
                        (schema_id, table_id),
                    )
                    .await
                    .map_err(MillraceError::from_mysql)?;

                let mut table = Table::new(db_name.clone(), table_name).with_charset(table_charset);
                table.pk_columns = pk
                    .map(|p| p.split(',').map(str::to_string).filter(|s| !s.is_empty()).collect())
                    .unwrap_or_default();
                for row in &rows {
                    table.columns.push(def_from_column_row(row)?);
                }
                database.push_table(table);
            }
            schema.push_database(database);
        }
        Ok(schema)
    }

    /// Materialize an entry by chain walk + replay.
    async fn materialize(&self, conn: &mut mysql_async::Conn, id: u64) -> Result<Schema> {
        let mut chain: Vec<(u64, Option<String>, String, bool)> = Vec::new();
        let mut cursor = id;
        loop {
            let Some((_, _, base, deltas, charset, case)) =
                self.entry_header(conn, cursor).await?
            else {
                return Err(MillraceError::store(format!(
                    "schema entry {cursor} referenced but missing"
                )));
            };
            let is_full = deltas.is_none();
            chain.push((cursor, deltas, charset, case));
            if is_full {
                break;
            }
            cursor = base.ok_or_else(|| {
                MillraceError::store(format!("schema entry {cursor} has no base"))
            })?;
        }
        chain.reverse();

        let (root_id, _, charset, case) = chain[0].clone();
        let mut schema = self.load_snapshot(conn, root_id, charset, case).await?;
        for (_, deltas, _, _) in &chain[1..] {
            let deltas: Vec<SchemaDelta> = match deltas {
                Some(json) => serde_json::from_str(json)?,
                None => Vec::new(),
            };
            for delta in &deltas {
                schema = delta.apply(&schema)?;
            }
        }
        Ok(schema)
    }

    /// Newest entry id for the server at or before the position.
    async fn entry_id_at(
        &self,
        conn: &mut mysql_async::Conn,
        server_id: u64,
        position: &Position,
    ) -> Result<Option<u64>> {
        let id: Option<u64> = conn
            .exec_first(
                format!(
                    "SELECT id FROM {} \
                     WHERE server_id = ? \
                       AND (binlog_file < ? OR (binlog_file = ? AND binlog_position <= ?)) \
                     ORDER BY id DESC LIMIT 1",
                    self.table("schemas")
                ),
                (
                    server_id,
                    &position.binlog.file,
                    &position.binlog.file,
                    position.binlog.offset,
                ),
            )
            .await
            .map_err(MillraceError::from_mysql)?;
        Ok(id)
    }

    /// Insert the snapshot header + normalized rows in one transaction.
    async fn insert_full(
        &self,
        server_id: u64,
        position: &Position,
        schema: &Schema,
    ) -> Result<u64> {
        let mut conn = self.pool.get_conn().await.map_err(MillraceError::from_mysql)?;
        let mut tx = conn
            .start_transaction(TxOpts::default())
            .await
            .map_err(MillraceError::from_mysql)?;

        tx.exec_drop(
            format!(
                "INSERT INTO {} \
                 (server_id, binlog_file, binlog_position, gtid_set, last_heartbeat, \
                  base_schema_id, deltas, charset, case_sensitive) \
                 VALUES (?, ?, ?, ?, ?, NULL, NULL, ?, ?)",
                self.table("schemas")
            ),
            (
                server_id,
                &position.binlog.file,
                position.binlog.offset,
                &position.gtid_set,
                position.last_heartbeat,
                &schema.charset,
                schema.case == CaseSensitivity::Sensitive,
            ),
        )
        .await
        .map_err(MillraceError::from_mysql)?;
        let schema_id: u64 = tx
            .exec_first("SELECT LAST_INSERT_ID()", ())
            .await
            .map_err(MillraceError::from_mysql)?
            .ok_or_else(|| MillraceError::store("LAST_INSERT_ID returned nothing"))?;

        for database in schema.databases() {
            tx.exec_drop(
                format!(
                    "INSERT INTO {} (schema_id, name, charset) VALUES (?, ?, ?)",
                    self.table("databases")
                ),
                (schema_id, &database.name, &database.charset),
            )
            .await
            .map_err(MillraceError::from_mysql)?;
            let database_id: u64 = tx
                .exec_first("SELECT LAST_INSERT_ID()", ())
                .await
                .map_err(MillraceError::from_mysql)?
                .ok_or_else(|| MillraceError::store("LAST_INSERT_ID returned nothing"))?;

            for table in database.tables() {
                tx.exec_drop(
                    format!(
                        "INSERT INTO {} (schema_id, database_id, name, charset, pk_columns) \
                         VALUES (?, ?, ?, ?, ?)",
                        self.table("tables")
                    ),
                    (
                        schema_id,
                        database_id,
                        &table.name,
                        &table.charset,
                        table.pk_columns.join(","),
                    ),
                )
                .await
                .map_err(MillraceError::from_mysql)?;
                let table_id: u64 = tx
                    .exec_first("SELECT LAST_INSERT_ID()", ())
                    .await
                    .map_err(MillraceError::from_mysql)?
                    .ok_or_else(|| MillraceError::store("LAST_INSERT_ID returned nothing"))?;

                for (ordinal, def) in table.columns.iter().enumerate() {
                    let row = column_row_from_def(def)?;
                    tx.exec_drop(
                        format!(
                            "INSERT INTO {} \
                             (schema_id, table_id, name, ordinal, coltype, is_signed, charset, \
                              col_length, num_precision, num_scale, fsp, enum_values) \
                             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                            self.table("columns")
                        ),
                        (
                            schema_id, table_id, &row.0, ordinal as u32, &row.1, row.2, &row.3,
                            row.4, row.5, row.6, row.7, &row.8,
                        ),
                    )
                    .await
                    .map_err(MillraceError::from_mysql)?;
                }
            }
        }

        tx.commit().await.map_err(MillraceError::from_mysql)?;
        info!(schema_id, server_id, %position, "saved full schema snapshot");
        Ok(schema_id)
    }
}

#[async_trait]
impl SchemaStore for MysqlSchemaStore {
    async fn save_full(
        &self,
        server_id: u64,
        position: &Position,
        schema: &Schema,
    ) -> Result<u64> {
        self.insert_full(server_id, position, schema).await
    }

    async fn save_deltas(
        &self,
        server_id: u64,
        base_id: u64,
        position: &Position,
        deltas: &[SchemaDelta],
    ) -> Result<u64> {
        let mut conn = self.pool.get_conn().await.map_err(MillraceError::from_mysql)?;
        if self.entry_header(&mut conn, base_id).await?.is_none() {
            return Err(MillraceError::store(format!(
                "delta base entry {base_id} does not exist"
            )));
        }
        let deltas_json = serde_json::to_string(deltas)?;
        conn.exec_drop(
            format!(
                "INSERT INTO {} \
                 (server_id, binlog_file, binlog_position, gtid_set, last_heartbeat, \
                  base_schema_id, deltas, charset, case_sensitive) \
                 SELECT ?, ?, ?, ?, ?, ?, ?, charset, case_sensitive FROM {} WHERE id = ?",
                self.table("schemas"),
                self.table("schemas")
            ),
            (
                server_id,
                &position.binlog.file,
                position.binlog.offset,
                &position.gtid_set,
                position.last_heartbeat,
                base_id,
                deltas_json,
                base_id,
            ),
        )
        .await
        .map_err(MillraceError::from_mysql)?;
        let id: u64 = conn
            .exec_first("SELECT LAST_INSERT_ID()", ())
            .await
            .map_err(MillraceError::from_mysql)?
            .ok_or_else(|| MillraceError::store("LAST_INSERT_ID returned nothing"))?;
        debug!(id, base_id, %position, "saved schema deltas");
        Ok(id)
    }

    async fn schema_at(
        &self,
        server_id: u64,
        position: &Position,
    ) -> Result<Option<(u64, Schema)>> {
        let mut conn = self.pool.get_conn().await.map_err(MillraceError::from_mysql)?;
        let Some(id) = self.entry_id_at(&mut conn, server_id, position).await? else {
            return Ok(None);
        };
        let schema = self.materialize(&mut conn, id).await?;
        Ok(Some((id, schema)))
    }

    async fn entry_at_exact(
        &self,
        server_id: u64,
        position: &Position,
    ) -> Result<Option<(u64, Schema)>> {
        let mut conn = self.pool.get_conn().await.map_err(MillraceError::from_mysql)?;
        let id: Option<u64> = conn
            .exec_first(
                format!(
                    "SELECT id FROM {} \
                     WHERE server_id = ? AND binlog_file = ? AND binlog_position = ? \
                       AND deltas IS NOT NULL \
                     ORDER BY id DESC LIMIT 1",
                    self.table("schemas")
                ),
                (server_id, &position.binlog.file, position.binlog.offset),
            )
            .await
            .map_err(MillraceError::from_mysql)?;
        let Some(id) = id else {
            return Ok(None);
        };
        let schema = self.materialize(&mut conn, id).await?;
        Ok(Some((id, schema)))
    }

    async fn clone_for_server(
        &self,
        old_server_id: u64,
        old_position: &Position,
        new_server_id: u64,
        new_position: &Position,
    ) -> Result<Option<u64>> {
        let mut conn = self.pool.get_conn().await.map_err(MillraceError::from_mysql)?;
        let Some(id) = self.entry_id_at(&mut conn, old_server_id, old_position).await? else {
            return Ok(None);
        };
        let schema = self.materialize(&mut conn, id).await?;
        drop(conn);
        let new_id = self.insert_full(new_server_id, new_position, &schema).await?;
        info!(
            old_server_id,
            new_server_id,
            %new_position,
            "chained schema snapshot across server identities"
        );
        Ok(Some(new_id))
    }

    async fn compact(&self, server_id: u64, watermark: &Position) -> Result<usize> {
        let mut conn = self.pool.get_conn().await.map_err(MillraceError::from_mysql)?;
        let Some(target) = self.entry_id_at(&mut conn, server_id, watermark).await? else {
            return Ok(0);
        };
        let Some((_, position, _, deltas, _, _)) = self.entry_header(&mut conn, target).await?
        else {
            return Ok(0);
        };

        if deltas.is_some() {
            // fold the chain into a full snapshot at the same position
            let schema = self.materialize(&mut conn, target).await?;
            drop(conn);
            self.insert_full(server_id, &position, &schema).await?;
            conn = self.pool.get_conn().await.map_err(MillraceError::from_mysql)?;
            // the freshly inserted snapshot has a larger id and the same
            // position, so it wins future entry_id_at lookups and the
            // delta entry below it becomes garbage
        }

        let dropped: u64 = {
            conn.exec_drop(
                format!(
                    "DELETE s, d, t, c FROM {} s \
                     LEFT JOIN {} d ON d.schema_id = s.id \
                     LEFT JOIN {} t ON t.schema_id = s.id \
                     LEFT JOIN {} c ON c.schema_id = s.id \
                     WHERE s.server_id = ? AND s.id < ?",
                    self.table("schemas"),
                    self.table("databases"),
                    self.table("tables"),
                    self.table("columns")
                ),
                (server_id, target),
            )
            .await
            .map_err(MillraceError::from_mysql)?;
            conn.affected_rows()
        };
        if dropped > 0 {
            info!(server_id, dropped, "compacted schema chain");
        }
        Ok(dropped as usize)
    }
}
