//! Replicator loop
//!
//! Single-threaded core of the pipeline: fetch event, classify, then
//! decode-and-emit for DML, parse-apply-persist for DDL, commit for
//! heartbeats. Schema mutation and position advancement happen nowhere
//! else, which is what makes the ordering guarantees hold.
//!
//! ```text
//! INIT ──(position resolved)──▶ RUNNING ──(fatal error)──▶ FAILED
//!                                  │
//!                                  ├─(DML)──────▶ decode, emit, advance
//!                                  ├─(DDL)──────▶ parse, apply, persist, advance
//!                                  ├─(HEARTBEAT)▶ commit position
//!                                  ├─(ROTATE)───▶ switch binlog file
//!                                  └─(shutdown)─▶ STOPPING ──▶ STOPPED
//! ```
//!
//! The cursor is advanced in memory only after the producer acknowledges
//! a record, and made durable at heartbeat boundaries, so the durable
//! lag is bounded by the heartbeat interval and a restart never re-emits
//! a record at or before the committed position.

use crate::backoff::Backoff;
use crate::error::{ColumnCastError, MillraceError, Result};
use crate::filter::{pattern_match, TableFilter};
use crate::position::{GtidSet, Position};
use crate::producer::{Producer, RecordKind, RowRecord};
use crate::replication::client::BinlogClient;
use crate::replication::event::{BinlogEvent, EventEnvelope, RowImage};
use crate::replication::heartbeat::HeartbeatRow;
use crate::schema::ddl;
use crate::schema::model::{Schema, Table};
use crate::store::position_store::{PositionStore, SharedPositionStore};
use crate::store::schema_store::{SchemaStore, SharedSchemaStore};
use async_trait::async_trait;
use serde_json::Map;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Replicator lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// Re-introspects live table definitions for the cast-error protocol.
#[async_trait]
pub trait LiveSchemaSource: Send + Sync {
    async fn capture_table(&self, database: &str, table: &str) -> Result<Option<Table>>;
}

/// Live source backed by the upstream connection pool.
pub struct MysqlLiveSchema {
    pool: mysql_async::Pool,
}

impl MysqlLiveSchema {
    pub fn new(pool: mysql_async::Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LiveSchemaSource for MysqlLiveSchema {
    async fn capture_table(&self, database: &str, table: &str) -> Result<Option<Table>> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(MillraceError::from_mysql)?;
        crate::schema::capture::capture_table(&mut conn, database, table).await
    }
}

/// Replicator configuration.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    pub client_id: String,
    /// The companion metadata database; row events against it are the
    /// pipeline's own writes (heartbeats, cursors) and are never
    /// forwarded.
    pub metadata_database: String,
    pub gtid_mode: bool,
    pub filter: TableFilter,
    /// DDL the parser cannot understand terminates the pipeline unless
    /// it matches one of these patterns, in which case it is skipped
    /// with a warning.
    pub ddl_skip_patterns: Vec<String>,
}

/// Control handle held by the owner of the loop.
pub struct ReplicatorHandle {
    stop_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<RunState>,
}

impl ReplicatorHandle {
    /// Request a graceful stop; observed at the next suspension point.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn state(&self) -> RunState {
        *self.state_rx.borrow()
    }
}

/// Mutable loop state, advanced one event at a time.
struct LoopContext {
    schema: Schema,
    schema_entry_id: u64,
    /// Where the stream resumes if we die now: advanced only after the
    /// producer ack (DML) or store write (DDL).
    position: Position,
    gtid_set: Option<GtidSet>,
    table_map: HashMap<u64, (String, String)>,
}

impl LoopContext {
    /// Advance the in-memory cursor past an event.
    fn advance(&mut self, env: &EventEnvelope) {
        self.position.binlog = env.next_position.clone();
        if let Some(set) = &self.gtid_set {
            self.position.gtid_set = Some(set.to_string());
        }
    }
}

/// The replication pipeline state machine.
pub struct Replicator {
    config: ReplicatorConfig,
    server_id: u64,
    initial_position: Position,
    client: Arc<dyn BinlogClient>,
    producer: Arc<dyn Producer>,
    schema_store: SharedSchemaStore,
    position_store: SharedPositionStore,
    live_schema: Option<Arc<dyn LiveSchemaSource>>,
    stop_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<RunState>,
}

impl Replicator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ReplicatorConfig,
        server_id: u64,
        initial_position: Position,
        client: Arc<dyn BinlogClient>,
        producer: Arc<dyn Producer>,
        schema_store: SharedSchemaStore,
        position_store: SharedPositionStore,
        live_schema: Option<Arc<dyn LiveSchemaSource>>,
    ) -> (Self, ReplicatorHandle) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(RunState::Init);
        (
            Self {
                config,
                server_id,
                initial_position,
                client,
                producer,
                schema_store,
                position_store,
                live_schema,
                stop_rx,
                state_tx,
            },
            ReplicatorHandle { stop_tx, state_rx },
        )
    }

    fn set_state(&self, state: RunState) {
        let _ = self.state_tx.send(state);
    }

    fn stopping(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Run until shutdown or a fatal error.
    pub async fn run(mut self) -> Result<()> {
        let result = self.run_inner().await;
        match &result {
            Ok(()) => self.set_state(RunState::Stopped),
            Err(e) => {
                error!(error = %e, "replicator terminated");
                self.set_state(RunState::Failed);
            }
        }
        result
    }

    async fn run_inner(&mut self) -> Result<()> {
        let (schema_entry_id, schema) = self
            .schema_store
            .schema_at(self.server_id, &self.initial_position)
            .await?
            .ok_or_else(|| {
                MillraceError::store(format!(
                    "no schema snapshot at or before {}; capture one first",
                    self.initial_position
                ))
            })?;

        let mut ctx = LoopContext {
            schema,
            schema_entry_id,
            position: self.initial_position.clone(),
            gtid_set: self
                .initial_position
                .gtid_set
                .as_deref()
                .and_then(GtidSet::parse),
            table_map: HashMap::new(),
        };
        self.set_state(RunState::Running);
        info!(position = %ctx.position, "replicator running");

        let mut backoff = Backoff::default();
        'reconnect: loop {
            let mut rx = match self.client.connect(&ctx.position).await {
                Ok(rx) => rx,
                Err(e) if e.is_retriable() && !self.stopping() => {
                    let Some(delay) = backoff.next_delay() else {
                        return Err(MillraceError::connect_lost(format!(
                            "reconnect budget exhausted: {e}"
                        )));
                    };
                    warn!(error = %e, ?delay, "binlog connect failed, backing off");
                    tokio::time::sleep(delay).await;
                    continue 'reconnect;
                }
                Err(e) => return Err(e),
            };
            backoff.reset();

            loop {
                if self.stopping() {
                    break 'reconnect;
                }
                let env = tokio::select! {
                    env = rx.recv() => env,
                    changed = self.stop_rx.changed() => {
                        if changed.is_err() {
                            // control handle dropped; treat as shutdown
                            break 'reconnect;
                        }
                        continue;
                    }
                };
                let Some(env) = env else {
                    if self.stopping() {
                        break 'reconnect;
                    }
                    warn!(position = %ctx.position, "binlog stream ended, reconnecting");
                    let Some(delay) = backoff.next_delay() else {
                        return Err(MillraceError::connect_lost(
                            "binlog stream kept ending; reconnect budget exhausted",
                        ));
                    };
                    tokio::time::sleep(delay).await;
                    continue 'reconnect;
                };
                self.handle_event(&mut ctx, env).await?;
            }
        }

        // graceful drain: every emitted record is already acked, so the
        // current in-memory cursor is safe to commit
        self.set_state(RunState::Stopping);
        self.producer.flush().await?;
        self.position_store.set(&ctx.position).await?;
        info!(position = %ctx.position, "replicator stopped cleanly");
        Ok(())
    }

    async fn handle_event(&self, ctx: &mut LoopContext, env: EventEnvelope) -> Result<()> {
        match &env.event {
            BinlogEvent::TableMap {
                table_id,
                database,
                table,
            } => {
                ctx.table_map
                    .insert(*table_id, (database.clone(), table.clone()));
                ctx.advance(&env);
            }

            BinlogEvent::WriteRows { table_id, rows } => {
                self.handle_rows(ctx, &env, *table_id, RecordKind::Insert, None, rows)
                    .await?;
            }
            BinlogEvent::DeleteRows { table_id, rows } => {
                self.handle_rows(ctx, &env, *table_id, RecordKind::Delete, None, rows)
                    .await?;
            }
            BinlogEvent::UpdateRows { table_id, rows } => {
                let (befores, afters): (Vec<_>, Vec<_>) = rows.iter().cloned().unzip();
                self.handle_rows(ctx, &env, *table_id, RecordKind::Update, Some(&befores), &afters)
                    .await?;
            }

            BinlogEvent::Query { database, sql } => {
                self.handle_query(ctx, &env, database.as_deref(), sql).await?;
            }

            BinlogEvent::Rotate {
                next_file,
                next_offset,
            } => {
                debug!(%next_file, "binlog rotated");
                ctx.position.binlog.file = next_file.clone();
                ctx.position.binlog.offset = *next_offset;
            }

            BinlogEvent::Xid { xid } => {
                // commit marker: rows of the transaction are already
                // acked, the cursor may move past it
                debug!(xid = *xid, "transaction committed");
                ctx.advance(&env);
            }

            BinlogEvent::Gtid { gtid } => {
                if self.config.gtid_mode {
                    let set = ctx.gtid_set.get_or_insert_with(GtidSet::default);
                    if !set.add(gtid) {
                        warn!(%gtid, "ignoring malformed GTID");
                    }
                }
                ctx.advance(&env);
            }

            BinlogEvent::Heartbeat => {
                // server liveness only; carries no position worth keeping
            }
        }
        Ok(())
    }

    async fn handle_rows(
        &self,
        ctx: &mut LoopContext,
        env: &EventEnvelope,
        table_id: u64,
        kind: RecordKind,
        befores: Option<&[RowImage]>,
        images: &[RowImage],
    ) -> Result<()> {
        let Some((database, table)) = ctx.table_map.get(&table_id).cloned() else {
            return Err(MillraceError::upstream(format!(
                "row event for unmapped table id {table_id} at {}",
                env.position
            )));
        };

        // writes against the metadata database are the pipeline's own:
        // heartbeat markers commit the cursor, everything else is noise
        if database.eq_ignore_ascii_case(&self.config.metadata_database) {
            if table.eq_ignore_ascii_case("heartbeats") {
                self.handle_heartbeat_rows(ctx, env, images).await?;
            } else {
                ctx.advance(env);
            }
            return Ok(());
        }

        if !self.config.filter.matches(&database, &table) {
            ctx.advance(env);
            return Ok(());
        }

        let tracked = ctx.schema.find_table(&database, &table).ok_or_else(|| {
            MillraceError::SchemaSync(crate::error::SchemaSyncError::MissingTable {
                database: database.clone(),
                table: table.clone(),
            })
        })?;

        let mut records = Vec::with_capacity(images.len());
        for (index, image) in images.iter().enumerate() {
            let data = match self.decode_image(tracked, &database, &table, image) {
                Ok(data) => data,
                Err(cast) => return self.handle_cast_error(ctx, cast).await,
            };
            let mut record = RowRecord::new(
                database.clone(),
                table.clone(),
                kind,
                env.timestamp,
                &Position {
                    binlog: env.position.clone(),
                    gtid_set: None,
                    last_heartbeat: None,
                },
            )
            .with_data(data);
            if let Some(befores) = befores {
                if let Some(before) = befores.get(index) {
                    let old = match self.decode_image(tracked, &database, &table, before) {
                        Ok(old) => old,
                        Err(cast) => return self.handle_cast_error(ctx, cast).await,
                    };
                    record = record.with_old(old);
                }
            }
            records.push(record);
        }

        // per-record ack, in emission order; the cursor moves only after
        // the whole event is acknowledged
        for record in records {
            self.producer
                .enqueue(record)
                .await
                .map_err(|e| MillraceError::producer(e.to_string()))?;
        }
        ctx.advance(env);
        Ok(())
    }

    fn decode_image(
        &self,
        tracked: &Table,
        database: &str,
        table: &str,
        image: &RowImage,
    ) -> std::result::Result<Map<String, serde_json::Value>, ColumnCastError> {
        let cells = image.cells();
        if cells.len() > tracked.columns.len() {
            return Err(ColumnCastError {
                database: database.to_string(),
                table: table.to_string(),
                column: format!("ordinal {}", tracked.columns.len()),
                expected: format!("{} tracked columns", tracked.columns.len()),
                found: format!("{} cells in row image", cells.len()),
            });
        }
        let mut data = Map::new();
        for (def, cell) in tracked.columns.iter().zip(cells.iter()) {
            let value = def.decode(database, table, cell)?;
            data.insert(def.name.clone(), value);
        }
        Ok(data)
    }

    /// The cast-error protocol: pause, re-introspect the live table,
    /// log every divergence between it and the mirror, then terminate.
    /// Deliberately no silent re-sync; drift of unknown provenance
    /// cannot be repaired without breaking ordering.
    async fn handle_cast_error(&self, ctx: &LoopContext, cast: ColumnCastError) -> Result<()> {
        error!(
            database = %cast.database,
            table = %cast.table,
            column = %cast.column,
            "decode mismatch, checking for schema inconsistencies"
        );

        if let Some(live) = &self.live_schema {
            match live.capture_table(&cast.database, &cast.table).await {
                Ok(Some(actual)) => {
                    let mut diffs = Vec::new();
                    if let Some(tracked) = ctx.schema.find_table(&cast.database, &cast.table) {
                        tracked.diff(&mut diffs, &actual, "tracked", "live");
                    }
                    if diffs.is_empty() {
                        error!("no differences found between tracked and live definitions");
                    }
                    for diff in diffs {
                        error!("{diff}");
                    }
                }
                Ok(None) => error!(
                    "table {}.{} no longer exists upstream",
                    cast.database, cast.table
                ),
                Err(e) => warn!(error = %e, "could not re-introspect the live table"),
            }
        }
        Err(cast.into())
    }

    async fn handle_heartbeat_rows(
        &self,
        ctx: &mut LoopContext,
        env: &EventEnvelope,
        images: &[RowImage],
    ) -> Result<()> {
        let mut observed = None;
        for image in images {
            if let Some(row) = HeartbeatRow::from_image(image) {
                if row.client_id == self.config.client_id {
                    observed = Some(row.heartbeat_id);
                }
            }
        }
        ctx.advance(env);

        if let Some(heartbeat_id) = observed {
            ctx.position.last_heartbeat = Some(heartbeat_id);
            // the durable commit: everything emitted before this marker
            // has been acknowledged, so the cursor may advance
            self.position_store.set(&ctx.position).await?;
            debug!(heartbeat_id, position = %ctx.position, "heartbeat committed");
        }
        Ok(())
    }

    async fn handle_query(
        &self,
        ctx: &mut LoopContext,
        env: &EventEnvelope,
        database: Option<&str>,
        sql: &str,
    ) -> Result<()> {
        // a crash between a DDL store write and the next heartbeat
        // commit replays the event; its first processing is on record,
        // so adopt that instead of re-applying
        let event_position = Position {
            binlog: env.position.clone(),
            gtid_set: ctx.position.gtid_set.clone(),
            last_heartbeat: ctx.position.last_heartbeat,
        };
        if let Some((entry_id, schema)) = self
            .schema_store
            .entry_at_exact(self.server_id, &event_position)
            .await?
        {
            debug!(position = %event_position, "DDL already persisted, adopting stored schema");
            ctx.schema = schema;
            ctx.schema_entry_id = entry_id;
            ctx.advance(env);
            return Ok(());
        }

        let deltas = match ddl::parse(sql, database) {
            Ok(deltas) => deltas,
            Err(parse_err) => {
                if self
                    .config
                    .ddl_skip_patterns
                    .iter()
                    .any(|p| pattern_match(p, sql))
                {
                    warn!(sql, error = %parse_err, "skipping whitelisted unparseable DDL");
                    ctx.advance(env);
                    return Ok(());
                }
                return Err(parse_err.into());
            }
        };

        if deltas.is_empty() {
            ctx.advance(env);
            return Ok(());
        }

        // apply every delta to a working snapshot first; the event is
        // processed only if the whole statement applies
        let mut next = ctx.schema.copy();
        for delta in &deltas {
            next = delta.apply(&next)?;
        }

        let entry_id = self
            .schema_store
            .save_deltas(self.server_id, ctx.schema_entry_id, &event_position, &deltas)
            .await?;

        // swap the in-memory pointer only after the store write
        ctx.schema = next;
        ctx.schema_entry_id = entry_id;
        ctx.advance(env);
        info!(count = deltas.len(), position = %event_position, "applied DDL");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::BinlogPosition;
    use crate::producer::MemoryProducer;
    use crate::replication::client::StaticBinlogClient;
    use crate::schema::columndef::{CellValue, ColumnDef};
    use crate::schema::delta::SchemaDelta;
    use crate::schema::model::{CaseSensitivity, Schema, Table};
    use crate::store::position_store::{MemoryPositionStore, PositionStore as _};
    use crate::store::schema_store::{MemorySchemaStore, SchemaStore as _};

    fn test_config() -> ReplicatorConfig {
        ReplicatorConfig {
            client_id: "millrace".into(),
            metadata_database: "millrace".into(),
            gtid_mode: false,
            filter: TableFilter::default(),
            ddl_skip_patterns: Vec::new(),
        }
    }

    fn users_schema() -> Schema {
        let schema = SchemaDelta::CreateDatabase {
            name: "d".into(),
            charset: None,
            if_not_exists: false,
        }
        .apply(&Schema::new(CaseSensitivity::Sensitive))
        .unwrap();
        SchemaDelta::CreateTable {
            database: "d".into(),
            table: Table::new("d", "u")
                .with_columns(vec![ColumnDef::int("id"), ColumnDef::varchar("name", 32)]),
            if_not_exists: false,
        }
        .apply(&schema)
        .unwrap()
    }

    fn envelope(file: &str, offset: u64, next: u64, event: BinlogEvent) -> EventEnvelope {
        EventEnvelope::new(
            BinlogPosition::new(file, offset),
            BinlogPosition::new(file, next),
            10,
            1_700_000_000,
            event,
        )
    }

    struct Harness {
        producer: Arc<MemoryProducer>,
        positions: Arc<MemoryPositionStore>,
        schemas: Arc<MemorySchemaStore>,
    }

    async fn run_events(events: Vec<EventEnvelope>) -> (Result<()>, Harness) {
        run_events_with(test_config(), events, None).await
    }

    async fn run_events_with(
        config: ReplicatorConfig,
        events: Vec<EventEnvelope>,
        live: Option<Arc<dyn LiveSchemaSource>>,
    ) -> (Result<()>, Harness) {
        let producer = Arc::new(MemoryProducer::new());
        let positions = Arc::new(MemoryPositionStore::new(10, "millrace"));
        let schemas = Arc::new(MemorySchemaStore::new());
        let initial = Position::new("mysql-bin.000001", 4);
        schemas
            .save_full(10, &initial, &users_schema())
            .await
            .unwrap();

        let client = Arc::new(StaticBinlogClient::new(10).with_file("mysql-bin.000001", events));
        let (replicator, handle) = Replicator::new(
            config,
            10,
            initial,
            client,
            producer.clone(),
            schemas.clone(),
            positions.clone(),
            live,
        );

        // the static stream ends after replay; ask for a stop so the
        // loop drains instead of reconnecting forever
        let runner = tokio::spawn(replicator.run());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        handle.stop();
        let result = runner.await.unwrap();
        (
            result,
            Harness {
                producer,
                positions,
                schemas,
            },
        )
    }

    fn table_map(offset: u64, next: u64) -> EventEnvelope {
        envelope(
            "mysql-bin.000001",
            offset,
            next,
            BinlogEvent::TableMap {
                table_id: 7,
                database: "d".into(),
                table: "u".into(),
            },
        )
    }

    #[tokio::test]
    async fn simple_insert_is_decoded_and_emitted() {
        let events = vec![
            table_map(4, 60),
            envelope(
                "mysql-bin.000001",
                60,
                150,
                BinlogEvent::WriteRows {
                    table_id: 7,
                    rows: vec![RowImage::new(vec![
                        CellValue::Int(42),
                        CellValue::Text("x".into()),
                    ])],
                },
            ),
        ];
        let (result, harness) = run_events(events).await;
        result.unwrap();

        let records = harness.producer.records().await;
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.database, "d");
        assert_eq!(record.table, "u");
        assert_eq!(record.kind, RecordKind::Insert);
        assert_eq!(record.data["id"], serde_json::json!(42));
        assert_eq!(record.data["name"], serde_json::json!("x"));
    }

    #[tokio::test]
    async fn add_column_mid_stream() {
        let events = vec![
            table_map(4, 60),
            envelope(
                "mysql-bin.000001",
                60,
                150,
                BinlogEvent::WriteRows {
                    table_id: 7,
                    rows: vec![RowImage::new(vec![
                        CellValue::Int(1),
                        CellValue::Text("a".into()),
                    ])],
                },
            ),
            envelope(
                "mysql-bin.000001",
                150,
                260,
                BinlogEvent::Query {
                    database: Some("d".into()),
                    sql: "ALTER TABLE u ADD COLUMN age INT".into(),
                },
            ),
            table_map(260, 300),
            envelope(
                "mysql-bin.000001",
                300,
                420,
                BinlogEvent::WriteRows {
                    table_id: 7,
                    rows: vec![RowImage::new(vec![
                        CellValue::Int(2),
                        CellValue::Text("b".into()),
                        CellValue::Int(30),
                    ])],
                },
            ),
        ];
        let (result, harness) = run_events(events).await;
        result.unwrap();

        let records = harness.producer.records().await;
        assert_eq!(records.len(), 2);
        assert!(records[0].data.get("age").is_none());
        assert_eq!(records[1].data["age"], serde_json::json!(30));

        // the delta was persisted keyed by the DDL event's position
        let (_, schema) = harness
            .schemas
            .schema_at(10, &Position::new("mysql-bin.000001", 150))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(schema.find_table("d", "u").unwrap().columns.len(), 3);
        let (_, schema) = harness
            .schemas
            .schema_at(10, &Position::new("mysql-bin.000001", 100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(schema.find_table("d", "u").unwrap().columns.len(), 2);
    }

    #[tokio::test]
    async fn replayed_ddl_adopts_stored_entry() {
        // process the DDL once...
        let ddl_event = envelope(
            "mysql-bin.000001",
            40,
            150,
            BinlogEvent::Query {
                database: Some("d".into()),
                sql: "CREATE TABLE fresh (id INT)".into(),
            },
        );
        let (result, harness) = run_events(vec![ddl_event.clone()]).await;
        result.unwrap();
        let entries = harness.schemas.entry_count().await;

        // ...then replay it against the same store: no new entry, no
        // duplicate-name failure
        let positions = Arc::new(MemoryPositionStore::new(10, "millrace"));
        let client = Arc::new(
            StaticBinlogClient::new(10).with_file("mysql-bin.000001", vec![ddl_event]),
        );
        let (replicator, handle) = Replicator::new(
            test_config(),
            10,
            Position::new("mysql-bin.000001", 4),
            client,
            Arc::new(MemoryProducer::new()),
            harness.schemas.clone(),
            positions,
            None,
        );
        let runner = tokio::spawn(replicator.run());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        handle.stop();
        runner.await.unwrap().unwrap();

        assert_eq!(harness.schemas.entry_count().await, entries);
    }

    #[tokio::test]
    async fn heartbeat_commits_position() {
        let events = vec![
            envelope(
                "mysql-bin.000001",
                4,
                60,
                BinlogEvent::TableMap {
                    table_id: 99,
                    database: "millrace".into(),
                    table: "heartbeats".into(),
                },
            ),
            envelope(
                "mysql-bin.000001",
                60,
                140,
                BinlogEvent::WriteRows {
                    table_id: 99,
                    rows: vec![RowImage::new(vec![
                        CellValue::UInt(10),
                        CellValue::Text("millrace".into()),
                        CellValue::UInt(7),
                    ])],
                },
            ),
        ];
        let (result, harness) = run_events(events).await;
        result.unwrap();

        let committed = harness.positions.get().await.unwrap().unwrap();
        assert_eq!(committed.last_heartbeat, Some(7));
        assert!(committed.binlog.offset >= 140);

        // marker rows never reach the producer
        assert!(harness.producer.records().await.is_empty());
    }

    #[tokio::test]
    async fn foreign_heartbeats_are_not_committed() {
        let events = vec![
            envelope(
                "mysql-bin.000001",
                4,
                60,
                BinlogEvent::TableMap {
                    table_id: 99,
                    database: "millrace".into(),
                    table: "heartbeats".into(),
                },
            ),
            envelope(
                "mysql-bin.000001",
                60,
                140,
                BinlogEvent::WriteRows {
                    table_id: 99,
                    rows: vec![RowImage::new(vec![
                        CellValue::UInt(10),
                        CellValue::Text("someone-else".into()),
                        CellValue::UInt(9),
                    ])],
                },
            ),
        ];
        let (result, harness) = run_events(events).await;
        result.unwrap();

        // the clean-shutdown commit stores a position, but no heartbeat
        let committed = harness.positions.get().await.unwrap().unwrap();
        assert_eq!(committed.last_heartbeat, None);
    }

    #[tokio::test]
    async fn update_carries_before_image() {
        let events = vec![
            table_map(4, 60),
            envelope(
                "mysql-bin.000001",
                60,
                170,
                BinlogEvent::UpdateRows {
                    table_id: 7,
                    rows: vec![(
                        RowImage::new(vec![CellValue::Int(1), CellValue::Text("old".into())]),
                        RowImage::new(vec![CellValue::Int(1), CellValue::Text("new".into())]),
                    )],
                },
            ),
        ];
        let (result, harness) = run_events(events).await;
        result.unwrap();

        let records = harness.producer.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, RecordKind::Update);
        assert_eq!(records[0].data["name"], serde_json::json!("new"));
        assert_eq!(records[0].old.as_ref().unwrap()["name"], serde_json::json!("old"));
    }

    #[tokio::test]
    async fn duplicate_create_table_is_fatal() {
        let events = vec![envelope(
            "mysql-bin.000001",
            4,
            90,
            BinlogEvent::Query {
                database: Some("d".into()),
                sql: "CREATE TABLE u (id INT)".into(),
            },
        )];
        let (result, _) = run_events(events).await;
        let err = result.unwrap_err();
        assert!(matches!(err, MillraceError::SchemaSync(_)));
    }

    struct DriftedLive;

    #[async_trait]
    impl LiveSchemaSource for DriftedLive {
        async fn capture_table(&self, database: &str, table: &str) -> Result<Option<Table>> {
            Ok(Some(Table::new(database, table).with_columns(vec![
                ColumnDef::varchar("id", 16),
                ColumnDef::varchar("name", 32),
            ])))
        }
    }

    #[tokio::test]
    async fn cast_mismatch_diffs_and_terminates() {
        let events = vec![
            table_map(4, 60),
            envelope(
                "mysql-bin.000001",
                60,
                150,
                BinlogEvent::WriteRows {
                    table_id: 7,
                    // a string where the tracked `id INT` expects a number
                    rows: vec![RowImage::new(vec![
                        CellValue::Text("oops".into()),
                        CellValue::Text("x".into()),
                    ])],
                },
            ),
        ];
        let (result, harness) =
            run_events_with(test_config(), events, Some(Arc::new(DriftedLive))).await;
        let err = result.unwrap_err();
        match err {
            MillraceError::ColumnCast(cast) => {
                assert_eq!(cast.table, "u");
                assert_eq!(cast.column, "id");
            }
            other => panic!("expected ColumnCast, got {other}"),
        }
        assert!(harness.producer.records().await.is_empty());
    }

    #[tokio::test]
    async fn filtered_tables_are_skipped() {
        let mut config = test_config();
        config.filter = TableFilter::parse("!d.u").unwrap();
        let events = vec![
            table_map(4, 60),
            envelope(
                "mysql-bin.000001",
                60,
                150,
                BinlogEvent::WriteRows {
                    table_id: 7,
                    rows: vec![RowImage::new(vec![
                        CellValue::Int(1),
                        CellValue::Text("a".into()),
                    ])],
                },
            ),
        ];
        let (result, harness) = run_events_with(config, events, None).await;
        result.unwrap();
        assert!(harness.producer.records().await.is_empty());
    }

    #[tokio::test]
    async fn unparseable_ddl_respects_skip_patterns() {
        let mut config = test_config();
        config.ddl_skip_patterns = vec!["*FROBNICATE*".into()];
        let events = vec![envelope(
            "mysql-bin.000001",
            4,
            90,
            BinlogEvent::Query {
                database: Some("d".into()),
                sql: "ALTER TABLE u FROBNICATE".into(),
            },
        )];
        let (result, _) = run_events_with(config, events, None).await;
        result.unwrap();

        // without the pattern the same statement is fatal
        let events = vec![envelope(
            "mysql-bin.000001",
            4,
            90,
            BinlogEvent::Query {
                database: Some("d".into()),
                sql: "ALTER TABLE u FROBNICATE".into(),
            },
        )];
        let (result, _) = run_events(events).await;
        assert!(matches!(result.unwrap_err(), MillraceError::DdlParse(_)));
    }

    #[tokio::test]
    async fn producer_nack_is_fatal() {
        let producer = Arc::new(MemoryProducer::new());
        producer.set_failing(true);
        let positions = Arc::new(MemoryPositionStore::new(10, "millrace"));
        let schemas = Arc::new(MemorySchemaStore::new());
        let initial = Position::new("mysql-bin.000001", 4);
        schemas.save_full(10, &initial, &users_schema()).await.unwrap();

        let events = vec![
            table_map(4, 60),
            envelope(
                "mysql-bin.000001",
                60,
                150,
                BinlogEvent::WriteRows {
                    table_id: 7,
                    rows: vec![RowImage::new(vec![
                        CellValue::Int(1),
                        CellValue::Text("a".into()),
                    ])],
                },
            ),
        ];
        let client = Arc::new(StaticBinlogClient::new(10).with_file("mysql-bin.000001", events));
        let (replicator, _handle) = Replicator::new(
            test_config(),
            10,
            initial,
            client,
            producer,
            schemas,
            positions,
            None,
        );
        let err = replicator.run().await.unwrap_err();
        assert!(matches!(err, MillraceError::Producer(_)));
    }
}
