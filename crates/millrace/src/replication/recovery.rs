//! Initial-position resolution and master-failover recovery
//!
//! The replication cursor is resolved by consulting, in this exact
//! order:
//!
//! 1. the durable position for this (client, server) pair;
//! 2. when master recovery is enabled and a prior server identity left
//!    a recovery candidate, the new primary's binlog is searched for the
//!    candidate's heartbeat row; on a hit the old identity's schema is
//!    cloned under the new one and the stream resumes right after the
//!    heartbeat;
//! 3. the newest position a retired client committed against the same
//!    server, so DDL between its last position and now is not lost;
//! 4. the current tail of the upstream binlog.

use crate::error::Result;
use crate::position::{BinlogPosition, Position, RecoveryInfo};
use crate::replication::client::BinlogClient;
use crate::replication::event::BinlogEvent;
use crate::replication::heartbeat::HeartbeatRow;
use crate::store::position_store::PositionStore;
use crate::store::schema_store::SchemaStore;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// What the coordinator needs to know about this deployment.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub client_id: String,
    /// Name of the companion metadata database; its `heartbeats` table
    /// is the marker table.
    pub metadata_database: String,
    /// Attempt master-failover recovery before falling back.
    pub master_recovery: bool,
    pub gtid_mode: bool,
}

/// Resolves where replication starts.
pub struct Recovery<'a> {
    client: &'a dyn BinlogClient,
    position_store: &'a dyn PositionStore,
    schema_store: &'a dyn SchemaStore,
    config: RecoveryConfig,
}

impl<'a> Recovery<'a> {
    pub fn new(
        client: &'a dyn BinlogClient,
        position_store: &'a dyn PositionStore,
        schema_store: &'a dyn SchemaStore,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            client,
            position_store,
            schema_store,
            config,
        }
    }

    /// Resolve the initial cursor and make it durable.
    pub async fn resolve_initial_position(&self) -> Result<Position> {
        let stored = self.position_store.get().await?;

        let position = match stored {
            Some(position) => position,
            None => {
                let mut resolved = None;

                if self.config.master_recovery {
                    resolved = self.attempt_master_recovery().await?;
                }

                if resolved.is_none() {
                    resolved = self.position_store.other_client_position().await?;
                    if let Some(p) = &resolved {
                        info!(position = %p, "adopting a previous client's position");
                    }
                }

                let resolved = match resolved {
                    Some(p) => p,
                    None => {
                        let p = self.client.latest_position(self.config.gtid_mode).await?;
                        info!(position = %p, "capturing the current upstream position");
                        p
                    }
                };

                self.position_store.set(&resolved).await?;
                resolved
            }
        };

        if self.config.master_recovery {
            self.position_store.cleanup_old_recovery_infos().await?;
        }
        Ok(position)
    }

    /// Master-failover recovery: find the last committed heartbeat in
    /// the new primary's binlog, chain the schema across the identity
    /// change and resume at the event after the heartbeat. `None` means
    /// no candidate or no hit, and the caller falls through.
    async fn attempt_master_recovery(&self) -> Result<Option<Position>> {
        let Some(info) = self.position_store.recovery_info().await? else {
            debug!("no recovery candidate from a prior server identity");
            return Ok(None);
        };

        let new_server_id = self.client.server_id().await?;
        info!(
            old_server_id = info.server_id,
            new_server_id,
            heartbeat_id = info.heartbeat_id,
            "attempting master recovery"
        );

        let Some((found_at, resume_at)) = self.find_heartbeat(&info).await? else {
            warn!(
                heartbeat_id = info.heartbeat_id,
                "heartbeat not found in the new primary's binlog; falling through"
            );
            return Ok(None);
        };

        // The cloned snapshot is keyed at the heartbeat row's start
        // position while the stream resumes at the event after it, so
        // the snapshot key stays <= the resume position and the first
        // decode after resume sees the chained schema.
        let snapshot_key = Position {
            binlog: found_at.clone(),
            gtid_set: None,
            last_heartbeat: Some(info.heartbeat_id),
        };
        self.schema_store
            .clone_for_server(info.server_id, &info.position, new_server_id, &snapshot_key)
            .await?;

        info!(
            heartbeat_id = info.heartbeat_id,
            found_at = %found_at,
            resume_at = %resume_at,
            "master recovery succeeded"
        );
        Ok(Some(Position {
            binlog: resume_at,
            gtid_set: None,
            last_heartbeat: Some(info.heartbeat_id),
        }))
    }

    /// Scan the new primary's retained binlogs, newest file first, for
    /// the marker row carrying our client id and the candidate
    /// heartbeat. Returns (heartbeat event position, position after it).
    async fn find_heartbeat(
        &self,
        info: &RecoveryInfo,
    ) -> Result<Option<(BinlogPosition, BinlogPosition)>> {
        let files = self.client.binlog_files().await?;
        for file in files.iter().rev() {
            debug!(%file, "scanning binlog for the recovery heartbeat");
            let mut rx = self.client.connect(&Position::new(file.clone(), 4)).await?;
            let mut table_map: HashMap<u64, (String, String)> = HashMap::new();
            let mut hit: Option<(BinlogPosition, BinlogPosition)> = None;

            while let Some(env) = rx.recv().await {
                if env.position.file != *file {
                    break;
                }
                match &env.event {
                    BinlogEvent::TableMap {
                        table_id,
                        database,
                        table,
                    } => {
                        table_map.insert(*table_id, (database.clone(), table.clone()));
                    }
                    BinlogEvent::WriteRows { table_id, rows } => {
                        if self.is_marker_table(&table_map, *table_id) {
                            for row in rows {
                                if self.matches(info, HeartbeatRow::from_image(row)) {
                                    hit = Some((
                                        env.position.clone(),
                                        env.next_position.clone(),
                                    ));
                                }
                            }
                        }
                    }
                    BinlogEvent::UpdateRows { table_id, rows } => {
                        if self.is_marker_table(&table_map, *table_id) {
                            for (_, after) in rows {
                                if self.matches(info, HeartbeatRow::from_image(after)) {
                                    hit = Some((
                                        env.position.clone(),
                                        env.next_position.clone(),
                                    ));
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }

            if hit.is_some() {
                return Ok(hit);
            }
        }
        Ok(None)
    }

    fn is_marker_table(&self, table_map: &HashMap<u64, (String, String)>, table_id: u64) -> bool {
        table_map
            .get(&table_id)
            .map(|(db, table)| {
                db.eq_ignore_ascii_case(&self.config.metadata_database)
                    && table.eq_ignore_ascii_case("heartbeats")
            })
            .unwrap_or(false)
    }

    fn matches(&self, info: &RecoveryInfo, row: Option<HeartbeatRow>) -> bool {
        row.map(|r| r.client_id == self.config.client_id && r.heartbeat_id == info.heartbeat_id)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::client::StaticBinlogClient;
    use crate::replication::event::{EventEnvelope, RowImage};
    use crate::schema::columndef::{CellValue, ColumnDef};
    use crate::schema::delta::SchemaDelta;
    use crate::schema::model::{CaseSensitivity, Schema, Table};
    use crate::store::position_store::{
        MemoryPositionBacking, MemoryPositionStore, PositionStore as _,
    };
    use crate::store::schema_store::{MemorySchemaBacking, MemorySchemaStore, SchemaStore as _};

    fn config() -> RecoveryConfig {
        RecoveryConfig {
            client_id: "millrace".into(),
            metadata_database: "millrace".into(),
            master_recovery: true,
            gtid_mode: false,
        }
    }

    fn envelope(
        server_id: u64,
        file: &str,
        offset: u64,
        next: u64,
        event: BinlogEvent,
    ) -> EventEnvelope {
        EventEnvelope::new(
            BinlogPosition::new(file, offset),
            BinlogPosition::new(file, next),
            server_id,
            0,
            event,
        )
    }

    fn heartbeat_events(server_id: u64, file: &str, offset: u64, heartbeat_id: u64) -> Vec<EventEnvelope> {
        vec![
            envelope(
                server_id,
                file,
                offset - 40,
                offset,
                BinlogEvent::TableMap {
                    table_id: 99,
                    database: "millrace".into(),
                    table: "heartbeats".into(),
                },
            ),
            envelope(
                server_id,
                file,
                offset,
                offset + 60,
                BinlogEvent::WriteRows {
                    table_id: 99,
                    rows: vec![RowImage::new(vec![
                        CellValue::UInt(10),
                        CellValue::Text("millrace".into()),
                        CellValue::UInt(heartbeat_id),
                    ])],
                },
            ),
        ]
    }

    fn users_schema() -> Schema {
        let schema = SchemaDelta::CreateDatabase {
            name: "shop".into(),
            charset: None,
            if_not_exists: false,
        }
        .apply(&Schema::new(CaseSensitivity::Sensitive))
        .unwrap();
        SchemaDelta::CreateTable {
            database: "shop".into(),
            table: Table::new("shop", "users").with_columns(vec![ColumnDef::int("id")]),
            if_not_exists: false,
        }
        .apply(&schema)
        .unwrap()
    }

    #[tokio::test]
    async fn stored_position_wins() {
        let client = StaticBinlogClient::new(10)
            .with_file("mysql-bin.000001", vec![]);
        let positions = MemoryPositionStore::new(10, "millrace");
        let schemas = MemorySchemaStore::new();
        positions
            .set(&Position::new("mysql-bin.000001", 777))
            .await
            .unwrap();

        let recovery = Recovery::new(&client, &positions, &schemas, config());
        let resolved = recovery.resolve_initial_position().await.unwrap();
        assert_eq!(resolved.binlog.offset, 777);
    }

    #[tokio::test]
    async fn master_failover_recovery() {
        // The retiring primary (server 10) committed heartbeat 7 at
        // (mysql-bin.000001, 500); the replacement (server 20) carries
        // the same marker row at (mysql-new.000003, 120).
        let position_backing = MemoryPositionBacking::new();
        let schema_backing = MemorySchemaBacking::new();

        let old_positions =
            MemoryPositionStore::with_backing(position_backing.clone(), 10, "millrace");
        let old_position = Position::new("mysql-bin.000001", 500).with_heartbeat(7);
        old_positions.set(&old_position).await.unwrap();

        let old_schemas = MemorySchemaStore::with_backing(schema_backing.clone());
        old_schemas
            .save_full(10, &Position::new("mysql-bin.000001", 100), &users_schema())
            .await
            .unwrap();

        let new_client = StaticBinlogClient::new(20)
            .with_file("mysql-new.000002", vec![])
            .with_file("mysql-new.000003", heartbeat_events(20, "mysql-new.000003", 120, 7));
        let new_positions =
            MemoryPositionStore::with_backing(position_backing, 20, "millrace");
        let new_schemas = MemorySchemaStore::with_backing(schema_backing);

        let recovery = Recovery::new(&new_client, &new_positions, &new_schemas, config());
        let resolved = recovery.resolve_initial_position().await.unwrap();

        // resumes at the event immediately after the heartbeat row
        assert_eq!(resolved.binlog.file, "mysql-new.000003");
        assert_eq!(resolved.binlog.offset, 180);
        assert_eq!(resolved.last_heartbeat, Some(7));

        // the schema is chained under the new identity, keyed at the
        // heartbeat's start position (<= the resume position)
        let (_, schema) = new_schemas
            .schema_at(20, &resolved)
            .await
            .unwrap()
            .expect("cloned snapshot must resolve at the resume position");
        assert!(schema.find_table("shop", "users").is_some());
        let at_heartbeat = new_schemas
            .schema_at(20, &Position::new("mysql-new.000003", 120))
            .await
            .unwrap();
        assert!(at_heartbeat.is_some());
    }

    #[tokio::test]
    async fn missed_heartbeat_falls_through_to_capture() {
        let position_backing = MemoryPositionBacking::new();
        let old_positions =
            MemoryPositionStore::with_backing(position_backing.clone(), 10, "millrace");
        old_positions
            .set(&Position::new("mysql-bin.000001", 500).with_heartbeat(7))
            .await
            .unwrap();

        // the new primary retains no binlog containing heartbeat 7
        let new_client = StaticBinlogClient::new(20).with_file(
            "mysql-new.000009",
            vec![envelope(20, "mysql-new.000009", 4, 90, BinlogEvent::Xid { xid: 1 })],
        );
        let new_positions =
            MemoryPositionStore::with_backing(position_backing, 20, "millrace");
        let schemas = MemorySchemaStore::new();

        let recovery = Recovery::new(&new_client, &new_positions, &schemas, config());
        let resolved = recovery.resolve_initial_position().await.unwrap();
        assert_eq!(resolved.binlog.file, "mysql-new.000009");
        assert_eq!(resolved.binlog.offset, 90, "tail of the binlog");
    }

    #[tokio::test]
    async fn other_client_position_adopted() {
        let backing = MemoryPositionBacking::new();
        let retired = MemoryPositionStore::with_backing(backing.clone(), 10, "old-client");
        retired
            .set(&Position::new("mysql-bin.000004", 42))
            .await
            .unwrap();

        let client = StaticBinlogClient::new(10).with_file("mysql-bin.000004", vec![]);
        let positions = MemoryPositionStore::with_backing(backing, 10, "millrace");
        let schemas = MemorySchemaStore::new();

        let mut cfg = config();
        cfg.master_recovery = false;
        let recovery = Recovery::new(&client, &positions, &schemas, cfg);
        let resolved = recovery.resolve_initial_position().await.unwrap();
        assert_eq!(resolved.binlog.file, "mysql-bin.000004");
        assert_eq!(resolved.binlog.offset, 42);

        // the adopted position became durable for this client
        assert_eq!(positions.get().await.unwrap(), Some(resolved));
    }

    #[tokio::test]
    async fn fresh_start_captures_tail() {
        let client = StaticBinlogClient::new(10).with_file(
            "mysql-bin.000001",
            vec![envelope(10, "mysql-bin.000001", 4, 200, BinlogEvent::Xid { xid: 1 })],
        );
        let positions = MemoryPositionStore::new(10, "millrace");
        let schemas = MemorySchemaStore::new();

        let mut cfg = config();
        cfg.master_recovery = false;
        let recovery = Recovery::new(&client, &positions, &schemas, cfg);
        let resolved = recovery.resolve_initial_position().await.unwrap();
        assert_eq!(resolved.binlog.offset, 200);
    }
}
