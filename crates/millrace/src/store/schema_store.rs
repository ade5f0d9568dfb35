//! Schema store
//!
//! Persists the tracked catalog so a restart can decode from the first
//! event. Two kinds of entry exist: full snapshots (an initial capture,
//! a recapture, or a materialized compaction) and delta entries that
//! chain onto a base entry and record the DDL applied at a position.
//! Reading the schema at position P means finding the newest entry at or
//! before P, walking the chain back to the nearest full snapshot and
//! replaying the deltas forward.
//!
//! When the upstream primary is replaced, the last snapshot of the old
//! server identity is cloned under the new server id at the recovery
//! position, so the new delta chain starts from an established baseline
//! instead of a fresh capture.

use crate::error::{MillraceError, Result};
use crate::position::Position;
use crate::schema::delta::SchemaDelta;
use crate::schema::model::Schema;
use crate::store::position_store::PositionStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// One persisted schema-store row.
#[derive(Debug, Clone)]
pub struct SchemaEntry {
    pub id: u64,
    pub server_id: u64,
    /// Stream position this entry took effect at.
    pub position: Position,
    /// Chain predecessor; `None` for full snapshots.
    pub base_id: Option<u64>,
    /// DDL applied at `position`; empty for full snapshots.
    pub deltas: Vec<SchemaDelta>,
    /// Materialized catalog; `Some` for full snapshots.
    pub snapshot: Option<Schema>,
}

impl SchemaEntry {
    pub fn is_full(&self) -> bool {
        self.snapshot.is_some()
    }
}

/// Durable schema persistence contract.
#[async_trait]
pub trait SchemaStore: Send + Sync {
    /// Persist a full snapshot at a position; returns the entry id.
    async fn save_full(&self, server_id: u64, position: &Position, schema: &Schema)
        -> Result<u64>;

    /// Persist DDL chained onto `base_id`; returns the new entry id.
    async fn save_deltas(
        &self,
        server_id: u64,
        base_id: u64,
        position: &Position,
        deltas: &[SchemaDelta],
    ) -> Result<u64>;

    /// Reconstruct the newest schema at or before `position`; `None`
    /// when the server has no entry that early.
    async fn schema_at(&self, server_id: u64, position: &Position)
        -> Result<Option<(u64, Schema)>>;

    /// The delta entry recorded at exactly this position, if any. A DDL
    /// event replayed after a crash finds its own first processing here
    /// and adopts the stored result instead of re-applying.
    async fn entry_at_exact(
        &self,
        server_id: u64,
        position: &Position,
    ) -> Result<Option<(u64, Schema)>>;

    /// Clone the old server's schema as seen at `old_position` into a
    /// full snapshot under `new_server_id`, keyed at `new_position`.
    /// The key position must not exceed the position the successor
    /// resumes at, or the first decode after resume would see nothing.
    async fn clone_for_server(
        &self,
        old_server_id: u64,
        old_position: &Position,
        new_server_id: u64,
        new_position: &Position,
    ) -> Result<Option<u64>>;

    /// Materialize the newest entry at or before the watermark and drop
    /// the entries beneath it. Callers guarantee no unacknowledged
    /// consumer position lies below the watermark. Returns the number of
    /// entries dropped.
    async fn compact(&self, server_id: u64, watermark: &Position) -> Result<usize>;
}

/// Shared schema store handle.
pub type SharedSchemaStore = Arc<dyn SchemaStore>;

#[derive(Default)]
struct Backing {
    entries: Vec<SchemaEntry>,
    next_id: u64,
}

impl Backing {
    fn push(&mut self, mut entry: SchemaEntry) -> u64 {
        self.next_id += 1;
        entry.id = self.next_id;
        let id = entry.id;
        self.entries.push(entry);
        id
    }

    fn find(&self, id: u64) -> Option<&SchemaEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Newest entry for the server at or before the position. Ids grow
    /// in stream order, so the last matching entry wins ties.
    fn entry_at(&self, server_id: u64, position: &Position) -> Option<&SchemaEntry> {
        self.entries
            .iter()
            .filter(|e| e.server_id == server_id && e.position.binlog <= position.binlog)
            .max_by_key(|e| e.id)
    }

    /// Walk the chain back to a full snapshot and replay forward.
    fn materialize(&self, entry: &SchemaEntry) -> Result<Schema> {
        let mut chain: Vec<&SchemaEntry> = Vec::new();
        let mut cursor = entry;
        loop {
            chain.push(cursor);
            if cursor.is_full() {
                break;
            }
            let base = cursor.base_id.ok_or_else(|| {
                MillraceError::store(format!("schema entry {} has no base", cursor.id))
            })?;
            cursor = self.find(base).ok_or_else(|| {
                MillraceError::store(format!("schema entry {base} referenced but missing"))
            })?;
        }
        chain.reverse();

        let mut schema = chain[0]
            .snapshot
            .clone()
            .ok_or_else(|| MillraceError::store("chain does not start at a snapshot"))?;
        for link in &chain[1..] {
            for delta in &link.deltas {
                schema = delta.apply(&schema)?;
            }
        }
        Ok(schema)
    }
}

/// Shared in-memory backing, the stand-in for the metadata database.
#[derive(Default)]
pub struct MemorySchemaBacking {
    inner: Mutex<Backing>,
}

impl MemorySchemaBacking {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// In-memory schema store; the test double and reference implementation.
#[derive(Default)]
pub struct MemorySchemaStore {
    backing: Arc<MemorySchemaBacking>,
}

impl MemorySchemaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backing(backing: Arc<MemorySchemaBacking>) -> Self {
        Self { backing }
    }

    /// Number of stored entries, for tests and compaction accounting.
    pub async fn entry_count(&self) -> usize {
        self.backing.inner.lock().await.entries.len()
    }
}

#[async_trait]
impl SchemaStore for MemorySchemaStore {
    async fn save_full(
        &self,
        server_id: u64,
        position: &Position,
        schema: &Schema,
    ) -> Result<u64> {
        let mut inner = self.backing.inner.lock().await;
        let id = inner.push(SchemaEntry {
            id: 0,
            server_id,
            position: position.clone(),
            base_id: None,
            deltas: Vec::new(),
            snapshot: Some(schema.copy()),
        });
        info!(id, server_id, %position, "saved full schema snapshot");
        Ok(id)
    }

    async fn save_deltas(
        &self,
        server_id: u64,
        base_id: u64,
        position: &Position,
        deltas: &[SchemaDelta],
    ) -> Result<u64> {
        let mut inner = self.backing.inner.lock().await;
        if inner.find(base_id).is_none() {
            return Err(MillraceError::store(format!(
                "delta base entry {base_id} does not exist"
            )));
        }
        let id = inner.push(SchemaEntry {
            id: 0,
            server_id,
            position: position.clone(),
            base_id: Some(base_id),
            deltas: deltas.to_vec(),
            snapshot: None,
        });
        debug!(id, base_id, %position, count = deltas.len(), "saved schema deltas");
        Ok(id)
    }

    async fn schema_at(
        &self,
        server_id: u64,
        position: &Position,
    ) -> Result<Option<(u64, Schema)>> {
        let inner = self.backing.inner.lock().await;
        let Some(entry) = inner.entry_at(server_id, position) else {
            return Ok(None);
        };
        let schema = inner.materialize(entry)?;
        Ok(Some((entry.id, schema)))
    }

    async fn entry_at_exact(
        &self,
        server_id: u64,
        position: &Position,
    ) -> Result<Option<(u64, Schema)>> {
        let inner = self.backing.inner.lock().await;
        let Some(entry) = inner
            .entries
            .iter()
            .filter(|e| {
                e.server_id == server_id && !e.is_full() && e.position.binlog == position.binlog
            })
            .max_by_key(|e| e.id)
        else {
            return Ok(None);
        };
        let schema = inner.materialize(entry)?;
        Ok(Some((entry.id, schema)))
    }

    async fn clone_for_server(
        &self,
        old_server_id: u64,
        old_position: &Position,
        new_server_id: u64,
        new_position: &Position,
    ) -> Result<Option<u64>> {
        let mut inner = self.backing.inner.lock().await;
        let Some(entry) = inner.entry_at(old_server_id, old_position) else {
            return Ok(None);
        };
        let schema = inner.materialize(entry)?;
        let id = inner.push(SchemaEntry {
            id: 0,
            server_id: new_server_id,
            position: new_position.clone(),
            base_id: None,
            deltas: Vec::new(),
            snapshot: Some(schema),
        });
        info!(
            old_server_id,
            new_server_id,
            %new_position,
            "chained schema snapshot across server identities"
        );
        Ok(Some(id))
    }

    async fn compact(&self, server_id: u64, watermark: &Position) -> Result<usize> {
        let mut inner = self.backing.inner.lock().await;
        let Some(target) = inner.entry_at(server_id, watermark).map(|e| e.id) else {
            return Ok(0);
        };

        let (materialized, position) = {
            let entry = inner
                .find(target)
                .ok_or_else(|| MillraceError::store("compaction target vanished"))?;
            if entry.is_full() {
                // nothing chained beneath a snapshot needs replay
                (None, entry.position.clone())
            } else {
                (Some(inner.materialize(entry)?), entry.position.clone())
            }
        };

        if let Some(schema) = materialized {
            let entry = inner
                .entries
                .iter_mut()
                .find(|e| e.id == target)
                .ok_or_else(|| MillraceError::store("compaction target vanished"))?;
            entry.snapshot = Some(schema);
            entry.base_id = None;
            entry.deltas.clear();
        }

        let before = inner.entries.len();
        inner
            .entries
            .retain(|e| e.server_id != server_id || e.id >= target);
        let dropped = before - inner.entries.len();
        if dropped > 0 {
            info!(server_id, %position, dropped, "compacted schema chain");
        }
        Ok(dropped)
    }
}

/// Background compaction: periodically folds the chain below the
/// committed cursor into a materialized snapshot. Runs at low priority
/// alongside the replicator; the stores expose transactional operations
/// so the two never observe partial writes.
pub struct Compactor {
    store: SharedSchemaStore,
    position_store: crate::store::position_store::SharedPositionStore,
    server_id: u64,
    interval: Duration,
}

impl Compactor {
    pub fn new(
        store: SharedSchemaStore,
        position_store: crate::store::position_store::SharedPositionStore,
        server_id: u64,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            position_store,
            server_id,
            interval,
        }
    }

    /// Run until the stop flag flips. One compaction pass per tick.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
            }
            match self.position_store.get().await {
                Ok(Some(watermark)) => {
                    if let Err(e) = self.store.compact(self.server_id, &watermark).await {
                        warn!(error = %e, "schema compaction pass failed");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "compactor could not read the cursor"),
            }
        }
        debug!("schema compactor stopped");
    }
}
