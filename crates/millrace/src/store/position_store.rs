//! Position store
//!
//! The durable cursor. Writes are monotonic: a position older than the
//! stored one is rejected, which is what makes crash-resume at-most-once
//! from the stream's point of view. Every committed position that pins a
//! heartbeat also records a recovery candidate, the tuple a successor
//! uses to re-anchor after the upstream primary is replaced.

use crate::error::{MillraceError, Result};
use crate::position::{Position, RecoveryInfo};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Durable cursor contract, scoped to one (server_id, client_id) pair.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// The committed position, if any.
    async fn get(&self) -> Result<Option<Position>>;

    /// Commit a position. Monotonic: rejects positions older than the
    /// committed one. When the position pins a heartbeat, a recovery
    /// candidate is recorded alongside it.
    async fn set(&self, position: &Position) -> Result<()>;

    /// The most recent recovery candidate written by this client under a
    /// *different* server id; `None` means there is no predecessor to
    /// recover from.
    async fn recovery_info(&self) -> Result<Option<RecoveryInfo>>;

    /// The newest position committed by a different client against the
    /// same server. Adopting it avoids losing DDL that happened between
    /// a retired client's last position and now.
    async fn other_client_position(&self) -> Result<Option<Position>>;

    /// Purge recovery candidates at or before the established cursor's
    /// heartbeat.
    async fn cleanup_old_recovery_infos(&self) -> Result<()>;
}

/// Shared position store handle.
pub type SharedPositionStore = Arc<dyn PositionStore>;

#[derive(Default)]
struct Backing {
    /// (server_id, client_id) -> committed position
    positions: HashMap<(u64, String), Position>,
    recovery: Vec<RecoveryInfo>,
}

/// Shared in-memory state standing in for the metadata database; several
/// [`MemoryPositionStore`] handles (different clients, different server
/// identities across a failover) can point at the same backing.
#[derive(Default)]
pub struct MemoryPositionBacking {
    inner: Mutex<Backing>,
}

impl MemoryPositionBacking {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// In-memory position store; the test double and the reference
/// implementation for the contract above.
pub struct MemoryPositionStore {
    backing: Arc<MemoryPositionBacking>,
    server_id: u64,
    client_id: String,
}

impl MemoryPositionStore {
    pub fn new(server_id: u64, client_id: impl Into<String>) -> Self {
        Self::with_backing(MemoryPositionBacking::new(), server_id, client_id)
    }

    pub fn with_backing(
        backing: Arc<MemoryPositionBacking>,
        server_id: u64,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            backing,
            server_id,
            client_id: client_id.into(),
        }
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn get(&self) -> Result<Option<Position>> {
        let inner = self.backing.inner.lock().await;
        Ok(inner
            .positions
            .get(&(self.server_id, self.client_id.clone()))
            .cloned())
    }

    async fn set(&self, position: &Position) -> Result<()> {
        let mut inner = self.backing.inner.lock().await;
        let key = (self.server_id, self.client_id.clone());
        if let Some(current) = inner.positions.get(&key) {
            if current.newer_than(position) {
                return Err(MillraceError::store(format!(
                    "refusing to rewind position from {current} to {position}"
                )));
            }
        }
        inner.positions.insert(key, position.clone());

        if let Some(heartbeat_id) = position.last_heartbeat {
            inner.recovery.push(RecoveryInfo {
                server_id: self.server_id,
                client_id: self.client_id.clone(),
                heartbeat_id,
                position: position.clone(),
            });
        }
        debug!(%position, "position committed");
        Ok(())
    }

    async fn recovery_info(&self) -> Result<Option<RecoveryInfo>> {
        let inner = self.backing.inner.lock().await;
        Ok(inner
            .recovery
            .iter()
            .filter(|r| r.server_id != self.server_id && r.client_id == self.client_id)
            .max_by_key(|r| r.heartbeat_id)
            .cloned())
    }

    async fn other_client_position(&self) -> Result<Option<Position>> {
        let inner = self.backing.inner.lock().await;
        let mut best: Option<Position> = None;
        for ((server, client), position) in inner.positions.iter() {
            if *server != self.server_id || *client == self.client_id {
                continue;
            }
            match &best {
                Some(current) if !position.newer_than(current) => {}
                _ => best = Some(position.clone()),
            }
        }
        Ok(best)
    }

    async fn cleanup_old_recovery_infos(&self) -> Result<()> {
        let mut inner = self.backing.inner.lock().await;
        let key = (self.server_id, self.client_id.clone());
        let watermark = inner
            .positions
            .get(&key)
            .and_then(|p| p.last_heartbeat);
        let Some(watermark) = watermark else {
            return Ok(());
        };
        let before = inner.recovery.len();
        inner.recovery.retain(|r| r.heartbeat_id > watermark);
        let purged = before - inner.recovery.len();
        if purged > 0 {
            info!(purged, "purged stale recovery candidates");
        }
        Ok(())
    }
}
