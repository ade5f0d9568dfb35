//! Heartbeat emitter
//!
//! Periodically writes a marker row into the metadata `heartbeats` table
//! on the *upstream*, so the write comes back through the binlog as an
//! ordinary row event. Observing the marker in the stream is what turns
//! "we have caught up to here" into an explicit, position-aligned fact:
//! the replicator commits its cursor at heartbeat boundaries, and master
//! recovery later finds the same id in the new primary's binlog.
//!
//! Ids are epoch milliseconds at write time, clamped to be strictly
//! increasing, so they stay monotonic per client across restarts.

use crate::error::{MillraceError, Result};
use crate::replication::event::RowImage;
use crate::schema::columndef::CellValue;
use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::Pool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

/// Writes marker rows upstream.
#[async_trait]
pub trait HeartbeatWriter: Send + Sync {
    async fn write(&self, heartbeat_id: u64) -> Result<()>;
}

/// Shared heartbeat writer handle.
pub type SharedHeartbeatWriter = Arc<dyn HeartbeatWriter>;

/// Marker writer backed by the metadata database on the upstream.
pub struct MysqlHeartbeatWriter {
    pool: Pool,
    database: String,
    server_id: u64,
    client_id: String,
}

impl MysqlHeartbeatWriter {
    pub fn new(
        pool: Pool,
        database: impl Into<String>,
        server_id: u64,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            database: database.into(),
            server_id,
            client_id: client_id.into(),
        }
    }
}

#[async_trait]
impl HeartbeatWriter for MysqlHeartbeatWriter {
    async fn write(&self, heartbeat_id: u64) -> Result<()> {
        let mut conn = self.pool.get_conn().await.map_err(MillraceError::from_mysql)?;
        // the position columns stay empty until the marker is observed
        // in the stream and committed by the position store
        conn.exec_drop(
            format!(
                "REPLACE INTO `{}`.`heartbeats` \
                 (server_id, client_id, heartbeat, binlog_file, binlog_position) \
                 VALUES (?, ?, ?, '', 0)",
                self.database
            ),
            (self.server_id, &self.client_id, heartbeat_id),
        )
        .await
        .map_err(MillraceError::from_mysql)?;
        Ok(())
    }
}

/// Records written ids in memory; tests replay them as binlog events.
#[derive(Default)]
pub struct MemoryHeartbeatWriter {
    written: Mutex<Vec<u64>>,
}

impl MemoryHeartbeatWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn written(&self) -> Vec<u64> {
        self.written.lock().await.clone()
    }
}

#[async_trait]
impl HeartbeatWriter for MemoryHeartbeatWriter {
    async fn write(&self, heartbeat_id: u64) -> Result<()> {
        self.written.lock().await.push(heartbeat_id);
        Ok(())
    }
}

/// The timer task driving a [`HeartbeatWriter`].
pub struct HeartbeatEmitter {
    writer: SharedHeartbeatWriter,
    interval: Duration,
    last_id: AtomicU64,
}

impl HeartbeatEmitter {
    pub fn new(writer: SharedHeartbeatWriter, interval: Duration) -> Self {
        Self {
            writer,
            interval,
            last_id: AtomicU64::new(0),
        }
    }

    /// Next id: wall-clock millis, strictly greater than the previous id.
    fn next_id(&self) -> u64 {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let prev = self.last_id.load(Ordering::SeqCst);
        let id = now.max(prev + 1);
        self.last_id.store(id, Ordering::SeqCst);
        id
    }

    /// Write one marker immediately. Exposed for tests and for pinning a
    /// position right before shutdown.
    pub async fn beat(&self) -> Result<u64> {
        let id = self.next_id();
        self.writer.write(id).await?;
        debug!(heartbeat_id = id, "heartbeat marker written");
        Ok(id)
    }

    /// Run until the stop flag flips. Write failures are logged and
    /// retried at the next tick; the upstream connection error policy
    /// lives at the pipeline edge, not here.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.beat().await {
                        warn!(error = %e, "heartbeat write failed");
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("heartbeat emitter stopped");
    }
}

/// A heartbeat marker row decoded from a binlog row image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatRow {
    pub client_id: String,
    pub heartbeat_id: u64,
}

impl HeartbeatRow {
    /// Decode a marker row. The metadata table leads with the numeric
    /// server id, but older layouts start directly with the client id;
    /// both are accepted.
    pub fn from_image(image: &RowImage) -> Option<Self> {
        let cells = image.cells();
        let (client_idx, heartbeat_idx) = match (cells.first(), cells.get(1)) {
            (Some(CellValue::Text(_)), Some(CellValue::Int(_) | CellValue::UInt(_))) => (0, 1),
            _ => (1, 2),
        };
        let client_id = match cells.get(client_idx)? {
            CellValue::Text(s) => s.clone(),
            _ => return None,
        };
        let heartbeat_id = match cells.get(heartbeat_idx)? {
            CellValue::UInt(v) => *v,
            CellValue::Int(v) if *v >= 0 => *v as u64,
            _ => return None,
        };
        Some(Self {
            client_id,
            heartbeat_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ids_are_strictly_increasing() {
        let writer = Arc::new(MemoryHeartbeatWriter::new());
        let emitter = HeartbeatEmitter::new(writer.clone(), Duration::from_secs(10));

        let a = emitter.beat().await.unwrap();
        let b = emitter.beat().await.unwrap();
        let c = emitter.beat().await.unwrap();
        assert!(a < b && b < c);
        assert_eq!(writer.written().await, vec![a, b, c]);
    }

    #[tokio::test]
    async fn emitter_honors_stop_flag() {
        let writer = Arc::new(MemoryHeartbeatWriter::new());
        let emitter = HeartbeatEmitter::new(writer.clone(), Duration::from_millis(5));
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(emitter.run(stop_rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(!writer.written().await.is_empty());
    }

    #[test]
    fn marker_row_decoding() {
        // full metadata layout: server_id, client_id, heartbeat, ...
        let image = RowImage::new(vec![
            CellValue::UInt(10),
            CellValue::Text("millrace".into()),
            CellValue::UInt(77),
            CellValue::Text(String::new()),
            CellValue::UInt(0),
        ]);
        assert_eq!(
            HeartbeatRow::from_image(&image),
            Some(HeartbeatRow {
                client_id: "millrace".into(),
                heartbeat_id: 77
            })
        );

        // compact layout: client_id, heartbeat
        let image = RowImage::new(vec![
            CellValue::Text("millrace".into()),
            CellValue::Int(12),
        ]);
        assert_eq!(
            HeartbeatRow::from_image(&image).unwrap().heartbeat_id,
            12
        );

        // not a marker row at all
        let image = RowImage::new(vec![CellValue::Int(1), CellValue::Int(2)]);
        assert!(HeartbeatRow::from_image(&image).is_none());
    }
}
