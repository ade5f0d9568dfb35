//! Binlog client contract
//!
//! The wire-protocol client is an external collaborator: it registers as
//! a replica, parses the binlog protocol and delivers ordered
//! [`EventEnvelope`]s. This module pins down the contract the replicator
//! and the recovery coordinator consume, plus a replay implementation
//! backed by pre-recorded events for tests and offline runs.

use crate::error::{MillraceError, Result};
use crate::position::{BinlogPosition, Position};
use crate::replication::event::{BinlogEvent, EventEnvelope};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Bound of the event queue between the client task and the replicator.
/// The client blocks when the replicator falls behind.
pub const EVENT_QUEUE_DEPTH: usize = 256;

/// A source of ordered binlog events.
#[async_trait]
pub trait BinlogClient: Send + Sync {
    /// Identity of the server the client is connected to.
    async fn server_id(&self) -> Result<u64>;

    /// Binlog files currently retained upstream, oldest first.
    async fn binlog_files(&self) -> Result<Vec<String>>;

    /// The current tail of the binlog (with the executed GTID set when
    /// `gtid_mode` is on); where a fresh client starts.
    async fn latest_position(&self, gtid_mode: bool) -> Result<Position>;

    /// Start streaming at the cursor. Events arrive on the channel in
    /// binlog order; the stream ends when the sender is dropped.
    ///
    /// A cursor naming a file the upstream no longer retains fails with
    /// [`MillraceError::BinlogRetentionLost`].
    async fn connect(&self, cursor: &Position) -> Result<mpsc::Receiver<EventEnvelope>>;
}

/// Replays a fixed set of recorded binlog files. The recovery search and
/// the pipeline tests both run against this; it honors the same
/// retention contract as a live client.
#[derive(Debug, Default)]
pub struct StaticBinlogClient {
    server_id: u64,
    /// (file name, events) in binlog order.
    files: Vec<(String, Vec<EventEnvelope>)>,
}

impl StaticBinlogClient {
    pub fn new(server_id: u64) -> Self {
        Self {
            server_id,
            files: Vec::new(),
        }
    }

    /// Append a recorded binlog file. Files must be added oldest first.
    pub fn with_file(mut self, name: impl Into<String>, events: Vec<EventEnvelope>) -> Self {
        self.files.push((name.into(), events));
        self
    }

    fn file_index(&self, file: &str) -> Option<usize> {
        self.files.iter().position(|(name, _)| name == file)
    }
}

#[async_trait]
impl BinlogClient for StaticBinlogClient {
    async fn server_id(&self) -> Result<u64> {
        Ok(self.server_id)
    }

    async fn binlog_files(&self) -> Result<Vec<String>> {
        Ok(self.files.iter().map(|(name, _)| name.clone()).collect())
    }

    async fn latest_position(&self, _gtid_mode: bool) -> Result<Position> {
        let (file, events) = self
            .files
            .last()
            .ok_or_else(|| MillraceError::upstream("no binlog files recorded"))?;
        let binlog = events
            .last()
            .map(|e| e.next_position.clone())
            .unwrap_or_else(|| BinlogPosition::new(file.clone(), 4));
        Ok(Position {
            binlog,
            gtid_set: None,
            last_heartbeat: None,
        })
    }

    async fn connect(&self, cursor: &Position) -> Result<mpsc::Receiver<EventEnvelope>> {
        let start = self.file_index(&cursor.binlog.file).ok_or_else(|| {
            MillraceError::retention_lost(format!(
                "binlog file {} is not retained",
                cursor.binlog.file
            ))
        })?;

        let mut replay: Vec<EventEnvelope> = Vec::new();
        for (index, (file, events)) in self.files.iter().enumerate() {
            if index < start {
                continue;
            }
            for env in events {
                if index == start && env.position.offset < cursor.binlog.offset {
                    continue;
                }
                replay.push(env.clone());
            }
            // synthesize the rotate the server would emit between files
            if let Some((next_file, next_events)) = self.files.get(index + 1) {
                let next_offset = next_events.first().map(|e| e.position.offset).unwrap_or(4);
                let tail = events
                    .last()
                    .map(|e| e.next_position.clone())
                    .unwrap_or_else(|| BinlogPosition::new(file.clone(), 4));
                replay.push(EventEnvelope::new(
                    tail.clone(),
                    BinlogPosition::new(next_file.clone(), next_offset),
                    self.server_id,
                    0,
                    BinlogEvent::Rotate {
                        next_file: next_file.clone(),
                        next_offset,
                    },
                ));
            }
        }

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH.max(1));
        tokio::spawn(async move {
            for env in replay {
                if tx.send(env).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}
