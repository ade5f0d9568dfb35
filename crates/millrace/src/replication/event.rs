//! Binlog event model
//!
//! The wire client (external to this crate) parses the binlog protocol
//! and delivers [`EventEnvelope`]s in stream order. Row events carry the
//! binlog-embedded numeric table id plus raw row images; the mapping
//! from id to table name arrives separately in [`BinlogEvent::TableMap`]
//! events, exactly as the binlog itself interleaves them.

use crate::position::BinlogPosition;
use crate::schema::columndef::CellValue;
use serde::{Deserialize, Serialize};

/// One raw row image: wire cells in column-ordinal order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowImage(pub Vec<CellValue>);

impl RowImage {
    pub fn new(cells: Vec<CellValue>) -> Self {
        Self(cells)
    }

    pub fn cells(&self) -> &[CellValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A parsed binlog event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BinlogEvent {
    /// Maps a numeric table id to its database and table name. Emitted
    /// before the row events that use the id.
    TableMap {
        table_id: u64,
        database: String,
        table: String,
    },
    WriteRows {
        table_id: u64,
        rows: Vec<RowImage>,
    },
    UpdateRows {
        table_id: u64,
        rows: Vec<(RowImage, RowImage)>,
    },
    DeleteRows {
        table_id: u64,
        rows: Vec<RowImage>,
    },
    /// Statement carrier; DDL arrives here.
    Query {
        /// Session default database the statement executed under.
        database: Option<String>,
        sql: String,
    },
    /// Switch to the next binlog file.
    Rotate {
        next_file: String,
        next_offset: u64,
    },
    /// Transaction commit.
    Xid {
        xid: u64,
    },
    /// GTID of the transaction that follows.
    Gtid {
        gtid: String,
    },
    /// Server liveness marker; carries no data.
    Heartbeat,
}

/// An event plus its stream coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Start position of this event.
    pub position: BinlogPosition,
    /// Position of the event after this one; where a resume lands.
    pub next_position: BinlogPosition,
    /// Originating server id from the event header.
    pub server_id: u64,
    /// Event header timestamp, epoch seconds.
    pub timestamp: i64,
    pub event: BinlogEvent,
}

impl EventEnvelope {
    pub fn new(
        position: BinlogPosition,
        next_position: BinlogPosition,
        server_id: u64,
        timestamp: i64,
        event: BinlogEvent,
    ) -> Self {
        Self {
            position,
            next_position,
            server_id,
            timestamp,
            event,
        }
    }

    pub fn is_row_event(&self) -> bool {
        matches!(
            self.event,
            BinlogEvent::WriteRows { .. }
                | BinlogEvent::UpdateRows { .. }
                | BinlogEvent::DeleteRows { .. }
        )
    }
}
