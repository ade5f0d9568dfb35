//! # millrace - MySQL change-data-capture engine
//!
//! Tails a MySQL primary's binary log, translates row events and DDL
//! into an ordered stream of canonical row-change records, and forwards
//! them to a producer. The stream is durable and resumable: a schema
//! mirror versioned per binlog position decodes row images the binlog
//! itself does not describe, and a heartbeat-pinned cursor makes
//! advancement at-most-once across crashes and master failovers.
//!
//! ## Architecture
//!
//! ```text
//! MySQL binlog ──▶ BinlogClient ──▶ Replicator ──▶ Producer
//!                                     │  ▲
//!                          DDL apply  │  │ decode via tracked schema
//!                                     ▼  │
//!                         SchemaStore + PositionStore
//!                          (companion metadata database)
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use millrace::replication::{Recovery, RecoveryConfig};
//! # async fn example(
//! #     client: std::sync::Arc<dyn millrace::replication::BinlogClient>,
//! #     positions: millrace::store::SharedPositionStore,
//! #     schemas: millrace::store::SharedSchemaStore,
//! # ) -> millrace::Result<()> {
//! let recovery = Recovery::new(
//!     client.as_ref(),
//!     positions.as_ref(),
//!     schemas.as_ref(),
//!     RecoveryConfig {
//!         client_id: "millrace".into(),
//!         metadata_database: "millrace".into(),
//!         master_recovery: true,
//!         gtid_mode: false,
//!     },
//! );
//! let position = recovery.resolve_initial_position().await?;
//! # let _ = position;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod error;
pub mod filter;
pub mod lease;
pub mod position;
pub mod producer;
pub mod replication;
pub mod schema;
pub mod store;

pub use error::{ColumnCastError, DdlParseError, MillraceError, Result, SchemaSyncError};
pub use filter::{PatternError, PatternMatcher, TableFilter};
pub use position::{BinlogPosition, GtidSet, Position, RecoveryInfo};
pub use producer::{
    FileProducer, MemoryProducer, Producer, RecordKind, RowRecord, SharedProducer, StdoutProducer,
};
