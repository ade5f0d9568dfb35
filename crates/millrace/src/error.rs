//! Error types for the replication pipeline
//!
//! The schema tracker and the row decoder surface their failures as
//! dedicated types (`SchemaSyncError`, `ColumnCastError`) so the
//! replicator can classify them at the top of its loop instead of
//! unwinding through the call stack. Everything else funnels into
//! [`MillraceError`], which carries the retry/terminate policy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for logging and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Upstream or metadata database errors (connection, query)
    Database,
    /// Binlog stream errors
    Replication,
    /// Schema mirror errors (DDL apply, decode mismatch)
    Schema,
    /// Configuration errors
    Configuration,
    /// Network errors (connect, timeout)
    Network,
    /// Producer/sink errors
    Producer,
    /// Other/unknown errors
    Other,
}

/// A DDL delta could not be applied to the tracked schema.
///
/// These are always fatal: a delta that fails its precondition means the
/// mirror has silently drifted from the upstream catalog, and decoding
/// row events against a drifted mirror produces wrong data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaSyncError {
    #[error("database `{0}` not found")]
    MissingDatabase(String),

    #[error("table `{database}`.`{table}` not found")]
    MissingTable { database: String, table: String },

    #[error("column `{column}` not found in `{database}`.`{table}`")]
    MissingColumn {
        database: String,
        table: String,
        column: String,
    },

    #[error("`{name}` already exists in {scope}")]
    DuplicateName { scope: String, name: String },

    #[error("column index {index} out of range for `{database}`.`{table}` ({len} columns)")]
    IndexOutOfRange {
        database: String,
        table: String,
        index: usize,
        len: usize,
    },
}

/// A row image cell did not match the tracked column definition.
///
/// Non-fatal at the decode site: the replicator pauses, re-introspects
/// the live table, logs the divergence and then terminates so an
/// operator can recapture. See the replicator's cast-error path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot cast value for `{database}`.`{table}`.`{column}`: expected {expected}, got {found}")]
pub struct ColumnCastError {
    pub database: String,
    pub table: String,
    pub column: String,
    /// Tracked column type, e.g. "int(unsigned)"
    pub expected: String,
    /// Short description of the wire value, e.g. "string"
    pub found: String,
}

/// A DDL statement the parser did not understand.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unparseable DDL{}: {message}", .position.map(|p| format!(" at byte {p}")).unwrap_or_default())]
pub struct DdlParseError {
    pub message: String,
    pub position: Option<usize>,
    /// The offending statement, for skip-pattern matching and logs.
    pub sql: String,
}

impl DdlParseError {
    pub fn new(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            position: None,
            sql: sql.into(),
        }
    }

    pub fn at(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }
}

/// Top-level pipeline error.
#[derive(Error, Debug)]
pub enum MillraceError {
    /// Connection to the upstream or metadata database was lost.
    #[error("connection lost: {0}")]
    ConnectLost(String),

    /// The requested binlog file or GTID is no longer retained upstream.
    /// Unrecoverable; the daemon exits with status 2.
    #[error("binlog retention lost: {0}")]
    BinlogRetentionLost(String),

    /// DDL apply precondition failed; schema mirror can no longer be trusted.
    #[error(transparent)]
    SchemaSync(#[from] SchemaSyncError),

    /// Row decode mismatch against the tracked schema.
    #[error(transparent)]
    ColumnCast(#[from] ColumnCastError),

    /// DDL statement not understood.
    #[error(transparent)]
    DdlParse(#[from] DdlParseError),

    /// The producer failed to acknowledge a record.
    #[error("producer error: {0}")]
    Producer(String),

    /// Schema or position store failure.
    #[error("store error: {0}")]
    Store(String),

    /// Lost the HA lease; terminate cleanly so a supervisor restarts us.
    #[error("leadership lost")]
    LeadershipLost,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Upstream MySQL error that is not a lost connection.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// An external call exceeded its configured timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MillraceError {
    pub fn connect_lost(msg: impl Into<String>) -> Self {
        Self::ConnectLost(msg.into())
    }

    pub fn retention_lost(msg: impl Into<String>) -> Self {
        Self::BinlogRetentionLost(msg.into())
    }

    pub fn producer(msg: impl Into<String>) -> Self {
        Self::Producer(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Classify a `mysql_async` error into the pipeline taxonomy.
    ///
    /// MySQL reports a purged binlog with ER_MASTER_FATAL_ERROR_READING_BINLOG
    /// (1236); unknown-GTID variants carry the same code.
    pub fn from_mysql(err: mysql_async::Error) -> Self {
        let msg = err.to_string();
        if msg.contains("1236") || msg.contains("Could not find first log") {
            return Self::BinlogRetentionLost(msg);
        }
        match err {
            mysql_async::Error::Io(_) | mysql_async::Error::Driver(_) => Self::ConnectLost(msg),
            _ => Self::Upstream(msg),
        }
    }

    /// Transient errors that may succeed on reconnect, retried with a
    /// bounded backoff before escalating.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::ConnectLost(_) | Self::Timeout(_) => true,
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }
            Self::BinlogRetentionLost(_)
            | Self::SchemaSync(_)
            | Self::ColumnCast(_)
            | Self::DdlParse(_)
            | Self::Producer(_)
            | Self::Store(_)
            | Self::LeadershipLost
            | Self::Config(_)
            | Self::Upstream(_)
            | Self::Json(_) => false,
        }
    }

    /// Process exit status for the daemon: 2 when the upstream no longer
    /// retains the requested binlog, 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::BinlogRetentionLost(_) => 2,
            _ => 1,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ConnectLost(_) | Self::Timeout(_) => ErrorCategory::Network,
            Self::BinlogRetentionLost(_) => ErrorCategory::Replication,
            Self::SchemaSync(_) | Self::ColumnCast(_) | Self::DdlParse(_) => ErrorCategory::Schema,
            Self::Producer(_) => ErrorCategory::Producer,
            Self::Store(_) | Self::Upstream(_) => ErrorCategory::Database,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::LeadershipLost | Self::Io(_) | Self::Json(_) => ErrorCategory::Other,
        }
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, MillraceError>;
