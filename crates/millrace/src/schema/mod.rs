//! Schema tracking
//!
//! The binlog carries row images without column names or declared types,
//! so decoding depends on an in-memory mirror of the upstream catalog
//! that is kept in lock-step by interpreting DDL as it appears in the
//! stream:
//!
//! - [`model`]: copy-on-write catalog snapshots
//! - [`columndef`]: typed columns and row-cell decoding
//! - [`delta`]: parsed DDL as appliable change objects
//! - [`ddl`]: the SQL-to-delta parser
//! - [`capture`]: INFORMATION_SCHEMA introspection

pub mod capture;
pub mod columndef;
pub mod ddl;
pub mod delta;
pub mod model;

pub use columndef::{CellValue, ColumnDef, ColumnType};
pub use delta::{ColumnPosition, SchemaDelta};
pub use model::{CaseSensitivity, Database, Schema, Table};
