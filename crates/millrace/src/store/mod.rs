//! Durable state
//!
//! The two stores this system owns in its companion metadata database:
//! the schema store (snapshot/delta chains keyed by position) and the
//! position store (the committed cursor plus recovery candidates). Both
//! come as an in-memory reference implementation and a MySQL-backed one.

pub mod mysql;
pub mod position_store;
pub mod schema_store;

pub use mysql::{ensure_metadata_schema, MysqlPositionStore, MysqlSchemaStore};
pub use position_store::{
    MemoryPositionBacking, MemoryPositionStore, PositionStore, SharedPositionStore,
};
pub use schema_store::{
    Compactor, MemorySchemaBacking, MemorySchemaStore, SchemaEntry, SchemaStore, SharedSchemaStore,
};
