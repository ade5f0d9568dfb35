//! Replication pipeline
//!
//! Everything between the wire client and the producer: the event
//! model, the client contract, initial-position resolution (including
//! master-failover recovery), the heartbeat emitter and the replicator
//! loop itself.

pub mod client;
pub mod event;
pub mod heartbeat;
pub mod recovery;
pub mod replicator;

pub use client::{BinlogClient, StaticBinlogClient, EVENT_QUEUE_DEPTH};
pub use event::{BinlogEvent, EventEnvelope, RowImage};
pub use heartbeat::{
    HeartbeatEmitter, HeartbeatRow, HeartbeatWriter, MemoryHeartbeatWriter, MysqlHeartbeatWriter,
    SharedHeartbeatWriter,
};
pub use recovery::{Recovery, RecoveryConfig};
pub use replicator::{
    LiveSchemaSource, MysqlLiveSchema, Replicator, ReplicatorConfig, ReplicatorHandle, RunState,
};
