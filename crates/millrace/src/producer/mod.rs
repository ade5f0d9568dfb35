//! Producers
//!
//! A producer is the downstream sink for canonical row-change records:
//! `enqueue` resolves once the sink has acknowledged the record, and the
//! replicator only advances its cursor past acknowledged records.
//! Acknowledgment order equals emission order.

use crate::error::{MillraceError, Result};
use crate::position::Position;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::debug;

/// Row operation carried by a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKind::Insert => write!(f, "insert"),
            RecordKind::Update => write!(f, "update"),
            RecordKind::Delete => write!(f, "delete"),
        }
    }
}

/// A canonical row-change record: the decoded row plus its schema and
/// stream context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowRecord {
    pub database: String,
    pub table: String,
    #[serde(rename = "type")]
    pub kind: RecordKind,
    /// Binlog event timestamp, epoch seconds.
    pub ts: i64,
    /// Stream position of the carrying event.
    pub position: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xid: Option<u64>,
    /// Row image after the change (before image for deletes).
    pub data: Map<String, Value>,
    /// Row image before the change, updates only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<Map<String, Value>>,
}

impl RowRecord {
    pub fn new(
        database: impl Into<String>,
        table: impl Into<String>,
        kind: RecordKind,
        ts: i64,
        position: &Position,
    ) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            kind,
            ts,
            position: position.binlog.to_string(),
            xid: None,
            data: Map::new(),
            old: None,
        }
    }

    pub fn with_xid(mut self, xid: u64) -> Self {
        self.xid = Some(xid);
        self
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn with_old(mut self, old: Map<String, Value>) -> Self {
        self.old = Some(old);
        self
    }

    /// One-line JSON rendering, the wire format for line-based sinks.
    pub fn to_json_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Downstream sink contract.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Enqueue a record; resolves once the sink acknowledges it.
    async fn enqueue(&self, record: RowRecord) -> Result<()>;

    /// Block until every acknowledged record is durable at the sink.
    async fn flush(&self) -> Result<()>;
}

/// Shared producer handle.
pub type SharedProducer = Arc<dyn Producer>;

/// Writes records to stdout, one JSON object per line.
#[derive(Default)]
pub struct StdoutProducer {
    out: Mutex<()>,
}

impl StdoutProducer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Producer for StdoutProducer {
    async fn enqueue(&self, record: RowRecord) -> Result<()> {
        let line = record.to_json_line()?;
        let _guard = self.out.lock().await;
        let mut stdout = tokio::io::stdout();
        stdout.write_all(line.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        tokio::io::stdout().flush().await?;
        Ok(())
    }
}

/// Appends records to a file, one JSON object per line.
pub struct FileProducer {
    writer: Mutex<BufWriter<File>>,
}

impl FileProducer {
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .await?;
        debug!(path = %path.as_ref().display(), "file producer ready");
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

#[async_trait]
impl Producer for FileProducer {
    async fn enqueue(&self, record: RowRecord) -> Result<()> {
        let line = record.to_json_line()?;
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.flush().await?;
        writer.get_mut().sync_all().await?;
        Ok(())
    }
}

/// Collects records in memory; the test sink. Can be told to refuse
/// acknowledgment to exercise the producer-error path.
#[derive(Default)]
pub struct MemoryProducer {
    records: Mutex<Vec<RowRecord>>,
    failing: std::sync::atomic::AtomicBool,
}

impl MemoryProducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<RowRecord> {
        self.records.lock().await.clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn enqueue(&self, record: RowRecord) -> Result<()> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(MillraceError::producer("sink refused the record"));
        }
        self.records.lock().await.push(record);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> RowRecord {
        let mut data = Map::new();
        data.insert("id".to_string(), json!(42));
        data.insert("name".to_string(), json!("x"));
        RowRecord::new(
            "d",
            "u",
            RecordKind::Insert,
            1_700_000_000,
            &Position::new("mysql-bin.000001", 500),
        )
        .with_xid(9)
        .with_data(data)
    }

    #[test]
    fn record_json_shape() {
        let line = sample().to_json_line().unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["database"], "d");
        assert_eq!(value["table"], "u");
        assert_eq!(value["type"], "insert");
        assert_eq!(value["data"]["id"], 42);
        assert_eq!(value["data"]["name"], "x");
        assert_eq!(value["position"], "mysql-bin.000001:500");
        assert!(value.get("old").is_none());
    }

    #[test]
    fn update_record_carries_old() {
        let mut old = Map::new();
        old.insert("name".to_string(), json!("before"));
        let record = sample().with_old(old);
        let value: Value = serde_json::from_str(&record.to_json_line().unwrap()).unwrap();
        assert_eq!(value["old"]["name"], "before");
    }

    #[tokio::test]
    async fn memory_producer_collects_in_order() {
        let producer = MemoryProducer::new();
        producer.enqueue(sample()).await.unwrap();
        let mut second = sample();
        second.kind = RecordKind::Delete;
        producer.enqueue(second).await.unwrap();

        let records = producer.records().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, RecordKind::Insert);
        assert_eq!(records[1].kind, RecordKind::Delete);
    }

    #[tokio::test]
    async fn memory_producer_failure() {
        let producer = MemoryProducer::new();
        producer.set_failing(true);
        let err = producer.enqueue(sample()).await.unwrap_err();
        assert!(matches!(err, MillraceError::Producer(_)));
    }

    #[tokio::test]
    async fn file_producer_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.jsonl");
        let producer = FileProducer::create(&path).await.unwrap();
        producer.enqueue(sample()).await.unwrap();
        producer.flush().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("\"type\":\"insert\""));
    }
}
