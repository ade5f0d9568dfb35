//! Recorded-stream loading
//!
//! The daemon can run against a recorded binlog event stream: a JSON
//! lines file of event envelopes, grouped into files by each envelope's
//! position. A live wire-protocol client plugs in behind the same
//! `BinlogClient` contract.

use anyhow::{Context, Result};
use millrace::replication::{EventEnvelope, StaticBinlogClient};
use std::path::Path;

/// Load a JSONL recording into a replayable client. The server id is
/// taken from the first envelope; envelopes must be in stream order.
pub fn load(path: &Path) -> Result<StaticBinlogClient> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading replay file {}", path.display()))?;

    let mut envelopes: Vec<EventEnvelope> = Vec::new();
    for (number, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let envelope: EventEnvelope = serde_json::from_str(line)
            .with_context(|| format!("parsing replay line {}", number + 1))?;
        envelopes.push(envelope);
    }

    let server_id = envelopes
        .first()
        .map(|e| e.server_id)
        .context("replay file contains no events")?;

    let mut client = StaticBinlogClient::new(server_id);
    let mut current: Option<(String, Vec<EventEnvelope>)> = None;
    for envelope in envelopes {
        let file = envelope.position.file.clone();
        match &mut current {
            Some((name, events)) if *name == file => events.push(envelope),
            _ => {
                if let Some((name, events)) = current.take() {
                    client = client.with_file(name, events);
                }
                current = Some((file, vec![envelope]));
            }
        }
    }
    if let Some((name, events)) = current {
        client = client.with_file(name, events);
    }
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use millrace::position::BinlogPosition;
    use millrace::replication::{BinlogClient, BinlogEvent};
    use std::io::Write;

    #[tokio::test]
    async fn loads_and_groups_by_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        for (file, offset, next) in [
            ("mysql-bin.000001", 4u64, 100u64),
            ("mysql-bin.000001", 100, 200),
            ("mysql-bin.000002", 4, 80),
        ] {
            let envelope = EventEnvelope::new(
                BinlogPosition::new(file, offset),
                BinlogPosition::new(file, next),
                10,
                0,
                BinlogEvent::Xid { xid: offset },
            );
            writeln!(tmp, "{}", serde_json::to_string(&envelope).unwrap()).unwrap();
        }
        tmp.flush().unwrap();

        let client = load(tmp.path()).unwrap();
        assert_eq!(client.server_id().await.unwrap(), 10);
        assert_eq!(
            client.binlog_files().await.unwrap(),
            vec!["mysql-bin.000001", "mysql-bin.000002"]
        );
    }

    #[test]
    fn empty_recording_is_an_error() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        assert!(load(tmp.path()).is_err());
    }
}
