//! Replication cursor types
//!
//! A [`Position`] names a point in the upstream's binlog, optionally with
//! the GTID executed set at that point and the id of the last heartbeat
//! row observed at or before it. Positions are totally ordered: GTID-set
//! inclusion when both sides carry sets, otherwise (file, offset).
//!
//! Binlog filenames carry a numeric suffix (`mysql-bin.000042`), so the
//! file component compares by that suffix rather than lexicographically.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// A `file:offset` coordinate within the upstream's binlog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BinlogPosition {
    pub file: String,
    pub offset: u64,
}

impl BinlogPosition {
    pub fn new(file: impl Into<String>, offset: u64) -> Self {
        Self {
            file: file.into(),
            offset,
        }
    }

    /// Numeric suffix of the binlog filename, e.g. 42 for `mysql-bin.000042`.
    pub fn file_number(&self) -> Option<u64> {
        self.file.rsplit('.').next()?.parse().ok()
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.offset)
    }
}

impl PartialOrd for BinlogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BinlogPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_file = match (self.file_number(), other.file_number()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => self.file.cmp(&other.file),
        };
        by_file
            .then(self.offset.cmp(&other.offset))
            .then_with(|| self.file.cmp(&other.file))
    }
}

/// A parsed GTID executed set: `uuid:1-5:7,uuid:1-3`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GtidSet {
    /// Source UUID -> sorted, merged closed intervals of transaction ids.
    intervals: BTreeMap<String, Vec<(u64, u64)>>,
}

impl GtidSet {
    /// Parse a GTID set string. Whitespace and newlines between entries
    /// are tolerated (the server emits both).
    pub fn parse(s: &str) -> Option<Self> {
        let mut intervals: BTreeMap<String, Vec<(u64, u64)>> = BTreeMap::new();
        for entry in s.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let mut parts = entry.split(':');
            let uuid = parts.next()?.trim().to_lowercase();
            if uuid.is_empty() {
                return None;
            }
            let ranges = intervals.entry(uuid).or_default();
            let mut seen_range = false;
            for range in parts {
                seen_range = true;
                let (lo, hi) = match range.split_once('-') {
                    Some((lo, hi)) => (lo.trim().parse().ok()?, hi.trim().parse().ok()?),
                    None => {
                        let v: u64 = range.trim().parse().ok()?;
                        (v, v)
                    }
                };
                if lo > hi {
                    return None;
                }
                ranges.push((lo, hi));
            }
            if !seen_range {
                return None;
            }
        }
        for ranges in intervals.values_mut() {
            ranges.sort_unstable();
            merge_intervals(ranges);
        }
        Some(Self { intervals })
    }

    /// Merge one transaction (`uuid:txid`) into the set; the replicator
    /// folds each observed GTID event into its running executed set.
    pub fn add(&mut self, gtid: &str) -> bool {
        let Some((uuid, txid)) = gtid.trim().split_once(':') else {
            return false;
        };
        let Ok(txid) = txid.trim().parse::<u64>() else {
            return false;
        };
        let ranges = self.intervals.entry(uuid.trim().to_lowercase()).or_default();
        ranges.push((txid, txid));
        ranges.sort_unstable();
        merge_intervals(ranges);
        true
    }

    /// True when every transaction in `other` is contained in `self`.
    pub fn contains(&self, other: &GtidSet) -> bool {
        other.intervals.iter().all(|(uuid, ranges)| {
            let Some(mine) = self.intervals.get(uuid) else {
                return ranges.is_empty();
            };
            ranges
                .iter()
                .all(|&(lo, hi)| mine.iter().any(|&(mlo, mhi)| mlo <= lo && hi <= mhi))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (uuid, ranges) in &self.intervals {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{uuid}")?;
            for (lo, hi) in ranges {
                if lo == hi {
                    write!(f, ":{lo}")?;
                } else {
                    write!(f, ":{lo}-{hi}")?;
                }
            }
        }
        Ok(())
    }
}

fn merge_intervals(ranges: &mut Vec<(u64, u64)>) {
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
    for &(lo, hi) in ranges.iter() {
        match merged.last_mut() {
            Some((_, last_hi)) if lo <= last_hi.saturating_add(1) => {
                *last_hi = (*last_hi).max(hi);
            }
            _ => merged.push((lo, hi)),
        }
    }
    *ranges = merged;
}

/// The replication cursor: binlog coordinate plus optional GTID executed
/// set and the id of the last heartbeat row read at or before it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub binlog: BinlogPosition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gtid_set: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<u64>,
}

impl Position {
    pub fn new(file: impl Into<String>, offset: u64) -> Self {
        Self {
            binlog: BinlogPosition::new(file, offset),
            gtid_set: None,
            last_heartbeat: None,
        }
    }

    pub fn with_gtid(mut self, gtid_set: impl Into<String>) -> Self {
        self.gtid_set = Some(gtid_set.into());
        self
    }

    pub fn with_heartbeat(mut self, heartbeat_id: u64) -> Self {
        self.last_heartbeat = Some(heartbeat_id);
        self
    }

    /// Strict "comes after" in the stream order. GTID-set inclusion wins
    /// when both sides carry a parseable set; otherwise (file, offset).
    pub fn newer_than(&self, other: &Position) -> bool {
        if let (Some(a), Some(b)) = (
            self.gtid_set.as_deref().and_then(GtidSet::parse),
            other.gtid_set.as_deref().and_then(GtidSet::parse),
        ) {
            return a.contains(&b) && a != b;
        }
        self.binlog > other.binlog
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.gtid_set {
            Some(g) => write!(f, "{} [{}]", self.binlog, g),
            None => write!(f, "{}", self.binlog),
        }
    }
}

/// What a successor needs to resume after the upstream primary is
/// replaced: the retiring server's identity, its last committed cursor
/// and the heartbeat id pinned at that cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryInfo {
    pub server_id: u64,
    pub client_id: String,
    pub heartbeat_id: u64,
    pub position: Position,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binlog_position_ordering() {
        let a = BinlogPosition::new("mysql-bin.000002", 900);
        let b = BinlogPosition::new("mysql-bin.000010", 4);
        assert!(a < b, "file number beats offset and lexicographic order");

        let c = BinlogPosition::new("mysql-bin.000002", 901);
        assert!(a < c);
        assert_eq!(a.file_number(), Some(2));
    }

    #[test]
    fn gtid_parse_and_contains() {
        let big = GtidSet::parse("3E11FA47-71CA-11E1-9E33-C80AA9429562:1-10").unwrap();
        let small = GtidSet::parse("3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5:7").unwrap();
        assert!(big.contains(&small));
        assert!(!small.contains(&big));
        assert!(big.contains(&big));
    }

    #[test]
    fn gtid_parse_merges_adjacent_ranges() {
        let set = GtidSet::parse("aaaa:1-3:4-6:9").unwrap();
        let whole = GtidSet::parse("aaaa:1-6").unwrap();
        assert!(set.contains(&whole));
        assert!(!set.contains(&GtidSet::parse("aaaa:7").unwrap()));
        assert!(set.contains(&GtidSet::parse("aaaa:9").unwrap()));
    }

    #[test]
    fn gtid_add_and_render() {
        let mut set = GtidSet::parse("aaaa:1-3").unwrap();
        assert!(set.add("aaaa:4"));
        assert!(set.add("bbbb:1"));
        assert!(!set.add("not-a-gtid"));
        assert_eq!(set.to_string(), "aaaa:1-4,bbbb:1");
    }

    #[test]
    fn gtid_parse_rejects_garbage() {
        assert!(GtidSet::parse("nonsense").is_none());
        assert!(GtidSet::parse("aaaa:9-3").is_none());
        assert!(GtidSet::parse("aaaa:x").is_none());
    }

    #[test]
    fn position_order_by_file_offset() {
        let p1 = Position::new("mysql-bin.000001", 500);
        let p2 = Position::new("mysql-bin.000001", 700);
        let p3 = Position::new("mysql-bin.000002", 4);

        assert!(p2.newer_than(&p1));
        assert!(p3.newer_than(&p2));
        assert!(!p1.newer_than(&p1));
    }

    #[test]
    fn position_order_prefers_gtid() {
        // Offsets say p1 is ahead; GTID sets say otherwise. GTID wins.
        let p1 = Position::new("mysql-bin.000009", 999).with_gtid("aaaa:1-5");
        let p2 = Position::new("mysql-bin.000001", 4).with_gtid("aaaa:1-8");
        assert!(p2.newer_than(&p1));
        assert!(!p1.newer_than(&p2));
    }

    #[test]
    fn position_roundtrips_json() {
        let p = Position::new("mysql-bin.000003", 120)
            .with_gtid("aaaa:1-3")
            .with_heartbeat(7);
        let json = serde_json::to_string(&p).unwrap();
        let back: Position = serde_json::from_str(&json).unwrap();
        assert_eq!(p, back);

        let bare = Position::new("mysql-bin.000003", 120);
        let json = serde_json::to_string(&bare).unwrap();
        assert!(!json.contains("gtid_set"));
        assert!(!json.contains("last_heartbeat"));
    }
}
