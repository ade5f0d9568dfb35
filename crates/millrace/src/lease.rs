//! HA lease
//!
//! Single-leader election gating the replicator: only the leader tails
//! the binlog, followers idle until the lease moves. The election
//! primitive itself is a pluggable black box; any backend that can
//! resolve "this member is now leader" and report loss of leadership
//! fits behind [`LeaderElection`]. Relinquishing is dropping the handle.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::info;

/// Held while this process is the leader. Dropping it relinquishes the
/// lease.
pub struct LeaseHandle {
    lost: watch::Receiver<bool>,
    _guard: Option<OwnedMutexGuard<()>>,
}

impl LeaseHandle {
    /// Resolves when leadership is lost. Never resolves for a standalone
    /// (non-HA) lease.
    pub async fn lost(&mut self) {
        loop {
            if *self.lost.borrow() {
                return;
            }
            if self.lost.changed().await.is_err() {
                // electorate gone; treat as deposed
                return;
            }
        }
    }

    /// Non-blocking check.
    pub fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }
}

/// Election contract: block until this member observes itself as leader.
#[async_trait]
pub trait LeaderElection: Send + Sync {
    async fn acquire(&self, group: &str, member: &str) -> Result<LeaseHandle>;
}

/// Shared election handle.
pub type SharedElection = Arc<dyn LeaderElection>;

/// No-op election for non-HA deployments: always leader, never deposed.
#[derive(Default)]
pub struct StandaloneElection {
    // keep one sender alive so the receiver never reports closure
    keeper: Mutex<Vec<watch::Sender<bool>>>,
}

impl StandaloneElection {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaderElection for StandaloneElection {
    async fn acquire(&self, _group: &str, member: &str) -> Result<LeaseHandle> {
        let (tx, rx) = watch::channel(false);
        self.keeper.lock().await.push(tx);
        info!(member, "standalone mode, assuming leadership");
        Ok(LeaseHandle {
            lost: rx,
            _guard: None,
        })
    }
}

/// In-process election: first caller leads, later callers queue until
/// the leader drops its handle or is deposed. Backs the HA code path in
/// tests and single-host deployments.
pub struct LocalElection {
    seat: Arc<Mutex<()>>,
    holders: Mutex<VecDeque<watch::Sender<bool>>>,
}

impl Default for LocalElection {
    fn default() -> Self {
        Self {
            seat: Arc::new(Mutex::new(())),
            holders: Mutex::new(VecDeque::new()),
        }
    }
}

impl LocalElection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Depose the current leader; its handle reports loss. The seat
    /// itself frees when the deposed leader drops the handle.
    pub async fn depose(&self) {
        let mut holders = self.holders.lock().await;
        while let Some(tx) = holders.pop_front() {
            if tx.send(true).is_ok() {
                break;
            }
        }
    }
}

#[async_trait]
impl LeaderElection for LocalElection {
    async fn acquire(&self, group: &str, member: &str) -> Result<LeaseHandle> {
        let guard = self.seat.clone().lock_owned().await;
        let (tx, rx) = watch::channel(false);
        self.holders.lock().await.push_back(tx);
        info!(group, member, "acquired leadership");
        Ok(LeaseHandle {
            lost: rx,
            _guard: Some(guard),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn standalone_is_immediately_leader() {
        let election = StandaloneElection::new();
        let lease = election.acquire("g", "m1").await.unwrap();
        assert!(!lease.is_lost());
    }

    #[tokio::test]
    async fn only_one_leader_at_a_time() {
        let election = Arc::new(LocalElection::new());
        let first = election.acquire("g", "m1").await.unwrap();

        let contender = {
            let election = election.clone();
            tokio::spawn(async move { election.acquire("g", "m2").await.unwrap() })
        };

        // the contender must still be blocked
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(first);
        let second = contender.await.unwrap();
        assert!(!second.is_lost());
    }

    #[tokio::test]
    async fn depose_notifies_leader() {
        let election = LocalElection::new();
        let mut lease = election.acquire("g", "m1").await.unwrap();

        election.depose().await;
        tokio::time::timeout(Duration::from_secs(1), lease.lost())
            .await
            .expect("deposed leader must observe the loss");
        assert!(lease.is_lost());
    }
}
