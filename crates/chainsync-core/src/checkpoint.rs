//! Checkpoint manager: periodic, restorable snapshots of indexed state.
//!
//! A checkpoint is taken at every height that is an exact multiple of the
//! configured interval. It records the block hash at that height plus a
//! [`SnapshotRef`] the state store can later restore. Rollback restores the
//! newest checkpoint at or below its target instead of reparsing from genesis.
//!
//! Checkpoint writes run under a time budget and never fail ingestion: a
//! failed or slow write is logged and the next eligible height tries again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::store::{SnapshotRef, StateStore};
use crate::types::BlockHash;

/// A persisted checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: u64,
    /// Hash of the block indexed at `height` when the checkpoint was taken.
    pub hash: BlockHash,
    pub snapshot: SnapshotRef,
    /// Unix timestamp of when this checkpoint was saved.
    pub created_at: i64,
}

/// Trait for storing and loading checkpoints.
///
/// Implemented by `MemoryStateStore` and `SqliteStateStore`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// All checkpoints, ascending by height.
    async fn load_all(&self) -> Result<Vec<Checkpoint>, IndexerError>;

    /// Load the checkpoint at exactly `height`.
    async fn load(&self, height: u64) -> Result<Option<Checkpoint>, IndexerError>;

    /// Save a checkpoint (upsert by height).
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError>;

    /// Delete the checkpoint at `height`, if any.
    async fn delete(&self, height: u64) -> Result<(), IndexerError>;
}

/// Decides when to snapshot and which checkpoints to keep.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    /// Snapshot every N blocks.
    interval: u64,
    /// How many of the newest checkpoints survive pruning.
    retain: usize,
    /// Time budget for one checkpoint write.
    timeout: Duration,
    /// Failed or timed-out writes since start.
    failures: u64,
}

impl CheckpointManager {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        interval: u64,
        retain: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            interval,
            retain,
            timeout,
            failures: 0,
        }
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Number of checkpoint writes that failed or ran out of time.
    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Returns `true` if `height` is a checkpoint boundary.
    pub fn is_boundary(&self, height: u64) -> bool {
        self.interval > 0 && height % self.interval == 0
    }

    /// Create a checkpoint at `height` iff it is a boundary and none exists yet.
    ///
    /// Call this after the block at `height` is committed. Returns the new
    /// checkpoint, or `None` if nothing was written.
    pub async fn maybe_checkpoint(
        &mut self,
        height: u64,
        hash: BlockHash,
        state: &dyn StateStore,
    ) -> Option<Checkpoint> {
        if !self.is_boundary(height) {
            return None;
        }

        let store = Arc::clone(&self.store);
        let write = async move {
            if store.load(height).await?.is_some() {
                return Ok(None);
            }
            let snapshot = state.snapshot(height).await?;
            if snapshot.block_hash != hash {
                return Err(IndexerError::Persistence(format!(
                    "snapshot hash {} does not match committed block {hash} at {height}",
                    snapshot.block_hash
                )));
            }
            let cp = Checkpoint {
                height,
                hash,
                snapshot,
                created_at: chrono::Utc::now().timestamp(),
            };
            store.save(cp.clone()).await?;
            Ok::<_, IndexerError>(Some(cp))
        };

        match tokio::time::timeout(self.timeout, write).await {
            Ok(Ok(Some(cp))) => {
                tracing::debug!(height, hash = %hash, records = cp.snapshot.record_count, "checkpoint saved");
                if let Err(e) = self.prune(self.retain).await {
                    tracing::warn!(error = %e, "checkpoint pruning failed");
                }
                Some(cp)
            }
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                self.failures += 1;
                tracing::warn!(height, error = %e, "checkpoint write failed, will retry at next boundary");
                None
            }
            Err(_) => {
                self.failures += 1;
                tracing::warn!(
                    height,
                    budget_ms = self.timeout.as_millis() as u64,
                    "checkpoint write exceeded time budget, deferred to next boundary"
                );
                None
            }
        }
    }

    /// Newest checkpoint with height `<= height`.
    pub async fn latest_checkpoint_at_or_below(
        &self,
        height: u64,
    ) -> Result<Option<Checkpoint>, IndexerError> {
        let all = self.store.load_all().await?;
        Ok(all.into_iter().rev().find(|cp| cp.height <= height))
    }

    /// All checkpoints, ascending by height.
    pub async fn checkpoints(&self) -> Result<Vec<Checkpoint>, IndexerError> {
        self.store.load_all().await
    }

    /// Delete all but the `retain_count` newest checkpoints.
    ///
    /// The newest checkpoint always survives, even with `retain_count == 0`.
    /// Returns how many were deleted.
    pub async fn prune(&self, retain_count: usize) -> Result<usize, IndexerError> {
        let all = self.store.load_all().await?;
        let keep = retain_count.max(1);
        if all.len() <= keep {
            return Ok(0);
        }
        let doomed = &all[..all.len() - keep];
        for cp in doomed {
            self.store.delete(cp.height).await?;
        }
        tracing::debug!(deleted = doomed.len(), kept = keep, "pruned checkpoints");
        Ok(doomed.len())
    }

    /// Delete every checkpoint above `height` (their state was rolled back).
    pub async fn discard_above(&self, height: u64) -> Result<(), IndexerError> {
        for cp in self.store.load_all().await? {
            if cp.height > height {
                self.store.delete(cp.height).await?;
            }
        }
        Ok(())
    }

    /// Delete a single checkpoint (e.g. one whose snapshot no longer validates).
    pub async fn remove(&self, height: u64) -> Result<(), IndexerError> {
        self.store.delete(height).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;
    use crate::types::{IndexedRecord, RecordKind};

    fn hash(height: u64) -> BlockHash {
        let mut h = [0u8; 32];
        h[..8].copy_from_slice(&height.to_be_bytes());
        BlockHash(h)
    }

    fn record(height: u64) -> IndexedRecord {
        IndexedRecord {
            height,
            position: 0,
            kind: RecordKind::Transaction,
            key: format!("tx{height}"),
            data: vec![height as u8],
        }
    }

    async fn store_with(len: u64) -> Arc<MemoryStateStore> {
        let store = Arc::new(MemoryStateStore::new());
        for h in 0..len {
            let parent = if h == 0 { BlockHash::ZERO } else { hash(h - 1) };
            store.commit(h, hash(h), parent, &[record(h)]).await.unwrap();
        }
        store
    }

    fn manager(store: Arc<MemoryStateStore>, interval: u64, retain: usize) -> CheckpointManager {
        CheckpointManager::new(store, interval, retain, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn checkpoints_only_on_boundaries() {
        let store = store_with(21).await;
        let mut mgr = manager(store.clone(), 5, 100);

        for h in 0..21 {
            mgr.maybe_checkpoint(h, hash(h), store.as_ref()).await;
        }
        let heights: Vec<u64> = mgr.checkpoints().await.unwrap().iter().map(|c| c.height).collect();
        assert_eq!(heights, vec![0, 5, 10, 15, 20]);
    }

    #[tokio::test]
    async fn no_duplicate_checkpoint_at_same_height() {
        let store = store_with(11).await;
        let mut mgr = manager(store.clone(), 10, 100);

        assert!(mgr.maybe_checkpoint(10, hash(10), store.as_ref()).await.is_some());
        assert!(mgr.maybe_checkpoint(10, hash(10), store.as_ref()).await.is_none());
        assert_eq!(mgr.checkpoints().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn snapshot_captures_record_count() {
        let store = store_with(11).await;
        let mut mgr = manager(store.clone(), 10, 100);
        let cp = mgr.maybe_checkpoint(10, hash(10), store.as_ref()).await.unwrap();
        assert_eq!(cp.snapshot.height, 10);
        assert_eq!(cp.snapshot.record_count, 11);
        assert_eq!(cp.hash, hash(10));
    }

    #[tokio::test]
    async fn hash_mismatch_is_not_fatal() {
        let store = store_with(11).await;
        let mut mgr = manager(store.clone(), 10, 100);
        assert!(mgr.maybe_checkpoint(10, hash(99), store.as_ref()).await.is_none());
        assert_eq!(mgr.failures(), 1);
        assert!(mgr.checkpoints().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn latest_at_or_below() {
        let store = store_with(31).await;
        let mut mgr = manager(store.clone(), 10, 100);
        for h in [0, 10, 20, 30] {
            mgr.maybe_checkpoint(h, hash(h), store.as_ref()).await;
        }
        assert_eq!(mgr.latest_checkpoint_at_or_below(25).await.unwrap().unwrap().height, 20);
        assert_eq!(mgr.latest_checkpoint_at_or_below(30).await.unwrap().unwrap().height, 30);
        assert_eq!(mgr.latest_checkpoint_at_or_below(9).await.unwrap().unwrap().height, 0);
    }

    #[tokio::test]
    async fn latest_returns_none_when_empty() {
        let store = store_with(1).await;
        let mgr = manager(store, 10, 100);
        assert!(mgr.latest_checkpoint_at_or_below(1_000).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn prune_keeps_newest() {
        let store = store_with(51).await;
        let mut mgr = manager(store.clone(), 10, 100);
        for h in (0..=50).step_by(10) {
            mgr.maybe_checkpoint(h, hash(h), store.as_ref()).await;
        }
        assert_eq!(mgr.prune(2).await.unwrap(), 4);
        let heights: Vec<u64> = mgr.checkpoints().await.unwrap().iter().map(|c| c.height).collect();
        assert_eq!(heights, vec![40, 50]);

        // retain 0 still keeps the newest one
        assert_eq!(mgr.prune(0).await.unwrap(), 1);
        let heights: Vec<u64> = mgr.checkpoints().await.unwrap().iter().map(|c| c.height).collect();
        assert_eq!(heights, vec![50]);
    }

    #[tokio::test]
    async fn retention_applied_after_each_write() {
        let store = store_with(41).await;
        let mut mgr = manager(store.clone(), 10, 2);
        for h in 0..41 {
            mgr.maybe_checkpoint(h, hash(h), store.as_ref()).await;
        }
        let heights: Vec<u64> = mgr.checkpoints().await.unwrap().iter().map(|c| c.height).collect();
        assert_eq!(heights, vec![30, 40]);
    }

    #[tokio::test]
    async fn discard_above_drops_newer() {
        let store = store_with(31).await;
        let mut mgr = manager(store.clone(), 10, 100);
        for h in [0, 10, 20, 30] {
            mgr.maybe_checkpoint(h, hash(h), store.as_ref()).await;
        }
        mgr.discard_above(15).await.unwrap();
        let heights: Vec<u64> = mgr.checkpoints().await.unwrap().iter().map(|c| c.height).collect();
        assert_eq!(heights, vec![0, 10]);
    }
}
