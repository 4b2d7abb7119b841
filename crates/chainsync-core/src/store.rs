//! State store contract and the in-memory backend.
//!
//! The store owns the indexed records and the chain tip. Every mutation is
//! atomic: a reader sees a block's records together with the tip that covers
//! them, or neither. Only one engine may write at a time
//! ([`StateStore::acquire_writer`]).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::error::IndexerError;
use crate::tip::ChainTip;
use crate::types::{BlockHash, IndexedRecord, Network};

/// Reference to a point-in-time state, restorable with [`StateStore::restore`].
///
/// Committed state below the tip is append-only, so the state at `height` is
/// identified by the block hash there and the number of records at or below
/// it. A reference that stops matching the store is corrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub height: u64,
    pub block_hash: BlockHash,
    /// Records at heights `<= height` when the snapshot was taken.
    pub record_count: u64,
}

/// Durable, crash-consistent storage of indexed records and the chain tip.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current chain tip, `None` for an empty store.
    async fn tip(&self) -> Result<Option<ChainTip>, IndexerError>;

    /// Network this store was bootstrapped for.
    async fn network(&self) -> Result<Option<Network>, IndexerError>;

    async fn set_network(&self, network: Network) -> Result<(), IndexerError>;

    /// Atomically persist a block's records and advance the tip to it.
    ///
    /// `height` must be `tip + 1` (or 0 on an empty store) and `parent_hash`
    /// must equal the tip hash.
    async fn commit(
        &self,
        height: u64,
        hash: BlockHash,
        parent_hash: BlockHash,
        records: &[IndexedRecord],
    ) -> Result<ChainTip, IndexerError>;

    /// Atomically replace the records of an already committed block.
    /// The tip does not move.
    async fn replace_records(
        &self,
        height: u64,
        hash: BlockHash,
        records: &[IndexedRecord],
    ) -> Result<(), IndexerError>;

    /// Remove every block and record above `height`. Returns the new tip.
    async fn truncate_above(&self, height: u64) -> Result<Option<ChainTip>, IndexerError>;

    /// Remove every block and record, genesis included. Network and
    /// checkpoints are kept.
    async fn reset(&self) -> Result<(), IndexerError>;

    /// Capture a reference to the state at `height` (`height <= tip`).
    async fn snapshot(&self, height: u64) -> Result<SnapshotRef, IndexerError>;

    /// Validate `snapshot` against the store and truncate to it.
    ///
    /// Fails with [`IndexerError::CheckpointUnavailable`] if the reference no
    /// longer matches the stored data.
    async fn restore(&self, snapshot: &SnapshotRef) -> Result<ChainTip, IndexerError>;

    /// Hash of the committed block at `height`.
    async fn block_hash(&self, height: u64) -> Result<Option<BlockHash>, IndexerError>;

    /// Records of the block at `height`, ordered by position.
    async fn records_at(&self, height: u64) -> Result<Vec<IndexedRecord>, IndexerError>;

    /// Records with `from <= height <= to`, ordered by height then position.
    async fn records_in(&self, from: u64, to: u64) -> Result<Vec<IndexedRecord>, IndexerError>;

    /// Total number of stored records.
    async fn record_count(&self) -> Result<u64, IndexerError>;

    /// Claim the single-writer lock. Fails if another engine holds it.
    fn acquire_writer(&self) -> Result<(), IndexerError>;

    fn release_writer(&self);
}

/// Records must be keyed `(height, 0..n)` in order.
pub fn check_records(height: u64, records: &[IndexedRecord]) -> Result<(), IndexerError> {
    for (i, r) in records.iter().enumerate() {
        if r.height != height || r.position as usize != i {
            return Err(IndexerError::Parse {
                height,
                reason: format!(
                    "record {i} is keyed ({}, {}), expected ({height}, {i})",
                    r.height, r.position
                ),
            });
        }
    }
    Ok(())
}

/// A commit at `height` must directly extend `tip` (or be genesis on an
/// empty store).
pub fn check_extends(
    tip: Option<&ChainTip>,
    height: u64,
    parent_hash: BlockHash,
) -> Result<(), IndexerError> {
    let ok = match tip {
        None => height == 0,
        Some(tip) => height == tip.height + 1 && parent_hash == tip.hash,
    };
    if ok {
        Ok(())
    } else {
        Err(IndexerError::ChainMismatch {
            height,
            reason: match tip {
                None => "first commit must be the genesis block".into(),
                Some(tip) => format!("block does not extend local tip {tip}"),
            },
        })
    }
}

// ─── In-memory store ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct StoredBlock {
    hash: BlockHash,
    records: Vec<IndexedRecord>,
}

#[derive(Default)]
struct MemoryState {
    network: Option<Network>,
    tip: Option<ChainTip>,
    blocks: BTreeMap<u64, StoredBlock>,
    checkpoints: BTreeMap<u64, Checkpoint>,
}

impl MemoryState {
    fn records_up_to(&self, height: u64) -> u64 {
        self.blocks.range(..=height).map(|(_, b)| b.records.len() as u64).sum()
    }

    fn truncate_above(&mut self, height: u64) -> Option<ChainTip> {
        self.blocks.split_off(&(height + 1));
        self.tip = self
            .blocks
            .iter()
            .next_back()
            .map(|(h, b)| ChainTip::new(*h, b.hash));
        self.tip
    }
}

/// In-memory state store.
///
/// All data is lost when the process exits. A single `RwLock` guards the
/// whole state, so readers never observe a half-applied commit.
#[derive(Default)]
pub struct MemoryStateStore {
    state: RwLock<MemoryState>,
    writer: AtomicBool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>, IndexerError> {
        self.state
            .read()
            .map_err(|_| IndexerError::Persistence("memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>, IndexerError> {
        self.state
            .write()
            .map_err(|_| IndexerError::Persistence("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn tip(&self) -> Result<Option<ChainTip>, IndexerError> {
        Ok(self.read()?.tip)
    }

    async fn network(&self) -> Result<Option<Network>, IndexerError> {
        Ok(self.read()?.network)
    }

    async fn set_network(&self, network: Network) -> Result<(), IndexerError> {
        self.write()?.network = Some(network);
        Ok(())
    }

    async fn commit(
        &self,
        height: u64,
        hash: BlockHash,
        parent_hash: BlockHash,
        records: &[IndexedRecord],
    ) -> Result<ChainTip, IndexerError> {
        check_records(height, records)?;
        let mut state = self.write()?;
        check_extends(state.tip.as_ref(), height, parent_hash)?;
        state.blocks.insert(
            height,
            StoredBlock {
                hash,
                records: records.to_vec(),
            },
        );
        let tip = ChainTip::new(height, hash);
        state.tip = Some(tip);
        Ok(tip)
    }

    async fn replace_records(
        &self,
        height: u64,
        hash: BlockHash,
        records: &[IndexedRecord],
    ) -> Result<(), IndexerError> {
        check_records(height, records)?;
        let mut state = self.write()?;
        match state.blocks.get_mut(&height) {
            Some(block) if block.hash == hash => {
                block.records = records.to_vec();
                Ok(())
            }
            Some(block) => Err(IndexerError::ChainMismatch {
                height,
                reason: format!("indexed block is {}, source block is {hash}", block.hash),
            }),
            None => Err(IndexerError::Persistence(format!("no committed block at height {height}"))),
        }
    }

    async fn truncate_above(&self, height: u64) -> Result<Option<ChainTip>, IndexerError> {
        Ok(self.write()?.truncate_above(height))
    }

    async fn reset(&self) -> Result<(), IndexerError> {
        let mut state = self.write()?;
        state.blocks.clear();
        state.tip = None;
        Ok(())
    }

    async fn snapshot(&self, height: u64) -> Result<SnapshotRef, IndexerError> {
        let state = self.read()?;
        let block = state.blocks.get(&height).ok_or_else(|| {
            IndexerError::Persistence(format!("cannot snapshot uncommitted height {height}"))
        })?;
        Ok(SnapshotRef {
            height,
            block_hash: block.hash,
            record_count: state.records_up_to(height),
        })
    }

    async fn restore(&self, snapshot: &SnapshotRef) -> Result<ChainTip, IndexerError> {
        let mut state = self.write()?;
        let valid = state
            .blocks
            .get(&snapshot.height)
            .is_some_and(|b| b.hash == snapshot.block_hash)
            && state.records_up_to(snapshot.height) == snapshot.record_count;
        if !valid {
            return Err(IndexerError::CheckpointUnavailable { height: snapshot.height });
        }
        state
            .truncate_above(snapshot.height)
            .ok_or(IndexerError::CheckpointUnavailable { height: snapshot.height })
    }

    async fn block_hash(&self, height: u64) -> Result<Option<BlockHash>, IndexerError> {
        Ok(self.read()?.blocks.get(&height).map(|b| b.hash))
    }

    async fn records_at(&self, height: u64) -> Result<Vec<IndexedRecord>, IndexerError> {
        Ok(self
            .read()?
            .blocks
            .get(&height)
            .map(|b| b.records.clone())
            .unwrap_or_default())
    }

    async fn records_in(&self, from: u64, to: u64) -> Result<Vec<IndexedRecord>, IndexerError> {
        if from > to {
            return Ok(vec![]);
        }
        Ok(self
            .read()?
            .blocks
            .range(from..=to)
            .flat_map(|(_, b)| b.records.iter().cloned())
            .collect())
    }

    async fn record_count(&self) -> Result<u64, IndexerError> {
        let state = self.read()?;
        Ok(state.blocks.values().map(|b| b.records.len() as u64).sum())
    }

    fn acquire_writer(&self) -> Result<(), IndexerError> {
        self.writer
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| {
                IndexerError::Configuration("state store already has an active writer".into())
            })
    }

    fn release_writer(&self) {
        self.writer.store(false, Ordering::Release);
    }
}

#[async_trait]
impl CheckpointStore for MemoryStateStore {
    async fn load_all(&self) -> Result<Vec<Checkpoint>, IndexerError> {
        Ok(self.read()?.checkpoints.values().cloned().collect())
    }

    async fn load(&self, height: u64) -> Result<Option<Checkpoint>, IndexerError> {
        Ok(self.read()?.checkpoints.get(&height).cloned())
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError> {
        self.write()?.checkpoints.insert(checkpoint.height, checkpoint);
        Ok(())
    }

    async fn delete(&self, height: u64) -> Result<(), IndexerError> {
        self.write()?.checkpoints.remove(&height);
        Ok(())
    }
}
