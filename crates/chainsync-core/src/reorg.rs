//! Reorg detection. Finds where the local chain and the source chain part.
//!
//! The engine runs a cheap check on every block (does its parent hash match
//! the local tip?) and only walks back when that fails or the source head
//! drops below the local tip. The walk is bounded by checkpoint floors:
//! retained checkpoints are probed newest first, and the highest one still
//! on the source chain caps how far the linear walk has to go.
//!
//! Three situations end up here:
//! 1. **Short reorg (1-3 blocks)**: parent hash mismatch on the next block
//! 2. **Deep reorg**: the fork point is more than 3 blocks below the tip
//! 3. **Source regression**: the source head is below the local tip

use std::fmt;

use crate::checkpoint::Checkpoint;
use crate::error::IndexerError;
use crate::source::{BlockFetcher, BlockSource};
use crate::store::StateStore;
use crate::tip::ChainTip;
use crate::types::BlockHash;

/// Highest block present on both the local chain and the source chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkPoint {
    pub height: u64,
    pub hash: BlockHash,
}

/// Describes a detected chain reorganization.
#[derive(Debug, Clone)]
pub struct ReorgEvent {
    pub fork_point: ForkPoint,
    /// Height at which the divergence was noticed.
    pub detected_at: u64,
    /// Number of local blocks above the fork point.
    pub depth: u64,
    pub reorg_type: ReorgType,
}

/// Classification of the reorg type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorgType {
    /// Fork point at most `short_depth` blocks below the tip.
    ShortReorg,
    /// Fork point further down.
    DeepReorg,
    /// The source head went below the local tip.
    SourceRegression,
}

impl fmt::Display for ReorgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShortReorg => write!(f, "short reorg"),
            Self::DeepReorg => write!(f, "deep reorg"),
            Self::SourceRegression => write!(f, "source regression"),
        }
    }
}

/// Detects and classifies chain reorganizations.
pub struct ReorgDetector {
    /// Reorgs up to this many blocks deep count as short.
    short_depth: u64,
}

impl Default for ReorgDetector {
    fn default() -> Self {
        Self::new(3)
    }
}

impl ReorgDetector {
    pub fn new(short_depth: u64) -> Self {
        Self { short_depth }
    }

    /// Compare the local chain ending at `local_tip` against the source.
    ///
    /// Returns `None` if the source still has `local_tip` on its best chain,
    /// otherwise the fork point. `checkpoints` must be the retained
    /// checkpoints, ascending. Fails with [`IndexerError::ChainMismatch`] if
    /// no common ancestor exists down to height 0.
    pub async fn check_divergence<S: BlockSource>(
        &self,
        local_tip: &ChainTip,
        fetcher: &BlockFetcher<S>,
        store: &dyn StateStore,
        checkpoints: &[Checkpoint],
    ) -> Result<Option<ReorgEvent>, IndexerError> {
        let head = fetcher.head().await?;
        let regressed = head.height < local_tip.height;
        let start = local_tip.height.min(head.height);

        let local_at_start = local_hash(store, start).await?;
        if fetcher.block_hash(start).await? == Some(local_at_start) {
            if !regressed {
                return Ok(None);
            }
            let fork_point = ForkPoint { height: start, hash: local_at_start };
            return Ok(Some(self.event(local_tip, fork_point, start, true)));
        }

        // Highest retained checkpoint still on the source chain.
        let mut floor = None;
        for cp in checkpoints.iter().rev().filter(|cp| cp.height < start) {
            if fetcher.block_hash(cp.height).await? == Some(cp.hash) {
                floor = Some(ForkPoint { height: cp.height, hash: cp.hash });
                break;
            }
        }

        let lower = floor.map(|f| f.height + 1).unwrap_or(0);
        let mut fork_point = None;
        let mut h = start;
        while h > lower {
            h -= 1;
            let local = local_hash(store, h).await?;
            if fetcher.block_hash(h).await? == Some(local) {
                fork_point = Some(ForkPoint { height: h, hash: local });
                break;
            }
        }

        let fork_point = fork_point.or(floor).ok_or_else(|| IndexerError::ChainMismatch {
            height: 0,
            reason: "no common ancestor with the block source; wrong network or misconfigured source"
                .into(),
        })?;
        Ok(Some(self.event(local_tip, fork_point, start, regressed)))
    }

    fn event(
        &self,
        local_tip: &ChainTip,
        fork_point: ForkPoint,
        detected_at: u64,
        regressed: bool,
    ) -> ReorgEvent {
        let depth = local_tip.height - fork_point.height;
        let reorg_type = if regressed {
            ReorgType::SourceRegression
        } else if depth <= self.short_depth {
            ReorgType::ShortReorg
        } else {
            ReorgType::DeepReorg
        };
        tracing::warn!(
            depth,
            fork_height = fork_point.height,
            fork_hash = %fork_point.hash,
            detected_at,
            reorg_type = %reorg_type,
            "Reorg detected"
        );
        ReorgEvent {
            fork_point,
            detected_at,
            depth,
            reorg_type,
        }
    }
}

async fn local_hash(store: &dyn StateStore, height: u64) -> Result<BlockHash, IndexerError> {
    store.block_hash(height).await?.ok_or_else(|| {
        IndexerError::Persistence(format!("no indexed block at height {height} below the tip"))
    })
}
