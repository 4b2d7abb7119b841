//! Block source contract and the retrying fetcher the engine talks through.
//!
//! A [`BlockSource`] is whatever supplies raw blocks for one network: a node
//! RPC client, a directory of raw block files, or the scripted
//! [`MemoryBlockSource`] used in tests. The engine never calls a source
//! directly; it goes through [`BlockFetcher`], which applies the retry policy
//! and turns exhausted retries into [`IndexerError::SourceUnavailable`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::IndexerError;
use crate::retry::{RetryError, RetryPolicy};
use crate::tip::ChainTip;
use crate::types::{Block, BlockHash};

/// Supplier of ordered raw blocks for a single network.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Fetch the block at `height` on the source's best chain.
    /// Returns `None` if the source has no block at that height.
    async fn fetch_block(&self, height: u64) -> Result<Option<Block>, IndexerError>;

    /// Current best chain head of the source.
    async fn fetch_head(&self) -> Result<ChainTip, IndexerError>;

    /// Hash of the block at `height` on the source's best chain.
    ///
    /// Sources that can answer this without shipping the whole block (e.g.
    /// `getblockhash`) should override it; reorg detection calls it a lot.
    async fn fetch_block_hash(&self, height: u64) -> Result<Option<BlockHash>, IndexerError> {
        Ok(self.fetch_block(height).await?.map(|b| b.hash))
    }
}

/// Wraps a [`BlockSource`] with bounded exponential backoff.
pub struct BlockFetcher<S> {
    source: S,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl<S: BlockSource> BlockFetcher<S> {
    pub fn new(source: S, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self { source, policy, cancel }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Fetch the source head.
    pub async fn head(&self) -> Result<ChainTip, IndexerError> {
        let result = self
            .policy
            .run("fetch_head", &self.cancel, || self.source.fetch_head())
            .await;
        surface(result)
    }

    /// Fetch a block by height.
    pub async fn block(&self, height: u64) -> Result<Option<Block>, IndexerError> {
        let result = self
            .policy
            .run("fetch_block", &self.cancel, || self.source.fetch_block(height))
            .await;
        surface(result)
    }

    /// Fetch a block hash by height.
    pub async fn block_hash(&self, height: u64) -> Result<Option<BlockHash>, IndexerError> {
        let result = self
            .policy
            .run("fetch_block_hash", &self.cancel, || self.source.fetch_block_hash(height))
            .await;
        surface(result)
    }
}

fn surface<T>(result: Result<T, RetryError>) -> Result<T, IndexerError> {
    result.map_err(|e| match e {
        RetryError::Exhausted { attempts, last } => IndexerError::SourceUnavailable {
            attempts,
            reason: last.to_string(),
        },
        RetryError::Fatal(e) => e,
        RetryError::Cancelled => IndexerError::Aborted {
            reason: "shutdown requested while waiting on block source".into(),
        },
    })
}

// ─── In-memory source (for testing) ──────────────────────────────────────────

#[derive(Default)]
struct MemorySourceInner {
    /// Best chain, indexed by height.
    chain: Vec<Block>,
    /// Number of upcoming calls that fail with a transient error.
    failures_left: u32,
    /// How many times each height was fetched with `fetch_block`.
    fetches: HashMap<u64, u32>,
}

/// Scripted block source for tests and ephemeral runs.
///
/// Clones share state, so a test can keep a handle and reorganize, shorten or
/// break the chain while an engine owns another clone.
#[derive(Clone, Default)]
pub struct MemoryBlockSource {
    inner: Arc<Mutex<MemorySourceInner>>,
}

impl MemoryBlockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source serving `blocks` as its best chain (`blocks[i].height == i`).
    pub fn with_chain(blocks: Vec<Block>) -> Self {
        let source = Self::new();
        source.set_chain(blocks);
        source
    }

    fn lock(&self) -> MutexGuard<'_, MemorySourceInner> {
        // A poisoned lock only means a test panicked mid-call; the data is still usable.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Replace the best chain (simulates a reorg or a node switch).
    pub fn set_chain(&self, blocks: Vec<Block>) {
        self.lock().chain = blocks;
    }

    /// Current best chain.
    pub fn chain(&self) -> Vec<Block> {
        self.lock().chain.clone()
    }

    /// Extend the best chain by `count` synthetic blocks.
    pub fn extend(&self, count: u64, tag: u8) {
        let mut inner = self.lock();
        for _ in 0..count {
            let block = match inner.chain.last() {
                Some(parent) => synthetic_block(parent.height + 1, parent.hash, tag),
                None => synthetic_block(0, BlockHash::ZERO, tag),
            };
            inner.chain.push(block);
        }
    }

    /// Drop every block above `height` (simulates a source that regressed).
    pub fn truncate(&self, height: u64) {
        self.lock().chain.truncate(height as usize + 1);
    }

    /// Make the next `n` calls fail with a transient [`IndexerError::Source`].
    pub fn fail_next(&self, n: u32) {
        self.lock().failures_left = n;
    }

    /// Number of times `fetch_block(height)` was served.
    pub fn fetch_count(&self, height: u64) -> u32 {
        self.lock().fetches.get(&height).copied().unwrap_or(0)
    }

    /// Lowest height fetched so far, if any.
    pub fn lowest_fetched(&self) -> Option<u64> {
        self.lock().fetches.keys().min().copied()
    }

    pub fn clear_fetch_log(&self) {
        self.lock().fetches.clear();
    }

    fn take_failure(inner: &mut MemorySourceInner) -> Result<(), IndexerError> {
        if inner.failures_left > 0 {
            inner.failures_left -= 1;
            return Err(IndexerError::Source("injected source failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BlockSource for MemoryBlockSource {
    async fn fetch_block(&self, height: u64) -> Result<Option<Block>, IndexerError> {
        let mut inner = self.lock();
        Self::take_failure(&mut inner)?;
        *inner.fetches.entry(height).or_default() += 1;
        Ok(inner.chain.get(height as usize).cloned())
    }

    async fn fetch_head(&self) -> Result<ChainTip, IndexerError> {
        let mut inner = self.lock();
        Self::take_failure(&mut inner)?;
        inner
            .chain
            .last()
            .map(|b| ChainTip::new(b.height, b.hash))
            .ok_or_else(|| IndexerError::Source("source has no blocks".into()))
    }

    async fn fetch_block_hash(&self, height: u64) -> Result<Option<BlockHash>, IndexerError> {
        let mut inner = self.lock();
        Self::take_failure(&mut inner)?;
        Ok(inner.chain.get(height as usize).map(|b| b.hash))
    }
}

/// Deterministic block for tests: the hash encodes `(tag, height, parent)`
/// so chains built with different tags diverge, and the raw payload is
/// `[tag, height as 8 big-endian bytes]`.
pub fn synthetic_block(height: u64, parent_hash: BlockHash, tag: u8) -> Block {
    let mut hash = [0u8; 32];
    hash[0] = tag;
    hash[1..9].copy_from_slice(&height.to_be_bytes());
    hash[9..].copy_from_slice(&parent_hash.0[..23]);
    let mut raw = vec![tag];
    raw.extend_from_slice(&height.to_be_bytes());
    Block {
        height,
        hash: BlockHash(hash),
        parent_hash,
        raw,
        timestamp: 1_700_000_000 + height as i64 * 600,
    }
}

/// A synthetic chain of `len` blocks (heights `0..len`).
pub fn synthetic_chain(len: u64, tag: u8) -> Vec<Block> {
    let source = MemoryBlockSource::new();
    source.extend(len, tag);
    source.chain()
}

/// `base` up to and including `fork_height`, then `extra` new blocks built
/// with `tag`.
pub fn fork_chain(base: &[Block], fork_height: u64, extra: u64, tag: u8) -> Vec<Block> {
    let source = MemoryBlockSource::with_chain(base[..=fork_height as usize].to_vec());
    source.extend(extra, tag);
    source.chain()
}
