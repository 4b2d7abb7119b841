//! The sync engine. Owns the ingestion loop.
//!
//! # Operations
//! - `bootstrap`: index genesis into an empty store, then catch up
//! - `catch_up`: fetch → reorg check → parse → commit → checkpoint, per block,
//!   until the local tip equals the source head
//! - `rollback`: restore the newest valid checkpoint at or below a height,
//!   or reparse from genesis when there is none
//! - `reparse`: re-derive records for an explicit range
//! - `shutdown`: stop at the next block boundary and release the store
//!
//! Every block is committed atomically together with the tip, so a crash
//! leaves the store at a block boundary and a restarted engine resumes from
//! `tip + 1`. Errors leave the engine `Paused`; the next call resumes from
//! the persisted tip.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointManager, CheckpointStore};
use crate::config::{EngineState, SyncConfig};
use crate::error::IndexerError;
use crate::parser::BlockParser;
use crate::reorg::ReorgDetector;
use crate::retry::{RetryConfig, RetryError, RetryPolicy};
use crate::source::{BlockFetcher, BlockSource};
use crate::store::StateStore;
use crate::tip::ChainTip;
use crate::types::{Block, IndexedRecord, Network};

/// How a catch-up run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUpOutcome {
    /// The local tip equals the source head.
    CaughtUp { tip: ChainTip },
    /// Shutdown was requested; `tip` is the last fully committed block.
    Cancelled { tip: Option<ChainTip> },
}

impl CatchUpOutcome {
    pub fn tip(&self) -> Option<ChainTip> {
        match self {
            Self::CaughtUp { tip } => Some(*tip),
            Self::Cancelled { tip } => *tip,
        }
    }
}

/// Result of a reparse run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReparseReport {
    /// Already indexed blocks whose records were re-derived.
    pub replaced: u64,
    /// Blocks above the previous tip that were committed.
    pub committed: u64,
    pub tip: ChainTip,
}

/// Requests a cooperative shutdown of a running engine.
///
/// The engine observes it at the top of every per-block iteration and while
/// waiting out a backoff, never in the middle of a commit.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(CancellationToken);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.cancel();
    }

    pub fn is_requested(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// Drives bootstrap, catch-up, rollback and reparse for one network.
pub struct SyncEngine<S, P> {
    config: SyncConfig,
    fetcher: BlockFetcher<S>,
    parser: P,
    store: Arc<dyn StateStore>,
    checkpoints: CheckpointManager,
    detector: ReorgDetector,
    commit_policy: RetryPolicy,
    cancel: CancellationToken,
    state: EngineState,
    tip: Option<ChainTip>,
    writer_held: bool,
}

impl<S: BlockSource, P: BlockParser> SyncEngine<S, P> {
    /// Open an engine over `store`, taking its single-writer lock and reading
    /// the persisted tip.
    pub async fn open<T>(
        config: SyncConfig,
        source: S,
        parser: P,
        store: Arc<T>,
    ) -> Result<Self, IndexerError>
    where
        T: StateStore + CheckpointStore + 'static,
    {
        config.validate()?;
        store.acquire_writer()?;
        let tip = match store.tip().await {
            Ok(tip) => tip,
            Err(e) => {
                store.release_writer();
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let fetcher = BlockFetcher::new(source, RetryPolicy::new(config.retry.clone()), cancel.clone());
        let checkpoints = CheckpointManager::new(
            store.clone(),
            config.checkpoint_interval,
            config.retain_checkpoints,
            Duration::from_millis(config.checkpoint_timeout_ms),
        );
        let commit_policy = RetryPolicy::new(RetryConfig {
            max_retries: config.persistence_retries,
            initial_backoff_ms: 50,
            max_backoff_ms: 1_000,
            multiplier: 2.0,
        });

        info!(
            id = %config.id,
            network = %config.network,
            tip = ?tip.map(|t| t.height),
            "sync engine opened"
        );

        Ok(Self {
            fetcher,
            parser,
            store,
            checkpoints,
            detector: ReorgDetector::default(),
            commit_policy,
            cancel,
            state: EngineState::Idle,
            tip,
            writer_held: true,
            config,
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// The last committed block as known to the engine.
    pub fn tip(&self) -> Option<ChainTip> {
        self.tip
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Read access to the underlying store.
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn source(&self) -> &S {
        self.fetcher.source()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.cancel.clone())
    }

    // ─── Operations ──────────────────────────────────────────────────────────

    /// Bootstrap an empty store from genesis, then catch up.
    ///
    /// On a store that already has a tip for the same network this resumes
    /// catch-up instead.
    pub async fn bootstrap(&mut self, network: &str) -> Result<CatchUpOutcome, IndexerError> {
        let result = self.bootstrap_inner(network).await;
        let result = self.cancelled_as_outcome(result);
        self.settle(result).await
    }

    /// Bootstrap if the store is empty, otherwise resume from the persisted tip.
    pub async fn run(&mut self) -> Result<CatchUpOutcome, IndexerError> {
        match self.tip {
            None => self.bootstrap(self.config.network.as_str()).await,
            Some(_) => self.catch_up().await,
        }
    }

    /// Ingest blocks until the local tip equals the source head.
    pub async fn catch_up(&mut self) -> Result<CatchUpOutcome, IndexerError> {
        let result = self.catch_up_inner().await;
        let result = self.cancelled_as_outcome(result);
        self.settle(result).await
    }

    /// Keep following the source head until shutdown is requested.
    pub async fn follow(&mut self) -> Result<CatchUpOutcome, IndexerError> {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            if let outcome @ CatchUpOutcome::Cancelled { .. } = self.run().await? {
                return Ok(outcome);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Ok(CatchUpOutcome::Cancelled { tip: self.tip });
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    /// Roll the index back to at most `target` and return the new tip.
    pub async fn rollback(&mut self, target: u64) -> Result<ChainTip, IndexerError> {
        let result = self.rollback_inner(target).await;
        self.settle(result).await
    }

    /// Re-derive records for `from..=to`.
    ///
    /// Indexed heights get their records replaced in place; heights above the
    /// tip are committed, so the tip ends at most at `to`.
    pub async fn reparse(&mut self, from: u64, to: u64) -> Result<ReparseReport, IndexerError> {
        let result = self.reparse_inner(from, to).await;
        self.settle(result).await
    }

    /// Stop at the next block boundary, release the store's writer lock and
    /// return the persisted tip.
    pub async fn shutdown(&mut self) -> Result<Option<ChainTip>, IndexerError> {
        self.state = EngineState::ShuttingDown;
        self.cancel.cancel();
        let tip = self.store.tip().await;
        if self.writer_held {
            self.store.release_writer();
            self.writer_held = false;
        }
        self.state = EngineState::Idle;
        let tip = tip?;
        self.tip = tip;
        info!(id = %self.config.id, tip = ?tip.map(|t| t.height), "sync engine shut down");
        Ok(tip)
    }

    // ─── Internals ───────────────────────────────────────────────────────────

    fn ensure_open(&self) -> Result<(), IndexerError> {
        if self.writer_held {
            Ok(())
        } else {
            Err(IndexerError::Configuration("sync engine has been shut down".into()))
        }
    }

    fn cancelled_as_outcome(
        &self,
        result: Result<CatchUpOutcome, IndexerError>,
    ) -> Result<CatchUpOutcome, IndexerError> {
        match result {
            Err(IndexerError::Aborted { .. }) if self.cancel.is_cancelled() => {
                Ok(CatchUpOutcome::Cancelled { tip: self.tip })
            }
            other => other,
        }
    }

    /// Move to `Idle` or `Paused` and re-read the persisted tip on error.
    async fn settle<T>(&mut self, result: Result<T, IndexerError>) -> Result<T, IndexerError> {
        match &result {
            Ok(_) => self.state = EngineState::Idle,
            Err(IndexerError::Aborted { .. }) if self.cancel.is_cancelled() => {
                self.state = EngineState::Idle;
            }
            Err(e) => {
                if let Ok(tip) = self.store.tip().await {
                    self.tip = tip;
                }
                self.state = EngineState::Paused;
                error!(
                    id = %self.config.id,
                    error = %e,
                    tip = ?self.tip.map(|t| t.height),
                    "sync paused"
                );
            }
        }
        result
    }

    async fn bootstrap_inner(&mut self, network: &str) -> Result<CatchUpOutcome, IndexerError> {
        self.ensure_open()?;
        let network: Network = network.parse()?;
        if network != self.config.network {
            return Err(IndexerError::Configuration(format!(
                "engine is configured for {}, asked to bootstrap {network}",
                self.config.network
            )));
        }
        if let Some(stored) = self.store.network().await? {
            if stored != network {
                return Err(IndexerError::Configuration(format!(
                    "store was bootstrapped for {stored}, not {network}"
                )));
            }
        }
        if let Some(tip) = self.tip {
            info!(tip = %tip, "store already bootstrapped, resuming catch-up");
            return self.catch_up_inner().await;
        }

        self.state = EngineState::Bootstrapping;
        info!(network = %network, "bootstrapping from genesis");
        self.store.set_network(network).await?;

        let genesis = self.fetcher.block(0).await?.ok_or_else(|| {
            IndexerError::Configuration(format!("block source has no genesis block for {network}"))
        })?;
        if self.config.verify_genesis && genesis.hash != network.genesis_hash() {
            return Err(IndexerError::ChainMismatch {
                height: 0,
                reason: format!(
                    "source genesis {} is not the {network} genesis {}",
                    genesis.hash,
                    network.genesis_hash()
                ),
            });
        }
        self.commit_block(&genesis).await?;
        self.catch_up_inner().await
    }

    async fn catch_up_inner(&mut self) -> Result<CatchUpOutcome, IndexerError> {
        self.ensure_open()?;
        let Some(mut tip) = self.tip else {
            return Err(IndexerError::Configuration(
                "store is empty; bootstrap before catching up".into(),
            ));
        };
        self.state = EngineState::CatchingUp;
        info!(from = tip.next_height(), "catching up");

        // Rounds where the source disagreed with itself but no fork was found.
        let mut stalls = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(CatchUpOutcome::Cancelled { tip: Some(tip) });
            }

            let head = self.fetcher.head().await?;
            let diverged = head.height < tip.height
                || (head.height == tip.height && head.hash != tip.hash);
            if diverged {
                tip = self.handle_divergence(tip, &mut stalls).await?;
                continue;
            }
            if head.height == tip.height {
                info!(tip = %tip, "caught up with source head");
                return Ok(CatchUpOutcome::CaughtUp { tip });
            }

            while tip.height < head.height {
                if self.cancel.is_cancelled() {
                    return Ok(CatchUpOutcome::Cancelled { tip: Some(tip) });
                }
                let next = tip.next_height();
                let Some(block) = self.fetcher.block(next).await? else {
                    debug!(height = next, head = head.height, "source has no block below its head");
                    self.back_off(
                        &mut stalls,
                        format!("source reports head {} but has no block {next}", head.height),
                    )
                    .await?;
                    break;
                };
                if !block.extends(&tip) {
                    tip = self.handle_divergence(tip, &mut stalls).await?;
                    break;
                }
                tip = self.commit_block(&block).await?;
                stalls = 0;
            }
        }
    }

    /// Find the fork point below `tip` and roll back to it.
    async fn handle_divergence(
        &mut self,
        tip: ChainTip,
        stalls: &mut u32,
    ) -> Result<ChainTip, IndexerError> {
        let checkpoints = self.checkpoints.checkpoints().await?;
        let event = self
            .detector
            .check_divergence(&tip, &self.fetcher, self.store.as_ref(), &checkpoints)
            .await?;
        match event {
            Some(event) => {
                self.state = EngineState::RollingBack;
                let new_tip = self.rollback_inner(event.fork_point.height).await?;
                self.state = EngineState::CatchingUp;
                Ok(new_tip)
            }
            None => {
                self.back_off(
                    stalls,
                    format!("source keeps serving blocks that do not extend {tip} without a fork"),
                )
                .await?;
                Ok(tip)
            }
        }
    }

    /// Count a catch-up round that made no progress and wait out the source
    /// retry delay before the next one. Fails with `SourceUnavailable` once
    /// `retry.max_retries` rounds in a row were wasted. Shutdown cuts the
    /// wait short; the caller notices it at the next block boundary.
    async fn back_off(&self, stalls: &mut u32, reason: String) -> Result<(), IndexerError> {
        *stalls += 1;
        let Some(delay) = RetryPolicy::new(self.config.retry.clone()).next_delay(*stalls) else {
            return Err(IndexerError::SourceUnavailable { attempts: *stalls, reason });
        };
        warn!(
            stalls = *stalls,
            delay_ms = delay.as_millis() as u64,
            %reason,
            "source made no progress, backing off"
        );
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
        Ok(())
    }

    async fn rollback_inner(&mut self, target: u64) -> Result<ChainTip, IndexerError> {
        self.ensure_open()?;
        let Some(tip) = self.tip else {
            return Err(IndexerError::Configuration("cannot roll back an empty store".into()));
        };
        if target >= tip.height {
            return Ok(tip);
        }
        self.state = EngineState::RollingBack;
        info!(from = tip.height, target, "rolling back");

        let candidates: Vec<_> = self
            .checkpoints
            .checkpoints()
            .await?
            .into_iter()
            .filter(|cp| cp.height <= target)
            .rev()
            .collect();

        if candidates.is_empty() {
            warn!(target, "no checkpoint at or below target, reparsing from genesis");
            self.checkpoints.discard_above(target).await?;
            self.store.reset().await?;
            self.tip = None;
            let report = self.reparse_inner(0, target).await?;
            return Ok(report.tip);
        }

        for cp in candidates {
            match self.store.restore(&cp.snapshot).await {
                Ok(new_tip) => {
                    self.checkpoints.discard_above(cp.height).await?;
                    self.tip = Some(new_tip);
                    info!(target, checkpoint = cp.height, tip = %new_tip, "restored checkpoint");
                    return Ok(new_tip);
                }
                Err(IndexerError::CheckpointUnavailable { height }) => {
                    warn!(height, "checkpoint snapshot does not validate, discarding it");
                    self.checkpoints.remove(height).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(IndexerError::CheckpointUnavailable { height: target })
    }

    async fn reparse_inner(&mut self, from: u64, to: u64) -> Result<ReparseReport, IndexerError> {
        self.ensure_open()?;
        if from > to {
            return Err(IndexerError::Configuration(format!(
                "invalid reparse range {from}..={to}"
            )));
        }
        let resume_at = self.tip.map(|t| t.next_height()).unwrap_or(0);
        if from > resume_at {
            return Err(IndexerError::Configuration(format!(
                "reparse from {from} would leave a gap above the tip (next height is {resume_at})"
            )));
        }

        self.state = EngineState::Reparsing;
        info!(from, to, "reparsing");
        let mut replaced = 0;
        let mut committed = 0;
        for height in from..=to {
            if self.cancel.is_cancelled() {
                return Err(IndexerError::Aborted {
                    reason: format!("shutdown requested while reparsing at height {height}"),
                });
            }
            let block = self.fetcher.block(height).await?.ok_or_else(|| {
                IndexerError::Configuration(format!("block source has no block at height {height}"))
            })?;

            let indexed = self.tip.is_some_and(|t| height <= t.height);
            if indexed {
                let records = self.parse(&block)?;
                let store = Arc::clone(&self.store);
                self.persist("replace_records", || store.replace_records(height, block.hash, &records))
                    .await?;
                if self.config.reparse_updates_checkpoints {
                    self.checkpoints
                        .maybe_checkpoint(height, block.hash, self.store.as_ref())
                        .await;
                }
                replaced += 1;
            } else {
                self.commit_block(&block).await?;
                committed += 1;
            }
        }

        let tip = self.tip.ok_or_else(|| {
            IndexerError::Persistence("reparse finished without a chain tip".into())
        })?;
        info!(from, to, replaced, committed, tip = %tip, "reparse complete");
        Ok(ReparseReport { replaced, committed, tip })
    }

    fn parse(&self, block: &Block) -> Result<Vec<IndexedRecord>, IndexerError> {
        self.parser.parse(block)
    }

    /// Parse, commit, advance the tip, and checkpoint if on a boundary.
    async fn commit_block(&mut self, block: &Block) -> Result<ChainTip, IndexerError> {
        let records = self.parse(block)?;
        let store = Arc::clone(&self.store);
        let tip = self
            .persist("commit", || {
                store.commit(block.height, block.hash, block.parent_hash, &records)
            })
            .await?;
        self.tip = Some(tip);
        debug!(height = tip.height, hash = %tip.hash, records = records.len(), "block committed");

        self.checkpoints
            .maybe_checkpoint(tip.height, tip.hash, self.store.as_ref())
            .await;
        Ok(tip)
    }

    /// Run a store write with the bounded persistence retry policy.
    async fn persist<T, F, Fut>(&self, what: &str, op: F) -> Result<T, IndexerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, IndexerError>>,
    {
        self.commit_policy
            .run(what, &self.cancel, op)
            .await
            .map_err(|e| match e {
                RetryError::Exhausted { attempts, last } => IndexerError::Persistence(format!(
                    "{what} failed after {attempts} attempts: {last}"
                )),
                RetryError::Fatal(e) => e,
                RetryError::Cancelled => IndexerError::Aborted {
                    reason: format!("shutdown requested while retrying {what}"),
                },
            })
    }
}

impl<S, P> Drop for SyncEngine<S, P> {
    fn drop(&mut self) {
        if self.writer_held {
            self.store.release_writer();
        }
    }
}
