//! Sync engine configuration and state types.

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::retry::RetryConfig;
use crate::types::Network;

/// Configuration for a sync engine instance.
///
/// `checkpoint_interval` and `retain_checkpoints` have no defaults; build
/// configs with [`SyncConfigBuilder`](crate::builder::SyncConfigBuilder) or
/// [`SyncConfig::new`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Name of this engine, used in logs.
    #[serde(default = "default_id")]
    pub id: String,
    /// Network to index.
    pub network: Network,
    /// Take a checkpoint at every height that is a multiple of this.
    pub checkpoint_interval: u64,
    /// How many of the newest checkpoints to keep.
    pub retain_checkpoints: usize,
    /// Backoff policy for block source calls.
    #[serde(default)]
    pub retry: RetryConfig,
    /// How many times a failed commit is retried before it is surfaced.
    #[serde(default = "default_persistence_retries")]
    pub persistence_retries: u32,
    /// Time budget for one checkpoint write (milliseconds).
    #[serde(default = "default_checkpoint_timeout_ms")]
    pub checkpoint_timeout_ms: u64,
    /// Head polling interval in follow mode (milliseconds).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Check the fetched genesis block against the network's well-known hash.
    #[serde(default = "default_true")]
    pub verify_genesis: bool,
    /// Whether `reparse` also creates missing checkpoints in its range.
    #[serde(default)]
    pub reparse_updates_checkpoints: bool,
}

fn default_id() -> String {
    "default".into()
}

fn default_persistence_retries() -> u32 {
    3
}

fn default_checkpoint_timeout_ms() -> u64 {
    5_000
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_true() -> bool {
    true
}

impl SyncConfig {
    /// A config with the required retention policy and defaults elsewhere.
    pub fn new(network: Network, checkpoint_interval: u64, retain_checkpoints: usize) -> Self {
        Self {
            id: default_id(),
            network,
            checkpoint_interval,
            retain_checkpoints,
            retry: RetryConfig::default(),
            persistence_retries: default_persistence_retries(),
            checkpoint_timeout_ms: default_checkpoint_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            verify_genesis: true,
            reparse_updates_checkpoints: false,
        }
    }

    /// Parse a JSON config document.
    pub fn from_json(json: &str) -> Result<Self, IndexerError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| IndexerError::Configuration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.checkpoint_interval == 0 {
            return Err(IndexerError::Configuration(
                "checkpoint_interval must be greater than zero".into(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(IndexerError::Configuration(
                "retry.multiplier must be at least 1.0".into(),
            ));
        }
        if self.checkpoint_timeout_ms == 0 {
            return Err(IndexerError::Configuration(
                "checkpoint_timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Runtime state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    /// Not running an operation.
    Idle,
    /// Indexing the genesis block of an empty store.
    Bootstrapping,
    /// Ingesting blocks up to the source head.
    CatchingUp,
    /// Restoring a checkpoint after a reorg or an operator request.
    RollingBack,
    /// Re-deriving records for an explicit range.
    Reparsing,
    /// Stopping at the next block boundary.
    ShuttingDown,
    /// Stopped after a surfaced error; the persisted tip is consistent.
    Paused,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Bootstrapping => write!(f, "bootstrapping"),
            Self::CatchingUp => write!(f, "catching-up"),
            Self::RollingBack => write!(f, "rolling-back"),
            Self::Reparsing => write!(f, "reparsing"),
            Self::ShuttingDown => write!(f, "shutting-down"),
            Self::Paused => write!(f, "paused"),
        }
    }
}
