//! Error types for the chainsync pipeline.

use thiserror::Error;

/// Errors that can occur while syncing.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// Bad network identifier or invalid configuration. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A single failed call to the block source. Retried with backoff.
    #[error("Block source error: {0}")]
    Source(String),

    /// The block source stayed unreachable after every retry.
    #[error("Block source unavailable after {attempts} attempts: {reason}")]
    SourceUnavailable { attempts: u32, reason: String },

    /// No common ancestor between the local chain and the source chain.
    #[error("Chain mismatch at height {height}: {reason}")]
    ChainMismatch { height: u64, reason: String },

    /// Checkpoints exist but none of them restores cleanly.
    #[error("No valid checkpoint at or below height {height}")]
    CheckpointUnavailable { height: u64 },

    /// A local write failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Failed to parse block {height}: {reason}")]
    Parse { height: u64, reason: String },

    #[error("Sync aborted: {reason}")]
    Aborted { reason: String },
}

impl IndexerError {
    /// Returns `true` for errors that are retried locally by the engine.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Source(_) | Self::Persistence(_))
    }

    /// Returns `true` for structural errors that need operator action.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::ChainMismatch { .. }
                | Self::CheckpointUnavailable { .. }
                | Self::Parse { .. }
        )
    }
}
