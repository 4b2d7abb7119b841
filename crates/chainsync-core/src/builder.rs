//! Fluent builder API for sync engine configs.
//!
//! # Example
//!
//! ```rust
//! use chainsync_core::builder::SyncConfigBuilder;
//! use chainsync_core::types::Network;
//!
//! let config = SyncConfigBuilder::new(Network::Regtest)
//!     .id("regtest-indexer")
//!     .checkpoint_interval(100)
//!     .retain_checkpoints(10)
//!     .max_retries(8)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.checkpoint_interval, 100);
//! ```

use crate::config::SyncConfig;
use crate::error::IndexerError;
use crate::retry::RetryConfig;
use crate::types::Network;

/// Fluent builder for [`SyncConfig`].
///
/// The checkpoint interval and retention count must be set explicitly.
pub struct SyncConfigBuilder {
    config: SyncConfig,
    interval_set: bool,
    retain_set: bool,
}

impl SyncConfigBuilder {
    pub fn new(network: Network) -> Self {
        Self {
            config: SyncConfig::new(network, 0, 0),
            interval_set: false,
            retain_set: false,
        }
    }

    /// Start from a network identifier such as `"testnet4"`.
    pub fn for_network(network: &str) -> Result<Self, IndexerError> {
        Ok(Self::new(network.parse()?))
    }

    /// Set the engine ID (used in logs).
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = id.into();
        self
    }

    /// Take a checkpoint every `n` blocks.
    pub fn checkpoint_interval(mut self, n: u64) -> Self {
        self.config.checkpoint_interval = n;
        self.interval_set = true;
        self
    }

    /// Keep the `n` newest checkpoints.
    pub fn retain_checkpoints(mut self, n: usize) -> Self {
        self.config.retain_checkpoints = n;
        self.retain_set = true;
        self
    }

    /// Replace the whole block source retry policy.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Set the retry cap for block source calls.
    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.retry.max_retries = n;
        self
    }

    /// Set the first and maximum backoff delays (milliseconds).
    pub fn backoff_ms(mut self, initial: u64, max: u64) -> Self {
        self.config.retry.initial_backoff_ms = initial;
        self.config.retry.max_backoff_ms = max;
        self
    }

    pub fn persistence_retries(mut self, n: u32) -> Self {
        self.config.persistence_retries = n;
        self
    }

    pub fn checkpoint_timeout_ms(mut self, ms: u64) -> Self {
        self.config.checkpoint_timeout_ms = ms;
        self
    }

    /// Set follow-mode polling interval in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn verify_genesis(mut self, yes: bool) -> Self {
        self.config.verify_genesis = yes;
        self
    }

    pub fn reparse_updates_checkpoints(mut self, yes: bool) -> Self {
        self.config.reparse_updates_checkpoints = yes;
        self
    }

    /// Validate and build the [`SyncConfig`].
    pub fn build(self) -> Result<SyncConfig, IndexerError> {
        if !self.interval_set || !self.retain_set {
            return Err(IndexerError::Configuration(
                "checkpoint_interval and retain_checkpoints are required".into(),
            ));
        }
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_requires_retention_policy() {
        let err = SyncConfigBuilder::new(Network::Mainnet).checkpoint_interval(10).build();
        assert!(matches!(err, Err(IndexerError::Configuration(_))));

        let err = SyncConfigBuilder::new(Network::Mainnet).retain_checkpoints(3).build();
        assert!(err.is_err());
    }

    #[test]
    fn builder_custom() {
        let cfg = SyncConfigBuilder::for_network("testnet4")
            .unwrap()
            .id("t4")
            .checkpoint_interval(2016)
            .retain_checkpoints(4)
            .max_retries(9)
            .backoff_ms(50, 800)
            .verify_genesis(false)
            .build()
            .unwrap();

        assert_eq!(cfg.id, "t4");
        assert_eq!(cfg.network, Network::Testnet4);
        assert_eq!(cfg.checkpoint_interval, 2016);
        assert_eq!(cfg.retain_checkpoints, 4);
        assert_eq!(cfg.retry.max_retries, 9);
        assert_eq!(cfg.retry.initial_backoff_ms, 50);
        assert_eq!(cfg.retry.max_backoff_ms, 800);
        assert!(!cfg.verify_genesis);
    }

    #[test]
    fn builder_rejects_unknown_network() {
        assert!(SyncConfigBuilder::for_network("ropsten").is_err());
    }
}
