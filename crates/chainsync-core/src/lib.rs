//! chainsync-core: block ingestion, checkpointing and rollback for an
//! append-only chain.
//!
//! # Architecture
//!
//! ```text
//! SyncConfigBuilder → SyncEngine
//!                        ├── BlockFetcher      (BlockSource + retry/backoff)
//!                        ├── ReorgDetector     (fork point search, checkpoint floors)
//!                        ├── CheckpointManager (periodic snapshots, retention)
//!                        ├── BlockParser       (block → IndexedRecords)
//!                        └── StateStore        (memory / SQLite)
//! ```

pub mod builder;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod parser;
pub mod reorg;
pub mod retry;
pub mod source;
pub mod store;
pub mod tip;
pub mod types;

pub use builder::SyncConfigBuilder;
pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointStore};
pub use config::{EngineState, SyncConfig};
pub use engine::{CatchUpOutcome, ReparseReport, ShutdownHandle, SyncEngine};
pub use error::IndexerError;
pub use parser::BlockParser;
pub use reorg::{ForkPoint, ReorgDetector, ReorgEvent, ReorgType};
pub use retry::{RetryConfig, RetryPolicy};
pub use source::{BlockFetcher, BlockSource, MemoryBlockSource};
pub use store::{MemoryStateStore, SnapshotRef, StateStore};
pub use tip::ChainTip;
pub use types::{Block, BlockHash, IndexedRecord, Network, RecordKind};
