//! chainsync-storage: durable state store backends for ChainSync.
//!
//! Backends:
//! - [`MemoryStateStore`]: in-memory (dev/testing, no persistence), re-exported
//!   from `chainsync-core`
//! - [`sqlite`]: SQLite via `sqlx` (embedded, single-file persistence)

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use chainsync_core::store::MemoryStateStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStateStore;
