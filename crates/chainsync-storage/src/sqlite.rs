//! SQLite state store for ChainSync.
//!
//! Persists blocks, indexed records, the chain tip and checkpoints to a single
//! SQLite file. Every mutation runs in one transaction that also updates the
//! tip row, so a crash leaves the file at a block boundary. WAL mode keeps
//! readers off the writer's back.
//!
//! The single-writer lock of a file-backed store is an advisory lock on
//! `<database>.lock`, so it holds across handles and processes and is
//! released by the OS if the writer dies.
//!
//! # Usage
//! ```rust,no_run
//! use chainsync_storage::sqlite::SqliteStateStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStateStore::open("./chainsync.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStateStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use fs2::FileExt;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use chainsync_core::checkpoint::{Checkpoint, CheckpointStore};
use chainsync_core::error::IndexerError;
use chainsync_core::store::{check_extends, check_records, SnapshotRef, StateStore};
use chainsync_core::tip::ChainTip;
use chainsync_core::types::{BlockHash, IndexedRecord, Network, RecordKind};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sync_meta (
        id          INTEGER PRIMARY KEY CHECK (id = 0),
        network     TEXT,
        tip_height  INTEGER,
        tip_hash    TEXT
    );",
    "INSERT OR IGNORE INTO sync_meta (id) VALUES (0);",
    "CREATE TABLE IF NOT EXISTS blocks (
        height       INTEGER PRIMARY KEY,
        hash         TEXT    NOT NULL,
        parent_hash  TEXT    NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS records (
        height      INTEGER NOT NULL,
        position    INTEGER NOT NULL,
        kind        TEXT    NOT NULL,
        record_key  TEXT    NOT NULL,
        data        BLOB    NOT NULL,
        PRIMARY KEY (height, position)
    );",
    "CREATE INDEX IF NOT EXISTS idx_records_key ON records (record_key);",
    "CREATE TABLE IF NOT EXISTS checkpoints (
        height           INTEGER PRIMARY KEY,
        block_hash       TEXT    NOT NULL,
        snapshot_height  INTEGER NOT NULL,
        snapshot_hash    TEXT    NOT NULL,
        record_count     INTEGER NOT NULL,
        created_at       INTEGER NOT NULL
    );",
];

/// SQLite-backed [`StateStore`] and [`CheckpointStore`].
pub struct SqliteStateStore {
    pool: SqlitePool,
    writer: AtomicBool,
    /// `None` for in-memory databases, which no other handle can reach.
    lock_path: Option<PathBuf>,
    lock_file: Mutex<Option<File>>,
}

impl SqliteStateStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./chainsync.db"`) or a full
    /// SQLite URL (`"sqlite:./chainsync.db"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}")
        };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| IndexerError::Configuration(format!("invalid database path '{path}': {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let lock_path = (!in_memory).then(|| {
            let mut name = options.clone().get_filename().into_owned().into_os_string();
            name.push(".lock");
            PathBuf::from(name)
        });

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(db_err)?;
        debug!(path, "opened sqlite state store");
        Self::init(pool, lock_path).await
    }

    /// Open an in-memory SQLite database.
    ///
    /// All data is lost when the store is dropped. Ideal for tests.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        // One long-lived connection: every `:memory:` connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(db_err)?;
        Self::init(pool, None).await
    }

    async fn init(pool: SqlitePool, lock_path: Option<PathBuf>) -> Result<Self, IndexerError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await.map_err(db_err)?;
        }
        Ok(Self {
            pool,
            writer: AtomicBool::new(false),
            lock_path,
            lock_file: Mutex::new(None),
        })
    }

    /// Close the pool, flushing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Take the advisory lock on `path`, recording our pid in it.
fn lock_writer_file(path: &Path) -> Result<File, IndexerError> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| {
            IndexerError::Persistence(format!("cannot open lock file {}: {e}", path.display()))
        })?;
    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={}", std::process::id());
            let _ = file.flush();
            Ok(file)
        }
        Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
            Err(IndexerError::Configuration(format!(
                "{} is held by another writer",
                path.display()
            )))
        }
        Err(e) => Err(IndexerError::Persistence(format!(
            "cannot lock {}: {e}",
            path.display()
        ))),
    }
}

fn db_err(e: sqlx::Error) -> IndexerError {
    IndexerError::Persistence(e.to_string())
}

fn parse_hash(s: &str) -> Result<BlockHash, IndexerError> {
    BlockHash::from_hex(s).map_err(|e| IndexerError::Persistence(format!("corrupt block hash: {e}")))
}

async fn tip_in(conn: &mut SqliteConnection) -> Result<Option<ChainTip>, IndexerError> {
    let row = sqlx::query("SELECT tip_height, tip_hash FROM sync_meta WHERE id = 0")
        .fetch_one(conn)
        .await
        .map_err(db_err)?;
    let height: Option<i64> = row.get("tip_height");
    let hash: Option<String> = row.get("tip_hash");
    match (height, hash) {
        (Some(height), Some(hash)) => Ok(Some(ChainTip::new(height as u64, parse_hash(&hash)?))),
        _ => Ok(None),
    }
}

async fn set_tip_in(conn: &mut SqliteConnection, tip: Option<&ChainTip>) -> Result<(), IndexerError> {
    sqlx::query("UPDATE sync_meta SET tip_height = ?, tip_hash = ? WHERE id = 0")
        .bind(tip.map(|t| t.height as i64))
        .bind(tip.map(|t| t.hash.to_hex()))
        .execute(conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

async fn block_hash_in(
    conn: &mut SqliteConnection,
    height: u64,
) -> Result<Option<BlockHash>, IndexerError> {
    let row = sqlx::query("SELECT hash FROM blocks WHERE height = ?")
        .bind(height as i64)
        .fetch_optional(conn)
        .await
        .map_err(db_err)?;
    row.map(|r| parse_hash(&r.get::<String, _>("hash"))).transpose()
}

async fn records_up_to_in(conn: &mut SqliteConnection, height: u64) -> Result<u64, IndexerError> {
    let row = sqlx::query("SELECT COUNT(*) AS cnt FROM records WHERE height <= ?")
        .bind(height as i64)
        .fetch_one(conn)
        .await
        .map_err(db_err)?;
    Ok(row.get::<i64, _>("cnt") as u64)
}

async fn insert_records_in(
    conn: &mut SqliteConnection,
    records: &[IndexedRecord],
) -> Result<(), IndexerError> {
    for r in records {
        sqlx::query(
            "INSERT INTO records (height, position, kind, record_key, data)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(r.height as i64)
        .bind(r.position as i64)
        .bind(r.kind.as_str())
        .bind(&r.key)
        .bind(&r.data)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    }
    Ok(())
}

/// Delete everything above `height` and return the new tip.
async fn truncate_in(
    conn: &mut SqliteConnection,
    height: u64,
) -> Result<Option<ChainTip>, IndexerError> {
    sqlx::query("DELETE FROM records WHERE height > ?")
        .bind(height as i64)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    sqlx::query("DELETE FROM blocks WHERE height > ?")
        .bind(height as i64)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

    let row = sqlx::query("SELECT height, hash FROM blocks ORDER BY height DESC LIMIT 1")
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?;
    let tip = match row {
        Some(r) => Some(ChainTip::new(
            r.get::<i64, _>("height") as u64,
            parse_hash(&r.get::<String, _>("hash"))?,
        )),
        None => None,
    };
    set_tip_in(conn, tip.as_ref()).await?;
    Ok(tip)
}

fn record_from_row(row: &SqliteRow) -> Result<IndexedRecord, IndexerError> {
    Ok(IndexedRecord {
        height: row.get::<i64, _>("height") as u64,
        position: row.get::<i64, _>("position") as u32,
        kind: row.get::<String, _>("kind").parse::<RecordKind>()?,
        key: row.get("record_key"),
        data: row.get("data"),
    })
}

fn checkpoint_from_row(row: &SqliteRow) -> Result<Checkpoint, IndexerError> {
    Ok(Checkpoint {
        height: row.get::<i64, _>("height") as u64,
        hash: parse_hash(&row.get::<String, _>("block_hash"))?,
        snapshot: SnapshotRef {
            height: row.get::<i64, _>("snapshot_height") as u64,
            block_hash: parse_hash(&row.get::<String, _>("snapshot_hash"))?,
            record_count: row.get::<i64, _>("record_count") as u64,
        },
        created_at: row.get("created_at"),
    })
}

// ─── StateStore impl ─────────────────────────────────────────────────────────

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn tip(&self) -> Result<Option<ChainTip>, IndexerError> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        tip_in(&mut conn).await
    }

    async fn network(&self) -> Result<Option<Network>, IndexerError> {
        let row = sqlx::query("SELECT network FROM sync_meta WHERE id = 0")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        row.get::<Option<String>, _>("network")
            .map(|n| n.parse::<Network>())
            .transpose()
    }

    async fn set_network(&self, network: Network) -> Result<(), IndexerError> {
        sqlx::query("UPDATE sync_meta SET network = ? WHERE id = 0")
            .bind(network.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
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
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let current = tip_in(&mut tx).await?;
        check_extends(current.as_ref(), height, parent_hash)?;

        sqlx::query("INSERT INTO blocks (height, hash, parent_hash) VALUES (?, ?, ?)")
            .bind(height as i64)
            .bind(hash.to_hex())
            .bind(parent_hash.to_hex())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        insert_records_in(&mut tx, records).await?;
        let tip = ChainTip::new(height, hash);
        set_tip_in(&mut tx, Some(&tip)).await?;

        tx.commit().await.map_err(db_err)?;
        Ok(tip)
    }

    async fn replace_records(
        &self,
        height: u64,
        hash: BlockHash,
        records: &[IndexedRecord],
    ) -> Result<(), IndexerError> {
        check_records(height, records)?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        match block_hash_in(&mut tx, height).await? {
            Some(stored) if stored == hash => {}
            Some(stored) => {
                return Err(IndexerError::ChainMismatch {
                    height,
                    reason: format!("indexed block is {stored}, source block is {hash}"),
                })
            }
            None => {
                return Err(IndexerError::Persistence(format!(
                    "no committed block at height {height}"
                )))
            }
        }

        sqlx::query("DELETE FROM records WHERE height = ?")
            .bind(height as i64)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        insert_records_in(&mut tx, records).await?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn truncate_above(&self, height: u64) -> Result<Option<ChainTip>, IndexerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let tip = truncate_in(&mut tx, height).await?;
        tx.commit().await.map_err(db_err)?;
        debug!(height, "truncated state store");
        Ok(tip)
    }

    async fn reset(&self) -> Result<(), IndexerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM records")
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM blocks")
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        set_tip_in(&mut tx, None).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn snapshot(&self, height: u64) -> Result<SnapshotRef, IndexerError> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        let block_hash = block_hash_in(&mut conn, height).await?.ok_or_else(|| {
            IndexerError::Persistence(format!("cannot snapshot uncommitted height {height}"))
        })?;
        let record_count = records_up_to_in(&mut conn, height).await?;
        Ok(SnapshotRef { height, block_hash, record_count })
    }

    async fn restore(&self, snapshot: &SnapshotRef) -> Result<ChainTip, IndexerError> {
        let unavailable = || IndexerError::CheckpointUnavailable { height: snapshot.height };
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let hash_matches = block_hash_in(&mut tx, snapshot.height).await? == Some(snapshot.block_hash);
        if !hash_matches || records_up_to_in(&mut tx, snapshot.height).await? != snapshot.record_count {
            return Err(unavailable());
        }
        let tip = truncate_in(&mut tx, snapshot.height).await?.ok_or_else(unavailable)?;
        tx.commit().await.map_err(db_err)?;
        debug!(height = snapshot.height, "restored snapshot");
        Ok(tip)
    }

    async fn block_hash(&self, height: u64) -> Result<Option<BlockHash>, IndexerError> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        block_hash_in(&mut conn, height).await
    }

    async fn records_at(&self, height: u64) -> Result<Vec<IndexedRecord>, IndexerError> {
        self.records_in(height, height).await
    }

    async fn records_in(&self, from: u64, to: u64) -> Result<Vec<IndexedRecord>, IndexerError> {
        if from > to {
            return Ok(vec![]);
        }
        let rows = sqlx::query(
            "SELECT height, position, kind, record_key, data FROM records
             WHERE height >= ? AND height <= ? ORDER BY height, position",
        )
        .bind(from as i64)
        .bind(to as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(record_from_row).collect()
    }

    async fn record_count(&self) -> Result<u64, IndexerError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM records")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.get::<i64, _>("cnt") as u64)
    }

    fn acquire_writer(&self) -> Result<(), IndexerError> {
        self.writer
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                IndexerError::Configuration("state store already has an active writer".into())
            })?;
        let Some(path) = &self.lock_path else {
            return Ok(());
        };
        match lock_writer_file(path) {
            Ok(file) => {
                *self.lock_file.lock().unwrap_or_else(PoisonError::into_inner) = Some(file);
                Ok(())
            }
            Err(e) => {
                self.writer.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    fn release_writer(&self) {
        // Closing the file drops the advisory lock.
        self.lock_file.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.writer.store(false, Ordering::Release);
    }
}

// ─── CheckpointStore impl ────────────────────────────────────────────────────

#[async_trait]
impl CheckpointStore for SqliteStateStore {
    async fn load_all(&self) -> Result<Vec<Checkpoint>, IndexerError> {
        let rows = sqlx::query("SELECT * FROM checkpoints ORDER BY height")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(checkpoint_from_row).collect()
    }

    async fn load(&self, height: u64) -> Result<Option<Checkpoint>, IndexerError> {
        let row = sqlx::query("SELECT * FROM checkpoints WHERE height = ?")
            .bind(height as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(checkpoint_from_row).transpose()
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT OR REPLACE INTO checkpoints
             (height, block_hash, snapshot_height, snapshot_hash, record_count, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(checkpoint.height as i64)
        .bind(checkpoint.hash.to_hex())
        .bind(checkpoint.snapshot.height as i64)
        .bind(checkpoint.snapshot.block_hash.to_hex())
        .bind(checkpoint.snapshot.record_count as i64)
        .bind(checkpoint.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(height = checkpoint.height, hash = %checkpoint.hash, "checkpoint saved");
        Ok(())
    }

    async fn delete(&self, height: u64) -> Result<(), IndexerError> {
        sqlx::query("DELETE FROM checkpoints WHERE height = ?")
            .bind(height as i64)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chainsync_core::config::SyncConfig;
    use chainsync_core::engine::SyncEngine;
    use chainsync_core::parser::BlockParser;
    use chainsync_core::source::{fork_chain, synthetic_chain, MemoryBlockSource};
    use chainsync_core::types::Block;

    fn hash(height: u64) -> BlockHash {
        let mut h = [0u8; 32];
        h[..8].copy_from_slice(&height.to_be_bytes());
        BlockHash(h)
    }

    fn records(height: u64, n: u32) -> Vec<IndexedRecord> {
        (0..n)
            .map(|i| IndexedRecord {
                height,
                position: i,
                kind: if i % 2 == 0 { RecordKind::Transaction } else { RecordKind::OpReturn },
                key: format!("{height}:{i}"),
                data: vec![i as u8, 0xff],
            })
            .collect()
    }

    async fn filled(len: u64) -> SqliteStateStore {
        let store = SqliteStateStore::in_memory().await.unwrap();
        for h in 0..len {
            let parent = if h == 0 { BlockHash::ZERO } else { hash(h - 1) };
            store.commit(h, hash(h), parent, &records(h, 2)).await.unwrap();
        }
        store
    }

    // ── StateStore ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn commit_and_read_back() {
        let store = filled(3).await;
        assert_eq!(store.tip().await.unwrap(), Some(ChainTip::new(2, hash(2))));
        assert_eq!(store.block_hash(1).await.unwrap(), Some(hash(1)));
        assert_eq!(store.records_at(1).await.unwrap(), records(1, 2));
        assert_eq!(store.records_in(0, 2).await.unwrap().len(), 6);
        assert_eq!(store.record_count().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn rejected_commit_leaves_no_trace() {
        let store = filled(3).await;
        let err = store.commit(3, hash(3), hash(77), &records(3, 2)).await.unwrap_err();
        assert!(matches!(err, IndexerError::ChainMismatch { height: 3, .. }));
        assert_eq!(store.tip().await.unwrap().unwrap().height, 2);
        assert!(store.records_at(3).await.unwrap().is_empty());

        // Misnumbered records are refused before anything is written
        let mut dup = records(3, 2);
        dup[1].position = 0;
        assert!(store.commit(3, hash(3), hash(2), &dup).await.is_err());
        assert_eq!(store.tip().await.unwrap().unwrap().height, 2);
        assert!(store.block_hash(3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn network_roundtrip() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        assert!(store.network().await.unwrap().is_none());
        store.set_network(Network::Testnet4).await.unwrap();
        assert_eq!(store.network().await.unwrap(), Some(Network::Testnet4));
    }

    #[tokio::test]
    async fn replace_records_keeps_tip() {
        let store = filled(5).await;
        store.replace_records(2, hash(2), &records(2, 4)).await.unwrap();
        assert_eq!(store.records_at(2).await.unwrap().len(), 4);
        assert_eq!(store.tip().await.unwrap().unwrap().height, 4);

        let err = store.replace_records(2, hash(9), &[]).await.unwrap_err();
        assert!(matches!(err, IndexerError::ChainMismatch { height: 2, .. }));
    }

    #[tokio::test]
    async fn truncate_above_moves_tip() {
        let store = filled(10).await;
        let tip = store.truncate_above(6).await.unwrap();
        assert_eq!(tip, Some(ChainTip::new(6, hash(6))));
        assert_eq!(store.tip().await.unwrap(), tip);
        assert!(store.records_in(7, 100).await.unwrap().is_empty());
        // Chain extends again from the new tip
        store.commit(7, hash(7), hash(6), &[]).await.unwrap();
    }

    #[tokio::test]
    async fn snapshot_and_restore() {
        let store = filled(10).await;
        let snap = store.snapshot(4).await.unwrap();
        assert_eq!(snap.record_count, 10);
        assert_eq!(snap.block_hash, hash(4));

        let tip = store.restore(&snap).await.unwrap();
        assert_eq!(tip, ChainTip::new(4, hash(4)));
        assert_eq!(store.record_count().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn restore_rejects_stale_snapshot() {
        let store = filled(10).await;
        let mut snap = store.snapshot(6).await.unwrap();
        snap.record_count += 1;
        let err = store.restore(&snap).await.unwrap_err();
        assert!(matches!(err, IndexerError::CheckpointUnavailable { height: 6 }));
        // Validation happens before any truncation
        assert_eq!(store.tip().await.unwrap().unwrap().height, 9);
    }

    #[tokio::test]
    async fn reset_keeps_network_and_checkpoints() {
        let store = filled(3).await;
        store.set_network(Network::Regtest).await.unwrap();
        let snapshot = store.snapshot(2).await.unwrap();
        store
            .save(Checkpoint { height: 2, hash: hash(2), snapshot, created_at: 0 })
            .await
            .unwrap();

        store.reset().await.unwrap();
        assert!(store.tip().await.unwrap().is_none());
        assert_eq!(store.record_count().await.unwrap(), 0);
        assert_eq!(store.network().await.unwrap(), Some(Network::Regtest));
        assert_eq!(store.load_all().await.unwrap().len(), 1);
        store.commit(0, hash(0), BlockHash::ZERO, &[]).await.unwrap();
    }

    #[tokio::test]
    async fn writer_lock_is_exclusive() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        store.acquire_writer().unwrap();
        assert!(matches!(store.acquire_writer(), Err(IndexerError::Configuration(_))));
        store.release_writer();
        assert!(store.acquire_writer().is_ok());
    }

    #[tokio::test]
    async fn writer_lock_spans_handles_on_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chainsync.db");
        let path = path.to_str().unwrap();
        let first = SqliteStateStore::open(path).await.unwrap();
        let second = SqliteStateStore::open(&format!("sqlite:{path}")).await.unwrap();

        first.acquire_writer().unwrap();
        let err = second.acquire_writer().unwrap_err();
        assert!(matches!(err, IndexerError::Configuration(_)), "{err}");
        // A refused attempt leaves the handle free to try again.
        first.release_writer();
        second.acquire_writer().unwrap();
        assert!(first.acquire_writer().is_err());

        drop(second);
        first.acquire_writer().unwrap();
    }

    #[tokio::test]
    async fn second_engine_on_same_file_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chainsync.db");
        let path = path.to_str().unwrap();
        let source = MemoryBlockSource::with_chain(synthetic_chain(3, 1));

        let a = Arc::new(SqliteStateStore::open(path).await.unwrap());
        let b = Arc::new(SqliteStateStore::open(path).await.unwrap());
        let engine = SyncEngine::open(config(), source.clone(), KeyParser, a).await.unwrap();
        let refused = SyncEngine::open(config(), source.clone(), KeyParser, b.clone()).await;
        assert!(matches!(refused, Err(IndexerError::Configuration(_))));

        drop(engine);
        assert!(SyncEngine::open(config(), source, KeyParser, b).await.is_ok());
    }

    // ── CheckpointStore ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn checkpoint_roundtrip() {
        let store = filled(21).await;
        for h in [0u64, 10, 20] {
            let snapshot = store.snapshot(h).await.unwrap();
            store
                .save(Checkpoint { height: h, hash: hash(h), snapshot, created_at: 1_700_000_000 })
                .await
                .unwrap();
        }

        let all = store.load_all().await.unwrap();
        assert_eq!(all.iter().map(|c| c.height).collect::<Vec<_>>(), vec![0, 10, 20]);
        let cp = store.load(10).await.unwrap().unwrap();
        assert_eq!(cp.hash, hash(10));
        assert_eq!(cp.snapshot.record_count, 22);
        assert_eq!(cp.created_at, 1_700_000_000);

        store.delete(10).await.unwrap();
        assert!(store.load(10).await.unwrap().is_none());
        assert_eq!(store.load_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn checkpoint_upsert() {
        let store = filled(11).await;
        let snapshot = store.snapshot(10).await.unwrap();
        let cp = Checkpoint { height: 10, hash: hash(10), snapshot, created_at: 1 };
        store.save(cp.clone()).await.unwrap();
        store.save(Checkpoint { created_at: 2, ..cp }).await.unwrap();

        assert_eq!(store.load_all().await.unwrap().len(), 1);
        assert_eq!(store.load(10).await.unwrap().unwrap().created_at, 2);
    }

    // ── With the engine ───────────────────────────────────────────────────────

    struct KeyParser;

    impl BlockParser for KeyParser {
        fn parse(&self, block: &Block) -> Result<Vec<IndexedRecord>, IndexerError> {
            Ok(vec![IndexedRecord {
                height: block.height,
                position: 0,
                kind: RecordKind::Transaction,
                key: block.hash.to_hex(),
                data: block.raw.clone(),
            }])
        }
    }

    fn config() -> SyncConfig {
        let mut cfg = SyncConfig::new(Network::Regtest, 10, 5);
        cfg.verify_genesis = false;
        cfg
    }

    #[tokio::test]
    async fn engine_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chainsync.db");
        let path = path.to_str().unwrap();
        let source = MemoryBlockSource::with_chain(synthetic_chain(31, 1));

        {
            let store = Arc::new(SqliteStateStore::open(path).await.unwrap());
            let mut engine = SyncEngine::open(config(), source.clone(), KeyParser, store.clone())
                .await
                .unwrap();
            engine.bootstrap("regtest").await.unwrap();
            engine.shutdown().await.unwrap();
            store.close().await;
        }

        source.extend(10, 1);
        source.clear_fetch_log();
        let store = Arc::new(SqliteStateStore::open(path).await.unwrap());
        assert_eq!(store.tip().await.unwrap().unwrap().height, 30);
        assert_eq!(store.network().await.unwrap(), Some(Network::Regtest));
        assert_eq!(
            store.load_all().await.unwrap().iter().map(|c| c.height).collect::<Vec<_>>(),
            vec![0, 10, 20, 30]
        );

        let mut engine = SyncEngine::open(config(), source.clone(), KeyParser, store.clone())
            .await
            .unwrap();
        let tip = engine.run().await.unwrap().tip().unwrap();
        assert_eq!(tip.height, 40);
        assert_eq!(source.lowest_fetched(), Some(31));
        assert_eq!(store.record_count().await.unwrap(), 41);
    }

    #[tokio::test]
    async fn engine_rolls_back_sqlite_state() {
        let old = synthetic_chain(36, 1);
        let source = MemoryBlockSource::with_chain(old.clone());
        let store = Arc::new(SqliteStateStore::in_memory().await.unwrap());
        let mut engine = SyncEngine::open(config(), source.clone(), KeyParser, store.clone())
            .await
            .unwrap();
        engine.bootstrap("regtest").await.unwrap();

        let new = fork_chain(&old, 22, 20, 2);
        source.set_chain(new.clone());
        let tip = engine.catch_up().await.unwrap().tip().unwrap();

        assert_eq!(tip.hash, new[42].hash);
        for h in 0..=42u64 {
            let recs = store.records_at(h).await.unwrap();
            assert_eq!(recs.len(), 1);
            assert_eq!(recs[0].key, new[h as usize].hash.to_hex());
        }
    }
}
