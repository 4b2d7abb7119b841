//! chainsync CLI: inspect and drive a ChainSync state store.
//!
//! Usage:
//! ```bash
//! chainsync info
//! chainsync validate-config sync.json
//! chainsync status      ./chainsync.db
//! chainsync checkpoints ./chainsync.db
//! chainsync records     ./chainsync.db 100 110
//! chainsync sync        sync.json ./chainsync.db blocks.jsonl
//! ```
//!
//! Logging is controlled with `RUST_LOG` (default `info`).

use std::env;
use std::path::Path;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use chainsync_bitcoin::{BitcoinParser, BitcoinParserConfig};
use chainsync_core::{
    Block, CatchUpOutcome, CheckpointStore, MemoryBlockSource, Network, StateStore, SyncConfig,
    SyncEngine,
};
use chainsync_storage::SqliteStateStore;

/// `sync` config file: a [`SyncConfig`] plus optional parser settings.
#[derive(Debug, Deserialize)]
struct CliConfig {
    #[serde(flatten)]
    sync: SyncConfig,
    #[serde(default)]
    parser: BitcoinParserConfig,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "info" => {
            cmd_info();
            Ok(())
        }
        "validate-config" => with_args(&args, 1).and_then(|a| cmd_validate_config(&a[0])),
        "status" => match with_args(&args, 1) {
            Ok(a) => cmd_status(&a[0]).await,
            Err(e) => Err(e),
        },
        "checkpoints" => match with_args(&args, 1) {
            Ok(a) => cmd_checkpoints(&a[0]).await,
            Err(e) => Err(e),
        },
        "records" => match with_args(&args, 3) {
            Ok(a) => cmd_records(&a[0], &a[1], &a[2]).await,
            Err(e) => Err(e),
        },
        "sync" => match with_args(&args, 3) {
            Ok(a) => cmd_sync(&a[0], &a[1], &a[2]).await,
            Err(e) => Err(e),
        },
        "version" | "--version" | "-V" => {
            println!("chainsync {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn with_args(args: &[String], n: usize) -> Result<&[String]> {
    let rest = &args[2..];
    if rest.len() < n {
        bail!("'{}' expects {n} argument(s), got {}", args[1], rest.len());
    }
    Ok(&rest[..n])
}

fn print_usage() {
    println!("chainsync {}", env!("CARGO_PKG_VERSION"));
    println!("Bitcoin block ingestion with checkpoints and reorg rollback\n");
    println!("USAGE:");
    println!("    chainsync <COMMAND> [ARGS]\n");
    println!("COMMANDS:");
    println!("    info                               Show defaults and supported networks");
    println!("    validate-config <config.json>      Check a sync config file");
    println!("    status <db>                        Show network, tip and record count");
    println!("    checkpoints <db>                   List retained checkpoints");
    println!("    records <db> <from> <to>           Print records in a height range");
    println!("    sync <config.json> <db> <blocks>   Ingest a JSON-lines block file");
    println!("    version                            Print version");
    println!("    help                               Print this help");
}

fn cmd_info() {
    let defaults = SyncConfig::new(Network::Mainnet, 0, 0);
    println!("ChainSync v{}", env!("CARGO_PKG_VERSION"));
    println!("  Networks:");
    for network in Network::ALL {
        println!("    {:<9} genesis {}", network.as_str(), network.genesis_hash());
    }
    println!("  Default source retries: {}", defaults.retry.max_retries);
    println!("  Default persistence retries: {}", defaults.persistence_retries);
    println!("  Default checkpoint budget: {} ms", defaults.checkpoint_timeout_ms);
    println!("  Default OP_RETURN prefix: {}", BitcoinParserConfig::default().prefix);
    println!("  Storage backends: memory, SQLite");
}

fn load_config(path: &str) -> Result<CliConfig> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let config: CliConfig = serde_json::from_str(&text).with_context(|| format!("parsing {path}"))?;
    config.sync.validate()?;
    Ok(config)
}

fn cmd_validate_config(path: &str) -> Result<()> {
    let config = load_config(path)?;
    let sync = &config.sync;
    println!("{path}: ok");
    println!("  id:                  {}", sync.id);
    println!("  network:             {}", sync.network);
    println!("  checkpoint interval: {}", sync.checkpoint_interval);
    println!("  retain checkpoints:  {}", sync.retain_checkpoints);
    println!("  OP_RETURN prefix:    {}", config.parser.prefix);
    Ok(())
}

async fn open_existing(db: &str) -> Result<SqliteStateStore> {
    if !db.starts_with("sqlite:") && !Path::new(db).exists() {
        bail!("no database at {db}");
    }
    Ok(SqliteStateStore::open(db).await?)
}

async fn cmd_status(db: &str) -> Result<()> {
    let store = open_existing(db).await?;
    let network = store.network().await?;
    let tip = store.tip().await?;
    let checkpoints = store.load_all().await?;

    println!("database:    {db}");
    println!(
        "network:     {}",
        network.map(|n| n.to_string()).unwrap_or_else(|| "(not bootstrapped)".into())
    );
    match tip {
        Some(tip) => println!("tip:         {} {}", tip.height, tip.hash),
        None => println!("tip:         (empty)"),
    }
    println!("records:     {}", store.record_count().await?);
    println!(
        "checkpoints: {} (newest: {})",
        checkpoints.len(),
        checkpoints
            .last()
            .map(|c| c.height.to_string())
            .unwrap_or_else(|| "-".into())
    );
    Ok(())
}

async fn cmd_checkpoints(db: &str) -> Result<()> {
    let store = open_existing(db).await?;
    let checkpoints = store.load_all().await?;
    if checkpoints.is_empty() {
        println!("no checkpoints");
        return Ok(());
    }
    println!("{:>10}  {:<64}  {:>10}  created", "height", "hash", "records");
    for cp in checkpoints {
        let created = chrono::DateTime::from_timestamp(cp.created_at, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| cp.created_at.to_string());
        println!(
            "{:>10}  {:<64}  {:>10}  {created}",
            cp.height, cp.hash, cp.snapshot.record_count
        );
    }
    Ok(())
}

async fn cmd_records(db: &str, from: &str, to: &str) -> Result<()> {
    let from: u64 = from.parse().with_context(|| format!("invalid height '{from}'"))?;
    let to: u64 = to.parse().with_context(|| format!("invalid height '{to}'"))?;
    let store = open_existing(db).await?;
    for r in store.records_in(from, to).await? {
        println!("{}:{} {:<12} {} {}", r.height, r.position, r.kind, r.key, hex::encode(&r.data));
    }
    Ok(())
}

/// Read one JSON-encoded [`Block`] per line.
fn read_blocks(path: &str) -> Result<Vec<Block>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("{path}:{}: invalid block", i + 1))
        })
        .collect()
}

async fn cmd_sync(config_path: &str, db: &str, blocks_path: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let blocks = read_blocks(blocks_path)?;
    for (i, block) in blocks.iter().enumerate() {
        if block.height != i as u64 {
            bail!("{blocks_path}: line {} has height {}, expected {i}", i + 1, block.height);
        }
    }

    let network = config.sync.network;
    let store = Arc::new(SqliteStateStore::open(db).await?);
    let source = MemoryBlockSource::with_chain(blocks);
    let parser = BitcoinParser::new(config.parser);
    let mut engine = SyncEngine::open(config.sync, source, parser, store.clone()).await?;

    let handle = engine.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping at the next block boundary");
            handle.shutdown();
        }
    });

    let outcome = if store.tip().await?.is_none() {
        engine.bootstrap(network.as_str()).await?
    } else {
        engine.catch_up().await?
    };
    let tip = engine.shutdown().await?;

    match outcome {
        CatchUpOutcome::CaughtUp { .. } => println!("caught up"),
        CatchUpOutcome::Cancelled { .. } => println!("interrupted"),
    }
    if let Some(tip) = tip {
        println!("tip: {} {}", tip.height, tip.hash);
    }
    println!("records: {}", store.record_count().await?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_config_flattens_sync_settings() {
        let config: CliConfig = serde_json::from_str(
            r#"{
                "id": "xcp",
                "network": "testnet4",
                "checkpoint_interval": 100,
                "retain_checkpoints": 10,
                "parser": { "prefix": "XCP" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.sync.network, Network::Testnet4);
        assert_eq!(config.sync.id, "xcp");
        assert_eq!(config.parser.prefix, "XCP");
    }

    #[test]
    fn cli_config_defaults_parser() {
        let config: CliConfig = serde_json::from_str(
            r#"{ "network": "regtest", "checkpoint_interval": 1, "retain_checkpoints": 1 }"#,
        )
        .unwrap();
        assert_eq!(config.parser, BitcoinParserConfig::default());
    }

    #[test]
    fn reads_block_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.jsonl");
        let chain = chainsync_core::source::synthetic_chain(3, 1);
        let lines: Vec<String> = chain.iter().map(|b| serde_json::to_string(b).unwrap()).collect();
        std::fs::write(&path, lines.join("\n") + "\n\n").unwrap();

        let blocks = read_blocks(path.to_str().unwrap()).unwrap();
        assert_eq!(blocks, chain);
    }

    #[test]
    fn missing_args_are_reported() {
        let args: Vec<String> = ["chainsync", "records", "db"].iter().map(|s| s.to_string()).collect();
        assert!(with_args(&args, 3).is_err());
        assert_eq!(with_args(&args, 1).unwrap(), &args[2..3]);
    }
}
