//! blockindex CLI: inspect and manage index state.
//!
//! Usage:
//! ```bash
//! blockindex missing         --db ./index.db --from 0 --to 5000
//! blockindex verified-height --db ./index.db [--set 4200]
//! blockindex status          --db ./index.db
//! blockindex info            [--config indexer.json]
//! ```
//!
//! Global flags: `--log-level LEVEL`, `--log-json`. `RUST_LOG` overrides the level.

mod logging;

use anyhow::{bail, Context, Result};
use serde_json::json;
use std::env;
use std::process;

use blockindex_core::config::IndexerConfig;
use blockindex_core::metadata::IndexMetadata;
use blockindex_core::store::IndexStore;
use blockindex_pipeline::GapFinder;
use blockindex_storage::sqlite::SqliteStorage;

use crate::logging::{init_tracing, LogConfig};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    init_tracing(&LogConfig {
        level: flag(&args, "--log-level").unwrap_or("info").to_string(),
        json: args.iter().any(|a| a == "--log-json"),
        ..LogConfig::default()
    });

    let result = match args[1].as_str() {
        "info" => cmd_info(&args),
        "missing" => cmd_missing(&args).await,
        "verified-height" => cmd_verified_height(&args).await,
        "status" => cmd_status(&args).await,
        "version" | "--version" | "-V" => {
            println!("blockindex {}", env!("CARGO_PKG_VERSION"));
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
        tracing::error!(error = %e, "command failed");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("blockindex {}", env!("CARGO_PKG_VERSION"));
    println!("Reorg-safe relational block index\n");
    println!("USAGE:");
    println!("    blockindex <COMMAND> [OPTIONS]\n");
    println!("COMMANDS:");
    println!("    missing          List missing height ranges (--db, --from, --to)");
    println!("    verified-height  Show or set the verified height (--db, [--set N])");
    println!("    status           Show stored index progress (--db)");
    println!("    info             Show the effective configuration ([--config FILE])");
    println!("    version          Print version");
    println!("    help             Print this help\n");
    println!("OPTIONS:");
    println!("    --log-level LEVEL  trace | debug | info | warn | error");
    println!("    --log-json         Emit JSON logs");
}

/// Value following `name`, if present.
fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn required<'a>(args: &'a [String], name: &str) -> Result<&'a str> {
    flag(args, name).with_context(|| format!("missing required option {name}"))
}

fn height(args: &[String], name: &str) -> Result<u64> {
    let raw = required(args, name)?;
    raw.parse()
        .with_context(|| format!("{name} expects a non-negative height, got {raw:?}"))
}

/// Defaults, then the `--config` JSON file, then `BLOCKINDEX_*` variables.
fn load_config(args: &[String]) -> Result<IndexerConfig> {
    let config: IndexerConfig = match flag(args, "--config") {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {path}"))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing config file {path}"))?
        }
        None => IndexerConfig::default(),
    };
    Ok(config.with_env_overrides())
}

async fn open_store(args: &[String]) -> Result<SqliteStorage> {
    let path = required(args, "--db")?;
    let store = SqliteStorage::open(path)
        .await
        .with_context(|| format!("opening index database {path}"))?;
    Ok(store)
}

fn cmd_info(args: &[String]) -> Result<()> {
    let config = load_config(args)?;
    println!("BlockIndex v{}", env!("CARGO_PKG_VERSION"));
    println!("  Storage backends: memory, SQLite (feature: sqlite), Postgres (feature: postgres)");
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

async fn cmd_missing(args: &[String]) -> Result<()> {
    let from = height(args, "--from")?;
    let to = height(args, "--to")?;
    if to < from {
        bail!("--to ({to}) is below --from ({from})");
    }
    let config = load_config(args)?;
    let store: std::sync::Arc<dyn IndexStore> = std::sync::Arc::new(open_store(args).await?);
    let finder = GapFinder::new(store, config.gap_bootstrap_threshold);
    let ranges = finder.find_missing_ranges(from, to).await?;
    let missing = ranges.iter().fold(0u64, |acc, r| acc.saturating_add(r.len()));
    tracing::info!(from, to, ranges = ranges.len(), missing, "missing ranges computed");
    println!("{}", serde_json::to_string_pretty(&ranges)?);
    Ok(())
}

async fn cmd_verified_height(args: &[String]) -> Result<()> {
    let store = open_store(args).await?;
    let metadata = IndexMetadata::new(std::sync::Arc::new(store));
    if flag(args, "--set").is_some() {
        let value = height(args, "--set")?;
        metadata.set_index_verified_height(value).await?;
        tracing::info!(height = value, "verified height set");
    }
    match metadata.index_verified_height().await? {
        Some(h) => println!("{h}"),
        None => println!("unset"),
    }
    Ok(())
}

async fn cmd_status(args: &[String]) -> Result<()> {
    let store = std::sync::Arc::new(open_store(args).await?);
    let metadata = IndexMetadata::new(store.clone());

    let genesis = metadata.genesis_height().await?;
    let verified = metadata.index_verified_height().await?;
    let finalized = metadata.finalized_height().await?;
    let last_indexed = store.max_height().await?;
    let indexed_count = match last_indexed {
        Some(max) => store.count_blocks(genesis.unwrap_or(0), max).await?,
        None => 0,
    };

    let status = json!({
        "genesisHeight": genesis,
        "lastIndexedHeight": last_indexed,
        "indexedCount": indexed_count,
        "indexVerifiedHeight": verified,
        "finalizedHeight": finalized,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
