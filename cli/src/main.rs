//! chainsql CLI — inspect ingestion state and compare replicas.
//!
//! Usage:
//! ```bash
//! chainsql height ./chainsql.db
//! chainsql hash   ./chainsql.db
//! chainsql info
//! ```

use std::env;
use std::process;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use chainsql_core::FeedConfig;
use chainsql_storage::{SqliteStore, StateHashConfig};

fn main() {
    tracing_subscriber::fmt()
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
        "height" => cmd_height(&args[2..]),
        "hash" => cmd_hash(&args[2..]),
        "info" => {
            cmd_info();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            println!("chainsql {}", env!("CARGO_PKG_VERSION"));
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
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("chainsql {}", env!("CARGO_PKG_VERSION"));
    println!("Chain-driven SQL ingestion with crash-safe checkpoints\n");
    println!("USAGE:");
    println!("    chainsql <COMMAND>\n");
    println!("COMMANDS:");
    println!("    height <db>  Print the last processed height per chain");
    println!("    hash <db>    Print the canonical state digest of a database");
    println!("    info         Show ChainSQL configuration info");
    println!("    version      Print version");
    println!("    help         Print this help");
}

fn cmd_height(args: &[String]) -> Result<()> {
    let path = args.first().context("usage: chainsql height <db>")?;
    let store = SqliteStore::open(path).with_context(|| format!("opening {path}"))?;
    let heights = store.processed_heights()?;
    if heights.is_empty() {
        println!("no checkpoints recorded");
        return Ok(());
    }
    for (chain_id, block_number) in heights {
        println!("chain {chain_id}: block {block_number}");
    }
    Ok(())
}

fn cmd_hash(args: &[String]) -> Result<()> {
    let path = args.first().context("usage: chainsql hash <db>")?;
    let store = SqliteStore::open(path).with_context(|| format!("opening {path}"))?;
    let digest = store.state_hash(&StateHashConfig::default())?;
    println!("{digest}");
    Ok(())
}

fn cmd_info() {
    let defaults = FeedConfig::default();
    println!("ChainSQL v{}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Default reorg safety depth: {} block(s)",
        defaults.reorg_safety_depth
    );
    println!("  Default batch size: {} blocks/round", defaults.max_batch_size);
    println!("  Events: RunSQL, TransferTable");
    println!("  Storage backends: memory, SQLite");
    println!("  State digest: SHA-256 over schema + contents, system tables excluded");
}
