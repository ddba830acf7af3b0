//! Demo CLI: watches a directory recursively and prints token-count changes as they settle.
//!
//! This is intentionally the "one argument" program the spec describes as its non-goal
//! baseline; the extra flags below are ambient tuning knobs (debounce window, poll interval,
//! log verbosity), not additional indexing features.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use fsdex_core::{Indexer, IndexerConfig};
use fsdex_load::LoaderConfig;
use fsdex_tokenizer::WhitespaceTokenizer;
use fsdex_watch::WatcherConfig;
use tracing_subscriber::EnvFilter;

/// Recursively indexes a directory and reports how many files it has seen.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Arguments {
    /// The directory to watch.
    root: PathBuf,

    /// Overrides the debounce/coalescing window before a changed file is re-read.
    #[arg(long, default_value_t = 200)]
    delay_before_read_ms: u64,

    /// Forces polling-based watching at this interval, for filesystems where the native watch
    /// backend is unavailable or insufficiently sensitive.
    #[arg(long, env = "FSDEX_POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,

    /// Overrides `RUST_LOG` for this run.
    #[arg(long)]
    log_level: Option<String>,
}

fn init_tracing(log_level: Option<&str>) {
    let filter = log_level
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = match Arguments::try_parse() {
        Ok(args) => args,
        Err(err) if err.kind() == clap::error::ErrorKind::MissingRequiredArgument => {
            eprintln!("{err}");
            std::process::exit(1);
        }
        Err(err) => err.exit(),
    };
    init_tracing(args.log_level.as_deref());

    if !args.root.is_dir() {
        eprintln!("{:?} does not exist or is not a directory", args.root);
        std::process::exit(1);
    }

    let config = IndexerConfig {
        root: args.root.clone(),
        loader: LoaderConfig {
            delay_before_read: Duration::from_millis(args.delay_before_read_ms),
        },
        watcher: WatcherConfig {
            poll_interval: args.poll_interval_ms.map(Duration::from_millis),
        },
    };

    let indexer = Indexer::start(config, Arc::new(WhitespaceTokenizer))
        .await
        .context("failed to start indexer")?;
    indexer.await_initial_scan().await;
    println!("initial scan complete for {:?}", args.root);

    let mut last_file_count = indexer.index().file_count();
    println!("{} file(s) indexed", last_file_count);

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let file_count = indexer.index().file_count();
                if file_count != last_file_count {
                    println!("{} file(s) indexed", file_count);
                    last_file_count = file_count;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("shutting down");
                break;
            }
        }
    }

    indexer.close().await;
    Ok(())
}
