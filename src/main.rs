//! Shuhai main entry point
//!
//! This is the command-line interface for the Shuhai catalog harvester.

use clap::{Parser, Subcommand};
use shuhai::config::load_config_with_hash;
use shuhai::crawler::{fetch_chapter_list, run_cover_crawl, run_detail_crawl, run_listing_crawl};
use shuhai::storage::{SqliteStore, Store};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Shuhai: a proxy-rotating catalog harvester
///
/// Shuhai crawls a paginated listing site through a rotating proxy pool,
/// deduplicates records against previously stored data, and persists them
/// into an embedded SQLite database.
#[derive(Parser, Debug)]
#[command(name = "shuhai")]
#[command(version = "0.1.0")]
#[command(about = "A proxy-rotating catalog harvester", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Crawl a range of listing pages
    Listing {
        /// First page of the range (inclusive)
        #[arg(long, default_value_t = 1)]
        start: u32,

        /// Last page of the range (inclusive)
        #[arg(long)]
        end: u32,
    },

    /// Crawl detail pages for listings not yet covered
    Detail {
        /// Keep pulling batches until the pending queue is empty
        #[arg(long)]
        continuous: bool,

        /// Override the configured batch size
        #[arg(long)]
        batch_size: Option<u32>,
    },

    /// Backfill cover image URLs for listings that have none
    Covers {
        /// Keep pulling batches until every listing has a cover
        #[arg(long)]
        continuous: bool,

        /// Override the configured batch size
        #[arg(long)]
        batch_size: Option<u32>,
    },

    /// Fetch one book's chapter list and print it as JSON
    Chapters {
        /// Book id on the target site
        #[arg(long)]
        book_id: u64,
    },

    /// Show row counts from the database and exit
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = match load_config_with_hash(&cli.config) {
        Ok((cfg, hash)) => {
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            (cfg, hash)
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_shutdown_listener(shutdown.clone());

    match cli.command {
        Command::Listing { start, end } => {
            anyhow::ensure!(start <= end, "--start must not exceed --end");
            let totals = run_listing_crawl(&config, &config_hash, start, end, shutdown).await?;
            println!(
                "Pages: {}  Records: {}  Inserted: {}  Skipped: {}  Failed: {}",
                totals.items, totals.records, totals.inserted, totals.skipped, totals.failed
            );
        }
        Command::Detail {
            continuous,
            batch_size,
        } => {
            let totals =
                run_detail_crawl(&config, &config_hash, continuous, batch_size, shutdown).await?;
            println!(
                "Items: {}  Stored: {}  Skipped: {}  Failed: {}",
                totals.items, totals.inserted, totals.skipped, totals.failed
            );
        }
        Command::Covers {
            continuous,
            batch_size,
        } => {
            let totals =
                run_cover_crawl(&config, &config_hash, continuous, batch_size, shutdown).await?;
            println!(
                "Items: {}  Updated: {}  Skipped: {}  Failed: {}",
                totals.items, totals.inserted, totals.skipped, totals.failed
            );
        }
        Command::Chapters { book_id } => {
            let volumes = fetch_chapter_list(&config, book_id).await?;
            println!("{}", serde_json::to_string_pretty(&volumes)?);
        }
        Command::Stats => {
            handle_stats(&config)?;
        }
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("shuhai=info,warn"),
            1 => EnvFilter::new("shuhai=debug,info"),
            2 => EnvFilter::new("shuhai=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Flags shutdown on Ctrl-C; in-flight work finishes before the run ends
fn spawn_shutdown_listener(shutdown: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("shutdown requested, finishing in-flight work");
            shutdown.store(true, Ordering::SeqCst);
        }
    });
}

/// Handles the stats subcommand: shows row counts from the database
fn handle_stats(config: &shuhai::config::Config) -> anyhow::Result<()> {
    println!("Database: {}\n", config.output.database_path);

    let store = SqliteStore::new(std::path::Path::new(&config.output.database_path))?;

    println!("Listings:       {}", store.count_listings()?);
    println!("Details:        {}", store.count_details()?);
    println!("Pending detail: {}", store.count_pending()?);
    println!("Missing covers: {}", store.count_missing_covers()?);

    if let Some(run) = store.last_run()? {
        println!(
            "\nLast run: #{} {} ({}), started {}",
            run.id,
            run.mode,
            run.status.to_db_string(),
            run.started_at
        );
        if let Some(finished) = run.finished_at {
            println!("Finished: {}", finished);
        }
    }

    Ok(())
}
