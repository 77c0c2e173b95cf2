//! asin-harvest main entry point
//!
//! Command-line driver for the scan manager: runs queued scans against the
//! configured scraping provider and inspects the scans kept in the database.

use anyhow::Context;
use asin_harvest::config::{load_config_with_hash, Config};
use asin_harvest::extract::{HtmlExtractor, PageExtractor};
use asin_harvest::fetcher::{DealsSource, ListingDealsSource, Marketplace, PageFetcher, ProviderFetcher};
use asin_harvest::scan::{ScanDetails, ScanManager, ScanRequest, ScanSettings};
use asin_harvest::state::ScanState;
use asin_harvest::storage::{import_tree, load_tree_file, open_storage, shared};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// asin-harvest: budgeted product scans over a marketplace catalog
///
/// Scans run one at a time. Extra scans wait in a queue in the database and
/// start in creation order once the active one completes.
#[derive(Parser, Debug)]
#[command(name = "asin-harvest")]
#[command(version)]
#[command(about = "Budgeted, resumable product scans", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enqueue scan request files and run until the queue is empty
    Run {
        /// Scan request files (TOML)
        #[arg(value_name = "SCAN_FILES")]
        scan_files: Vec<PathBuf>,

        /// Resume a stalled scan after this many seconds
        #[arg(long, value_name = "SECS")]
        auto_resume: Option<u64>,
    },

    /// List scans, newest first
    List {
        #[arg(long, default_value_t = 1)]
        page: usize,
    },

    /// Show one scan in detail
    Details {
        #[arg(value_name = "ID")]
        id: i64,
    },

    /// Delete an enqueued or completed scan
    Delete {
        #[arg(value_name = "ID")]
        id: i64,
    },

    /// Import a category tree from a TOML file
    ImportTree {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
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

    match cli.command {
        Command::Run {
            scan_files,
            auto_resume,
        } => handle_run(&config, config_hash, &scan_files, auto_resume).await,
        Command::List { page } => handle_list(&config, config_hash, page),
        Command::Details { id } => handle_details(&config, config_hash, id),
        Command::Delete { id } => {
            let (manager, _) = build_manager(&config, config_hash)?;
            manager.delete_scan(id)?;
            println!("✓ Scan {} deleted", id);
            Ok(())
        }
        Command::ImportTree { file } => handle_import_tree(&config, &file),
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("asin_harvest=info,warn"),
            1 => EnvFilter::new("asin_harvest=debug,info"),
            2 => EnvFilter::new("asin_harvest=trace,debug"),
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

/// Wires the store, provider client and extractor into a manager
fn build_manager(
    config: &Config,
    config_hash: String,
) -> anyhow::Result<(ScanManager, Arc<ProviderFetcher>)> {
    let database = Path::new(&config.service.database_path);
    let storage = open_storage(database)
        .with_context(|| format!("Cannot open database {}", database.display()))?;

    let marketplace = Marketplace::from_config(&config.marketplace);
    let provider = Arc::new(ProviderFetcher::new(&config.provider)?);
    let fetcher: Arc<dyn PageFetcher> = provider.clone();
    let extractor: Arc<dyn PageExtractor> = Arc::new(HtmlExtractor::new());
    let deals: Arc<dyn DealsSource> = Arc::new(ListingDealsSource::new(
        fetcher.clone(),
        extractor.clone(),
        marketplace.clone(),
    ));

    let manager = ScanManager::new(
        shared(storage),
        fetcher,
        extractor,
        deals,
        marketplace,
        ScanSettings::from_config(config, Some(config_hash)),
    );
    Ok((manager, provider))
}

/// Handles `run`: recovers, enqueues and waits for the queue to drain
async fn handle_run(
    config: &Config,
    config_hash: String,
    scan_files: &[PathBuf],
    auto_resume: Option<u64>,
) -> anyhow::Result<()> {
    let (manager, provider) = build_manager(config, config_hash)?;

    if let Some(hint) = provider.refresh_concurrency_hint().await.unwrap_or_else(|e| {
        tracing::warn!("Could not read provider usage: {}", e);
        None
    }) {
        tracing::info!("Concurrency capped at {} by the provider", hint);
    }

    if let Some(id) = manager.recover()? {
        tracing::info!("Scan {} is active", id);
    }

    for file in scan_files {
        let request = ScanRequest::load(file)?;
        match manager.enqueue_scan(request).await {
            Ok(id) => tracing::info!("Scan {} created from {}", id, file.display()),
            Err(e) => tracing::error!(
                "Rejected {} ({}): {}",
                file.display(),
                e.status_code(),
                e
            ),
        }
    }

    if let Some(secs) = auto_resume {
        let manager = manager.clone();
        let provider = provider.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
            interval.tick().await;
            loop {
                interval.tick().await;
                let stalled = manager
                    .active_scan_id()
                    .and_then(|id| manager.scan_details(id).ok())
                    .is_some_and(|details| details.state() == ScanState::Stalled);
                if !stalled {
                    continue;
                }

                if let Err(e) = provider.refresh_concurrency_hint().await {
                    tracing::warn!("Could not read provider usage: {}", e);
                }
                if let Err(e) = manager.resume_active_scan() {
                    tracing::warn!("Auto-resume failed: {}", e);
                }
            }
        });
    }

    loop {
        tokio::select! {
            _ = manager.wait_idle() => break,
            signal = tokio::signal::ctrl_c() => {
                signal?;
                tracing::info!("Interrupt received, halting the active scan");
                if let Err(e) = manager.halt_active_scan() {
                    tracing::warn!("Halt failed: {}", e);
                }
            }
        }
    }

    tracing::info!("No scans left to run");
    Ok(())
}

/// Handles `list`
fn handle_list(config: &Config, config_hash: String, page: usize) -> anyhow::Result<()> {
    let (manager, _) = build_manager(config, config_hash)?;
    let listing = manager.list_scans(page)?;

    println!(
        "=== Scans (page {} of {}) ===\n",
        listing.page,
        listing.total_pages.max(1)
    );
    for scan in &listing.scans {
        println!(
            "#{:<5} {:<9} {:<10} .{:<6} {}/{} products, {} requests, created {}",
            scan.id,
            scan.kind,
            scan.state,
            scan.domain,
            scan.products_gathered,
            scan.products_to_gather,
            scan.sent_requests,
            scan.created_at
        );
    }
    if listing.scans.is_empty() {
        println!("No scans on this page");
    }

    Ok(())
}

/// Handles `details`
fn handle_details(config: &Config, config_hash: String, id: i64) -> anyhow::Result<()> {
    let (manager, _) = build_manager(config, config_hash)?;

    match manager.scan_details(id)? {
        ScanDetails::Live(snapshot) => {
            println!("=== Scan {} ({}, live) ===\n", snapshot.id, snapshot.kind);
            println!("  State: {}", snapshot.state);
            println!("  Domain: {}", snapshot.domain);
            println!(
                "  Products: {}/{}",
                snapshot.counters.products_gathered, snapshot.products_to_gather
            );
            println!(
                "  Requests: {}/{}",
                snapshot.counters.sent_requests, snapshot.budget.max_requests
            );
            println!("  Concurrency: {}", snapshot.budget.max_concurrent_requests);
            println!("  In flight: {}", snapshot.in_flight);
        }
        ScanDetails::Stored(stored) => {
            let record = &stored.record;
            println!("=== Scan {} ({}) ===\n", record.id, record.kind());
            println!("  State: {}", record.state);
            println!("  Domain: {}", record.config.domain);
            println!(
                "  Products: {}/{}",
                stored.products_gathered,
                record.config.target.products_to_gather()
            );
            println!(
                "  Requests: {}/{}",
                record.counters.sent_requests, record.config.budget.max_requests
            );
            println!(
                "  Category pages: {} sent, {} succeeded",
                record.counters.category_pages.sent, record.counters.category_pages.succeeded
            );
            println!(
                "  Product pages: {} sent, {} succeeded",
                record.counters.product_pages.sent, record.counters.product_pages.succeeded
            );
            println!("  Created: {}", record.created_at);
            if let Some(completed) = &record.completed_at {
                println!("  Completed: {}", completed);
            }

            if !stored.categories.is_empty() {
                println!("\nCategory pages ({}):", stored.categories.len());
                for entry in &stored.categories {
                    println!(
                        "  - {} page {} [{}]: {} ASINs",
                        entry.name,
                        entry.page,
                        entry.status,
                        entry.asins.len()
                    );
                }
            }

            println!("\nProducts ({}):", stored.products.len());
            for product in &stored.products {
                match product.rank {
                    Some(rank) => println!("  - {} [{}] rank {}", product.asin, product.status, rank),
                    None => println!("  - {} [{}]", product.asin, product.status),
                }
            }
        }
    }

    Ok(())
}

/// Handles `import-tree`
fn handle_import_tree(config: &Config, file: &Path) -> anyhow::Result<()> {
    let tree = load_tree_file(file)?;
    if !config.service.allowed_domains.contains(&tree.domain) {
        anyhow::bail!("Domain '{}' is not in allowed-domains", tree.domain);
    }

    let mut storage = open_storage(Path::new(&config.service.database_path))?;
    let roots = import_tree(&mut storage, &tree)?;

    println!(
        "✓ Imported {} main categories for .{}",
        roots.len(),
        tree.domain
    );
    Ok(())
}
