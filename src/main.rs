use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ecli_crawler::config::Config;
use ecli_crawler::models::BulkCrawlOptions;
use ecli_crawler::services::{BulkCoordinator, CrawlOrchestrator, CrawlScheduler, Downloader};
use ecli_crawler::sitemaps::{SitemapDiscovery, SitemapFetcher};
use ecli_crawler::storage::{
    build_store, ArchiveStore, DocumentStore, JsonProgressStore, SearchStore,
};
use ecli_crawler::validation::{ValidationMode, ValidationPipeline};

/// **ECLI Crawler CLI**
///
/// Command-line interface for the case-law portal crawler: single-date
/// crawls, bulk campaigns, sitemap discovery, XML validation and storage
/// statistics.
#[derive(Parser)]
#[command(name = "ecli-crawler")]
#[command(about = "Crawler for the case-law portal's daily ECLI sitemap feed")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl a single date
    Crawl {
        /// Date to crawl (YYYY-MM-DD)
        #[arg(short, long, value_parser = parse_date)]
        date: NaiveDate,

        /// Re-download documents that are already stored
        #[arg(long)]
        force: bool,
    },

    /// Bulk campaign operations
    Bulk {
        #[command(subcommand)]
        command: BulkCommands,
    },

    /// Sitemap discovery
    Discover {
        #[command(subcommand)]
        command: DiscoverCommands,
    },

    /// Validate an XML file against the security and LegalDocML checks
    Validate {
        /// Path to the XML file
        #[arg(short, long)]
        file: PathBuf,

        /// Fast path: skip the deep LegalDocML checks
        #[arg(long)]
        quick: bool,

        /// Treat structure errors as warnings
        #[arg(long)]
        lenient: bool,
    },

    /// Run the failed-document retry sweep once
    Retry,

    /// Print storage statistics
    Stats,

    /// Rebuild the search index from the filesystem archive
    Reindex,

    /// Run the cron scheduler in the foreground
    Schedule,
}

#[derive(Subcommand)]
enum BulkCommands {
    /// Start a campaign over a date range (or the full feed history)
    Start {
        /// Range start (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date, required_unless_present = "full")]
        start: Option<NaiveDate>,

        /// Range end (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date, required_unless_present = "full")]
        end: Option<NaiveDate>,

        /// Crawl the portal's full published history instead of a range
        #[arg(long, conflicts_with_all = ["start", "end"])]
        full: bool,

        /// Inter-request spacing for this campaign, in milliseconds
        #[arg(long)]
        rate_limit_ms: Option<u64>,

        /// How many dates may download concurrently
        #[arg(long)]
        concurrency: Option<usize>,

        /// Re-download documents that are already stored
        #[arg(long)]
        force: bool,
    },

    /// Pause a running campaign at the next date boundary
    Pause {
        #[arg(short, long)]
        id: String,
    },

    /// Resume a paused campaign
    Resume {
        #[arg(short, long)]
        id: String,
    },

    /// Cancel a campaign
    Cancel {
        #[arg(short, long)]
        id: String,
    },

    /// Show one campaign, or all non-terminal ones
    Status {
        #[arg(short, long)]
        id: Option<String>,
    },

    /// Delete completed/cancelled campaigns older than the given days
    Cleanup {
        #[arg(long, default_value = "30")]
        days: i64,
    },

    /// Fail campaigns stuck longer than the given hours
    Reap {
        #[arg(long)]
        hours: Option<i64>,
    },
}

#[derive(Subcommand)]
enum DiscoverCommands {
    /// Probe every date in a range
    Range {
        #[arg(long, value_parser = parse_date)]
        start: NaiveDate,

        #[arg(long, value_parser = parse_date)]
        end: NaiveDate,
    },

    /// Sample the most recent days for usable sitemaps
    Recent {
        #[arg(long, default_value = "30")]
        days: u32,
    },

    /// Find the feed's full published span
    Full,
}

fn parse_date(value: &str) -> std::result::Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|e| format!("invalid date {value}: {e}"))
}

/// Everything the commands need, wired once from configuration.
struct Runtime {
    config: Config,
    store: Arc<dyn DocumentStore>,
    orchestrator: Arc<CrawlOrchestrator>,
    discovery: Arc<SitemapDiscovery>,
    progress: Arc<JsonProgressStore>,
}

fn build_runtime(config: Config) -> Result<Runtime> {
    let store = build_store(&config).context("Failed to open document store")?;
    let fetcher =
        SitemapFetcher::new(&config.crawler).context("Failed to build sitemap fetcher")?;
    let downloader = Arc::new(
        Downloader::new(&config.crawler, config.validation.clone(), store.clone())
            .context("Failed to build downloader")?,
    );
    let orchestrator = Arc::new(CrawlOrchestrator::new(fetcher, downloader, store.clone()));
    let discovery = Arc::new(
        SitemapDiscovery::new(&config.crawler, &config.bulk)
            .context("Failed to build sitemap discovery")?,
    );
    let progress = Arc::new(
        JsonProgressStore::open(&config.storage.base_path)
            .context("Failed to open progress store")?,
    );
    Ok(Runtime {
        config,
        store,
        orchestrator,
        discovery,
        progress,
    })
}

fn coordinator(runtime: &Runtime) -> BulkCoordinator {
    BulkCoordinator::new(
        runtime.orchestrator.clone(),
        runtime.discovery.clone(),
        runtime.progress.clone(),
        runtime.config.bulk.clone(),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ecli_crawler=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().map_err(|e| anyhow::anyhow!("Configuration error: {e}"))?;

    match cli.command {
        Commands::Crawl { date, force } => {
            let runtime = build_runtime(config)?;
            let token = CancellationToken::new();
            let report = runtime.orchestrator.crawl_date(date, force, &token).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Bulk { command } => {
            let runtime = build_runtime(config)?;
            let coordinator = coordinator(&runtime);
            match command {
                BulkCommands::Start {
                    start,
                    end,
                    full,
                    rate_limit_ms,
                    concurrency,
                    force,
                } => {
                    let options = BulkCrawlOptions {
                        rate_limit_ms: rate_limit_ms
                            .unwrap_or(runtime.config.bulk.default_rate_limit_ms),
                        max_concurrent_downloads: concurrency
                            .unwrap_or(runtime.config.bulk.default_max_concurrent_downloads),
                        force_update: force,
                    };
                    let id = if full {
                        coordinator.start_full(Some(options)).await?
                    } else {
                        // clap enforces presence when --full is absent
                        let (start, end) = (
                            start.context("--start is required")?,
                            end.context("--end is required")?,
                        );
                        coordinator.start_range(start, end, Some(options)).await?
                    };
                    println!("{id}");
                    watch_campaign(&coordinator, &id).await?;
                }
                BulkCommands::Pause { id } => {
                    coordinator.pause(&id).await?;
                    println!("pause requested for {id}");
                }
                BulkCommands::Resume { id } => {
                    coordinator.resume(&id).await?;
                    watch_campaign(&coordinator, &id).await?;
                }
                BulkCommands::Cancel { id } => {
                    coordinator.cancel(&id).await?;
                    println!("cancel requested for {id}");
                }
                BulkCommands::Status { id } => match id {
                    Some(id) => {
                        let progress = coordinator.get(&id).await?;
                        println!("{}", serde_json::to_string_pretty(&progress)?);
                    }
                    None => {
                        let active = coordinator.list_active().await?;
                        println!("{}", serde_json::to_string_pretty(&active)?);
                    }
                },
                BulkCommands::Cleanup { days } => {
                    let removed = coordinator.cleanup_old(days).await?;
                    println!("removed {removed} campaign(s)");
                }
                BulkCommands::Reap { hours } => {
                    let hours = hours
                        .unwrap_or(runtime.config.bulk.stuck_operation_timeout_hours as i64);
                    let reaped = coordinator.reap_stuck(hours).await?;
                    println!("reaped {reaped} stuck campaign(s)");
                }
            }
        }

        Commands::Discover { command } => {
            let runtime = build_runtime(config)?;
            let token = CancellationToken::new();
            let result = match command {
                DiscoverCommands::Range { start, end } => {
                    runtime.discovery.discover_range(start, end, &token).await?
                }
                DiscoverCommands::Recent { days } => {
                    runtime.discovery.discover_recent(days, &token).await?
                }
                DiscoverCommands::Full => runtime.discovery.discover_full(&token).await?,
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        }

        Commands::Validate {
            file,
            quick,
            lenient,
        } => {
            let content = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let pipeline = ValidationPipeline::new(config.validation.clone());
            let report = if quick {
                pipeline.quick_validate(&content)
            } else if lenient {
                pipeline.validate_with_mode(&content, ValidationMode::Lenient)
            } else {
                pipeline.validate_with_mode(&content, ValidationMode::Strict)
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.valid {
                std::process::exit(1);
            }
        }

        Commands::Retry => {
            let runtime = build_runtime(config)?;
            let token = CancellationToken::new();
            let recovered = runtime
                .orchestrator
                .retry_failed(chrono::Duration::hours(1), &token)
                .await?;
            println!("recovered {recovered} document(s)");
        }

        Commands::Stats => {
            let runtime = build_runtime(config)?;
            let stats = runtime.store.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        Commands::Reindex => {
            let base = &config.storage.base_path;
            let archive = ArchiveStore::open(base).context("Failed to open archive")?;
            let search =
                SearchStore::open(&base.join("_index")).context("Failed to open search index")?;
            let count = search.reindex_from(&archive).await?;
            println!("reindexed {count} document(s)");
        }

        Commands::Schedule => {
            let runtime = build_runtime(config)?;
            let coordinator = coordinator(&runtime);
            let recovered = coordinator.recover_on_startup().await?;
            if recovered > 0 {
                info!("Parked {recovered} interrupted campaign(s) for operator resume");
            }
            let scheduler = CrawlScheduler::new(
                runtime.orchestrator.clone(),
                runtime.store.clone(),
                runtime.config.scheduled.clone(),
            );
            match scheduler.start().await? {
                Some(_scheduler) => {
                    info!("Scheduler running; press Ctrl-C to stop");
                    tokio::signal::ctrl_c().await?;
                    info!("Shutting down");
                }
                None => info!("Scheduling disabled; nothing to do"),
            }
        }
    }

    Ok(())
}

/// Follow a campaign until it parks or finishes.
async fn watch_campaign(coordinator: &BulkCoordinator, id: &str) -> Result<()> {
    loop {
        let progress = coordinator.get(id).await?;
        info!(
            "[{}] {} | dates {}/{} | docs ok {} failed {} | {:.1} docs/min",
            id,
            progress.status.as_str(),
            progress.dates_processed,
            progress.total_dates_discovered,
            progress.documents_succeeded,
            progress.documents_failed,
            progress.processing_rate_docs_per_minute
        );
        if progress.status.is_terminal() || progress.status == ecli_crawler::BulkCrawlStatus::Paused
        {
            println!("{}", serde_json::to_string_pretty(&progress)?);
            break;
        }
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    }
    Ok(())
}
