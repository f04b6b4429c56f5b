//! Crawl services: the downloader, the per-date orchestrator, the bulk
//! campaign coordinator and the cron scheduler.

pub mod bulk;
pub mod downloader;
pub mod orchestrator;
pub mod scheduler;

pub use bulk::BulkCoordinator;
pub use downloader::{DownloadResult, Downloader};
pub use orchestrator::CrawlOrchestrator;
pub use scheduler::CrawlScheduler;
