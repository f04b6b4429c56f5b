//! ECLI Case-Law Crawler
//!
//! This crate provides a polite, resumable crawler for the German case-law
//! portal's daily ECLI sitemap feed. It discovers documents through daily
//! sitemap indices, downloads and validates their XML/HTML bodies (XXE
//! hardening, ECLI grammar, LegalDocML.de structure checks), enriches
//! metadata by lightweight extraction, and ingests results into dual
//! storage: a filesystem archive organized by court/year/month and a
//! full-text search index with German-language analysis. Long-running bulk
//! campaigns persist their progress and support pause, resume and cancel.

pub mod config;
pub mod error;
pub mod extraction;
pub mod models;
pub mod rate_limit;
pub mod services;
pub mod sitemaps;
pub mod storage;
pub mod utils;
pub mod validation;

pub use config::Config;
pub use error::{CrawlerError, CrawlerResult};
pub use extraction::{ContentExtractor, ExtractedContent};
pub use models::{
    BulkCrawlOptions, BulkCrawlProgress, BulkCrawlStatus, Court, CrawlReport, DiscoveryResult,
    DocumentStatus, LegalDocument, SitemapEntry,
};
pub use rate_limit::RateLimiter;
pub use services::{BulkCoordinator, CrawlOrchestrator, CrawlScheduler, DownloadResult, Downloader};
pub use sitemaps::{SitemapDiscovery, SitemapFetcher};
pub use storage::{
    build_store, ArchiveStore, DocumentStore, DualStore, JsonProgressStore, ProgressStore,
    SearchStore, StorageStats,
};
pub use validation::{EcliValidator, LegalDocMlValidator, ValidationPipeline, ValidationReport, XmlSanitizer};
