//! Domain models: documents, campaign progress, sitemap data.

pub mod document;
pub mod progress;
pub mod sitemap;

pub use document::{Court, DocumentStatus, LegalDocument};
pub use progress::{BulkCrawlOptions, BulkCrawlProgress, BulkCrawlStatus};
pub use sitemap::{CrawlReport, DiscoveryResult, SitemapEntry};
