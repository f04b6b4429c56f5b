//! Storage abstraction: one repository contract, two backends (filesystem
//! archive and full-text search index), plus the campaign progress store.

pub mod archive;
pub mod dual;
pub mod progress;
pub mod search;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{Config, StorageType};
use crate::error::CrawlerResult;
use crate::models::{Court, DocumentStatus, LegalDocument};

pub use archive::ArchiveStore;
pub use dual::DualStore;
pub use progress::{JsonProgressStore, ProgressStore};
pub use search::SearchStore;

/// Aggregate counts over the stored corpus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageStats {
    pub total_documents: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_court: BTreeMap<String, u64>,
}

/// **Document Store Contract**
///
/// The single repository interface over the archive filesystem and the
/// search index. Writes are idempotent by `document_id` and per-document
/// atomic from the caller's perspective: after a successful `upsert`, a
/// subsequent `find_by_document_id` returns the new state. Reads of unknown
/// ids return `Ok(None)` and never fail.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert or replace by `document_id`.
    async fn upsert(&self, doc: &LegalDocument) -> CrawlerResult<()>;

    async fn find_by_document_id(&self, document_id: &str)
        -> CrawlerResult<Option<LegalDocument>>;

    async fn exists_by_source_url(&self, url: &str) -> CrawlerResult<bool>;

    /// Paged court listing, newest decisions first.
    async fn find_by_court(
        &self,
        court: Court,
        limit: usize,
        offset: usize,
    ) -> CrawlerResult<Vec<LegalDocument>>;

    async fn find_by_status(&self, status: DocumentStatus) -> CrawlerResult<Vec<LegalDocument>>;

    async fn find_by_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CrawlerResult<Vec<LegalDocument>>;

    async fn find_by_ecli(&self, ecli: &str) -> CrawlerResult<Option<LegalDocument>>;

    async fn find_by_crawled_after(
        &self,
        after: DateTime<Utc>,
    ) -> CrawlerResult<Vec<LegalDocument>>;

    /// Most recently crawled documents.
    async fn find_recent(&self, limit: usize) -> CrawlerResult<Vec<LegalDocument>>;

    /// Case-insensitive full-text lookup.
    async fn search_text(&self, term: &str, limit: usize) -> CrawlerResult<Vec<LegalDocument>>;

    async fn count(&self) -> CrawlerResult<u64>;

    async fn count_by_status(&self, status: DocumentStatus) -> CrawlerResult<u64>;

    async fn count_by_court(&self, court: Court) -> CrawlerResult<u64>;

    /// Failed documents whose last update is older than `older_than`.
    async fn find_failed_for_retry(
        &self,
        older_than: chrono::Duration,
    ) -> CrawlerResult<Vec<LegalDocument>>;

    /// Returns whether the document existed.
    async fn delete(&self, document_id: &str) -> CrawlerResult<bool>;

    async fn delete_all(&self) -> CrawlerResult<()>;

    /// Persist the raw fetched body. The archive backend returns the file
    /// path; index-only backends return `None`.
    async fn write_raw(&self, doc: &LegalDocument, body: &str) -> CrawlerResult<Option<PathBuf>>;

    async fn stats(&self) -> CrawlerResult<StorageStats>;
}

/// Build the configured store (`archive`, `search` or `dual`).
pub fn build_store(config: &Config) -> CrawlerResult<Arc<dyn DocumentStore>> {
    let base = &config.storage.base_path;
    Ok(match config.storage.storage_type {
        StorageType::Archive => Arc::new(ArchiveStore::open(base)?),
        StorageType::Search => Arc::new(SearchStore::open(&base.join("_index"))?),
        StorageType::Dual => {
            let archive = Arc::new(ArchiveStore::open(base)?);
            let search = Arc::new(SearchStore::open(&base.join("_index"))?);
            Arc::new(DualStore::new(archive, search))
        }
    })
}
