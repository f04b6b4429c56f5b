use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::CrawlerResult;
use crate::models::{Court, DocumentStatus, LegalDocument};
use crate::storage::{ArchiveStore, DocumentStore, SearchStore, StorageStats};

/// **Dual Store**
///
/// Composes the filesystem archive and the search index. The archive write
/// always precedes the index write: if indexing fails, the filesystem record
/// remains the source of truth and can be reindexed from a rescan
/// (`SearchStore::reindex_from`). Queries are answered by the search side.
pub struct DualStore {
    archive: Arc<ArchiveStore>,
    search: Arc<SearchStore>,
}

impl DualStore {
    pub fn new(archive: Arc<ArchiveStore>, search: Arc<SearchStore>) -> Self {
        Self { archive, search }
    }

    pub fn archive(&self) -> &ArchiveStore {
        &self.archive
    }

    pub fn search(&self) -> &SearchStore {
        &self.search
    }
}

#[async_trait]
impl DocumentStore for DualStore {
    async fn upsert(&self, doc: &LegalDocument) -> CrawlerResult<()> {
        self.archive.upsert(doc).await?;
        self.search.upsert(doc).await
    }

    async fn find_by_document_id(
        &self,
        document_id: &str,
    ) -> CrawlerResult<Option<LegalDocument>> {
        self.search.find_by_document_id(document_id).await
    }

    async fn exists_by_source_url(&self, url: &str) -> CrawlerResult<bool> {
        self.search.exists_by_source_url(url).await
    }

    async fn find_by_court(
        &self,
        court: Court,
        limit: usize,
        offset: usize,
    ) -> CrawlerResult<Vec<LegalDocument>> {
        self.search.find_by_court(court, limit, offset).await
    }

    async fn find_by_status(&self, status: DocumentStatus) -> CrawlerResult<Vec<LegalDocument>> {
        self.search.find_by_status(status).await
    }

    async fn find_by_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CrawlerResult<Vec<LegalDocument>> {
        self.search.find_by_date_range(start, end).await
    }

    async fn find_by_ecli(&self, ecli: &str) -> CrawlerResult<Option<LegalDocument>> {
        self.search.find_by_ecli(ecli).await
    }

    async fn find_by_crawled_after(
        &self,
        after: DateTime<Utc>,
    ) -> CrawlerResult<Vec<LegalDocument>> {
        self.search.find_by_crawled_after(after).await
    }

    async fn find_recent(&self, limit: usize) -> CrawlerResult<Vec<LegalDocument>> {
        self.search.find_recent(limit).await
    }

    async fn search_text(&self, term: &str, limit: usize) -> CrawlerResult<Vec<LegalDocument>> {
        self.search.search_text(term, limit).await
    }

    async fn count(&self) -> CrawlerResult<u64> {
        self.search.count().await
    }

    async fn count_by_status(&self, status: DocumentStatus) -> CrawlerResult<u64> {
        self.search.count_by_status(status).await
    }

    async fn count_by_court(&self, court: Court) -> CrawlerResult<u64> {
        self.search.count_by_court(court).await
    }

    async fn find_failed_for_retry(
        &self,
        older_than: chrono::Duration,
    ) -> CrawlerResult<Vec<LegalDocument>> {
        self.search.find_failed_for_retry(older_than).await
    }

    async fn delete(&self, document_id: &str) -> CrawlerResult<bool> {
        // Index entry goes first so a partial failure leaves the archive
        // copy available for reindexing.
        let in_index = self.search.delete(document_id).await?;
        let in_archive = self.archive.delete(document_id).await?;
        Ok(in_index || in_archive)
    }

    async fn delete_all(&self) -> CrawlerResult<()> {
        self.search.delete_all().await?;
        self.archive.delete_all().await
    }

    async fn write_raw(&self, doc: &LegalDocument, body: &str) -> CrawlerResult<Option<PathBuf>> {
        self.archive.write_raw(doc, body).await
    }

    async fn stats(&self) -> CrawlerResult<StorageStats> {
        self.search.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_reaches_both_backends() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Arc::new(ArchiveStore::open(dir.path()).unwrap());
        let search = Arc::new(SearchStore::open(&dir.path().join("_index")).unwrap());
        let store = DualStore::new(archive.clone(), search.clone());

        let doc = LegalDocument::new(
            "KARE500041892".to_string(),
            "https://portal.example/doc?docid=KARE500041892".to_string(),
        );
        store.upsert(&doc).await.unwrap();

        assert!(archive
            .find_by_document_id("KARE500041892")
            .await
            .unwrap()
            .is_some());
        assert!(search
            .find_by_document_id("KARE500041892")
            .await
            .unwrap()
            .is_some());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reindex_restores_search_from_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Arc::new(ArchiveStore::open(dir.path()).unwrap());
        let search = Arc::new(SearchStore::open(&dir.path().join("_index")).unwrap());

        let mut doc = LegalDocument::new(
            "KORE1".to_string(),
            "https://portal.example/doc?docid=KORE1".to_string(),
        );
        doc.full_text = Some("Versicherungsrecht".to_string());
        archive.upsert(&doc).await.unwrap();

        assert_eq!(search.count().await.unwrap(), 0);
        let reindexed = search.reindex_from(&archive).await.unwrap();
        assert_eq!(reindexed, 1);
        assert_eq!(search.count().await.unwrap(), 1);
    }
}
