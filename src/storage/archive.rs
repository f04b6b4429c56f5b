use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{CrawlerError, CrawlerResult};
use crate::models::{Court, DocumentStatus, LegalDocument};
use crate::storage::{DocumentStore, StorageStats};

/// Directory under the archive root reserved for campaign state.
const PROGRESS_DIR: &str = "_progress";
/// Directory under the archive root reserved for the search index.
const INDEX_DIR: &str = "_index";

/// **Filesystem Archive Store**
///
/// Lays documents out as `<base>/<court-lower>/<YYYY>/<MM>/<documentId>.xml`
/// with a JSON metadata sidecar next to each body. Writes truncate, directory
/// creation is idempotent, and an in-memory id index (hydrated by a full
/// rescan at startup) backs the read side so queries survive restarts.
pub struct ArchiveStore {
    base_path: PathBuf,
    index: RwLock<HashMap<String, LegalDocument>>,
}

impl ArchiveStore {
    /// Open the archive at `base_path`, scanning existing sidecars.
    pub fn open(base_path: &Path) -> CrawlerResult<Self> {
        std::fs::create_dir_all(base_path)?;
        let index = hydrate(base_path)?;
        debug!(
            "Archive at {} opened with {} document(s)",
            base_path.display(),
            index.len()
        );
        Ok(Self {
            base_path: base_path.to_path_buf(),
            index: RwLock::new(index),
        })
    }

    /// Deterministic archive location for a document:
    /// court (lower-cased), zero-padded year and month, id.
    pub fn archive_path(&self, doc: &LegalDocument) -> PathBuf {
        self.base_path
            .join(doc.court.dir_name())
            .join(format!("{:04}", doc.decision_date.year()))
            .join(format!("{:02}", doc.decision_date.month()))
            .join(format!("{}.xml", doc.document_id))
    }

    fn sidecar_path(&self, doc: &LegalDocument) -> PathBuf {
        self.archive_path(doc).with_extension("json")
    }

    /// Every stored document; used for search reindexing.
    pub async fn all(&self) -> Vec<LegalDocument> {
        self.index.read().await.values().cloned().collect()
    }

    async fn remove_files(&self, doc: &LegalDocument) {
        for path in [self.archive_path(doc), self.sidecar_path(doc)] {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Could not remove {}: {e}", path.display());
                }
            }
        }
    }
}

/// Scan the tree for metadata sidecars, skipping the reserved directories.
fn hydrate(base_path: &Path) -> CrawlerResult<HashMap<String, LegalDocument>> {
    let mut index = HashMap::new();
    let reserved = [base_path.join(PROGRESS_DIR), base_path.join(INDEX_DIR)];
    for entry in WalkDir::new(base_path)
        .into_iter()
        .filter_entry(|e| !reserved.iter().any(|r| e.path() == r))
        .filter_map(|e| e.ok())
    {
        if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match std::fs::read_to_string(entry.path())
            .map_err(CrawlerError::from)
            .and_then(|text| serde_json::from_str::<LegalDocument>(&text).map_err(Into::into))
        {
            Ok(doc) => {
                index.insert(doc.document_id.clone(), doc);
            }
            Err(e) => warn!("Skipping unreadable sidecar {}: {e}", entry.path().display()),
        }
    }
    Ok(index)
}

#[async_trait]
impl DocumentStore for ArchiveStore {
    async fn upsert(&self, doc: &LegalDocument) -> CrawlerResult<()> {
        let mut index = self.index.write().await;

        // Court or decision date refinement moves the archive location;
        // the stale files must not linger under the old path.
        if let Some(previous) = index.get(&doc.document_id) {
            if self.archive_path(previous) != self.archive_path(doc) {
                self.remove_files(previous).await;
            }
        }

        let sidecar = self.sidecar_path(doc);
        if let Some(parent) = sidecar.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(doc)?;
        tokio::fs::write(&sidecar, json).await?;

        index.insert(doc.document_id.clone(), doc.clone());
        Ok(())
    }

    async fn find_by_document_id(
        &self,
        document_id: &str,
    ) -> CrawlerResult<Option<LegalDocument>> {
        Ok(self.index.read().await.get(document_id).cloned())
    }

    async fn exists_by_source_url(&self, url: &str) -> CrawlerResult<bool> {
        Ok(self
            .index
            .read()
            .await
            .values()
            .any(|doc| doc.source_url == url))
    }

    async fn find_by_court(
        &self,
        court: Court,
        limit: usize,
        offset: usize,
    ) -> CrawlerResult<Vec<LegalDocument>> {
        let index = self.index.read().await;
        let mut docs: Vec<LegalDocument> = index
            .values()
            .filter(|doc| doc.court == court)
            .cloned()
            .collect();
        docs.sort_by(|a, b| b.decision_date.cmp(&a.decision_date));
        Ok(docs.into_iter().skip(offset).take(limit).collect())
    }

    async fn find_by_status(&self, status: DocumentStatus) -> CrawlerResult<Vec<LegalDocument>> {
        Ok(self
            .index
            .read()
            .await
            .values()
            .filter(|doc| doc.status == status)
            .cloned()
            .collect())
    }

    async fn find_by_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CrawlerResult<Vec<LegalDocument>> {
        let index = self.index.read().await;
        let mut docs: Vec<LegalDocument> = index
            .values()
            .filter(|doc| doc.decision_date >= start && doc.decision_date <= end)
            .cloned()
            .collect();
        docs.sort_by_key(|doc| doc.decision_date);
        Ok(docs)
    }

    async fn find_by_ecli(&self, ecli: &str) -> CrawlerResult<Option<LegalDocument>> {
        Ok(self
            .index
            .read()
            .await
            .values()
            .find(|doc| doc.ecli.as_deref() == Some(ecli))
            .cloned())
    }

    async fn find_by_crawled_after(
        &self,
        after: DateTime<Utc>,
    ) -> CrawlerResult<Vec<LegalDocument>> {
        Ok(self
            .index
            .read()
            .await
            .values()
            .filter(|doc| doc.crawled_at.map(|t| t > after).unwrap_or(false))
            .cloned()
            .collect())
    }

    async fn find_recent(&self, limit: usize) -> CrawlerResult<Vec<LegalDocument>> {
        let index = self.index.read().await;
        let mut docs: Vec<LegalDocument> = index
            .values()
            .filter(|doc| doc.crawled_at.is_some())
            .cloned()
            .collect();
        docs.sort_by(|a, b| b.crawled_at.cmp(&a.crawled_at));
        docs.truncate(limit);
        Ok(docs)
    }

    async fn search_text(&self, term: &str, limit: usize) -> CrawlerResult<Vec<LegalDocument>> {
        let needle = term.to_lowercase();
        let index = self.index.read().await;
        let mut docs: Vec<LegalDocument> = index
            .values()
            .filter(|doc| {
                [
                    doc.title.as_deref(),
                    doc.subject.as_deref(),
                    doc.summary.as_deref(),
                    doc.leitsatz.as_deref(),
                    doc.tenor.as_deref(),
                    doc.gruende.as_deref(),
                    doc.full_text.as_deref(),
                ]
                .iter()
                .flatten()
                .any(|text| text.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect();
        docs.truncate(limit);
        Ok(docs)
    }

    async fn count(&self) -> CrawlerResult<u64> {
        Ok(self.index.read().await.len() as u64)
    }

    async fn count_by_status(&self, status: DocumentStatus) -> CrawlerResult<u64> {
        Ok(self
            .index
            .read()
            .await
            .values()
            .filter(|doc| doc.status == status)
            .count() as u64)
    }

    async fn count_by_court(&self, court: Court) -> CrawlerResult<u64> {
        Ok(self
            .index
            .read()
            .await
            .values()
            .filter(|doc| doc.court == court)
            .count() as u64)
    }

    async fn find_failed_for_retry(
        &self,
        older_than: chrono::Duration,
    ) -> CrawlerResult<Vec<LegalDocument>> {
        let cutoff = Utc::now() - older_than;
        Ok(self
            .index
            .read()
            .await
            .values()
            .filter(|doc| doc.status == DocumentStatus::Failed && doc.updated_at < cutoff)
            .cloned()
            .collect())
    }

    async fn delete(&self, document_id: &str) -> CrawlerResult<bool> {
        let mut index = self.index.write().await;
        match index.remove(document_id) {
            Some(doc) => {
                self.remove_files(&doc).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_all(&self) -> CrawlerResult<()> {
        let mut index = self.index.write().await;
        for doc in index.values() {
            self.remove_files(doc).await;
        }
        index.clear();
        Ok(())
    }

    async fn write_raw(&self, doc: &LegalDocument, body: &str) -> CrawlerResult<Option<PathBuf>> {
        let path = self.archive_path(doc);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, body.as_bytes()).await?;
        Ok(Some(path))
    }

    async fn stats(&self) -> CrawlerResult<StorageStats> {
        let index = self.index.read().await;
        let mut stats = StorageStats {
            total_documents: index.len() as u64,
            ..Default::default()
        };
        for doc in index.values() {
            *stats
                .by_status
                .entry(doc.status.as_str().to_string())
                .or_insert(0) += 1;
            *stats
                .by_court
                .entry(doc.court.as_str().to_string())
                .or_insert(0) += 1;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn doc(id: &str, court: Court) -> LegalDocument {
        let mut doc = LegalDocument::new(
            id.to_string(),
            format!("https://portal.example/doc?docid={id}"),
        );
        doc.court = court;
        doc.decision_date = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
        doc
    }

    #[tokio::test]
    async fn archive_path_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArchiveStore::open(dir.path()).unwrap();
        let document = doc("KARE500041892", Court::Bag);

        let first = store.archive_path(&document);
        let second = store.archive_path(&document);
        assert_eq!(first, second);
        assert!(first.ends_with("bag/2024/05/KARE500041892.xml"));
    }

    #[tokio::test]
    async fn upsert_is_idempotent_by_document_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArchiveStore::open(dir.path()).unwrap();
        let mut document = doc("KORE1", Court::Bgh);

        store.upsert(&document).await.unwrap();
        document.title = Some("refined".to_string());
        store.upsert(&document).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let found = store.find_by_document_id("KORE1").await.unwrap().unwrap();
        assert_eq!(found.title.as_deref(), Some("refined"));
    }

    #[tokio::test]
    async fn refinement_moves_archive_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArchiveStore::open(dir.path()).unwrap();
        let mut document = doc("WBRE1", Court::Unknown);

        store.upsert(&document).await.unwrap();
        store.write_raw(&document, "<d/>").await.unwrap();
        let old_path = store.archive_path(&document);
        assert!(old_path.exists());

        document.court = Court::Bverwg;
        store.upsert(&document).await.unwrap();
        store.write_raw(&document, "<d/>").await.unwrap();

        assert!(!old_path.exists());
        assert!(store.archive_path(&document).exists());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ArchiveStore::open(dir.path()).unwrap();
            store.upsert(&doc("KSRE9", Court::Bsg)).await.unwrap();
        }
        let reopened = ArchiveStore::open(dir.path()).unwrap();
        let found = reopened.find_by_document_id("KSRE9").await.unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().court, Court::Bsg);
    }

    #[tokio::test]
    async fn unknown_id_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArchiveStore::open(dir.path()).unwrap();
        assert!(store.find_by_document_id("nope").await.unwrap().is_none());
        assert!(!store.delete("nope").await.unwrap());
    }

    #[tokio::test]
    async fn queries_filter_and_page() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArchiveStore::open(dir.path()).unwrap();
        for (id, court) in [
            ("KARE1", Court::Bag),
            ("KARE2", Court::Bag),
            ("KORE1", Court::Bgh),
        ] {
            let mut document = doc(id, court);
            document.full_text = Some(format!("Revision des Beklagten {id}"));
            document.set_status(DocumentStatus::Processed);
            document.crawled_at = Some(Utc::now());
            store.upsert(&document).await.unwrap();
        }

        assert_eq!(store.count_by_court(Court::Bag).await.unwrap(), 2);
        assert_eq!(
            store.find_by_court(Court::Bag, 1, 1).await.unwrap().len(),
            1
        );
        assert_eq!(
            store
                .count_by_status(DocumentStatus::Processed)
                .await
                .unwrap(),
            3
        );
        let hits = store.search_text("revision", 10).await.unwrap();
        assert_eq!(hits.len(), 3);
        let hits = store.search_text("KORE1", 10).await.unwrap();
        assert_eq!(hits.len(), 1);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_documents, 3);
        assert_eq!(stats.by_court.get("BAG"), Some(&2));
    }

    #[tokio::test]
    async fn failed_for_retry_honors_age() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArchiveStore::open(dir.path()).unwrap();

        let mut stale = doc("KARE_OLD", Court::Bag);
        stale.status = DocumentStatus::Failed;
        stale.updated_at = Utc::now() - chrono::Duration::hours(2);
        store.upsert(&stale).await.unwrap();

        let mut fresh = doc("KARE_NEW", Court::Bag);
        fresh.set_status(DocumentStatus::Failed);
        store.upsert(&fresh).await.unwrap();

        let due = store
            .find_failed_for_retry(chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].document_id, "KARE_OLD");
    }
}
