use chrono::NaiveDate;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CrawlerError, CrawlerResult};
use crate::models::{CrawlReport, DocumentStatus, LegalDocument};
use crate::services::downloader::Downloader;
use crate::sitemaps::SitemapFetcher;
use crate::storage::DocumentStore;

/// **Per-Date Crawl Orchestrator**
///
/// Drives one date end to end: the daily index, its leaf sitemaps, and every
/// document entry. Entries already stored as `DOWNLOADED`/`PROCESSED` are
/// skipped unless `force_update` is set; everything else is created as
/// `PENDING` (court derived from the id prefix) and handed to the
/// downloader. Per-document errors collapse into the per-date tally.
pub struct CrawlOrchestrator {
    fetcher: SitemapFetcher,
    downloader: Arc<Downloader>,
    store: Arc<dyn DocumentStore>,
}

impl CrawlOrchestrator {
    pub fn new(
        fetcher: SitemapFetcher,
        downloader: Arc<Downloader>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            fetcher,
            downloader,
            store,
        }
    }

    /// Crawl one date; returns the per-date tallies.
    pub async fn crawl_date(
        &self,
        date: NaiveDate,
        force_update: bool,
        cancel: &CancellationToken,
    ) -> CrawlerResult<CrawlReport> {
        info!("Crawling {date} (force_update: {force_update})");
        let mut report = CrawlReport::for_date(date);

        let leaves = self.fetcher.fetch_index(date, cancel).await?;
        for leaf_url in leaves {
            let entries = match self.fetcher.fetch_leaf(&leaf_url, cancel).await {
                Ok(entries) => entries,
                Err(CrawlerError::Cancelled) => return Err(CrawlerError::Cancelled),
                Err(e) => {
                    warn!("Leaf sitemap {leaf_url} failed: {e}");
                    report.errors.push(format!("{leaf_url}: {e}"));
                    continue;
                }
            };

            for entry in entries {
                if cancel.is_cancelled() {
                    return Err(CrawlerError::Cancelled);
                }

                let existing = self.store.find_by_document_id(&entry.document_id).await?;
                let is_new = existing.is_none();

                if let Some(doc) = &existing {
                    if doc.is_complete() && !force_update {
                        debug!("Skipping {} ({})", doc.document_id, doc.status.as_str());
                        report.skipped_documents += 1;
                        continue;
                    }
                }

                let doc = match existing {
                    Some(mut doc) => {
                        // The portal occasionally rewrites document URLs.
                        doc.source_url = entry.url.clone();
                        // A failed record re-enters the pipeline through
                        // PENDING, the same reset the retry sweep uses.
                        // Completed records keep their status; the
                        // downloader only moves them forward.
                        if doc.status == DocumentStatus::Failed {
                            doc.set_status(DocumentStatus::Pending);
                            self.store.upsert(&doc).await?;
                        }
                        doc
                    }
                    None => {
                        let doc =
                            LegalDocument::new(entry.document_id.clone(), entry.url.clone());
                        self.store.upsert(&doc).await?;
                        doc
                    }
                };

                let result = self.downloader.download(doc, cancel).await;
                if result.success {
                    if is_new {
                        report.new_documents += 1;
                    } else {
                        report.updated_documents += 1;
                    }
                } else if cancel.is_cancelled() {
                    return Err(CrawlerError::Cancelled);
                } else {
                    report.failed_documents += 1;
                    if let Some(error) = result.error {
                        report
                            .errors
                            .push(format!("{}: {error}", result.document.document_id));
                    }
                }
            }
        }

        info!(
            "Crawl for {date} done: {} new, {} updated, {} failed, {} skipped",
            report.new_documents,
            report.updated_documents,
            report.failed_documents,
            report.skipped_documents
        );
        Ok(report)
    }

    /// Sweep `FAILED` documents older than `older_than` back through the
    /// downloader. Returns how many succeeded.
    pub async fn retry_failed(
        &self,
        older_than: chrono::Duration,
        cancel: &CancellationToken,
    ) -> CrawlerResult<u64> {
        let due = self.store.find_failed_for_retry(older_than).await?;
        info!("Retry sweep: {} failed document(s) due", due.len());

        let mut succeeded = 0;
        for mut doc in due {
            if cancel.is_cancelled() {
                return Err(CrawlerError::Cancelled);
            }
            // The one legal backwards transition: manual retry.
            doc.set_status(DocumentStatus::Pending);
            self.store.upsert(&doc).await?;

            if self.downloader.download(doc, cancel).await.success {
                succeeded += 1;
            }
        }
        info!("Retry sweep finished: {succeeded} recovered");
        Ok(succeeded)
    }
}
