use backoff::ExponentialBackoffBuilder;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{CrawlerSettings, ValidationSettings};
use crate::error::{CrawlerError, CrawlerResult};
use crate::extraction::{ContentExtractor, ExtractedContent};
use crate::models::{Court, DocumentStatus, LegalDocument};
use crate::rate_limit::RateLimiter;
use crate::storage::DocumentStore;
use crate::utils::normalize_url;
use crate::validation::{EcliValidator, ValidationPipeline, ValidationReport};

/// Outcome of one download attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadResult {
    pub document: LegalDocument,
    pub xml_content: Option<String>,
    pub file_path: Option<PathBuf>,
    pub validation: Option<ValidationReport>,
    pub success: bool,
    pub error: Option<String>,
    /// Whether the retry sweep may pick the document up again.
    pub retryable: bool,
}

/// Per-document async locks so concurrent triggers for the same id
/// serialize instead of racing the store.
#[derive(Default)]
struct KeyedLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    async fn acquire(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    fn release(&self, key: &str) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lock) = map.get(key) {
            // Only the map itself still holds the lock.
            if Arc::strong_count(lock) == 1 {
                map.remove(key);
            }
        }
    }
}

/// **Document Downloader**
///
/// Fetches one document body, runs validation and extraction, and persists
/// the result: pacing sleep, URL normalization, GET with transient-error
/// retry, validation (gating in strict mode, post-hoc otherwise),
/// best-effort extraction, archive write, then the store upsert. Enriched
/// fields land in the same write as the status flip, so a reader that sees
/// `DOWNLOADED`/`PROCESSED` also sees the extracted metadata. Status moves
/// forward only: a re-crawled record never steps back behind its stored
/// status, except through the explicit `FAILED` path.
pub struct Downloader {
    client: reqwest::Client,
    store: Arc<dyn DocumentStore>,
    pipeline: Arc<ValidationPipeline>,
    extractor: ContentExtractor,
    ecli: EcliValidator,
    rate_limiter: RateLimiter,
    validation: ValidationSettings,
    locks: KeyedLocks,
}

impl Downloader {
    pub fn new(
        crawler: &CrawlerSettings,
        validation: ValidationSettings,
        store: Arc<dyn DocumentStore>,
    ) -> CrawlerResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(crawler.user_agent.clone())
            .timeout(Duration::from_secs(crawler.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            store,
            pipeline: Arc::new(ValidationPipeline::new(validation.clone())),
            extractor: ContentExtractor::new(),
            ecli: EcliValidator::new(),
            rate_limiter: RateLimiter::from_millis(crawler.rate_limit_ms),
            validation,
            locks: KeyedLocks::default(),
        })
    }

    /// Download, validate, extract and persist one document.
    pub async fn download(
        &self,
        doc: LegalDocument,
        cancel: &CancellationToken,
    ) -> DownloadResult {
        let document_id = doc.document_id.clone();
        let guard = self.locks.acquire(&document_id).await;
        let result = self.download_locked(doc, cancel).await;
        drop(guard);
        self.locks.release(&document_id);
        result
    }

    async fn download_locked(
        &self,
        mut doc: LegalDocument,
        cancel: &CancellationToken,
    ) -> DownloadResult {
        self.rate_limiter.acquire().await;
        if cancel.is_cancelled() {
            // Not an error: the attempt simply never started.
            return DownloadResult {
                document: doc,
                xml_content: None,
                file_path: None,
                validation: None,
                success: false,
                error: Some("cancelled".to_string()),
                retryable: true,
            };
        }

        let url = normalize_url(&doc.source_url);
        let body = match self.fetch_document(&url).await {
            Ok(body) => body,
            Err(e) => return self.fail(doc, e).await,
        };
        debug!("Fetched {} ({} bytes)", doc.document_id, body.len());

        // Validation runs off the async worker either way; in async mode the
        // document is persisted as soon as it downloads and the report is
        // wired in post-hoc, in sync mode the report gates the single write.
        let validation_task = {
            let pipeline = self.pipeline.clone();
            let content = body.clone();
            tokio::task::spawn_blocking(move || pipeline.validate(&content))
        };

        let extracted = self.extractor.extract(&body);

        if self.validation.async_validation && !self.validation.strict_mode {
            return self
                .finish_async(doc, body, extracted, validation_task)
                .await;
        }

        let report = match self.await_validation(validation_task).await {
            Ok(report) => report,
            Err(e) => return self.fail(doc, e).await,
        };

        if self.validation.strict_mode && !report.valid {
            doc.set_status(DocumentStatus::Failed);
            if let Err(e) = self.store.upsert(&doc).await {
                warn!("Could not persist failed document {}: {e}", doc.document_id);
            }
            return DownloadResult {
                document: doc,
                xml_content: Some(body),
                file_path: None,
                validation: Some(report),
                success: false,
                error: Some("validation failed in strict mode".to_string()),
                retryable: false,
            };
        }

        self.apply_extraction(&mut doc, extracted, Some(&report));

        // Archive first: the filesystem record is the source of truth and
        // lets a failed index write be repaired by a rescan.
        let file_path = match self.store.write_raw(&doc, &body).await {
            Ok(path) => path,
            Err(e) => return self.fail(doc, e).await,
        };
        doc.file_path = file_path.clone();

        doc.crawled_at = Some(Utc::now());
        let next_status = if report.valid && report.sanitization_passed {
            DocumentStatus::Processed
        } else {
            DocumentStatus::Downloaded
        };
        if next_status == DocumentStatus::Downloaded && doc.status == DocumentStatus::Processed {
            // A force re-crawl whose fresh body no longer passes validation
            // does not demote the record; the report annotates it instead.
            warn!(
                "Re-validation of {} failed; keeping PROCESSED status",
                doc.document_id
            );
        }
        doc.advance_status(next_status);

        if let Err(e) = self.store.upsert(&doc).await {
            return self.fail(doc, e).await;
        }

        DownloadResult {
            document: doc,
            xml_content: Some(body),
            file_path,
            validation: Some(report),
            success: true,
            error: None,
            retryable: false,
        }
    }

    /// Async-validation mode: persist `DOWNLOADED` immediately, then apply
    /// the validation outcome to the stored record once it is in.
    async fn finish_async(
        &self,
        mut doc: LegalDocument,
        body: String,
        extracted: ExtractedContent,
        validation_task: tokio::task::JoinHandle<ValidationReport>,
    ) -> DownloadResult {
        self.apply_extraction(&mut doc, extracted, None);
        let file_path = match self.store.write_raw(&doc, &body).await {
            Ok(path) => path,
            Err(e) => return self.fail(doc, e).await,
        };
        doc.file_path = file_path.clone();
        doc.crawled_at = Some(Utc::now());
        // Forward-only: a force-redownloaded PROCESSED record keeps its
        // status while the fresh report is pending, so a failed or timed-out
        // validation task cannot leave it regressed.
        doc.advance_status(DocumentStatus::Downloaded);
        if let Err(e) = self.store.upsert(&doc).await {
            return self.fail(doc, e).await;
        }

        let validation = match self.await_validation(validation_task).await {
            Ok(report) => {
                if report.valid && report.sanitization_passed {
                    if doc.ecli.is_none() {
                        doc.ecli = report.ecli_identifiers.first().cloned();
                    }
                    doc.advance_status(DocumentStatus::Processed);
                    if let Err(e) = self.store.upsert(&doc).await {
                        warn!(
                            "Could not apply validation result to {}: {e}",
                            doc.document_id
                        );
                    }
                }
                Some(report)
            }
            Err(e) => {
                warn!("Deferred validation of {} failed: {e}", doc.document_id);
                None
            }
        };

        DownloadResult {
            document: doc,
            xml_content: Some(body),
            file_path,
            validation,
            success: true,
            error: None,
            retryable: false,
        }
    }

    /// Await the validation worker, bounded by the configured timeout.
    async fn await_validation(
        &self,
        task: tokio::task::JoinHandle<ValidationReport>,
    ) -> CrawlerResult<ValidationReport> {
        let deadline = Duration::from_secs(self.validation.timeout_seconds.max(1));
        match tokio::time::timeout(deadline, task).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(e)) => Err(CrawlerError::Sanitization(format!(
                "validation task failed: {e}"
            ))),
            Err(_) => Err(CrawlerError::Sanitization(format!(
                "validation timed out after {}s",
                self.validation.timeout_seconds
            ))),
        }
    }

    async fn fail(&self, mut doc: LegalDocument, error: CrawlerError) -> DownloadResult {
        warn!("Download of {} failed: {error}", doc.document_id);
        doc.set_status(DocumentStatus::Failed);
        if let Err(e) = self.store.upsert(&doc).await {
            warn!("Could not persist failed document {}: {e}", doc.document_id);
        }
        let retryable = error.is_retryable();
        DownloadResult {
            document: doc,
            xml_content: None,
            file_path: None,
            validation: None,
            success: false,
            error: Some(error.to_string()),
            retryable,
        }
    }

    /// GET with exponential backoff on transient transport errors.
    async fn fetch_document(&self, url: &str) -> CrawlerResult<String> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(500))
            .with_max_elapsed_time(Some(Duration::from_secs(15)))
            .build();

        backoff::future::retry(policy, || async {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| backoff::Error::transient(CrawlerError::from(e)))?;
            let status = response.status();
            if status.is_server_error() {
                return Err(backoff::Error::transient(CrawlerError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                }));
            }
            if !status.is_success() {
                return Err(backoff::Error::permanent(CrawlerError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                }));
            }
            let bytes = response
                .bytes()
                .await
                .map_err(|e| backoff::Error::transient(CrawlerError::from(e)))?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        })
        .await
    }

    /// Copy extracted fields onto the document; extraction is best-effort,
    /// so only present values overwrite.
    fn apply_extraction(
        &self,
        doc: &mut LegalDocument,
        extracted: ExtractedContent,
        report: Option<&ValidationReport>,
    ) {
        if let Some(court) = extracted
            .court
            .as_deref()
            .filter(|c| *c != "UNKNOWN")
            .and_then(Court::parse)
        {
            doc.court = court;
        }
        if let Some(date) = extracted.decision_date {
            if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
                doc.decision_date = Utc.from_utc_datetime(&midnight);
            }
        }
        if extracted.title.is_some() {
            doc.title = extracted.title;
        }
        if extracted.subject.is_some() {
            doc.subject = extracted.subject;
        }
        if extracted.case_number.is_some() {
            doc.case_number = extracted.case_number;
        }
        if extracted.document_type.is_some() {
            doc.document_type = extracted.document_type;
        }
        if extracted.norms.is_some() {
            doc.norms = extracted.norms;
        }
        if extracted.leitsatz.is_some() {
            doc.leitsatz = extracted.leitsatz;
        }
        if extracted.tenor.is_some() {
            doc.tenor = extracted.tenor;
        }
        if extracted.gruende.is_some() {
            doc.gruende = extracted.gruende;
        }
        if extracted.full_text.is_some() {
            doc.full_text = extracted.full_text;
        }

        // The ECLI comes from the metadata table when present and valid,
        // otherwise from the validation pipeline's extraction.
        let from_table = extracted
            .ecli
            .as_deref()
            .and_then(|raw| self.ecli.validate(raw).ok())
            .map(|v| v.normalized);
        let from_report = report.and_then(|r| r.ecli_identifiers.first().cloned());
        if let Some(ecli) = from_table.or(from_report) {
            doc.ecli = Some(ecli);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keyed_locks_serialize_same_key() {
        let locks = Arc::new(KeyedLocks::default());
        let counter = Arc::new(Mutex::new(0_i32));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let guard = locks.acquire("same").await;
                {
                    let mut value = counter.lock().unwrap();
                    *value += 1;
                    assert_eq!(*value, 1, "two holders inside the same keyed lock");
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                {
                    let mut value = counter.lock().unwrap();
                    *value -= 1;
                }
                drop(guard);
                locks.release("same");
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(locks.inner.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn keyed_locks_do_not_block_distinct_keys() {
        let locks = KeyedLocks::default();
        let _a = locks.acquire("a").await;
        // A different key must be immediately acquirable.
        let acquired = tokio::time::timeout(Duration::from_millis(100), locks.acquire("b")).await;
        assert!(acquired.is_ok());
    }
}
