use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a bulk crawl campaign.
///
/// `Completed`, `Failed` and `Cancelled` are terminal and sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BulkCrawlStatus {
    Initializing,
    Discovering,
    Crawling,
    Paused,
    Resuming,
    Completed,
    Failed,
    Cancelled,
}

impl BulkCrawlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::Discovering => "DISCOVERING",
            Self::Crawling => "CRAWLING",
            Self::Paused => "PAUSED",
            Self::Resuming => "RESUMING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// States in which the coordinator task owns the record.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Initializing | Self::Discovering | Self::Crawling | Self::Resuming
        )
    }
}

/// Per-operation configuration snapshot taken when a campaign starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkCrawlOptions {
    pub rate_limit_ms: u64,
    pub max_concurrent_downloads: usize,
    pub force_update: bool,
}

impl Default for BulkCrawlOptions {
    fn default() -> Self {
        Self {
            rate_limit_ms: 1000,
            max_concurrent_downloads: 1,
            force_update: false,
        }
    }
}

/// Persistent state of a long-running bulk crawl.
///
/// The record is written through the progress store on every phase change,
/// every ten dates, and whenever a pause or cancel request is observed, so
/// that a crash (or an operator pause) can always resume from disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkCrawlProgress {
    pub operation_id: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub status: BulkCrawlStatus,

    // Counters
    pub total_dates_discovered: u64,
    pub dates_processed: u64,
    pub documents_succeeded: u64,
    pub documents_failed: u64,
    pub estimated_total_documents: u64,
    pub processing_rate_docs_per_minute: f64,
    pub estimated_completion_time: Option<DateTime<Utc>>,

    // Timing
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub discovery_time_ms: u64,
    pub download_time_ms: u64,

    // Control latches, set by a controller and observed by the coordinator
    pub pause_requested: bool,
    pub cancel_requested: bool,

    // Config snapshot
    pub rate_limit_ms: u64,
    pub max_concurrent_downloads: usize,
    pub force_update: bool,

    pub current_phase: String,
    pub current_processing_date: Option<NaiveDate>,
    pub retry_count: u32,
    pub error_message: Option<String>,

    /// Dates found by the discovery phase, the campaign's work list.
    pub discovered_dates: Vec<NaiveDate>,
    pub processed_dates: Vec<NaiveDate>,
    pub failed_dates: Vec<NaiveDate>,
}

impl BulkCrawlProgress {
    pub fn new(start_date: NaiveDate, end_date: NaiveDate, options: BulkCrawlOptions) -> Self {
        Self {
            operation_id: Uuid::new_v4().to_string(),
            start_date,
            end_date,
            status: BulkCrawlStatus::Initializing,
            total_dates_discovered: 0,
            dates_processed: 0,
            documents_succeeded: 0,
            documents_failed: 0,
            estimated_total_documents: 0,
            processing_rate_docs_per_minute: 0.0,
            estimated_completion_time: None,
            created_at: Utc::now(),
            started_at: None,
            paused_at: None,
            completed_at: None,
            discovery_time_ms: 0,
            download_time_ms: 0,
            pause_requested: false,
            cancel_requested: false,
            rate_limit_ms: options.rate_limit_ms,
            max_concurrent_downloads: options.max_concurrent_downloads,
            force_update: options.force_update,
            current_phase: "initializing".to_string(),
            current_processing_date: None,
            retry_count: 0,
            error_message: None,
            discovered_dates: Vec::new(),
            processed_dates: Vec::new(),
            failed_dates: Vec::new(),
        }
    }

    /// Record one finished date and keep the counter invariant
    /// `dates_processed == |processed_dates| + |failed_dates|`.
    pub fn record_date(&mut self, date: NaiveDate, succeeded: u64, failed: u64, date_ok: bool) {
        if date_ok {
            self.processed_dates.push(date);
        } else {
            self.failed_dates.push(date);
        }
        self.documents_succeeded += succeeded;
        self.documents_failed += failed;
        self.dates_processed = (self.processed_dates.len() + self.failed_dates.len()) as u64;
    }

    /// Dates discovered but not yet processed or failed, in ascending order.
    pub fn remaining_dates(&self) -> Vec<NaiveDate> {
        let mut remaining: Vec<NaiveDate> = self
            .discovered_dates
            .iter()
            .filter(|d| !self.processed_dates.contains(d) && !self.failed_dates.contains(d))
            .copied()
            .collect();
        remaining.sort();
        remaining
    }

    /// Recompute throughput and the completion estimate from wall time.
    pub fn update_rate(&mut self, now: DateTime<Utc>) {
        let Some(started) = self.started_at else {
            return;
        };
        let minutes = (now - started).num_milliseconds() as f64 / 60_000.0;
        let processed = self.documents_succeeded + self.documents_failed;
        if minutes > 0.0 {
            self.processing_rate_docs_per_minute = processed as f64 / minutes;
        }
        // Project total volume from the per-date average seen so far.
        if self.dates_processed > 0 {
            self.estimated_total_documents =
                processed * self.total_dates_discovered / self.dates_processed.max(1);
        }
        if self.estimated_total_documents > processed && self.processing_rate_docs_per_minute > 0.0
        {
            let remaining = (self.estimated_total_documents - processed) as f64;
            let minutes_left = remaining / self.processing_rate_docs_per_minute;
            self.estimated_completion_time =
                Some(now + chrono::Duration::milliseconds((minutes_left * 60_000.0) as i64));
        }
    }

    /// Whether a failed campaign may still be retried by an operator.
    pub fn is_retry_eligible(&self) -> bool {
        self.status == BulkCrawlStatus::Failed && self.retry_count < 3
    }
}
