use chrono::{NaiveDate, Utc};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::BulkSettings;
use crate::error::{CrawlerError, CrawlerResult};
use crate::models::{BulkCrawlOptions, BulkCrawlProgress, BulkCrawlStatus};
use crate::services::orchestrator::CrawlOrchestrator;
use crate::sitemaps::SitemapDiscovery;
use crate::storage::ProgressStore;

/// Persist at least every this many dates, besides the time-based interval.
const DATES_PER_PERSIST: u32 = 10;

/// The feed's first possible date, used when a full-range campaign starts
/// before discovery has found the real bounds.
const FEED_EPOCH: (i32, u32, u32) = (2020, 1, 1);

#[derive(Debug, PartialEq, Eq)]
enum Checkpoint {
    Continue,
    Stop,
}

/// Everything a campaign task needs, detached from the coordinator so the
/// task owns its clones.
struct CampaignRuntime {
    orchestrator: Arc<CrawlOrchestrator>,
    discovery: Arc<SitemapDiscovery>,
    progress_store: Arc<dyn ProgressStore>,
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
    pause_flags: Arc<Mutex<HashSet<String>>>,
    progress_interval: Duration,
    full_range: bool,
}

impl CampaignRuntime {
    /// Persist the campaign's copy without clobbering latches a controller
    /// may have written to the record in the meantime. Latches only ever
    /// move from false to true while a task runs, so an OR-merge is exact.
    async fn persist(&self, progress: &mut BulkCrawlProgress) -> CrawlerResult<()> {
        if let Some(stored) = self.progress_store.find(&progress.operation_id).await? {
            progress.pause_requested |= stored.pause_requested;
            progress.cancel_requested |= stored.cancel_requested;
        }
        self.progress_store.save(progress).await
    }

    fn pause_flag_set(&self, operation_id: &str) -> bool {
        self.pause_flags
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(operation_id)
    }

    fn clear_pause_flag(&self, operation_id: &str) {
        self.pause_flags
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(operation_id);
    }
}

/// **Bulk Crawl Coordinator**
///
/// Runs long-lived campaigns over date ranges: discovery, then the dates in
/// lanes of `max_concurrent_downloads` (one by default), with persistent
/// progress and cooperative pause/resume/cancel. Each
/// campaign runs on its own task and is the only writer of its progress
/// record; controllers communicate through the persisted
/// `pause_requested`/`cancel_requested` latches, observed before each date
/// and between dates. A paused campaign's task exits; `resume` starts a
/// fresh task over the remaining dates.
pub struct BulkCoordinator {
    orchestrator: Arc<CrawlOrchestrator>,
    discovery: Arc<SitemapDiscovery>,
    progress_store: Arc<dyn ProgressStore>,
    settings: BulkSettings,
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
    /// In-process mirror of `pause_requested`, immune to the
    /// read-modify-write window of whole-record persistence.
    pause_flags: Arc<Mutex<HashSet<String>>>,
}

impl BulkCoordinator {
    pub fn new(
        orchestrator: Arc<CrawlOrchestrator>,
        discovery: Arc<SitemapDiscovery>,
        progress_store: Arc<dyn ProgressStore>,
        settings: BulkSettings,
    ) -> Self {
        Self {
            orchestrator,
            discovery,
            progress_store,
            settings,
            active: Arc::new(Mutex::new(HashMap::new())),
            pause_flags: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn default_options(&self) -> BulkCrawlOptions {
        BulkCrawlOptions {
            rate_limit_ms: self.settings.default_rate_limit_ms,
            max_concurrent_downloads: self.settings.default_max_concurrent_downloads,
            force_update: false,
        }
    }

    /// Start a campaign over `[start, end]`. Returns the operation id.
    pub async fn start_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        options: Option<BulkCrawlOptions>,
    ) -> CrawlerResult<String> {
        if start > end {
            return Err(CrawlerError::Configuration(format!(
                "campaign start {start} is after end {end}"
            )));
        }
        let progress =
            BulkCrawlProgress::new(start, end, options.unwrap_or_else(|| self.default_options()));
        self.progress_store.save(&progress).await?;
        self.spawn(progress, false)
    }

    /// Start a campaign over the portal's full published history.
    pub async fn start_full(&self, options: Option<BulkCrawlOptions>) -> CrawlerResult<String> {
        let epoch = NaiveDate::from_ymd_opt(FEED_EPOCH.0, FEED_EPOCH.1, FEED_EPOCH.2)
            .ok_or_else(|| CrawlerError::Configuration("invalid feed epoch".to_string()))?;
        let yesterday = Utc::now().date_naive() - chrono::Duration::days(1);
        let progress = BulkCrawlProgress::new(
            epoch,
            yesterday,
            options.unwrap_or_else(|| self.default_options()),
        );
        self.progress_store.save(&progress).await?;
        self.spawn(progress, true)
    }

    /// Request a pause; the campaign parks at the next inter-date boundary.
    pub async fn pause(&self, operation_id: &str) -> CrawlerResult<()> {
        let mut progress = self.load(operation_id).await?;
        if !progress.status.is_active() {
            return Err(CrawlerError::InvalidState(format!(
                "cannot pause campaign in state {}",
                progress.status.as_str()
            )));
        }
        progress.pause_requested = true;
        self.pause_flags
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(operation_id.to_string());
        self.progress_store.save(&progress).await?;
        info!("Pause requested for campaign {operation_id}");
        Ok(())
    }

    /// Resume a paused campaign over exactly the dates it has not covered.
    pub async fn resume(&self, operation_id: &str) -> CrawlerResult<()> {
        let mut progress = self.load(operation_id).await?;
        if progress.status != BulkCrawlStatus::Paused {
            return Err(CrawlerError::InvalidState(format!(
                "cannot resume campaign in state {}",
                progress.status.as_str()
            )));
        }
        progress.pause_requested = false;
        progress.status = BulkCrawlStatus::Resuming;
        progress.current_phase = "resuming".to_string();
        self.pause_flags
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(operation_id);
        self.progress_store.save(&progress).await?;
        self.spawn(progress, false)?;
        info!("Campaign {operation_id} resuming");
        Ok(())
    }

    /// Request cancellation. A paused campaign finalizes immediately; a
    /// running one stops at its next checkpoint.
    pub async fn cancel(&self, operation_id: &str) -> CrawlerResult<()> {
        let mut progress = self.load(operation_id).await?;
        if progress.status.is_terminal() {
            return Err(CrawlerError::InvalidState(format!(
                "campaign already {}",
                progress.status.as_str()
            )));
        }
        progress.cancel_requested = true;
        if progress.status == BulkCrawlStatus::Paused {
            progress.status = BulkCrawlStatus::Cancelled;
            progress.current_phase = "cancelled".to_string();
            progress.completed_at = Some(Utc::now());
            self.progress_store.save(&progress).await?;
        } else {
            self.progress_store.save(&progress).await?;
            if let Some(token) = self
                .active
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(operation_id)
            {
                token.cancel();
            }
        }
        info!("Cancel requested for campaign {operation_id}");
        Ok(())
    }

    pub async fn get(&self, operation_id: &str) -> CrawlerResult<BulkCrawlProgress> {
        self.load(operation_id).await
    }

    /// All campaigns that have not reached a terminal state.
    pub async fn list_active(&self) -> CrawlerResult<Vec<BulkCrawlProgress>> {
        Ok(self
            .progress_store
            .list()
            .await?
            .into_iter()
            .filter(|p| !p.status.is_terminal())
            .collect())
    }

    /// Delete completed/cancelled campaigns older than `days`.
    pub async fn cleanup_old(&self, days: i64) -> CrawlerResult<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let mut removed = 0;
        for progress in self.progress_store.list().await? {
            let eligible = matches!(
                progress.status,
                BulkCrawlStatus::Completed | BulkCrawlStatus::Cancelled
            ) && progress.completed_at.map(|t| t < cutoff).unwrap_or(false);
            if eligible && self.progress_store.delete(&progress.operation_id).await? {
                removed += 1;
            }
        }
        info!("Cleanup removed {removed} old campaign(s)");
        Ok(removed)
    }

    /// Force campaigns stuck in `DISCOVERING`/`CRAWLING` for longer than
    /// `hours` into `FAILED`.
    pub async fn reap_stuck(&self, hours: i64) -> CrawlerResult<u64> {
        let cutoff = Utc::now() - chrono::Duration::hours(hours);
        let mut reaped = 0;
        for mut progress in self.progress_store.list().await? {
            let stuck = matches!(
                progress.status,
                BulkCrawlStatus::Discovering | BulkCrawlStatus::Crawling
            ) && progress.started_at.map(|t| t < cutoff).unwrap_or(false);
            if !stuck {
                continue;
            }
            warn!(
                "Reaping stuck campaign {} (started {:?})",
                progress.operation_id, progress.started_at
            );
            if let Some(token) = self
                .active
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&progress.operation_id)
            {
                token.cancel();
            }
            progress.status = BulkCrawlStatus::Failed;
            progress.error_message = Some(format!("stuck: active for more than {hours} hour(s)"));
            progress.completed_at = Some(Utc::now());
            progress.current_phase = "failed".to_string();
            progress.retry_count += 1;
            self.progress_store.save(&progress).await?;
            reaped += 1;
        }
        Ok(reaped)
    }

    /// Park campaigns that were running when the process died so an
    /// operator can resume them.
    pub async fn recover_on_startup(&self) -> CrawlerResult<u64> {
        let mut recovered = 0;
        let running: HashSet<String> = {
            let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.keys().cloned().collect()
        };
        let orphaned: Vec<BulkCrawlProgress> = self
            .progress_store
            .list()
            .await?
            .into_iter()
            .filter(|p| p.status.is_active() && !running.contains(&p.operation_id))
            .collect();

        for mut progress in orphaned {
            info!(
                "Campaign {} was {} at shutdown; parking as PAUSED for operator resume",
                progress.operation_id,
                progress.status.as_str()
            );
            progress.status = BulkCrawlStatus::Paused;
            progress.paused_at = Some(Utc::now());
            progress.current_phase = "paused".to_string();
            self.progress_store.save(&progress).await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// How many campaign tasks are currently running.
    pub fn running_operations(&self) -> usize {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn load(&self, operation_id: &str) -> CrawlerResult<BulkCrawlProgress> {
        self.progress_store
            .find(operation_id)
            .await?
            .ok_or_else(|| CrawlerError::OperationNotFound(operation_id.to_string()))
    }

    fn spawn(&self, progress: BulkCrawlProgress, full_range: bool) -> CrawlerResult<String> {
        let operation_id = progress.operation_id.clone();
        let token = CancellationToken::new();
        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if active.len() >= self.settings.max_concurrent_operations {
                return Err(CrawlerError::TooManyOperations(
                    self.settings.max_concurrent_operations,
                ));
            }
            active.insert(operation_id.clone(), token.clone());
        }

        let runtime = CampaignRuntime {
            orchestrator: self.orchestrator.clone(),
            discovery: self.discovery.clone(),
            progress_store: self.progress_store.clone(),
            active: self.active.clone(),
            pause_flags: self.pause_flags.clone(),
            progress_interval: Duration::from_millis(self.settings.progress_update_interval_ms),
            full_range,
        };
        tokio::spawn(run_campaign(runtime, progress, token));
        Ok(operation_id)
    }
}

async fn run_campaign(
    runtime: CampaignRuntime,
    mut progress: BulkCrawlProgress,
    token: CancellationToken,
) {
    let operation_id = progress.operation_id.clone();
    if let Err(e) = drive(&runtime, &mut progress, &token).await {
        error!("Campaign {operation_id} failed: {e}");
        progress.status = BulkCrawlStatus::Failed;
        progress.error_message = Some(e.to_string());
        progress.completed_at = Some(Utc::now());
        progress.current_phase = "failed".to_string();
        progress.retry_count += 1;
        if let Err(save_err) = runtime.progress_store.save(&progress).await {
            error!("Could not persist failure of campaign {operation_id}: {save_err}");
        }
    }
    runtime
        .active
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&operation_id);
    runtime.clear_pause_flag(&operation_id);
}

/// The campaign state machine. Cancellation and pause are terminal for this
/// task (resume spawns a new one); only genuinely fatal errors bubble up.
async fn drive(
    runtime: &CampaignRuntime,
    progress: &mut BulkCrawlProgress,
    token: &CancellationToken,
) -> CrawlerResult<()> {
    if progress.started_at.is_none() {
        progress.started_at = Some(Utc::now());
    }

    if progress.discovered_dates.is_empty() {
        progress.status = BulkCrawlStatus::Discovering;
        progress.current_phase = "discovering".to_string();
        runtime.persist(progress).await?;

        let discovered = if runtime.full_range {
            runtime.discovery.discover_full(token).await
        } else {
            runtime
                .discovery
                .discover_range(progress.start_date, progress.end_date, token)
                .await
        };
        let discovered = match discovered {
            Ok(result) => result,
            Err(CrawlerError::Cancelled) => {
                finalize_cancelled(runtime, progress).await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        progress.discovered_dates = discovered.available_dates;
        progress.total_dates_discovered = progress.discovered_dates.len() as u64;
        progress.discovery_time_ms = discovered.duration_ms;
        if runtime.full_range {
            if let (Some(first), Some(last)) = (
                progress.discovered_dates.first().copied(),
                progress.discovered_dates.last().copied(),
            ) {
                progress.start_date = first;
                progress.end_date = last;
            }
        }
    }

    progress.status = BulkCrawlStatus::Crawling;
    progress.current_phase = "crawling".to_string();
    runtime.persist(progress).await?;

    let download_clock = Instant::now();
    let accumulated_download_ms = progress.download_time_ms;
    let mut dates_since_save = 0u32;
    let mut last_save = Instant::now();

    // With more than one download lane, that many dates run concurrently;
    // the latch checkpoints sit at the group boundaries either way.
    let lanes = progress.max_concurrent_downloads.max(1);
    let remaining = progress.remaining_dates();
    for group in remaining.chunks(lanes) {
        // Checkpoint before the date(s) begin.
        if observe_latches(runtime, progress, token).await? == Checkpoint::Stop {
            return Ok(());
        }

        progress.current_processing_date = group.first().copied();
        let outcomes = join_all(group.iter().map(|date| {
            let date = *date;
            let orchestrator = runtime.orchestrator.clone();
            let force_update = progress.force_update;
            async move { (date, orchestrator.crawl_date(date, force_update, token).await) }
        }))
        .await;

        let mut cancelled = false;
        for (date, outcome) in outcomes {
            match outcome {
                Ok(report) => {
                    progress.record_date(
                        date,
                        report.new_documents + report.updated_documents,
                        report.failed_documents,
                        true,
                    );
                }
                Err(CrawlerError::Cancelled) => cancelled = true,
                Err(e) => {
                    warn!(
                        "Date {date} failed in campaign {}: {e}",
                        progress.operation_id
                    );
                    progress.record_date(date, 0, 0, false);
                    progress.error_message = Some(format!("{date}: {e}"));
                }
            }
        }
        if cancelled {
            finalize_cancelled(runtime, progress).await?;
            return Ok(());
        }
        progress.download_time_ms =
            accumulated_download_ms + download_clock.elapsed().as_millis() as u64;
        progress.update_rate(Utc::now());

        dates_since_save += group.len() as u32;
        if dates_since_save >= DATES_PER_PERSIST || last_save.elapsed() >= runtime.progress_interval
        {
            runtime.persist(progress).await?;
            dates_since_save = 0;
            last_save = Instant::now();
        }

        // Checkpoint between dates.
        if observe_latches(runtime, progress, token).await? == Checkpoint::Stop {
            return Ok(());
        }

        tokio::time::sleep(Duration::from_millis(progress.rate_limit_ms)).await;
    }

    progress.status = BulkCrawlStatus::Completed;
    progress.current_phase = "completed".to_string();
    progress.current_processing_date = None;
    progress.completed_at = Some(Utc::now());
    runtime.progress_store.save(progress).await?;
    runtime.clear_pause_flag(&progress.operation_id);
    info!(
        "Campaign {} completed: {} date(s), {} document(s) succeeded, {} failed",
        progress.operation_id,
        progress.dates_processed,
        progress.documents_succeeded,
        progress.documents_failed
    );
    Ok(())
}

/// Re-read the controller-owned latches and transition if one is set.
async fn observe_latches(
    runtime: &CampaignRuntime,
    progress: &mut BulkCrawlProgress,
    token: &CancellationToken,
) -> CrawlerResult<Checkpoint> {
    if let Some(stored) = runtime.progress_store.find(&progress.operation_id).await? {
        progress.pause_requested |= stored.pause_requested;
        progress.cancel_requested |= stored.cancel_requested;
    }
    if runtime.pause_flag_set(&progress.operation_id) {
        progress.pause_requested = true;
    }

    if progress.cancel_requested || token.is_cancelled() {
        progress.cancel_requested = true;
        finalize_cancelled(runtime, progress).await?;
        return Ok(Checkpoint::Stop);
    }
    if progress.pause_requested {
        progress.status = BulkCrawlStatus::Paused;
        progress.paused_at = Some(Utc::now());
        progress.current_phase = "paused".to_string();
        runtime.progress_store.save(progress).await?;
        runtime.clear_pause_flag(&progress.operation_id);
        info!(
            "Campaign {} paused after {} date(s)",
            progress.operation_id, progress.dates_processed
        );
        return Ok(Checkpoint::Stop);
    }
    Ok(Checkpoint::Continue)
}

async fn finalize_cancelled(
    runtime: &CampaignRuntime,
    progress: &mut BulkCrawlProgress,
) -> CrawlerResult<()> {
    progress.status = BulkCrawlStatus::Cancelled;
    progress.current_phase = "cancelled".to_string();
    progress.completed_at = Some(Utc::now());
    runtime.progress_store.save(progress).await?;
    info!("Campaign {} cancelled", progress.operation_id);
    Ok(())
}
