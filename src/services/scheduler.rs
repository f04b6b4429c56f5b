use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ScheduleSettings;
use crate::error::{CrawlerError, CrawlerResult};
use crate::services::orchestrator::CrawlOrchestrator;
use crate::storage::DocumentStore;

/// Pause between dates inside the daily catch-up loop.
const DAILY_INTER_DATE_SLEEP: Duration = Duration::from_secs(5);
/// Pause between dates inside the weekly force-update loop.
const WEEKLY_INTER_DATE_SLEEP: Duration = Duration::from_secs(10);
/// The weekly job re-crawls this many days.
const WEEKLY_DAYS_BACK: u32 = 30;
/// Failed documents become eligible for the sweep after this long.
const RETRY_AGE_HOURS: i64 = 1;

/// **Cron Scheduler**
///
/// Time-driven crawls: a daily catch-up over the last `days_back` dates
/// (ending yesterday), a weekly force-update over the last 30 days, a
/// six-hourly retry sweep, and an hourly health line. One toggle disables
/// everything; each job skips its trigger when the previous run is still in
/// flight.
pub struct CrawlScheduler {
    orchestrator: Arc<CrawlOrchestrator>,
    store: Arc<dyn DocumentStore>,
    settings: ScheduleSettings,
}

impl CrawlScheduler {
    pub fn new(
        orchestrator: Arc<CrawlOrchestrator>,
        store: Arc<dyn DocumentStore>,
        settings: ScheduleSettings,
    ) -> Self {
        Self {
            orchestrator,
            store,
            settings,
        }
    }

    /// Register and start all jobs. Returns the running scheduler, or
    /// `None` when scheduling is disabled.
    pub async fn start(&self) -> CrawlerResult<Option<JobScheduler>> {
        if !self.settings.enabled {
            info!("Scheduled crawling is disabled");
            return Ok(None);
        }

        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| CrawlerError::Configuration(format!("scheduler init failed: {e:?}")))?;

        self.add_daily_job(&scheduler).await?;
        self.add_weekly_job(&scheduler).await?;
        self.add_retry_job(&scheduler).await?;
        self.add_health_job(&scheduler).await?;

        scheduler
            .start()
            .await
            .map_err(|e| CrawlerError::Configuration(format!("scheduler start failed: {e:?}")))?;
        info!(
            "Scheduler started (daily: {}, weekly: {}, retry: {}, health: {})",
            self.settings.daily_cron,
            self.settings.weekly_cron,
            self.settings.retry_cron,
            self.settings.health_cron
        );
        Ok(Some(scheduler))
    }

    async fn add_daily_job(&self, scheduler: &JobScheduler) -> CrawlerResult<()> {
        let orchestrator = self.orchestrator.clone();
        let days_back = self.settings.days_back;
        let in_flight = Arc::new(AtomicBool::new(false));

        let job = Job::new_async(self.settings.daily_cron.as_str(), move |_id, _sched| {
            let orchestrator = orchestrator.clone();
            let in_flight = in_flight.clone();
            Box::pin(async move {
                if in_flight.swap(true, Ordering::SeqCst) {
                    warn!("Daily crawl still running, skipping this trigger");
                    return;
                }
                info!("Daily crawl starting ({days_back} day(s) back)");
                run_catchup(&orchestrator, days_back, false, DAILY_INTER_DATE_SLEEP).await;
                in_flight.store(false, Ordering::SeqCst);
            })
        })
        .map_err(|e| CrawlerError::Configuration(format!("invalid daily cron: {e:?}")))?;
        scheduler
            .add(job)
            .await
            .map_err(|e| CrawlerError::Configuration(format!("could not add daily job: {e:?}")))?;
        Ok(())
    }

    async fn add_weekly_job(&self, scheduler: &JobScheduler) -> CrawlerResult<()> {
        let orchestrator = self.orchestrator.clone();
        let in_flight = Arc::new(AtomicBool::new(false));

        let job = Job::new_async(self.settings.weekly_cron.as_str(), move |_id, _sched| {
            let orchestrator = orchestrator.clone();
            let in_flight = in_flight.clone();
            Box::pin(async move {
                if in_flight.swap(true, Ordering::SeqCst) {
                    warn!("Weekly crawl still running, skipping this trigger");
                    return;
                }
                info!("Weekly force-update crawl starting ({WEEKLY_DAYS_BACK} day(s))");
                run_catchup(&orchestrator, WEEKLY_DAYS_BACK, true, WEEKLY_INTER_DATE_SLEEP).await;
                in_flight.store(false, Ordering::SeqCst);
            })
        })
        .map_err(|e| CrawlerError::Configuration(format!("invalid weekly cron: {e:?}")))?;
        scheduler
            .add(job)
            .await
            .map_err(|e| CrawlerError::Configuration(format!("could not add weekly job: {e:?}")))?;
        Ok(())
    }

    async fn add_retry_job(&self, scheduler: &JobScheduler) -> CrawlerResult<()> {
        let orchestrator = self.orchestrator.clone();
        let in_flight = Arc::new(AtomicBool::new(false));

        let job = Job::new_async(self.settings.retry_cron.as_str(), move |_id, _sched| {
            let orchestrator = orchestrator.clone();
            let in_flight = in_flight.clone();
            Box::pin(async move {
                if in_flight.swap(true, Ordering::SeqCst) {
                    warn!("Retry sweep still running, skipping this trigger");
                    return;
                }
                let token = CancellationToken::new();
                match orchestrator
                    .retry_failed(chrono::Duration::hours(RETRY_AGE_HOURS), &token)
                    .await
                {
                    Ok(recovered) => info!("Retry sweep recovered {recovered} document(s)"),
                    Err(e) => warn!("Retry sweep failed: {e}"),
                }
                in_flight.store(false, Ordering::SeqCst);
            })
        })
        .map_err(|e| CrawlerError::Configuration(format!("invalid retry cron: {e:?}")))?;
        scheduler
            .add(job)
            .await
            .map_err(|e| CrawlerError::Configuration(format!("could not add retry job: {e:?}")))?;
        Ok(())
    }

    async fn add_health_job(&self, scheduler: &JobScheduler) -> CrawlerResult<()> {
        let store = self.store.clone();
        let started = Instant::now();

        let job = Job::new_async(self.settings.health_cron.as_str(), move |_id, _sched| {
            let store = store.clone();
            Box::pin(async move {
                match store.stats().await {
                    Ok(stats) => info!(
                        "Health: {} document(s) stored, {} failed, uptime {}h",
                        stats.total_documents,
                        stats.by_status.get("FAILED").copied().unwrap_or(0),
                        started.elapsed().as_secs() / 3600
                    ),
                    Err(e) => warn!("Health tick could not read storage stats: {e}"),
                }
            })
        })
        .map_err(|e| CrawlerError::Configuration(format!("invalid health cron: {e:?}")))?;
        scheduler
            .add(job)
            .await
            .map_err(|e| CrawlerError::Configuration(format!("could not add health job: {e:?}")))?;
        Ok(())
    }
}

/// Crawl the last `days_back` dates ending yesterday, oldest first.
async fn run_catchup(
    orchestrator: &CrawlOrchestrator,
    days_back: u32,
    force_update: bool,
    inter_date_sleep: Duration,
) {
    let token = CancellationToken::new();
    let today = Utc::now().date_naive();
    for offset in (1..=days_back as i64).rev() {
        let date = today - chrono::Duration::days(offset);
        match orchestrator.crawl_date(date, force_update, &token).await {
            Ok(report) => info!(
                "Scheduled crawl {date}: {} new, {} updated, {} failed, {} skipped",
                report.new_documents,
                report.updated_documents,
                report.failed_documents,
                report.skipped_documents
            ),
            Err(e) => warn!("Scheduled crawl {date} failed: {e}"),
        }
        if offset > 1 {
            tokio::time::sleep(inter_date_sleep).await;
        }
    }
}
