//! Bulk coordinator behavior: campaign completion, counter invariants,
//! pause/resume coverage, cancellation, the stuck reaper and cleanup.

use chrono::{NaiveDate, Utc};
use mockito::{Matcher, ServerGuard};
use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use ecli_crawler::config::{BulkSettings, Config, CrawlerSettings};
use ecli_crawler::models::{BulkCrawlOptions, BulkCrawlProgress, BulkCrawlStatus};
use ecli_crawler::services::{BulkCoordinator, CrawlOrchestrator, Downloader};
use ecli_crawler::sitemaps::{SitemapDiscovery, SitemapFetcher};
use ecli_crawler::storage::{ArchiveStore, DocumentStore, JsonProgressStore, ProgressStore};

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, day).unwrap()
}

fn crawler_settings(server: &ServerGuard) -> CrawlerSettings {
    CrawlerSettings {
        base_url: server.url(),
        user_agent: "ecli-crawler-test/0.1".to_string(),
        rate_limit_ms: 0,
        request_timeout_secs: 5,
    }
}

fn bulk_settings() -> BulkSettings {
    BulkSettings {
        max_concurrent_operations: 2,
        max_concurrent_checks: 3,
        default_rate_limit_ms: 0,
        default_max_concurrent_downloads: 1,
        discovery_timeout_hours: 1,
        stuck_operation_timeout_hours: 24,
        progress_update_interval_ms: 50,
        full_scan_fallback: true,
    }
}

/// Stub one crawlable date: HEAD+GET on the index, a leaf with one document.
async fn mock_date(server: &mut ServerGuard, day: u32) {
    let url = server.url();
    let prefix = format!("/jportal/docs/eclicrawler/2025/01/{day:02}");
    let index_body = format!(
        r#"<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
<sitemap><loc>{url}{prefix}/sitemap_1.xml</loc></sitemap>
</sitemapindex>"#
    );
    server
        .mock("HEAD", format!("{prefix}/sitemap_index_1.xml").as_str())
        .with_status(200)
        .create_async().await;
    server
        .mock("GET", format!("{prefix}/sitemap_index_1.xml").as_str())
        .with_status(200)
        .with_body(index_body)
        .create_async().await;
    server
        .mock("GET", format!("{prefix}/sitemap_1.xml").as_str())
        .with_status(200)
        .with_body(format!(
            r#"<urlset><url><loc>{url}/doc.xml?docid=DOC2025{day:02}</loc></url></urlset>"#
        ))
        .create_async().await;
    server
        .mock("GET", "/doc.xml")
        .match_query(Matcher::UrlEncoded("docid".into(), format!("DOC2025{day:02}")))
        .with_status(200)
        // A short pause keeps multi-date campaigns observable for the
        // pause/cancel tests.
        .with_chunked_body(|writer| {
            std::thread::sleep(Duration::from_millis(30));
            writer.write_all(b"<judgment><meta/><p>Die Revision wird zurueckgewiesen.</p></judgment>")
        })
        .create_async().await;
}

struct Harness {
    _dir: tempfile::TempDir,
    progress: Arc<JsonProgressStore>,
    coordinator: BulkCoordinator,
}

fn harness(server: &ServerGuard) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn DocumentStore> = Arc::new(ArchiveStore::open(dir.path()).unwrap());
    let settings = crawler_settings(server);
    let fetcher = SitemapFetcher::new(&settings).unwrap();
    let downloader = Arc::new(
        Downloader::new(&settings, Config::default().validation, store.clone()).unwrap(),
    );
    let orchestrator = Arc::new(CrawlOrchestrator::new(fetcher, downloader, store));
    let discovery = Arc::new(SitemapDiscovery::new(&settings, &bulk_settings()).unwrap());
    let progress = Arc::new(JsonProgressStore::open(dir.path()).unwrap());
    let coordinator = BulkCoordinator::new(orchestrator, discovery, progress.clone(), bulk_settings());
    Harness {
        _dir: dir,
        progress,
        coordinator,
    }
}

async fn wait_for<F>(harness: &Harness, id: &str, mut predicate: F) -> BulkCrawlProgress
where
    F: FnMut(&BulkCrawlProgress) -> bool,
{
    for _ in 0..600 {
        if let Some(progress) = harness.progress.find(id).await.unwrap() {
            if predicate(&progress) {
                return progress;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("campaign {id} never reached the expected state");
}

#[tokio::test]
async fn campaign_completes_with_consistent_counters() {
    let mut server = mockito::Server::new_async().await;
    for day in 1..=3 {
        mock_date(&mut server, day).await;
    }
    let harness = harness(&server);

    let id = harness
        .coordinator
        .start_range(date(1), date(3), None)
        .await
        .unwrap();

    let done = wait_for(&harness, &id, |p| p.status.is_terminal()).await;
    assert_eq!(done.status, BulkCrawlStatus::Completed);
    assert_eq!(done.total_dates_discovered, 3);
    assert_eq!(done.dates_processed, 3);
    assert_eq!(
        done.dates_processed,
        (done.processed_dates.len() + done.failed_dates.len()) as u64
    );
    assert_eq!(done.documents_succeeded, 3);
    assert_eq!(done.documents_failed, 0);
    assert!(done.completed_at.is_some());
    assert!(done.discovery_time_ms > 0 || done.total_dates_discovered > 0);
}

#[tokio::test]
async fn pause_and_resume_cover_each_date_exactly_once() {
    let mut server = mockito::Server::new_async().await;
    for day in 1..=5 {
        mock_date(&mut server, day).await;
    }
    let harness = harness(&server);

    let options = BulkCrawlOptions {
        rate_limit_ms: 150, // inter-date delay keeps the boundary observable
        max_concurrent_downloads: 1,
        force_update: false,
    };
    let id = harness
        .coordinator
        .start_range(date(1), date(5), Some(options))
        .await
        .unwrap();

    // Ask for a pause once the first date is through.
    wait_for(&harness, &id, |p| p.dates_processed >= 1).await;
    harness.coordinator.pause(&id).await.unwrap();

    let paused = wait_for(&harness, &id, |p| p.status == BulkCrawlStatus::Paused).await;
    assert!(paused.dates_processed < 5, "paused before finishing");
    assert_eq!(
        paused.dates_processed,
        (paused.processed_dates.len() + paused.failed_dates.len()) as u64
    );
    assert!(paused.paused_at.is_some());
    // The parked task no longer occupies an operation slot.
    assert_eq!(harness.coordinator.running_operations(), 0);

    harness.coordinator.resume(&id).await.unwrap();
    let done = wait_for(&harness, &id, |p| p.status.is_terminal()).await;
    assert_eq!(done.status, BulkCrawlStatus::Completed);

    // Exactly the discovered dates were covered, none twice.
    let discovered: BTreeSet<NaiveDate> = done.discovered_dates.iter().copied().collect();
    let covered: Vec<NaiveDate> = done
        .processed_dates
        .iter()
        .chain(done.failed_dates.iter())
        .copied()
        .collect();
    let covered_set: BTreeSet<NaiveDate> = covered.iter().copied().collect();
    assert_eq!(covered.len(), covered_set.len(), "no date processed twice");
    assert_eq!(covered_set, discovered);
    assert_eq!(done.dates_processed, 5);
}

#[tokio::test]
async fn cancel_is_observed_and_persisted() {
    let mut server = mockito::Server::new_async().await;
    for day in 1..=5 {
        mock_date(&mut server, day).await;
    }
    let harness = harness(&server);

    let options = BulkCrawlOptions {
        rate_limit_ms: 100,
        max_concurrent_downloads: 1,
        force_update: false,
    };
    let id = harness
        .coordinator
        .start_range(date(1), date(5), Some(options))
        .await
        .unwrap();

    wait_for(&harness, &id, |p| p.dates_processed >= 1).await;
    harness.coordinator.cancel(&id).await.unwrap();

    let cancelled = wait_for(&harness, &id, |p| p.status.is_terminal()).await;
    assert_eq!(cancelled.status, BulkCrawlStatus::Cancelled);
    assert!(cancelled.cancel_requested);
    assert!(cancelled.completed_at.is_some());
    assert!(cancelled.dates_processed < 5, "no full run after cancel");

    // Terminal states are sticky.
    assert!(harness.coordinator.resume(&id).await.is_err());
    assert!(harness.coordinator.cancel(&id).await.is_err());
}

#[tokio::test]
async fn concurrency_limit_is_enforced() {
    let mut server = mockito::Server::new_async().await;
    for day in 1..=2 {
        mock_date(&mut server, day).await;
    }
    let harness = harness(&server);
    let slow = BulkCrawlOptions {
        rate_limit_ms: 500,
        max_concurrent_downloads: 1,
        force_update: false,
    };

    let _a = harness
        .coordinator
        .start_range(date(1), date(2), Some(slow.clone()))
        .await
        .unwrap();
    let _b = harness
        .coordinator
        .start_range(date(1), date(2), Some(slow.clone()))
        .await
        .unwrap();
    // The third campaign exceeds max_concurrent_operations = 2.
    let third = harness
        .coordinator
        .start_range(date(1), date(2), Some(slow))
        .await;
    assert!(third.is_err());
}

#[tokio::test]
async fn stuck_campaigns_are_reaped() {
    let server = mockito::Server::new_async().await;
    let harness = harness(&server);

    let mut stuck = BulkCrawlProgress::new(date(1), date(7), BulkCrawlOptions::default());
    stuck.status = BulkCrawlStatus::Crawling;
    stuck.started_at = Some(Utc::now() - chrono::Duration::hours(25));
    harness.progress.save(&stuck).await.unwrap();

    let mut healthy = BulkCrawlProgress::new(date(1), date(7), BulkCrawlOptions::default());
    healthy.status = BulkCrawlStatus::Crawling;
    healthy.started_at = Some(Utc::now());
    harness.progress.save(&healthy).await.unwrap();

    let reaped = harness.coordinator.reap_stuck(24).await.unwrap();
    assert_eq!(reaped, 1);

    let failed = harness
        .progress
        .find(&stuck.operation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, BulkCrawlStatus::Failed);
    assert!(failed.error_message.unwrap().starts_with("stuck"));
    assert!(failed.completed_at.is_some());

    let untouched = harness
        .progress
        .find(&healthy.operation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(untouched.status, BulkCrawlStatus::Crawling);
}

#[tokio::test]
async fn cleanup_removes_only_old_terminal_campaigns() {
    let server = mockito::Server::new_async().await;
    let harness = harness(&server);

    let mut old_done = BulkCrawlProgress::new(date(1), date(2), BulkCrawlOptions::default());
    old_done.status = BulkCrawlStatus::Completed;
    old_done.completed_at = Some(Utc::now() - chrono::Duration::days(60));
    harness.progress.save(&old_done).await.unwrap();

    let mut recent_done = BulkCrawlProgress::new(date(1), date(2), BulkCrawlOptions::default());
    recent_done.status = BulkCrawlStatus::Completed;
    recent_done.completed_at = Some(Utc::now());
    harness.progress.save(&recent_done).await.unwrap();

    let mut old_failed = BulkCrawlProgress::new(date(1), date(2), BulkCrawlOptions::default());
    old_failed.status = BulkCrawlStatus::Failed;
    old_failed.completed_at = Some(Utc::now() - chrono::Duration::days(60));
    harness.progress.save(&old_failed).await.unwrap();

    let removed = harness.coordinator.cleanup_old(30).await.unwrap();
    assert_eq!(removed, 1);
    assert!(harness
        .progress
        .find(&old_done.operation_id)
        .await
        .unwrap()
        .is_none());
    // Failed campaigns are kept for inspection, recent ones untouched.
    assert!(harness
        .progress
        .find(&old_failed.operation_id)
        .await
        .unwrap()
        .is_some());
    assert!(harness
        .progress
        .find(&recent_done.operation_id)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn interrupted_campaigns_park_as_paused_on_startup() {
    let server = mockito::Server::new_async().await;
    let harness = harness(&server);

    let mut orphan = BulkCrawlProgress::new(date(1), date(7), BulkCrawlOptions::default());
    orphan.status = BulkCrawlStatus::Crawling;
    orphan.discovered_dates = vec![date(1), date(2)];
    harness.progress.save(&orphan).await.unwrap();

    let recovered = harness.coordinator.recover_on_startup().await.unwrap();
    assert_eq!(recovered, 1);
    let parked = harness
        .progress
        .find(&orphan.operation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(parked.status, BulkCrawlStatus::Paused);
}
