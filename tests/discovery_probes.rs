//! Discovery behavior against a stubbed portal: probe counts, content
//! verification (including header-less gzip), and the recent-sampling
//! fallback.

use chrono::NaiveDate;
use flate2::write::GzEncoder;
use flate2::Compression;
use mockito::{Matcher, ServerGuard};
use std::io::Write;
use tokio_util::sync::CancellationToken;

use ecli_crawler::config::{BulkSettings, CrawlerSettings};
use ecli_crawler::sitemaps::SitemapDiscovery;

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 2, day).unwrap()
}

fn settings(server: &ServerGuard) -> CrawlerSettings {
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
        progress_update_interval_ms: 1000,
        full_scan_fallback: true,
    }
}

const NON_EMPTY_INDEX: &str = r#"<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
<sitemap><loc>https://portal.example/sitemap_1.xml</loc></sitemap>
</sitemapindex>"#;

#[tokio::test]
async fn range_discovery_probes_each_date_exactly_once() {
    let mut server = mockito::Server::new_async().await;
    // Five dates: four present, one absent.
    let mut mocks = Vec::new();
    for day in [1, 2, 4, 5] {
        mocks.push(
            server
                .mock(
                    "HEAD",
                    format!("/jportal/docs/eclicrawler/2025/02/{day:02}/sitemap_index_1.xml")
                        .as_str(),
                )
                .with_status(200)
                .expect(1)
                .create_async().await,
        );
    }
    mocks.push(
        server
            .mock("HEAD", "/jportal/docs/eclicrawler/2025/02/03/sitemap_index_1.xml")
            .with_status(404)
            .expect(1)
            .create_async().await,
    );

    let discovery = SitemapDiscovery::new(&settings(&server), &bulk_settings()).unwrap();
    let token = CancellationToken::new();
    let result = discovery
        .discover_range(date(1), date(5), &token)
        .await
        .unwrap();

    assert_eq!(result.total_checked, 5);
    assert_eq!(
        result.available_dates,
        vec![date(1), date(2), date(4), date(5)]
    );
    // A 404 is "absent", not a transport failure.
    assert!(result.failed_dates.is_empty());
    // Exactly one probe hit each date's index.
    for mock in &mocks {
        mock.assert_async().await;
    }
}

#[tokio::test]
async fn content_check_rejects_empty_index() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/jportal/docs/eclicrawler/2025/02/01/sitemap_index_1.xml")
        .with_status(200)
        .with_body(r#"<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9"></sitemapindex>"#)
        .create_async().await;
    server
        .mock("GET", "/jportal/docs/eclicrawler/2025/02/02/sitemap_index_1.xml")
        .with_status(200)
        .with_body(NON_EMPTY_INDEX)
        .create_async().await;

    let discovery = SitemapDiscovery::new(&settings(&server), &bulk_settings()).unwrap();
    assert!(!discovery.exists_with_content(date(1)).await);
    assert!(discovery.exists_with_content(date(2)).await);
}

#[tokio::test]
async fn content_check_decodes_headerless_gzip() {
    let mut server = mockito::Server::new_async().await;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(NON_EMPTY_INDEX.as_bytes()).unwrap();
    let gzipped = encoder.finish().unwrap();

    server
        .mock("GET", "/jportal/docs/eclicrawler/2025/02/03/sitemap_index_1.xml")
        .with_status(200)
        // No Content-Encoding header: decoding must go by magic bytes.
        .with_header("content-type", "application/xml")
        .with_body(gzipped)
        .create_async().await;

    let discovery = SitemapDiscovery::new(&settings(&server), &bulk_settings()).unwrap();
    assert!(discovery.exists_with_content(date(3)).await);
}

#[tokio::test]
async fn recent_discovery_falls_back_to_range_scan() {
    let mut server = mockito::Server::new_async().await;
    // Every content probe misses...
    server
        .mock("GET", Matcher::Regex(r"^/jportal/docs/eclicrawler/.*".into()))
        .with_status(404)
        .create_async().await;
    // ...and the fallback HEAD scan finds nothing either.
    let heads = server
        .mock("HEAD", Matcher::Regex(r"^/jportal/docs/eclicrawler/.*".into()))
        .with_status(404)
        .expect_at_least(1)
        .create_async().await;

    let discovery = SitemapDiscovery::new(&settings(&server), &bulk_settings()).unwrap();
    let token = CancellationToken::new();
    let result = discovery.discover_recent(5, &token).await.unwrap();

    assert!(result.available_dates.is_empty());
    // Sampling (5 dates) plus the fallback's 5 HEAD probes.
    assert_eq!(result.total_checked, 10);
    heads.assert_async().await;
}

#[tokio::test]
async fn recent_discovery_returns_sorted_hits_without_fallback() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", Matcher::Regex(r"^/jportal/docs/eclicrawler/.*".into()))
        .with_status(200)
        .with_body(NON_EMPTY_INDEX)
        .create_async().await;

    let discovery = SitemapDiscovery::new(&settings(&server), &bulk_settings()).unwrap();
    let token = CancellationToken::new();
    let result = discovery.discover_recent(4, &token).await.unwrap();

    assert_eq!(result.available_dates.len(), 4);
    let mut sorted = result.available_dates.clone();
    sorted.sort();
    assert_eq!(result.available_dates, sorted);
}

#[tokio::test]
async fn cancellation_stops_range_discovery() {
    let server = mockito::Server::new_async().await;
    let discovery = SitemapDiscovery::new(&settings(&server), &bulk_settings()).unwrap();
    let token = CancellationToken::new();
    token.cancel();

    let result = discovery.discover_range(date(1), date(28), &token).await;
    assert!(result.is_err());
}
