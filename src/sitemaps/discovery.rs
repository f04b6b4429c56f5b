use chrono::{NaiveDate, Utc};
use futures::future::join_all;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_ENCODING};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BulkSettings, CrawlerSettings};
use crate::error::{CrawlerError, CrawlerResult};
use crate::models::DiscoveryResult;
use crate::utils::{date_range, decode_body, sitemap_index_url};

/// The portal's sitemap feed starts here; nothing older exists.
const FEED_EPOCH: (i32, u32, u32) = (2020, 1, 1);

/// How many dates recent discovery samples before giving up.
const RECENT_SAMPLE_SIZE: usize = 10;

/// How far back the full-range scan looks for the newest usable sitemap.
const LATEST_SCAN_DAYS: i64 = 30;

/// **Sitemap Discovery**
///
/// Answers "which dates have sitemaps with real content?". Three
/// strategies:
/// - range discovery probes every date in `[start, end]` once with a HEAD
///   request, in batches of `max_concurrent_checks`;
/// - recent discovery samples up to ten dates biased toward the newest and
///   verifies actual content (non-empty index body);
/// - full-range discovery binary-searches the earliest date with content
///   and scans back from yesterday for the latest, then delegates to range
///   discovery between them.
pub struct SitemapDiscovery {
    client: reqwest::Client,
    base_url: String,
    rate_limit: Duration,
    max_concurrent_checks: usize,
    deadline: Duration,
    timeout_hours: u64,
    full_scan_fallback: bool,
}

impl SitemapDiscovery {
    pub fn new(crawler: &CrawlerSettings, bulk: &BulkSettings) -> CrawlerResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/xml, text/xml, */*"),
        );
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate"));

        let client = reqwest::Client::builder()
            .user_agent(crawler.user_agent.clone())
            .default_headers(headers)
            .timeout(Duration::from_secs(crawler.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: crawler.base_url.clone(),
            rate_limit: Duration::from_millis(crawler.rate_limit_ms),
            max_concurrent_checks: bulk.max_concurrent_checks.max(1),
            deadline: Duration::from_secs(bulk.discovery_timeout_hours * 3600),
            timeout_hours: bulk.discovery_timeout_hours,
            full_scan_fallback: bulk.full_scan_fallback,
        })
    }

    /// A cheap presence probe: HEAD on the daily index, 200 means present.
    pub async fn exists(&self, date: NaiveDate) -> CrawlerResult<bool> {
        let url = sitemap_index_url(&self.base_url, date);
        let response = self.client.head(&url).send().await?;
        Ok(response.status().as_u16() == 200)
    }

    /// A content probe: GET the index, gunzip if needed, and require that
    /// the body actually lists a sitemap (`<sitemap>` with a `<loc>`).
    pub async fn exists_with_content(&self, date: NaiveDate) -> bool {
        let url = sitemap_index_url(&self.base_url, date);
        let response = match self.client.get(&url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!("Content check for {date}: HTTP {}", r.status());
                return false;
            }
            Err(e) => {
                debug!("Content check for {date} failed: {e}");
                return false;
            }
        };
        let bytes = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                debug!("Content check for {date}: body read failed: {e}");
                return false;
            }
        };
        match decode_body(&bytes) {
            Ok(body) => body.contains("<sitemap") && body.contains("<loc"),
            Err(e) => {
                debug!("Content check for {date}: decode failed: {e}");
                return false;
            }
        }
    }

    /// Probe every date in `[start, end]` exactly once.
    pub async fn discover_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        cancel: &CancellationToken,
    ) -> CrawlerResult<DiscoveryResult> {
        let started = Instant::now();
        let dates = date_range(start, end);
        info!(
            "Range discovery over {} date(s) [{start} .. {end}]",
            dates.len()
        );

        let mut result = DiscoveryResult::default();
        for batch in dates.chunks(self.max_concurrent_checks) {
            if cancel.is_cancelled() {
                return Err(CrawlerError::Cancelled);
            }
            if started.elapsed() > self.deadline {
                warn!(
                    "Discovery deadline of {} hour(s) hit, returning partial result",
                    self.timeout_hours
                );
                break;
            }

            let probes = batch.iter().map(|date| {
                let date = *date;
                async move {
                    // Per-worker pacing before the probe.
                    tokio::time::sleep(self.rate_limit).await;
                    (date, self.exists(date).await)
                }
            });
            for (date, outcome) in join_all(probes).await {
                result.total_checked += 1;
                match outcome {
                    Ok(true) => result.available_dates.push(date),
                    Ok(false) => {}
                    Err(e) => {
                        debug!("Probe for {date} failed: {e}");
                        result.failed_dates.push(date);
                    }
                }
            }
        }

        result.available_dates.sort();
        result.failed_dates.sort();
        result.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Range discovery finished: {} available, {} failed, {} checked",
            result.available_dates.len(),
            result.failed_dates.len(),
            result.total_checked
        );
        Ok(result)
    }

    /// Sample the last `days` dates, biased toward the newest, verifying
    /// content. Falls back to a full range scan (if configured) when the
    /// sampling finds nothing.
    pub async fn discover_recent(
        &self,
        days: u32,
        cancel: &CancellationToken,
    ) -> CrawlerResult<DiscoveryResult> {
        let started = Instant::now();
        let yesterday = Utc::now().date_naive() - chrono::Duration::days(1);
        let oldest = yesterday - chrono::Duration::days(days.saturating_sub(1) as i64);

        let samples = sample_dates(oldest, yesterday, RECENT_SAMPLE_SIZE);
        debug!("Recent discovery sampling {} date(s)", samples.len());

        let mut result = DiscoveryResult::default();
        for date in &samples {
            if cancel.is_cancelled() {
                return Err(CrawlerError::Cancelled);
            }
            tokio::time::sleep(self.rate_limit).await;
            result.total_checked += 1;
            if self.exists_with_content(*date).await {
                result.available_dates.push(*date);
            }
        }

        if result.available_dates.is_empty() && self.full_scan_fallback {
            info!("Recent sampling found nothing, falling back to full range scan");
            let mut fallback = self.discover_range(oldest, yesterday, cancel).await?;
            fallback.total_checked += result.total_checked;
            fallback.duration_ms = started.elapsed().as_millis() as u64;
            return Ok(fallback);
        }

        result.available_dates.sort();
        result.duration_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }

    /// Find the earliest and latest dates with content, then scan the span
    /// between them.
    pub async fn discover_full(&self, cancel: &CancellationToken) -> CrawlerResult<DiscoveryResult> {
        let started = Instant::now();
        let yesterday = Utc::now().date_naive() - chrono::Duration::days(1);
        let epoch = NaiveDate::from_ymd_opt(FEED_EPOCH.0, FEED_EPOCH.1, FEED_EPOCH.2)
            .unwrap_or(yesterday);

        // Latest first: scan back from yesterday.
        let mut latest = None;
        for offset in 0..LATEST_SCAN_DAYS {
            if cancel.is_cancelled() {
                return Err(CrawlerError::Cancelled);
            }
            let date = yesterday - chrono::Duration::days(offset);
            tokio::time::sleep(self.rate_limit).await;
            if self.exists_with_content(date).await {
                latest = Some(date);
                break;
            }
        }
        let Some(latest) = latest else {
            warn!(
                "No sitemap content within the last {LATEST_SCAN_DAYS} day(s); nothing to crawl"
            );
            return Ok(DiscoveryResult {
                duration_ms: started.elapsed().as_millis() as u64,
                total_checked: LATEST_SCAN_DAYS as u64,
                ..Default::default()
            });
        };

        // Earliest by binary search: availability is monotonic once the
        // feed started publishing.
        let mut low = epoch;
        let mut high = latest;
        while low < high {
            if cancel.is_cancelled() {
                return Err(CrawlerError::Cancelled);
            }
            if started.elapsed() > self.deadline {
                return Err(CrawlerError::DiscoveryTimeout(self.timeout_hours));
            }
            let mid = low + chrono::Duration::days((high - low).num_days() / 2);
            tokio::time::sleep(self.rate_limit).await;
            if self.exists_with_content(mid).await {
                high = mid;
            } else {
                low = mid + chrono::Duration::days(1);
            }
        }

        info!("Full discovery bounds: [{low} .. {latest}]");
        self.discover_range(low, latest, cancel).await
    }
}

/// Pick up to `limit` dates from `[oldest, newest]`, most recent first,
/// front-loading the newest days and spreading the rest across the span.
fn sample_dates(oldest: NaiveDate, newest: NaiveDate, limit: usize) -> Vec<NaiveDate> {
    let all = date_range(oldest, newest);
    if all.len() <= limit {
        let mut recent_first = all;
        recent_first.reverse();
        return recent_first;
    }

    let mut samples = Vec::with_capacity(limit);
    let head = limit / 2;
    // The newest `head` days verbatim.
    for date in all.iter().rev().take(head) {
        samples.push(*date);
    }
    // The remainder spread evenly over the older span.
    let older = &all[..all.len() - head];
    let step = older.len() / (limit - head);
    for index in (0..older.len()).rev().step_by(step.max(1)) {
        if samples.len() == limit {
            break;
        }
        samples.push(older[index]);
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn sampling_small_ranges_takes_everything_recent_first() {
        let samples = sample_dates(date(2025, 1, 1), date(2025, 1, 5), 10);
        assert_eq!(samples.len(), 5);
        assert_eq!(samples[0], date(2025, 1, 5));
        assert_eq!(samples[4], date(2025, 1, 1));
    }

    #[test]
    fn sampling_large_ranges_is_biased_recent() {
        let samples = sample_dates(date(2024, 1, 1), date(2024, 12, 31), 10);
        assert_eq!(samples.len(), 10);
        // The newest five days are all sampled.
        for offset in 0..5 {
            assert!(samples.contains(&(date(2024, 12, 31) - chrono::Duration::days(offset))));
        }
        // And at least one probe reaches deep into the year.
        assert!(samples.iter().any(|d| *d < date(2024, 6, 1)));
        // No duplicates.
        let mut unique = samples.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), samples.len());
    }
}
