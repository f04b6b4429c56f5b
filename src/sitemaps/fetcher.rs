use chrono::NaiveDate;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_ENCODING};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::CrawlerSettings;
use crate::error::{CrawlerError, CrawlerResult};
use crate::models::SitemapEntry;
use crate::rate_limit::RateLimiter;
use crate::utils::{decode_body, docid_from_url, parse_lastmod, sitemap_index_url};

/// **Sitemap Fetcher**
///
/// Fetches and parses the portal's daily sitemap index
/// (`.../eclicrawler/<YYYY>/<MM>/<DD>/sitemap_index_1.xml`) and its leaf
/// sitemaps. Responses may be gzip regardless of their `Content-Encoding`
/// header, so bodies are decoded by magic bytes. Leaf fetches are paced by
/// the shared rate limiter; the index fetch is not.
#[derive(Debug, Clone)]
pub struct SitemapFetcher {
    client: reqwest::Client,
    base_url: String,
    rate_limiter: RateLimiter,
}

impl SitemapFetcher {
    pub fn new(settings: &CrawlerSettings) -> CrawlerResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/xml, text/xml, */*"),
        );
        // Set explicitly: reqwest then hands us the raw body and decoding
        // stays in one place (decode_body) for header-less gzip too.
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate"));

        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .default_headers(headers)
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: settings.base_url.clone(),
            rate_limiter: RateLimiter::from_millis(settings.rate_limit_ms),
        })
    }

    /// Fetch the daily index for `date` and return the leaf sitemap URLs.
    pub async fn fetch_index(
        &self,
        date: NaiveDate,
        cancel: &CancellationToken,
    ) -> CrawlerResult<Vec<String>> {
        if cancel.is_cancelled() {
            return Err(CrawlerError::Cancelled);
        }
        let url = sitemap_index_url(&self.base_url, date);
        debug!("Fetching sitemap index {url}");
        let xml = self.fetch_text(&url).await?;
        let urls = parse_index(&xml)?;
        debug!("Index for {date} lists {} leaf sitemap(s)", urls.len());
        Ok(urls)
    }

    /// Fetch one leaf sitemap and return its document entries.
    pub async fn fetch_leaf(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> CrawlerResult<Vec<SitemapEntry>> {
        if cancel.is_cancelled() {
            return Err(CrawlerError::Cancelled);
        }
        self.rate_limiter.acquire().await;
        debug!("Fetching leaf sitemap {url}");
        let xml = self.fetch_text(url).await?;
        let entries = parse_leaf(&xml)?;
        debug!("Leaf {url} lists {} document(s)", entries.len());
        Ok(entries)
    }

    async fn fetch_text(&self, url: &str) -> CrawlerResult<String> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CrawlerError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let bytes = response.bytes().await?;
        Ok(decode_body(&bytes)?)
    }
}

/// Parse a sitemap index: every `sitemap/loc` value.
pub fn parse_index(xml: &str) -> CrawlerResult<Vec<String>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut urls = Vec::new();
    let mut in_sitemap = false;
    let mut in_loc = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"sitemap" => in_sitemap = true,
                b"loc" if in_sitemap => in_loc = true,
                _ => {}
            },
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"sitemap" => in_sitemap = false,
                b"loc" => in_loc = false,
                _ => {}
            },
            Ok(Event::Text(t)) if in_loc => {
                let loc = t
                    .unescape()
                    .map_err(|e| CrawlerError::MalformedXml(e.to_string()))?;
                let loc = loc.trim();
                if !loc.is_empty() {
                    urls.push(loc.to_string());
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(CrawlerError::MalformedXml(e.to_string())),
            _ => {}
        }
    }
    Ok(urls)
}

/// Parse a leaf sitemap: `url/{loc, lastmod}` pairs. Entries without a
/// `docid` query parameter are skipped with a warning.
pub fn parse_leaf(xml: &str) -> CrawlerResult<Vec<SitemapEntry>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut in_url = false;
    let mut current_field: Option<&'static str> = None;
    let mut loc = String::new();
    let mut lastmod = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"url" => {
                    in_url = true;
                    loc.clear();
                    lastmod.clear();
                }
                b"loc" if in_url => current_field = Some("loc"),
                b"lastmod" if in_url => current_field = Some("lastmod"),
                _ => {}
            },
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"url" => {
                    in_url = false;
                    if !loc.is_empty() {
                        match docid_from_url(&loc) {
                            Some(document_id) => entries.push(SitemapEntry {
                                url: loc.clone(),
                                last_modified: parse_lastmod(&lastmod),
                                document_id,
                            }),
                            None => warn!("Sitemap entry without docid parameter: {loc}"),
                        }
                    }
                }
                b"loc" | b"lastmod" => current_field = None,
                _ => {}
            },
            Ok(Event::Text(t)) => {
                if let Some(field) = current_field {
                    let text = t
                        .unescape()
                        .map_err(|e| CrawlerError::MalformedXml(e.to_string()))?;
                    match field {
                        "loc" => loc.push_str(text.trim()),
                        "lastmod" => lastmod.push_str(text.trim()),
                        _ => {}
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(CrawlerError::MalformedXml(e.to_string())),
            _ => {}
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <sitemap>
    <loc>https://portal.example/jportal/docs/eclicrawler/2025/01/10/sitemap_1.xml</loc>
    <lastmod>2025-01-10</lastmod>
  </sitemap>
  <sitemap>
    <loc>https://portal.example/jportal/docs/eclicrawler/2025/01/10/sitemap_2.xml</loc>
  </sitemap>
</sitemapindex>"#;

    const LEAF: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url>
    <loc>https://portal.example/jportal/?doc.id=1&amp;docid=KARE500041892</loc>
    <lastmod>2025-01-10</lastmod>
  </url>
  <url>
    <loc>https://portal.example/jportal/?docid=KORE300012024</loc>
  </url>
  <url>
    <loc>https://portal.example/jportal/no-id</loc>
  </url>
</urlset>"#;

    #[test]
    fn parses_index_locs() {
        let urls = parse_index(INDEX).unwrap();
        assert_eq!(urls.len(), 2);
        assert!(urls[0].ends_with("sitemap_1.xml"));
        assert!(urls[1].ends_with("sitemap_2.xml"));
    }

    #[test]
    fn parses_leaf_entries_and_skips_missing_docid() {
        let entries = parse_leaf(LEAF).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].document_id, "KARE500041892");
        assert_eq!(
            entries[0].last_modified,
            NaiveDate::from_ymd_opt(2025, 1, 10)
        );
        assert_eq!(entries[1].document_id, "KORE300012024");
        assert_eq!(entries[1].last_modified, None);
    }

    #[test]
    fn entity_escapes_in_locs_are_decoded() {
        let entries = parse_leaf(LEAF).unwrap();
        assert!(entries[0].url.contains("doc.id=1&docid=KARE500041892"));
    }

    #[test]
    fn empty_index_yields_no_urls() {
        let xml = r#"<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9"></sitemapindex>"#;
        assert!(parse_index(xml).unwrap().is_empty());
    }

    #[test]
    fn broken_entity_reference_is_an_error() {
        let xml = "<urlset><url><loc>https://x?docid=A&stray;</loc></url></urlset>";
        assert!(matches!(
            parse_leaf(xml),
            Err(CrawlerError::MalformedXml(_))
        ));
    }
}
