use chrono::NaiveDate;
use flate2::read::GzDecoder;
use std::io::Read;

/// **Portal URL Utilities**
///
/// Helpers for constructing and dissecting the portal's crawler URLs.

/// Build the daily sitemap index URL for a date.
///
/// Pattern: `{base}/jportal/docs/eclicrawler/<YYYY>/<MM>/<DD>/sitemap_index_1.xml`
pub fn sitemap_index_url(base_url: &str, date: NaiveDate) -> String {
    format!(
        "{}/jportal/docs/eclicrawler/{}/sitemap_index_1.xml",
        base_url.trim_end_matches('/'),
        date.format("%Y/%m/%d")
    )
}

/// Pull the portal's opaque document id out of a `docid=` query parameter.
pub fn docid_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(key, _)| key == "docid")
        .map(|(_, value)| value.into_owned())
        .filter(|id| !id.is_empty())
}

/// Strip whitespace and newlines that occasionally leak into sitemap locs.
pub fn normalize_url(url: &str) -> String {
    url.split_whitespace().collect()
}

/// **Date Utilities**

/// Parse a German-format date (`dd.MM.yyyy`).
pub fn parse_german_date(date_str: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(date_str.trim(), "%d.%m.%Y").ok()
}

/// Parse a sitemap `lastmod` value in its common shapes.
pub fn parse_lastmod(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(date);
    }
    // Full W3C datetime, e.g. 2025-01-10T06:00:00+01:00
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.date_naive())
        .ok()
}

/// All dates in `[start, end]` inclusive, ascending.
pub fn date_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    let mut current = start;
    while current <= end {
        dates.push(current);
        match current.succ_opt() {
            Some(next) => current = next,
            None => break,
        }
    }
    dates
}

/// **Gzip Utilities**
///
/// The portal serves some sitemap bodies gzip-compressed without a matching
/// `Content-Encoding` header, so decoding is decided by magic bytes.

/// Whether a body starts with the gzip magic bytes.
pub fn looks_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// Decode a response body, gunzipping when the magic bytes say so.
pub fn decode_body(bytes: &[u8]) -> std::io::Result<String> {
    if looks_gzip(bytes) {
        let mut decoder = GzDecoder::new(bytes);
        let mut out = String::new();
        decoder.read_to_string(&mut out)?;
        Ok(out)
    } else {
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}
