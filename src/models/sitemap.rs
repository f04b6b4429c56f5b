use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One entry of a leaf sitemap: a document URL plus the id carried in its
/// `docid=` query parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SitemapEntry {
    pub url: String,
    pub last_modified: Option<NaiveDate>,
    pub document_id: String,
}

/// Outcome of a discovery run over a date range.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryResult {
    /// Dates with a usable sitemap, sorted ascending.
    pub available_dates: Vec<NaiveDate>,
    /// Dates whose probe failed on transport level (not merely absent).
    pub failed_dates: Vec<NaiveDate>,
    pub duration_ms: u64,
    pub total_checked: u64,
}

/// Per-date crawl tallies produced by the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlReport {
    pub date: Option<NaiveDate>,
    pub new_documents: u64,
    pub updated_documents: u64,
    pub failed_documents: u64,
    pub skipped_documents: u64,
    /// Collapsed per-document error messages.
    pub errors: Vec<String>,
}

impl CrawlReport {
    pub fn for_date(date: NaiveDate) -> Self {
        Self {
            date: Some(date),
            ..Default::default()
        }
    }

    pub fn total_attempted(&self) -> u64 {
        self.new_documents + self.updated_documents + self.failed_documents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_tallies() {
        let mut report = CrawlReport::for_date(NaiveDate::from_ymd_opt(2025, 1, 10).unwrap());
        report.new_documents = 3;
        report.updated_documents = 1;
        report.failed_documents = 2;
        report.skipped_documents = 10;
        assert_eq!(report.total_attempted(), 6);
    }
}
