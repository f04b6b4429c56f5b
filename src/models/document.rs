use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Processing status of a document.
///
/// Transitions only move forward (`Pending → Downloaded → Processed`), any
/// state may fail, and only the manual retry path resets `Failed → Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Pending,
    Downloaded,
    Processed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Downloaded => "DOWNLOADED",
            Self::Processed => "PROCESSED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "DOWNLOADED" => Some(Self::Downloaded),
            "PROCESSED" => Some(Self::Processed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        match (self, next) {
            (Pending, Downloaded) | (Downloaded, Processed) => true,
            (Pending, Processed) => true,
            (_, Failed) => true,
            (Failed, Pending) => true,
            (a, b) if *a == b => true,
            _ => false,
        }
    }

    /// Position along the success lifecycle; `Failed` sits outside it and
    /// re-enters only through the manual `Failed → Pending` reset.
    fn progress_rank(&self) -> u8 {
        match self {
            Self::Pending | Self::Failed => 0,
            Self::Downloaded => 1,
            Self::Processed => 2,
        }
    }
}

/// Federal court tag, initially derived from the document-id prefix and
/// refined by content extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Court {
    #[serde(rename = "BAG")]
    Bag,
    #[serde(rename = "BGH")]
    Bgh,
    #[serde(rename = "BSG")]
    Bsg,
    #[serde(rename = "BVerwG")]
    Bverwg,
    #[serde(rename = "BVerfG")]
    Bverfg,
    #[serde(rename = "BFH")]
    Bfh,
    #[serde(rename = "BPatG")]
    Bpatg,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl Court {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bag => "BAG",
            Self::Bgh => "BGH",
            Self::Bsg => "BSG",
            Self::Bverwg => "BVerwG",
            Self::Bverfg => "BVerfG",
            Self::Bfh => "BFH",
            Self::Bpatg => "BPatG",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Lower-case form used for archive directory names.
    pub fn dir_name(&self) -> String {
        self.as_str().to_ascii_lowercase()
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BAG" => Some(Self::Bag),
            "BGH" => Some(Self::Bgh),
            "BSG" => Some(Self::Bsg),
            "BVERWG" => Some(Self::Bverwg),
            "BVERFG" => Some(Self::Bverfg),
            "BFH" => Some(Self::Bfh),
            "BPATG" => Some(Self::Bpatg),
            "UNKNOWN" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Derive the court from the portal's opaque document-id prefix.
    ///
    /// `KARE → BAG`, `KORE → BGH`, `KSRE → BSG`, `WBRE → BVerwG`; anything
    /// else is `UNKNOWN` until extraction refines it.
    pub fn from_document_id(document_id: &str) -> Self {
        match document_id.get(..4) {
            Some("KARE") => Self::Bag,
            Some("KORE") => Self::Bgh,
            Some("KSRE") => Self::Bsg,
            Some("WBRE") => Self::Bverwg,
            _ => Self::Unknown,
        }
    }

    pub fn all() -> [Court; 8] {
        [
            Self::Bag,
            Self::Bgh,
            Self::Bsg,
            Self::Bverwg,
            Self::Bverfg,
            Self::Bfh,
            Self::Bpatg,
            Self::Unknown,
        ]
    }
}

/// A case-law document acquired from the portal.
///
/// `document_id` is the natural key; exactly one record exists per id. The
/// `ecli` is secondary and only set once validation or extraction produced a
/// well-formed identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegalDocument {
    /// Portal-assigned opaque identifier (e.g. `KARE500041892`).
    pub document_id: String,
    /// European Case Law Identifier, once known.
    pub ecli: Option<String>,
    /// Deciding court; prefix-derived until refined from content.
    pub court: Court,
    /// URL the document body is fetched from.
    pub source_url: String,
    /// Decision date. Initialized to crawl time and refined from content.
    pub decision_date: DateTime<Utc>,
    /// When the body was last fetched successfully.
    pub crawled_at: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub subject: Option<String>,
    pub summary: Option<String>,
    pub case_number: Option<String>,
    pub document_type: Option<String>,
    /// Cited norms, as printed in the metadata table.
    pub norms: Option<String>,
    pub leitsatz: Option<String>,
    pub tenor: Option<String>,
    pub gruende: Option<String>,
    pub full_text: Option<String>,
    /// Archive location of the raw body, when the filesystem backend wrote one.
    pub file_path: Option<PathBuf>,
    pub status: DocumentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LegalDocument {
    /// Create a fresh `PENDING` record for a sitemap entry.
    pub fn new(document_id: String, source_url: String) -> Self {
        let now = Utc::now();
        let court = Court::from_document_id(&document_id);
        Self {
            document_id,
            ecli: None,
            court,
            source_url,
            decision_date: now,
            crawled_at: None,
            title: None,
            subject: None,
            summary: None,
            case_number: None,
            document_type: None,
            norms: None,
            leitsatz: None,
            tenor: None,
            gruende: None,
            full_text: None,
            file_path: None,
            status: DocumentStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a status change, refreshing `updated_at`.
    ///
    /// Transitions that `can_transition_to` rejects are refused: the status
    /// stays put and the record is untouched. Debug builds panic so the
    /// offending caller surfaces immediately.
    pub fn set_status(&mut self, next: DocumentStatus) {
        if !self.status.can_transition_to(next) {
            debug_assert!(
                false,
                "illegal status transition {} -> {} for {}",
                self.status.as_str(),
                next.as_str(),
                self.document_id
            );
            warn!(
                "Refusing illegal status transition {} -> {} for {}",
                self.status.as_str(),
                next.as_str(),
                self.document_id
            );
            return;
        }
        self.status = next;
        self.updated_at = Utc::now();
    }

    /// Advance along the success lifecycle, never stepping back.
    ///
    /// A record that is already further along (a `PROCESSED` document being
    /// force-redownloaded, say) keeps its status; a `FAILED` record stays
    /// failed until the retry path resets it. `updated_at` is refreshed
    /// either way, since the record was re-examined.
    pub fn advance_status(&mut self, next: DocumentStatus) {
        if next.progress_rank() >= self.status.progress_rank()
            && self.status.can_transition_to(next)
        {
            self.status = next;
        } else {
            debug!(
                "Keeping {} at {} instead of moving to {}",
                self.document_id,
                self.status.as_str(),
                next.as_str()
            );
        }
        self.updated_at = Utc::now();
    }

    /// Whether a crawl can skip re-downloading this record.
    pub fn is_complete(&self) -> bool {
        matches!(
            self.status,
            DocumentStatus::Downloaded | DocumentStatus::Processed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn court_from_prefix() {
        assert_eq!(Court::from_document_id("KARE500041892"), Court::Bag);
        assert_eq!(Court::from_document_id("KORE300012024"), Court::Bgh);
        assert_eq!(Court::from_document_id("KSRE100000123"), Court::Bsg);
        assert_eq!(Court::from_document_id("WBRE201500042"), Court::Bverwg);
        assert_eq!(Court::from_document_id("XXXX1"), Court::Unknown);
        assert_eq!(Court::from_document_id(""), Court::Unknown);
    }

    #[test]
    fn archive_dir_name_is_lower_case() {
        assert_eq!(Court::Bverwg.dir_name(), "bverwg");
        assert_eq!(Court::Bag.dir_name(), "bag");
    }

    #[test]
    fn status_transitions_are_monotonic() {
        use DocumentStatus::*;
        assert!(Pending.can_transition_to(Downloaded));
        assert!(Downloaded.can_transition_to(Processed));
        assert!(Processed.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));
        // No moving backwards.
        assert!(!Processed.can_transition_to(Downloaded));
        assert!(!Downloaded.can_transition_to(Pending));
    }

    #[test]
    #[should_panic(expected = "illegal status transition")]
    fn set_status_panics_on_regression_in_debug() {
        let mut doc = LegalDocument::new(
            "KORE1".to_string(),
            "https://example.org/doc?docid=KORE1".to_string(),
        );
        doc.set_status(DocumentStatus::Downloaded);
        doc.set_status(DocumentStatus::Processed);
        doc.set_status(DocumentStatus::Downloaded);
    }

    #[test]
    fn advance_status_never_steps_back() {
        let mut doc = LegalDocument::new(
            "KORE2".to_string(),
            "https://example.org/doc?docid=KORE2".to_string(),
        );
        doc.advance_status(DocumentStatus::Downloaded);
        assert_eq!(doc.status, DocumentStatus::Downloaded);
        doc.advance_status(DocumentStatus::Processed);
        assert_eq!(doc.status, DocumentStatus::Processed);
        // A re-crawl that would demote the record keeps the higher status.
        doc.advance_status(DocumentStatus::Downloaded);
        assert_eq!(doc.status, DocumentStatus::Processed);
    }

    #[test]
    fn advance_status_leaves_failed_for_the_retry_path() {
        let mut doc = LegalDocument::new(
            "KORE3".to_string(),
            "https://example.org/doc?docid=KORE3".to_string(),
        );
        doc.set_status(DocumentStatus::Failed);
        doc.advance_status(DocumentStatus::Downloaded);
        assert_eq!(doc.status, DocumentStatus::Failed);
        // The sanctioned way back in.
        doc.set_status(DocumentStatus::Pending);
        doc.advance_status(DocumentStatus::Downloaded);
        assert_eq!(doc.status, DocumentStatus::Downloaded);
    }

    #[test]
    fn new_document_is_pending_with_derived_court() {
        let doc = LegalDocument::new(
            "KARE500041892".to_string(),
            "https://example.org/doc?docid=KARE500041892".to_string(),
        );
        assert_eq!(doc.status, DocumentStatus::Pending);
        assert_eq!(doc.court, Court::Bag);
        assert!(doc.crawled_at.is_none());
        assert!(doc.ecli.is_none());
    }
}
