use thiserror::Error;

/// Crawler-specific error types
///
/// Sanitization failures carry their own variants because callers route on
/// them: in strict mode any of them fails the document, in lenient mode only
/// the sanitization family does.
#[derive(Error, Debug)]
pub enum CrawlerError {
    #[error("External entity declaration detected")]
    ExternalEntity,

    #[error("DOCTYPE declaration not allowed")]
    DoctypeDeclaration,

    #[error("Entity expansion bomb suspected: {0}")]
    XmlBomb(String),

    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("Malformed XML: {0}")]
    MalformedXml(String),

    #[error("Security violation: {0}")]
    SecurityViolation(String),

    #[error("Sanitization failed: {0}")]
    Sanitization(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected HTTP status {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Invalid ECLI: {0}")]
    InvalidEcli(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Search index error: {0}")]
    Index(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("Discovery deadline exceeded after {0} hour(s)")]
    DiscoveryTimeout(u64),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    #[error("Too many concurrent bulk operations (limit {0})")]
    TooManyOperations(usize),

    #[error("Invalid state transition: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl CrawlerError {
    /// Whether the failure is part of the sanitization family (C1).
    ///
    /// These fail a document even in lenient validation mode.
    pub fn is_sanitization(&self) -> bool {
        matches!(
            self,
            CrawlerError::ExternalEntity
                | CrawlerError::DoctypeDeclaration
                | CrawlerError::XmlBomb(_)
                | CrawlerError::InvalidEncoding(_)
                | CrawlerError::MalformedXml(_)
                | CrawlerError::SecurityViolation(_)
                | CrawlerError::Sanitization(_)
        )
    }

    /// Whether a failed download may be retried later by the sweep job.
    ///
    /// Transport and storage problems are transient; sanitization verdicts
    /// are not going to change on a re-fetch of the same body.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CrawlerError::Http(_)
                | CrawlerError::HttpStatus { .. }
                | CrawlerError::Storage(_)
                | CrawlerError::Index(_)
                | CrawlerError::Io(_)
        )
    }
}

impl From<tantivy::TantivyError> for CrawlerError {
    fn from(err: tantivy::TantivyError) -> Self {
        CrawlerError::Index(err.to_string())
    }
}

/// Convenient result type for crawler operations
pub type CrawlerResult<T> = Result<T, CrawlerError>;
