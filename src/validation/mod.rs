//! XML security and semantic validation: sanitizer, ECLI grammar,
//! LegalDocML structure checks, and the pipeline composing them.

pub mod ecli;
pub mod legal_doc_ml;
pub mod pipeline;
pub mod sanitizer;

pub use ecli::{EcliComponents, EcliValidator, ValidatedEcli};
pub use legal_doc_ml::{LegalDocMlReport, LegalDocMlValidator};
pub use pipeline::{ValidationMode, ValidationPipeline, ValidationReport};
pub use sanitizer::{SanitizerConfig, XmlSanitizer};
