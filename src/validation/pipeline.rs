use serde::{Deserialize, Serialize};

use crate::config::ValidationSettings;
use crate::validation::ecli::EcliValidator;
use crate::validation::legal_doc_ml::LegalDocMlValidator;
use crate::validation::sanitizer::{SanitizerConfig, XmlSanitizer};

/// Documents shorter than this (in visible text) are flagged as thin.
const SUBSTANTIAL_CONTENT_CHARS: usize = 100;

/// How validation errors are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Any error fails the document.
    Strict,
    /// Sanitization failures still fail; other errors become warnings.
    Lenient,
}

/// Aggregated result of the validation pipeline (C1 → C3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub sanitization_passed: bool,
    pub structure_valid: bool,
    pub legal_doc_ml_format: bool,
    pub document_type: Option<String>,
    pub ecli_identifiers: Vec<String>,
    pub element_count: usize,
    pub has_substantial_content: bool,
    pub validations: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub original_size: usize,
    pub sanitized_size: usize,
}

/// **Validation Pipeline**
///
/// Composes the sanitizer, the LegalDocML structure validator and the ECLI
/// extractor into one call. `quick_validate` is the fast path used by the
/// ad-hoc validation surface: sanitize, parse, detect the format and pull
/// identifiers, skipping the deep structure checks.
#[derive(Debug, Clone)]
pub struct ValidationPipeline {
    sanitizer: XmlSanitizer,
    ecli: EcliValidator,
    legal: LegalDocMlValidator,
    settings: ValidationSettings,
}

impl ValidationPipeline {
    pub fn new(settings: ValidationSettings) -> Self {
        let sanitizer = XmlSanitizer::new(SanitizerConfig {
            max_size_bytes: settings.max_size_mib * 1024 * 1024,
            ..Default::default()
        });
        Self {
            sanitizer,
            ecli: EcliValidator::new(),
            legal: LegalDocMlValidator::new(),
            settings,
        }
    }

    pub fn sanitizer(&self) -> &XmlSanitizer {
        &self.sanitizer
    }

    fn mode(&self) -> ValidationMode {
        if self.settings.strict_mode {
            ValidationMode::Strict
        } else {
            ValidationMode::Lenient
        }
    }

    /// Full validation in the configured mode.
    pub fn validate(&self, content: &str) -> ValidationReport {
        self.validate_with_mode(content, self.mode())
    }

    pub fn validate_with_mode(&self, content: &str, mode: ValidationMode) -> ValidationReport {
        self.run(content, mode, true)
    }

    /// Fast path: sanitize, parse, detect format, extract identifiers.
    pub fn quick_validate(&self, content: &str) -> ValidationReport {
        self.run(content, self.mode(), false)
    }

    fn run(&self, content: &str, mode: ValidationMode, deep: bool) -> ValidationReport {
        let mut report = ValidationReport {
            original_size: content.len(),
            ..Default::default()
        };

        let clean = match self.sanitizer.sanitize(content) {
            Ok(clean) => clean,
            Err(e) => {
                report.errors.push(e.to_string());
                report.valid = false;
                return report;
            }
        };
        report.sanitization_passed = true;
        report.sanitized_size = clean.len();
        report.validations.push("sanitization passed".to_string());

        if self.settings.schema_enabled {
            self.inspect_structure(&clean, &mut report);
        }

        report.legal_doc_ml_format = LegalDocMlValidator::is_legal_doc_ml(&clean);
        if report.legal_doc_ml_format {
            report
                .validations
                .push("LegalDocML format detected".to_string());
        }

        if deep && self.settings.legal_doc_ml_enabled && report.legal_doc_ml_format {
            let legal = self.legal.validate(&clean);
            report.document_type = legal.document_type.clone();
            report.validations.extend(legal.validations);
            report.warnings.extend(legal.warnings);
            match mode {
                ValidationMode::Strict => report.errors.extend(legal.errors),
                // Structure problems in lenient mode annotate but do not fail.
                ValidationMode::Lenient => report.warnings.extend(legal.errors),
            }
        }

        if self.settings.ecli_enabled {
            report.ecli_identifiers = self.ecli.extract_all(&clean).into_iter().collect();
            if !report.ecli_identifiers.is_empty() {
                report.validations.push(format!(
                    "{} ECLI identifier(s) extracted",
                    report.ecli_identifiers.len()
                ));
            }
        }

        report.valid = report.errors.is_empty();
        report
    }

    fn inspect_structure(&self, clean: &str, report: &mut ValidationReport) {
        let options = roxmltree::ParsingOptions {
            allow_dtd: false,
            ..Default::default()
        };
        match roxmltree::Document::parse_with_options(clean, options) {
            Ok(doc) => {
                report.structure_valid = true;
                report.element_count = doc.descendants().filter(|n| n.is_element()).count();
                let text_len: usize = doc
                    .descendants()
                    .filter_map(|n| n.text())
                    .map(|t| t.trim().len())
                    .sum();
                report.has_substantial_content = text_len >= SUBSTANTIAL_CONTENT_CHARS;
            }
            Err(e) => {
                report.structure_valid = false;
                report.warnings.push(format!("Structure parse failed: {e}"));
            }
        }
    }
}
