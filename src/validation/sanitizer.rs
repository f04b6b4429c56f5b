use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{CrawlerError, CrawlerResult};

/// External entity declarations (`<!ENTITY x SYSTEM/PUBLIC ...>`).
static EXTERNAL_ENTITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<!ENTITY\s+\S+\s+(?:SYSTEM|PUBLIC)\b").expect("valid regex")
});

/// Any DOCTYPE declaration or internal entity definition.
static DOCTYPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<!(?:DOCTYPE|ENTITY)\b").expect("valid regex"));

/// Entity references in document content (`&amp;`, `&#228;`, ...).
static ENTITY_REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&#?[A-Za-z0-9]+;").expect("valid regex"));

/// Configuration for XML sanitization
#[derive(Debug, Clone)]
pub struct SanitizerConfig {
    /// Maximum accepted input size in bytes
    pub max_size_bytes: usize,
    /// Minimum characters per entity reference before a document counts as
    /// an expansion attempt
    pub max_entity_expansion_ratio: usize,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 10 * 1024 * 1024, // 10 MiB
            max_entity_expansion_ratio: 10,
        }
    }
}

/// **XML Sanitizer**
///
/// First stage of the validation pipeline: rejects the attack classes a
/// public-portal crawler must assume (XXE, DOCTYPE smuggling, entity
/// expansion floods, oversized bodies, broken encodings) and normalizes what
/// remains. Accepted output parses through a hardened parser with DTD
/// support disabled, and sanitization is idempotent:
/// `sanitize(sanitize(x)) == sanitize(x)`.
#[derive(Debug, Clone, Default)]
pub struct XmlSanitizer {
    config: SanitizerConfig,
}

impl XmlSanitizer {
    pub fn new(config: SanitizerConfig) -> Self {
        Self { config }
    }

    /// Sanitize raw bytes, rejecting invalid UTF-8.
    pub fn sanitize_bytes(&self, bytes: &[u8]) -> CrawlerResult<String> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| CrawlerError::InvalidEncoding(e.to_string()))?;
        self.sanitize(text)
    }

    /// Sanitize an XML document, returning the cleaned text.
    pub fn sanitize(&self, xml: &str) -> CrawlerResult<String> {
        if xml.trim().is_empty() {
            return Err(CrawlerError::SecurityViolation(
                "empty XML input".to_string(),
            ));
        }
        if xml.len() > self.config.max_size_bytes {
            return Err(CrawlerError::SecurityViolation(format!(
                "XML size {} exceeds limit {}",
                xml.len(),
                self.config.max_size_bytes
            )));
        }

        let xml = xml.strip_prefix('\u{feff}').unwrap_or(xml);

        // A replacement character means the body did not survive a UTF-8
        // round trip upstream.
        if xml.contains('\u{fffd}') {
            return Err(CrawlerError::InvalidEncoding(
                "replacement characters present".to_string(),
            ));
        }

        if EXTERNAL_ENTITY.is_match(xml) {
            return Err(CrawlerError::ExternalEntity);
        }
        if DOCTYPE.is_match(xml) {
            return Err(CrawlerError::DoctypeDeclaration);
        }

        // Entity-flood heuristic: a body where more than one character in
        // `max_entity_expansion_ratio` starts an entity reference is an
        // amplification attempt, not a legal document.
        let entity_count = ENTITY_REFERENCE.find_iter(xml).count();
        if entity_count > 0 {
            let chars_per_entity = xml.len() / entity_count;
            if chars_per_entity < self.config.max_entity_expansion_ratio {
                return Err(CrawlerError::XmlBomb(format!(
                    "{entity_count} entity references in {} bytes",
                    xml.len()
                )));
            }
        }

        let clean: String = xml.chars().filter(|c| !is_forbidden_control(*c)).collect();

        // Final gate: the cleaned document must parse with DTDs disallowed.
        let options = roxmltree::ParsingOptions {
            allow_dtd: false,
            ..Default::default()
        };
        roxmltree::Document::parse_with_options(&clean, options)
            .map_err(|e| CrawlerError::MalformedXml(e.to_string()))?;

        Ok(clean)
    }

    /// Escape a string for use as XML text content.
    pub fn escape_text_content(value: &str) -> String {
        let mut out = String::with_capacity(value.len());
        for c in value.chars() {
            match c {
                '&' => out.push_str("&amp;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                _ => out.push(c),
            }
        }
        out
    }

    /// Escape a string for use inside a quoted attribute value.
    pub fn escape_attribute_value(value: &str) -> String {
        let mut out = String::with_capacity(value.len());
        for c in value.chars() {
            match c {
                '&' => out.push_str("&amp;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                '"' => out.push_str("&quot;"),
                '\'' => out.push_str("&apos;"),
                _ => out.push(c),
            }
        }
        out
    }
}

/// Control characters stripped from document bodies:
/// `[\x00-\x08\x0B\x0C\x0E-\x1F\x7F]` (tab, LF and CR stay).
fn is_forbidden_control(c: char) -> bool {
    matches!(c, '\u{00}'..='\u{08}' | '\u{0b}' | '\u{0c}' | '\u{0e}'..='\u{1f}' | '\u{7f}')
}
