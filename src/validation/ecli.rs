use chrono::Datelike;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use tracing::debug;

use crate::error::{CrawlerError, CrawlerResult};

/// Country codes valid in an ECLI: the EU member set plus the `EL`/`UK`
/// legacy codes and `EU` for the Court of Justice.
const COUNTRY_CODES: &[&str] = &[
    "AT", "BE", "BG", "HR", "CY", "CZ", "DK", "EE", "FI", "FR", "DE", "GR", "HU", "IE", "IT",
    "LV", "LT", "LU", "MT", "NL", "PL", "PT", "RO", "SK", "SI", "ES", "SE", "EL", "UK", "EU",
];

/// German court codes this crawler expects to encounter. Anything else is
/// still accepted, just logged, because state courts use free-form codes.
const KNOWN_GERMAN_COURTS: &[&str] = &[
    "BGH", "BVERFG", "BAG", "BSG", "BVERWG", "BFH", "BPATG",
];

static ECLI_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:ECLI:)?([A-Z]{2}):([A-Z][A-Z0-9]{0,6}):(\d{4}):([A-Z0-9.]{1,25})")
        .expect("valid regex")
});

/// Parsed components of a validated ECLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcliComponents {
    pub country_code: String,
    pub court: String,
    pub year: u16,
    pub ordinal: String,
}

/// A validated, normalized ECLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedEcli {
    pub normalized: String,
    pub components: EcliComponents,
}

/// **ECLI Validator**
///
/// Parses and validates European Case Law Identifiers
/// (`ECLI:<CC>:<Court>:<Year>:<Ordinal>`), normalizing case and prefix. The
/// Court of Justice short form (`EU:C:<Year>:<Ordinal>`) is accepted and
/// kept without the `ECLI:` prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct EcliValidator;

impl EcliValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate a single identifier, returning its normalized form.
    pub fn validate(&self, input: &str) -> CrawlerResult<ValidatedEcli> {
        let trimmed = input.trim().to_ascii_uppercase();
        if trimmed.is_empty() {
            return Err(CrawlerError::InvalidEcli("empty identifier".to_string()));
        }

        let (had_prefix, rest) = match trimmed.strip_prefix("ECLI:") {
            Some(rest) => (true, rest),
            None => (false, trimmed.as_str()),
        };

        let parts: Vec<&str> = rest.split(':').collect();
        if parts.len() != 4 {
            return Err(CrawlerError::InvalidEcli(format!(
                "expected 4 components, got {}",
                parts.len()
            )));
        }
        let (country, court, year_str, ordinal) = (parts[0], parts[1], parts[2], parts[3]);

        if !COUNTRY_CODES.contains(&country) {
            return Err(CrawlerError::InvalidEcli(format!(
                "unknown country code {country}"
            )));
        }
        if !is_valid_court_code(court) {
            return Err(CrawlerError::InvalidEcli(format!(
                "invalid court code {court}"
            )));
        }
        let year: u16 = year_str
            .parse()
            .map_err(|_| CrawlerError::InvalidEcli(format!("invalid year {year_str}")))?;
        let max_year = (chrono::Utc::now().year() + 1) as u16;
        if year_str.len() != 4 || !(1900..=max_year).contains(&year) {
            return Err(CrawlerError::InvalidEcli(format!(
                "year {year} outside [1900, {max_year}]"
            )));
        }
        if !is_valid_ordinal(ordinal) {
            return Err(CrawlerError::InvalidEcli(format!(
                "invalid ordinal {ordinal}"
            )));
        }

        if country == "DE" && !KNOWN_GERMAN_COURTS.contains(&court) {
            debug!("Unknown German court code in ECLI: {court}");
        }

        // The EU short form stays without the prefix; everything else is
        // normalized to carry it.
        let normalized = if country == "EU" && !had_prefix {
            format!("{country}:{court}:{year_str}:{ordinal}")
        } else {
            format!("ECLI:{country}:{court}:{year_str}:{ordinal}")
        };

        Ok(ValidatedEcli {
            normalized,
            components: EcliComponents {
                country_code: country.to_string(),
                court: court.to_string(),
                year,
                ordinal: ordinal.to_string(),
            },
        })
    }

    /// Extract every valid ECLI from free text, normalized and deduplicated.
    ///
    /// Invalid matches are discarded silently; the result is independent of
    /// ordering and duplication in the input.
    pub fn extract_all(&self, text: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        for capture in ECLI_PATTERN.find_iter(text) {
            // A sentence-final period is scan noise, not part of the ordinal.
            let candidate = capture.as_str().trim_end_matches('.');
            if let Ok(valid) = self.validate(candidate) {
                found.insert(valid.normalized);
            }
        }
        found
    }

    /// Whether the identifier names a German decision.
    pub fn is_german(&self, input: &str) -> bool {
        self.validate(input)
            .map(|v| v.components.country_code == "DE")
            .unwrap_or(false)
    }
}

fn is_valid_court_code(court: &str) -> bool {
    let mut chars = court.chars();
    match chars.next() {
        Some(first) if first.is_ascii_uppercase() => {}
        _ => return false,
    }
    court.len() <= 7 && chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

fn is_valid_ordinal(ordinal: &str) -> bool {
    !ordinal.is_empty()
        && ordinal.len() <= 25
        && ordinal
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '.')
}
