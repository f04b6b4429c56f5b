use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};

use crate::utils::parse_german_date;

/// Hard cap on extracted full text, with `…` appended beyond it.
const FULL_TEXT_CAP: usize = 50_000;

static TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("title").expect("valid selector"));
static TABLE_ROW: Lazy<Selector> = Lazy::new(|| Selector::parse("tr").expect("valid selector"));
static CELL: Lazy<Selector> = Lazy::new(|| Selector::parse("td, th").expect("valid selector"));
static SUBJECT: Lazy<Selector> =
    Lazy::new(|| Selector::parse(".docLayoutTitel p").expect("valid selector"));
static HEADING: Lazy<Selector> =
    Lazy::new(|| Selector::parse("h1, h2, h3, h4, h5, h6, dt").expect("valid selector"));

/// Federal court tokens recognized in the `Gericht` cell.
static COURT_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(BGH|BVerfG|BAG|BSG|BVerwG|BFH|BPatG)\b").expect("valid regex"));

/// Fields pulled from a downloaded document body.
///
/// Everything is optional: extraction is best-effort and never fails.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedContent {
    pub title: Option<String>,
    /// Normalized federal court token, or `UNKNOWN` when the cell did not
    /// contain one.
    pub court: Option<String>,
    pub decision_date: Option<NaiveDate>,
    pub case_number: Option<String>,
    pub ecli: Option<String>,
    pub document_type: Option<String>,
    pub norms: Option<String>,
    pub subject: Option<String>,
    pub leitsatz: Option<String>,
    pub tenor: Option<String>,
    pub gruende: Option<String>,
    pub full_text: Option<String>,
}

/// **Content Extractor**
///
/// Pulls the portal's standard metadata out of a document body: the
/// key/value table (`Gericht`, `Entscheidungsdatum`, `Aktenzeichen`, `ECLI`,
/// `Dokumenttyp`, `Normen`), the layout title paragraph, the classic section
/// triple (Leitsatz, Tenor, Gründe) and a whitespace-collapsed full text.
/// HTML entities are decoded by the parser; broken markup degrades to `None`
/// fields rather than an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentExtractor;

impl ContentExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn extract(&self, content: &str) -> ExtractedContent {
        let mut extracted = ExtractedContent::default();
        let doc = Html::parse_document(content);

        extracted.title = doc
            .select(&TITLE)
            .next()
            .map(|e| element_text(&e))
            .filter(|t| !t.is_empty());

        self.extract_metadata_table(&doc, &mut extracted);

        extracted.subject = doc
            .select(&SUBJECT)
            .next()
            .map(|e| element_text(&e))
            .filter(|t| !t.is_empty());

        extracted.leitsatz = self.extract_section(&doc, "leitsatz");
        extracted.tenor = self.extract_section(&doc, "tenor");
        extracted.gruende = self.extract_section(&doc, "gründe");

        extracted.full_text = self.extract_full_text(&doc);

        extracted
    }

    fn extract_metadata_table(&self, doc: &Html, extracted: &mut ExtractedContent) {
        for row in doc.select(&TABLE_ROW) {
            let mut cells = row.select(&CELL);
            let (Some(label_cell), Some(value_cell)) = (cells.next(), cells.next()) else {
                continue;
            };
            let label = element_text(&label_cell)
                .trim_end_matches(':')
                .trim()
                .to_lowercase();
            let value = element_text(&value_cell);
            if value.is_empty() {
                continue;
            }
            match label.as_str() {
                "gericht" => extracted.court = Some(normalize_court(&value)),
                "entscheidungsdatum" => extracted.decision_date = parse_german_date(&value),
                "aktenzeichen" => extracted.case_number = Some(value),
                "ecli" => extracted.ecli = Some(value),
                "dokumenttyp" => extracted.document_type = Some(value),
                "normen" => extracted.norms = Some(value),
                _ => {}
            }
        }
    }

    /// Find a heading whose text is the section name and return the text of
    /// the first element following it.
    fn extract_section(&self, doc: &Html, section: &str) -> Option<String> {
        for heading in doc.select(&HEADING) {
            let text = element_text(&heading).to_lowercase();
            if text != section {
                continue;
            }
            let mut sibling = heading.next_sibling();
            while let Some(node) = sibling {
                if let Some(element) = ElementRef::wrap(node) {
                    let body = element_text(&element);
                    if !body.is_empty() {
                        return Some(body);
                    }
                }
                sibling = node.next_sibling();
            }
        }
        None
    }

    fn extract_full_text(&self, doc: &Html) -> Option<String> {
        let collapsed: String = doc
            .root_element()
            .text()
            .flat_map(|t| t.split_whitespace())
            .collect::<Vec<_>>()
            .join(" ");
        if collapsed.is_empty() {
            return None;
        }
        if collapsed.chars().count() > FULL_TEXT_CAP {
            let mut capped: String = collapsed.chars().take(FULL_TEXT_CAP).collect();
            capped.push('…');
            Some(capped)
        } else {
            Some(collapsed)
        }
    }
}

/// Reduce a court cell to the federal court token it contains, or `UNKNOWN`.
pub fn normalize_court(value: &str) -> String {
    match COURT_TOKEN.find(value) {
        Some(token) => match token.as_str().to_ascii_uppercase().as_str() {
            "BGH" => "BGH",
            "BVERFG" => "BVerfG",
            "BAG" => "BAG",
            "BSG" => "BSG",
            "BVERWG" => "BVerwG",
            "BFH" => "BFH",
            "BPATG" => "BPatG",
            _ => "UNKNOWN",
        }
        .to_string(),
        None => "UNKNOWN".to_string(),
    }
}

fn element_text(element: &ElementRef) -> String {
    element
        .text()
        .flat_map(|t| t.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
}
