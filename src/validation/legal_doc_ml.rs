use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Akoma Ntoso namespace marker shared by all LegalDocML profiles.
const AKN_NAMESPACE_MARKER: &str = "docs.oasis-open.org/legaldocml";

/// Root elements Akoma Ntoso allows for a document.
const EXPECTED_ROOTS: &[&str] = &[
    "akomaNtoso",
    "act",
    "bill",
    "doc",
    "judgment",
    "portion",
    "documentCollection",
];

/// Elements the LegalDocML.de judgment profile carries for German decisions.
const GERMAN_JUDGMENT_ELEMENTS: &[&str] = &[
    "courtType",
    "docketNumber",
    "decisionDate",
    "judges",
    "procedure",
];

static EID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*(?:\.[A-Za-z0-9_-]+)*$").expect("valid regex")
});
static WID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("valid regex"));
static GUID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("valid regex")
});

/// Structured outcome of a LegalDocML check.
///
/// Errors fail the document; warnings and validation hits only annotate it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LegalDocMlReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub validations: Vec<String>,
    pub document_type: Option<String>,
}

impl LegalDocMlReport {
    pub fn valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// **LegalDocML Structure Validator**
///
/// Checks a sanitized XML document against the structural expectations of
/// the LegalDocML.de profile of Akoma Ntoso: namespace on the root, `meta`
/// block with identification/publication/lifecycle, FRBR levels, structural
/// elements, identifier grammars, and the German judgment metadata probes.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegalDocMlValidator;

impl LegalDocMlValidator {
    pub fn new() -> Self {
        Self
    }

    /// Cheap detection, usable before a full parse.
    pub fn is_legal_doc_ml(content: &str) -> bool {
        content.contains(AKN_NAMESPACE_MARKER)
            || content.contains("akomaNtoso")
            || content.contains("akn:")
    }

    pub fn validate(&self, xml: &str) -> LegalDocMlReport {
        let mut report = LegalDocMlReport::default();

        let options = roxmltree::ParsingOptions {
            allow_dtd: false,
            ..Default::default()
        };
        let doc = match roxmltree::Document::parse_with_options(xml, options) {
            Ok(doc) => doc,
            Err(e) => {
                report.errors.push(format!("Document does not parse: {e}"));
                return report;
            }
        };

        let root = doc.root_element();
        let root_name = root.tag_name().name().to_string();
        report.document_type = Some(root_name.clone());

        if !EXPECTED_ROOTS.contains(&root_name.as_str()) {
            report
                .warnings
                .push(format!("Unexpected root element <{root_name}>"));
        }

        let has_namespace = root
            .tag_name()
            .namespace()
            .map(|ns| {
                let ns = ns.to_ascii_lowercase();
                ns.contains(AKN_NAMESPACE_MARKER) || ns.contains("akomantoso")
            })
            .unwrap_or(false);
        if has_namespace {
            report
                .validations
                .push("LegalDocML namespace present on root".to_string());
        } else {
            report
                .errors
                .push("Missing LegalDocML namespace on root element".to_string());
        }

        self.check_meta(&doc, &mut report);
        self.check_structure(&doc, &mut report);
        self.check_identifiers(&doc, &mut report);
        self.check_german_judgment(&doc, &root_name, &mut report);

        report
    }

    fn check_meta(&self, doc: &roxmltree::Document, report: &mut LegalDocMlReport) {
        let meta = doc
            .descendants()
            .find(|n| n.is_element() && n.tag_name().name() == "meta");
        let Some(meta) = meta else {
            report.errors.push("Missing <meta> element".to_string());
            return;
        };
        report.validations.push("meta element present".to_string());

        for required in ["identification", "publication", "lifecycle"] {
            if meta
                .children()
                .any(|n| n.is_element() && n.tag_name().name() == required)
            {
                report
                    .validations
                    .push(format!("meta contains <{required}>"));
            } else {
                report
                    .warnings
                    .push(format!("meta is missing <{required}>"));
            }
        }

        for frbr in ["FRBRWork", "FRBRExpression", "FRBRManifestation"] {
            if meta
                .descendants()
                .any(|n| n.is_element() && n.tag_name().name() == frbr)
            {
                report.validations.push(format!("FRBR level {frbr} present"));
            } else {
                report.warnings.push(format!("Missing FRBR level {frbr}"));
            }
        }
    }

    fn check_structure(&self, doc: &roxmltree::Document, report: &mut LegalDocMlReport) {
        let has_body = doc.descendants().any(|n| {
            n.is_element()
                && matches!(
                    n.tag_name().name(),
                    "body" | "judgmentBody" | "mainBody" | "preamble"
                )
        });
        if has_body {
            report
                .validations
                .push("structural body element present".to_string());
        } else {
            report
                .warnings
                .push("No structural body element found".to_string());
        }
    }

    fn check_identifiers(&self, doc: &roxmltree::Document, report: &mut LegalDocMlReport) {
        for node in doc.descendants().filter(|n| n.is_element()) {
            if let Some(eid) = node.attribute("eId") {
                if !EID_PATTERN.is_match(eid) {
                    report
                        .warnings
                        .push(format!("eId is not hierarchical: {eid}"));
                }
            }
            if let Some(wid) = node.attribute("wId") {
                if !WID_PATTERN.is_match(wid) {
                    report.warnings.push(format!("Invalid wId: {wid}"));
                }
            }
            if let Some(guid) = node.attribute("GUID") {
                if !GUID_PATTERN.is_match(guid) {
                    report
                        .warnings
                        .push(format!("GUID is not a canonical UUID: {guid}"));
                }
            }
        }
    }

    fn check_german_judgment(
        &self,
        doc: &roxmltree::Document,
        root_name: &str,
        report: &mut LegalDocMlReport,
    ) {
        let is_judgment = root_name == "judgment"
            || doc
                .descendants()
                .any(|n| n.is_element() && n.tag_name().name() == "judgment");
        if !is_judgment {
            return;
        }
        report
            .validations
            .push("document is a judgment".to_string());

        for element in GERMAN_JUDGMENT_ELEMENTS {
            let found = doc.descendants().any(|n| {
                n.is_element()
                    && (n.tag_name().name() == *element
                        || n.attribute("name") == Some(element)
                        || n.attribute("refersTo") == Some(element))
            });
            if found {
                report
                    .validations
                    .push(format!("German judgment metadata: {element} present"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AKN_NS: &str = "http://docs.oasis-open.org/legaldocml/ns/akn/3.0";

    fn full_judgment() -> String {
        format!(
            r##"<akomaNtoso xmlns="{AKN_NS}">
  <judgment name="urteil">
    <meta>
      <identification source="#source">
        <FRBRWork><FRBRthis value="/akn/de/judgment/2024/123"/></FRBRWork>
        <FRBRExpression><FRBRlanguage language="deu"/></FRBRExpression>
        <FRBRManifestation><FRBRformat value="xml"/></FRBRManifestation>
      </identification>
      <publication date="2024-05-02" name="BGH"/>
      <lifecycle source="#source"><eventRef date="2024-05-02"/></lifecycle>
    </meta>
    <header>
      <courtType>BGH</courtType>
      <docketNumber>VI ZR 12/24</docketNumber>
      <decisionDate date="2024-05-02"/>
    </header>
    <judgmentBody>
      <motivation eId="mot_1"><p>Die Revision hat Erfolg.</p></motivation>
    </judgmentBody>
  </judgment>
</akomaNtoso>"##
        )
    }

    #[test]
    fn detection_by_token_and_namespace() {
        assert!(LegalDocMlValidator::is_legal_doc_ml(&full_judgment()));
        assert!(LegalDocMlValidator::is_legal_doc_ml("<akn:judgment/>"));
        assert!(!LegalDocMlValidator::is_legal_doc_ml("<html><body/></html>"));
    }

    #[test]
    fn valid_judgment_produces_no_errors() {
        let report = LegalDocMlValidator::new().validate(&full_judgment());
        assert!(report.valid(), "errors: {:?}", report.errors);
        assert!(report
            .validations
            .iter()
            .any(|v| v.contains("FRBRWork")));
        assert!(report
            .validations
            .iter()
            .any(|v| v.contains("courtType")));
        assert_eq!(report.document_type.as_deref(), Some("akomaNtoso"));
    }

    #[test]
    fn missing_namespace_is_an_error() {
        let xml = "<akomaNtoso><judgment><meta><identification/></meta></judgment></akomaNtoso>";
        let report = LegalDocMlValidator::new().validate(xml);
        assert!(!report.valid());
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("namespace")));
    }

    #[test]
    fn missing_meta_is_an_error() {
        let xml = format!(r#"<akomaNtoso xmlns="{AKN_NS}"><judgment/></akomaNtoso>"#);
        let report = LegalDocMlValidator::new().validate(&xml);
        assert!(report.errors.iter().any(|e| e.contains("<meta>")));
    }

    #[test]
    fn missing_frbr_levels_warn_only() {
        let xml = format!(
            r#"<akomaNtoso xmlns="{AKN_NS}"><doc><meta><identification/><publication/><lifecycle/></meta><body><p>x</p></body></doc></akomaNtoso>"#
        );
        let report = LegalDocMlValidator::new().validate(&xml);
        assert!(report.valid());
        assert_eq!(
            report
                .warnings
                .iter()
                .filter(|w| w.contains("FRBR"))
                .count(),
            3
        );
    }

    #[test]
    fn unexpected_root_warns() {
        let xml = format!(r#"<verdict xmlns="{AKN_NS}"><meta/></verdict>"#);
        let report = LegalDocMlValidator::new().validate(&xml);
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("Unexpected root")));
    }

    #[test]
    fn identifier_grammars() {
        let xml = format!(
            r#"<akomaNtoso xmlns="{AKN_NS}"><doc><meta/><body>
                 <p eId="para.1" wId="p-1" GUID="123e4567-e89b-12d3-a456-426614174000">ok</p>
                 <p eId=".broken" wId="bad id" GUID="nope">bad</p>
               </body></doc></akomaNtoso>"#
        );
        let report = LegalDocMlValidator::new().validate(&xml);
        assert!(report.warnings.iter().any(|w| w.contains("eId")));
        assert!(report.warnings.iter().any(|w| w.contains("wId")));
        assert!(report.warnings.iter().any(|w| w.contains("GUID")));
        // The well-formed identifiers on the first element produce no warning.
        assert!(!report.warnings.iter().any(|w| w.contains("para.1")));
    }

    #[test]
    fn unparsable_document_reports_error() {
        let report = LegalDocMlValidator::new().validate("<broken");
        assert!(!report.valid());
    }
}
