//! Parsing: recognized text to a typed `ParsedRecord`.
//!
//! Classification picks the document type, engine-structured fields are
//! offered first, then the type's parser adds what it reads from the text.
//! Every field keeps the highest-confidence candidate.

pub mod common;
pub mod identity_card;
pub mod mrz;
pub mod passport;
pub mod visa;

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use uuid::Uuid;

use crate::models::{
    DocumentType, FieldSource, FieldValue, IssueCode, ParsedRecord, ValidationIssue,
};
use crate::pipeline::extraction::ExtractionResult;

pub use identity_card::IdentityCardParser;
pub use passport::PassportParser;
pub use visa::VisaParser;

/// Classifications at or below this confidence are flagged as ambiguous.
pub const AMBIGUOUS_THRESHOLD: f32 = 0.5;

/// Type-specific extraction of fields from recognized text.
pub trait DocumentParser: Send + Sync {
    fn document_type(&self) -> DocumentType;

    /// Offer every field found in `text` to `record`.
    fn parse(&self, text: &str, record: &mut ParsedRecord);
}

pub fn parser_for(document_type: DocumentType) -> &'static dyn DocumentParser {
    match document_type {
        DocumentType::IdentityCard => &IdentityCardParser,
        DocumentType::Passport => &PassportParser,
        DocumentType::Visa => &VisaParser,
    }
}

// ═══════════════════════════════════════════════════════════
// Classification
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub document_type: DocumentType,
    pub confidence: f32,
    pub ambiguous: bool,
}

impl Classification {
    fn new(document_type: DocumentType, confidence: f32) -> Self {
        Self {
            document_type,
            confidence,
            ambiguous: confidence <= AMBIGUOUS_THRESHOLD,
        }
    }
}

const VISA_KEYWORDS: &[&str] = &["VISA", "KINGDOM OF SAUDI", "KSA", "MOFA", "KEDUTAAN", "EMBASSY", "R.S.A"];
const ID_CARD_KEYWORDS: &[&str] = &[
    "PROVINSI", "KABUPATEN", "KECAMATAN", "KELURAHAN", "NIK", "RT/RW", "BERLAKU HINGGA",
    "KARTU TANDA PENDUDUK",
];
const PASSPORT_KEYWORDS: &[&str] = &[
    "PASSPORT", "PASPOR", "DATE OF ISSUE", "DATE OF EXPIRY", "REPUBLIC OF INDONESIA",
    "TANGGAL HABIS BERLAKU", "IMIGRASI",
];

static NUMBER_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(?:NO|NUMBER)\b").unwrap());
static MRZ_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Z]{2}<[A-Z]+<<").unwrap());
static SIXTEEN_DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{16}").unwrap());
static LETTER_SEVEN_DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Z]\d{7}").unwrap());

/// Decide the document type from a caller hint, an engine hint and the
/// text layout, in that order of trust.
pub fn classify(
    text: &str,
    caller_hint: Option<DocumentType>,
    engine_hint: Option<DocumentType>,
) -> Classification {
    if let Some(hinted) = caller_hint {
        return Classification::new(hinted, 1.0);
    }

    match (engine_hint, infer_layout(text)) {
        (Some(engine), Some((layout, confidence))) if engine == layout => {
            Classification::new(layout, confidence.max(0.9))
        }
        (Some(_), Some((layout, _))) => Classification::new(layout, AMBIGUOUS_THRESHOLD),
        (Some(engine), None) => Classification::new(engine, 0.7),
        (None, Some((layout, confidence))) => Classification::new(layout, confidence),
        (None, None) => Classification::new(DocumentType::IdentityCard, 0.2),
    }
}

/// Keyword and pattern evidence, strongest first.
fn infer_layout(text: &str) -> Option<(DocumentType, f32)> {
    let upper = text.to_uppercase();
    let hits = |keywords: &[&str]| keywords.iter().filter(|kw| upper.contains(*kw)).count();

    if upper.contains("VISA") && (upper.contains("SAUDI") || NUMBER_WORD.is_match(&upper)) {
        return Some((DocumentType::Visa, 0.9));
    }
    if hits(VISA_KEYWORDS) >= 2 {
        return Some((DocumentType::Visa, 0.9));
    }
    if hits(ID_CARD_KEYWORDS) >= 2 {
        return Some((DocumentType::IdentityCard, 0.9));
    }
    if hits(PASSPORT_KEYWORDS) >= 2 {
        return Some((DocumentType::Passport, 0.9));
    }
    if upper.contains("P<") {
        return Some((DocumentType::Passport, 0.85));
    }
    if upper.contains("V<") {
        return Some((DocumentType::Visa, 0.85));
    }
    if upper.contains("<<<") || MRZ_NAME.is_match(&upper) {
        if upper.contains("SAUDI") || upper.contains("ARABIA") {
            return Some((DocumentType::Visa, 0.6));
        }
        return Some((DocumentType::Passport, 0.6));
    }
    if SIXTEEN_DIGITS.is_match(text) {
        return Some((DocumentType::IdentityCard, 0.6));
    }
    if LETTER_SEVEN_DIGITS.is_match(&upper) {
        return Some((DocumentType::Passport, AMBIGUOUS_THRESHOLD));
    }
    None
}

// ═══════════════════════════════════════════════════════════
// Record assembly
// ═══════════════════════════════════════════════════════════

/// Build a `ParsedRecord` from one successful extraction.
pub fn parse_extraction(
    result: &ExtractionResult,
    caller_hint: Option<DocumentType>,
    job_id: Uuid,
    document_hash: &str,
) -> ParsedRecord {
    let classification = classify(&result.text, caller_hint, result.document_hint);

    let mut record = ParsedRecord {
        record_id: Uuid::new_v4(),
        job_id,
        document_hash: document_hash.to_string(),
        document_type: classification.document_type,
        classification_confidence: classification.confidence,
        engine: result.engine,
        fields: BTreeMap::new(),
        parse_issues: Vec::new(),
    };

    for (field, value) in &result.fields {
        record.offer(
            *field,
            FieldValue::new(value.trim(), result.confidence_for(*field), FieldSource::EngineStructured),
        );
    }

    parser_for(classification.document_type).parse(&result.text, &mut record);

    if classification.ambiguous {
        record.parse_issues.push(ValidationIssue::warning(
            None,
            IssueCode::ClassificationAmbiguous,
            format!(
                "document classified as {} with confidence {:.2}",
                classification.document_type, classification.confidence
            ),
        ));
    }

    tracing::debug!(
        record_id = %record.record_id,
        document_type = %record.document_type,
        fields = record.fields.len(),
        "Parsed extraction"
    );

    let record_id = record.record_id;
    record.parse_issues = record
        .parse_issues
        .into_iter()
        .map(|issue| issue.for_record(record_id))
        .collect();
    record
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{EngineKind, Field};
    use crate::pipeline::extraction::VariantKind;

    pub(crate) fn empty_record(document_type: DocumentType) -> ParsedRecord {
        ParsedRecord {
            record_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            document_hash: "hash".into(),
            document_type,
            classification_confidence: 1.0,
            engine: EngineKind::Tesseract,
            fields: BTreeMap::new(),
            parse_issues: Vec::new(),
        }
    }

    fn result(text: &str) -> ExtractionResult {
        ExtractionResult {
            engine: EngineKind::Tesseract,
            variant: VariantKind::Original,
            text: text.into(),
            fields: BTreeMap::new(),
            field_confidence: BTreeMap::new(),
            document_hint: None,
            confidence: 0.8,
            elapsed_ms: 5,
        }
    }

    #[test]
    fn caller_hint_wins() {
        let c = classify("PROVINSI JAWA\nNIK 3318012345678901", Some(DocumentType::Visa), None);
        assert_eq!(c.document_type, DocumentType::Visa);
        assert_eq!(c.confidence, 1.0);
        assert!(!c.ambiguous);
    }

    #[test]
    fn keyword_classification() {
        let ktp = classify("PROVINSI JAWA TENGAH\nNIK : 3318012345678901", None, None);
        assert_eq!(ktp.document_type, DocumentType::IdentityCard);
        assert!(!ktp.ambiguous);

        let visa = classify("EMBASSY OF JAPAN\nVISA\nVisa No: VA12345678", None, None);
        assert_eq!(visa.document_type, DocumentType::Visa);

        let passport = classify("PASPOR / PASSPORT\nDate of Expiry 01 JAN 2030", None, None);
        assert_eq!(passport.document_type, DocumentType::Passport);

        let mrz = classify("P<IDNSANTOSO<<BUDI<<<<<<", None, None);
        assert_eq!(mrz.document_type, DocumentType::Passport);
    }

    #[test]
    fn engine_hint_agreement_and_disagreement() {
        let text = "PROVINSI JAWA TENGAH\nKABUPATEN PATI";
        let agree = classify(text, None, Some(DocumentType::IdentityCard));
        assert_eq!(agree.confidence, 0.9);

        let disagree = classify(text, None, Some(DocumentType::Passport));
        assert_eq!(disagree.document_type, DocumentType::IdentityCard);
        assert!(disagree.ambiguous);

        let engine_only = classify("smudged", None, Some(DocumentType::Passport));
        assert_eq!(engine_only.document_type, DocumentType::Passport);
        assert!(!engine_only.ambiguous);
    }

    #[test]
    fn no_evidence_is_ambiguous() {
        let c = classify("illegible scan", None, None);
        assert!(c.ambiguous);
        assert!(c.confidence <= AMBIGUOUS_THRESHOLD);

        let weak = classify("ref B1234567", None, None);
        assert_eq!(weak.document_type, DocumentType::Passport);
        assert!(weak.ambiguous);
    }

    #[test]
    fn structured_fields_compete_with_text() {
        let mut r = result("PROVINSI JAWA TENGAH\nNIK : 3318012345678901\nNama : BUDI SANTOS");
        r.fields.insert(Field::FullName, " BUDI SANTOSO ".into());
        r.field_confidence.insert(Field::FullName, 0.95);

        let record = parse_extraction(&r, None, Uuid::new_v4(), "h1");
        assert_eq!(record.document_type, DocumentType::IdentityCard);
        assert_eq!(record.value(Field::FullName), Some("BUDI SANTOSO"));
        assert_eq!(record.fields[&Field::FullName].source, FieldSource::EngineStructured);
        assert_eq!(record.value(Field::NationalId), Some("3318012345678901"));
        assert_eq!(record.document_hash, "h1");
    }

    #[test]
    fn ambiguous_classification_is_flagged() {
        let record = parse_extraction(&result("blurry"), None, Uuid::new_v4(), "h2");
        let issue = record
            .parse_issues
            .iter()
            .find(|i| i.code == IssueCode::ClassificationAmbiguous)
            .unwrap();
        assert_eq!(issue.record_id, Some(record.record_id));
        assert!(!issue.is_error());
    }
}
