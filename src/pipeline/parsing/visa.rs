//! Visa parser: visa number from its label, holder identity from the
//! machine-readable block or the printed passport fields.

use std::sync::LazyLock;

use regex::Regex;

use super::common::{date_near, letters_only, VISUAL_CONFIDENCE};
use super::mrz::find_mrz;
use super::passport::{extract_expiry, extract_name, extract_passport_number, offer_mrz};
use super::DocumentParser;
use crate::models::{DocumentType, Field, FieldSource, FieldValue, ParsedRecord};

static VISA_LABELLED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Visa\s*(?:No\.?|Number)?[:\s]*([A-Z0-9]{8,20})\b").unwrap()
});
static VISA_BARE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z]{2}\d{4}[A-Z]+\d+)\b").unwrap());
static VISA_ISSUER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:Issuing\s*Post|Place\s*of\s*Issue|Issued\s*(?:at|by)|Embassy\s*of)[:\s]+([A-Za-z][A-Za-z\s]+)")
        .unwrap()
});

pub struct VisaParser;

impl DocumentParser for VisaParser {
    fn document_type(&self) -> DocumentType {
        DocumentType::Visa
    }

    fn parse(&self, text: &str, record: &mut ParsedRecord) {
        if let Some(mrz) = find_mrz(text) {
            offer_mrz(record, &mrz, Field::PassportNumber);
        }

        let visual = |value: String| FieldValue::new(value, VISUAL_CONFIDENCE, FieldSource::VisualText);

        if let Some(number) = extract_visa_number(text) {
            record.offer(Field::VisaNumber, visual(number));
        }
        if let Some(number) = extract_passport_number(text) {
            record.offer(Field::PassportNumber, visual(number));
        }
        if let Some(name) = extract_name(text) {
            record.offer(Field::FullName, visual(name));
        }
        if let Some(dob) = date_near(text, &["DATE OF BIRTH", "TGL LAHIR", "BIRTH"]) {
            record.offer(Field::DateOfBirth, visual(dob));
        }
        if let Some(issued) = date_near(text, &["DATE OF ISSUE", "ISSUED", "TGL PENGELUARAN"]) {
            record.offer(Field::IssueDate, visual(issued));
        }
        if let Some(issuer) = extract_visa_issuer(text) {
            record.offer(Field::VisaIssuer, visual(issuer));
        }
        let expiry = date_near(text, &["VALID UNTIL", "EXPIRY", "EXPIRES"]).or_else(|| extract_expiry(text));
        if let Some(expiry) = expiry {
            record.offer(Field::ExpiryDate, visual(expiry));
        }
    }
}

/// Visa number by label; otherwise the `AB1234CD567` shape.
pub fn extract_visa_number(text: &str) -> Option<String> {
    let labelled = text
        .lines()
        .filter(|line| !line.contains('<'))
        .filter_map(|line| VISA_LABELLED.captures(line))
        .map(|m| m[1].to_uppercase())
        .find(|n| n.chars().any(|c| c.is_ascii_digit()));
    labelled.or_else(|| VISA_BARE.captures(text).map(|m| m[1].to_string()))
}

/// Embassy or issuing post named on the visa.
pub fn extract_visa_issuer(text: &str) -> Option<String> {
    text.lines()
        .filter_map(|line| VISA_ISSUER.captures(line))
        .find_map(|m| letters_only(&m[1], 3, &[]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::parsing::tests::empty_record;

    #[test]
    fn labelled_visa_fields() {
        let text = "VISA\nVisa No: VA12345678\nPassport No: B1234567\nFull Name\nBUDI SANTOSO\n\
                    Date of Issue 02-01-2024\nValid Until 02-01-2025\nIssuing Post: TOKYO";
        let mut record = empty_record(DocumentType::Visa);
        VisaParser.parse(text, &mut record);

        assert_eq!(record.value(Field::VisaNumber), Some("VA12345678"));
        assert_eq!(record.value(Field::PassportNumber), Some("B1234567"));
        assert_eq!(record.value(Field::FullName), Some("BUDI SANTOSO"));
        assert_eq!(record.value(Field::IssueDate), Some("02-01-2024"));
        assert_eq!(record.value(Field::ExpiryDate), Some("02-01-2025"));
        assert_eq!(record.value(Field::VisaIssuer), Some("TOKYO"));
        assert!(record
            .fields
            .values()
            .all(|v| v.source == FieldSource::VisualText));
    }

    #[test]
    fn bare_visa_number_shape() {
        assert_eq!(
            extract_visa_number("ENTRY PERMIT\nAB1234CD567\n").as_deref(),
            Some("AB1234CD567")
        );
        assert_eq!(extract_visa_number("nothing here"), None);
    }

    #[test]
    fn issuer_from_embassy_line() {
        assert_eq!(
            extract_visa_issuer("Embassy of Japan in Jakarta").as_deref(),
            Some("JAPAN IN JAKARTA")
        );
        assert_eq!(extract_visa_issuer("Date of Issue 02-01-2024"), None);
    }

    #[test]
    fn visa_heading_alone_is_not_a_number() {
        assert_eq!(extract_visa_number("VISA ENTRYPERMIT"), None);
    }
}
