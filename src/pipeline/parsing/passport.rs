//! Passport parser: machine-readable block first, printed labels second.
//!
//! Block values whose check digits verify outrank everything else; values
//! from a failing block are kept with degraded confidence and flagged.

use std::sync::LazyLock;

use regex::Regex;

use super::common::{contains_any, date_near, letters_only, name_candidate, VISUAL_CONFIDENCE};
use super::mrz::{find_mrz, Checked, MrzData};
use super::DocumentParser;
use crate::models::{
    DocumentType, Field, FieldSource, FieldValue, IssueCode, ParsedRecord, ValidationIssue,
};

/// Block value whose check digit verified.
pub const MRZ_VALID_CONFIDENCE: f32 = 0.98;
/// Block value whose check digit failed.
pub const MRZ_INVALID_CONFIDENCE: f32 = 0.35;

static NUMBER_LABELLED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:Passport|Paspor)\s*(?:No\.?|Number)?[:\s]*([A-Z]\d{6,8})\b").unwrap()
});
static NUMBER_BARE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b([A-Z]\d{7})\b").unwrap());

static FULL_NAME_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:(?:Nama\s*Lengkap|Full\s*Name)[:\s/]*)+").unwrap()
});
static GIVEN_NAMES_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:(?:Given\s*Names?|Nama\s*Depan)[:\s/]*)+").unwrap()
});
static SURNAME_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:(?:Surname|Nama\s*Keluarga)[:\s/]*)+").unwrap()
});

static BIRTH_PLACE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:TEMPAT\s*LAHIR|PLACE\s*OF\s*BIRTH)[:\s/|]*([A-Za-z\s]{2,})").unwrap()
});
static ISSUING_OFFICE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:MENGELUARKAN|ISSUING\s*OFFICE)\s*[:\s/|]+\s*([A-Za-z\s]{2,})").unwrap()
});

const PLACE_BLACKLIST: &[&str] = &[
    "KELAMIN", "SEX", "PASPOR", "PASSPORT", "TYPE", "CODE", "PENGELUARAN", "ISSUE",
    "NATIONALITY", "KEWARGANEGARAAN", "HABIS", "BERLAKU", "EXPIRY", "NAMA", "NAME", "FULL",
    "TGL", "DATE", "KANTOR", "OFFICE", "REG", "PLACE", "BIRTH", "TEMPAT", "LAHIR",
];

const OFFICE_BLACKLIST: &[&str] = &[
    "YANG", "MENGELUARKAN", "ISSUING", "OFFICE", "KANTOR", "PASSPORT", "PASPOR", "TYPE", "CODE",
    "DATE", "TGL",
];

pub struct PassportParser;

impl DocumentParser for PassportParser {
    fn document_type(&self) -> DocumentType {
        DocumentType::Passport
    }

    fn parse(&self, text: &str, record: &mut ParsedRecord) {
        if let Some(mrz) = find_mrz(text) {
            offer_mrz(record, &mrz, Field::PassportNumber);
        }

        let visual = |value: String| FieldValue::new(value, VISUAL_CONFIDENCE, FieldSource::VisualText);

        if let Some(number) = extract_passport_number(text) {
            record.offer(Field::PassportNumber, visual(number));
        }
        if let Some(name) = extract_name(text) {
            record.offer(Field::FullName, visual(name));
        }
        if let Some(place) = extract_place_of_birth(text) {
            record.offer(Field::PlaceOfBirth, visual(place));
        }
        let birth = date_near(text, &["TGL. LAHIR", "TGL LAHIR", "TGL.LAHIR", "DATE OF BIRTH"])
            .or_else(|| date_near(text, &["LAHIR", "BIRTH"]));
        if let Some(dob) = birth {
            record.offer(Field::DateOfBirth, visual(dob));
        }
        if let Some(issued) = date_near(text, &["TGL. PENGELUARAN", "TGL PENGELUARAN", "DATE OF ISSUE"]) {
            record.offer(Field::IssueDate, visual(issued));
        }
        if let Some(expiry) = extract_expiry(text) {
            record.offer(Field::ExpiryDate, visual(expiry));
        }
        if let Some(office) = extract_issuing_office(text) {
            record.offer(Field::IssuingOffice, visual(office));
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Machine-readable block
// ═══════════════════════════════════════════════════════════

/// Offer every decoded block field, flagging failed check digits.
/// `number_field` is where the block's document number lands.
pub fn offer_mrz(record: &mut ParsedRecord, mrz: &MrzData, number_field: Field) {
    let block_valid = mrz.all_valid();
    let block_confidence = if block_valid {
        MRZ_VALID_CONFIDENCE
    } else {
        MRZ_INVALID_CONFIDENCE
    };

    if let Some(name) = mrz.full_name() {
        let confidence = if is_suspicious_name(&name) {
            MRZ_INVALID_CONFIDENCE
        } else {
            block_confidence
        };
        record.offer(Field::FullName, FieldValue::new(name, confidence, FieldSource::Mrz));
    }

    let checked = [
        (number_field, &mrz.document_number),
        (Field::DateOfBirth, &mrz.birth_date),
        (Field::ExpiryDate, &mrz.expiry_date),
    ];
    for (field, value) in checked {
        if let Some(Checked { value, valid }) = value {
            let confidence = if *valid {
                MRZ_VALID_CONFIDENCE
            } else {
                record.parse_issues.push(ValidationIssue::warning(
                    Some(field),
                    IssueCode::MrzChecksum,
                    format!("machine-readable check digit failed for {field}"),
                ));
                MRZ_INVALID_CONFIDENCE
            };
            record.offer(field, FieldValue::new(value.clone(), confidence, FieldSource::Mrz));
        }
    }

    if let Some(sex) = mrz.sex {
        record.offer(Field::Sex, FieldValue::new(sex.to_string(), block_confidence, FieldSource::Mrz));
    }
    if let Some(nationality) = &mrz.nationality {
        record.offer(
            Field::Nationality,
            FieldValue::new(nationality.clone(), block_confidence, FieldSource::Mrz),
        );
    }

    if !mrz.composite_valid {
        record.parse_issues.push(ValidationIssue::warning(
            None,
            IssueCode::MrzChecksum,
            "machine-readable composite check digit failed",
        ));
    }
}

/// Names that lost their `<<` separator or picked up filler noise.
fn is_suspicious_name(name: &str) -> bool {
    let chars: Vec<char> = name.chars().collect();
    !name.contains(' ') || chars.windows(3).any(|w| w[0] == w[1] && w[1] == w[2])
}

// ═══════════════════════════════════════════════════════════
// Printed fields
// ═══════════════════════════════════════════════════════════

pub fn extract_passport_number(text: &str) -> Option<String> {
    if let Some(m) = NUMBER_LABELLED.captures(text) {
        return Some(m[1].to_uppercase());
    }
    text.lines()
        .filter(|line| !line.contains('<'))
        .find_map(|line| NUMBER_BARE.captures(line).map(|m| m[1].to_string()))
}

/// Name from a `Full Name` / `Nama Lengkap` label, else `Given Names` and
/// `Surname` joined in that order. Values may sit on the label line or the
/// line below it.
pub fn extract_name(text: &str) -> Option<String> {
    if let Some(name) = labelled_name(text, &FULL_NAME_LABEL) {
        return Some(name);
    }
    let given = labelled_name(text, &GIVEN_NAMES_LABEL);
    let surname = labelled_name(text, &SURNAME_LABEL);
    match (given, surname) {
        (Some(given), Some(surname)) => name_candidate(&format!("{given} {surname}")),
        (given, surname) => given.or(surname),
    }
}

fn labelled_name(text: &str, label: &Regex) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    lines.iter().enumerate().find_map(|(i, line)| {
        let found = label.find(line)?;
        name_candidate(&line[found.end()..]).or_else(|| {
            lines
                .get(i + 1)
                .filter(|next| !is_name_label(next))
                .and_then(|next| name_candidate(next))
        })
    })
}

fn is_name_label(line: &str) -> bool {
    [&*FULL_NAME_LABEL, &*GIVEN_NAMES_LABEL, &*SURNAME_LABEL]
        .iter()
        .any(|label| label.is_match(line))
}

pub fn extract_place_of_birth(text: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        if !contains_any(line, &["TEMPAT LAHIR", "PLACE OF BIRTH"]) {
            continue;
        }
        let same_line = BIRTH_PLACE
            .captures(line)
            .and_then(|m| letters_only(&m[1], 2, PLACE_BLACKLIST));
        if same_line.is_some() {
            return same_line;
        }
        if let Some(place) = lines.get(i + 1).and_then(|next| letters_only(next, 2, PLACE_BLACKLIST)) {
            return Some(place);
        }
    }
    None
}

/// Expiry by its label; a bare `BERLAKU` line also counts, except the
/// identity-card `BERLAKU HINGGA`.
pub fn extract_expiry(text: &str) -> Option<String> {
    date_near(text, &["TGL. HABIS BERLAKU", "TGL HABIS", "DATE OF EXPIRY"]).or_else(|| {
        text.lines()
            .filter(|line| contains_any(line, &["BERLAKU"]) && !contains_any(line, &["HINGGA"]))
            .find_map(super::common::date_in)
    })
}

/// Issuing office: usually on the line under its label.
pub fn extract_issuing_office(text: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        if !contains_any(line, &["KANTOR", "ISSUING OFFICE", "MENGELUARKAN"]) {
            continue;
        }
        if let Some(office) = lines.get(i + 1).and_then(|next| letters_only(next, 2, OFFICE_BLACKLIST)) {
            return Some(office);
        }
        if let Some(office) = ISSUING_OFFICE
            .captures(line)
            .and_then(|m| letters_only(&m[1], 2, OFFICE_BLACKLIST))
        {
            return Some(office);
        }
    }
    None
}
