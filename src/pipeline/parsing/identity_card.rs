//! Indonesian identity card (KTP) parser.
//!
//! Phone photos of cards give noisy OCR: labels are often misread, values
//! drift onto the next line, and digits in the national id pick up letters.

use std::sync::LazyLock;

use regex::Regex;

use super::common::{
    after_label, collapse_whitespace, contains_any, date_near, fix_ocr_digits, letters_only,
    name_candidate, VISUAL_CONFIDENCE,
};
use super::DocumentParser;
use crate::models::{DocumentType, Field, FieldSource, FieldValue, ParsedRecord};

/// Digits recovered only after OCR repair.
const REPAIRED_CONFIDENCE: f32 = 0.5;
/// Name guessed from layout rather than a label.
const GUESSED_NAME_CONFIDENCE: f32 = 0.4;

static NIK_DIRECT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(\d{16})\b").unwrap());
static NIK_LABELLED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)NIK[:\s=]*([0-9OoIlLDSBZz?|\-)(]{14,22})").unwrap()
});
static DIGIT_LIKE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9OoIlLDSBZz?|]{16,22}").unwrap());

static NAME_LABEL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^\s*Nama\b").unwrap());
static UPPERCASE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Z][A-Z\s.']{3,}").unwrap());

static BIRTH_PLACE_LABELLED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:Tempat|Place|Tempa)[/\s]*(?:Tgl|Tanggal|Tg)?[/\s]*(?:Lahir|Late|Lahr)[:\s]*([A-Za-z\s]+?)\s*[,\s]+\d").unwrap()
});
static BIRTH_PLACE_LOOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[:\s]+([A-Za-z\s]+?)\s*[,\s]+\d").unwrap());

static ADDRESS_LABEL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^\s*Alamat\b").unwrap());
static ADDRESS_NOISY_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(?:a?lamat|alam|lama)\w*").unwrap());
static ADDRESS_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(?:DUKUH|DESA|JL\b|JL\.|JALAN|DSN|DUSUN)").unwrap());

static PROVINCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^PROVINSI\s+(.+)").unwrap());
static REGENCY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:KABUPATEN|KOTA)\s+(.+)").unwrap());
static DISTRICT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Kecamatan\w*\s*[:\s]+([A-Za-z\s]+)").unwrap());
static VILLAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:Kel|Kal|Col)[/\s]*(?:Desa|Des|Dess|Dese|de)\w*\s*[:\s=]+([A-Za-z\s]+)").unwrap()
});

static RT_RW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)RT\s*/?\s*RW\s*[:\s]*([0-9OoIlDS]{1,3}\s*/\s*[0-9OoIlDS]{1,3})").unwrap()
});
static RELIGION_LABEL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^\s*Agama\b").unwrap());
static MARITAL_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*Status(?:\s*Perkawinan|\s*Pernikahan)?\b").unwrap()
});
static OCCUPATION_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*Pekerjaan\b").unwrap());

const LAYOUT_SKIP_WORDS: &[&str] = &[
    "PROVINSI", "KABUPATEN", "KOTA", "NIK", "LAKI", "PEREMPUAN", "AGAMA", "ALAMAT", "TEMPAT",
    "LAHIR", "KELAMIN", "KAWIN", "PEKERJAAN", "KEWARGANEGARAAN", "BERLAKU",
];

pub struct IdentityCardParser;

impl DocumentParser for IdentityCardParser {
    fn document_type(&self) -> DocumentType {
        DocumentType::IdentityCard
    }

    fn parse(&self, text: &str, record: &mut ParsedRecord) {
        let visual = |value: String| FieldValue::new(value, VISUAL_CONFIDENCE, FieldSource::VisualText);

        if let Some((nik, confidence)) = extract_national_id(text) {
            record.offer(Field::NationalId, FieldValue::new(nik, confidence, FieldSource::VisualText));
        }
        if let Some((name, confidence)) = extract_name(text) {
            record.offer(Field::FullName, FieldValue::new(name, confidence, FieldSource::VisualText));
        }
        if let Some(place) = extract_place_of_birth(text) {
            record.offer(Field::PlaceOfBirth, visual(place));
        }
        if let Some(dob) = date_near(text, &["LAHIR", "LAHR", "LATE"]) {
            record.offer(Field::DateOfBirth, visual(dob));
        }
        if let Some(address) = extract_address(text) {
            record.offer(Field::Address, visual(address));
        }
        for (field, value) in extract_regions(text) {
            record.offer(field, visual(value));
        }
        if let Some(sex) = extract_sex(text) {
            record.offer(Field::Sex, visual(sex.to_string()));
        }
        if let Some(nationality) = extract_nationality(text) {
            record.offer(Field::Nationality, visual(nationality.to_string()));
        }
        if let Some(rt_rw) = RT_RW.captures(text) {
            record.offer(Field::RtRw, visual(rt_rw[1].to_string()));
        }
        let labelled = [
            (Field::Religion, &*RELIGION_LABEL),
            (Field::MaritalStatus, &*MARITAL_LABEL),
            (Field::Occupation, &*OCCUPATION_LABEL),
        ];
        for (field, label) in labelled {
            if let Some(value) = labelled_value(text, label) {
                record.offer(field, visual(value));
            }
        }
        if let Some(expiry) = date_near(text, &["BERLAKU HINGGA", "BERLAKU"]) {
            record.offer(Field::ExpiryDate, visual(expiry));
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Field extractors
// ═══════════════════════════════════════════════════════════

/// 16-digit national id: verbatim, after the `NIK` label, or any digit-like run.
pub fn extract_national_id(text: &str) -> Option<(String, f32)> {
    let flat = collapse_whitespace(text);

    if let Some(m) = NIK_DIRECT.captures(&flat) {
        return Some((m[1].to_string(), VISUAL_CONFIDENCE));
    }

    let repaired = |raw: &str| {
        let digits: String = fix_ocr_digits(raw).chars().filter(char::is_ascii_digit).collect();
        (digits.len() >= 16).then(|| digits[..16].to_string())
    };

    if let Some(nik) = NIK_LABELLED.captures(&flat).and_then(|m| repaired(&m[1])) {
        return Some((nik, REPAIRED_CONFIDENCE));
    }
    DIGIT_LIKE_RUN
        .find_iter(&flat)
        .filter(|m| m.as_str().chars().filter(char::is_ascii_digit).count() >= 10)
        .find_map(|m| repaired(m.as_str()))
        .map(|nik| (nik, REPAIRED_CONFIDENCE))
}

/// Name after the `Nama` label (same or next line), else the longest
/// uppercase run in the top of the card.
pub fn extract_name(text: &str) -> Option<(String, f32)> {
    let lines: Vec<&str> = text.lines().collect();

    for (i, line) in lines.iter().enumerate() {
        let Some(rest) = after_label(line, &NAME_LABEL) else {
            continue;
        };
        if let Some(name) = name_candidate(rest) {
            return Some((name, VISUAL_CONFIDENCE));
        }
        if let Some(name) = lines.get(i + 1).and_then(|next| name_candidate(next)) {
            return Some((name, VISUAL_CONFIDENCE));
        }
    }

    let top = &lines[..(lines.len() / 2 + 5).min(lines.len())];
    top.iter()
        .map(|line| line.trim())
        .filter(|line| line.len() >= 4 && !contains_any(line, LAYOUT_SKIP_WORDS))
        .flat_map(|line| UPPERCASE_RUN.find_iter(line).map(|m| m.as_str()))
        .filter_map(name_candidate)
        .max_by_key(|name| name.len())
        .map(|name| (name, GUESSED_NAME_CONFIDENCE))
}

pub fn extract_place_of_birth(text: &str) -> Option<String> {
    text.lines()
        .filter(|line| contains_any(line, &["LAHIR", "LATE", "LAHR"]))
        .find_map(|line| {
            [&*BIRTH_PLACE_LABELLED, &*BIRTH_PLACE_LOOSE]
                .iter()
                .filter_map(|re| re.captures(line))
                .find_map(|m| letters_only(&m[1], 2, &["TEMPAT", "LAHIR", "TGL"]))
        })
}

pub fn extract_address(text: &str) -> Option<String> {
    for line in text.lines() {
        if let Some(rest) = after_label(line, &ADDRESS_LABEL) {
            if !rest.is_empty() {
                return Some(collapse_whitespace(rest));
            }
        }
        if let Some(rest) = after_label(line, &ADDRESS_NOISY_LABEL) {
            if rest.len() >= 3 {
                return Some(collapse_whitespace(rest));
            }
        }
        if ADDRESS_START.is_match(line) {
            return Some(collapse_whitespace(line));
        }
    }
    None
}

/// Province and regency from the card header, district and village from
/// their labelled lines.
pub fn extract_regions(text: &str) -> Vec<(Field, String)> {
    let mut found: Vec<(Field, String)> = Vec::new();
    let mut take = |field: Field, raw: &str, min_len: usize| {
        if found.iter().any(|(f, _)| *f == field) {
            return false;
        }
        match letters_only(raw, min_len, &[]) {
            Some(value) => {
                found.push((field, value));
                true
            }
            None => false,
        }
    };

    for line in text.lines() {
        let line = line.trim();
        let upper = line.to_uppercase();

        if let Some(m) = PROVINCE.captures(&upper) {
            if take(Field::Province, &m[1], 3) {
                continue;
            }
        }
        if let Some(m) = REGENCY.captures(&upper) {
            if take(Field::Regency, &m[1], 2) {
                continue;
            }
        }
        if let Some(m) = DISTRICT.captures(line) {
            if take(Field::District, &m[1], 2) {
                continue;
            }
        }
        if let Some(m) = VILLAGE.captures(line) {
            take(Field::Village, &m[1], 2);
        }
    }
    found
}

/// Text after the first line starting with `label`, when there is any.
pub fn labelled_value(text: &str, label: &Regex) -> Option<String> {
    text.lines()
        .filter_map(|line| after_label(line, label))
        .find(|rest| rest.chars().any(char::is_alphanumeric))
        .map(collapse_whitespace)
}

pub fn extract_sex(text: &str) -> Option<&'static str> {
    let upper = text.to_uppercase();
    if upper.contains("PEREMPUAN") {
        Some("PEREMPUAN")
    } else if upper.contains("LAKI") {
        Some("LAKI-LAKI")
    } else {
        None
    }
}

pub fn extract_nationality(text: &str) -> Option<&'static str> {
    text.lines()
        .filter(|line| contains_any(line, &["KEWARGANEGARAAN", "WARGA"]))
        .find_map(|line| {
            let upper = line.to_uppercase();
            if upper.contains("WNI") {
                Some("WNI")
            } else if upper.contains("WNA") {
                Some("WNA")
            } else {
                None
            }
        })
}
