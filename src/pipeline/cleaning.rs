//! Field normalization between parsing and validation.
//!
//! Every transform is pure and idempotent: cleaning a clean value returns
//! it unchanged. A value that cleans to nothing removes the field.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;

use crate::models::{Field, ParsedRecord};
use crate::pipeline::parsing::common::{collapse_whitespace, fix_ocr_digits, ocr_digit, ocr_letter};

/// Label words that mark a "name" as header text read by mistake.
const NAME_BLACKLIST: &[&str] = &[
    "PROVINSI", "KABUPATEN", "JAWA", "NIK", "LAKI-LAKI", "PEREMPUAN", "AGAMA", "KAWIN",
    "GOL DARAH", "PARTAI", "KARTU", "PENDUDUK",
];

const MONTHS: &[(&str, u32)] = &[
    ("JAN", 1), ("FEB", 2), ("PEB", 2), ("MAR", 3), ("APR", 4), ("MEI", 5), ("MAY", 5),
    ("JUN", 6), ("JUL", 7), ("AGU", 8), ("AGT", 8), ("AUG", 8), ("SEP", 9), ("OKT", 10),
    ("OCT", 10), ("NOV", 11), ("NOP", 11), ("DES", 12), ("DEC", 12),
];

const MIN_YEAR: i32 = 1900;
const MAX_YEAR: i32 = 2040;

static TEXT_MONTH_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,2})[\s\-.,]*([A-Z]{3,})[\s\-.,]*(\d{4})").unwrap());
static NUMBERS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

/// Replace accented Latin letters with their ASCII base letter.
pub fn fold_diacritics(s: &str) -> String {
    s.chars().map(fold_char).collect()
}

fn fold_char(c: char) -> char {
    match c {
        'À'..='Å' => 'A',
        'à'..='å' => 'a',
        'Ç' => 'C',
        'ç' => 'c',
        'È'..='Ë' => 'E',
        'è'..='ë' => 'e',
        'Ì'..='Ï' => 'I',
        'ì'..='ï' => 'i',
        'Ñ' => 'N',
        'ñ' => 'n',
        'Ò'..='Ö' | 'Ø' => 'O',
        'ò'..='ö' | 'ø' => 'o',
        'Ù'..='Ü' => 'U',
        'ù'..='ü' => 'u',
        'Ý' => 'Y',
        'ý' | 'ÿ' => 'y',
        'ß' => 's',
        other => other,
    }
}

/// Clean every field of a record; fields that clean to nothing are dropped.
pub fn clean_record(mut record: ParsedRecord) -> ParsedRecord {
    record.fields = std::mem::take(&mut record.fields)
        .into_iter()
        .filter_map(|(field, mut value)| {
            value.value = clean_field(field, &value.value)?;
            Some((field, value))
        })
        .collect();
    record
}

pub fn clean_field(field: Field, raw: &str) -> Option<String> {
    let cleaned = match field {
        Field::FullName | Field::FatherName => clean_name(raw),
        Field::NationalId => clean_national_id(raw),
        Field::PassportNumber => clean_passport_number(raw),
        Field::VisaNumber => clean_alphanumeric(raw),
        Field::Sex => clean_sex(raw),
        Field::RtRw => clean_rt_rw(raw),
        Field::MaritalStatus => clean_marital_status(raw),
        Field::PhoneNumber => clean_phone_number(raw),
        f if f.is_date() => clean_date(raw),
        _ => clean_text(raw),
    };
    cleaned.filter(|v| !v.is_empty())
}

// ═══════════════════════════════════════════════════════════
// Names and free text
// ═══════════════════════════════════════════════════════════

pub fn clean_name(raw: &str) -> Option<String> {
    let upper = fold_diacritics(raw).to_uppercase();
    let kept: String = upper
        .chars()
        .map(|c| {
            if c.is_ascii_uppercase() || c == '\'' || c == '-' {
                c
            } else {
                ' '
            }
        })
        .collect();

    let mut name = collapse_whitespace(&kept);
    loop {
        let next = strip_artefacts(&name);
        if next == name {
            break;
        }
        name = next;
    }

    if name.len() < 3 || has_blacklisted_word(&name) {
        return None;
    }
    Some(name)
}

/// One round of OCR artefact removal: `DN`/`IDN` prefixes, a trailing
/// `SE`, and dangling hyphens or apostrophes.
fn strip_artefacts(name: &str) -> String {
    let mut s = name.trim_matches(|c: char| c == '-' || c == '\'' || c == ' ');
    for prefix in ["IDN ", "DN "] {
        if let Some(rest) = s.strip_prefix(prefix) {
            s = rest;
        }
    }
    if let Some(rest) = s.strip_suffix(" SE") {
        s = rest;
    }
    collapse_whitespace(s)
}

fn has_blacklisted_word(name: &str) -> bool {
    NAME_BLACKLIST.iter().any(|label| {
        if label.contains(' ') {
            name.contains(label)
        } else {
            name.split(' ').any(|token| token == *label)
        }
    })
}

fn clean_text(raw: &str) -> Option<String> {
    let upper = fold_diacritics(raw).to_uppercase();
    let trimmed = collapse_whitespace(&upper);
    Some(
        trimmed
            .trim_matches(|c: char| c == ',' || c == ':' || c == ';' || c == '.' || c == '-' || c == ' ')
            .to_string(),
    )
}

// ═══════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════

fn clean_national_id(raw: &str) -> Option<String> {
    Some(fix_ocr_digits(raw).chars().filter(char::is_ascii_digit).collect())
}

/// Letter then digits: the first character is forced to a letter, the
/// rest to digits.
fn clean_passport_number(raw: &str) -> Option<String> {
    let compact: Vec<char> = raw
        .to_uppercase()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect();
    let (first, rest) = compact.split_first()?;
    Some(
        std::iter::once(ocr_letter(*first))
            .chain(rest.iter().map(|c| ocr_digit(*c)))
            .collect(),
    )
}

fn clean_alphanumeric(raw: &str) -> Option<String> {
    Some(
        raw.to_uppercase()
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect(),
    )
}

fn clean_sex(raw: &str) -> Option<String> {
    let upper = raw.trim().to_uppercase();
    let sex = if upper.starts_with("PEREMPUAN") || upper.starts_with("WANITA") || upper == "F" || upper == "P" {
        "F"
    } else if upper.starts_with("LAKI") || upper.starts_with("PRIA") || upper == "M" || upper == "L" {
        "M"
    } else if upper.starts_with("FEMALE") {
        "F"
    } else if upper.starts_with("MALE") {
        "M"
    } else {
        return None;
    };
    Some(sex.to_string())
}

/// Neighbourhood and hamlet units as zero-padded `NNN/NNN`.
fn clean_rt_rw(raw: &str) -> Option<String> {
    let unlabelled = raw.to_uppercase().replace("RT", " ").replace("RW", " ");
    let fixed = fix_ocr_digits(&unlabelled);
    let nums: Vec<u32> = NUMBERS
        .find_iter(&fixed)
        .filter_map(|m| m.as_str().parse().ok())
        .collect();
    match nums.as_slice() {
        [rt, rw, ..] if *rt < 1000 && *rw < 1000 => Some(format!("{rt:03}/{rw:03}")),
        _ => None,
    }
}

/// The four statuses printed on identity cards, from Indonesian or English.
fn clean_marital_status(raw: &str) -> Option<String> {
    let upper = collapse_whitespace(&raw.to_uppercase());
    let status = if upper.contains("BELUM") || upper.starts_with("SINGLE") || upper.starts_with("UNMARRIED") {
        "BELUM KAWIN"
    } else if upper.contains("CERAI MATI") || upper.starts_with("WIDOW") {
        "CERAI MATI"
    } else if upper.contains("CERAI") || upper.starts_with("DIVORCE") {
        "CERAI HIDUP"
    } else if upper.contains("KAWIN") || upper.starts_with("MARRIED") {
        "KAWIN"
    } else {
        return None;
    };
    Some(status.to_string())
}

/// Digits with an optional leading `+`; fewer than 8 digits is not a number.
fn clean_phone_number(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if digits.len() < 8 {
        return None;
    }
    Some(if trimmed.starts_with('+') { format!("+{digits}") } else { digits })
}

// ═══════════════════════════════════════════════════════════
// Dates
// ═══════════════════════════════════════════════════════════

/// Canonical `YYYY-MM-DD`, or the whitespace-trimmed input when no date can
/// be read from it (validation then reports it).
fn clean_date(raw: &str) -> Option<String> {
    Some(standardize_date(raw).unwrap_or_else(|| collapse_whitespace(raw)))
}

/// Read a printed date in any of the layouts seen on identity documents.
pub fn standardize_date(raw: &str) -> Option<String> {
    let upper = raw.trim().to_uppercase();

    if let Some(m) = TEXT_MONTH_DATE.captures(&upper) {
        if let Some(month) = month_number(&m[2]) {
            let day: u32 = m[1].parse().ok()?;
            let year: i32 = m[3].parse().ok()?;
            return canonical(year, month, day);
        }
    }

    let fixed: String = upper
        .chars()
        .map(|c| match c {
            'L' | 'I' | '|' => '1',
            'O' => '0',
            '?' => '7',
            ':' | '.' | ',' | '_' | '/' => '-',
            other => other,
        })
        .collect();
    let nums: Vec<&str> = NUMBERS.find_iter(&fixed).map(|m| m.as_str()).collect();
    if nums.len() < 3 {
        return None;
    }

    if nums[0].len() == 4 {
        let year = nums[0].parse().ok()?;
        return canonical(year, nums[1].parse().ok()?, nums[2].parse().ok()?);
    }
    if nums[2].len() != 4 {
        return None;
    }
    let year = nums[2].parse().ok()?;
    let n1: u32 = nums[0].parse().ok()?;
    let n2: u32 = nums[1].parse().ok()?;
    // Day-first unless only the second number can be a day.
    let (day, month) = if n2 > 12 && n1 <= 12 { (n2, n1) } else { (n1, n2) };
    canonical(year, month, day)
}

fn month_number(word: &str) -> Option<u32> {
    MONTHS
        .iter()
        .find(|(prefix, _)| word.starts_with(prefix))
        .map(|(_, n)| *n)
}

fn canonical(year: i32, month: u32, day: u32) -> Option<String> {
    if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, day).map(|d| d.format("%Y-%m-%d").to_string())
}
