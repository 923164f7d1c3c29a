//! Machine-readable zone decoding (ICAO 9303).
//!
//! Two layouts are recognized:
//! - TD3 / MRV-A: two lines of 44 characters (passports, visas)
//! - TD1: three lines of 30 characters (card-sized documents)
//!
//! Numeric positions get OCR digit repair before their check digit is
//! verified. A failed check never discards a value; it is reported on the
//! decoded field so the caller can lower its confidence.

use chrono::{Datelike, NaiveDate, Utc};

use super::common::{ocr_digit, ocr_letter};

const TD3_LEN: usize = 44;
const TD1_LEN: usize = 30;
/// OCR may drop or duplicate a couple of filler characters.
const LENGTH_SLACK: usize = 3;

const CHEVRON_LOOKALIKES: &[char] = &['K', 'C', 'E', 'R', 'X'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MrzFormat {
    Td3,
    Td1,
}

/// One decoded value and whether its check digit verified.
#[derive(Debug, Clone, PartialEq)]
pub struct Checked<T> {
    pub value: T,
    pub valid: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MrzData {
    pub format: MrzFormat,
    /// `P`, `V`, `I`, ...
    pub document_code: char,
    pub issuing_state: String,
    pub surname: String,
    pub given_names: String,
    pub document_number: Option<Checked<String>>,
    pub nationality: Option<String>,
    /// ISO `YYYY-MM-DD`.
    pub birth_date: Option<Checked<String>>,
    pub sex: Option<char>,
    pub expiry_date: Option<Checked<String>>,
    pub composite_valid: bool,
}

impl MrzData {
    /// `GIVEN NAMES SURNAME`, or just the surname.
    pub fn full_name(&self) -> Option<String> {
        let name = format!("{} {}", self.given_names, self.surname);
        let name = name.trim();
        (!name.is_empty()).then(|| name.to_string())
    }

    /// Every check digit in the block verified.
    pub fn all_valid(&self) -> bool {
        let checked = [
            self.document_number.as_ref().map(|c| c.valid),
            self.birth_date.as_ref().map(|c| c.valid),
            self.expiry_date.as_ref().map(|c| c.valid),
        ];
        self.composite_valid && checked.iter().all(|v| v.unwrap_or(true))
    }
}

// ═══════════════════════════════════════════════════════════
// Check digits
// ═══════════════════════════════════════════════════════════

/// ICAO 7-3-1 weighted check digit. `None` for characters outside `[0-9A-Z<]`.
pub fn check_digit(data: &str) -> Option<u32> {
    const WEIGHTS: [u32; 3] = [7, 3, 1];
    let mut sum = 0u32;
    for (i, c) in data.chars().enumerate() {
        let value = match c {
            '0'..='9' => c as u32 - '0' as u32,
            'A'..='Z' => c as u32 - 'A' as u32 + 10,
            '<' => 0,
            _ => return None,
        };
        sum += value * WEIGHTS[i % 3];
    }
    Some(sum % 10)
}

fn verifies(data: &str, check: char) -> bool {
    let expected = if check == '<' { Some(0) } else { check.to_digit(10) };
    matches!((check_digit(data), expected), (Some(a), Some(b)) if a == b)
}

// ═══════════════════════════════════════════════════════════
// Line cleanup
// ═══════════════════════════════════════════════════════════

/// Normalize one OCR line into the MRZ alphabet.
pub fn clean_mrz_line(line: &str) -> String {
    let mapped: Vec<char> = line
        .to_uppercase()
        .chars()
        .filter_map(|c| match c {
            '(' | ')' | '[' | ']' | '{' | '}' | '«' | '»' | '£' | '¢' | '|' => Some('<'),
            'A'..='Z' | '0'..='9' | '<' => Some(c),
            _ => None,
        })
        .collect();
    fix_filler_letters(mapped).into_iter().collect()
}

/// Letters read inside a filler run (`<<K<<`) or trailing a long filler run
/// are chevrons.
fn fix_filler_letters(mut chars: Vec<char>) -> Vec<char> {
    let is_filler = |chars: &[char], from: usize, to: usize| {
        from <= to && to <= chars.len() && chars[from..to].iter().all(|c| *c == '<')
    };

    let mut i = 0;
    while i < chars.len() {
        if CHEVRON_LOOKALIKES.contains(&chars[i]) {
            let mut end = i;
            while end < chars.len() && CHEVRON_LOOKALIKES.contains(&chars[end]) && end - i < 2 {
                end += 1;
            }
            let before = i >= 2 && is_filler(&chars, i - 2, i);
            let after = is_filler(&chars, end, end + 2);
            let trailing = end == chars.len() && i >= 3 && is_filler(&chars, i - 3, i);
            if before && (after || trailing) {
                for c in &mut chars[i..end] {
                    *c = '<';
                }
            }
            i = end.max(i + 1);
        } else {
            i += 1;
        }
    }
    chars
}

fn fit_length(line: &str, len: usize) -> Option<String> {
    let n = line.chars().count();
    if n + LENGTH_SLACK < len || n > len + LENGTH_SLACK {
        return None;
    }
    let mut fitted: String = line.chars().take(len).collect();
    while fitted.len() < len {
        fitted.push('<');
    }
    Some(fitted)
}

// ═══════════════════════════════════════════════════════════
// Detection
// ═══════════════════════════════════════════════════════════

/// Find and decode the machine-readable block in free text.
pub fn find_mrz(text: &str) -> Option<MrzData> {
    let lines: Vec<String> = text
        .lines()
        .map(clean_mrz_line)
        .filter(|l| !l.is_empty())
        .collect();

    for (i, line) in lines.iter().enumerate() {
        if !looks_like_mrz(line) {
            continue;
        }
        if let Some(next) = lines.get(i + 1) {
            if let (Some(l1), Some(l2)) = (fit_length(line, TD3_LEN), fit_length(next, TD3_LEN)) {
                if is_document_code(&l1) {
                    return Some(decode_td3(&l1, &l2));
                }
            }
        }
        if let (Some(next), Some(last)) = (lines.get(i + 1), lines.get(i + 2)) {
            if let (Some(l1), Some(l2), Some(l3)) = (
                fit_length(line, TD1_LEN),
                fit_length(next, TD1_LEN),
                fit_length(last, TD1_LEN),
            ) {
                if is_document_code(&l1) {
                    return Some(decode_td1(&l1, &l2, &l3));
                }
            }
        }
    }
    None
}

fn looks_like_mrz(line: &str) -> bool {
    line.len() + LENGTH_SLACK >= TD1_LEN && line.matches('<').count() >= 2
}

fn is_document_code(line1: &str) -> bool {
    let mut chars = line1.chars();
    matches!(chars.next(), Some('P' | 'V' | 'I' | 'A' | 'C'))
        && chars.next().is_some_and(|c| c == '<' || c.is_ascii_uppercase())
}

// ═══════════════════════════════════════════════════════════
// Decoding
// ═══════════════════════════════════════════════════════════

fn slice(line: &str, from: usize, to: usize) -> &str {
    line.get(from..to).unwrap_or("")
}

fn char_at(line: &str, at: usize) -> char {
    line.as_bytes().get(at).map(|b| *b as char).unwrap_or('<')
}

fn digits(raw: &str) -> String {
    raw.chars().map(ocr_digit).collect()
}

/// Document numbers start with a letter on Indonesian passports; only the
/// rest is digit-repaired.
fn document_number_chars(raw: &str) -> String {
    let mut chars = raw.chars();
    match chars.next() {
        Some(first) => std::iter::once(ocr_letter(first)).chain(chars.map(ocr_digit)).collect(),
        None => String::new(),
    }
}

fn names(section: &str) -> (String, String) {
    let trimmed = section.trim_end_matches('<');
    let (surname, given) = match trimmed.split_once("<<") {
        Some((s, g)) => (s, g),
        None => (trimmed, ""),
    };
    let words = |s: &str| {
        s.split('<')
            .filter(|w| !w.is_empty())
            .map(|w| w.chars().filter(|c| c.is_ascii_uppercase()).collect::<String>())
            .filter(|w| !w.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    };
    (words(surname), words(given))
}

/// Document number with its check digit, plus the 9-character form that
/// verified (or the digit-repaired form when neither does).
fn checked_number(raw: &str, check: char) -> (Option<Checked<String>>, String) {
    let check = ocr_digit(check);
    let repaired = document_number_chars(raw);
    let (resolved, valid) = if verifies(raw, check) {
        (raw.to_string(), true)
    } else {
        let valid = verifies(&repaired, check);
        (repaired, valid)
    };
    let value = resolved.replace('<', "");
    let checked = (!value.is_empty()).then_some(Checked { value, valid });
    (checked, resolved)
}

fn checked_date(raw: &str, check: char, birth: bool) -> Option<Checked<String>> {
    let fixed = digits(raw);
    let value = yymmdd_to_iso(&fixed, birth)?;
    Some(Checked {
        valid: verifies(&fixed, ocr_digit(check)),
        value,
    })
}

/// Birth years past the current year belong to the previous century;
/// expiry years are always 20xx.
fn yymmdd_to_iso(raw: &str, birth: bool) -> Option<String> {
    if raw.len() != 6 || !raw.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let yy: i32 = raw[0..2].parse().ok()?;
    let month: u32 = raw[2..4].parse().ok()?;
    let day: u32 = raw[4..6].parse().ok()?;
    let mut year = 2000 + yy;
    if birth && year > Utc::now().year() {
        year -= 100;
    }
    NaiveDate::from_ymd_opt(year, month, day).map(|d| d.format("%Y-%m-%d").to_string())
}

fn sex(c: char) -> Option<char> {
    matches!(c, 'M' | 'F').then_some(c)
}

fn alpha(raw: &str) -> Option<String> {
    let value: String = raw.chars().filter(|c| c.is_ascii_uppercase()).collect();
    (!value.is_empty()).then_some(value)
}

fn decode_td3(l1: &str, l2: &str) -> MrzData {
    let (surname, given_names) = names(slice(l1, 5, TD3_LEN));
    let (document_number, number_chars) = checked_number(slice(l2, 0, 9), char_at(l2, 9));

    let composite_data = format!(
        "{number_chars}{}{}{}{}",
        ocr_digit(char_at(l2, 9)),
        digits(slice(l2, 13, 20)),
        digits(slice(l2, 21, 28)),
        slice(l2, 28, 43)
    );

    MrzData {
        format: MrzFormat::Td3,
        document_code: char_at(l1, 0),
        issuing_state: slice(l1, 2, 5).replace('<', ""),
        surname,
        given_names,
        document_number,
        nationality: alpha(slice(l2, 10, 13)),
        birth_date: checked_date(slice(l2, 13, 19), char_at(l2, 19), true),
        sex: sex(char_at(l2, 20)),
        expiry_date: checked_date(slice(l2, 21, 27), char_at(l2, 27), false),
        composite_valid: verifies(&composite_data, ocr_digit(char_at(l2, 43))),
    }
}

fn decode_td1(l1: &str, l2: &str, l3: &str) -> MrzData {
    let (surname, given_names) = names(l3);
    let (document_number, number_chars) = checked_number(slice(l1, 5, 14), char_at(l1, 14));

    let composite_data = format!(
        "{number_chars}{}{}{}{}{}",
        ocr_digit(char_at(l1, 14)),
        slice(l1, 15, 30),
        digits(slice(l2, 0, 7)),
        digits(slice(l2, 8, 15)),
        slice(l2, 18, 29)
    );

    MrzData {
        format: MrzFormat::Td1,
        document_code: char_at(l1, 0),
        issuing_state: slice(l1, 2, 5).replace('<', ""),
        surname,
        given_names,
        document_number,
        nationality: alpha(slice(l2, 15, 18)),
        birth_date: checked_date(slice(l2, 0, 6), char_at(l2, 6), true),
        sex: sex(char_at(l2, 7)),
        expiry_date: checked_date(slice(l2, 8, 14), char_at(l2, 14), false),
        composite_valid: verifies(&composite_data, ocr_digit(char_at(l2, 29))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a valid TD3 block for a given document number, birth and expiry.
    pub(crate) fn td3(surname: &str, given: &str, number: &str, birth: &str, expiry: &str) -> String {
        let mut l1 = format!("P<IDN{surname}<<{}", given.replace(' ', "<"));
        while l1.len() < TD3_LEN {
            l1.push('<');
        }
        let number = format!("{number:<<9}");
        let optional = "<".repeat(14);
        let n_check = check_digit(&number).unwrap();
        let b_check = check_digit(birth).unwrap();
        let e_check = check_digit(expiry).unwrap();
        let o_check = check_digit(&optional).unwrap();
        let body = format!("{number}{n_check}IDN{birth}{b_check}M{expiry}{e_check}{optional}{o_check}");
        let composite = format!("{}{}{}", &body[0..10], &body[13..20], &body[21..43]);
        let c_check = check_digit(&composite).unwrap();
        format!("{l1}\n{body}{c_check}")
    }

    #[test]
    fn check_digit_reference_values() {
        // ICAO 9303 part 3 worked example
        assert_eq!(check_digit("L898902C3"), Some(6));
        assert_eq!(check_digit("740812"), Some(2));
        assert_eq!(check_digit("120415"), Some(9));
        assert_eq!(check_digit("<<<<"), Some(0));
        assert_eq!(check_digit("ab"), None);
    }

    #[test]
    fn icao_specimen_decodes() {
        let text = "P<UTOERIKSSON<<ANNA<MARIA<<<<<<<<<<<<<<<<<<<\nL898902C36UTO7408122F1204159ZE184226B<<<<<10";
        let mrz = find_mrz(text).unwrap();
        assert_eq!(mrz.format, MrzFormat::Td3);
        assert_eq!(mrz.surname, "ERIKSSON");
        assert_eq!(mrz.given_names, "ANNA MARIA");
        assert_eq!(mrz.full_name().as_deref(), Some("ANNA MARIA ERIKSSON"));
        let number = mrz.document_number.clone().unwrap();
        assert_eq!(number.value, "L898902C3");
        assert!(number.valid);
        assert_eq!(mrz.birth_date.clone().unwrap().value, "1974-08-12");
        assert_eq!(mrz.expiry_date.clone().unwrap().value, "2012-04-15");
        assert_eq!(mrz.sex, Some('F'));
        assert_eq!(mrz.nationality.as_deref(), Some("UTO"));
        assert!(mrz.composite_valid);
        assert!(mrz.all_valid());
    }

    #[test]
    fn generated_block_is_valid() {
        let text = td3("SANTOSO", "BUDI", "B1234567", "900101", "300101");
        let mrz = find_mrz(&text).unwrap();
        assert!(mrz.all_valid(), "{mrz:?}");
        assert_eq!(mrz.full_name().as_deref(), Some("BUDI SANTOSO"));
        assert_eq!(mrz.document_number.unwrap().value, "B1234567");
        assert_eq!(mrz.birth_date.unwrap().value, "1990-01-01");
    }

    #[test]
    fn corrupted_check_digit_is_flagged_not_dropped() {
        let text = td3("SANTOSO", "BUDI", "B1234567", "900101", "300101");
        let (l1, l2) = text.split_once('\n').unwrap();
        let mut l2: Vec<char> = l2.chars().collect();
        l2[19] = if l2[19] == '9' { '8' } else { '9' };
        let corrupted = format!("{l1}\n{}", l2.into_iter().collect::<String>());

        let mrz = find_mrz(&corrupted).unwrap();
        let birth = mrz.birth_date.clone().unwrap();
        assert_eq!(birth.value, "1990-01-01");
        assert!(!birth.valid);
        assert!(mrz.document_number.clone().unwrap().valid);
        assert!(!mrz.all_valid());
    }

    #[test]
    fn ocr_noise_in_filler_is_repaired() {
        assert_eq!(clean_mrz_line("P<IDNSANTOSO<<BUDI<<K<<<(<<"), "P<IDNSANTOSO<<BUDI<<<<<<<<<");
        assert_eq!(clean_mrz_line("p<idn santoso"), "P<IDNSANTOSO");
        // Letters inside a name are kept.
        assert_eq!(clean_mrz_line("P<IDNMALIK<<RAKA<<<"), "P<IDNMALIK<<RAKA<<<");
    }

    #[test]
    fn ocr_digits_in_dates_are_repaired() {
        let text = td3("SANTOSO", "BUDI", "B1234567", "900101", "300101");
        let noisy = text.replacen("900101", "9OO1O1", 1);
        let mrz = find_mrz(&noisy).unwrap();
        let birth = mrz.birth_date.unwrap();
        assert_eq!(birth.value, "1990-01-01");
        assert!(birth.valid);
    }

    #[test]
    fn td1_block_decodes() {
        let l1 = "I<UTOD231458907<<<<<<<<<<<<<<<";
        let l2 = "7408122F1204159UTO<<<<<<<<<<<6";
        let l3 = "ERIKSSON<<ANNA<MARIA<<<<<<<<<<";
        let mrz = find_mrz(&format!("{l1}\n{l2}\n{l3}")).unwrap();
        assert_eq!(mrz.format, MrzFormat::Td1);
        assert_eq!(mrz.document_number.clone().unwrap().value, "D23145890");
        assert!(mrz.document_number.clone().unwrap().valid);
        assert_eq!(mrz.full_name().as_deref(), Some("ANNA MARIA ERIKSSON"));
        assert!(mrz.composite_valid);
    }

    #[test]
    fn free_text_has_no_mrz() {
        assert!(find_mrz("REPUBLIK INDONESIA\nNama: BUDI SANTOSO").is_none());
    }
}
