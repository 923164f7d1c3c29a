//! Text helpers shared by the document parsers: OCR digit repair, labelled
//! line lookup, date spotting and name candidates.

use std::sync::LazyLock;

use regex::Regex;

use crate::pipeline::cleaning::fold_diacritics;

/// Confidence of a value read from printed (visual) text.
pub const VISUAL_CONFIDENCE: f32 = 0.6;

static NUMERIC_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,2})[-/.](\d{1,2})[-/.](\d{4})").unwrap());

static TEXT_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d{1,2})[\s\-]*(JAN|FEB|PEB|MAR|APR|MAY|MEI|JUN|JUL|AUG|AGU|AGT|SEP|OCT|OKT|NOV|NOP|DEC|DES)[A-Z]*[\s\-]*(\d{4})").unwrap()
});

static ISO_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").unwrap());

/// Words that only ever appear on identity documents as labels.
const NAME_BLACKLIST: &[&str] = &[
    "PROVINSI", "KABUPATEN", "KOTA", "NIK", "LAKI-LAKI", "PEREMPUAN", "AGAMA", "KAWIN",
    "GOL DARAH", "PARTAI", "PEMILIHAN", "UMUM", "KARTU", "PENDUDUK", "NEGARA", "PASPOR",
    "PASSPORT", "REPUBLIK", "REPUBLIC",
];

/// Map characters OCR commonly confuses with digits.
pub fn fix_ocr_digits(text: &str) -> String {
    text.chars().map(ocr_digit).collect()
}

pub fn ocr_digit(c: char) -> char {
    match c {
        'O' | 'o' | 'D' | 'Q' => '0',
        'I' | 'l' | 'L' | '|' | 'i' => '1',
        '?' | 'T' => '7',
        'S' | 's' => '5',
        'B' => '8',
        'G' => '6',
        'g' => '9',
        'A' => '4',
        'Z' | 'z' => '2',
        other => other,
    }
}

/// Inverse map for positions that must hold a letter.
pub fn ocr_letter(c: char) -> char {
    match c {
        '0' => 'O',
        '1' => 'I',
        '2' => 'Z',
        '5' => 'S',
        '6' => 'G',
        '8' => 'B',
        other => other,
    }
}

/// First date found in `line`, as printed (`DD-MM-YYYY`, `DD MMM YYYY` or ISO).
pub fn date_in(line: &str) -> Option<String> {
    if let Some(m) = TEXT_DATE.captures(line) {
        return Some(format!("{} {} {}", &m[1], m[2].to_uppercase(), &m[3]));
    }
    if let Some(m) = NUMERIC_DATE.captures(line) {
        return Some(format!("{}-{}-{}", &m[1], &m[2], &m[3]));
    }
    ISO_DATE.find(line).map(|m| m.as_str().to_string())
}

/// Date on the first line containing any of `labels` (case-insensitive).
pub fn date_near(text: &str, labels: &[&str]) -> Option<String> {
    text.lines()
        .filter(|line| contains_any(line, labels))
        .find_map(date_in)
}

pub fn contains_any(line: &str, labels: &[&str]) -> bool {
    let upper = line.to_uppercase();
    labels.iter().any(|label| upper.contains(&label.to_uppercase()))
}

/// Letters-only value, or `None` when shorter than `min_len` or blacklisted.
pub fn letters_only(raw: &str, min_len: usize, blacklist: &[&str]) -> Option<String> {
    let upper = fold_diacritics(raw).to_uppercase();
    let kept: String = upper
        .chars()
        .map(|c| if c.is_ascii_uppercase() { c } else { ' ' })
        .collect();
    let value = collapse_whitespace(&kept);
    if value.len() < min_len || blacklist.iter().any(|bl| value.contains(bl)) {
        return None;
    }
    Some(value)
}

/// A plausible person name from a raw fragment.
///
/// Keeps letters, spaces, hyphens and apostrophes; rejects anything shorter
/// than three characters or containing a document label.
pub fn name_candidate(raw: &str) -> Option<String> {
    let upper = fold_diacritics(raw).to_uppercase();
    let kept: String = upper
        .chars()
        .filter(|c| c.is_ascii_uppercase() || *c == ' ' || *c == '-' || *c == '\'')
        .collect();
    let name = collapse_whitespace(&kept);
    if name.len() < 3 || has_label_word(&name) {
        return None;
    }
    Some(name)
}

fn has_label_word(name: &str) -> bool {
    NAME_BLACKLIST.iter().any(|label| {
        if label.contains(' ') {
            name.contains(label)
        } else {
            name.split(' ').any(|token| token == *label)
        }
    })
}

pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Text after a `label` prefix and an optional `:`/`.` separator.
pub fn after_label<'a>(line: &'a str, label: &Regex) -> Option<&'a str> {
    label.find(line).map(|m| {
        line[m.end()..]
            .trim_start_matches(|c: char| c.is_whitespace() || c == ':' || c == '.' || c == '=')
            .trim()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ocr_digit_repair() {
        assert_eq!(fix_ocr_digits("32O1l2S4B6"), "3201125486");
        assert_eq!(fix_ocr_digits("1234"), "1234");
    }

    #[test]
    fn dates_in_various_layouts() {
        assert_eq!(date_in("Tgl Lahir: 01-01-1990").as_deref(), Some("01-01-1990"));
        assert_eq!(date_in("DATE OF BIRTH 04 MAR 1972").as_deref(), Some("04 MAR 1972"));
        assert_eq!(date_in("16 Mei 1977").as_deref(), Some("16 MEI 1977"));
        assert_eq!(date_in("born 1990-01-01").as_deref(), Some("1990-01-01"));
        assert_eq!(date_in("no date here"), None);
    }

    #[test]
    fn date_near_uses_label_line_only() {
        let text = "Berlaku 01-01-2030\nTempat/Tgl Lahir : JAKARTA, 17-08-1985";
        assert_eq!(date_near(text, &["LAHIR"]).as_deref(), Some("17-08-1985"));
        assert_eq!(date_near(text, &["EXPIRY"]), None);
    }

    #[test]
    fn name_candidates() {
        assert_eq!(name_candidate(" budi  santoso. ").as_deref(), Some("BUDI SANTOSO"));
        assert_eq!(name_candidate("D'ARCY-ANNE").as_deref(), Some("D'ARCY-ANNE"));
        assert_eq!(name_candidate("PROVINSI JAWA TENGAH"), None);
        assert_eq!(name_candidate("AB"), None);
        assert_eq!(name_candidate("ANIKA PUTRI").as_deref(), Some("ANIKA PUTRI"));
        assert_eq!(name_candidate("José Ramírez").as_deref(), Some("JOSE RAMIREZ"));
    }

    #[test]
    fn after_label_strips_separators() {
        let label = Regex::new(r"(?i)^Nama").unwrap();
        assert_eq!(after_label("Nama : BUDI", &label), Some("BUDI"));
        assert_eq!(after_label("Alamat: X", &label), None);
    }
}
