//! Per-field and cross-field rules over a cleaned record.
//!
//! Validation only reports; field values are never touched. Errors keep a
//! record out of an exportable profile, warnings are advisory.

use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate, Utc};
use regex::Regex;

use crate::models::{
    DocumentType, Field, IssueCode, ParsedRecord, ValidatedRecord, ValidationIssue,
};

const NATIONAL_ID_LEN: usize = 16;
const MIN_VISA_LEN: usize = 8;
const EARLIEST_BIRTH_YEAR: i32 = 1900;
/// Citizenship values printed on identity cards.
const CARD_NATIONALITIES: &[&str] = &["WNI", "WNA"];

static PASSPORT_NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Z]\d{6,7}$").unwrap());

pub fn validate(record: ParsedRecord) -> ValidatedRecord {
    validate_on(record, Utc::now().date_naive())
}

/// Validate against a fixed `today`.
pub fn validate_on(record: ParsedRecord, today: NaiveDate) -> ValidatedRecord {
    let mut issues = record.parse_issues.clone();
    let mut found = Vec::new();

    check_identifiers(&record, &mut found);
    check_nationality(&record, &mut found);
    check_dates(&record, today, &mut found);
    check_required(&record, &mut found);

    issues.extend(found.into_iter().map(|i| i.for_record(record.record_id)));

    if !issues.is_empty() {
        tracing::debug!(
            record_id = %record.record_id,
            errors = issues.iter().filter(|i| i.is_error()).count(),
            warnings = issues.iter().filter(|i| !i.is_error()).count(),
            "Validation issues"
        );
    }

    ValidatedRecord { record, issues }
}

fn check_identifiers(record: &ParsedRecord, issues: &mut Vec<ValidationIssue>) {
    if let Some(nik) = record.value(Field::NationalId) {
        let digits = nik.chars().filter(char::is_ascii_digit).count();
        if digits != NATIONAL_ID_LEN || nik.len() != NATIONAL_ID_LEN {
            issues.push(ValidationIssue::error(
                Field::NationalId,
                IssueCode::InvalidLength,
                format!("national id must be {NATIONAL_ID_LEN} digits (found {digits})"),
            ));
        }
    }

    if let Some(number) = record.value(Field::PassportNumber) {
        if !PASSPORT_NUMBER.is_match(number) {
            issues.push(ValidationIssue::error(
                Field::PassportNumber,
                IssueCode::InvalidPattern,
                format!("passport number '{number}' is not a letter followed by 6-7 digits"),
            ));
        }
    }

    if let Some(visa) = record.value(Field::VisaNumber) {
        if visa.chars().count() < MIN_VISA_LEN {
            issues.push(ValidationIssue::warning(
                Some(Field::VisaNumber),
                IssueCode::InvalidPattern,
                format!("visa number '{visa}' is shorter than {MIN_VISA_LEN} characters"),
            ));
        }
    }
}

/// Identity cards print citizenship as WNI or WNA; passports carry a
/// country code instead and are not checked.
fn check_nationality(record: &ParsedRecord, issues: &mut Vec<ValidationIssue>) {
    if record.document_type != DocumentType::IdentityCard {
        return;
    }
    if let Some(nationality) = record.value(Field::Nationality) {
        if !CARD_NATIONALITIES.contains(&nationality) {
            issues.push(ValidationIssue::warning(
                Some(Field::Nationality),
                IssueCode::InvalidPattern,
                format!("nationality '{nationality}' must be WNI or WNA"),
            ));
        }
    }
}

fn check_dates(record: &ParsedRecord, today: NaiveDate, issues: &mut Vec<ValidationIssue>) {
    let mut date = |field: Field| -> Option<NaiveDate> {
        let raw = record.value(field)?;
        match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            Ok(d) => Some(d),
            Err(_) => {
                issues.push(ValidationIssue::error(
                    field,
                    IssueCode::InvalidDate,
                    format!("{field}: '{raw}' is not a valid date"),
                ));
                None
            }
        }
    };

    let birth = date(Field::DateOfBirth);
    let issued = date(Field::IssueDate);
    let expiry = date(Field::ExpiryDate);

    if let Some(birth) = birth {
        if birth > today || birth.year() < EARLIEST_BIRTH_YEAR {
            issues.push(ValidationIssue::error(
                Field::DateOfBirth,
                IssueCode::ImplausibleDate,
                format!("date of birth {birth} is not plausible"),
            ));
        }
    }

    if let Some(expiry) = expiry {
        if let Some(issued) = issued {
            if expiry < issued {
                issues.push(ValidationIssue::error(
                    Field::ExpiryDate,
                    IssueCode::ExpiryBeforeIssue,
                    format!("expiry {expiry} is before issue {issued}"),
                ));
            }
        }
        if expiry < today {
            issues.push(ValidationIssue::warning(
                Some(Field::ExpiryDate),
                IssueCode::Expired,
                format!("document expired on {expiry}"),
            ));
        }
    }
}

fn check_required(record: &ParsedRecord, issues: &mut Vec<ValidationIssue>) {
    if record.value(Field::FullName).is_some() {
        return;
    }
    let message = "name is missing";
    let issue = match record.document_type {
        DocumentType::Visa => ValidationIssue::warning(Some(Field::FullName), IssueCode::MissingValue, message),
        DocumentType::IdentityCard | DocumentType::Passport => {
            ValidationIssue::error(Field::FullName, IssueCode::MissingValue, message)
        }
    };
    issues.push(issue);
}
