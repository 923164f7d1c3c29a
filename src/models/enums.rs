use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid {field} value: '{value}'")]
pub struct ParseEnumError {
    pub field: String,
    pub value: String,
}

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(ParseEnumError {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum!(EngineKind {
    Gemini => "gemini",
    Ollama => "ollama",
    Tesseract => "tesseract",
    Hybrid => "hybrid",
});

impl EngineKind {
    /// Default fallback order.
    pub const ALL: [EngineKind; 4] = [
        EngineKind::Gemini,
        EngineKind::Ollama,
        EngineKind::Hybrid,
        EngineKind::Tesseract,
    ];
}

str_enum!(EngineCapability {
    Vision => "vision",
    OfflineText => "offline_text",
});

str_enum!(DocumentType {
    IdentityCard => "identity_card",
    Passport => "passport",
    Visa => "visa",
});

str_enum!(Field {
    FullName => "full_name",
    NationalId => "national_id",
    PassportNumber => "passport_number",
    VisaNumber => "visa_number",
    PlaceOfBirth => "place_of_birth",
    DateOfBirth => "date_of_birth",
    Sex => "sex",
    Nationality => "nationality",
    Address => "address",
    Province => "province",
    Regency => "regency",
    District => "district",
    Village => "village",
    IssueDate => "issue_date",
    ExpiryDate => "expiry_date",
    IssuingOffice => "issuing_office",
    RtRw => "rt_rw",
    Religion => "religion",
    MaritalStatus => "marital_status",
    Occupation => "occupation",
    Education => "education",
    FatherName => "father_name",
    PhoneNumber => "phone_number",
    VisaIssuer => "visa_issuer",
});

impl Field {
    pub const ALL: [Field; 24] = [
        Field::FullName,
        Field::NationalId,
        Field::PassportNumber,
        Field::VisaNumber,
        Field::PlaceOfBirth,
        Field::DateOfBirth,
        Field::Sex,
        Field::Nationality,
        Field::Address,
        Field::Province,
        Field::Regency,
        Field::District,
        Field::Village,
        Field::IssueDate,
        Field::ExpiryDate,
        Field::IssuingOffice,
        Field::RtRw,
        Field::Religion,
        Field::MaritalStatus,
        Field::Occupation,
        Field::Education,
        Field::FatherName,
        Field::PhoneNumber,
        Field::VisaIssuer,
    ];

    pub fn is_date(&self) -> bool {
        matches!(self, Field::DateOfBirth | Field::IssueDate | Field::ExpiryDate)
    }

    /// Fields that identify a person on their own.
    pub fn is_identifying(&self) -> bool {
        matches!(
            self,
            Field::FullName | Field::NationalId | Field::PassportNumber | Field::VisaNumber
        )
    }
}

/// Where a field value was recovered from.
str_enum!(FieldSource {
    Mrz => "mrz",
    EngineStructured => "engine_structured",
    VisualText => "visual_text",
});

str_enum!(Severity {
    Error => "error",
    Warning => "warning",
});

str_enum!(IssueCode {
    InvalidLength => "invalid_length",
    InvalidPattern => "invalid_pattern",
    InvalidDate => "invalid_date",
    ImplausibleDate => "implausible_date",
    Expired => "expired",
    ExpiryBeforeIssue => "expiry_before_issue",
    MissingValue => "missing_value",
    MrzChecksum => "mrz_checksum",
    ClassificationAmbiguous => "classification_ambiguous",
    MergeConflict => "merge_conflict",
});

str_enum!(JobState {
    Queued => "queued",
    Processing => "processing",
    Done => "done",
    Failed => "failed",
});

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }
}

str_enum!(SessionStatus {
    Running => "running",
    Completed => "completed",
    CompletedWithPartialFailures => "completed_with_partial_failures",
    Failed => "failed",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_str_round_trips_through_from_str() {
        for field in Field::ALL {
            assert_eq!(field.as_str().parse::<Field>().unwrap(), field);
        }
        for kind in EngineKind::ALL {
            assert_eq!(kind.as_str().parse::<EngineKind>().unwrap(), kind);
        }
    }

    #[test]
    fn serde_matches_as_str() {
        let json = serde_json::to_string(&SessionStatus::CompletedWithPartialFailures).unwrap();
        assert_eq!(json, "\"completed_with_partial_failures\"");
        let json = serde_json::to_string(&Field::DateOfBirth).unwrap();
        assert_eq!(json, format!("\"{}\"", Field::DateOfBirth.as_str()));
    }

    #[test]
    fn unknown_value_is_an_error() {
        let err = "driver_license".parse::<DocumentType>().unwrap_err();
        assert_eq!(err.field, "DocumentType");
        assert_eq!(err.value, "driver_license");
    }

    #[test]
    fn terminal_job_states() {
        assert!(JobState::Done.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Processing.is_terminal());
    }
}
