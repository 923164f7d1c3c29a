use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{DocumentType, EngineKind, Field, FieldSource, IssueCode, Severity};

/// One parsed field: value plus how much we trust it and where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: String,
    pub confidence: f32,
    pub source: FieldSource,
}

impl FieldValue {
    pub fn new(value: impl Into<String>, confidence: f32, source: FieldSource) -> Self {
        Self {
            value: value.into(),
            confidence: confidence.clamp(0.0, 1.0),
            source,
        }
    }
}

/// Typed fields recovered from one `RawDocument`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedRecord {
    pub record_id: Uuid,
    pub job_id: Uuid,
    /// Content hash of the originating document.
    pub document_hash: String,
    pub document_type: DocumentType,
    pub classification_confidence: f32,
    pub engine: EngineKind,
    pub fields: BTreeMap<Field, FieldValue>,
    /// Non-fatal findings raised while parsing (checksum, classification).
    pub parse_issues: Vec<ValidationIssue>,
}

impl ParsedRecord {
    pub fn value(&self, field: Field) -> Option<&str> {
        self.fields.get(&field).map(|v| v.value.as_str())
    }

    /// At least one field that identifies a person on its own.
    pub fn has_identity(&self) -> bool {
        self.fields.keys().any(|f| f.is_identifying())
    }

    /// Keep the higher-confidence candidate for a field.
    pub fn offer(&mut self, field: Field, candidate: FieldValue) {
        if candidate.value.trim().is_empty() {
            return;
        }
        match self.fields.get(&field) {
            Some(existing) if existing.confidence >= candidate.confidence => {}
            _ => {
                self.fields.insert(field, candidate);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub record_id: Option<Uuid>,
    pub field: Option<Field>,
    pub code: IssueCode,
    pub severity: Severity,
    pub message: String,
}

impl ValidationIssue {
    pub fn error(field: Field, code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            record_id: None,
            field: Some(field),
            code,
            severity: Severity::Error,
            message: message.into(),
        }
    }

    pub fn warning(field: Option<Field>, code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            record_id: None,
            field,
            code,
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    pub fn for_record(mut self, record_id: Uuid) -> Self {
        self.record_id = Some(record_id);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// A parsed record together with every issue raised against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedRecord {
    pub record: ParsedRecord,
    pub issues: Vec<ValidationIssue>,
}

impl ValidatedRecord {
    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(ValidationIssue::is_error)
    }
}
