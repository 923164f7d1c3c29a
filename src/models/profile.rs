use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{DocumentType, Field, FieldSource};
use super::record::ValidationIssue;

/// Connected component of records judged to belong to one person.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeGroup {
    /// Sorted record ids; never empty.
    pub members: Vec<Uuid>,
}

/// Winning value for one canonical attribute, with provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedAttribute {
    pub value: String,
    pub confidence: f32,
    pub source: FieldSource,
    pub source_record: Uuid,
    pub document_type: DocumentType,
}

/// One resolved identity. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalProfile {
    pub profile_id: Uuid,
    pub group: MergeGroup,
    pub document_types: Vec<DocumentType>,
    pub attributes: BTreeMap<Field, ResolvedAttribute>,
    /// Issues of every member record plus merge conflicts.
    pub issues: Vec<ValidationIssue>,
    /// False when any member record carries an Error-severity issue.
    pub exportable: bool,
}

impl CanonicalProfile {
    pub fn value(&self, field: Field) -> Option<&str> {
        self.attributes.get(&field).map(|a| a.value.as_str())
    }

    /// attribute → contributing record id
    pub fn provenance(&self) -> BTreeMap<Field, Uuid> {
        self.attributes
            .iter()
            .map(|(field, attr)| (*field, attr.source_record))
            .collect()
    }
}
