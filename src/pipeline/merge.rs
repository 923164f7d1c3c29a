//! Cross-document identity merge.
//!
//! Every pair of records is scored (token name similarity plus birth date
//! equality), pairs at or above the cutoff are unioned, and each connected
//! component becomes one `CanonicalProfile`. Grouping is transitive, so two
//! records can share a profile through a third even when their direct score
//! is below the cutoff.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use uuid::Uuid;

use crate::config::MergeConfig;
use crate::models::{
    CanonicalProfile, DocumentType, Field, FieldValue, IssueCode, MergeGroup, ResolvedAttribute,
    ValidatedRecord, ValidationIssue,
};

// ═══════════════════════════════════════════════════════════
// Scoring
// ═══════════════════════════════════════════════════════════

/// Composite similarity in `[0, 1]`: weighted name similarity plus birth
/// date equality. A name on both sides is required; without one the score
/// is 0. When either record lacks a birth date the name alone is scored.
pub fn similarity(a: &ValidatedRecord, b: &ValidatedRecord, config: &MergeConfig) -> f32 {
    let (Some(name_a), Some(name_b)) = (a.record.value(Field::FullName), b.record.value(Field::FullName)) else {
        return 0.0;
    };
    let name = name_similarity(name_a, name_b);

    match (a.record.value(Field::DateOfBirth), b.record.value(Field::DateOfBirth)) {
        (Some(x), Some(y)) => {
            let total = config.name_weight + config.dob_weight;
            if total <= 0.0 {
                return 0.0;
            }
            let dob = if x == y { 1.0 } else { 0.0 };
            (config.name_weight * name + config.dob_weight * dob) / total
        }
        _ => name,
    }
}

/// Symmetric token similarity: each token is matched to its closest token
/// on the other side, averaged over both token sets. Token order does not
/// matter.
pub fn name_similarity(a: &str, b: &str) -> f32 {
    let ta: Vec<&str> = a.split_whitespace().collect();
    let tb: Vec<&str> = b.split_whitespace().collect();
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }

    let best = |token: &str, others: &[&str]| -> f32 {
        others
            .iter()
            .map(|other| token_similarity(token, other))
            .fold(0.0, f32::max)
    };
    let total: f32 = ta.iter().map(|t| best(t, &tb)).sum::<f32>() + tb.iter().map(|t| best(t, &ta)).sum::<f32>();
    total / (ta.len() + tb.len()) as f32
}

fn token_similarity(a: &str, b: &str) -> f32 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - edit_distance(a, b) as f32 / longest as f32
}

/// Levenshtein distance (insertions, deletions, substitutions).
fn edit_distance(a: &str, b: &str) -> u32 {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let n = b_chars.len();

    if a_chars.is_empty() { return n as u32; }
    if n == 0 { return a_chars.len() as u32; }

    let mut prev: Vec<u32> = (0..=n as u32).collect();
    let mut curr = vec![0u32; n + 1];

    for (i, &a_ch) in a_chars.iter().enumerate() {
        curr[0] = (i + 1) as u32;
        for (j, &b_ch) in b_chars.iter().enumerate() {
            let cost = if a_ch == b_ch { 0 } else { 1 };
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

// ═══════════════════════════════════════════════════════════
// Union-find
// ═══════════════════════════════════════════════════════════

struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            Ordering::Less => self.parent[ra] = rb,
            Ordering::Greater => self.parent[rb] = ra,
            Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Merge
// ═══════════════════════════════════════════════════════════

/// Cluster records into profiles. Output order and profile ids depend only
/// on the set of input records, never on their order.
pub fn merge(records: &[ValidatedRecord], config: &MergeConfig) -> Vec<CanonicalProfile> {
    let mut sorted: Vec<&ValidatedRecord> = records.iter().collect();
    sorted.sort_by_key(|r| r.record.record_id);

    let mut set = DisjointSet::new(sorted.len());
    for i in 0..sorted.len() {
        for j in (i + 1)..sorted.len() {
            let score = similarity(sorted[i], sorted[j], config);
            if score >= config.cutoff {
                tracing::debug!(
                    a = %sorted[i].record.record_id,
                    b = %sorted[j].record.record_id,
                    score,
                    "Records linked"
                );
                set.union(i, j);
            }
        }
    }

    // Components keyed by their smallest index, so groups come out in
    // record-id order.
    let mut components: BTreeMap<usize, Vec<&ValidatedRecord>> = BTreeMap::new();
    let mut first_of_root: BTreeMap<usize, usize> = BTreeMap::new();
    for (i, record) in sorted.iter().enumerate() {
        let root = set.find(i);
        let first = *first_of_root.entry(root).or_insert(i);
        components.entry(first).or_default().push(record);
    }

    let profiles: Vec<CanonicalProfile> = components
        .into_values()
        .map(|members| build_profile(&members, config))
        .collect();

    tracing::info!(
        records = records.len(),
        profiles = profiles.len(),
        "Merged records into profiles"
    );
    profiles
}

fn build_profile(members: &[&ValidatedRecord], config: &MergeConfig) -> CanonicalProfile {
    let member_ids: Vec<Uuid> = members.iter().map(|m| m.record.record_id).collect();

    let mut document_types: Vec<DocumentType> = members.iter().map(|m| m.record.document_type).collect();
    document_types.sort();
    document_types.dedup();

    let mut issues: Vec<ValidationIssue> = members.iter().flat_map(|m| m.issues.iter().cloned()).collect();

    // Records with errors stay in the group but only contribute values when
    // no member is error-free.
    let clean: Vec<&ValidatedRecord> = members.iter().copied().filter(|m| !m.has_errors()).collect();
    let exportable = !clean.is_empty();
    let contributors: &[&ValidatedRecord] = if exportable { &clean } else { members };

    let mut attributes = BTreeMap::new();
    for field in Field::ALL {
        let candidates: Vec<(&ValidatedRecord, &FieldValue)> = contributors
            .iter()
            .filter_map(|m| m.record.fields.get(&field).map(|v| (*m, v)))
            .collect();
        let Some(winner) = resolve(field, &candidates) else {
            continue;
        };
        if let Some(conflict) = conflict(field, &candidates, winner, config) {
            issues.push(conflict);
        }
        let (record, value) = winner;
        attributes.insert(
            field,
            ResolvedAttribute {
                value: value.value.clone(),
                confidence: value.confidence,
                source: value.source,
                source_record: record.record.record_id,
                document_type: record.record.document_type,
            },
        );
    }

    CanonicalProfile {
        profile_id: profile_id(&member_ids),
        group: MergeGroup { members: member_ids },
        document_types,
        attributes,
        issues,
        exportable,
    }
}

/// Highest confidence wins; ties go to the preferred document type, then
/// to the smaller record id.
fn resolve<'a>(
    field: Field,
    candidates: &[(&'a ValidatedRecord, &'a FieldValue)],
) -> Option<(&'a ValidatedRecord, &'a FieldValue)> {
    candidates.iter().copied().min_by(|(ra, va), (rb, vb)| {
        vb.confidence
            .total_cmp(&va.confidence)
            .then_with(|| {
                precedence(field, ra.record.document_type).cmp(&precedence(field, rb.record.document_type))
            })
            .then_with(|| ra.record.record_id.cmp(&rb.record.record_id))
    })
}

/// Rank of a document type as the source of `field`; lower is preferred.
pub fn precedence(field: Field, document_type: DocumentType) -> u8 {
    use DocumentType::*;
    let order: [DocumentType; 3] = match field {
        Field::PassportNumber | Field::DateOfBirth | Field::Nationality | Field::Sex => {
            [Passport, IdentityCard, Visa]
        }
        Field::VisaNumber | Field::VisaIssuer => [Visa, Passport, IdentityCard],
        Field::IssueDate | Field::ExpiryDate | Field::IssuingOffice => [Passport, Visa, IdentityCard],
        _ => [IdentityCard, Passport, Visa],
    };
    order.iter().position(|t| *t == document_type).unwrap_or(order.len()) as u8
}

/// Two confident sources disagreeing on a personal attribute. Validity
/// dates and issuing authorities legitimately differ between documents.
fn conflict(
    field: Field,
    candidates: &[(&ValidatedRecord, &FieldValue)],
    winner: (&ValidatedRecord, &FieldValue),
    config: &MergeConfig,
) -> Option<ValidationIssue> {
    if matches!(
        field,
        Field::IssueDate | Field::ExpiryDate | Field::IssuingOffice | Field::VisaIssuer
    ) {
        return None;
    }
    let (winner_record, winner_value) = winner;
    let losers: Vec<&str> = candidates
        .iter()
        .filter(|(_, v)| v.confidence >= config.high_confidence && v.value != winner_value.value)
        .map(|(_, v)| v.value.as_str())
        .collect();
    if losers.is_empty() || winner_value.confidence < config.high_confidence {
        return None;
    }

    tracing::warn!(
        field = %field,
        kept = %winner_value.value,
        discarded = losers.len(),
        "Merge conflict"
    );
    Some(
        ValidationIssue::warning(
            Some(field),
            IssueCode::MergeConflict,
            format!(
                "{field}: kept '{}' from {}, discarded {}",
                winner_value.value,
                winner_record.record.document_type,
                losers.iter().map(|v| format!("'{v}'")).collect::<Vec<_>>().join(", ")
            ),
        )
        .for_record(winner_record.record.record_id),
    )
}

/// Stable id derived from the sorted member ids.
fn profile_id(members: &[Uuid]) -> Uuid {
    let bytes: Vec<u8> = members.iter().flat_map(|id| id.as_bytes().iter().copied()).collect();
    Uuid::new_v5(&Uuid::NAMESPACE_OID, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FieldSource, ParsedRecord};
    use crate::pipeline::parsing::tests::empty_record;

    fn validated(document_type: DocumentType, fields: &[(Field, &str, f32)]) -> ValidatedRecord {
        let mut record: ParsedRecord = empty_record(document_type);
        for (field, value, confidence) in fields {
            record.offer(*field, FieldValue::new(*value, *confidence, FieldSource::VisualText));
        }
        ValidatedRecord {
            record,
            issues: Vec::new(),
        }
    }

    fn groups(profiles: &[CanonicalProfile]) -> Vec<Vec<Uuid>> {
        let mut g: Vec<Vec<Uuid>> = profiles.iter().map(|p| p.group.members.clone()).collect();
        g.sort();
        g
    }

    #[test]
    fn name_similarity_ignores_token_order() {
        assert_eq!(name_similarity("BUDI SANTOSO", "SANTOSO BUDI"), 1.0);
        assert!(name_similarity("BUDI SANTOSO", "BUDI SANTOSA") > 0.9);
        assert!(name_similarity("BUDI SANTOSO", "SITI AMINAH") < 0.5);
        assert_eq!(name_similarity("", "BUDI"), 0.0);
    }

    #[test]
    fn edit_distance_basic() {
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("abc", "abc"), 0);
    }

    #[test]
    fn identity_card_and_passport_merge() {
        let id = validated(
            DocumentType::IdentityCard,
            &[
                (Field::FullName, "BUDI SANTOSO", 0.6),
                (Field::DateOfBirth, "1990-01-01", 0.6),
                (Field::NationalId, "3318012345678901", 0.6),
                (Field::Address, "JL MERDEKA NO 5", 0.6),
            ],
        );
        let passport = validated(
            DocumentType::Passport,
            &[
                (Field::FullName, "BUDI SANTOSO", 0.98),
                (Field::DateOfBirth, "1990-01-01", 0.98),
                (Field::PassportNumber, "B1234567", 0.98),
            ],
        );
        let config = MergeConfig::default();
        assert!(similarity(&id, &passport, &config) >= config.cutoff);

        let profiles = merge(&[id.clone(), passport.clone()], &config);
        assert_eq!(profiles.len(), 1);
        let p = &profiles[0];
        assert_eq!(p.value(Field::NationalId), Some("3318012345678901"));
        assert_eq!(p.value(Field::PassportNumber), Some("B1234567"));
        assert_eq!(p.value(Field::FullName), Some("BUDI SANTOSO"));
        assert_eq!(p.document_types, vec![DocumentType::IdentityCard, DocumentType::Passport]);

        let provenance = p.provenance();
        assert_eq!(provenance[&Field::NationalId], id.record.record_id);
        assert_eq!(provenance[&Field::PassportNumber], passport.record.record_id);
        assert_eq!(provenance[&Field::FullName], passport.record.record_id);
        assert!(p.exportable);
        assert!(p.issues.is_empty());
    }

    #[test]
    fn grouping_is_transitive() {
        let a = validated(DocumentType::IdentityCard, &[(Field::FullName, "BUDI SANTOSO", 0.6), (Field::DateOfBirth, "1990-01-01", 0.6)]);
        let b = validated(DocumentType::Visa, &[(Field::FullName, "BUDI SANTOSO", 0.6)]);
        let c = validated(DocumentType::Passport, &[(Field::FullName, "BUDI SANTOSO", 0.6), (Field::DateOfBirth, "1991-01-01", 0.6)]);

        let config = MergeConfig::default();
        assert!(similarity(&a, &c, &config) < config.cutoff);
        assert!(similarity(&a, &b, &config) >= config.cutoff);
        assert!(similarity(&b, &c, &config) >= config.cutoff);

        let profiles = merge(&[a, b, c], &config);
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].group.members.len(), 3);
    }

    #[test]
    fn below_cutoff_stays_apart() {
        let a = validated(DocumentType::IdentityCard, &[(Field::FullName, "BUDI SANTOSO", 0.6), (Field::DateOfBirth, "1990-01-01", 0.6)]);
        let b = validated(DocumentType::Passport, &[(Field::FullName, "SITI AMINAH", 0.98), (Field::DateOfBirth, "1990-01-01", 0.98)]);
        let profiles = merge(&[a, b], &MergeConfig::default());
        assert_eq!(profiles.len(), 2);
    }

    #[test]
    fn partition_is_order_independent() {
        let records = vec![
            validated(DocumentType::IdentityCard, &[(Field::FullName, "BUDI SANTOSO", 0.6)]),
            validated(DocumentType::Passport, &[(Field::FullName, "SANTOSO BUDI", 0.98)]),
            validated(DocumentType::Passport, &[(Field::FullName, "SITI AMINAH", 0.98)]),
            validated(DocumentType::Visa, &[(Field::VisaNumber, "VA12345678", 0.6)]),
        ];
        let config = MergeConfig::default();
        let forward = merge(&records, &config);
        let mut reversed = records.clone();
        reversed.reverse();
        let backward = merge(&reversed, &config);

        assert_eq!(groups(&forward), groups(&backward));
        assert_eq!(forward.len(), 3);
        let ids: Vec<Uuid> = forward.iter().map(|p| p.profile_id).collect();
        let ids_back: Vec<Uuid> = backward.iter().map(|p| p.profile_id).collect();
        assert_eq!(ids, ids_back);
    }

    #[test]
    fn unmatched_record_is_a_singleton() {
        let lone = validated(DocumentType::Visa, &[(Field::VisaNumber, "VA12345678", 0.6)]);
        let profiles = merge(&[lone.clone()], &MergeConfig::default());
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].group.members, vec![lone.record.record_id]);
    }

    #[test]
    fn confident_disagreement_is_a_warning() {
        let a = validated(DocumentType::Passport, &[(Field::FullName, "BUDI SANTOSO", 0.98), (Field::PassportNumber, "B1234567", 0.98)]);
        let b = validated(DocumentType::Passport, &[(Field::FullName, "BUDI SANTOSO", 0.98), (Field::PassportNumber, "C7654321", 0.9)]);
        let profiles = merge(&[a, b], &MergeConfig::default());
        assert_eq!(profiles.len(), 1);
        let p = &profiles[0];
        assert_eq!(p.value(Field::PassportNumber), Some("B1234567"));
        let conflict = p.issues.iter().find(|i| i.code == IssueCode::MergeConflict).unwrap();
        assert_eq!(conflict.field, Some(Field::PassportNumber));
        assert!(!conflict.is_error());
        assert!(p.exportable);
    }

    #[test]
    fn precedence_breaks_confidence_ties() {
        let id = validated(DocumentType::IdentityCard, &[(Field::FullName, "BUDI SANTOSO", 0.6)]);
        let passport = validated(DocumentType::Passport, &[(Field::FullName, "BUDI SANTOSO", 0.6), (Field::Sex, "M", 0.6)]);
        let mut id_sex = id.clone();
        id_sex.record.offer(Field::Sex, FieldValue::new("M", 0.6, FieldSource::VisualText));

        let profiles = merge(&[id_sex.clone(), passport.clone()], &MergeConfig::default());
        let p = &profiles[0];
        assert_eq!(p.attributes[&Field::FullName].document_type, DocumentType::IdentityCard);
        assert_eq!(p.attributes[&Field::Sex].document_type, DocumentType::Passport);
    }

    fn with_error(mut record: ValidatedRecord, field: Field) -> ValidatedRecord {
        let id = record.record.record_id;
        record
            .issues
            .push(ValidationIssue::error(field, IssueCode::InvalidLength, "bad value").for_record(id));
        record
    }

    #[test]
    fn erroneous_member_does_not_contribute() {
        let bad = with_error(
            validated(
                DocumentType::IdentityCard,
                &[(Field::FullName, "BUDI SANTOSO", 0.99), (Field::NationalId, "123", 0.99), (Field::Address, "JL X", 0.6)],
            ),
            Field::NationalId,
        );
        let id = validated(
            DocumentType::IdentityCard,
            &[(Field::FullName, "BUDI SANTOSO", 0.6), (Field::NationalId, "3318012345678901", 0.6)],
        );
        let passport = validated(
            DocumentType::Passport,
            &[(Field::FullName, "BUDI SANTOSO", 0.98), (Field::PassportNumber, "B1234567", 0.98)],
        );

        let profiles = merge(&[bad.clone(), id.clone(), passport.clone()], &MergeConfig::default());
        assert_eq!(profiles.len(), 1);
        let p = &profiles[0];
        assert_eq!(p.group.members.len(), 3);
        assert!(p.group.members.contains(&bad.record.record_id));
        assert!(p.exportable);
        assert_eq!(p.value(Field::NationalId), Some("3318012345678901"));
        assert_eq!(p.value(Field::Address), None);
        assert!(p.provenance().values().all(|source| *source != bad.record.record_id));
        assert!(p.issues.iter().any(|i| i.record_id == Some(bad.record.record_id)));
    }

    #[test]
    fn all_members_with_errors_block_export() {
        let a = with_error(
            validated(DocumentType::IdentityCard, &[(Field::FullName, "BUDI SANTOSO", 0.6), (Field::NationalId, "123", 0.6)]),
            Field::NationalId,
        );
        let b = with_error(
            validated(DocumentType::Passport, &[(Field::FullName, "BUDI SANTOSO", 0.98), (Field::PassportNumber, "12", 0.98)]),
            Field::PassportNumber,
        );

        let profiles = merge(&[a, b], &MergeConfig::default());
        assert_eq!(profiles.len(), 1);
        assert!(!profiles[0].exportable);
        assert_eq!(profiles[0].value(Field::FullName), Some("BUDI SANTOSO"));
        assert_eq!(profiles[0].issues.len(), 2);
    }

    #[test]
    fn shared_birth_date_without_names_stays_apart() {
        let visa = validated(
            DocumentType::Visa,
            &[(Field::DateOfBirth, "1990-01-01", 0.9), (Field::VisaNumber, "V1111111", 0.9)],
        );
        let passport = validated(
            DocumentType::Passport,
            &[(Field::DateOfBirth, "1990-01-01", 0.98), (Field::PassportNumber, "B9999999", 0.98)],
        );
        let config = MergeConfig::default();
        assert_eq!(similarity(&visa, &passport, &config), 0.0);
        assert_eq!(merge(&[visa, passport], &config).len(), 2);
    }

    #[test]
    fn birth_date_weighs_into_the_composite() {
        let config = MergeConfig::default();
        let a = validated(DocumentType::IdentityCard, &[(Field::FullName, "BUDI SANTOSO", 0.6), (Field::DateOfBirth, "1990-01-01", 0.6)]);
        let b = validated(DocumentType::Passport, &[(Field::FullName, "BUDI SANTOSO", 0.98), (Field::DateOfBirth, "1991-01-01", 0.98)]);
        let score = similarity(&a, &b, &config);
        assert!((score - 0.7).abs() < 1e-6, "{score}");
    }
}
