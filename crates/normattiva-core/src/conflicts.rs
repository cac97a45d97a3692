//! Temporal conflict detection over overlapping modifications.
//!
//! A modification is "this version sets the text of this path during this
//! interval". Two modifications of the same (document, path) coming from
//! different versions whose half-open intervals overlap form a conflict.
//! Conflicts are only ever surfaced; every lifecycle transition is an
//! explicit reviewer action.

use std::collections::{BTreeMap, HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{KbError, KbResult};
use crate::models::{
    stable_id, ConflictEvent, ConflictSide, ConflictStatus, DocumentVersion, ModificationKind,
    Node, RelationType, Severity, ValidityInterval,
};
use crate::text::sha256_hex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictPolicy {
    /// Overlaps of at least this many days are `medium`.
    pub minor_overlap_days: i64,
    /// Overlaps of at least this many days are `high`.
    pub major_overlap_days: i64,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self {
            minor_overlap_days: 30,
            major_overlap_days: 365,
        }
    }
}

impl ConflictPolicy {
    pub fn validate(&self) -> KbResult<()> {
        if self.minor_overlap_days < 0 || self.major_overlap_days <= self.minor_overlap_days {
            return Err(KbError::InvalidConfig(format!(
                "conflicts: need 0 <= minor_overlap_days < major_overlap_days, got {} and {}",
                self.minor_overlap_days, self.major_overlap_days
            )));
        }
        Ok(())
    }

    pub fn severity(
        &self,
        a: &ValidityInterval,
        b: &ValidityInterval,
        kinds: (ModificationKind, ModificationKind),
    ) -> Severity {
        let base = match a.overlap_days(b) {
            None => Severity::Low,
            Some(None) => Severity::Critical,
            Some(Some(days)) if days >= self.major_overlap_days => Severity::High,
            Some(Some(days)) if days >= self.minor_overlap_days => Severity::Medium,
            Some(Some(_)) => Severity::Low,
        };
        if kinds.0 == ModificationKind::Repeal || kinds.1 == ModificationKind::Repeal {
            base.raised()
        } else {
            base
        }
    }
}

/// One version setting the text of one path over an interval.
#[derive(Debug, Clone, PartialEq)]
pub struct Modification {
    pub target_document_id: String,
    pub canonical_path: String,
    pub version_id: String,
    pub source_document_id: String,
    pub node_id: Option<String>,
    pub validity: ValidityInterval,
    pub kind: ModificationKind,
}

impl Modification {
    fn identity(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.target_document_id,
            self.canonical_path,
            self.version_id,
            self.source_document_id,
            self.node_id.as_deref().unwrap_or("")
        )
    }

    fn side(&self) -> ConflictSide {
        ConflictSide {
            version_id: self.version_id.clone(),
            source_document_id: self.source_document_id.clone(),
            node_id: self.node_id.clone(),
            validity: self.validity,
            kind: self.kind,
        }
    }
}

static REPEALED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^[\s(\[]*(?:(?:articolo|art\.|comma|lettera|numero)\s*[\w-]*\s*)?(?:abrogat[oaie]|soppress[oaie])\b",
    )
    .unwrap()
});

/// True when a provision's text only marks it as repealed.
pub fn is_repealed_text(text: &str) -> bool {
    REPEALED.is_match(text)
}

/// Modifications carried by a document's own versions.
///
/// Versions are taken in validity order; each node whose text is new or
/// differs from the preceding version is a modification. Every node of the
/// first version counts as an addition.
pub fn node_modifications(versions: &[(DocumentVersion, Vec<Node>)]) -> Vec<Modification> {
    let mut ordered: Vec<&(DocumentVersion, Vec<Node>)> = versions.iter().collect();
    ordered.sort_by(|(a, _), (b, _)| {
        a.validity
            .from
            .cmp(&b.validity.from)
            .then(a.ingested_at.cmp(&b.ingested_at))
            .then(a.id.cmp(&b.id))
    });

    let mut out = Vec::new();
    let mut previous: HashMap<&str, &str> = HashMap::new();
    for (version, nodes) in ordered {
        let mut current: HashMap<&str, &str> = HashMap::new();
        for node in nodes {
            current.insert(node.canonical_path.as_str(), node.text_clean.as_str());
            let kind = match previous.get(node.canonical_path.as_str()) {
                Some(old) if *old == node.text_clean => continue,
                _ if is_repealed_text(&node.text_clean) => ModificationKind::Repeal,
                Some(_) => ModificationKind::Replacement,
                None => ModificationKind::Addition,
            };
            out.push(Modification {
                target_document_id: version.document_id.clone(),
                canonical_path: node.canonical_path.clone(),
                version_id: version.id.clone(),
                source_document_id: version.document_id.clone(),
                node_id: Some(node.id.clone()),
                validity: version.validity,
                kind,
            });
        }
        previous = current;
    }
    out
}

/// A resolved amending or repealing citation from one document into another.
#[derive(Debug, Clone, PartialEq)]
pub struct CrossReference {
    pub source_document_id: String,
    pub source_version_id: String,
    pub source_node_id: String,
    pub source_validity: ValidityInterval,
    pub target_document_id: String,
    pub target_path: String,
    pub relation: RelationType,
}

/// Modifications asserted by other documents through amend/repeal citations.
pub fn reference_modifications(refs: &[CrossReference]) -> Vec<Modification> {
    refs.iter()
        .filter(|r| r.relation.is_modifying() && r.source_document_id != r.target_document_id)
        .map(|r| Modification {
            target_document_id: r.target_document_id.clone(),
            canonical_path: r.target_path.clone(),
            version_id: r.source_version_id.clone(),
            source_document_id: r.source_document_id.clone(),
            node_id: Some(r.source_node_id.clone()),
            validity: r.source_validity,
            kind: if r.relation == RelationType::Repeals {
                ModificationKind::Repeal
            } else {
                ModificationKind::Replacement
            },
        })
        .collect()
}

/// Dedup key of an unordered pair of identities.
pub fn dedup_key(a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    sha256_hex(format!("{first}\n{second}").as_bytes())
}

/// Find every overlapping pair. Output order is deterministic.
pub fn detect(modifications: &[Modification], policy: &ConflictPolicy, now: i64) -> Vec<ConflictEvent> {
    let mut groups: BTreeMap<(&str, &str), Vec<&Modification>> = BTreeMap::new();
    for m in modifications {
        groups
            .entry((m.target_document_id.as_str(), m.canonical_path.as_str()))
            .or_default()
            .push(m);
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    for ((document_id, path), mut group) in groups {
        group.sort_by(|a, b| {
            a.validity
                .from
                .cmp(&b.validity.from)
                .then_with(|| a.identity().cmp(&b.identity()))
        });
        for (i, a) in group.iter().enumerate() {
            for b in &group[i + 1..] {
                // Sorted by start: nothing later can overlap a closed interval.
                if let Some(to) = a.validity.to {
                    if b.validity.from >= to {
                        break;
                    }
                }
                if a.version_id == b.version_id || !a.validity.overlaps(&b.validity) {
                    continue;
                }
                let (ia, ib) = (a.identity(), b.identity());
                let key = dedup_key(&ia, &ib);
                if !seen.insert(key.clone()) {
                    continue;
                }
                let (first, second) = if ia <= ib { (a, b) } else { (b, a) };
                out.push(ConflictEvent {
                    id: stable_id(&["conflict", &key]),
                    dedup_key: key,
                    target_document_id: document_id.to_string(),
                    canonical_path: path.to_string(),
                    side_a: first.side(),
                    side_b: second.side(),
                    severity: policy.severity(&a.validity, &b.validity, (a.kind, b.kind)),
                    status: ConflictStatus::Pending,
                    reviewer: None,
                    review_note: None,
                    decision: None,
                    detected_at: now,
                    updated_at: now,
                });
            }
        }
    }
    out
}

fn invalid(from: ConflictStatus, to: ConflictStatus, reason: &str) -> KbError {
    KbError::InvalidTransition {
        from: from.as_str().to_string(),
        to: to.as_str().to_string(),
        reason: reason.to_string(),
    }
}

/// pending → reviewed.
pub fn review(
    conflict: &mut ConflictEvent,
    reviewer: &str,
    note: Option<&str>,
    now: i64,
) -> KbResult<()> {
    if conflict.status != ConflictStatus::Pending {
        return Err(invalid(
            conflict.status,
            ConflictStatus::Reviewed,
            "only pending conflicts can be reviewed",
        ));
    }
    if reviewer.trim().is_empty() {
        return Err(invalid(
            conflict.status,
            ConflictStatus::Reviewed,
            "a reviewer is required",
        ));
    }
    conflict.status = ConflictStatus::Reviewed;
    conflict.reviewer = Some(reviewer.trim().to_string());
    conflict.review_note = note.map(str::to_string);
    conflict.updated_at = now;
    Ok(())
}

/// pending | reviewed → resolved, with a recorded decision.
pub fn resolve(
    conflict: &mut ConflictEvent,
    decision: &str,
    reviewer: Option<&str>,
    now: i64,
) -> KbResult<()> {
    if conflict.status == ConflictStatus::Resolved {
        return Err(invalid(
            conflict.status,
            ConflictStatus::Resolved,
            "conflict is already resolved",
        ));
    }
    if decision.trim().is_empty() {
        return Err(invalid(
            conflict.status,
            ConflictStatus::Resolved,
            "a decision is required",
        ));
    }
    conflict.status = ConflictStatus::Resolved;
    conflict.decision = Some(decision.trim().to_string());
    if let Some(r) = reviewer {
        conflict.reviewer = Some(r.trim().to_string());
    }
    conflict.updated_at = now;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VersionStorage;
    use chrono::NaiveDate;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn version(id: &str, from: &str, to: Option<&str>) -> DocumentVersion {
        DocumentVersion {
            id: id.into(),
            document_id: "doc".into(),
            version_tag: id.into(),
            validity: ValidityInterval::new(day(from), to.map(day)),
            checksum: String::new(),
            storage: VersionStorage::Full {
                text: String::new(),
            },
            source_raw_hash: None,
            ingested_at: 0,
        }
    }

    fn node(version: &str, path: &str, text: &str) -> Node {
        Node {
            id: format!("{version}:{path}"),
            document_id: "doc".into(),
            version_id: version.into(),
            kind: "articolo".into(),
            label: path.into(),
            canonical_path: path.into(),
            hierarchy_string: path.into(),
            heading: None,
            text_clean: text.into(),
            text_raw_snippet: text.into(),
            ordinal: 0,
            source_url: None,
            inline_refs: vec![],
        }
    }

    fn scenario() -> Vec<(DocumentVersion, Vec<Node>)> {
        vec![
            (
                version("v1", "2020-01-01", Some("2021-01-01")),
                vec![node("v1", "art4", "Invariato."), node("v1", "art5", "Testo originale.")],
            ),
            (
                version("v2", "2020-06-01", None),
                vec![node("v2", "art4", "Invariato."), node("v2", "art5", "Testo nuovo.")],
            ),
        ]
    }

    #[test]
    fn test_overlapping_versions_yield_one_pending_conflict() {
        let mods = node_modifications(&scenario());
        let conflicts = detect(&mods, &ConflictPolicy::default(), 0);
        assert_eq!(conflicts.len(), 1);
        let c = &conflicts[0];
        assert_eq!(c.canonical_path, "art5");
        assert_eq!(c.status, ConflictStatus::Pending);
        assert_eq!(c.severity, Severity::Medium);
        let versions = [c.side_a.version_id.as_str(), c.side_b.version_id.as_str()];
        assert!(versions.contains(&"v1") && versions.contains(&"v2"));
    }

    #[test]
    fn test_detection_is_deterministic() {
        let mods = node_modifications(&scenario());
        let mut reversed = mods.clone();
        reversed.reverse();
        let a = detect(&mods, &ConflictPolicy::default(), 0);
        let b = detect(&reversed, &ConflictPolicy::default(), 0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_adjacent_versions_do_not_conflict() {
        let versions = vec![
            (
                version("v1", "2020-01-01", Some("2020-06-01")),
                vec![node("v1", "art5", "A.")],
            ),
            (version("v2", "2020-06-01", None), vec![node("v2", "art5", "B.")]),
        ];
        let conflicts = detect(&node_modifications(&versions), &ConflictPolicy::default(), 0);
        assert!(conflicts.is_empty());
    }

    #[test]
    fn test_severity_tiers() {
        let policy = ConflictPolicy::default();
        let r = ModificationKind::Replacement;
        let open_a = ValidityInterval::new(day("2020-01-01"), None);
        let open_b = ValidityInterval::new(day("2020-02-01"), None);
        assert_eq!(policy.severity(&open_a, &open_b, (r, r)), Severity::Critical);

        let short = ValidityInterval::new(day("2020-01-01"), Some(day("2020-01-11")));
        assert_eq!(policy.severity(&short, &open_a, (r, r)), Severity::Low);
        assert_eq!(
            policy.severity(&short, &open_a, (r, ModificationKind::Repeal)),
            Severity::Medium
        );

        let long = ValidityInterval::new(day("2018-01-01"), Some(day("2020-01-01")));
        let long_b = ValidityInterval::new(day("2017-01-01"), None);
        assert_eq!(policy.severity(&long, &long_b, (r, r)), Severity::High);
    }

    #[test]
    fn test_repealed_text_is_a_repeal() {
        assert!(is_repealed_text("(abrogato)"));
        assert!(is_repealed_text("Articolo abrogato dalla legge 212/2000."));
        assert!(is_repealed_text("Comma 2 soppresso"));
        assert!(!is_repealed_text("Sono abrogate le disposizioni incompatibili."));

        let versions = vec![
            (version("v1", "2020-01-01", None), vec![node("v1", "art5", "Testo.")]),
            (version("v2", "2021-01-01", None), vec![node("v2", "art5", "(abrogato)")]),
        ];
        let mods = node_modifications(&versions);
        assert_eq!(mods.last().unwrap().kind, ModificationKind::Repeal);
    }

    #[test]
    fn test_cross_document_amendments() {
        let refs = vec![CrossReference {
            source_document_id: "amending".into(),
            source_version_id: "a1".into(),
            source_node_id: "a1:art1".into(),
            source_validity: ValidityInterval::new(day("2020-03-01"), None),
            target_document_id: "doc".into(),
            target_path: "art5".into(),
            relation: RelationType::Amends,
        }];
        let mut mods = node_modifications(&scenario());
        mods.extend(reference_modifications(&refs));
        let conflicts = detect(&mods, &ConflictPolicy::default(), 0);
        // v1 x v2, v1 x a1, v2 x a1
        assert_eq!(conflicts.len(), 3);
        assert!(conflicts
            .iter()
            .any(|c| c.side_a.source_document_id == "amending"
                || c.side_b.source_document_id == "amending"));
    }

    #[test]
    fn test_citing_references_are_not_modifications() {
        let refs = vec![CrossReference {
            source_document_id: "other".into(),
            source_version_id: "o1".into(),
            source_node_id: "o1:art1".into(),
            source_validity: ValidityInterval::new(day("2020-03-01"), None),
            target_document_id: "doc".into(),
            target_path: "art5".into(),
            relation: RelationType::Cites,
        }];
        assert!(reference_modifications(&refs).is_empty());
    }

    #[test]
    fn test_dedup_key_is_order_independent() {
        assert_eq!(dedup_key("a", "b"), dedup_key("b", "a"));
        assert_ne!(dedup_key("a", "b"), dedup_key("a", "c"));
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mods = node_modifications(&scenario());
        let mut c = detect(&mods, &ConflictPolicy::default(), 0).remove(0);

        assert!(matches!(
            resolve(&mut c, "  ", None, 1),
            Err(KbError::InvalidTransition { .. })
        ));
        review(&mut c, "mrossi", Some("verificare la decorrenza"), 1).unwrap();
        assert_eq!(c.status, ConflictStatus::Reviewed);
        assert!(matches!(
            review(&mut c, "mrossi", None, 2),
            Err(KbError::InvalidTransition { .. })
        ));
        resolve(&mut c, "prevale v2", None, 3).unwrap();
        assert_eq!(c.status, ConflictStatus::Resolved);
        assert_eq!(c.decision.as_deref(), Some("prevale v2"));
        assert_eq!(c.reviewer.as_deref(), Some("mrossi"));
        assert!(resolve(&mut c, "di nuovo", None, 4).is_err());
    }

    #[test]
    fn test_policy_validation() {
        assert!(ConflictPolicy::default().validate().is_ok());
        let bad = ConflictPolicy {
            minor_overlap_days: 400,
            major_overlap_days: 365,
        };
        assert!(bad.validate().is_err());
    }
}
