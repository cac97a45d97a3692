//! Multi-stage URN resolution.
//!
//! Each extracted reference is run through [`ResolutionStage::ORDER`] and the
//! first stage that yields a target wins. Every stage tried is returned as a
//! [`ResolutionAttempt`] so callers can write the audit log. An unresolved
//! reference is a normal result (stage `Manual`, confidence 0), not an error.

use std::collections::{BTreeMap, HashMap, HashSet};

use moka::sync::Cache;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{KbError, KbResult};
use crate::models::{
    stable_id, Completeness, Document, DocumentKey, ExtractedReference, Node, RelativeScope,
    ResolutionLogEntry, ResolutionStage, ResolutionTarget, ResolvedReference,
};
use crate::text::tokens;

/// Confidence policy for the resolution stages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionPolicy {
    /// Upper bound for contextual confidence; must be below 1.
    pub contextual_ceiling: f64,
    /// Subtracted per coordinate inferred from context.
    pub inferred_penalty: f64,
    /// Upper bound for heuristic confidence.
    pub heuristic_ceiling: f64,
    /// Minimum title-token overlap for a heuristic match.
    pub heuristic_min_similarity: f64,
    /// Entries in the per-batch contextual cache.
    pub cache_capacity: u64,
}

impl Default for ResolutionPolicy {
    fn default() -> Self {
        Self {
            contextual_ceiling: 0.9,
            inferred_penalty: 0.1,
            heuristic_ceiling: 0.45,
            heuristic_min_similarity: 0.5,
            cache_capacity: 10_000,
        }
    }
}

/// Most coordinates a contextual resolution can infer: type, number, year,
/// and the relative anchor.
const MAX_INFERRED: u32 = 4;

impl ResolutionPolicy {
    /// Stage ordering must be reflected in confidence: every contextual
    /// result outranks every heuristic one, and explicit (1.0) outranks both.
    pub fn validate(&self) -> KbResult<()> {
        if !(self.contextual_ceiling > 0.0 && self.contextual_ceiling < 1.0) {
            return Err(KbError::InvalidConfig(format!(
                "resolution.contextual_ceiling must be in (0, 1), got {}",
                self.contextual_ceiling
            )));
        }
        if self.inferred_penalty < 0.0 {
            return Err(KbError::InvalidConfig(
                "resolution.inferred_penalty must not be negative".into(),
            ));
        }
        let contextual_floor =
            self.contextual_ceiling - self.inferred_penalty * f64::from(MAX_INFERRED);
        if !(self.heuristic_ceiling > 0.0 && self.heuristic_ceiling < contextual_floor) {
            return Err(KbError::InvalidConfig(format!(
                "resolution.heuristic_ceiling must be in (0, {contextual_floor}), got {}",
                self.heuristic_ceiling
            )));
        }
        if !(0.0..=1.0).contains(&self.heuristic_min_similarity) {
            return Err(KbError::InvalidConfig(
                "resolution.heuristic_min_similarity must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }

    pub fn contextual_confidence(&self, inferred: u32) -> f64 {
        let raw = self.contextual_ceiling - self.inferred_penalty * f64::from(inferred);
        raw.clamp(0.01, self.contextual_ceiling)
    }
}

/// Replace the current resolution only when the candidate is at least as
/// confident.
pub fn supersedes(existing: Option<&ResolvedReference>, candidate: &ResolvedReference) -> bool {
    match existing {
        None => true,
        Some(current) => candidate.confidence >= current.confidence,
    }
}

const STOPWORDS: &[&str] = &[
    "della", "delle", "dello", "degli", "del", "dei", "per", "con", "sui", "sulla", "nel",
    "nella", "alla", "alle", "agli", "che", "una", "uno", "gli", "dal", "dalla", "materia",
];

fn content_tokens(s: &str) -> HashSet<String> {
    tokens(s)
        .into_iter()
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

#[derive(Debug, Clone)]
struct IndexedDocument {
    id: String,
    canonical: String,
    key: DocumentKey,
    title_tokens: HashSet<String>,
    /// Node paths in document order, ~N suffixes included.
    paths: Vec<(String, String)>,
    exact: HashMap<String, String>,
}

/// Read-only lookup structure built once per resolution run.
#[derive(Debug, Clone, Default)]
pub struct ResolutionIndex {
    by_canonical: HashMap<String, IndexedDocument>,
    canonical_by_id: HashMap<String, String>,
    aliases: Vec<(String, String)>,
}

impl ResolutionIndex {
    /// `aliases` maps alias text to canonical keys.
    pub fn new(aliases: &BTreeMap<String, String>) -> Self {
        Self {
            by_canonical: HashMap::new(),
            canonical_by_id: HashMap::new(),
            aliases: aliases
                .iter()
                .map(|(a, c)| (a.to_lowercase(), c.clone()))
                .collect(),
        }
    }

    /// Index a document with the nodes of the version that citations should
    /// land on (normally the one currently in force).
    pub fn add_document(&mut self, doc: &Document, nodes: &[Node]) {
        let paths: Vec<(String, String)> = nodes
            .iter()
            .map(|n| (n.canonical_path.clone(), n.id.clone()))
            .collect();
        let exact = paths.iter().cloned().collect();
        self.canonical_by_id
            .insert(doc.id.clone(), doc.canonical.clone());
        self.by_canonical.insert(
            doc.canonical.clone(),
            IndexedDocument {
                id: doc.id.clone(),
                canonical: doc.canonical.clone(),
                key: doc.key(),
                title_tokens: doc.title.as_deref().map(content_tokens).unwrap_or_default(),
                paths,
                exact,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.by_canonical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_canonical.is_empty()
    }

    fn document(&self, key: &DocumentKey) -> Option<&IndexedDocument> {
        self.by_canonical.get(&key.canonical())
    }

    fn document_by_id(&self, id: &str) -> Option<&IndexedDocument> {
        self.canonical_by_id
            .get(id)
            .and_then(|c| self.by_canonical.get(c))
    }

    /// Exact path, else a unique article-anchored suffix, else the first node
    /// under the path (an article whose own text is empty).
    pub fn lookup_path(&self, document_id: &str, path: &str) -> Option<&str> {
        let doc = self.document_by_id(document_id)?;
        if let Some(id) = doc.exact.get(path) {
            return Some(id.as_str());
        }

        if path.starts_with("art") {
            let suffix = format!("/{path}");
            let mut matches = doc.paths.iter().filter(|(p, _)| p.ends_with(&suffix));
            if let (Some((_, id)), None) = (matches.next(), matches.next()) {
                return Some(id.as_str());
            }
        }

        let prefix = format!("{path}/");
        let nested = format!("/{path}/");
        doc.paths
            .iter()
            .find(|(p, _)| p.starts_with(&prefix) || p.contains(&nested))
            .map(|(_, id)| id.as_str())
    }
}

/// Where a reference was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceContext {
    pub document_id: String,
    pub node_path: String,
}

impl SourceContext {
    pub fn of(node: &Node) -> Self {
        Self {
            document_id: node.document_id.clone(),
            node_path: node.canonical_path.clone(),
        }
    }

    /// Path prefix up to and including the first segment with `prefix`.
    fn anchor(&self, prefix: &str) -> Option<String> {
        let mut out = Vec::new();
        for seg in self.node_path.split('/') {
            out.push(seg);
            if seg.starts_with(prefix) {
                return Some(out.join("/"));
            }
        }
        None
    }
}

/// Outcome of one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionAttempt {
    pub stage: ResolutionStage,
    pub target: ResolutionTarget,
    pub confidence: f64,
    pub needs_review: bool,
    pub cache_hit: bool,
}

impl ResolutionAttempt {
    fn miss(stage: ResolutionStage) -> Self {
        Self {
            stage,
            target: ResolutionTarget::Unresolved,
            confidence: 0.0,
            needs_review: false,
            cache_hit: false,
        }
    }
}

/// All attempts for a reference; the last one is the outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub reference_id: String,
    pub attempts: Vec<ResolutionAttempt>,
}

impl Resolution {
    pub fn outcome(&self) -> &ResolutionAttempt {
        // `resolve` always pushes at least the manual attempt.
        &self.attempts[self.attempts.len() - 1]
    }

    /// Persistable records: the resolution and one log entry per attempt.
    pub fn into_records(
        self,
        reference: &ExtractedReference,
        source: &SourceContext,
        now: i64,
    ) -> (ResolvedReference, Vec<ResolutionLogEntry>) {
        let outcome = self.outcome().clone();
        let resolved = ResolvedReference {
            id: resolution_id(&self.reference_id, outcome.stage, &outcome.target),
            reference_id: self.reference_id.clone(),
            stage: outcome.stage,
            confidence: outcome.confidence,
            target: outcome.target.clone(),
            needs_review: outcome.needs_review,
            is_current: false,
            resolved_at: now,
        };
        let log = self
            .attempts
            .into_iter()
            .map(|a| ResolutionLogEntry {
                id: uuid::Uuid::new_v4().to_string(),
                reference_id: reference.id.clone(),
                stage: a.stage,
                match_text: reference.match_text.clone(),
                source_document_id: Some(source.document_id.clone()),
                target: a.target,
                confidence: a.confidence,
                cache_hit: a.cache_hit,
                attempted_at: now,
            })
            .collect();
        (resolved, log)
    }
}

pub fn resolution_id(reference_id: &str, stage: ResolutionStage, target: &ResolutionTarget) -> String {
    let target_key = match target {
        ResolutionTarget::Node { node_id, .. } => format!("node:{node_id}"),
        ResolutionTarget::Document { document_id } => format!("document:{document_id}"),
        ResolutionTarget::Unresolved => "unresolved".to_string(),
    };
    stable_id(&["resolution", reference_id, stage.as_str(), &target_key])
}

type CacheKey = (String, String, String);

pub struct Resolver<'a> {
    index: &'a ResolutionIndex,
    policy: ResolutionPolicy,
    cache: Cache<CacheKey, (ResolutionTarget, u32)>,
}

impl<'a> Resolver<'a> {
    pub fn new(index: &'a ResolutionIndex, policy: ResolutionPolicy) -> Self {
        Self {
            index,
            policy,
            cache: Cache::new(policy.cache_capacity),
        }
    }

    /// Run the stages in order, stopping at the first hit.
    pub fn resolve(&self, reference: &ExtractedReference, source: &SourceContext) -> Resolution {
        let mut attempts = Vec::new();
        for stage in ResolutionStage::ORDER {
            let attempt = match stage {
                ResolutionStage::Explicit => self.explicit(reference),
                ResolutionStage::Contextual => self.contextual(reference, source),
                ResolutionStage::Heuristic => self.heuristic(reference),
                ResolutionStage::Manual => Some(ResolutionAttempt {
                    stage,
                    target: ResolutionTarget::Unresolved,
                    confidence: 0.0,
                    needs_review: true,
                    cache_hit: false,
                }),
            };
            match attempt {
                Some(hit) => {
                    attempts.push(hit);
                    break;
                }
                None => attempts.push(ResolutionAttempt::miss(stage)),
            }
        }
        Resolution {
            reference_id: reference.id.clone(),
            attempts,
        }
    }

    fn explicit(&self, reference: &ExtractedReference) -> Option<ResolutionAttempt> {
        let key = reference.target.document_key()?;
        let doc = self.index.document(&key)?;
        let target = match &reference.target.path {
            Some(path) => ResolutionTarget::Node {
                node_id: self.index.lookup_path(&doc.id, path)?.to_string(),
                document_id: doc.id.clone(),
            },
            None => ResolutionTarget::Document {
                document_id: doc.id.clone(),
            },
        };
        Some(ResolutionAttempt {
            stage: ResolutionStage::Explicit,
            target,
            confidence: 1.0,
            needs_review: false,
            cache_hit: false,
        })
    }

    fn contextual(
        &self,
        reference: &ExtractedReference,
        source: &SourceContext,
    ) -> Option<ResolutionAttempt> {
        let target = &reference.target;
        let given = target.document_coordinates();
        if given == 3 || target.alias.is_some() {
            return None;
        }
        let anchor = match target.relative {
            Some(RelativeScope::Article) => Some(source.anchor("art")?),
            Some(RelativeScope::Comma) => Some(source.anchor("co")?),
            _ => None,
        };
        let key = (
            source.document_id.clone(),
            reference.match_text.clone(),
            anchor.clone().unwrap_or_default(),
        );

        if let Some((cached, inferred)) = self.cache.get(&key) {
            tracing::debug!(match_text = %reference.match_text, "contextual cache hit");
            return cached.is_resolved().then(|| ResolutionAttempt {
                stage: ResolutionStage::Contextual,
                target: cached,
                confidence: self.policy.contextual_confidence(inferred),
                needs_review: false,
                cache_hit: true,
            });
        }

        let computed = self.contextual_lookup(reference, source, anchor.as_deref());
        let (resolved, inferred) = computed
            .clone()
            .unwrap_or((ResolutionTarget::Unresolved, 0));
        self.cache.insert(key, (resolved, inferred));

        let (target, inferred) = computed?;
        Some(ResolutionAttempt {
            stage: ResolutionStage::Contextual,
            target,
            confidence: self.policy.contextual_confidence(inferred),
            needs_review: false,
            cache_hit: false,
        })
    }

    fn contextual_lookup(
        &self,
        reference: &ExtractedReference,
        source: &SourceContext,
        anchor: Option<&str>,
    ) -> Option<(ResolutionTarget, u32)> {
        let target = &reference.target;
        let doc = self.index.document_by_id(&source.document_id)?;
        let source_key = &doc.key;

        // Partial coordinates must agree with the source document.
        let agrees = target
            .doc_type
            .as_deref()
            .map_or(true, |t| DocumentKey::new(t, None, None).doc_type == source_key.doc_type)
            && target
                .number
                .as_deref()
                .map_or(true, |n| source_key.number.as_deref() == Some(n))
            && target.year.map_or(true, |y| source_key.year == Some(y));
        if !agrees {
            return None;
        }
        let mut inferred = 3 - target.document_coordinates() as u32;

        let path = match (anchor, target.path.as_deref()) {
            (Some(a), Some(p)) => {
                inferred += 1;
                Some(format!("{a}/{p}"))
            }
            (Some(a), None) => {
                inferred += 1;
                Some(a.to_string())
            }
            (None, p) => p.map(str::to_string),
        };

        let resolved = match path {
            Some(p) => ResolutionTarget::Node {
                node_id: self.index.lookup_path(&doc.id, &p)?.to_string(),
                document_id: doc.id.clone(),
            },
            None if reference.completeness == Completeness::Relative => {
                ResolutionTarget::Document {
                    document_id: doc.id.clone(),
                }
            }
            None => return None,
        };
        Some((resolved, inferred))
    }

    fn heuristic(&self, reference: &ExtractedReference) -> Option<ResolutionAttempt> {
        let target = &reference.target;
        // A complete citation of a document we do not hold must stay unresolved.
        if let Some(key) = target.document_key() {
            self.index.document(&key)?;
        }

        let haystack = format!("{} {}", reference.match_text, reference.context_snippet);
        let lowered = haystack.to_lowercase();
        let mut best: Option<(f64, &IndexedDocument)> = None;
        let mut consider = |score: f64, doc: &'a IndexedDocument| {
            let better = match best {
                None => true,
                Some((s, d)) => score > s || (score == s && doc.canonical < d.canonical),
            };
            if better {
                best = Some((score, doc));
            }
        };

        if let Some(doc) = target.document_key().and_then(|k| self.index.document(&k)) {
            consider(1.0, doc);
        }
        let given = target.document_coordinates();
        if given > 0 && given < 3 {
            let wanted_type = target
                .doc_type
                .as_deref()
                .map(|t| DocumentKey::new(t, None, None).doc_type);
            for doc in self.index.by_canonical.values() {
                let key = &doc.key;
                let matches = wanted_type.as_ref().map_or(true, |t| *t == key.doc_type)
                    && target
                        .number
                        .as_deref()
                        .map_or(true, |n| key.number.as_deref() == Some(n))
                    && target.year.map_or(true, |y| key.year == Some(y));
                if matches {
                    consider(given as f64 / 3.0, doc);
                }
            }
        }
        for (alias, canonical) in &self.index.aliases {
            if lowered.contains(alias.as_str()) {
                if let Some(doc) = self.index.by_canonical.get(canonical) {
                    consider(1.0, doc);
                }
            }
        }
        let context = content_tokens(&haystack);
        for doc in self.index.by_canonical.values() {
            if doc.title_tokens.is_empty() {
                continue;
            }
            let overlap = doc.title_tokens.intersection(&context).count();
            let score = overlap as f64 / doc.title_tokens.len() as f64;
            if score >= self.policy.heuristic_min_similarity && score > 0.0 {
                consider(score, doc);
            }
        }

        let (score, doc) = best?;
        let resolved = target
            .path
            .as_deref()
            .and_then(|p| self.index.lookup_path(&doc.id, p))
            .map(|node_id| ResolutionTarget::Node {
                node_id: node_id.to_string(),
                document_id: doc.id.clone(),
            })
            .unwrap_or_else(|| ResolutionTarget::Document {
                document_id: doc.id.clone(),
            });
        Some(ResolutionAttempt {
            stage: ResolutionStage::Heuristic,
            target: resolved,
            confidence: self.policy.heuristic_ceiling * score,
            needs_review: true,
            cache_hit: false,
        })
    }
}

/// Resolve a batch in parallel with a fresh, shared contextual cache.
pub fn resolve_batch(
    index: &ResolutionIndex,
    policy: ResolutionPolicy,
    items: &[(ExtractedReference, SourceContext)],
) -> Vec<Resolution> {
    let resolver = Resolver::new(index, policy);
    items
        .par_iter()
        .map(|(reference, source)| resolver.resolve(reference, source))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ReferenceTarget, RelationType};
    use crate::references::{default_aliases, extract_references};

    fn doc(canonical: &str, title: &str) -> Document {
        let key = DocumentKey::parse_canonical(canonical).unwrap();
        Document::from_key(&key, Some(title.to_string()), None, 0)
    }

    fn node(doc: &Document, path: &str) -> Node {
        Node {
            id: format!("{}#{path}", doc.canonical),
            document_id: doc.id.clone(),
            version_id: "v".into(),
            kind: "articolo".into(),
            label: path.into(),
            canonical_path: path.into(),
            hierarchy_string: path.into(),
            heading: None,
            text_clean: "x".into(),
            text_raw_snippet: "x".into(),
            ordinal: 0,
            source_url: None,
            inline_refs: vec![],
        }
    }

    fn fixture() -> (ResolutionIndex, Document, Document) {
        let d = doc("dlgs:74:2000", "Nuova disciplina dei reati tributari");
        let statuto = doc("legge:212:2000", "Statuto dei diritti del contribuente");
        let mut index = ResolutionIndex::new(&default_aliases());
        index.add_document(
            &d,
            &[
                node(&d, "art1"),
                node(&d, "art3"),
                node(&d, "art3/co2"),
                node(&d, "capo2/art7/co1"),
            ],
        );
        index.add_document(&statuto, &[node(&statuto, "art5")]);
        (index, d, statuto)
    }

    fn reference(target: ReferenceTarget, completeness: Completeness, text: &str) -> ExtractedReference {
        ExtractedReference {
            id: ExtractedReference::reference_id("src", text),
            source_node_id: "src".into(),
            match_text: text.into(),
            span_start: 0,
            span_end: text.chars().count(),
            target,
            completeness,
            relation: RelationType::Cites,
            method: "test".into(),
            context_snippet: text.into(),
        }
    }

    #[test]
    fn test_contextual_resolution_of_bare_article() {
        let (index, d, _) = fixture();
        let refs = extract_references("src", "ai sensi dell'art. 3");
        assert_eq!(refs.len(), 1);
        let source = SourceContext {
            document_id: d.id.clone(),
            node_path: "art1".into(),
        };
        let resolver = Resolver::new(&index, ResolutionPolicy::default());
        let res = resolver.resolve(&refs[0], &source);
        let out = res.outcome();
        assert_eq!(out.stage, ResolutionStage::Contextual);
        assert_eq!(
            out.target,
            ResolutionTarget::Node {
                node_id: "dlgs:74:2000#art3".into(),
                document_id: d.id.clone()
            }
        );
        assert!(out.confidence > 0.0 && out.confidence < 1.0);
        assert_eq!(res.attempts.len(), 2);
        assert_eq!(res.attempts[0].stage, ResolutionStage::Explicit);
    }

    #[test]
    fn test_explicit_resolution() {
        let (index, _, statuto) = fixture();
        let refs = extract_references("src", "l'art. 5 della legge 212/2000");
        let source = SourceContext {
            document_id: "other".into(),
            node_path: "art1".into(),
        };
        let res = Resolver::new(&index, ResolutionPolicy::default()).resolve(&refs[0], &source);
        let out = res.outcome();
        assert_eq!(out.stage, ResolutionStage::Explicit);
        assert_eq!(out.confidence, 1.0);
        assert_eq!(out.target.document_id(), Some(statuto.id.as_str()));
        assert_eq!(out.target.node_id(), Some("legge:212:2000#art5"));
    }

    #[test]
    fn test_relative_article_uses_source_anchor() {
        let (index, d, _) = fixture();
        let r = reference(
            ReferenceTarget {
                path: Some("co2".into()),
                relative: Some(RelativeScope::Article),
                ..Default::default()
            },
            Completeness::Relative,
            "comma 2 del presente articolo",
        );
        let source = SourceContext {
            document_id: d.id.clone(),
            node_path: "art3/co1".into(),
        };
        let out = Resolver::new(&index, ResolutionPolicy::default())
            .resolve(&r, &source)
            .outcome()
            .clone();
        assert_eq!(out.stage, ResolutionStage::Contextual);
        assert_eq!(out.target.node_id(), Some("dlgs:74:2000#art3/co2"));
        let policy = ResolutionPolicy::default();
        assert_eq!(out.confidence, policy.contextual_confidence(4));
    }

    #[test]
    fn test_path_lookup_fallbacks() {
        let (index, d, _) = fixture();
        assert_eq!(index.lookup_path(&d.id, "art7"), Some("dlgs:74:2000#capo2/art7/co1"));
        assert_eq!(index.lookup_path(&d.id, "art7/co1"), Some("dlgs:74:2000#capo2/art7/co1"));
        assert_eq!(index.lookup_path(&d.id, "art9"), None);
    }

    #[test]
    fn test_partial_coordinates_resolve_heuristically() {
        let (index, d, statuto) = fixture();
        let r = reference(
            ReferenceTarget {
                doc_type: Some("legge".into()),
                number: Some("212".into()),
                ..Default::default()
            },
            Completeness::DocumentOnly,
            "la legge n. 212",
        );
        let source = SourceContext {
            document_id: d.id.clone(),
            node_path: "art1".into(),
        };
        let res = Resolver::new(&index, ResolutionPolicy::default()).resolve(&r, &source);
        let out = res.outcome();
        assert_eq!(out.stage, ResolutionStage::Heuristic);
        assert_eq!(out.target.document_id(), Some(statuto.id.as_str()));
        assert!(out.needs_review);
        let expected = ResolutionPolicy::default().heuristic_ceiling * 2.0 / 3.0;
        assert!((out.confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn test_alias_in_context_beats_title_overlap() {
        let (index, d, statuto) = fixture();
        let mut r = reference(
            ReferenceTarget {
                doc_type: Some("legge".into()),
                ..Default::default()
            },
            Completeness::DocumentOnly,
            "la legge",
        );
        r.context_snippet = "come stabilito dallo Statuto del contribuente".into();
        let source = SourceContext {
            document_id: d.id.clone(),
            node_path: "art1".into(),
        };
        let out = Resolver::new(&index, ResolutionPolicy::default())
            .resolve(&r, &source)
            .outcome()
            .clone();
        assert_eq!(out.stage, ResolutionStage::Heuristic);
        assert_eq!(out.target.document_id(), Some(statuto.id.as_str()));
        assert_eq!(out.confidence, ResolutionPolicy::default().heuristic_ceiling);
        assert!(out.confidence < ResolutionPolicy::default().contextual_confidence(MAX_INFERRED));
    }

    #[test]
    fn test_unknown_document_is_manual() {
        let (index, d, _) = fixture();
        let refs = extract_references("src", "il d.p.r. 600/1973");
        let source = SourceContext {
            document_id: d.id.clone(),
            node_path: "art1".into(),
        };
        let res = Resolver::new(&index, ResolutionPolicy::default()).resolve(&refs[0], &source);
        let out = res.outcome();
        assert_eq!(out.stage, ResolutionStage::Manual);
        assert_eq!(out.target, ResolutionTarget::Unresolved);
        assert_eq!(out.confidence, 0.0);
        assert!(out.needs_review);
        assert_eq!(res.attempts.len(), 4);
    }

    #[test]
    fn test_cache_hit_on_repeat() {
        let (index, d, _) = fixture();
        let refs = extract_references("src", "ai sensi dell'art. 3");
        let source = SourceContext {
            document_id: d.id.clone(),
            node_path: "art1".into(),
        };
        let resolver = Resolver::new(&index, ResolutionPolicy::default());
        let first = resolver.resolve(&refs[0], &source);
        let second = resolver.resolve(&refs[0], &source);
        assert!(!first.outcome().cache_hit);
        assert!(second.outcome().cache_hit);
        assert_eq!(first.outcome().target, second.outcome().target);
    }

    #[test]
    fn test_batch_matches_sequential() {
        let (index, d, _) = fixture();
        let source = SourceContext {
            document_id: d.id.clone(),
            node_path: "art1".into(),
        };
        let texts = ["art. 3", "art. 1", "art. 99", "legge 212/2000", "art. 3, comma 2"];
        let items: Vec<(ExtractedReference, SourceContext)> = texts
            .iter()
            .flat_map(|t| extract_references("src", t))
            .map(|r| (r, source.clone()))
            .collect();
        let batch = resolve_batch(&index, ResolutionPolicy::default(), &items);
        let resolver = Resolver::new(&index, ResolutionPolicy::default());
        for ((r, s), res) in items.iter().zip(&batch) {
            assert_eq!(res.outcome().target, resolver.resolve(r, s).outcome().target);
        }
    }

    #[test]
    fn test_supersedes_is_monotone() {
        let make = |confidence: f64| ResolvedReference {
            id: format!("r{confidence}"),
            reference_id: "ref".into(),
            stage: ResolutionStage::Contextual,
            confidence,
            target: ResolutionTarget::Unresolved,
            needs_review: false,
            is_current: true,
            resolved_at: 0,
        };
        assert!(supersedes(None, &make(0.0)));
        assert!(supersedes(Some(&make(0.6)), &make(0.6)));
        assert!(supersedes(Some(&make(0.6)), &make(1.0)));
        assert!(!supersedes(Some(&make(0.6)), &make(0.4)));
    }

    #[test]
    fn test_policy_validation() {
        assert!(ResolutionPolicy::default().validate().is_ok());
        let bad = ResolutionPolicy {
            heuristic_ceiling: 0.55,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = ResolutionPolicy {
            contextual_ceiling: 1.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_contextual_confidence_is_bounded() {
        let policy = ResolutionPolicy::default();
        for inferred in 0..=MAX_INFERRED {
            let c = policy.contextual_confidence(inferred);
            assert!(c > policy.heuristic_ceiling && c < 1.0);
        }
    }
}
