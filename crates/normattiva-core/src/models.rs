//! Core data models shared by the parser, the version store, the resolver,
//! and the conflict detector.
//!
//! Identities are deterministic: every id is a UUIDv5 derived from the
//! entity's natural key, so re-running a pass produces the same ids and
//! every write can be an idempotent upsert.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::delta::Patch;

/// Namespace for all deterministic ids minted by this crate.
const ID_NAMESPACE: Uuid = Uuid::from_u128(0x6e6f_726d_6174_7469_7661_2d6b_622d_6964);

/// Derive a stable id from natural-key parts.
pub fn stable_id(parts: &[&str]) -> String {
    Uuid::new_v5(&ID_NAMESPACE, parts.join("\u{1f}").as_bytes()).to_string()
}

// ─── Raw inputs ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawStatus {
    New,
    Processed,
    Error,
}

impl RawStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RawStatus::New => "new",
            RawStatus::Processed => "processed",
            RawStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(RawStatus::New),
            "processed" => Some(RawStatus::Processed),
            "error" => Some(RawStatus::Error),
            _ => None,
        }
    }
}

/// An ingested file, identified by the SHA-256 of its bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawInput {
    pub content_hash: String,
    /// Path on disk, or `archive.zip!entry.xml` for zip members.
    pub origin: String,
    pub size: i64,
    pub status: RawStatus,
    pub error: Option<String>,
    pub discovered_at: i64,
}

// ─── Documents and versions ─────────────────────────────────────────

/// Canonical coordinates of a legal act.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    pub doc_type: String,
    pub number: Option<String>,
    pub year: Option<i32>,
}

impl DocumentKey {
    pub fn new(doc_type: &str, number: Option<&str>, year: Option<i32>) -> Self {
        Self {
            doc_type: normalize_doc_type(doc_type),
            number: number
                .map(|n| n.trim().to_lowercase())
                .filter(|n| !n.is_empty()),
            year,
        }
    }

    /// `"{doc_type}:{number}:{year}"`, with `0` standing in for missing parts.
    pub fn canonical(&self) -> String {
        format!(
            "{}:{}:{}",
            self.doc_type,
            self.number.as_deref().unwrap_or("0"),
            self.year.map(|y| y.to_string()).unwrap_or_else(|| "0".into())
        )
    }

    pub fn parse_canonical(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, ':');
        let doc_type = parts.next()?;
        let number = parts.next()?;
        let year = parts.next()?;
        let number = (number != "0").then_some(number);
        let year = year.parse::<i32>().ok().filter(|y| *y != 0);
        Some(Self::new(doc_type, number, year))
    }

    pub fn is_complete(&self) -> bool {
        self.doc_type != "altro" && self.number.is_some() && self.year.is_some()
    }

    pub fn document_id(&self) -> String {
        stable_id(&["document", &self.canonical()])
    }
}

/// Map the many spellings of an act type onto one canonical token.
pub fn normalize_doc_type(raw: &str) -> String {
    let t: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '.' && *c != '_' && *c != '-')
        .collect();
    let canonical = match t.as_str() {
        "" => "altro",
        "l" | "legge" | "leggen" | "ln" => "legge",
        "dlgs" | "decretolegislativo" => "dlgs",
        "dl" | "decretolegge" => "dl",
        "dpr" | "decretodelpresidentedellarepubblica" | "decretopresidenterepubblica" => "dpr",
        "dm" | "decretoministeriale" => "dm",
        "dpcm" => "dpcm",
        "rd" | "regiodecreto" => "rd",
        "cost" | "costituzione" => "costituzione",
        other => return other.to_string(),
    };
    canonical.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub canonical: String,
    pub doc_type: String,
    pub number: Option<String>,
    pub year: Option<i32>,
    pub title: Option<String>,
    pub urn: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Document {
    pub fn from_key(key: &DocumentKey, title: Option<String>, urn: Option<String>, now: i64) -> Self {
        Self {
            id: key.document_id(),
            canonical: key.canonical(),
            doc_type: key.doc_type.clone(),
            number: key.number.clone(),
            year: key.year,
            title: title.map(|t| normalize_title(&t)).filter(|t| !t.is_empty()),
            urn,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> DocumentKey {
        DocumentKey {
            doc_type: self.doc_type.clone(),
            number: self.number.clone(),
            year: self.year,
        }
    }
}

/// Collapse whitespace in a title without otherwise rewriting it.
pub fn normalize_title(title: &str) -> String {
    title.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Half-open validity interval `[from, to)`; `to = None` means in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityInterval {
    pub from: NaiveDate,
    pub to: Option<NaiveDate>,
}

impl ValidityInterval {
    pub fn new(from: NaiveDate, to: Option<NaiveDate>) -> Self {
        Self { from, to }
    }

    pub fn is_open(&self) -> bool {
        self.to.is_none()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.from && self.to.map_or(true, |to| date < to)
    }

    pub fn overlaps(&self, other: &ValidityInterval) -> bool {
        let starts_before_other_ends = other.to.map_or(true, |to| self.from < to);
        let other_starts_before_end = self.to.map_or(true, |to| other.from < to);
        starts_before_other_ends && other_starts_before_end
    }

    /// Length of the shared interval in days. `Some(None)` means the overlap
    /// is unbounded (both open-ended), `None` means no overlap at all.
    pub fn overlap_days(&self, other: &ValidityInterval) -> Option<Option<i64>> {
        if !self.overlaps(other) {
            return None;
        }
        let start = self.from.max(other.from);
        let end = match (self.to, other.to) {
            (None, None) => return Some(None),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (Some(a), Some(b)) => a.min(b),
        };
        Some(Some((end - start).num_days()))
    }
}

/// How a version's text is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VersionStorage {
    Full {
        text: String,
    },
    Delta {
        base_version_id: String,
        patch: Patch,
        chain_depth: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentVersion {
    pub id: String,
    pub document_id: String,
    pub version_tag: String,
    pub validity: ValidityInterval,
    pub checksum: String,
    pub storage: VersionStorage,
    pub source_raw_hash: Option<String>,
    pub ingested_at: i64,
}

impl DocumentVersion {
    pub fn version_id(document_id: &str, version_tag: &str) -> String {
        stable_id(&["version", document_id, version_tag])
    }

    /// Number of patches between this version and its snapshot.
    pub fn chain_depth(&self) -> u32 {
        match &self.storage {
            VersionStorage::Full { .. } => 0,
            VersionStorage::Delta { chain_depth, .. } => *chain_depth,
        }
    }

    pub fn is_snapshot(&self) -> bool {
        matches!(self.storage, VersionStorage::Full { .. })
    }
}

// ─── Nodes ──────────────────────────────────────────────────────────

/// A cross-reference-bearing inline element, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineRef {
    pub href: Option<String>,
    pub text: String,
    /// Char offset of `text` in the node's cleaned text.
    #[serde(default)]
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub document_id: String,
    pub version_id: String,
    /// Markup tag that opened this node (e.g. `articolo`, `paragraph`).
    pub kind: String,
    pub label: String,
    pub canonical_path: String,
    pub hierarchy_string: String,
    pub heading: Option<String>,
    pub text_clean: String,
    pub text_raw_snippet: String,
    pub ordinal: i64,
    pub source_url: Option<String>,
    pub inline_refs: Vec<InlineRef>,
}

impl Node {
    pub fn node_id(version_id: &str, canonical_path: &str) -> String {
        stable_id(&["node", version_id, canonical_path])
    }
}

// ─── References ─────────────────────────────────────────────────────

/// How much of the target address the citation itself spells out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completeness {
    /// Document coordinates and a provision path.
    Full,
    /// Document coordinates only.
    DocumentOnly,
    /// Provision path without a document.
    PathOnly,
    /// "this article", "the present decree", ...
    Relative,
}

impl Completeness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Completeness::Full => "full",
            Completeness::DocumentOnly => "document_only",
            Completeness::PathOnly => "path_only",
            Completeness::Relative => "relative",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(Completeness::Full),
            "document_only" => Some(Completeness::DocumentOnly),
            "path_only" => Some(Completeness::PathOnly),
            "relative" => Some(Completeness::Relative),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    Cites,
    Amends,
    Repeals,
    Derogates,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::Cites => "cites",
            RelationType::Amends => "amends",
            RelationType::Repeals => "repeals",
            RelationType::Derogates => "derogates",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cites" => Some(RelationType::Cites),
            "amends" => Some(RelationType::Amends),
            "repeals" => Some(RelationType::Repeals),
            "derogates" => Some(RelationType::Derogates),
            _ => None,
        }
    }

    /// Relations that change the text of their target.
    pub fn is_modifying(&self) -> bool {
        matches!(self, RelationType::Amends | RelationType::Repeals)
    }
}

/// Scope of a relative citation such as "presente articolo".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelativeScope {
    Document,
    Article,
    Comma,
}

/// Best-effort structured guess at what a citation points to. A lookup key,
/// never an owning edge: the target may not exist in the corpus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReferenceTarget {
    pub doc_type: Option<String>,
    pub number: Option<String>,
    pub year: Option<i32>,
    /// Path fragment in canonical form, e.g. `art3/co2/leta`.
    pub path: Option<String>,
    pub alias: Option<String>,
    pub urn: Option<String>,
    pub relative: Option<RelativeScope>,
}

impl ReferenceTarget {
    pub fn document_key(&self) -> Option<DocumentKey> {
        match (&self.doc_type, &self.number, self.year) {
            (Some(t), Some(n), Some(y)) => Some(DocumentKey::new(t, Some(n), Some(y))),
            _ => None,
        }
    }

    /// Number of document coordinates (type, number, year) present.
    pub fn document_coordinates(&self) -> usize {
        usize::from(self.doc_type.is_some())
            + usize::from(self.number.is_some())
            + usize::from(self.year.is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedReference {
    pub id: String,
    pub source_node_id: String,
    pub match_text: String,
    /// Character (not byte) offsets into the node's `text_clean`.
    pub span_start: usize,
    pub span_end: usize,
    pub target: ReferenceTarget,
    pub completeness: Completeness,
    pub relation: RelationType,
    pub method: String,
    pub context_snippet: String,
}

impl ExtractedReference {
    pub fn reference_id(source_node_id: &str, match_text: &str) -> String {
        stable_id(&["reference", source_node_id, match_text])
    }
}

// ─── Resolution ─────────────────────────────────────────────────────

/// The four resolution stages, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStage {
    Explicit,
    Contextual,
    Heuristic,
    Manual,
}

impl ResolutionStage {
    pub const ORDER: [ResolutionStage; 4] = [
        ResolutionStage::Explicit,
        ResolutionStage::Contextual,
        ResolutionStage::Heuristic,
        ResolutionStage::Manual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStage::Explicit => "explicit",
            ResolutionStage::Contextual => "contextual",
            ResolutionStage::Heuristic => "heuristic",
            ResolutionStage::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "explicit" => Some(ResolutionStage::Explicit),
            "contextual" => Some(ResolutionStage::Contextual),
            "heuristic" => Some(ResolutionStage::Heuristic),
            "manual" => Some(ResolutionStage::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolutionTarget {
    Node { node_id: String, document_id: String },
    Document { document_id: String },
    Unresolved,
}

impl ResolutionTarget {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, ResolutionTarget::Unresolved)
    }

    pub fn document_id(&self) -> Option<&str> {
        match self {
            ResolutionTarget::Node { document_id, .. } => Some(document_id),
            ResolutionTarget::Document { document_id } => Some(document_id),
            ResolutionTarget::Unresolved => None,
        }
    }

    pub fn node_id(&self) -> Option<&str> {
        match self {
            ResolutionTarget::Node { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedReference {
    pub id: String,
    pub reference_id: String,
    pub stage: ResolutionStage,
    pub confidence: f64,
    pub target: ResolutionTarget,
    pub needs_review: bool,
    pub is_current: bool,
    pub resolved_at: i64,
}

/// Append-only audit record of one resolution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionLogEntry {
    pub id: String,
    pub reference_id: String,
    pub stage: ResolutionStage,
    pub match_text: String,
    pub source_document_id: Option<String>,
    pub target: ResolutionTarget,
    pub confidence: f64,
    pub cache_hit: bool,
    pub attempted_at: i64,
}

// ─── Conflicts ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModificationKind {
    Addition,
    Replacement,
    Repeal,
}

impl ModificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModificationKind::Addition => "addition",
            ModificationKind::Replacement => "replacement",
            ModificationKind::Repeal => "repeal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "addition" => Some(ModificationKind::Addition),
            "replacement" => Some(ModificationKind::Replacement),
            "repeal" => Some(ModificationKind::Repeal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    pub fn raised(self) -> Self {
        match self {
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High | Severity::Critical => Severity::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Reviewed,
    Resolved,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStatus::Pending => "pending",
            ConflictStatus::Reviewed => "reviewed",
            ConflictStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ConflictStatus::Pending),
            "reviewed" => Some(ConflictStatus::Reviewed),
            "resolved" => Some(ConflictStatus::Resolved),
            _ => None,
        }
    }
}

/// One of the two modifications that make up a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictSide {
    pub version_id: String,
    /// Document whose version carries the modification.
    pub source_document_id: String,
    pub node_id: Option<String>,
    pub validity: ValidityInterval,
    pub kind: ModificationKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictEvent {
    pub id: String,
    pub dedup_key: String,
    pub target_document_id: String,
    pub canonical_path: String,
    pub side_a: ConflictSide,
    pub side_b: ConflictSide,
    pub severity: Severity,
    pub status: ConflictStatus,
    pub reviewer: Option<String>,
    pub review_note: Option<String>,
    pub decision: Option<String>,
    pub detected_at: i64,
    pub updated_at: i64,
}

// ─── Export ─────────────────────────────────────────────────────────

/// Flat, retrieval-ready projection of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub id: String,
    pub document_title: Option<String>,
    pub hierarchy: String,
    pub text: String,
    pub source_url: Option<String>,
}

impl ExportRecord {
    pub fn project(node: &Node, document: Option<&Document>) -> Self {
        Self {
            id: node.id.clone(),
            document_title: document.and_then(|d| d.title.clone()),
            hierarchy: node.hierarchy_string.clone(),
            text: node.text_clean.clone(),
            source_url: node.source_url.clone(),
        }
    }
}
