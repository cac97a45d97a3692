//! Storage abstraction for the knowledge base.
//!
//! The [`Store`] trait defines every persistence operation the batch passes
//! and the query surface need, so the same pipeline runs against SQLite in
//! production and [`memory::InMemoryStore`] in tests.
//!
//! All writes are idempotent: entities are keyed by deterministic ids, and
//! the insert-if-absent operations report whether anything was written.
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{
    ConflictEvent, ConflictStatus, Document, DocumentVersion, ExtractedReference, Node, RawInput,
    RawStatus, ResolutionLogEntry, ResolvedReference,
};

/// A node matched by full-text search.
#[derive(Debug, Clone, Serialize)]
pub struct NodeHit {
    pub node_id: String,
    pub document_id: String,
    pub version_id: String,
    pub canonical_path: String,
    pub hierarchy_string: String,
    pub snippet: String,
    pub score: f64,
}

/// What [`Store::record_resolution`] did with a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    /// Candidate became the current resolution.
    Installed,
    /// Existing resolution had higher confidence; candidate kept as history.
    KeptExisting,
    /// The same resolution was already current.
    Unchanged,
}

/// Row counts for `nkb stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub raw_inputs: i64,
    pub raw_errors: i64,
    pub documents: i64,
    pub versions: i64,
    pub snapshots: i64,
    pub deltas: i64,
    pub nodes: i64,
    pub references: i64,
    pub resolved: i64,
    pub unresolved: i64,
    pub resolution_log: i64,
    pub conflicts_pending: i64,
    pub conflicts_reviewed: i64,
    pub conflicts_resolved: i64,
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Group | Methods |
/// |-------|---------|
/// | Raw inputs | [`get_raw_input`](Store::get_raw_input), [`upsert_raw_input`](Store::upsert_raw_input), [`list_raw_inputs`](Store::list_raw_inputs) |
/// | Documents | [`upsert_document`](Store::upsert_document), [`get_document`](Store::get_document), [`find_document`](Store::find_document), [`list_documents`](Store::list_documents) |
/// | Versions | [`commit_version`](Store::commit_version), [`get_version`](Store::get_version), [`find_version`](Store::find_version), [`latest_version`](Store::latest_version), [`list_versions`](Store::list_versions) |
/// | Nodes | [`get_node`](Store::get_node), [`list_nodes`](Store::list_nodes), [`search_nodes`](Store::search_nodes) |
/// | References | [`insert_reference`](Store::insert_reference), [`list_references`](Store::list_references) |
/// | Resolutions | [`record_resolution`](Store::record_resolution), [`current_resolution`](Store::current_resolution), [`resolution_history`](Store::resolution_history), [`append_resolution_log`](Store::append_resolution_log) |
/// | Conflicts | [`insert_conflict`](Store::insert_conflict), [`get_conflict`](Store::get_conflict), [`list_conflicts`](Store::list_conflicts), [`update_conflict`](Store::update_conflict) |
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_raw_input(&self, content_hash: &str) -> Result<Option<RawInput>>;

    async fn upsert_raw_input(&self, raw: &RawInput) -> Result<()>;

    async fn list_raw_inputs(&self, status: Option<RawStatus>) -> Result<Vec<RawInput>>;

    /// Insert or update a document. `created_at` of an existing row is kept;
    /// title and URN are only overwritten by present values.
    async fn upsert_document(&self, doc: &Document) -> Result<()>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    /// Look up by canonical key, e.g. `legge:212:2000`.
    async fn find_document(&self, canonical: &str) -> Result<Option<Document>>;

    async fn list_documents(&self) -> Result<Vec<Document>>;

    /// Upsert the owning document and persist a version with its nodes
    /// atomically. Nothing is written if any part fails, so a rejected unit
    /// never leaves a document without versions.
    async fn commit_version(
        &self,
        document: &Document,
        version: &DocumentVersion,
        nodes: &[Node],
    ) -> Result<()>;

    async fn get_version(&self, id: &str) -> Result<Option<DocumentVersion>>;

    async fn find_version(
        &self,
        document_id: &str,
        version_tag: &str,
    ) -> Result<Option<DocumentVersion>>;

    /// Most recently committed version of a document.
    async fn latest_version(&self, document_id: &str) -> Result<Option<DocumentVersion>>;

    /// Versions ordered by `valid_from`, then commit order.
    async fn list_versions(&self, document_id: &str) -> Result<Vec<DocumentVersion>>;

    async fn get_node(&self, id: &str) -> Result<Option<Node>>;

    /// Nodes of a version in document order.
    async fn list_nodes(&self, version_id: &str) -> Result<Vec<Node>>;

    async fn search_nodes(&self, query: &str, limit: i64) -> Result<Vec<NodeHit>>;

    /// Insert if absent; returns `true` when a row was written.
    async fn insert_reference(&self, reference: &ExtractedReference) -> Result<bool>;

    async fn get_reference(&self, id: &str) -> Result<Option<ExtractedReference>>;

    /// All references, or those of one source node.
    async fn list_references(&self, source_node_id: Option<&str>)
        -> Result<Vec<ExtractedReference>>;

    /// Store a candidate resolution, applying
    /// [`supersedes`](crate::resolver::supersedes) against the current one.
    async fn record_resolution(&self, candidate: &ResolvedReference) -> Result<RecordOutcome>;

    async fn current_resolution(&self, reference_id: &str) -> Result<Option<ResolvedReference>>;

    /// Every resolution ever recorded for a reference, oldest first.
    async fn resolution_history(&self, reference_id: &str) -> Result<Vec<ResolvedReference>>;

    async fn list_current_resolutions(&self) -> Result<Vec<ResolvedReference>>;

    async fn append_resolution_log(&self, entries: &[ResolutionLogEntry]) -> Result<()>;

    async fn list_resolution_log(&self, reference_id: &str) -> Result<Vec<ResolutionLogEntry>>;

    /// Insert if no conflict with the same dedup key exists; returns `true`
    /// when a row was written.
    async fn insert_conflict(&self, conflict: &ConflictEvent) -> Result<bool>;

    async fn get_conflict(&self, id: &str) -> Result<Option<ConflictEvent>>;

    async fn list_conflicts(&self, status: Option<ConflictStatus>) -> Result<Vec<ConflictEvent>>;

    /// Persist lifecycle fields (status, reviewer, note, decision).
    async fn update_conflict(&self, conflict: &ConflictEvent) -> Result<()>;

    async fn stats(&self) -> Result<StoreStats>;
}
