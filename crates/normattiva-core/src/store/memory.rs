//! In-memory [`Store`] implementation for testing.
//!
//! All tables live in one struct behind a `std::sync::RwLock`, so
//! [`commit_version`](Store::commit_version) writes the document, version
//! and nodes under a single write guard.
//! Search is a case-insensitive substring scan over `text_clean`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::models::{
    ConflictEvent, ConflictStatus, Document, DocumentVersion, ExtractedReference, Node, RawInput,
    RawStatus, ResolutionLogEntry, ResolvedReference,
};
use crate::resolver::supersedes;
use crate::text::char_window;

use super::{NodeHit, RecordOutcome, Store, StoreStats};

const SNIPPET_CHARS: usize = 80;

#[derive(Default)]
struct Tables {
    raw: BTreeMap<String, RawInput>,
    documents: BTreeMap<String, Document>,
    /// Version ids in commit order.
    commit_log: Vec<String>,
    versions: HashMap<String, DocumentVersion>,
    nodes: HashMap<String, Node>,
    /// Node ids per version, in document order.
    version_nodes: HashMap<String, Vec<String>>,
    references: BTreeMap<String, ExtractedReference>,
    /// Every recorded resolution per reference, oldest first.
    resolutions: HashMap<String, Vec<ResolvedReference>>,
    log: Vec<ResolutionLogEntry>,
    conflicts: BTreeMap<String, ConflictEvent>,
}

/// In-memory store for tests and small runs.
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

fn merge_document(t: &mut Tables, doc: &Document) {
    match t.documents.get_mut(&doc.id) {
        Some(existing) => {
            if doc.title.is_some() {
                existing.title = doc.title.clone();
            }
            if doc.urn.is_some() {
                existing.urn = doc.urn.clone();
            }
            existing.updated_at = doc.updated_at;
        }
        None => {
            t.documents.insert(doc.id.clone(), doc.clone());
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_raw_input(&self, content_hash: &str) -> Result<Option<RawInput>> {
        Ok(self.read()?.raw.get(content_hash).cloned())
    }

    async fn upsert_raw_input(&self, raw: &RawInput) -> Result<()> {
        let mut t = self.write()?;
        let discovered_at = t
            .raw
            .get(&raw.content_hash)
            .map(|existing| existing.discovered_at)
            .unwrap_or(raw.discovered_at);
        let mut row = raw.clone();
        row.discovered_at = discovered_at;
        t.raw.insert(raw.content_hash.clone(), row);
        Ok(())
    }

    async fn list_raw_inputs(&self, status: Option<RawStatus>) -> Result<Vec<RawInput>> {
        let t = self.read()?;
        let mut rows: Vec<RawInput> = t
            .raw
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.discovered_at
                .cmp(&b.discovered_at)
                .then(a.origin.cmp(&b.origin))
        });
        Ok(rows)
    }

    async fn upsert_document(&self, doc: &Document) -> Result<()> {
        merge_document(&mut *self.write()?, doc);
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.read()?.documents.get(id).cloned())
    }

    async fn find_document(&self, canonical: &str) -> Result<Option<Document>> {
        Ok(self
            .read()?
            .documents
            .values()
            .find(|d| d.canonical == canonical)
            .cloned())
    }

    async fn list_documents(&self) -> Result<Vec<Document>> {
        let t = self.read()?;
        let mut docs: Vec<Document> = t.documents.values().cloned().collect();
        docs.sort_by(|a, b| a.canonical.cmp(&b.canonical));
        Ok(docs)
    }

    async fn commit_version(
        &self,
        document: &Document,
        version: &DocumentVersion,
        nodes: &[Node],
    ) -> Result<()> {
        if version.document_id != document.id {
            bail!(
                "version {} belongs to document {}, not {}",
                version.id,
                version.document_id,
                document.id
            );
        }
        let mut t = self.write()?;
        merge_document(&mut t, document);
        if let Some(old_ids) = t.version_nodes.remove(&version.id) {
            for id in old_ids {
                t.nodes.remove(&id);
            }
        }
        if !t.versions.contains_key(&version.id) {
            t.commit_log.push(version.id.clone());
        }
        t.versions.insert(version.id.clone(), version.clone());
        let mut ids = Vec::with_capacity(nodes.len());
        for node in nodes {
            ids.push(node.id.clone());
            t.nodes.insert(node.id.clone(), node.clone());
        }
        t.version_nodes.insert(version.id.clone(), ids);
        Ok(())
    }

    async fn get_version(&self, id: &str) -> Result<Option<DocumentVersion>> {
        Ok(self.read()?.versions.get(id).cloned())
    }

    async fn find_version(
        &self,
        document_id: &str,
        version_tag: &str,
    ) -> Result<Option<DocumentVersion>> {
        Ok(self
            .read()?
            .versions
            .values()
            .find(|v| v.document_id == document_id && v.version_tag == version_tag)
            .cloned())
    }

    async fn latest_version(&self, document_id: &str) -> Result<Option<DocumentVersion>> {
        let t = self.read()?;
        Ok(t.commit_log
            .iter()
            .rev()
            .filter_map(|id| t.versions.get(id))
            .find(|v| v.document_id == document_id)
            .cloned())
    }

    async fn list_versions(&self, document_id: &str) -> Result<Vec<DocumentVersion>> {
        let t = self.read()?;
        let mut versions: Vec<(usize, &DocumentVersion)> = t
            .commit_log
            .iter()
            .enumerate()
            .filter_map(|(i, id)| t.versions.get(id).map(|v| (i, v)))
            .filter(|(_, v)| v.document_id == document_id)
            .collect();
        versions.sort_by(|(ia, a), (ib, b)| a.validity.from.cmp(&b.validity.from).then(ia.cmp(ib)));
        Ok(versions.into_iter().map(|(_, v)| v.clone()).collect())
    }

    async fn get_node(&self, id: &str) -> Result<Option<Node>> {
        Ok(self.read()?.nodes.get(id).cloned())
    }

    async fn list_nodes(&self, version_id: &str) -> Result<Vec<Node>> {
        let t = self.read()?;
        let Some(ids) = t.version_nodes.get(version_id) else {
            return Ok(Vec::new());
        };
        let mut nodes: Vec<Node> = ids.iter().filter_map(|id| t.nodes.get(id)).cloned().collect();
        nodes.sort_by_key(|n| n.ordinal);
        Ok(nodes)
    }

    async fn search_nodes(&self, query: &str, limit: i64) -> Result<Vec<NodeHit>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() || limit <= 0 {
            return Ok(Vec::new());
        }
        let t = self.read()?;
        let mut hits: Vec<NodeHit> = t
            .nodes
            .values()
            .filter_map(|node| {
                let haystack = node.text_clean.to_lowercase();
                let count = haystack.matches(&needle).count();
                if count == 0 {
                    return None;
                }
                let byte_start = haystack.find(&needle)?;
                let start = haystack[..byte_start].chars().count();
                let end = start + needle.chars().count();
                Some(NodeHit {
                    node_id: node.id.clone(),
                    document_id: node.document_id.clone(),
                    version_id: node.version_id.clone(),
                    canonical_path: node.canonical_path.clone(),
                    hierarchy_string: node.hierarchy_string.clone(),
                    snippet: char_window(&node.text_clean, start, end, SNIPPET_CHARS),
                    score: count as f64,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.canonical_path.cmp(&b.canonical_path))
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        hits.truncate(limit as usize);
        Ok(hits)
    }

    async fn insert_reference(&self, reference: &ExtractedReference) -> Result<bool> {
        let mut t = self.write()?;
        if t.references.contains_key(&reference.id) {
            return Ok(false);
        }
        t.references.insert(reference.id.clone(), reference.clone());
        Ok(true)
    }

    async fn get_reference(&self, id: &str) -> Result<Option<ExtractedReference>> {
        Ok(self.read()?.references.get(id).cloned())
    }

    async fn list_references(
        &self,
        source_node_id: Option<&str>,
    ) -> Result<Vec<ExtractedReference>> {
        let t = self.read()?;
        let mut refs: Vec<ExtractedReference> = t
            .references
            .values()
            .filter(|r| source_node_id.map_or(true, |id| r.source_node_id == id))
            .cloned()
            .collect();
        refs.sort_by(|a, b| {
            a.source_node_id
                .cmp(&b.source_node_id)
                .then(a.span_start.cmp(&b.span_start))
        });
        Ok(refs)
    }

    async fn record_resolution(&self, candidate: &ResolvedReference) -> Result<RecordOutcome> {
        let mut t = self.write()?;
        let history = t
            .resolutions
            .entry(candidate.reference_id.clone())
            .or_default();
        let current = history.iter().position(|r| r.is_current);

        if let Some(i) = current {
            if history[i].id == candidate.id {
                return Ok(RecordOutcome::Unchanged);
            }
        }

        let install = supersedes(current.map(|i| &history[i]), candidate);
        if install {
            if let Some(i) = current {
                history[i].is_current = false;
            }
        }
        match history.iter_mut().find(|r| r.id == candidate.id) {
            Some(existing) => {
                existing.is_current = install;
                if install {
                    existing.confidence = candidate.confidence;
                    existing.needs_review = candidate.needs_review;
                    existing.resolved_at = candidate.resolved_at;
                }
            }
            None => {
                let mut row = candidate.clone();
                row.is_current = install;
                history.push(row);
            }
        }
        Ok(if install {
            RecordOutcome::Installed
        } else {
            RecordOutcome::KeptExisting
        })
    }

    async fn current_resolution(&self, reference_id: &str) -> Result<Option<ResolvedReference>> {
        Ok(self
            .read()?
            .resolutions
            .get(reference_id)
            .and_then(|h| h.iter().find(|r| r.is_current))
            .cloned())
    }

    async fn resolution_history(&self, reference_id: &str) -> Result<Vec<ResolvedReference>> {
        Ok(self
            .read()?
            .resolutions
            .get(reference_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_current_resolutions(&self) -> Result<Vec<ResolvedReference>> {
        let t = self.read()?;
        let mut current: Vec<ResolvedReference> = t
            .resolutions
            .values()
            .filter_map(|h| h.iter().find(|r| r.is_current))
            .cloned()
            .collect();
        current.sort_by(|a, b| a.reference_id.cmp(&b.reference_id));
        Ok(current)
    }

    async fn append_resolution_log(&self, entries: &[ResolutionLogEntry]) -> Result<()> {
        self.write()?.log.extend_from_slice(entries);
        Ok(())
    }

    async fn list_resolution_log(&self, reference_id: &str) -> Result<Vec<ResolutionLogEntry>> {
        Ok(self
            .read()?
            .log
            .iter()
            .filter(|e| e.reference_id == reference_id)
            .cloned()
            .collect())
    }

    async fn insert_conflict(&self, conflict: &ConflictEvent) -> Result<bool> {
        let mut t = self.write()?;
        if t.conflicts.values().any(|c| c.dedup_key == conflict.dedup_key) {
            return Ok(false);
        }
        t.conflicts.insert(conflict.id.clone(), conflict.clone());
        Ok(true)
    }

    async fn get_conflict(&self, id: &str) -> Result<Option<ConflictEvent>> {
        Ok(self.read()?.conflicts.get(id).cloned())
    }

    async fn list_conflicts(&self, status: Option<ConflictStatus>) -> Result<Vec<ConflictEvent>> {
        let t = self.read()?;
        let mut rows: Vec<ConflictEvent> = t
            .conflicts
            .values()
            .filter(|c| status.map_or(true, |s| c.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(a.detected_at.cmp(&b.detected_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(rows)
    }

    async fn update_conflict(&self, conflict: &ConflictEvent) -> Result<()> {
        let mut t = self.write()?;
        let existing = t
            .conflicts
            .get_mut(&conflict.id)
            .ok_or_else(|| anyhow!("conflict not found: {}", conflict.id))?;
        existing.status = conflict.status;
        existing.reviewer = conflict.reviewer.clone();
        existing.review_note = conflict.review_note.clone();
        existing.decision = conflict.decision.clone();
        existing.updated_at = conflict.updated_at;
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let t = self.read()?;
        let count = |n: usize| n as i64;
        let current: Vec<&ResolvedReference> = t
            .resolutions
            .values()
            .filter_map(|h| h.iter().find(|r| r.is_current))
            .collect();
        let conflicts_with = |s: ConflictStatus| {
            count(t.conflicts.values().filter(|c| c.status == s).count())
        };
        Ok(StoreStats {
            raw_inputs: count(t.raw.len()),
            raw_errors: count(t.raw.values().filter(|r| r.status == RawStatus::Error).count()),
            documents: count(t.documents.len()),
            versions: count(t.versions.len()),
            snapshots: count(t.versions.values().filter(|v| v.is_snapshot()).count()),
            deltas: count(t.versions.values().filter(|v| !v.is_snapshot()).count()),
            nodes: count(t.nodes.len()),
            references: count(t.references.len()),
            resolved: count(current.iter().filter(|r| r.target.is_resolved()).count()),
            unresolved: count(current.iter().filter(|r| !r.target.is_resolved()).count()),
            resolution_log: count(t.log.len()),
            conflicts_pending: conflicts_with(ConflictStatus::Pending),
            conflicts_reviewed: conflicts_with(ConflictStatus::Reviewed),
            conflicts_resolved: conflicts_with(ConflictStatus::Resolved),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        DocumentKey, ResolutionStage, ResolutionTarget, ValidityInterval, VersionStorage,
    };
    use chrono::NaiveDate;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn document() -> Document {
        let key = DocumentKey::new("legge", Some("212"), Some(2000));
        Document::from_key(&key, Some("Statuto".into()), None, 100)
    }

    fn version(doc: &Document, tag: &str, from: &str, at: i64) -> DocumentVersion {
        DocumentVersion {
            id: DocumentVersion::version_id(&doc.id, tag),
            document_id: doc.id.clone(),
            version_tag: tag.into(),
            validity: ValidityInterval::new(day(from), None),
            checksum: "c".into(),
            storage: VersionStorage::Full {
                text: String::new(),
            },
            source_raw_hash: None,
            ingested_at: at,
        }
    }

    fn node(version: &DocumentVersion, path: &str, text: &str, ordinal: i64) -> Node {
        Node {
            id: Node::node_id(&version.id, path),
            document_id: version.document_id.clone(),
            version_id: version.id.clone(),
            kind: "articolo".into(),
            label: path.into(),
            canonical_path: path.into(),
            hierarchy_string: path.into(),
            heading: None,
            text_clean: text.into(),
            text_raw_snippet: text.into(),
            ordinal,
            source_url: None,
            inline_refs: vec![],
        }
    }

    fn resolution(reference_id: &str, stage: ResolutionStage, confidence: f64) -> ResolvedReference {
        ResolvedReference {
            id: format!("{reference_id}:{}", stage.as_str()),
            reference_id: reference_id.into(),
            stage,
            confidence,
            target: ResolutionTarget::Document {
                document_id: "d".into(),
            },
            needs_review: false,
            is_current: false,
            resolved_at: 0,
        }
    }

    #[tokio::test]
    async fn test_document_upsert_keeps_created_at_and_title() {
        let store = InMemoryStore::new();
        let doc = document();
        store.upsert_document(&doc).await.unwrap();

        let mut again = doc.clone();
        again.title = None;
        again.created_at = 999;
        again.updated_at = 999;
        store.upsert_document(&again).await.unwrap();

        let got = store.find_document("legge:212:2000").await.unwrap().unwrap();
        assert_eq!(got.created_at, 100);
        assert_eq!(got.updated_at, 999);
        assert_eq!(got.title.as_deref(), Some("Statuto"));
    }

    #[tokio::test]
    async fn test_versions_are_ordered_by_validity_and_latest_by_commit() {
        let store = InMemoryStore::new();
        let doc = document();
        let late = version(&doc, "b", "2021-01-01", 1);
        let early = version(&doc, "a", "2020-01-01", 2);
        store.commit_version(&doc, &late, &[]).await.unwrap();
        store.commit_version(&doc, &early, &[]).await.unwrap();

        let tags: Vec<String> = store
            .list_versions(&doc.id)
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.version_tag)
            .collect();
        assert_eq!(tags, vec!["a", "b"]);
        let latest = store.latest_version(&doc.id).await.unwrap().unwrap();
        assert_eq!(latest.version_tag, "a");
        assert!(store.find_version(&doc.id, "b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_commit_version_writes_document_with_version() {
        let store = InMemoryStore::new();
        let doc = document();
        let v = version(&doc, "a", "2020-01-01", 1);
        store.commit_version(&doc, &v, &[node(&v, "art1", "Testo.", 0)]).await.unwrap();
        assert_eq!(store.list_documents().await.unwrap().len(), 1);

        let other = Document::from_key(&DocumentKey::new("legge", Some("1"), Some(1999)), None, None, 5);
        let stray = version(&other, "b", "2020-01-01", 2);
        assert!(store.commit_version(&doc, &stray, &[]).await.is_err());
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.versions, 1);
    }

    #[tokio::test]
    async fn test_nodes_in_document_order_and_search() {
        let store = InMemoryStore::new();
        let doc = document();
        let v = version(&doc, "a", "2020-01-01", 1);
        let nodes = vec![
            node(&v, "art2", "Il contribuente ha diritto.", 1),
            node(&v, "art1", "Le disposizioni della presente legge.", 0),
        ];
        store.commit_version(&doc, &v, &nodes).await.unwrap();

        let listed = store.list_nodes(&v.id).await.unwrap();
        assert_eq!(listed[0].canonical_path, "art1");

        let hits = store.search_nodes("CONTRIBUENTE", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].canonical_path, "art2");
        assert!(hits[0].snippet.contains("contribuente"));
        assert!(store.search_nodes("   ", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reference_insert_is_idempotent() {
        let store = InMemoryStore::new();
        let refs = crate::references::extract_references("n1", "ai sensi dell'art. 3");
        assert_eq!(refs.len(), 1);
        assert!(store.insert_reference(&refs[0]).await.unwrap());
        assert!(!store.insert_reference(&refs[0]).await.unwrap());
        assert_eq!(store.list_references(Some("n1")).await.unwrap().len(), 1);
        assert!(store.list_references(Some("n2")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolution_is_monotone() {
        let store = InMemoryStore::new();
        let strong = resolution("r1", ResolutionStage::Contextual, 0.8);
        let weak = resolution("r1", ResolutionStage::Heuristic, 0.3);

        assert_eq!(store.record_resolution(&strong).await.unwrap(), RecordOutcome::Installed);
        assert_eq!(store.record_resolution(&strong).await.unwrap(), RecordOutcome::Unchanged);
        assert_eq!(store.record_resolution(&weak).await.unwrap(), RecordOutcome::KeptExisting);

        let current = store.current_resolution("r1").await.unwrap().unwrap();
        assert_eq!(current.stage, ResolutionStage::Contextual);
        let history = store.resolution_history("r1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.iter().filter(|r| r.is_current).count(), 1);

        let explicit = resolution("r1", ResolutionStage::Explicit, 1.0);
        store.record_resolution(&explicit).await.unwrap();
        let current = store.current_resolution("r1").await.unwrap().unwrap();
        assert_eq!(current.stage, ResolutionStage::Explicit);
        assert_eq!(store.list_current_resolutions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_insert_dedups_and_keeps_status() {
        use crate::conflicts::{detect, node_modifications, review, ConflictPolicy};

        let store = InMemoryStore::new();
        let doc = document();
        let mut v1 = version(&doc, "v1", "2020-01-01", 1);
        v1.validity.to = Some(day("2021-01-01"));
        let v2 = version(&doc, "v2", "2020-06-01", 2);
        let input = vec![
            (v1.clone(), vec![node(&v1, "art5", "Originale.", 0)]),
            (v2.clone(), vec![node(&v2, "art5", "Nuovo.", 0)]),
        ];
        let conflicts = detect(&node_modifications(&input), &ConflictPolicy::default(), 1);
        assert_eq!(conflicts.len(), 1);
        assert!(store.insert_conflict(&conflicts[0]).await.unwrap());

        let mut reviewed = conflicts[0].clone();
        review(&mut reviewed, "mrossi", None, 2).unwrap();
        store.update_conflict(&reviewed).await.unwrap();

        let rerun = detect(&node_modifications(&input), &ConflictPolicy::default(), 3);
        assert!(!store.insert_conflict(&rerun[0]).await.unwrap());
        let stored = store.get_conflict(&conflicts[0].id).await.unwrap().unwrap();
        assert_eq!(stored.status, ConflictStatus::Reviewed);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.conflicts_reviewed, 1);
        assert_eq!(stats.conflicts_pending, 0);
    }
}
