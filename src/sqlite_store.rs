//! SQLite-backed [`Store`] implementation.
//!
//! Every multi-statement write runs in one transaction. Node text is
//! mirrored into the `nodes_fts` FTS5 table for [`Store::search_nodes`].

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteRow};
use sqlx::{Row, SqlitePool};

use normattiva_core::delta::Patch;
use normattiva_core::models::{
    Completeness, ConflictEvent, ConflictSide, ConflictStatus, Document, DocumentVersion,
    ExtractedReference, InlineRef, Node, RawInput, RawStatus, ReferenceTarget, RelationType,
    ResolutionLogEntry, ResolutionStage, ResolutionTarget, ResolvedReference, Severity,
    ValidityInterval, VersionStorage,
};
use normattiva_core::resolver::supersedes;
use normattiva_core::store::{NodeHit, RecordOutcome, Store, StoreStats};

use crate::config::Config;
use crate::{db, migrate};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to the configured database and make sure the schema exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

const DATE_FORMAT: &str = "%Y-%m-%d";

const UPSERT_DOCUMENT: &str = r#"
    INSERT INTO documents (id, canonical, doc_type, number, year, title, urn,
                           created_at, updated_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(id) DO UPDATE SET
        title = COALESCE(excluded.title, documents.title),
        urn = COALESCE(excluded.urn, documents.urn),
        updated_at = excluded.updated_at
"#;

fn document_upsert(doc: &Document) -> Query<'_, Sqlite, SqliteArguments<'_>> {
    sqlx::query(UPSERT_DOCUMENT)
        .bind(&doc.id)
        .bind(&doc.canonical)
        .bind(&doc.doc_type)
        .bind(&doc.number)
        .bind(doc.year)
        .bind(&doc.title)
        .bind(&doc.urn)
        .bind(doc.created_at)
        .bind(doc.updated_at)
}

fn parse_day(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT).with_context(|| format!("bad stored date: {s}"))
}

fn severity_rank(s: Severity) -> i64 {
    match s {
        Severity::Low => 0,
        Severity::Medium => 1,
        Severity::High => 2,
        Severity::Critical => 3,
    }
}

/// Quote every term so user input never reaches the FTS5 query grammar.
fn fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|t| t.replace('"', ""))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    (!terms.is_empty()).then(|| terms.join(" "))
}

fn row_to_raw(row: &SqliteRow) -> Result<RawInput> {
    let status: String = row.try_get("status")?;
    Ok(RawInput {
        content_hash: row.try_get("content_hash")?,
        origin: row.try_get("origin")?,
        size: row.try_get("size")?,
        status: RawStatus::parse(&status).ok_or_else(|| anyhow!("unknown raw status: {status}"))?,
        error: row.try_get("error")?,
        discovered_at: row.try_get("discovered_at")?,
    })
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    Ok(Document {
        id: row.try_get("id")?,
        canonical: row.try_get("canonical")?,
        doc_type: row.try_get("doc_type")?,
        number: row.try_get("number")?,
        year: row.try_get("year")?,
        title: row.try_get("title")?,
        urn: row.try_get("urn")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_version(row: &SqliteRow) -> Result<DocumentVersion> {
    let id: String = row.try_get("id")?;
    let valid_from: String = row.try_get("valid_from")?;
    let valid_to: Option<String> = row.try_get("valid_to")?;
    let kind: String = row.try_get("storage_kind")?;
    let storage = match kind.as_str() {
        "full" => VersionStorage::Full {
            text: row.try_get::<Option<String>, _>("full_text")?.unwrap_or_default(),
        },
        "delta" => {
            let base: Option<String> = row.try_get("base_version_id")?;
            let patch_json: Option<String> = row.try_get("patch_json")?;
            let depth: i64 = row.try_get("chain_depth")?;
            VersionStorage::Delta {
                base_version_id: base.ok_or_else(|| anyhow!("delta {id} has no base"))?,
                patch: serde_json::from_str::<Patch>(patch_json.as_deref().unwrap_or(""))
                    .with_context(|| format!("delta {id} has an unreadable patch"))?,
                chain_depth: u32::try_from(depth)?,
            }
        }
        other => return Err(anyhow!("unknown storage kind '{other}' for version {id}")),
    };
    Ok(DocumentVersion {
        document_id: row.try_get("document_id")?,
        version_tag: row.try_get("version_tag")?,
        validity: ValidityInterval::new(
            parse_day(&valid_from)?,
            valid_to.as_deref().map(parse_day).transpose()?,
        ),
        checksum: row.try_get("checksum")?,
        storage,
        source_raw_hash: row.try_get("source_raw_hash")?,
        ingested_at: row.try_get("ingested_at")?,
        id,
    })
}

fn row_to_node(row: &SqliteRow) -> Result<Node> {
    let refs: String = row.try_get("inline_refs_json")?;
    Ok(Node {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        version_id: row.try_get("version_id")?,
        kind: row.try_get("kind")?,
        label: row.try_get("label")?,
        canonical_path: row.try_get("canonical_path")?,
        hierarchy_string: row.try_get("hierarchy_string")?,
        heading: row.try_get("heading")?,
        text_clean: row.try_get("text_clean")?,
        text_raw_snippet: row.try_get("text_raw_snippet")?,
        ordinal: row.try_get("ordinal")?,
        source_url: row.try_get("source_url")?,
        inline_refs: serde_json::from_str::<Vec<InlineRef>>(&refs)?,
    })
}

fn row_to_reference(row: &SqliteRow) -> Result<ExtractedReference> {
    let target: String = row.try_get("target_json")?;
    let completeness: String = row.try_get("completeness")?;
    let relation: String = row.try_get("relation")?;
    let span_start: i64 = row.try_get("span_start")?;
    let span_end: i64 = row.try_get("span_end")?;
    Ok(ExtractedReference {
        id: row.try_get("id")?,
        source_node_id: row.try_get("source_node_id")?,
        match_text: row.try_get("match_text")?,
        span_start: usize::try_from(span_start)?,
        span_end: usize::try_from(span_end)?,
        target: serde_json::from_str::<ReferenceTarget>(&target)?,
        completeness: Completeness::parse(&completeness)
            .ok_or_else(|| anyhow!("unknown completeness: {completeness}"))?,
        relation: RelationType::parse(&relation)
            .ok_or_else(|| anyhow!("unknown relation: {relation}"))?,
        method: row.try_get("method")?,
        context_snippet: row.try_get("context_snippet")?,
    })
}

fn parse_stage(s: &str) -> Result<ResolutionStage> {
    ResolutionStage::parse(s).ok_or_else(|| anyhow!("unknown resolution stage: {s}"))
}

fn row_to_resolution(row: &SqliteRow) -> Result<ResolvedReference> {
    let stage: String = row.try_get("stage")?;
    let target: String = row.try_get("target_json")?;
    Ok(ResolvedReference {
        id: row.try_get("id")?,
        reference_id: row.try_get("reference_id")?,
        stage: parse_stage(&stage)?,
        confidence: row.try_get("confidence")?,
        target: serde_json::from_str::<ResolutionTarget>(&target)?,
        needs_review: row.try_get("needs_review")?,
        is_current: row.try_get("is_current")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

fn row_to_log_entry(row: &SqliteRow) -> Result<ResolutionLogEntry> {
    let stage: String = row.try_get("stage")?;
    let target: String = row.try_get("target_json")?;
    Ok(ResolutionLogEntry {
        id: row.try_get("id")?,
        reference_id: row.try_get("reference_id")?,
        stage: parse_stage(&stage)?,
        match_text: row.try_get("match_text")?,
        source_document_id: row.try_get("source_document_id")?,
        target: serde_json::from_str::<ResolutionTarget>(&target)?,
        confidence: row.try_get("confidence")?,
        cache_hit: row.try_get("cache_hit")?,
        attempted_at: row.try_get("attempted_at")?,
    })
}

fn row_to_conflict(row: &SqliteRow) -> Result<ConflictEvent> {
    let side_a: String = row.try_get("side_a_json")?;
    let side_b: String = row.try_get("side_b_json")?;
    let severity: String = row.try_get("severity")?;
    let status: String = row.try_get("status")?;
    Ok(ConflictEvent {
        id: row.try_get("id")?,
        dedup_key: row.try_get("dedup_key")?,
        target_document_id: row.try_get("target_document_id")?,
        canonical_path: row.try_get("canonical_path")?,
        side_a: serde_json::from_str::<ConflictSide>(&side_a)?,
        side_b: serde_json::from_str::<ConflictSide>(&side_b)?,
        severity: Severity::parse(&severity).ok_or_else(|| anyhow!("unknown severity: {severity}"))?,
        status: ConflictStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown conflict status: {status}"))?,
        reviewer: row.try_get("reviewer")?,
        review_note: row.try_get("review_note")?,
        decision: row.try_get("decision")?,
        detected_at: row.try_get("detected_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const VERSION_COLUMNS: &str = "id, document_id, version_tag, valid_from, valid_to, checksum, \
     storage_kind, full_text, base_version_id, patch_json, chain_depth, source_raw_hash, ingested_at";

const NODE_COLUMNS: &str = "id, document_id, version_id, kind, label, canonical_path, \
     hierarchy_string, heading, text_clean, text_raw_snippet, ordinal, source_url, inline_refs_json";

#[async_trait]
impl Store for SqliteStore {
    async fn get_raw_input(&self, content_hash: &str) -> Result<Option<RawInput>> {
        let row = sqlx::query("SELECT * FROM raw_inputs WHERE content_hash = ?")
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_raw).transpose()
    }

    async fn upsert_raw_input(&self, raw: &RawInput) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO raw_inputs (content_hash, origin, size, status, error, discovered_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(content_hash) DO UPDATE SET
                origin = excluded.origin,
                size = excluded.size,
                status = excluded.status,
                error = excluded.error
            "#,
        )
        .bind(&raw.content_hash)
        .bind(&raw.origin)
        .bind(raw.size)
        .bind(raw.status.as_str())
        .bind(&raw.error)
        .bind(raw.discovered_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_raw_inputs(&self, status: Option<RawStatus>) -> Result<Vec<RawInput>> {
        let rows = match status {
            Some(s) => {
                sqlx::query(
                    "SELECT * FROM raw_inputs WHERE status = ? ORDER BY discovered_at, origin",
                )
                .bind(s.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM raw_inputs ORDER BY discovered_at, origin")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_raw).collect()
    }

    async fn upsert_document(&self, doc: &Document) -> Result<()> {
        document_upsert(doc).execute(&self.pool).await?;
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn find_document(&self, canonical: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE canonical = ?")
            .bind(canonical)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn list_documents(&self) -> Result<Vec<Document>> {
        let rows = sqlx::query("SELECT * FROM documents ORDER BY canonical")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_document).collect()
    }

    async fn commit_version(
        &self,
        document: &Document,
        version: &DocumentVersion,
        nodes: &[Node],
    ) -> Result<()> {
        if version.document_id != document.id {
            return Err(anyhow!(
                "version {} belongs to document {}, not {}",
                version.id,
                version.document_id,
                document.id
            ));
        }
        let (kind, full_text, base, patch_json, depth) = match &version.storage {
            VersionStorage::Full { text } => ("full", Some(text.as_str()), None, None, 0i64),
            VersionStorage::Delta {
                base_version_id,
                patch,
                chain_depth,
            } => (
                "delta",
                None,
                Some(base_version_id.as_str()),
                Some(serde_json::to_string(patch)?),
                i64::from(*chain_depth),
            ),
        };

        let mut tx = self.pool.begin().await?;

        document_upsert(document).execute(&mut *tx).await?;

        sqlx::query(
            "DELETE FROM nodes_fts WHERE node_id IN (SELECT id FROM nodes WHERE version_id = ?)",
        )
        .bind(&version.id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM nodes WHERE version_id = ?")
            .bind(&version.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO document_versions (id, document_id, version_tag, valid_from, valid_to,
                                           checksum, storage_kind, full_text, base_version_id,
                                           patch_json, chain_depth, source_raw_hash, ingested_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                valid_from = excluded.valid_from,
                valid_to = excluded.valid_to,
                checksum = excluded.checksum,
                storage_kind = excluded.storage_kind,
                full_text = excluded.full_text,
                base_version_id = excluded.base_version_id,
                patch_json = excluded.patch_json,
                chain_depth = excluded.chain_depth,
                source_raw_hash = excluded.source_raw_hash,
                ingested_at = excluded.ingested_at
            "#,
        )
        .bind(&version.id)
        .bind(&version.document_id)
        .bind(&version.version_tag)
        .bind(version.validity.from.format(DATE_FORMAT).to_string())
        .bind(version.validity.to.map(|d| d.format(DATE_FORMAT).to_string()))
        .bind(&version.checksum)
        .bind(kind)
        .bind(full_text)
        .bind(base)
        .bind(patch_json)
        .bind(depth)
        .bind(&version.source_raw_hash)
        .bind(version.ingested_at)
        .execute(&mut *tx)
        .await?;

        for node in nodes {
            sqlx::query(&format!(
                "INSERT INTO nodes ({NODE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(&node.id)
            .bind(&node.document_id)
            .bind(&node.version_id)
            .bind(&node.kind)
            .bind(&node.label)
            .bind(&node.canonical_path)
            .bind(&node.hierarchy_string)
            .bind(&node.heading)
            .bind(&node.text_clean)
            .bind(&node.text_raw_snippet)
            .bind(node.ordinal)
            .bind(&node.source_url)
            .bind(serde_json::to_string(&node.inline_refs)?)
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO nodes_fts (node_id, text_clean) VALUES (?, ?)")
                .bind(&node.id)
                .bind(&node.text_clean)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_version(&self, id: &str) -> Result<Option<DocumentVersion>> {
        let row = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM document_versions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_version).transpose()
    }

    async fn find_version(
        &self,
        document_id: &str,
        version_tag: &str,
    ) -> Result<Option<DocumentVersion>> {
        let row = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM document_versions WHERE document_id = ? AND version_tag = ?"
        ))
        .bind(document_id)
        .bind(version_tag)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_version).transpose()
    }

    async fn latest_version(&self, document_id: &str) -> Result<Option<DocumentVersion>> {
        let row = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM document_versions WHERE document_id = ? \
             ORDER BY rowid DESC LIMIT 1"
        ))
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_version).transpose()
    }

    async fn list_versions(&self, document_id: &str) -> Result<Vec<DocumentVersion>> {
        let rows = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM document_versions WHERE document_id = ? \
             ORDER BY valid_from, rowid"
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_version).collect()
    }

    async fn get_node(&self, id: &str) -> Result<Option<Node>> {
        let row = sqlx::query(&format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_node).transpose()
    }

    async fn list_nodes(&self, version_id: &str) -> Result<Vec<Node>> {
        let rows = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE version_id = ? ORDER BY ordinal"
        ))
        .bind(version_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_node).collect()
    }

    async fn search_nodes(&self, query: &str, limit: i64) -> Result<Vec<NodeHit>> {
        let Some(fts) = fts_query(query) else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            r#"
            SELECT nodes_fts.node_id AS node_id, n.document_id, n.version_id,
                   n.canonical_path, n.hierarchy_string,
                   snippet(nodes_fts, 1, '>>>', '<<<', '...', 24) AS snippet,
                   bm25(nodes_fts) AS rank
            FROM nodes_fts
            JOIN nodes n ON n.id = nodes_fts.node_id
            WHERE nodes_fts MATCH ?
            ORDER BY rank, n.canonical_path
            LIMIT ?
            "#,
        )
        .bind(fts)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let rank: f64 = row.try_get("rank")?;
                Ok(NodeHit {
                    node_id: row.try_get("node_id")?,
                    document_id: row.try_get("document_id")?,
                    version_id: row.try_get("version_id")?,
                    canonical_path: row.try_get("canonical_path")?,
                    hierarchy_string: row.try_get("hierarchy_string")?,
                    snippet: row.try_get("snippet")?,
                    score: -rank, // negate so higher = better
                })
            })
            .collect()
    }

    async fn insert_reference(&self, reference: &ExtractedReference) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO extracted_references
                (id, source_node_id, match_text, span_start, span_end, target_json,
                 completeness, relation, method, context_snippet)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&reference.id)
        .bind(&reference.source_node_id)
        .bind(&reference.match_text)
        .bind(i64::try_from(reference.span_start)?)
        .bind(i64::try_from(reference.span_end)?)
        .bind(serde_json::to_string(&reference.target)?)
        .bind(reference.completeness.as_str())
        .bind(reference.relation.as_str())
        .bind(&reference.method)
        .bind(&reference.context_snippet)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_reference(&self, id: &str) -> Result<Option<ExtractedReference>> {
        let row = sqlx::query("SELECT * FROM extracted_references WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_reference).transpose()
    }

    async fn list_references(
        &self,
        source_node_id: Option<&str>,
    ) -> Result<Vec<ExtractedReference>> {
        let rows = match source_node_id {
            Some(id) => {
                sqlx::query(
                    "SELECT * FROM extracted_references WHERE source_node_id = ? \
                     ORDER BY source_node_id, span_start",
                )
                .bind(id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM extracted_references ORDER BY source_node_id, span_start",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(row_to_reference).collect()
    }

    async fn record_resolution(&self, candidate: &ResolvedReference) -> Result<RecordOutcome> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query(
            "SELECT * FROM resolved_references WHERE reference_id = ? AND is_current = 1",
        )
        .bind(&candidate.reference_id)
        .fetch_optional(&mut *tx)
        .await?
        .as_ref()
        .map(row_to_resolution)
        .transpose()?;

        if current.as_ref().is_some_and(|c| c.id == candidate.id) {
            tx.commit().await?;
            return Ok(RecordOutcome::Unchanged);
        }

        let install = supersedes(current.as_ref(), candidate);
        if install {
            sqlx::query(
                "UPDATE resolved_references SET is_current = 0 \
                 WHERE reference_id = ? AND is_current = 1",
            )
            .bind(&candidate.reference_id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO resolved_references (id, reference_id, stage, confidence, target_json,
                                             target_document_id, target_node_id, needs_review,
                                             is_current, resolved_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                is_current = excluded.is_current,
                confidence = CASE WHEN excluded.is_current = 1
                                  THEN excluded.confidence ELSE resolved_references.confidence END,
                needs_review = CASE WHEN excluded.is_current = 1
                                    THEN excluded.needs_review ELSE resolved_references.needs_review END,
                resolved_at = CASE WHEN excluded.is_current = 1
                                   THEN excluded.resolved_at ELSE resolved_references.resolved_at END
            "#,
        )
        .bind(&candidate.id)
        .bind(&candidate.reference_id)
        .bind(candidate.stage.as_str())
        .bind(candidate.confidence)
        .bind(serde_json::to_string(&candidate.target)?)
        .bind(candidate.target.document_id())
        .bind(candidate.target.node_id())
        .bind(candidate.needs_review)
        .bind(install)
        .bind(candidate.resolved_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(if install {
            RecordOutcome::Installed
        } else {
            RecordOutcome::KeptExisting
        })
    }

    async fn current_resolution(&self, reference_id: &str) -> Result<Option<ResolvedReference>> {
        let row = sqlx::query(
            "SELECT * FROM resolved_references WHERE reference_id = ? AND is_current = 1",
        )
        .bind(reference_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_resolution).transpose()
    }

    async fn resolution_history(&self, reference_id: &str) -> Result<Vec<ResolvedReference>> {
        let rows = sqlx::query(
            "SELECT * FROM resolved_references WHERE reference_id = ? ORDER BY rowid",
        )
        .bind(reference_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_resolution).collect()
    }

    async fn list_current_resolutions(&self) -> Result<Vec<ResolvedReference>> {
        let rows = sqlx::query(
            "SELECT * FROM resolved_references WHERE is_current = 1 ORDER BY reference_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_resolution).collect()
    }

    async fn append_resolution_log(&self, entries: &[ResolutionLogEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for e in entries {
            sqlx::query(
                r#"
                INSERT INTO resolution_log (id, reference_id, stage, match_text,
                                            source_document_id, target_json, confidence,
                                            cache_hit, attempted_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&e.id)
            .bind(&e.reference_id)
            .bind(e.stage.as_str())
            .bind(&e.match_text)
            .bind(&e.source_document_id)
            .bind(serde_json::to_string(&e.target)?)
            .bind(e.confidence)
            .bind(e.cache_hit)
            .bind(e.attempted_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_resolution_log(&self, reference_id: &str) -> Result<Vec<ResolutionLogEntry>> {
        let rows = sqlx::query("SELECT * FROM resolution_log WHERE reference_id = ? ORDER BY rowid")
            .bind(reference_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_log_entry).collect()
    }

    async fn insert_conflict(&self, conflict: &ConflictEvent) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO conflict_events
                (id, dedup_key, target_document_id, canonical_path, side_a_json, side_b_json,
                 severity, severity_rank, status, reviewer, review_note, decision,
                 detected_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&conflict.id)
        .bind(&conflict.dedup_key)
        .bind(&conflict.target_document_id)
        .bind(&conflict.canonical_path)
        .bind(serde_json::to_string(&conflict.side_a)?)
        .bind(serde_json::to_string(&conflict.side_b)?)
        .bind(conflict.severity.as_str())
        .bind(severity_rank(conflict.severity))
        .bind(conflict.status.as_str())
        .bind(&conflict.reviewer)
        .bind(&conflict.review_note)
        .bind(&conflict.decision)
        .bind(conflict.detected_at)
        .bind(conflict.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_conflict(&self, id: &str) -> Result<Option<ConflictEvent>> {
        let row = sqlx::query("SELECT * FROM conflict_events WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_conflict).transpose()
    }

    async fn list_conflicts(&self, status: Option<ConflictStatus>) -> Result<Vec<ConflictEvent>> {
        let order = "ORDER BY severity_rank DESC, detected_at, id";
        let rows = match status {
            Some(s) => {
                sqlx::query(&format!("SELECT * FROM conflict_events WHERE status = ? {order}"))
                    .bind(s.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query(&format!("SELECT * FROM conflict_events {order}"))
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_conflict).collect()
    }

    async fn update_conflict(&self, conflict: &ConflictEvent) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE conflict_events
            SET status = ?, reviewer = ?, review_note = ?, decision = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(conflict.status.as_str())
        .bind(&conflict.reviewer)
        .bind(&conflict.review_note)
        .bind(&conflict.decision)
        .bind(conflict.updated_at)
        .bind(&conflict.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("conflict not found: {}", conflict.id));
        }
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM raw_inputs) AS raw_inputs,
                (SELECT COUNT(*) FROM raw_inputs WHERE status = 'error') AS raw_errors,
                (SELECT COUNT(*) FROM documents) AS documents,
                (SELECT COUNT(*) FROM document_versions) AS versions,
                (SELECT COUNT(*) FROM document_versions WHERE storage_kind = 'full') AS snapshots,
                (SELECT COUNT(*) FROM document_versions WHERE storage_kind = 'delta') AS deltas,
                (SELECT COUNT(*) FROM nodes) AS nodes,
                (SELECT COUNT(*) FROM extracted_references) AS refs,
                (SELECT COUNT(*) FROM resolved_references
                    WHERE is_current = 1 AND target_document_id IS NOT NULL) AS resolved,
                (SELECT COUNT(*) FROM resolved_references
                    WHERE is_current = 1 AND target_document_id IS NULL) AS unresolved,
                (SELECT COUNT(*) FROM resolution_log) AS resolution_log,
                (SELECT COUNT(*) FROM conflict_events WHERE status = 'pending') AS pending,
                (SELECT COUNT(*) FROM conflict_events WHERE status = 'reviewed') AS reviewed,
                (SELECT COUNT(*) FROM conflict_events WHERE status = 'resolved') AS resolved_conflicts
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreStats {
            raw_inputs: row.try_get("raw_inputs")?,
            raw_errors: row.try_get("raw_errors")?,
            documents: row.try_get("documents")?,
            versions: row.try_get("versions")?,
            snapshots: row.try_get("snapshots")?,
            deltas: row.try_get("deltas")?,
            nodes: row.try_get("nodes")?,
            references: row.try_get("refs")?,
            resolved: row.try_get("resolved")?,
            unresolved: row.try_get("unresolved")?,
            resolution_log: row.try_get("resolution_log")?,
            conflicts_pending: row.try_get("pending")?,
            conflicts_reviewed: row.try_get("reviewed")?,
            conflicts_resolved: row.try_get("resolved_conflicts")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fts_query_quotes_terms() {
        assert_eq!(fts_query("diritto  \"contribuente"), Some("\"diritto\" \"contribuente\"".into()));
        assert_eq!(fts_query("   "), None);
        assert_eq!(fts_query("\"\""), None);
    }

    #[test]
    fn test_severity_rank_is_monotone() {
        assert!(severity_rank(Severity::Low) < severity_rank(Severity::Medium));
        assert!(severity_rank(Severity::High) < severity_rank(Severity::Critical));
    }
}
