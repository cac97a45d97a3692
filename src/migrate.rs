//! Idempotent schema setup.
//!
//! Dates are stored as `YYYY-MM-DD` text; structured values that are only
//! ever read back whole (reference targets, patches, conflict sides) are
//! stored as JSON.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS raw_inputs (
        content_hash TEXT PRIMARY KEY,
        origin TEXT NOT NULL,
        size INTEGER NOT NULL,
        status TEXT NOT NULL,
        error TEXT,
        discovered_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        canonical TEXT NOT NULL UNIQUE,
        doc_type TEXT NOT NULL,
        number TEXT,
        year INTEGER,
        title TEXT,
        urn TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS document_versions (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        version_tag TEXT NOT NULL,
        valid_from TEXT NOT NULL,
        valid_to TEXT,
        checksum TEXT NOT NULL,
        storage_kind TEXT NOT NULL,
        full_text TEXT,
        base_version_id TEXT,
        patch_json TEXT,
        chain_depth INTEGER NOT NULL DEFAULT 0,
        source_raw_hash TEXT,
        ingested_at INTEGER NOT NULL,
        UNIQUE(document_id, version_tag),
        FOREIGN KEY (document_id) REFERENCES documents(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS nodes (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        version_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        label TEXT NOT NULL,
        canonical_path TEXT NOT NULL,
        hierarchy_string TEXT NOT NULL,
        heading TEXT,
        text_clean TEXT NOT NULL,
        text_raw_snippet TEXT NOT NULL,
        ordinal INTEGER NOT NULL,
        source_url TEXT,
        inline_refs_json TEXT NOT NULL DEFAULT '[]',
        UNIQUE(version_id, canonical_path),
        FOREIGN KEY (version_id) REFERENCES document_versions(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS extracted_references (
        id TEXT PRIMARY KEY,
        source_node_id TEXT NOT NULL,
        match_text TEXT NOT NULL,
        span_start INTEGER NOT NULL,
        span_end INTEGER NOT NULL,
        target_json TEXT NOT NULL,
        completeness TEXT NOT NULL,
        relation TEXT NOT NULL,
        method TEXT NOT NULL,
        context_snippet TEXT NOT NULL,
        UNIQUE(source_node_id, match_text)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS resolved_references (
        id TEXT PRIMARY KEY,
        reference_id TEXT NOT NULL,
        stage TEXT NOT NULL,
        confidence REAL NOT NULL,
        target_json TEXT NOT NULL,
        target_document_id TEXT,
        target_node_id TEXT,
        needs_review INTEGER NOT NULL,
        is_current INTEGER NOT NULL,
        resolved_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS resolution_log (
        id TEXT PRIMARY KEY,
        reference_id TEXT NOT NULL,
        stage TEXT NOT NULL,
        match_text TEXT NOT NULL,
        source_document_id TEXT,
        target_json TEXT NOT NULL,
        confidence REAL NOT NULL,
        cache_hit INTEGER NOT NULL,
        attempted_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS conflict_events (
        id TEXT PRIMARY KEY,
        dedup_key TEXT NOT NULL UNIQUE,
        target_document_id TEXT NOT NULL,
        canonical_path TEXT NOT NULL,
        side_a_json TEXT NOT NULL,
        side_b_json TEXT NOT NULL,
        severity TEXT NOT NULL,
        severity_rank INTEGER NOT NULL,
        status TEXT NOT NULL,
        reviewer TEXT,
        review_note TEXT,
        decision TEXT,
        detected_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_versions_document ON document_versions(document_id)",
    "CREATE INDEX IF NOT EXISTS idx_nodes_version ON nodes(version_id, ordinal)",
    "CREATE INDEX IF NOT EXISTS idx_references_node ON extracted_references(source_node_id)",
    "CREATE INDEX IF NOT EXISTS idx_resolved_reference ON resolved_references(reference_id)",
    // At most one current resolution per reference.
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_resolved_current ON resolved_references(reference_id) WHERE is_current = 1",
    "CREATE INDEX IF NOT EXISTS idx_resolution_log_reference ON resolution_log(reference_id)",
    "CREATE INDEX IF NOT EXISTS idx_conflicts_status ON conflict_events(status)",
];

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn apply(pool: &SqlitePool) -> Result<()> {
    for ddl in TABLES {
        sqlx::query(ddl).execute(pool).await?;
    }

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='nodes_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE nodes_fts USING fts5(
                node_id UNINDEXED,
                text_clean
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    for ddl in INDEXES {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}
