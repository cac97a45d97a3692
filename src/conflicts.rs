//! Conflict detection pass and the review lifecycle commands.
//!
//! Modifications come from two places: node text that changed between
//! versions of the same document, and current resolutions of amending or
//! repealing references that landed on a node of another document. Both
//! feed [`normattiva_core::conflicts::detect`]; new events are inserted by
//! dedup key, so existing events and their review state are never touched.

use anyhow::{bail, Result};
use chrono::Utc;
use std::collections::HashMap;

use normattiva_core::conflicts::{
    self, node_modifications, reference_modifications, ConflictPolicy, CrossReference,
    Modification,
};
use normattiva_core::models::{
    ConflictEvent, ConflictStatus, DocumentVersion, ResolutionTarget, ValidityInterval,
};
use normattiva_core::store::Store;

use crate::config::Config;
use crate::report::BatchReport;
use crate::sqlite_store::SqliteStore;

pub async fn run_detect_conflicts(config: &Config, json: bool) -> Result<()> {
    let store = SqliteStore::open(config).await?;

    let report = detect_conflicts(&store, &config.conflicts, Utc::now().timestamp()).await?;
    report.emit(json)?;

    store.close().await;
    Ok(())
}

/// Every modification known to the store.
pub async fn collect_modifications(store: &dyn Store) -> Result<Vec<Modification>> {
    let mut modifications = Vec::new();

    let mut version_cache: HashMap<String, DocumentVersion> = HashMap::new();
    for document in store.list_documents().await? {
        let mut versions = Vec::new();
        for version in store.list_versions(&document.id).await? {
            let nodes = store.list_nodes(&version.id).await?;
            version_cache.insert(version.id.clone(), version.clone());
            versions.push((version, nodes));
        }
        modifications.extend(node_modifications(&versions));
    }

    let mut cross = Vec::new();
    for resolved in store.list_current_resolutions().await? {
        let ResolutionTarget::Node { node_id, document_id } = &resolved.target else {
            continue;
        };
        let Some(reference) = store.get_reference(&resolved.reference_id).await? else {
            continue;
        };
        if !reference.relation.is_modifying() {
            continue;
        }
        let (Some(source), Some(target)) = (
            store.get_node(&reference.source_node_id).await?,
            store.get_node(node_id).await?,
        ) else {
            continue;
        };
        let Some(source_version) = version_cache.get(&source.version_id) else {
            continue;
        };
        cross.push(CrossReference {
            source_document_id: source.document_id.clone(),
            source_version_id: source.version_id.clone(),
            source_node_id: source.id.clone(),
            source_validity: source_version.validity,
            target_document_id: document_id.clone(),
            target_path: target.canonical_path.clone(),
            relation: reference.relation,
        });
    }
    modifications.extend(reference_modifications(&cross));

    Ok(modifications)
}

pub async fn detect_conflicts(
    store: &dyn Store,
    policy: &ConflictPolicy,
    now: i64,
) -> Result<BatchReport> {
    let mut report = BatchReport::new("detect-conflicts");
    let modifications = collect_modifications(store).await?;
    tracing::debug!(modifications = modifications.len(), "modifications collected");

    for event in conflicts::detect(&modifications, policy, now) {
        report.processed += 1;
        match store.insert_conflict(&event).await {
            Ok(true) => {
                tracing::info!(
                    conflict = %event.id,
                    path = %event.canonical_path,
                    severity = event.severity.as_str(),
                    "conflict detected"
                );
                report.written += 1;
            }
            Ok(false) => report.skipped_duplicates += 1,
            Err(e) => report.fail_error(event.id.clone(), "store", &e),
        }
    }
    Ok(report)
}

// ─── Lifecycle ──────────────────────────────────────────────────────

pub fn parse_status(s: &str) -> Result<ConflictStatus> {
    match ConflictStatus::parse(&s.to_lowercase()) {
        Some(status) => Ok(status),
        None => bail!("unknown conflict status '{s}' (pending, reviewed, resolved)"),
    }
}

async fn load(store: &dyn Store, id: &str) -> Result<ConflictEvent> {
    match store.get_conflict(id).await? {
        Some(c) => Ok(c),
        None => bail!("conflict not found: {id}"),
    }
}

pub async fn review_conflict(
    store: &dyn Store,
    id: &str,
    reviewer: &str,
    note: Option<&str>,
    now: i64,
) -> Result<ConflictEvent> {
    let mut conflict = load(store, id).await?;
    conflicts::review(&mut conflict, reviewer, note, now)?;
    store.update_conflict(&conflict).await?;
    tracing::info!(conflict = %id, reviewer, "conflict reviewed");
    Ok(conflict)
}

pub async fn resolve_conflict(
    store: &dyn Store,
    id: &str,
    decision: &str,
    reviewer: Option<&str>,
    now: i64,
) -> Result<ConflictEvent> {
    let mut conflict = load(store, id).await?;
    conflicts::resolve(&mut conflict, decision, reviewer, now)?;
    store.update_conflict(&conflict).await?;
    tracing::info!(conflict = %id, "conflict resolved");
    Ok(conflict)
}

pub async fn run_list_conflicts(config: &Config, status: Option<String>, json: bool) -> Result<()> {
    let status = status.as_deref().map(parse_status).transpose()?;
    let store = SqliteStore::open(config).await?;
    let events = store.list_conflicts(status).await?;
    store.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(());
    }
    if events.is_empty() {
        println!("No conflicts.");
        return Ok(());
    }
    for c in &events {
        println!(
            "{}  [{}] {:<8}  {}  {}",
            c.id,
            c.status.as_str(),
            c.severity.as_str(),
            c.canonical_path,
            c.target_document_id
        );
        println!(
            "    a: {} {}  b: {} {}",
            c.side_a.kind.as_str(),
            format_interval(&c.side_a.validity),
            c.side_b.kind.as_str(),
            format_interval(&c.side_b.validity),
        );
    }
    Ok(())
}

fn format_interval(validity: &ValidityInterval) -> String {
    let end = if validity.is_open() {
        "open".to_string()
    } else {
        validity.to.map(|d| d.to_string()).unwrap_or_default()
    };
    format!("[{}, {end})", validity.from)
}

pub async fn run_review_conflict(
    config: &Config,
    id: &str,
    reviewer: &str,
    note: Option<String>,
) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let result = review_conflict(&store, id, reviewer, note.as_deref(), Utc::now().timestamp()).await;
    store.close().await;
    let conflict = result?;
    println!("{} → {}", conflict.id, conflict.status.as_str());
    Ok(())
}

pub async fn run_resolve_conflict(
    config: &Config,
    id: &str,
    decision: &str,
    reviewer: Option<String>,
) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let result = resolve_conflict(
        &store,
        id,
        decision,
        reviewer.as_deref(),
        Utc::now().timestamp(),
    )
    .await;
    store.close().await;
    let conflict = result?;
    println!("{} → {}", conflict.id, conflict.status.as_str());
    Ok(())
}
