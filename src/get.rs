//! Document, node, and version-text lookups.
//!
//! The `*_view` functions return structured data and are shared by the CLI
//! (`nkb get`, `nkb text`) and the HTTP server. Missing entities are errors
//! whose message contains "not found", which the server maps to `404`.

use anyhow::{bail, Result};
use chrono::NaiveDate;
use serde::Serialize;

use normattiva_core::models::{
    Document, DocumentVersion, ExtractedReference, Node, ResolvedReference, VersionStorage,
};
use normattiva_core::store::Store;
use normattiva_core::versioning::{materialize, version_in_force};

use crate::config::Config;
use crate::sqlite_store::SqliteStore;

#[derive(Debug, Clone, Serialize)]
pub struct VersionSummary {
    pub id: String,
    pub version_tag: String,
    pub valid_from: NaiveDate,
    pub valid_to: Option<NaiveDate>,
    /// `full` or `delta`.
    pub storage: &'static str,
    pub chain_depth: u32,
    pub checksum: String,
    pub ingested_at: String,
}

impl VersionSummary {
    pub fn of(v: &DocumentVersion) -> Self {
        Self {
            id: v.id.clone(),
            version_tag: v.version_tag.clone(),
            valid_from: v.validity.from,
            valid_to: v.validity.to,
            storage: match v.storage {
                VersionStorage::Full { .. } => "full",
                VersionStorage::Delta { .. } => "delta",
            },
            chain_depth: v.chain_depth(),
            checksum: v.checksum.clone(),
            ingested_at: format_ts_iso(v.ingested_at),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentView {
    pub document: Document,
    pub versions: Vec<VersionSummary>,
    /// Version in force on the requested date, if any.
    pub in_force: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReferenceView {
    pub reference: ExtractedReference,
    pub resolution: Option<ResolvedReference>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub node: Node,
    pub document: Option<Document>,
    pub references: Vec<ReferenceView>,
}

/// Look a document up by canonical key (`legge:212:2000`) or by id.
pub async fn find_document(store: &dyn Store, key: &str) -> Result<Document> {
    if let Some(doc) = store.find_document(key).await? {
        return Ok(doc);
    }
    match store.get_document(key).await? {
        Some(doc) => Ok(doc),
        None => bail!("document not found: {key}"),
    }
}

pub async fn document_view(store: &dyn Store, key: &str, date: NaiveDate) -> Result<DocumentView> {
    let document = find_document(store, key).await?;
    let versions = store.list_versions(&document.id).await?;
    let in_force = version_in_force(&versions, date).map(|v| v.id.clone());
    Ok(DocumentView {
        document,
        versions: versions.iter().map(VersionSummary::of).collect(),
        in_force,
    })
}

pub async fn node_view(store: &dyn Store, id: &str) -> Result<NodeView> {
    let Some(node) = store.get_node(id).await? else {
        bail!("node not found: {id}");
    };
    let document = store.get_document(&node.document_id).await?;
    let mut references = Vec::new();
    for reference in store.list_references(Some(&node.id)).await? {
        let resolution = store.current_resolution(&reference.id).await?;
        references.push(ReferenceView {
            reference,
            resolution,
        });
    }
    Ok(NodeView {
        node,
        document,
        references,
    })
}

/// Pick a version by tag, else the one in force on `date`.
pub async fn select_version(
    store: &dyn Store,
    document: &Document,
    tag: Option<&str>,
    date: NaiveDate,
) -> Result<DocumentVersion> {
    if let Some(tag) = tag {
        return match store.find_version(&document.id, tag).await? {
            Some(v) => Ok(v),
            None => bail!("version not found: {} @ {tag}", document.canonical),
        };
    }
    let versions = store.list_versions(&document.id).await?;
    match version_in_force(&versions, date) {
        Some(v) => Ok(v.clone()),
        None => bail!("no version of {} in force on {date}: not found", document.canonical),
    }
}

/// Reconstructed, checksum-verified text of a version.
pub async fn version_text(
    store: &dyn Store,
    key: &str,
    tag: Option<&str>,
    date: NaiveDate,
    max_depth: u32,
) -> Result<(DocumentVersion, String)> {
    let document = find_document(store, key).await?;
    let version = select_version(store, &document, tag, date).await?;
    let materialized = materialize(store, &version.id, max_depth).await?;
    Ok((version, materialized.text))
}

/// Nodes of the selected version, in document order.
pub async fn version_nodes(
    store: &dyn Store,
    key: &str,
    tag: Option<&str>,
    date: NaiveDate,
) -> Result<(DocumentVersion, Vec<Node>)> {
    let document = find_document(store, key).await?;
    let version = select_version(store, &document, tag, date).await?;
    let nodes = store.list_nodes(&version.id).await?;
    Ok((version, nodes))
}

// ─── CLI ────────────────────────────────────────────────────────────

pub async fn run_get_document(config: &Config, key: &str, date: NaiveDate, json: bool) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let result = document_view(&store, key, date).await;
    store.close().await;
    let view = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    let doc = &view.document;
    println!("--- Document ---");
    println!("id:         {}", doc.id);
    println!("canonical:  {}", doc.canonical);
    println!("title:      {}", doc.title.as_deref().unwrap_or("(untitled)"));
    if let Some(ref urn) = doc.urn {
        println!("urn:        {}", urn);
    }
    println!("updated_at: {}", format_ts_iso(doc.updated_at));
    println!();

    println!("--- Versions ({}) ---", view.versions.len());
    for v in &view.versions {
        let marker = if view.in_force.as_deref() == Some(v.id.as_str()) {
            "*"
        } else {
            " "
        };
        println!(
            "{} {:<24} {} .. {:<10}  {:<5} depth {}",
            marker,
            v.version_tag,
            v.valid_from,
            v.valid_to.map(|d| d.to_string()).unwrap_or_default(),
            v.storage,
            v.chain_depth
        );
    }
    Ok(())
}

pub async fn run_get_node(config: &Config, id: &str, json: bool) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let result = node_view(&store, id).await;
    store.close().await;
    let view = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    let node = &view.node;
    println!("--- Node ---");
    println!("id:        {}", node.id);
    if let Some(ref doc) = view.document {
        println!("document:  {}", doc.canonical);
    }
    println!("path:      {}", node.canonical_path);
    println!("hierarchy: {}", node.hierarchy_string);
    if let Some(ref heading) = node.heading {
        println!("heading:   {}", heading);
    }
    println!();
    println!("{}", node.text_clean);
    println!();

    println!("--- References ({}) ---", view.references.len());
    for r in &view.references {
        let target = match &r.resolution {
            Some(res) if res.target.is_resolved() => format!(
                "{} ({:.2}, {}{})",
                res.target.node_id().or(res.target.document_id()).unwrap_or("-"),
                res.confidence,
                res.stage.as_str(),
                if res.needs_review { ", review" } else { "" }
            ),
            Some(_) => "unresolved".to_string(),
            None => "not yet resolved".to_string(),
        };
        println!(
            "[{}] \"{}\" → {}",
            r.reference.relation.as_str(),
            r.reference.match_text,
            target
        );
    }
    Ok(())
}

pub async fn run_text(
    config: &Config,
    key: &str,
    tag: Option<&str>,
    date: NaiveDate,
) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let result = version_text(&store, key, tag, date, config.versioning.max_chain_depth).await;
    store.close().await;
    let (_, text) = result?;
    print!("{text}");
    Ok(())
}

pub fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
