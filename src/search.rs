//! Full-text search over node text.
//!
//! Keyword search only: SQLite FTS5 with BM25 ranking in production, a
//! substring scan in the in-memory store. Hits are enriched with their
//! document's canonical key and title.

use anyhow::{bail, Result};
use serde::Serialize;
use std::collections::HashMap;

use normattiva_core::models::Document;
use normattiva_core::store::Store;

use crate::config::Config;
use crate::sqlite_store::SqliteStore;

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub node_id: String,
    pub document: String,
    pub document_title: Option<String>,
    pub version_id: String,
    pub hierarchy: String,
    pub snippet: String,
    pub score: f64,
}

pub async fn search(store: &dyn Store, query: &str, limit: i64) -> Result<Vec<SearchResult>> {
    if query.trim().is_empty() {
        bail!("query must not be empty");
    }
    if limit < 1 {
        bail!("limit must be at least 1");
    }

    let hits = store.search_nodes(query, limit).await?;
    let mut documents: HashMap<String, Option<Document>> = HashMap::new();
    let mut results = Vec::with_capacity(hits.len());
    for hit in hits {
        if !documents.contains_key(&hit.document_id) {
            let doc = store.get_document(&hit.document_id).await?;
            documents.insert(hit.document_id.clone(), doc);
        }
        let doc = documents.get(&hit.document_id).and_then(|d| d.as_ref());
        results.push(SearchResult {
            node_id: hit.node_id,
            document: doc
                .map(|d| d.canonical.clone())
                .unwrap_or_else(|| hit.document_id.clone()),
            document_title: doc.and_then(|d| d.title.clone()),
            version_id: hit.version_id,
            hierarchy: hit.hierarchy_string,
            snippet: hit.snippet,
            score: hit.score,
        });
    }

    // Sort: score desc, node id asc (deterministic)
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.node_id.cmp(&b.node_id))
    });
    Ok(results)
}

pub async fn run_search(config: &Config, query: &str, limit: Option<i64>, json: bool) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let store = SqliteStore::open(config).await?;
    let result = search(&store, query, limit.unwrap_or(config.server.search_limit)).await;
    store.close().await;
    let results = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }
    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} / {}",
            i + 1,
            result.score,
            result.document,
            result.hierarchy
        );
        if let Some(ref title) = result.document_title {
            println!("    title: {}", title);
        }
        println!(
            "    excerpt: \"{}\"",
            result.snippet.replace('\n', " ").trim()
        );
        println!("    id: {}", result.node_id);
        println!();
    }
    Ok(())
}
