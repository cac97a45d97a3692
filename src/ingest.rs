//! Ingestion pass: raw inputs → documents, versions, nodes.
//!
//! Raw inputs already processed (same SHA-256) are skipped before parsing.
//! Parsing runs on the blocking pool with `rayon`; persistence is
//! sequential so version chains are planned against committed state.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rayon::prelude::*;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use normattiva_core::error::KbError;
use normattiva_core::models::{
    Document, DocumentVersion, Node, RawInput, RawStatus, VersionStorage,
};
use normattiva_core::parser::{parse_document, ParsedDocument};
use normattiva_core::store::Store;
use normattiva_core::taxonomy::{Dialect, Taxonomies};
use normattiva_core::text::sha256_hex;
use normattiva_core::versioning::{
    checksum, default_version_tag, materialize, plan_storage, render_text, validity_for,
    VersioningPolicy,
};

use crate::config::Config;
use crate::report::BatchReport;
use crate::scan::{scan_roots, RawUnit};
use crate::sqlite_store::SqliteStore;

/// Result of committing one parsed document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored {
        document_id: String,
        version_id: String,
        nodes: usize,
        delta: bool,
    },
    /// Same content already stored (by raw hash or by version tag + checksum).
    DuplicateSkipped,
}

/// Settings the ingest pass needs, resolved from [`Config`].
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub taxonomies: Taxonomies,
    pub declared: Option<Dialect>,
    pub policy: VersioningPolicy,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            taxonomies: Taxonomies::default(),
            declared: None,
            policy: VersioningPolicy::default(),
        }
    }
}

impl IngestSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            taxonomies: config.taxonomies()?,
            declared: config.ingest.declared_dialect()?,
            policy: config.versioning,
        })
    }
}

pub async fn run_ingest(
    config: &Config,
    paths: Vec<PathBuf>,
    dialect: Option<String>,
    json: bool,
) -> Result<()> {
    let mut ingest_cfg = config.ingest.clone();
    if !paths.is_empty() {
        ingest_cfg.roots = paths;
    }
    if dialect.is_some() {
        ingest_cfg.dialect = dialect;
    }
    let mut settings = IngestSettings::from_config(config)?;
    settings.declared = ingest_cfg.declared_dialect()?;

    let scanned = scan_roots(&ingest_cfg)?;
    let store = SqliteStore::open(config).await?;

    let mut report = ingest_units(&store, &settings, scanned.units, Utc::now().timestamp()).await?;
    for failure in scanned.failures {
        report.fail(failure.origin, "scan", failure.reason);
    }
    report.emit(json)?;

    store.close().await;
    Ok(())
}

/// Ingest a batch of raw units against any store.
pub async fn ingest_units(
    store: &dyn Store,
    settings: &IngestSettings,
    units: Vec<RawUnit>,
    now: i64,
) -> Result<BatchReport> {
    let mut report = BatchReport::new("ingest");
    let mut seen: HashSet<String> = HashSet::new();
    let mut todo: Vec<(RawUnit, String)> = Vec::new();

    for unit in units {
        report.processed += 1;
        let hash = sha256_hex(&unit.bytes);
        if !seen.insert(hash.clone()) {
            report.skipped_duplicates += 1;
            continue;
        }
        if let Some(existing) = store.get_raw_input(&hash).await? {
            if existing.status == RawStatus::Processed {
                tracing::debug!(origin = %unit.origin, "raw input already processed");
                report.skipped_duplicates += 1;
                continue;
            }
        }
        todo.push((unit, hash));
    }

    let taxonomies = Arc::new(settings.taxonomies.clone());
    let declared = settings.declared;
    let sources: Arc<Vec<Vec<u8>>> = Arc::new(todo.iter().map(|(u, _)| u.bytes.clone()).collect());
    let parsed: Vec<Result<ParsedDocument, KbError>> = tokio::task::spawn_blocking({
        let taxonomies = Arc::clone(&taxonomies);
        let sources = Arc::clone(&sources);
        move || {
            sources
                .par_iter()
                .map(|bytes| parse_document(bytes, declared, &taxonomies))
                .collect()
        }
    })
    .await?;

    for ((unit, hash), result) in todo.into_iter().zip(parsed) {
        let mut raw = RawInput {
            content_hash: hash.clone(),
            origin: unit.origin.clone(),
            size: unit.bytes.len() as i64,
            status: RawStatus::Processed,
            error: None,
            discovered_at: now,
        };

        let outcome = match result {
            Ok(doc) if !doc.metadata.document_key().is_complete() => Err((
                "identity",
                anyhow::Error::from(KbError::MalformedInput(format!(
                    "document identity incomplete: {}",
                    doc.metadata.document_key().canonical()
                ))),
            )),
            Ok(doc) => commit_parsed(store, &settings.policy, &doc, &hash, now)
                .await
                .map_err(|e| {
                    let stage = match e.downcast_ref::<KbError>() {
                        Some(_) => "version",
                        None => "store",
                    };
                    (stage, e)
                }),
            Err(e) => Err(("parse", anyhow::Error::from(e))),
        };

        match outcome {
            Ok(IngestOutcome::Stored { .. }) => report.written += 1,
            Ok(IngestOutcome::DuplicateSkipped) => report.skipped_duplicates += 1,
            Err((stage, err)) => {
                raw.status = RawStatus::Error;
                raw.error = Some(format!("{err:#}"));
                report.fail_error(unit.origin.clone(), stage, &err);
            }
        }
        store.upsert_raw_input(&raw).await?;
    }

    Ok(report)
}

fn ingest_date(now: i64) -> NaiveDate {
    DateTime::from_timestamp(now, 0)
        .map(|dt| dt.date_naive())
        .unwrap_or_default()
}

/// Persist one parsed document as a new version of its document.
pub async fn commit_parsed(
    store: &dyn Store,
    policy: &VersioningPolicy,
    parsed: &ParsedDocument,
    raw_hash: &str,
    now: i64,
) -> Result<IngestOutcome> {
    let meta = &parsed.metadata;
    let key = meta.document_key();
    if !key.is_complete() {
        return Err(KbError::MalformedInput(format!(
            "document identity incomplete: {}",
            key.canonical()
        ))
        .into());
    }
    if !parsed.unknown_tags.is_empty() {
        tracing::debug!(document = %key.canonical(), unknown = ?parsed.unknown_tags, "unknown tags treated as inline");
    }
    for warning in &parsed.warnings {
        tracing::warn!(document = %key.canonical(), "{warning}");
    }

    // Nothing is written until every check below has passed.
    let document = Document::from_key(&key, meta.title.clone(), meta.urn.clone(), now);
    let validity = validity_for(meta, ingest_date(now))?;

    let text = render_text(
        parsed
            .nodes
            .iter()
            .map(|n| (n.canonical_path.as_str(), n.text_clean.as_str())),
    );
    let sum = checksum(&text);
    let tag = meta
        .version_tag
        .clone()
        .unwrap_or_else(|| default_version_tag(meta, &sum));

    if let Some(existing) = store.find_version(&document.id, &tag).await? {
        if existing.checksum == sum {
            return Ok(IngestOutcome::DuplicateSkipped);
        }
        return Err(KbError::VersionTagConflict {
            document: document.canonical.clone(),
            version_tag: tag,
            existing: existing.checksum,
            incoming: sum,
        }
        .into());
    }

    let version_id = DocumentVersion::version_id(&document.id, &tag);

    let storage = match store.latest_version(&document.id).await? {
        None => VersionStorage::Full { text },
        Some(prior) => match materialize(store, &prior.id, policy.max_chain_depth).await {
            Ok(materialized) => plan_storage(policy, &text, Some((&prior.id, &materialized))),
            Err(e) => {
                tracing::warn!(version = %prior.id, error = %e, "prior version unreadable, storing snapshot");
                VersionStorage::Full { text }
            }
        },
    };
    let delta = !matches!(storage, VersionStorage::Full { .. });

    let version = DocumentVersion {
        id: version_id.clone(),
        document_id: document.id.clone(),
        version_tag: tag,
        validity,
        checksum: sum,
        storage,
        source_raw_hash: Some(raw_hash.to_string()),
        ingested_at: now,
    };

    let nodes: Vec<Node> = parsed
        .nodes
        .iter()
        .map(|n| Node {
            id: Node::node_id(&version_id, &n.canonical_path),
            document_id: document.id.clone(),
            version_id: version_id.clone(),
            kind: n.kind.clone(),
            label: n.label.clone(),
            canonical_path: n.canonical_path.clone(),
            hierarchy_string: n.hierarchy_string.clone(),
            heading: n.heading.clone(),
            text_clean: n.text_clean.clone(),
            text_raw_snippet: n.text_raw_snippet.clone(),
            ordinal: n.ordinal,
            source_url: meta.source_url.clone(),
            inline_refs: n.inline_refs.clone(),
        })
        .collect();

    store.commit_version(&document, &version, &nodes).await?;
    tracing::info!(
        document = %document.canonical,
        version = %version.version_tag,
        nodes = nodes.len(),
        delta,
        "version stored"
    );

    Ok(IngestOutcome::Stored {
        document_id: document.id,
        version_id,
        nodes: nodes.len(),
        delta,
    })
}
