//! Reference resolution pass.
//!
//! Builds a [`ResolutionIndex`] over the version of each document that is in
//! force today, resolves the selected references through the staged
//! resolver on the blocking pool, then records each outcome and its audit
//! log sequentially.
//!
//! By default only references without a current resolution, or whose
//! current resolution still needs review, are attempted. `--all` re-resolves
//! everything; a lower-confidence outcome never replaces a better one.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use normattiva_core::models::ExtractedReference;
use normattiva_core::resolver::{resolve_batch, ResolutionIndex, ResolutionPolicy, SourceContext};
use normattiva_core::store::{RecordOutcome, Store};
use normattiva_core::versioning::citable_version;

use crate::config::Config;
use crate::report::BatchReport;
use crate::sqlite_store::SqliteStore;

pub async fn run_resolve(config: &Config, all: bool, json: bool) -> Result<()> {
    let store = SqliteStore::open(config).await?;

    let report = resolve_references(
        &store,
        &config.resolution.merged_aliases(),
        config.resolution.policy,
        all,
        Utc::now().timestamp(),
    )
    .await?;
    report.emit(json)?;

    store.close().await;
    Ok(())
}

fn day_of(now: i64) -> NaiveDate {
    DateTime::from_timestamp(now, 0)
        .map(|dt| dt.date_naive())
        .unwrap_or_default()
}

/// Index every document at the version citations should land on `date`.
pub async fn build_index(
    store: &dyn Store,
    aliases: &BTreeMap<String, String>,
    date: NaiveDate,
) -> Result<ResolutionIndex> {
    let mut index = ResolutionIndex::new(aliases);
    for document in store.list_documents().await? {
        let versions = store.list_versions(&document.id).await?;
        let nodes = match citable_version(&versions, date) {
            Some(v) => store.list_nodes(&v.id).await?,
            None => Vec::new(),
        };
        index.add_document(&document, &nodes);
    }
    Ok(index)
}

pub async fn resolve_references(
    store: &dyn Store,
    aliases: &BTreeMap<String, String>,
    policy: ResolutionPolicy,
    all: bool,
    now: i64,
) -> Result<BatchReport> {
    let mut report = BatchReport::new("resolve-references");

    let index = build_index(store, aliases, day_of(now)).await?;
    tracing::debug!(documents = index.len(), "resolution index built");

    let mut items: Vec<(ExtractedReference, SourceContext)> = Vec::new();
    let mut node_cache: HashMap<String, Option<SourceContext>> = HashMap::new();
    for reference in store.list_references(None).await? {
        if !all {
            if let Some(current) = store.current_resolution(&reference.id).await? {
                if !current.needs_review && current.target.is_resolved() {
                    continue;
                }
            }
        }
        let source = match node_cache.get(&reference.source_node_id) {
            Some(cached) => cached.clone(),
            None => {
                let ctx = store
                    .get_node(&reference.source_node_id)
                    .await?
                    .map(|n| SourceContext::of(&n));
                node_cache.insert(reference.source_node_id.clone(), ctx.clone());
                ctx
            }
        };
        match source {
            Some(source) => items.push((reference, source)),
            None => {
                report.processed += 1;
                report.fail(reference.id.clone(), "source", "source node not found");
            }
        }
    }

    let items = Arc::new(items);
    let resolutions = tokio::task::spawn_blocking({
        let items = Arc::clone(&items);
        move || resolve_batch(&index, policy, &items)
    })
    .await?;

    for ((reference, source), resolution) in items.iter().zip(resolutions) {
        report.processed += 1;
        let (resolved, log) = resolution.into_records(reference, source, now);
        if let Err(e) = store.append_resolution_log(&log).await {
            report.fail_error(reference.id.clone(), "log", &e);
            continue;
        }
        match store.record_resolution(&resolved).await {
            Ok(RecordOutcome::Installed) => {
                tracing::debug!(
                    reference = %reference.id,
                    stage = resolved.stage.as_str(),
                    confidence = resolved.confidence,
                    "resolution installed"
                );
                report.written += 1;
            }
            Ok(RecordOutcome::KeptExisting) | Ok(RecordOutcome::Unchanged) => {
                report.skipped_duplicates += 1
            }
            Err(e) => report.fail_error(reference.id.clone(), "store", &e),
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{ingest_units, IngestSettings};
    use crate::references::extract_all;
    use crate::scan::RawUnit;
    use normattiva_core::models::{ResolutionStage, ResolutionTarget};
    use normattiva_core::references::{default_aliases, ReferenceExtractor};
    use normattiva_core::store::memory::InMemoryStore;

    const STATUTO: &str = r#"<atto>
        <meta><doc_type>legge</doc_type><number>212</number><year>2000</year>
        <title>Statuto dei diritti del contribuente</title>
        <valid_from>2000-08-01</valid_from></meta>
        <articolo num="3"><comma num="1">Le disposizioni tributarie non hanno effetto retroattivo.</comma></articolo>
    </atto>"#;

    const DECRETO: &str = r#"<atto>
        <meta><doc_type>dlgs</doc_type><number>74</number><year>2000</year>
        <valid_from>2000-04-15</valid_from></meta>
        <articolo num="1"><comma num="1">Ai sensi dell'art. 3 della legge 212/2000 si applica.</comma></articolo>
    </atto>"#;

    fn unit(origin: &str, body: &str) -> RawUnit {
        RawUnit {
            origin: origin.into(),
            bytes: body.as_bytes().to_vec(),
        }
    }

    async fn seeded() -> InMemoryStore {
        let store = InMemoryStore::new();
        ingest_units(
            &store,
            &IngestSettings::default(),
            vec![unit("s.xml", STATUTO), unit("d.xml", DECRETO)],
            0,
        )
        .await
        .unwrap();
        extract_all(&store, &ReferenceExtractor::default())
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_explicit_reference_resolves_to_node() {
        let store = seeded().await;
        let report = resolve_references(
            &store,
            &default_aliases(),
            ResolutionPolicy::default(),
            false,
            1_700_000_000,
        )
        .await
        .unwrap();
        assert!(report.is_clean());

        let reference = store
            .list_references(None)
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.target.number.as_deref() == Some("212"))
            .unwrap();
        let current = store.current_resolution(&reference.id).await.unwrap().unwrap();
        assert_eq!(current.stage, ResolutionStage::Explicit);
        assert_eq!(current.confidence, 1.0);
        let statuto = store.find_document("legge:212:2000").await.unwrap().unwrap();
        match &current.target {
            ResolutionTarget::Node { document_id, .. } => assert_eq!(document_id, &statuto.id),
            other => panic!("expected node target, got {other:?}"),
        }
        assert!(!store.list_resolution_log(&reference.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_run_skips_settled_references() {
        let store = seeded().await;
        let policy = ResolutionPolicy::default();
        resolve_references(&store, &default_aliases(), policy, false, 1_700_000_000)
            .await
            .unwrap();
        let settled = store
            .list_current_resolutions()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| !r.needs_review && r.target.is_resolved())
            .count();

        let again = resolve_references(&store, &default_aliases(), policy, false, 1_700_000_100)
            .await
            .unwrap();
        let total = store.list_references(None).await.unwrap().len();
        assert_eq!(again.processed, total - settled);
        assert_eq!(again.written, 0);
    }

    #[tokio::test]
    async fn test_rerun_all_never_lowers_confidence() {
        let store = seeded().await;
        let policy = ResolutionPolicy::default();
        resolve_references(&store, &default_aliases(), policy, true, 1_700_000_000)
            .await
            .unwrap();
        let before = store.list_current_resolutions().await.unwrap();

        resolve_references(&store, &default_aliases(), policy, true, 1_700_000_100)
            .await
            .unwrap();
        for old in before {
            let now = store.current_resolution(&old.reference_id).await.unwrap().unwrap();
            assert!(now.confidence >= old.confidence);
        }
    }

    #[tokio::test]
    async fn test_index_uses_version_in_force() {
        let store = seeded().await;
        let index = build_index(&store, &default_aliases(), day_of(1_700_000_000))
            .await
            .unwrap();
        assert_eq!(index.len(), 2);
    }
}
