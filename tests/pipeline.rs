//! End-to-end pipeline tests at library level, run against both the
//! in-memory store and SQLite.

use normattiva_core::models::{ConflictStatus, ResolutionStage, ResolutionTarget};
use normattiva_core::parser::parse_document;
use normattiva_core::references::{default_aliases, ReferenceExtractor};
use normattiva_core::resolver::ResolutionPolicy;
use normattiva_core::store::memory::InMemoryStore;
use normattiva_core::store::Store;
use normattiva_core::taxonomy::{Taxonomies, Taxonomy};
use normattiva_core::conflicts::ConflictPolicy;
use normattiva_core::versioning::VersioningPolicy;
use normattiva_kb::config::Config;
use normattiva_kb::conflicts::detect_conflicts;
use normattiva_kb::ingest::{commit_parsed, ingest_units, IngestOutcome, IngestSettings};
use normattiva_kb::references::extract_all;
use normattiva_kb::resolve::resolve_references;
use normattiva_kb::scan::RawUnit;
use normattiva_kb::sqlite_store::SqliteStore;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

const NOW: i64 = 1_700_000_000;

const DECRETO: &str = r#"<atto>
  <meta>
    <doc_type>decreto legislativo</doc_type><number>74</number><year>2000</year>
    <title>Nuova disciplina dei reati in materia di imposte sui redditi</title>
    <valid_from>2000-04-15</valid_from>
  </meta>
  <articolo num="1"><comma num="1">Le sanzioni si applicano ai sensi dell'art. 3 del presente decreto.</comma></articolo>
  <articolo num="2"><comma num="1">Ai sensi dell'art. 3 si procede d'ufficio.</comma></articolo>
  <articolo num="3"><comma num="1">Chiunque indica elementi passivi fittizi.</comma></articolo>
</atto>"#;

fn unit(origin: &str, body: &str) -> RawUnit {
    RawUnit {
        origin: origin.to_string(),
        bytes: body.as_bytes().to_vec(),
    }
}

fn versioned(from: &str, to: Option<&str>, art5: &str) -> RawUnit {
    let to = to
        .map(|t| format!("<valid_to>{t}</valid_to>"))
        .unwrap_or_default();
    RawUnit {
        origin: format!("legge-{from}.xml"),
        bytes: format!(
            r#"<atto><meta><doc_type>legge</doc_type><number>10</number><year>2019</year>
               <valid_from>{from}</valid_from>{to}</meta>
               <articolo num="4"><comma num="1">Invariato.</comma></articolo>
               <articolo num="5"><comma num="1">{art5}</comma></articolo></atto>"#
        )
        .into_bytes(),
    }
}

async fn sqlite_store(tmp: &TempDir) -> SqliteStore {
    let config = Config::for_db(tmp.path().join("data/nkb.sqlite"));
    SqliteStore::open(&config).await.unwrap()
}

// ─── Scenario: contextual resolution inside the citing document ─────

async fn contextual_resolution(store: &dyn Store) {
    let report = ingest_units(store, &IngestSettings::default(), vec![unit("d.xml", DECRETO)], NOW)
        .await
        .unwrap();
    assert_eq!(report.written, 1);

    extract_all(store, &ReferenceExtractor::default()).await.unwrap();
    let report = resolve_references(
        store,
        &default_aliases(),
        ResolutionPolicy::default(),
        false,
        NOW,
    )
    .await
    .unwrap();
    assert!(report.is_clean());

    let decreto = store.find_document("dlgs:74:2000").await.unwrap().unwrap();
    let version = store.latest_version(&decreto.id).await.unwrap().unwrap();
    let nodes = store.list_nodes(&version.id).await.unwrap();
    let art2 = nodes.iter().find(|n| n.canonical_path == "art2/co1").unwrap();
    let art3 = nodes.iter().find(|n| n.canonical_path == "art3/co1").unwrap();

    let refs = store.list_references(Some(&art2.id)).await.unwrap();
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].match_text, "art. 3");

    let current = store.current_resolution(&refs[0].id).await.unwrap().unwrap();
    assert_eq!(current.stage, ResolutionStage::Contextual);
    assert!(current.confidence > 0.0 && current.confidence < 1.0);
    assert_eq!(
        current.target,
        ResolutionTarget::Node {
            node_id: art3.id.clone(),
            document_id: decreto.id.clone(),
        }
    );

    let log = store.list_resolution_log(&refs[0].id).await.unwrap();
    assert!(log.iter().any(|e| e.stage == ResolutionStage::Contextual));
}

#[tokio::test]
async fn test_contextual_resolution_in_memory() {
    contextual_resolution(&InMemoryStore::new()).await;
}

#[tokio::test]
async fn test_contextual_resolution_sqlite() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&tmp).await;
    contextual_resolution(&store).await;
    store.close().await;
}

// ─── Scenario: overlapping versions raise one pending conflict ──────

async fn overlapping_versions(store: &dyn Store) {
    ingest_units(
        store,
        &IngestSettings::default(),
        vec![
            versioned("2020-01-01", Some("2021-01-01"), "Testo originale."),
            versioned("2020-06-01", None, "Testo nuovo."),
        ],
        NOW,
    )
    .await
    .unwrap();

    let first = detect_conflicts(store, &ConflictPolicy::default(), NOW)
        .await
        .unwrap();
    assert_eq!(first.written, 1);

    let pending = store
        .list_conflicts(Some(ConflictStatus::Pending))
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].canonical_path, "art5/co1");

    let again = detect_conflicts(store, &ConflictPolicy::default(), NOW + 60)
        .await
        .unwrap();
    assert_eq!(again.written, 0);
    assert_eq!(store.list_conflicts(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_overlapping_versions_in_memory() {
    overlapping_versions(&InMemoryStore::new()).await;
}

#[tokio::test]
async fn test_overlapping_versions_sqlite() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&tmp).await;
    overlapping_versions(&store).await;
    store.close().await;
}

// ─── Scenario: re-ingesting unchanged content writes nothing ───────

async fn reingest_unchanged(store: &dyn Store) {
    let settings = IngestSettings::default();
    ingest_units(store, &settings, vec![unit("d.xml", DECRETO)], NOW)
        .await
        .unwrap();
    let before = store.stats().await.unwrap();

    let report = ingest_units(store, &settings, vec![unit("copy/d.xml", DECRETO)], NOW + 1)
        .await
        .unwrap();
    assert_eq!(report.written, 0);
    assert_eq!(report.skipped_duplicates, 1);
    assert_eq!(store.stats().await.unwrap(), before);

    // Different bytes, same content: caught by version tag and checksum.
    let reformatted = DECRETO.replace("\n  <articolo", "\n\n    <articolo");
    let parsed = parse_document(reformatted.as_bytes(), None, &Taxonomies::default()).unwrap();
    let outcome = commit_parsed(store, &VersioningPolicy::default(), &parsed, "other-hash", NOW + 2)
        .await
        .unwrap();
    assert_eq!(outcome, IngestOutcome::DuplicateSkipped);
    assert_eq!(store.stats().await.unwrap().versions, before.versions);
}

#[tokio::test]
async fn test_reingest_unchanged_in_memory() {
    reingest_unchanged(&InMemoryStore::new()).await;
}

#[tokio::test]
async fn test_reingest_unchanged_sqlite() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&tmp).await;
    reingest_unchanged(&store).await;
    store.close().await;
}

// ─── Scenario: rejected units leave no rows behind ─────────────────

async fn rejected_units_write_nothing(store: &dyn Store) {
    let reversed = versioned("2021-01-01", Some("2020-01-01"), "Testo.");
    let deep = unit(
        "deep.xml",
        &format!(
            "<atto><articolo num=\"1\">{}x{}</articolo></atto>",
            "<b>".repeat(10_000),
            "</b>".repeat(10_000)
        ),
    );
    let report = ingest_units(store, &IngestSettings::default(), vec![reversed, deep], NOW)
        .await
        .unwrap();
    assert_eq!(report.written, 0);
    let mut stages: Vec<&str> = report.failures.iter().map(|f| f.stage.as_str()).collect();
    stages.sort();
    assert_eq!(stages, vec!["parse", "version"]);

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.documents, 0);
    assert_eq!(stats.versions, 0);
    assert_eq!(stats.nodes, 0);
    assert_eq!(stats.raw_errors, 2);
}

#[tokio::test]
async fn test_rejected_units_write_nothing_in_memory() {
    rejected_units_write_nothing(&InMemoryStore::new()).await;
}

#[tokio::test]
async fn test_rejected_units_write_nothing_sqlite() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&tmp).await;
    rejected_units_write_nothing(&store).await;
    store.close().await;
}

// ─── Custom taxonomy ───────────────────────────────────────────────

#[test]
fn test_custom_taxonomy_single_node() {
    let taxonomies = Taxonomies::uniform(
        Taxonomy::new()
            .structural("article", "art", "Art.")
            .structural("para", "para", "Comma"),
    );
    let xml = r#"<article num="5"><para num="2">Testo.</para></article>"#;
    let doc = parse_document(xml.as_bytes(), None, &taxonomies).unwrap();
    assert_eq!(doc.nodes.len(), 1);
    assert_eq!(doc.nodes[0].canonical_path, "art5/para2");
    assert_eq!(doc.nodes[0].hierarchy_string, "Art. 5 > Comma 2");
    assert_eq!(doc.nodes[0].text_clean, "Testo.");
}

// ─── SQLite persistence details ────────────────────────────────────

#[tokio::test]
async fn test_sqlite_reopen_keeps_data_and_search_works() {
    let tmp = TempDir::new().unwrap();
    {
        let store = sqlite_store(&tmp).await;
        ingest_units(&store, &IngestSettings::default(), vec![unit("d.xml", DECRETO)], NOW)
            .await
            .unwrap();
        store.close().await;
    }
    let store = sqlite_store(&tmp).await;
    let docs = store.list_documents().await.unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].canonical, "dlgs:74:2000");

    let hits = store.search_nodes("fittizi", 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].canonical_path, "art3/co1");
    store.close().await;
}
