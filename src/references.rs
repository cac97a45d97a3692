//! Reference extraction pass.
//!
//! Runs the extractor over every node of every stored version. Extraction is
//! deterministic and references are keyed by (source node, match text), so
//! re-running the pass writes nothing new.

use anyhow::Result;

use normattiva_core::references::ReferenceExtractor;
use normattiva_core::store::Store;

use crate::config::Config;
use crate::report::BatchReport;
use crate::sqlite_store::SqliteStore;

pub async fn run_extract_references(config: &Config, json: bool) -> Result<()> {
    let extractor = ReferenceExtractor::new(&config.resolution.merged_aliases())?;
    let store = SqliteStore::open(config).await?;

    let report = extract_all(&store, &extractor).await?;
    report.emit(json)?;

    store.close().await;
    Ok(())
}

pub async fn extract_all(store: &dyn Store, extractor: &ReferenceExtractor) -> Result<BatchReport> {
    let mut report = BatchReport::new("extract-references");

    for document in store.list_documents().await? {
        for version in store.list_versions(&document.id).await? {
            let nodes = match store.list_nodes(&version.id).await {
                Ok(nodes) => nodes,
                Err(e) => {
                    report.fail_error(version.id.clone(), "load", &e);
                    continue;
                }
            };
            for node in &nodes {
                report.processed += 1;
                for reference in extractor.extract_from_node(node) {
                    match store.insert_reference(&reference).await {
                        Ok(true) => report.written += 1,
                        Ok(false) => report.skipped_duplicates += 1,
                        Err(e) => report.fail_error(reference.id.clone(), "store", &e),
                    }
                }
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{ingest_units, IngestSettings};
    use crate::scan::RawUnit;
    use normattiva_core::models::RelationType;
    use normattiva_core::store::memory::InMemoryStore;

    const DECRETO: &str = r#"<atto>
        <meta><doc_type>dlgs</doc_type><number>74</number><year>2000</year></meta>
        <articolo num="1"><comma num="1">Ai sensi dell'art. 3 della legge 212/2000 si applica.</comma></articolo>
        <articolo num="2"><comma num="1">Nessun rinvio.</comma></articolo>
    </atto>"#;

    #[tokio::test]
    async fn test_extraction_is_idempotent() {
        let store = InMemoryStore::new();
        ingest_units(
            &store,
            &IngestSettings::default(),
            vec![RawUnit {
                origin: "d.xml".into(),
                bytes: DECRETO.as_bytes().to_vec(),
            }],
            0,
        )
        .await
        .unwrap();

        let extractor = ReferenceExtractor::default();
        let first = extract_all(&store, &extractor).await.unwrap();
        assert_eq!(first.processed, 2);
        assert!(first.written >= 1);

        let refs = store.list_references(None).await.unwrap();
        assert!(refs.iter().any(|r| r.target.number.as_deref() == Some("212")
            && r.target.path.as_deref() == Some("art3")
            && r.relation == RelationType::Cites));

        let second = extract_all(&store, &extractor).await.unwrap();
        assert_eq!(second.written, 0);
        assert_eq!(second.skipped_duplicates, first.written);
        assert_eq!(store.list_references(None).await.unwrap().len(), refs.len());
    }
}
