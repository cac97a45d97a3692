//! Retrieval export: one JSON object per node, one node per line.
//!
//! Each line is an [`ExportRecord`] `{id, document_title, hierarchy, text,
//! source_url}`. By default only the version of each document in force on
//! the export date is exported; `--all-versions` exports every version.

use anyhow::Result;
use chrono::NaiveDate;
use std::io::Write;
use std::path::Path;

use normattiva_core::models::ExportRecord;
use normattiva_core::store::Store;
use normattiva_core::versioning::citable_version;

use crate::config::Config;
use crate::sqlite_store::SqliteStore;

/// Write records to `out`; returns the number written.
pub async fn export_records<W: Write>(
    store: &dyn Store,
    date: NaiveDate,
    all_versions: bool,
    out: &mut W,
) -> Result<usize> {
    let mut written = 0;
    for document in store.list_documents().await? {
        let versions = store.list_versions(&document.id).await?;
        let selected: Vec<_> = if all_versions {
            versions.iter().collect()
        } else {
            citable_version(&versions, date).into_iter().collect()
        };
        for version in selected {
            for node in store.list_nodes(&version.id).await? {
                let record = ExportRecord::project(&node, Some(&document));
                serde_json::to_writer(&mut *out, &record)?;
                out.write_all(b"\n")?;
                written += 1;
            }
        }
    }
    out.flush()?;
    Ok(written)
}

/// If `output` is `Some`, writes to that file path. Otherwise writes to
/// stdout for piping.
pub async fn run_export(
    config: &Config,
    output: Option<&Path>,
    date: NaiveDate,
    all_versions: bool,
) -> Result<()> {
    let store = SqliteStore::open(config).await?;

    let result = match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
            let count = export_records(&store, date, all_versions, &mut file).await;
            if let Ok(n) = count {
                eprintln!("Exported {} nodes to {}", n, path.display());
            }
            count
        }
        None => {
            let mut stdout = std::io::stdout();
            export_records(&store, date, all_versions, &mut stdout).await
        }
    };

    store.close().await;
    result.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{ingest_units, IngestSettings};
    use crate::scan::RawUnit;
    use normattiva_core::store::memory::InMemoryStore;

    fn unit(from: &str, to: Option<&str>, text: &str) -> RawUnit {
        let to = to
            .map(|t| format!("<valid_to>{t}</valid_to>"))
            .unwrap_or_default();
        RawUnit {
            origin: format!("{from}.xml"),
            bytes: format!(
                r#"<atto><meta><doc_type>legge</doc_type><number>5</number><year>2001</year>
                   <title>Legge di prova</title><source_url>https://example.org/l5</source_url>
                   <valid_from>{from}</valid_from>{to}</meta>
                   <articolo num="1">{text}</articolo></atto>"#
            )
            .into_bytes(),
        }
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[tokio::test]
    async fn test_export_writes_one_record_per_line() {
        let store = InMemoryStore::new();
        ingest_units(
            &store,
            &IngestSettings::default(),
            vec![
                unit("2001-01-01", Some("2005-01-01"), "Vecchio."),
                unit("2005-01-01", None, "Nuovo."),
            ],
            0,
        )
        .await
        .unwrap();

        let mut buf = Vec::new();
        let n = export_records(&store, day("2010-01-01"), false, &mut buf)
            .await
            .unwrap();
        assert_eq!(n, 1);
        let line = String::from_utf8(buf).unwrap();
        let record: ExportRecord = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(record.text, "Nuovo.");
        assert_eq!(record.hierarchy, "Art. 1");
        assert_eq!(record.document_title.as_deref(), Some("Legge di prova"));
        assert_eq!(record.source_url.as_deref(), Some("https://example.org/l5"));

        let mut all = Vec::new();
        let n = export_records(&store, day("2010-01-01"), true, &mut all)
            .await
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(String::from_utf8(all).unwrap().lines().count(), 2);
    }
}
