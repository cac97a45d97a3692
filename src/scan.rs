//! Raw input discovery.
//!
//! Walks the configured roots and yields the bytes of every matching `.xml`
//! file and of every `.xml` member of matching `.zip` archives. A broken
//! archive or unreadable file is reported and skipped; it never aborts the
//! scan.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::io::Read;
use std::path::Path;
use walkdir::WalkDir;

use crate::config::IngestConfig;

/// Maximum decompressed bytes read from a single archive member.
const MAX_ENTRY_BYTES: u64 = 64 * 1024 * 1024;

/// One candidate document.
#[derive(Debug, Clone)]
pub struct RawUnit {
    /// Path, or `archive.zip!member.xml` for archive members.
    pub origin: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ScanFailure {
    pub origin: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct ScanResult {
    pub units: Vec<RawUnit>,
    pub failures: Vec<ScanFailure>,
}

pub fn scan_roots(config: &IngestConfig) -> Result<ScanResult> {
    if config.roots.is_empty() {
        bail!("no ingest roots configured (set [ingest].roots or pass paths)");
    }
    let include_set = build_globset(&config.include_globs)?;
    let exclude_set = build_globset(&config.exclude_globs)?;

    let mut result = ScanResult::default();
    for root in &config.roots {
        if !root.exists() {
            bail!("ingest root does not exist: {}", root.display());
        }
        let walker = WalkDir::new(root).follow_links(config.follow_symlinks);
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().to_string();
            // A root that is itself a file has an empty relative path.
            let match_str = if rel_str.is_empty() {
                path.file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default()
            } else {
                rel_str
            };
            if exclude_set.is_match(&match_str) || !include_set.is_match(&match_str) {
                continue;
            }
            collect_file(path, &mut result);
        }
    }

    // Sort for deterministic ordering
    result.units.sort_by(|a, b| a.origin.cmp(&b.origin));
    Ok(result)
}

fn collect_file(path: &Path, result: &mut ScanResult) {
    let origin = path.display().to_string();
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(%origin, error = %e, "unreadable input file");
            result.failures.push(ScanFailure {
                origin,
                reason: e.to_string(),
            });
            return;
        }
    };
    let is_zip = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("zip"))
        .unwrap_or(false);
    if !is_zip {
        result.units.push(RawUnit { origin, bytes });
        return;
    }
    match read_archive(&origin, &bytes) {
        Ok(units) => result.units.extend(units),
        Err(e) => {
            tracing::warn!(%origin, error = %e, "unreadable archive");
            result.failures.push(ScanFailure {
                origin,
                reason: e.to_string(),
            });
        }
    }
}

/// `.xml` members of an archive, in archive order.
pub fn read_archive(origin: &str, bytes: &[u8]) -> Result<Vec<RawUnit>> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))?;
    let mut units = Vec::new();
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        let name = entry.name().to_string();
        if entry.is_dir() || !name.to_lowercase().ends_with(".xml") {
            continue;
        }
        let mut out = Vec::new();
        entry.take(MAX_ENTRY_BYTES).read_to_end(&mut out)?;
        if out.len() as u64 >= MAX_ENTRY_BYTES {
            bail!("archive member {} exceeds size limit ({} bytes)", name, MAX_ENTRY_BYTES);
        }
        units.push(RawUnit {
            origin: format!("{origin}!{name}"),
            bytes: out,
        });
    }
    Ok(units)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            for (name, body) in entries {
                zip.start_file(*name, zip::write::SimpleFileOptions::default())
                    .unwrap();
                zip.write_all(body.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf
    }

    fn config(root: &Path) -> IngestConfig {
        IngestConfig {
            roots: vec![root.to_path_buf()],
            ..IngestConfig::default()
        }
    }

    #[test]
    fn test_scan_reads_xml_and_zip_members() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.xml"), "<atto/>").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "skip").unwrap();
        std::fs::write(
            tmp.path().join("bundle.zip"),
            zip_with(&[("b.xml", "<atto/>"), ("readme.md", "skip")]),
        )
        .unwrap();

        let result = scan_roots(&config(tmp.path())).unwrap();
        let origins: Vec<&str> = result.units.iter().map(|u| u.origin.as_str()).collect();
        assert_eq!(origins.len(), 2);
        assert!(origins[0].ends_with("a.xml"));
        assert!(origins[1].ends_with("bundle.zip!b.xml"));
        assert!(result.failures.is_empty());
    }

    #[test]
    fn test_broken_archive_is_reported_not_fatal() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("broken.zip"), b"not a zip").unwrap();
        std::fs::write(tmp.path().join("ok.xml"), "<atto/>").unwrap();

        let result = scan_roots(&config(tmp.path())).unwrap();
        assert_eq!(result.units.len(), 1);
        assert_eq!(result.failures.len(), 1);
        assert!(result.failures[0].origin.ends_with("broken.zip"));
    }

    #[test]
    fn test_exclude_globs_apply() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("old")).unwrap();
        std::fs::write(tmp.path().join("old/x.xml"), "<atto/>").unwrap();
        std::fs::write(tmp.path().join("y.xml"), "<atto/>").unwrap();

        let mut cfg = config(tmp.path());
        cfg.exclude_globs = vec!["old/**".to_string()];
        let result = scan_roots(&cfg).unwrap();
        assert_eq!(result.units.len(), 1);
        assert!(result.units[0].origin.ends_with("y.xml"));
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let cfg = config(Path::new("/definitely/not/here"));
        assert!(scan_roots(&cfg).is_err());
    }
}
