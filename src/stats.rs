//! Knowledge base statistics.
//!
//! A quick summary of what is stored: raw inputs, documents, versions split
//! by snapshot and delta, nodes, references with their resolution coverage,
//! and conflicts by lifecycle status.

use anyhow::Result;

use normattiva_core::store::{Store, StoreStats};

use crate::config::Config;
use crate::sqlite_store::SqliteStore;

pub async fn run_stats(config: &Config, json: bool) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let result = store.stats().await;
    store.close().await;
    let stats = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Normattiva KB — Database Stats");
    println!("==============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    print_stats(&stats);
    println!();
    Ok(())
}

fn print_stats(s: &StoreStats) {
    println!("  Raw inputs:  {} ({} failed)", s.raw_inputs, s.raw_errors);
    println!("  Documents:   {}", s.documents);
    println!(
        "  Versions:    {} ({} snapshots, {} deltas)",
        s.versions, s.snapshots, s.deltas
    );
    println!("  Nodes:       {}", s.nodes);
    println!(
        "  References:  {} ({} resolved, {}%)",
        s.references,
        s.resolved,
        percent(s.resolved, s.references)
    );
    println!("  Unresolved:  {}", s.unresolved);
    println!("  Log entries: {}", s.resolution_log);
    println!(
        "  Conflicts:   {} pending, {} reviewed, {} resolved",
        s.conflicts_pending, s.conflicts_reviewed, s.conflicts_resolved
    );
}

fn percent(part: i64, total: i64) -> i64 {
    if total > 0 {
        (part * 100) / total
    } else {
        0
    }
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_percent_handles_empty() {
        assert_eq!(percent(0, 0), 0);
        assert_eq!(percent(3, 4), 75);
    }
}
