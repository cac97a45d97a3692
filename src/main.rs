//! # Normattiva KB CLI (`nkb`)
//!
//! ## Usage
//!
//! ```bash
//! nkb --config ./config/nkb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `nkb init` | Create the SQLite database and run schema migrations |
//! | `nkb ingest [paths]` | Parse and store XML files and zip archives |
//! | `nkb extract-references` | Extract citations from every stored node |
//! | `nkb resolve-references` | Resolve extracted citations to nodes or documents |
//! | `nkb detect-conflicts` | Find overlapping modifications of the same provision |
//! | `nkb conflicts list\|review\|resolve` | Conflict review lifecycle |
//! | `nkb get document <key>` / `nkb get node <id>` | Lookups |
//! | `nkb text <key>` | Reconstructed text of a version |
//! | `nkb search "<query>"` | Full-text search over node text |
//! | `nkb export` | JSON Lines export for retrieval systems |
//! | `nkb stats` | Database statistics |
//! | `nkb serve` | Start the read-only HTTP server |

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use normattiva_kb::{
    config, conflicts, export, get, ingest, logging, migrate, references, resolve, search,
    server, stats,
};

/// Normattiva KB: structuring, versioning, and reference resolution for
/// Italian legal texts.
#[derive(Parser)]
#[command(
    name = "nkb",
    about = "Normattiva KB: structuring, versioning, and reference resolution for legal texts",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/nkb.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Parse and store documents.
    ///
    /// Paths override `[ingest].roots`. Inputs already processed (same
    /// SHA-256) are skipped.
    Ingest {
        /// Files or directories to scan.
        paths: Vec<PathBuf>,

        /// Force the markup dialect (`legacy` or `akoma`) instead of probing.
        #[arg(long)]
        dialect: Option<String>,

        /// Print the batch report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Extract citations from the text of every stored node.
    ExtractReferences {
        /// Print the batch report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Resolve extracted citations.
    ResolveReferences {
        /// Re-resolve references that already have a settled resolution.
        #[arg(long)]
        all: bool,

        /// Print the batch report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Detect temporally overlapping modifications.
    DetectConflicts {
        /// Print the batch report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Review and resolve detected conflicts.
    Conflicts {
        #[command(subcommand)]
        action: ConflictAction,
    },

    /// Look up a document or a node.
    Get {
        #[command(subcommand)]
        target: GetTarget,
    },

    /// Print the reconstructed text of a document version.
    Text {
        /// Canonical key (`legge:212:2000`) or document id.
        key: String,

        /// Version tag; defaults to the version in force on `--at`.
        #[arg(long)]
        tag: Option<String>,

        /// Reference date (YYYY-MM-DD); defaults to today.
        #[arg(long)]
        at: Option<String>,
    },

    /// Full-text search over node text.
    Search {
        query: String,

        #[arg(long)]
        limit: Option<i64>,

        #[arg(long)]
        json: bool,
    },

    /// Export nodes as JSON Lines.
    Export {
        /// Output file; stdout when omitted.
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Export every version instead of the one in force.
        #[arg(long)]
        all_versions: bool,

        /// Reference date (YYYY-MM-DD); defaults to today.
        #[arg(long)]
        at: Option<String>,
    },

    /// Show database statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Start the read-only HTTP server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum ConflictAction {
    /// List conflicts, optionally filtered by status.
    List {
        /// `pending`, `reviewed` or `resolved`.
        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        json: bool,
    },
    /// Mark a pending conflict as reviewed.
    Review {
        id: String,

        #[arg(long)]
        reviewer: String,

        #[arg(long)]
        note: Option<String>,
    },
    /// Record a decision and close a conflict.
    Resolve {
        id: String,

        #[arg(long)]
        decision: String,

        #[arg(long)]
        reviewer: Option<String>,
    },
}

#[derive(Subcommand)]
enum GetTarget {
    /// Document with its versions.
    Document {
        /// Canonical key (`legge:212:2000`) or document id.
        key: String,

        /// Reference date (YYYY-MM-DD) for the in-force marker.
        #[arg(long)]
        at: Option<String>,

        #[arg(long)]
        json: bool,
    },
    /// Node with its references and their resolutions.
    Node {
        id: String,

        #[arg(long)]
        json: bool,
    },
}

fn parse_day(at: Option<&str>) -> Result<NaiveDate> {
    match at {
        None => Ok(Utc::now().date_naive()),
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|e| anyhow::anyhow!("invalid date '{}': {} (expected YYYY-MM-DD)", s, e)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { paths, dialect, json } => {
            ingest::run_ingest(&cfg, paths, dialect, json).await?;
        }
        Commands::ExtractReferences { json } => {
            references::run_extract_references(&cfg, json).await?;
        }
        Commands::ResolveReferences { all, json } => {
            resolve::run_resolve(&cfg, all, json).await?;
        }
        Commands::DetectConflicts { json } => {
            conflicts::run_detect_conflicts(&cfg, json).await?;
        }
        Commands::Conflicts { action } => match action {
            ConflictAction::List { status, json } => {
                conflicts::run_list_conflicts(&cfg, status, json).await?;
            }
            ConflictAction::Review { id, reviewer, note } => {
                conflicts::run_review_conflict(&cfg, &id, &reviewer, note).await?;
            }
            ConflictAction::Resolve {
                id,
                decision,
                reviewer,
            } => {
                conflicts::run_resolve_conflict(&cfg, &id, &decision, reviewer).await?;
            }
        },
        Commands::Get { target } => match target {
            GetTarget::Document { key, at, json } => {
                get::run_get_document(&cfg, &key, parse_day(at.as_deref())?, json).await?;
            }
            GetTarget::Node { id, json } => {
                get::run_get_node(&cfg, &id, json).await?;
            }
        },
        Commands::Text { key, tag, at } => {
            get::run_text(&cfg, &key, tag.as_deref(), parse_day(at.as_deref())?).await?;
        }
        Commands::Search { query, limit, json } => {
            search::run_search(&cfg, &query, limit, json).await?;
        }
        Commands::Export {
            output,
            all_versions,
            at,
        } => {
            export::run_export(
                &cfg,
                output.as_deref(),
                parse_day(at.as_deref())?,
                all_versions,
            )
            .await?;
        }
        Commands::Stats { json } => {
            stats::run_stats(&cfg, json).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
