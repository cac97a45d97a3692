//! # Normattiva KB
//!
//! Structures Italian legal texts (legacy Normattiva XML and Akoma Ntoso)
//! into addressable, versioned nodes, extracts and resolves cross-references
//! between them, and surfaces temporal conflicts for human review.
//!
//! The algorithms live in the `normattiva-core` crate. This crate wires them
//! to SQLite, the filesystem, the `nkb` CLI, and a read-only HTTP server.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ XML / ZIP  │──▶│    ingest    │──▶│    SQLite    │
//! │   inputs   │   │ parse+version│   │ nodes + FTS5 │
//! └────────────┘   └──────────────┘   └──────┬───────┘
//!                                            │
//!            ┌───────────────┬───────────────┼───────────────┐
//!            ▼               ▼               ▼               ▼
//!      ┌──────────┐    ┌──────────┐    ┌──────────┐    ┌──────────┐
//!      │ extract  │──▶ │ resolve  │──▶ │ conflicts│    │ CLI/HTTP │
//!      │references│    │references│    │  detect  │    │  export  │
//!      └──────────┘    └──────────┘    └──────────┘    └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! nkb init
//! nkb ingest ./corpus
//! nkb extract-references
//! nkb resolve-references
//! nkb detect-conflicts
//! nkb search "contribuente"
//! nkb serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite implementation of the core `Store` trait |
//! | [`scan`] | Raw input discovery (directories, zip archives) |
//! | [`report`] | Per-pass batch reports |
//! | [`ingest`] | Parse, version, and store raw inputs |
//! | [`references`] | Reference extraction pass |
//! | [`resolve`] | Reference resolution pass |
//! | [`conflicts`] | Conflict detection and review lifecycle |
//! | [`get`] | Document, node, and version-text lookups |
//! | [`search`] | Full-text search |
//! | [`export`] | JSON Lines export |
//! | [`stats`] | Database statistics |
//! | [`server`] | HTTP query server |

pub mod config;
pub mod conflicts;
pub mod db;
pub mod export;
pub mod get;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod references;
pub mod report;
pub mod resolve;
pub mod scan;
pub mod search;
pub mod server;
pub mod sqlite_store;
pub mod stats;
