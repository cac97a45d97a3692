//! # Normattiva Core
//!
//! Pure logic for the legal-text knowledge base: data models, tag taxonomy,
//! structural parser, version model and differential storage, reference
//! extraction, URN resolution, conflict detection, and the store abstraction.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. The application
//! crate wires it to SQLite, the CLI, and the HTTP server.

pub mod conflicts;
pub mod delta;
pub mod error;
pub mod models;
pub mod parser;
pub mod references;
pub mod resolver;
pub mod store;
pub mod taxonomy;
pub mod text;
pub mod versioning;

pub use error::{KbError, KbResult};
