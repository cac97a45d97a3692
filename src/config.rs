//! TOML configuration.
//!
//! Only `[db]` is required. Every policy section falls back to the defaults
//! of the corresponding core policy type, so a minimal file is:
//!
//! ```toml
//! [db]
//! path = "./data/nkb.sqlite"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use normattiva_core::conflicts::ConflictPolicy;
use normattiva_core::references::default_aliases;
use normattiva_core::resolver::ResolutionPolicy;
use normattiva_core::taxonomy::{Dialect, Taxonomies, TaxonomyOverrides};
use normattiva_core::versioning::VersioningPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub versioning: VersioningPolicy,
    #[serde(default)]
    pub resolution: ResolutionConfig,
    #[serde(default)]
    pub conflicts: ConflictPolicy,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub taxonomy: TaxonomyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Directories (or single files) scanned by `nkb ingest`.
    #[serde(default)]
    pub roots: Vec<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Force a dialect instead of probing each document.
    #[serde(default)]
    pub dialect: Option<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            dialect: None,
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.xml".to_string(), "**/*.zip".to_string()]
}

impl IngestConfig {
    pub fn declared_dialect(&self) -> Result<Option<Dialect>> {
        match &self.dialect {
            None => Ok(None),
            Some(name) => Dialect::parse(name)
                .map(Some)
                .ok_or_else(|| anyhow::anyhow!("ingest.dialect must be 'legacy' or 'akoma', got '{}'", name)),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ResolutionConfig {
    #[serde(flatten)]
    pub policy: ResolutionPolicy,
    /// Extra alias → canonical key entries, merged over the built-in table.
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

impl ResolutionConfig {
    pub fn merged_aliases(&self) -> BTreeMap<String, String> {
        let mut aliases = default_aliases();
        aliases.extend(self.aliases.clone());
        aliases
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_search_limit")]
    pub search_limit: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            search_limit: default_search_limit(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}
fn default_search_limit() -> i64 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TaxonomyConfig {
    #[serde(default)]
    pub legacy: Option<TaxonomyOverrides>,
    #[serde(default)]
    pub akoma: Option<TaxonomyOverrides>,
}

impl Config {
    /// Defaults everywhere except the database path.
    pub fn for_db(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            ingest: IngestConfig::default(),
            versioning: VersioningPolicy::default(),
            resolution: ResolutionConfig::default(),
            conflicts: ConflictPolicy::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            taxonomy: TaxonomyConfig::default(),
        }
    }

    /// Built-in taxonomies with the configured overrides applied.
    pub fn taxonomies(&self) -> Result<Taxonomies> {
        let mut taxonomies = Taxonomies::default();
        if let Some(overrides) = &self.taxonomy.legacy {
            taxonomies.legacy.apply(overrides);
        }
        if let Some(overrides) = &self.taxonomy.akoma {
            taxonomies.akoma.apply(overrides);
        }
        taxonomies
            .legacy
            .validate()
            .context("taxonomy.legacy")?;
        taxonomies.akoma.validate().context("taxonomy.akoma")?;
        Ok(taxonomies)
    }

    pub fn validate(&self) -> Result<()> {
        self.versioning.validate()?;
        self.resolution.policy.validate()?;
        self.conflicts.validate()?;
        self.ingest.declared_dialect()?;
        self.taxonomies()?;

        if self.resolution.policy.cache_capacity == 0 {
            anyhow::bail!("resolution.cache_capacity must be > 0");
        }
        if self.server.search_limit < 1 {
            anyhow::bail!("server.search_limit must be >= 1");
        }
        for (alias, canonical) in &self.resolution.aliases {
            let key = normattiva_core::models::DocumentKey::parse_canonical(canonical);
            if !key.map(|k| k.is_complete()).unwrap_or(false) {
                anyhow::bail!(
                    "resolution.aliases.{}: '{}' is not a complete canonical key (type:number:year)",
                    alias,
                    canonical
                );
            }
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}
