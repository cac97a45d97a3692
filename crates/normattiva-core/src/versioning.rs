//! Version model: rendering node sets into version text, choosing between a
//! snapshot and a delta, and reconstructing text from delta chains.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::delta::{similarity, Patch};
use crate::error::{KbError, KbResult};
use crate::models::{DocumentVersion, ValidityInterval, VersionStorage};
use crate::parser::DocumentMetadata;
use crate::store::Store;
use crate::text::sha256_hex;

/// Snapshot-versus-delta policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VersioningPolicy {
    /// Minimum line similarity to the prior version for a delta.
    pub similarity_threshold: f64,
    /// Longest delta chain before a snapshot is forced.
    pub max_chain_depth: u32,
    /// Cap on cumulative patch bytes, as a fraction of the snapshot size.
    pub max_patch_fraction: f64,
}

impl Default for VersioningPolicy {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.6,
            max_chain_depth: 5,
            max_patch_fraction: 0.5,
        }
    }
}

impl VersioningPolicy {
    pub fn validate(&self) -> KbResult<()> {
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(KbError::InvalidConfig(format!(
                "versioning.similarity_threshold must be within [0, 1], got {}",
                self.similarity_threshold
            )));
        }
        if self.max_patch_fraction <= 0.0 {
            return Err(KbError::InvalidConfig(format!(
                "versioning.max_patch_fraction must be positive, got {}",
                self.max_patch_fraction
            )));
        }
        Ok(())
    }
}

/// Deterministic text of a version: a `§ path` line and a text line per node.
pub fn render_text<'a, I>(nodes: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = String::new();
    for (path, text) in nodes {
        out.push_str("§ ");
        out.push_str(path);
        out.push('\n');
        out.push_str(text);
        out.push('\n');
    }
    out
}

pub fn checksum(text: &str) -> String {
    sha256_hex(text.as_bytes())
}

/// `valid:{date}` when the header carried a start date, else `sha:{16 hex}`.
pub fn default_version_tag(metadata: &DocumentMetadata, checksum: &str) -> String {
    match metadata.valid_from {
        Some(from) => format!("valid:{from}"),
        None => format!("sha:{}", &checksum[..checksum.len().min(16)]),
    }
}

/// Validity from header dates; a missing start falls back to `ingest_date`.
pub fn validity_for(metadata: &DocumentMetadata, ingest_date: NaiveDate) -> KbResult<ValidityInterval> {
    let from = metadata.valid_from.unwrap_or(ingest_date);
    if let Some(to) = metadata.valid_to {
        if to <= from {
            return Err(KbError::MalformedInput(format!(
                "valid_to {to} is not after valid_from {from}"
            )));
        }
    }
    Ok(ValidityInterval::new(from, metadata.valid_to))
}

/// Materialized text of a version plus the chain statistics the storage
/// policy needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Materialized {
    pub text: String,
    pub chain_depth: u32,
    /// Sum of literal patch bytes from the snapshot up to this version.
    pub cumulative_patch_bytes: usize,
    pub snapshot_bytes: usize,
}

/// Choose storage for `text` given the latest prior version of the document.
pub fn plan_storage(
    policy: &VersioningPolicy,
    text: &str,
    prior: Option<(&str, &Materialized)>,
) -> VersionStorage {
    let full = || VersionStorage::Full {
        text: text.to_string(),
    };
    let Some((prior_id, prior)) = prior else {
        return full();
    };
    if prior.chain_depth + 1 > policy.max_chain_depth {
        return full();
    }
    if similarity(&prior.text, text) < policy.similarity_threshold {
        return full();
    }
    let patch = Patch::diff(&prior.text, text);
    let cumulative = prior.cumulative_patch_bytes + patch.inserted_bytes();
    if cumulative as f64 > policy.max_patch_fraction * prior.snapshot_bytes as f64 {
        return full();
    }
    VersionStorage::Delta {
        base_version_id: prior_id.to_string(),
        patch,
        chain_depth: prior.chain_depth + 1,
    }
}

/// Replay a chain: `snapshot` must be a full version and `deltas` its
/// descendants in application order. Every step is checksum-verified.
pub fn replay(snapshot: &DocumentVersion, deltas: &[DocumentVersion]) -> KbResult<Materialized> {
    let VersionStorage::Full { text } = &snapshot.storage else {
        return Err(KbError::BrokenChain {
            version_id: snapshot.id.clone(),
            reason: "chain does not start at a snapshot".into(),
        });
    };
    verify(snapshot, text)?;

    let mut current = Materialized {
        text: text.clone(),
        chain_depth: 0,
        cumulative_patch_bytes: 0,
        snapshot_bytes: text.len(),
    };
    let mut base_id = snapshot.id.as_str();

    for version in deltas {
        let VersionStorage::Delta {
            base_version_id,
            patch,
            chain_depth,
        } = &version.storage
        else {
            return Err(KbError::BrokenChain {
                version_id: version.id.clone(),
                reason: "snapshot found in the middle of a delta chain".into(),
            });
        };
        if base_version_id != base_id {
            return Err(KbError::BrokenChain {
                version_id: version.id.clone(),
                reason: format!("expected base {base_id}, found {base_version_id}"),
            });
        }
        let text = patch.apply(&current.text).map_err(|reason| KbError::CorruptPatch {
            version_id: version.id.clone(),
            reason,
        })?;
        verify(version, &text)?;
        current = Materialized {
            text,
            chain_depth: *chain_depth,
            cumulative_patch_bytes: current.cumulative_patch_bytes + patch.inserted_bytes(),
            snapshot_bytes: current.snapshot_bytes,
        };
        base_id = version.id.as_str();
    }
    Ok(current)
}

fn verify(version: &DocumentVersion, text: &str) -> KbResult<()> {
    let actual = checksum(text);
    if actual != version.checksum {
        return Err(KbError::ChecksumMismatch {
            version_id: version.id.clone(),
            expected: version.checksum.clone(),
            actual,
        });
    }
    Ok(())
}

/// Reconstruct a version's text, walking back at most `max_depth` links.
///
/// Errors are [`KbError`]s wrapped in `anyhow`; callers can downcast.
pub async fn materialize(
    store: &dyn Store,
    version_id: &str,
    max_depth: u32,
) -> anyhow::Result<Materialized> {
    let mut current = store
        .get_version(version_id)
        .await?
        .ok_or_else(|| KbError::BrokenChain {
            version_id: version_id.to_string(),
            reason: "version not found".into(),
        })?;

    let mut deltas: Vec<DocumentVersion> = Vec::new();
    loop {
        let base_id = match &current.storage {
            VersionStorage::Full { .. } => break,
            VersionStorage::Delta { base_version_id, .. } => base_version_id.clone(),
        };
        if deltas.len() as u32 >= max_depth {
            return Err(KbError::BrokenChain {
                version_id: version_id.to_string(),
                reason: format!("chain exceeds maximum depth {max_depth}"),
            }
            .into());
        }
        let base = store
            .get_version(&base_id)
            .await?
            .ok_or_else(|| KbError::BrokenChain {
                version_id: current.id.clone(),
                reason: format!("base version {base_id} is missing"),
            })?;
        deltas.push(current);
        current = base;
    }
    deltas.reverse();
    Ok(replay(&current, &deltas)?)
}

/// The version whose validity contains `date`. Overlapping candidates are
/// broken by the latest start, then by position in `versions`.
pub fn version_in_force(versions: &[DocumentVersion], date: NaiveDate) -> Option<&DocumentVersion> {
    versions
        .iter()
        .enumerate()
        .filter(|(_, v)| v.validity.contains(date))
        .max_by_key(|(i, v)| (v.validity.from, *i))
        .map(|(_, v)| v)
}

/// Version citations should land on: the one in force on `date`, else the
/// one with the latest start.
pub fn citable_version(versions: &[DocumentVersion], date: NaiveDate) -> Option<&DocumentVersion> {
    version_in_force(versions, date).or_else(|| {
        versions
            .iter()
            .enumerate()
            .max_by_key(|(i, v)| (v.validity.from, *i))
            .map(|(_, v)| v)
    })
}
