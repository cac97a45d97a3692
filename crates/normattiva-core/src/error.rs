//! Error taxonomy for the structuring and resolution engine.
//!
//! Only genuine failures live here. Expected terminal states (an unresolved
//! reference, a pending conflict, a skipped duplicate) are ordinary values
//! returned by the respective modules.

use thiserror::Error;

/// Result alias used by the pure core algorithms.
pub type KbResult<T> = Result<T, KbError>;

#[derive(Debug, Error)]
pub enum KbError {
    /// Markup could not be parsed into a single well-formed tree.
    /// Per-file fatal: the input is skipped and nothing is written for it.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// Reconstructed version text does not hash to the stored checksum.
    #[error("checksum mismatch for version {version_id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        version_id: String,
        expected: String,
        actual: String,
    },

    /// A delta chain has a missing link or exceeds the configured depth cap.
    #[error("broken delta chain at version {version_id}: {reason}")]
    BrokenChain { version_id: String, reason: String },

    /// A patch refers to lines outside its base text.
    #[error("corrupt patch for version {version_id}: {reason}")]
    CorruptPatch { version_id: String, reason: String },

    /// Same (document, version_tag) re-ingested with different content.
    #[error("version tag '{version_tag}' of {document} already stored with checksum {existing}, refusing {incoming}")]
    VersionTagConflict {
        document: String,
        version_tag: String,
        existing: String,
        incoming: String,
    },

    /// A conflict lifecycle transition that is not allowed.
    #[error("invalid conflict transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl KbError {
    /// Short machine-readable kind, recorded on batch report failures.
    pub fn kind(&self) -> &'static str {
        match self {
            KbError::MalformedInput(_) => "malformed_input",
            KbError::ChecksumMismatch { .. } => "checksum_mismatch",
            KbError::BrokenChain { .. } => "broken_chain",
            KbError::CorruptPatch { .. } => "corrupt_patch",
            KbError::VersionTagConflict { .. } => "version_tag_conflict",
            KbError::InvalidTransition { .. } => "invalid_transition",
            KbError::InvalidConfig(_) => "invalid_config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = KbError::ChecksumMismatch {
            version_id: "v1".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("v1"));
        assert!(msg.contains("aa"));
        assert_eq!(err.kind(), "checksum_mismatch");
    }
}
