//! Per-pass batch reports.
//!
//! Every batch pass collects per-unit failures instead of aborting. The
//! report is printed on stdout as a short summary, or as JSON for scripts
//! (`--json` on the batch commands).

use anyhow::Result;
use serde::Serialize;

use normattiva_core::error::KbError;

/// One unit that could not be processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    /// Origin of a raw input, or the id of the node / reference / document.
    pub unit: String,
    /// Pipeline step that failed, e.g. `parse`, `version`, `store`.
    pub stage: String,
    /// [`KbError::kind`] when the failure came from the engine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub pass: String,
    pub processed: usize,
    /// Units that produced new rows.
    pub written: usize,
    pub skipped_duplicates: usize,
    pub failures: Vec<UnitFailure>,
}

impl BatchReport {
    pub fn new(pass: &str) -> Self {
        Self {
            pass: pass.to_string(),
            ..Self::default()
        }
    }

    pub fn fail(&mut self, unit: impl Into<String>, stage: &str, reason: impl ToString) {
        self.push(UnitFailure {
            unit: unit.into(),
            stage: stage.to_string(),
            kind: None,
            reason: reason.to_string(),
        });
    }

    /// Record `err`, tagging it with its [`KbError::kind`] when it has one.
    pub fn fail_error(&mut self, unit: impl Into<String>, stage: &str, err: &anyhow::Error) {
        self.push(UnitFailure {
            unit: unit.into(),
            stage: stage.to_string(),
            kind: err.downcast_ref::<KbError>().map(|e| e.kind().to_string()),
            reason: format!("{err:#}"),
        });
    }

    fn push(&mut self, failure: UnitFailure) {
        tracing::warn!(
            pass = %self.pass,
            unit = %failure.unit,
            stage = %failure.stage,
            kind = failure.kind.as_deref().unwrap_or("-"),
            reason = %failure.reason,
            "unit failed"
        );
        self.failures.push(failure);
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn log_summary(&self) {
        tracing::info!(
            pass = %self.pass,
            processed = self.processed,
            written = self.written,
            skipped_duplicates = self.skipped_duplicates,
            failed = self.failures.len(),
            "pass finished"
        );
    }

    /// Log the summary, then print it as text or as one JSON object.
    pub fn emit(&self, json: bool) -> Result<()> {
        self.log_summary();
        if json {
            println!("{}", serde_json::to_string_pretty(self)?);
        } else {
            self.print_summary();
        }
        Ok(())
    }

    pub fn print_summary(&self) {
        println!("{}", self.pass);
        println!("  processed: {}", self.processed);
        println!("  written: {}", self.written);
        println!("  skipped (duplicate): {}", self.skipped_duplicates);
        println!("  failed: {}", self.failures.len());
        for f in &self.failures {
            println!("    [{}] {}: {}", f.stage, f.unit, f.reason);
        }
        if self.is_clean() {
            println!("ok");
        }
    }
}
