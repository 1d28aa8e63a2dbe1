//! Per-unit result records.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::run_log::RunLogEntry;

/// Outcome of one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// Refinement produced a validated artifact.
    Ok,
    /// The attempt failed; `reason` says why.
    Failed,
    /// A previous successful output was reused.
    Skipped,
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitStatus::Ok => write!(f, "ok"),
            UnitStatus::Failed => write!(f, "failed"),
            UnitStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Timing and usage for one refinement iteration reported by the refiner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: i64,
    pub iteration_start: Option<String>,
    pub iteration_end: Option<String>,
    pub iteration_duration_seconds: Option<f64>,
    pub success: bool,
    pub return_code: Option<i64>,
    pub tokens_used_this_iter_total: Option<u64>,
    pub tokens_used_total: Option<u64>,
}

impl From<&RunLogEntry> for IterationRecord {
    fn from(entry: &RunLogEntry) -> Self {
        Self {
            iteration: entry.iteration.unwrap_or(0),
            iteration_start: entry.iteration_start.as_ref().and_then(timestamp_text),
            iteration_end: entry.iteration_end.as_ref().and_then(timestamp_text),
            iteration_duration_seconds: entry.iteration_duration_seconds,
            success: entry.succeeded(),
            return_code: entry.return_code,
            tokens_used_this_iter_total: entry.iteration_total_tokens(),
            tokens_used_total: entry.tokens_used_total,
        }
    }
}

fn timestamp_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Record of one unit's outcome, as written to the per-unit and session
/// manifests.
///
/// Created once per attempt. Annotations (`attempt`, `attempts_used`,
/// `batch_index`) are applied through consuming builders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitResult {
    pub model_id: u32,
    pub status: UnitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_path: Option<PathBuf>,
    #[serde(default)]
    pub groundtruth_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_run_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_log_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_log: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_log: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations_completed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_iteration_success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used_total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_start_utc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_end_utc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub iteration_timings: Vec<IterationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts_used: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_index: Option<usize>,
}

impl UnitResult {
    fn bare(model_id: u32, status: UnitStatus, reason: Option<String>) -> Self {
        Self {
            model_id,
            status,
            reason,
            prompt_path: None,
            generated_path: None,
            groundtruth_path: None,
            run_dir: None,
            archived_run_dir: None,
            run_log_path: None,
            stdout_log: None,
            stderr_log: None,
            iterations_completed: None,
            final_iteration_success: None,
            tokens_used_total: None,
            loop_start_utc: None,
            loop_end_utc: None,
            loop_duration_seconds: None,
            iteration_timings: Vec::new(),
            attempt: None,
            attempts_used: None,
            batch_index: None,
        }
    }

    /// Creates a successful result.
    pub fn ok(model_id: u32) -> Self {
        Self::bare(model_id, UnitStatus::Ok, None)
    }

    /// Creates a failed result with a reason.
    pub fn failed(model_id: u32, reason: impl Into<String>) -> Self {
        Self::bare(model_id, UnitStatus::Failed, Some(reason.into()))
    }

    /// Creates a skipped result with a reason.
    pub fn skipped(model_id: u32, reason: impl Into<String>) -> Self {
        Self::bare(model_id, UnitStatus::Skipped, Some(reason.into()))
    }

    pub fn is_failed(&self) -> bool {
        self.status == UnitStatus::Failed
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_attempts_used(mut self, attempts: u32) -> Self {
        self.attempts_used = Some(attempts);
        self
    }

    pub fn with_batch_index(mut self, batch_index: usize) -> Self {
        self.batch_index = Some(batch_index);
        self
    }

    /// Reason text, empty for successful results.
    pub fn reason_text(&self) -> &str {
        self.reason.as_deref().unwrap_or("")
    }
}

/// RFC 3339 UTC timestamp with a `Z` suffix.
pub fn iso_utc(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}
