//! Locating and reading the refiner's run log.
//!
//! The refiner writes a JSON array describing each refinement iteration into
//! its own run directory. Finding that directory goes through, in order: the
//! structured result channel, the `[done]` stdout marker, and a scan of the
//! raw-run directory for the newest subdirectory.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// File name the refiner uses for its run log.
pub const RUN_LOG_FILE: &str = "run_log.json";

// Compatibility shim: the refiner has no structured result channel of its
// own, so its final stdout line is matched textually.
fn done_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[done\] run details saved to (.+run_log\.json)").expect("valid regex")
    })
}

/// Returns the path from the last `[done]` marker line in `stdout`.
pub fn parse_done_marker(stdout: &str) -> Option<PathBuf> {
    stdout.lines().rev().find_map(|line| {
        done_marker()
            .captures(line)
            .map(|caps| PathBuf::from(caps[1].trim()))
    })
}

/// Reads a run-log path the refiner wrote into the result channel file.
pub fn read_result_channel(channel: &Path) -> Option<PathBuf> {
    let content = fs::read_to_string(channel).ok()?;
    let trimmed = content.trim();
    (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
}

/// Names of the immediate subdirectories of `dir`.
pub fn list_run_dirs(dir: &Path) -> Vec<String> {
    subdirs(dir)
        .into_iter()
        .filter_map(|(p, _)| p.file_name().map(|n| n.to_string_lossy().to_string()))
        .collect()
}

/// Picks the newest subdirectory not in `before`, else the newest overall.
///
/// The refiner names run directories by its own clock, so two invocations in
/// the same second can collide; the pre-invocation snapshot disambiguates.
pub fn find_newest_run_dir(raw_runs_dir: &Path, before: &[String]) -> Option<PathBuf> {
    let dirs = subdirs(raw_runs_dir);
    if dirs.is_empty() {
        return None;
    }
    let seen: HashSet<&str> = before.iter().map(String::as_str).collect();
    let newest = |candidates: Vec<&(PathBuf, SystemTime)>| {
        candidates
            .into_iter()
            .max_by_key(|(_, mtime)| *mtime)
            .map(|(p, _)| p.clone())
    };
    let unseen: Vec<_> = dirs
        .iter()
        .filter(|(p, _)| {
            p.file_name()
                .map(|n| !seen.contains(n.to_string_lossy().as_ref()))
                .unwrap_or(false)
        })
        .collect();
    if !unseen.is_empty() {
        return newest(unseen);
    }
    newest(dirs.iter().collect())
}

fn subdirs(dir: &Path) -> Vec<(PathBuf, SystemTime)> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter(|e| e.path().is_dir())
        .map(|e| {
            let mtime = e
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (e.path(), mtime)
        })
        .collect()
}

/// One entry of the refiner's run log. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunLogEntry {
    #[serde(default)]
    pub iteration: Option<i64>,
    #[serde(default)]
    pub iteration_start: Option<serde_json::Value>,
    #[serde(default)]
    pub iteration_end: Option<serde_json::Value>,
    #[serde(default)]
    pub iteration_duration_seconds: Option<f64>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub return_code: Option<i64>,
    #[serde(default)]
    pub sysml_path: Option<String>,
    #[serde(default)]
    pub tokens_used_this_iter: Option<serde_json::Value>,
    #[serde(default)]
    pub tokens_used_total: Option<u64>,
}

impl RunLogEntry {
    pub fn succeeded(&self) -> bool {
        self.success.unwrap_or(false)
    }

    /// `tokens_used_this_iter.total_tokens`, when the field is a mapping.
    pub fn iteration_total_tokens(&self) -> Option<u64> {
        self.tokens_used_this_iter
            .as_ref()
            .and_then(|v| v.as_object())
            .and_then(|o| o.get("total_tokens"))
            .and_then(|v| v.as_u64())
    }
}

/// Why a run log could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunLogProblem {
    Invalid(String),
    Empty,
}

impl std::fmt::Display for RunLogProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunLogProblem::Invalid(detail) => write!(f, "invalid run_log.json: {detail}"),
            RunLogProblem::Empty => write!(f, "run_log.json is empty"),
        }
    }
}

/// Parses run-log text into a non-empty list of entries.
pub fn parse_run_log(text: &str) -> Result<Vec<RunLogEntry>, RunLogProblem> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| RunLogProblem::Invalid(e.to_string()))?;
    let serde_json::Value::Array(items) = value else {
        return Err(RunLogProblem::Invalid("expected a JSON array".to_string()));
    };
    if items.is_empty() {
        return Err(RunLogProblem::Empty);
    }
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            serde_json::from_value(item)
                .map_err(|e| RunLogProblem::Invalid(format!("entry {i}: {e}")))
        })
        .collect()
}

/// Artifact to publish: last successful entry's path, else the final entry's.
pub fn select_artifact(entries: &[RunLogEntry]) -> Option<PathBuf> {
    entries
        .iter()
        .rev()
        .find(|e| e.succeeded() && e.sysml_path.is_some())
        .or_else(|| entries.last())
        .and_then(|e| e.sysml_path.as_deref())
        .map(PathBuf::from)
}
