//! Cumulative session manifest.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::report::{write_iteration_timings, write_loop_timings};
use super::write_atomic;
use crate::error::ManifestError;
use crate::runner::result::iso_utc;
use crate::runner::{RefineConfig, UnitResult, UnitStatus};

/// Per-status totals over recorded results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub ok: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StatusCounts {
    pub fn from_results(results: &[UnitResult]) -> Self {
        results.iter().fold(Self::default(), |mut acc, r| {
            match r.status {
                UnitStatus::Ok => acc.ok += 1,
                UnitStatus::Failed => acc.failed += 1,
                UnitStatus::Skipped => acc.skipped += 1,
            }
            acc
        })
    }

    pub fn total(&self) -> usize {
        self.ok + self.failed + self.skipped
    }
}

#[derive(Serialize)]
struct SessionManifest<'a> {
    session_id: &'a str,
    timestamp_utc: String,
    #[serde(flatten)]
    config: &'a RefineConfig,
    total_selected: usize,
    #[serde(flatten)]
    counts: StatusCounts,
    results: &'a [UnitResult],
}

/// Owns the session's result list and the files derived from it.
///
/// Results are append-only. Every `record` rewrites the manifest and both
/// timing reports through a temp-file rename.
#[derive(Debug)]
pub struct SessionManifestWriter {
    session_id: String,
    session_dir: PathBuf,
    config: RefineConfig,
    total_selected: usize,
    results: Vec<UnitResult>,
}

impl SessionManifestWriter {
    /// Starts a session whose id is derived from the current UTC time.
    pub fn create(config: &RefineConfig, total_selected: usize) -> Result<Self, ManifestError> {
        Self::create_with_id(config, total_selected, session_id_for(Utc::now()))
    }

    /// Starts a session with an explicit id.
    pub fn create_with_id(
        config: &RefineConfig,
        total_selected: usize,
        session_id: impl Into<String>,
    ) -> Result<Self, ManifestError> {
        let session_id = session_id.into();
        let session_dir = config.sessions_root().join(&session_id);
        fs::create_dir_all(&session_dir)?;
        debug!(session_id = %session_id, dir = %session_dir.display(), "session directory ready");
        Ok(Self {
            session_id,
            session_dir,
            config: config.clone(),
            total_selected,
            results: Vec::new(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.session_dir
            .join(format!("_refine_session_{}.json", self.session_id))
    }

    pub fn loop_timings_path(&self) -> PathBuf {
        self.session_dir
            .join(format!("_refine_loop_timings_{}.csv", self.session_id))
    }

    pub fn iteration_timings_path(&self) -> PathBuf {
        self.session_dir
            .join(format!("_refine_iteration_timings_{}.csv", self.session_id))
    }

    pub fn results(&self) -> &[UnitResult] {
        &self.results
    }

    pub fn counts(&self) -> StatusCounts {
        StatusCounts::from_results(&self.results)
    }

    /// Appends a result and rewrites every session file.
    pub fn record(&mut self, result: UnitResult) -> Result<(), ManifestError> {
        self.results.push(result);
        self.flush()
    }

    /// Rewrites the manifest and timing reports from the current results.
    pub fn flush(&self) -> Result<(), ManifestError> {
        let manifest = SessionManifest {
            session_id: &self.session_id,
            timestamp_utc: iso_utc(Utc::now()),
            config: &self.config,
            total_selected: self.total_selected,
            counts: self.counts(),
            results: &self.results,
        };
        let json = serde_json::to_vec_pretty(&manifest)?;
        write_atomic(&self.manifest_path(), &json)?;
        write_loop_timings(&self.loop_timings_path(), &self.results)?;
        write_iteration_timings(&self.iteration_timings_path(), &self.results)?;
        Ok(())
    }
}

/// `%Y%m%d-%H%M%S` of `start` in UTC.
pub fn session_id_for(start: DateTime<Utc>) -> String {
    start.format("%Y%m%d-%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::Value;
    use tempfile::TempDir;

    fn read_manifest(writer: &SessionManifestWriter) -> Value {
        serde_json::from_str(&fs::read_to_string(writer.manifest_path()).unwrap()).unwrap()
    }

    #[test]
    fn test_session_id_format() {
        let start = Utc.with_ymd_and_hms(2025, 7, 4, 9, 8, 7).unwrap();
        assert_eq!(session_id_for(start), "20250704-090807");
    }

    #[test]
    fn test_paths() {
        let temp = TempDir::new().unwrap();
        let config = RefineConfig::new(temp.path());
        let writer = SessionManifestWriter::create_with_id(&config, 0, "sid").unwrap();
        assert_eq!(
            writer.manifest_path(),
            temp.path().join("_refine_sessions/sid/_refine_session_sid.json")
        );
        assert!(writer.session_dir().is_dir());
        assert!(writer
            .iteration_timings_path()
            .ends_with("_refine_iteration_timings_sid.csv"));
    }

    #[test]
    fn test_record_rewrites_manifest() {
        let temp = TempDir::new().unwrap();
        let config = RefineConfig::new(temp.path());
        let mut writer = SessionManifestWriter::create_with_id(&config, 3, "sid").unwrap();

        writer.record(UnitResult::ok(1).with_batch_index(1)).unwrap();
        let first = read_manifest(&writer);
        assert_eq!(first["session_id"], "sid");
        assert_eq!(first["total_selected"], 3);
        assert_eq!(first["ok"], 1);
        assert_eq!(first["model"], "gpt-5-mini");
        assert_eq!(first["results"].as_array().unwrap().len(), 1);

        writer.record(UnitResult::failed(2, "boom")).unwrap();
        writer.record(UnitResult::skipped(3, "done")).unwrap();
        let last = read_manifest(&writer);
        assert_eq!(last["failed"], 1);
        assert_eq!(last["skipped"], 1);
        let ids: Vec<u64> = last["results"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["model_id"].as_u64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(writer.loop_timings_path().is_file());
        assert!(writer.iteration_timings_path().is_file());
    }

    #[test]
    fn test_counts() {
        let results = vec![
            UnitResult::ok(1),
            UnitResult::failed(2, "x"),
            UnitResult::failed(3, "y"),
        ];
        let counts = StatusCounts::from_results(&results);
        assert_eq!(counts.ok, 1);
        assert_eq!(counts.failed, 2);
        assert_eq!(counts.total(), 3);
    }
}
