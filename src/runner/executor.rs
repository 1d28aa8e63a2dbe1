//! Unit runner: one refiner attempt for one prompt ID.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::archive::{archive_run_dir, copy_file, copy_groundtruth};
use super::config::RefineConfig;
use super::refiner::{Refiner, RefinerInvocation};
use super::result::{iso_utc, IterationRecord, UnitResult};
use super::resume;
use super::run_log::{
    find_newest_run_dir, list_run_dirs, parse_done_marker, parse_run_log, read_result_channel,
    select_artifact, RunLogEntry, RunLogProblem, RUN_LOG_FILE,
};
use crate::error::RunnerError;

/// One prompt ID scheduled for refinement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub model_id: u32,
    pub prompt_path: PathBuf,
    /// First existing ground-truth candidate, if any.
    pub groundtruth_source: Option<PathBuf>,
}

impl WorkUnit {
    /// Resolves the prompt and ground-truth paths for `model_id`.
    pub fn from_config(config: &RefineConfig, model_id: u32) -> Self {
        let groundtruth_source = config
            .groundtruth_candidates(model_id)
            .into_iter()
            .find(|p| p.is_file());
        Self {
            model_id,
            prompt_path: config.prompt_path(model_id),
            groundtruth_source,
        }
    }
}

/// Runs a single attempt and classifies the outcome.
///
/// `run` never fails: every error inside the attempt becomes a failed
/// `UnitResult`. Side effects are confined to the unit's own output and
/// raw-run directories.
#[derive(Clone)]
pub struct UnitRunner {
    config: Arc<RefineConfig>,
    refiner: Arc<dyn Refiner>,
}

impl UnitRunner {
    pub fn new(config: Arc<RefineConfig>, refiner: Arc<dyn Refiner>) -> Self {
        Self { config, refiner }
    }

    pub fn config(&self) -> &RefineConfig {
        &self.config
    }

    /// Performs exactly one refiner invocation for `unit` unless the resume
    /// gate says the unit is already done.
    pub async fn run(&self, unit: &WorkUnit) -> UnitResult {
        match self.attempt(unit).await {
            Ok(result) => result,
            Err(e) => {
                warn!(model_id = unit.model_id, error = %e, "attempt aborted");
                let mut result = UnitResult::failed(unit.model_id, e.to_string());
                result.prompt_path = Some(unit.prompt_path.clone());
                result
            }
        }
    }

    async fn attempt(&self, unit: &WorkUnit) -> Result<UnitResult, RunnerError> {
        let config = &self.config;
        let id = unit.model_id;
        let case_dir = config.case_dir(id);
        let raw_runs_dir = config.raw_runs_dir(id);
        fs::create_dir_all(&case_dir)?;
        fs::create_dir_all(&raw_runs_dir)?;

        if resume::is_satisfied(config, id) {
            let artifact = config.artifact_path(id);
            info!(model_id = id, "skipping, existing artifact {}", artifact.display());
            let mut result =
                UnitResult::skipped(id, format!("existing artifact {}", artifact.display()));
            result.prompt_path = Some(unit.prompt_path.clone());
            result.generated_path = Some(artifact);
            return Ok(result);
        }

        if !unit.prompt_path.is_file() {
            return Err(RunnerError::MissingPrompt(unit.prompt_path.clone()));
        }
        copy_file(&unit.prompt_path, &case_dir.join("nl.txt"))?;
        let groundtruth_path = copy_groundtruth(
            unit.groundtruth_source.as_slice(),
            &config.groundtruth_copy_path(id),
        )?;

        let before = list_run_dirs(&raw_runs_dir);
        let channel = config.result_channel_path(id);
        remove_if_exists(&channel)?;

        let invocation = RefinerInvocation {
            model_id: id,
            prompt_path: unit.prompt_path.clone(),
            output_dir: raw_runs_dir.clone(),
            result_channel: channel.clone(),
        };

        info!(model_id = id, "starting refiner");
        let loop_start = Utc::now();
        let started = Instant::now();
        let output = self.refiner.refine(&invocation).await?;
        let elapsed = started.elapsed();
        let loop_end = Utc::now();

        let stdout_log = config.stdout_log_path(id);
        let stderr_log = config.stderr_log_path(id);
        fs::write(&stdout_log, &output.stdout)?;
        fs::write(&stderr_log, &output.stderr)?;

        let ctx = AttemptContext {
            model_id: id,
            prompt_path: unit.prompt_path.clone(),
            groundtruth_path,
            stdout_log,
            stderr_log,
            loop_start,
            loop_end,
            elapsed,
        };

        if !output.is_success() {
            return Ok(ctx.failed(format!("refiner exited with code {}", output.exit_code)));
        }

        let run_dir = read_result_channel(&channel)
            .or_else(|| parse_done_marker(&output.stdout))
            .map(|log| self.resolve(log))
            .and_then(|log| log.parent().map(Path::to_path_buf))
            .or_else(|| find_newest_run_dir(&raw_runs_dir, &before));
        let Some(run_dir) = run_dir else {
            return Ok(ctx.failed("could not locate run_log.json from refiner output"));
        };
        let run_log_path = run_dir.join(RUN_LOG_FILE);
        if !run_log_path.is_file() {
            return Ok(ctx.failed("could not locate run_log.json from refiner output"));
        }
        debug!(model_id = id, run_log = %run_log_path.display(), "found run log");

        let parsed = match String::from_utf8(fs::read(&run_log_path)?) {
            Ok(text) => parse_run_log(&text),
            Err(e) => Err(RunLogProblem::Invalid(e.to_string())),
        };
        let entries = match parsed {
            Ok(entries) => entries,
            Err(problem) => {
                let mut result = ctx.failed(problem.to_string());
                result.run_dir = Some(run_dir);
                result.run_log_path = Some(run_log_path);
                return Ok(result);
            }
        };

        if !entries.iter().any(RunLogEntry::succeeded) {
            let result = ctx
                .failed("no iteration passed validation")
                .tap_run_log(&run_dir, &run_log_path, &entries);
            self.write_unit_manifest_quietly(&result);
            return Ok(result);
        }

        let artifact = select_artifact(&entries).map(|p| self.resolve(p));
        let artifact = match artifact {
            Some(path) if path.is_file() => path,
            other => {
                let shown = other
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "<none>".to_string());
                let result = ctx
                    .failed(format!("final sysml path missing: {shown}"))
                    .tap_run_log(&run_dir, &run_log_path, &entries);
                self.write_unit_manifest_quietly(&result);
                return Ok(result);
            }
        };

        let generated_path = config.artifact_path(id);
        copy_file(&artifact, &generated_path)?;
        let archived = archive_run_dir(&run_dir, &config.archive_root(id))?;

        let mut result = ctx
            .finish(UnitResult::ok(id))
            .tap_run_log(&run_dir, &run_log_path, &entries);
        result.generated_path = Some(generated_path);
        result.archived_run_dir = Some(archived);
        self.write_unit_manifest(&result)?;

        info!(
            model_id = id,
            iterations = entries.len(),
            duration_secs = elapsed.as_secs_f64(),
            "refinement succeeded"
        );
        Ok(result)
    }

    /// Paths reported by the refiner are relative to its working directory.
    fn resolve(&self, path: PathBuf) -> PathBuf {
        if path.is_relative() {
            self.config.working_dir().join(path)
        } else {
            path
        }
    }

    fn write_unit_manifest(&self, result: &UnitResult) -> Result<(), RunnerError> {
        let path = self.config.unit_manifest_path(result.model_id);
        let json = serde_json::to_string_pretty(result)?;
        fs::write(&path, json)?;
        Ok(())
    }

    fn write_unit_manifest_quietly(&self, result: &UnitResult) {
        if let Err(e) = self.write_unit_manifest(result) {
            warn!(model_id = result.model_id, error = %e, "failed to write unit manifest");
        }
    }
}

/// Provenance shared by every outcome after the refiner has run.
struct AttemptContext {
    model_id: u32,
    prompt_path: PathBuf,
    groundtruth_path: Option<PathBuf>,
    stdout_log: PathBuf,
    stderr_log: PathBuf,
    loop_start: DateTime<Utc>,
    loop_end: DateTime<Utc>,
    elapsed: Duration,
}

impl AttemptContext {
    fn finish(&self, base: UnitResult) -> UnitResult {
        UnitResult {
            prompt_path: Some(self.prompt_path.clone()),
            groundtruth_path: self.groundtruth_path.clone(),
            stdout_log: Some(self.stdout_log.clone()),
            stderr_log: Some(self.stderr_log.clone()),
            loop_start_utc: Some(iso_utc(self.loop_start)),
            loop_end_utc: Some(iso_utc(self.loop_end)),
            loop_duration_seconds: Some(self.elapsed.as_secs_f64()),
            ..base
        }
    }

    fn failed(&self, reason: impl Into<String>) -> UnitResult {
        let reason = reason.into();
        warn!(model_id = self.model_id, reason = %reason, "attempt failed");
        self.finish(UnitResult::failed(self.model_id, reason))
    }
}

trait RunLogFields {
    fn tap_run_log(self, run_dir: &Path, run_log_path: &Path, entries: &[RunLogEntry]) -> Self;
}

impl RunLogFields for UnitResult {
    fn tap_run_log(mut self, run_dir: &Path, run_log_path: &Path, entries: &[RunLogEntry]) -> Self {
        let last = entries.last();
        self.run_dir = Some(run_dir.to_path_buf());
        self.run_log_path = Some(run_log_path.to_path_buf());
        self.iterations_completed = Some(entries.len());
        self.final_iteration_success = Some(last.is_some_and(RunLogEntry::succeeded));
        self.tokens_used_total = Some(last.and_then(|e| e.tokens_used_total).unwrap_or(0));
        self.iteration_timings = entries.iter().map(IterationRecord::from).collect();
        self
    }
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
