//! Resolved configuration for a refinement session.
//!
//! One `RefineConfig` is built from the command line at startup, validated
//! once, and then shared read-only by every unit of the session. The same
//! value is serialized into the session manifest as its configuration
//! snapshot.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while building or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value is out of its accepted range.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// A required path does not exist.
    #[error("{what} not found: {path}")]
    MissingPath { what: String, path: PathBuf },

    /// The ID selection matched nothing.
    #[error("No prompt IDs matched selection")]
    EmptySelection,

    /// IO error while reading configuration inputs.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Validation mode forwarded to the refiner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ValidateWith {
    /// Syntax-level formatting pass.
    Format,
    /// Full semantic check.
    Check,
}

impl fmt::Display for ValidateWith {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidateWith::Format => write!(f, "format"),
            ValidateWith::Check => write!(f, "check"),
        }
    }
}

/// Knobs passed straight through to the refiner process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinerOptions {
    pub model: String,
    pub max_iters: u32,
    pub temperature: Option<f64>,
    pub max_total_tokens: u64,
    pub api_max_retries: u32,
    pub api_retry_backoff_seconds: f64,
    pub api_retry_max_backoff_seconds: f64,
    pub api_timeout_seconds: f64,
    pub syside_timeout_seconds: u64,
    pub syside_validate_with: ValidateWith,
    /// Optional SysML example snippet.
    pub example: Option<PathBuf>,
    /// Ask the refiner to skip API and compiler calls.
    pub dry_run: bool,
}

impl Default for RefinerOptions {
    fn default() -> Self {
        Self {
            model: "gpt-5-mini".to_string(),
            max_iters: 5,
            temperature: None,
            max_total_tokens: 50_000,
            api_max_retries: 8,
            api_retry_backoff_seconds: 2.0,
            api_retry_max_backoff_seconds: 30.0,
            api_timeout_seconds: 120.0,
            syside_timeout_seconds: 60,
            syside_validate_with: ValidateWith::Format,
            example: None,
            dry_run: false,
        }
    }
}

/// Fully resolved options for one refinement session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefineConfig {
    // Filesystem layout
    /// Root containing per-ID prompt folders with `nl.txt`.
    pub prompts_root: PathBuf,
    /// Root containing ground-truth sample folders.
    pub samples_root: PathBuf,
    /// Evaluation-ready output root.
    pub output_root: PathBuf,
    /// Raw refiner run artifacts root.
    pub refine_runs_root: PathBuf,
    /// Refiner entry script.
    pub refine_script: PathBuf,
    /// Virtual environment forwarded to the refiner.
    pub venv: PathBuf,
    /// Interpreter override; defaults to `<venv>/bin/python`.
    pub python: Option<PathBuf>,
    /// Optional env file merged into the subprocess environment.
    pub env_file: Option<PathBuf>,

    // Selection
    pub start_id: u32,
    pub end_id: u32,
    pub skip: Vec<u32>,

    // Scheduling
    pub batch_size: usize,
    pub parallelism: usize,
    pub id_retries: u32,
    pub stop_on_error: bool,
    pub overwrite: bool,

    #[serde(flatten)]
    pub refiner: RefinerOptions,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            prompts_root: PathBuf::from("nl_prompts"),
            samples_root: PathBuf::from("sysmbench_original_upstream/dataset/sysml/samples"),
            output_root: PathBuf::from("Generated_from_Prompts_API_LOOP"),
            refine_runs_root: PathBuf::from("runs/refine_api_loop"),
            refine_script: PathBuf::from("refine_sysml.py"),
            venv: PathBuf::from(".venv"),
            python: None,
            env_file: Some(PathBuf::from(".env")),
            start_id: 1,
            end_id: 151,
            skip: Vec::new(),
            batch_size: 30,
            parallelism: 1,
            id_retries: 4,
            stop_on_error: false,
            overwrite: false,
            refiner: RefinerOptions::default(),
        }
    }
}

impl RefineConfig {
    /// Creates a configuration with defaults rooted at `output_root`.
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
            ..Default::default()
        }
    }

    /// Checks value ranges. Does not touch the filesystem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(invalid("--batch-size", "must be > 0"));
        }
        if self.parallelism == 0 {
            return Err(invalid("--parallelism", "must be > 0"));
        }
        if self.start_id > self.end_id {
            return Err(invalid("--start-id", "must be <= --end-id"));
        }
        if self.refiner.model.trim().is_empty() {
            return Err(invalid("--model", "cannot be empty"));
        }
        if self.refiner.max_iters == 0 {
            return Err(invalid("--max-iters", "must be > 0"));
        }
        if self.refiner.api_retry_backoff_seconds < 0.0
            || self.refiner.api_retry_max_backoff_seconds < 0.0
        {
            return Err(invalid("--api-retry-backoff-seconds", "cannot be negative"));
        }
        if self.refiner.api_timeout_seconds <= 0.0 {
            return Err(invalid("--api-timeout-seconds", "must be > 0"));
        }
        Ok(())
    }

    /// Checks that the inputs the session depends on exist.
    pub fn check_paths(&self) -> Result<(), ConfigError> {
        require_path("Prompts root", &self.prompts_root)?;
        require_path("Refine script", &self.refine_script)?;
        if self.python.is_none() {
            require_path("venv path", &self.venv)?;
        }
        self.python_executable().map(|_| ())
    }

    /// Anchors every relative path at `base`.
    pub fn resolve_against(mut self, base: &Path) -> Self {
        let anchor = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        anchor(&mut self.prompts_root);
        anchor(&mut self.samples_root);
        anchor(&mut self.output_root);
        anchor(&mut self.refine_runs_root);
        anchor(&mut self.refine_script);
        anchor(&mut self.venv);
        if let Some(p) = self.python.as_mut() {
            // Bare program names are looked up on PATH.
            if p.components().count() > 1 {
                anchor(p);
            }
        }
        if let Some(p) = self.env_file.as_mut() {
            anchor(p);
        }
        if let Some(p) = self.refiner.example.as_mut() {
            anchor(p);
        }
        self
    }

    /// Interpreter used to launch the refine script.
    pub fn python_executable(&self) -> Result<PathBuf, ConfigError> {
        if let Some(python) = &self.python {
            return Ok(python.clone());
        }
        let python = self.venv.join("bin").join("python");
        if !python.exists() {
            return Err(ConfigError::MissingPath {
                what: "venv python".to_string(),
                path: python,
            });
        }
        Ok(python)
    }

    /// Directory the refiner is launched from.
    pub fn working_dir(&self) -> PathBuf {
        self.refine_script
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    // Per-unit layout

    pub fn prompt_path(&self, model_id: u32) -> PathBuf {
        self.prompts_root.join(model_id.to_string()).join("nl.txt")
    }

    pub fn case_dir(&self, model_id: u32) -> PathBuf {
        self.output_root.join(model_id.to_string())
    }

    pub fn raw_runs_dir(&self, model_id: u32) -> PathBuf {
        self.refine_runs_root.join(model_id.to_string())
    }

    pub fn artifact_path(&self, model_id: u32) -> PathBuf {
        self.case_dir(model_id).join(format!("{model_id}.sysml"))
    }

    pub fn unit_manifest_path(&self, model_id: u32) -> PathBuf {
        self.case_dir(model_id)
            .join(format!("{model_id}_refine_manifest.json"))
    }

    pub fn groundtruth_copy_path(&self, model_id: u32) -> PathBuf {
        self.case_dir(model_id)
            .join(format!("{model_id}_groundtruth.sysml"))
    }

    pub fn stdout_log_path(&self, model_id: u32) -> PathBuf {
        self.case_dir(model_id)
            .join(format!("{model_id}_refine_stdout.log"))
    }

    pub fn stderr_log_path(&self, model_id: u32) -> PathBuf {
        self.case_dir(model_id)
            .join(format!("{model_id}_refine_stderr.log"))
    }

    /// File the refiner may write its run-log path into.
    pub fn result_channel_path(&self, model_id: u32) -> PathBuf {
        self.case_dir(model_id)
            .join(format!("{model_id}_refine_result.txt"))
    }

    pub fn archive_root(&self, model_id: u32) -> PathBuf {
        self.case_dir(model_id).join("refine_runs")
    }

    /// Candidate ground-truth sources, zero-padded folder first.
    pub fn groundtruth_candidates(&self, model_id: u32) -> [PathBuf; 2] {
        [
            self.samples_root
                .join(format!("{model_id:02}"))
                .join("design.sysml"),
            self.samples_root
                .join(model_id.to_string())
                .join("design.sysml"),
        ]
    }

    pub fn sessions_root(&self) -> PathBuf {
        self.output_root.join("_refine_sessions")
    }

    // Builders

    pub fn with_prompts_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.prompts_root = path.into();
        self
    }

    pub fn with_samples_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.samples_root = path.into();
        self
    }

    pub fn with_refine_runs_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.refine_runs_root = path.into();
        self
    }

    pub fn with_refine_script(mut self, path: impl Into<PathBuf>) -> Self {
        self.refine_script = path.into();
        self
    }

    pub fn with_python(mut self, path: impl Into<PathBuf>) -> Self {
        self.python = Some(path.into());
        self
    }

    pub fn with_id_range(mut self, start_id: u32, end_id: u32) -> Self {
        self.start_id = start_id;
        self.end_id = end_id;
        self
    }

    pub fn with_skip(mut self, skip: Vec<u32>) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_id_retries(mut self, retries: u32) -> Self {
        self.id_retries = retries;
        self
    }

    pub fn with_stop_on_error(mut self, stop: bool) -> Self {
        self.stop_on_error = stop;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_refiner(mut self, refiner: RefinerOptions) -> Self {
        self.refiner = refiner;
        self
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn require_path(what: &str, path: &Path) -> Result<(), ConfigError> {
    if path.exists() {
        Ok(())
    } else {
        Err(ConfigError::MissingPath {
            what: what.to_string(),
            path: path.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = RefineConfig::default();
        assert_eq!(config.batch_size, 30);
        assert_eq!(config.parallelism, 1);
        assert_eq!(config.id_retries, 4);
        assert_eq!(config.start_id, 1);
        assert_eq!(config.end_id, 151);
        assert_eq!(config.refiner.model, "gpt-5-mini");
        assert_eq!(config.refiner.syside_validate_with, ValidateWith::Format);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_batch_size() {
        let config = RefineConfig::default().with_batch_size(0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("--batch-size"));
    }

    #[test]
    fn test_validation_rejects_zero_parallelism() {
        let config = RefineConfig::default().with_parallelism(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_inverted_range() {
        let config = RefineConfig::default().with_id_range(10, 3);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("--start-id"));
    }

    #[test]
    fn test_unit_layout() {
        let config = RefineConfig::new("/out")
            .with_prompts_root("/prompts")
            .with_samples_root("/samples");
        assert_eq!(config.prompt_path(7), PathBuf::from("/prompts/7/nl.txt"));
        assert_eq!(config.artifact_path(7), PathBuf::from("/out/7/7.sysml"));
        assert_eq!(
            config.unit_manifest_path(7),
            PathBuf::from("/out/7/7_refine_manifest.json")
        );
        assert_eq!(
            config.groundtruth_candidates(7),
            [
                PathBuf::from("/samples/07/design.sysml"),
                PathBuf::from("/samples/7/design.sysml"),
            ]
        );
        assert_eq!(config.sessions_root(), PathBuf::from("/out/_refine_sessions"));
    }

    #[test]
    fn test_resolve_against_anchors_relative_paths() {
        let config = RefineConfig::default()
            .with_python("sh")
            .resolve_against(Path::new("/base"));
        assert_eq!(config.prompts_root, PathBuf::from("/base/nl_prompts"));
        assert_eq!(config.venv, PathBuf::from("/base/.venv"));
        assert_eq!(config.env_file, Some(PathBuf::from("/base/.env")));
        // Bare interpreter names stay PATH lookups.
        assert_eq!(config.python, Some(PathBuf::from("sh")));
    }

    #[test]
    fn test_python_executable_requires_venv_python() {
        let temp = TempDir::new().unwrap();
        let mut config = RefineConfig::default();
        config.venv = temp.path().to_path_buf();
        assert!(matches!(
            config.python_executable(),
            Err(ConfigError::MissingPath { .. })
        ));

        std::fs::create_dir_all(temp.path().join("bin")).unwrap();
        std::fs::write(temp.path().join("bin").join("python"), "").unwrap();
        assert_eq!(
            config.python_executable().unwrap(),
            temp.path().join("bin").join("python")
        );
    }

    #[test]
    fn test_check_paths_reports_missing_prompts_root() {
        let temp = TempDir::new().unwrap();
        let config = RefineConfig::new(temp.path())
            .with_prompts_root(temp.path().join("missing"))
            .with_python("sh");
        let err = config.check_paths().unwrap_err();
        assert!(err.to_string().contains("Prompts root"));
    }

    #[test]
    fn test_snapshot_flattens_refiner_options() {
        let json = serde_json::to_value(RefineConfig::default()).unwrap();
        assert_eq!(json["model"], "gpt-5-mini");
        assert_eq!(json["syside_validate_with"], "format");
        assert_eq!(json["batch_size"], 30);
    }

    #[test]
    fn test_working_dir_is_script_parent() {
        let config = RefineConfig::default().with_refine_script("/tools/refine_sysml.py");
        assert_eq!(config.working_dir(), PathBuf::from("/tools"));
        let bare = RefineConfig::default().with_refine_script("refine_sysml.py");
        assert_eq!(bare.working_dir(), PathBuf::from("."));
    }
}
