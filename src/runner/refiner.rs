//! The refiner subprocess seam.
//!
//! The refiner is an opaque external program. `Refiner` abstracts a single
//! blocking invocation so the unit runner can be driven by a real process
//! (`CommandRefiner`) or by an in-process double in tests.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::config::{ConfigError, RefineConfig, RefinerOptions};
use super::env::SubprocessEnv;
use crate::error::RunnerError;

/// Environment variable naming the file a refiner may write its run-log path to.
pub const RESULT_FILE_ENV: &str = "REFINE_RESULT_FILE";

/// Inputs for one refiner invocation.
#[derive(Debug, Clone)]
pub struct RefinerInvocation {
    pub model_id: u32,
    pub prompt_path: PathBuf,
    /// Root under which the refiner creates its run directory.
    pub output_dir: PathBuf,
    /// Structured result channel exported as `REFINE_RESULT_FILE`.
    pub result_channel: PathBuf,
}

/// Captured outcome of a finished process.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// Exit code; -1 when terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs the external refiner to completion.
///
/// Implementations wait without a timeout; the refiner enforces its own.
#[async_trait]
pub trait Refiner: Send + Sync {
    async fn refine(&self, invocation: &RefinerInvocation) -> Result<ProcessOutput, RunnerError>;
}

/// Launches the refine script as `<python> <script> <args...>`.
#[derive(Debug, Clone)]
pub struct CommandRefiner {
    program: PathBuf,
    script: PathBuf,
    venv: PathBuf,
    working_dir: PathBuf,
    options: RefinerOptions,
    env: SubprocessEnv,
}

impl CommandRefiner {
    pub fn new(
        program: impl Into<PathBuf>,
        script: impl Into<PathBuf>,
        venv: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
        options: RefinerOptions,
        env: SubprocessEnv,
    ) -> Self {
        Self {
            program: program.into(),
            script: script.into(),
            venv: venv.into(),
            working_dir: working_dir.into(),
            options,
            env,
        }
    }

    /// Builds a refiner from the resolved session configuration.
    pub fn from_config(config: &RefineConfig, env: SubprocessEnv) -> Result<Self, ConfigError> {
        Ok(Self::new(
            config.python_executable()?,
            &config.refine_script,
            &config.venv,
            config.working_dir(),
            config.refiner.clone(),
            env,
        ))
    }

    /// Argument list after the interpreter. Shape is fixed by the options.
    pub fn build_args(&self, invocation: &RefinerInvocation) -> Vec<String> {
        let opts = &self.options;
        let mut args = vec![
            path_arg(&self.script),
            "--input".to_string(),
            path_arg(&invocation.prompt_path),
            "--output-dir".to_string(),
            path_arg(&invocation.output_dir),
            "--model".to_string(),
            opts.model.clone(),
            "--max-iters".to_string(),
            opts.max_iters.to_string(),
            "--max-total-tokens".to_string(),
            opts.max_total_tokens.to_string(),
            "--venv".to_string(),
            path_arg(&self.venv),
            "--syside-timeout-seconds".to_string(),
            opts.syside_timeout_seconds.to_string(),
            "--syside-validate-with".to_string(),
            opts.syside_validate_with.to_string(),
            "--api-max-retries".to_string(),
            opts.api_max_retries.to_string(),
            "--api-retry-backoff-seconds".to_string(),
            float_arg(opts.api_retry_backoff_seconds),
            "--api-retry-max-backoff-seconds".to_string(),
            float_arg(opts.api_retry_max_backoff_seconds),
            "--api-timeout-seconds".to_string(),
            float_arg(opts.api_timeout_seconds),
        ];
        if let Some(temperature) = opts.temperature {
            args.push("--temperature".to_string());
            args.push(float_arg(temperature));
        }
        if let Some(example) = &opts.example {
            args.push("--example".to_string());
            args.push(path_arg(example));
        }
        if opts.dry_run {
            args.push("--dry-run".to_string());
        }
        args
    }
}

#[async_trait]
impl Refiner for CommandRefiner {
    async fn refine(&self, invocation: &RefinerInvocation) -> Result<ProcessOutput, RunnerError> {
        let args = self.build_args(invocation);
        debug!(
            model_id = invocation.model_id,
            "refiner command: {} {}",
            self.program.display(),
            args.join(" ")
        );

        let output = Command::new(&self.program)
            .args(&args)
            .current_dir(&self.working_dir)
            .env_clear()
            .envs(self.env.iter())
            .env(RESULT_FILE_ENV, &invocation.result_channel)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                RunnerError::Spawn(format!("{}: {}", self.program.display(), e))
            })?;

        Ok(ProcessOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Keeps a decimal point so `2.0` is not rendered as `2`.
fn float_arg(value: f64) -> String {
    format!("{value:?}")
}
