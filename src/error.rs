//! Error types for refine-harness operations.
//!
//! Defines the error types shared across subsystems:
//! - Single-attempt unit execution (filesystem and process plumbing)
//! - Session manifest and timing report persistence
//! - LLM API interactions
//! - Evaluation and difficulty scoring

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while executing one attempt of a work unit.
///
/// These never escape the unit runner: they are folded into a failed
/// `UnitResult` whose reason is the error text.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("prompt file missing: {0}")]
    MissingPrompt(PathBuf),

    #[error("failed to spawn refiner: {0}")]
    Spawn(String),

    #[error("failed to copy '{from}' to '{to}': {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to archive run directory: {0}")]
    Archive(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while persisting the session manifest or timing reports.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to persist '{path}': {reason}")]
    Persist { path: PathBuf, reason: String },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that end a scheduled session early.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("stopping after failure in batch {batch_index} (stop-on-error); manifest: {}", manifest_path.display())]
    StoppedOnError {
        batch_index: usize,
        manifest_path: PathBuf,
    },

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: OPENAI_API_KEY environment variable not set")]
    MissingApiKey,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },
}

/// Errors that can occur while evaluating generated models.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("Missing required file: {0}")]
    MissingFile(PathBuf),

    #[error("No generated .sysml found in {0}")]
    NoGeneratedModel(PathBuf),

    #[error("Could not locate a reference sysml for model {model_id}. Tried: {tried}")]
    NoReference { model_id: u32, tried: String },

    #[error("Invalid dataset: {0}")]
    InvalidDataset(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
