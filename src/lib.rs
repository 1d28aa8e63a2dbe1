//! refine-harness: batch runner and evaluation harness for SysML refinement
//! benchmarks.
//!
//! This library drives an external refiner over a numbered prompt corpus,
//! keeps a resumable session manifest with timing reports, and scores the
//! generated models with an LLM judge.

// Core modules
pub mod cli;
pub mod error;
pub mod eval;
pub mod llm;
pub mod runner;
pub mod scheduler;
pub mod session;

// Re-export commonly used error types
pub use error::{EvalError, LlmError, ManifestError, RunnerError, SchedulerError};
