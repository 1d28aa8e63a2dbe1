//! Evaluation harness for generated SysML models.
//!
//! - **Evaluator**: renders precision/recall prompts and records LLM verdicts
//! - **Score**: `Score: X/Y` extraction from verdict text
//! - **Difficulty**: averages per line-count bucket of the reference dataset

pub mod difficulty;
pub mod evaluator;
pub mod score;

pub use difficulty::{run_difficulty, BucketMetrics, DifficultyReport};
pub use evaluator::{run_evaluation, EvalConfig, EvalSummary, Evaluation, EvaluationRecord};
pub use score::{extract_score, ScoreRatio};
