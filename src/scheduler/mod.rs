//! Session scheduling.
//!
//! Turns the prompt corpus into an ordered list of work units and runs them
//! in batches:
//!
//! - **Selection**: numeric prompt folders filtered by ID range and skip list
//! - **BatchScheduler**: sequential or bounded-parallel dispatch per batch,
//!   with optional fail-fast
//!
//! # Architecture
//!
//! ```text
//!   prompts_root ──► select_units ──► [batch 1] [batch 2] ... [batch n]
//!                                          │
//!                          ┌───────────────┼───────────────┐
//!                          ▼               ▼               ▼
//!                      unit task       unit task       unit task   (≤ parallelism)
//!                          │               │               │
//!                          └───────► SessionManifestWriter ◄┘
//! ```

pub mod batch;
pub mod selection;

pub use batch::{BatchScheduler, SessionOutcome};
pub use selection::{discover_prompt_ids, select_ids, select_units};
