//! Command-line interface for refine-harness.
//!
//! Provides the `refine`, `eval` and `difficulty` commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
