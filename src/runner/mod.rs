//! Refiner runner for benchmark prompts.
//!
//! This module runs the external SysML refiner against one prompt ID at a
//! time and turns whatever it leaves behind into a `UnitResult`.
//!
//! # Architecture
//!
//! ```text
//! WorkUnit → ResumeGate → RetryingRunner → UnitRunner → Refiner process
//!                                               │
//!                                               ▼
//!                                run_log.json → UnitResult + <id>_refine_manifest.json
//! ```
//!
//! The runner:
//! 1. Skips units whose previous result is already usable
//! 2. Copies the prompt and ground truth into the unit's output directory
//! 3. Invokes the refiner and captures stdout/stderr
//! 4. Locates and classifies the run log
//! 5. Publishes the artifact and archives the raw run directory
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use refine_harness::runner::{
//!     CommandRefiner, RefineConfig, RetryingRunner, SubprocessEnv, UnitRunner, WorkUnit,
//! };
//!
//! let config = Arc::new(RefineConfig::new("./out").with_prompts_root("./nl_prompts"));
//! let refiner = CommandRefiner::from_config(&config, SubprocessEnv::from_process())?;
//! let runner = RetryingRunner::new(UnitRunner::new(config.clone(), Arc::new(refiner)), 4);
//!
//! let result = runner.run(&WorkUnit::from_config(&config, 12)).await;
//! println!("{}: {}", result.model_id, result.status);
//! ```

pub mod archive;
pub mod config;
pub mod env;
pub mod executor;
pub mod refiner;
pub mod result;
pub mod resume;
pub mod retry;
pub mod run_log;

pub use config::{ConfigError, RefineConfig, RefinerOptions, ValidateWith};
pub use env::SubprocessEnv;
pub use executor::{UnitRunner, WorkUnit};
pub use refiner::{CommandRefiner, ProcessOutput, Refiner, RefinerInvocation, RESULT_FILE_ENV};
pub use result::{IterationRecord, UnitResult, UnitStatus};
pub use retry::RetryingRunner;
