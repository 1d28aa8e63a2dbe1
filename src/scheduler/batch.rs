//! Batch scheduler: ordered batches, bounded parallel dispatch, fail-fast.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;

use futures::FutureExt;
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{error, info, warn};

use crate::error::SchedulerError;
use crate::runner::{RefineConfig, RetryingRunner, UnitResult, WorkUnit};
use crate::session::{SessionManifestWriter, StatusCounts};

/// Summary of a completed session.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: String,
    pub manifest_path: PathBuf,
    pub total_selected: usize,
    pub counts: StatusCounts,
}

/// Splits the selection into batches and drives each unit through the
/// retrying runner, recording every result as soon as it completes.
///
/// Batches are barriers: batch `k + 1` starts only after every unit of batch
/// `k` has been recorded. Only the scheduler writes session files.
#[derive(Clone)]
pub struct BatchScheduler {
    runner: RetryingRunner,
    batch_size: usize,
    parallelism: usize,
    stop_on_error: bool,
}

impl BatchScheduler {
    pub fn new(runner: RetryingRunner, batch_size: usize, parallelism: usize) -> Self {
        Self {
            runner,
            batch_size: batch_size.max(1),
            parallelism: parallelism.max(1),
            stop_on_error: false,
        }
    }

    /// Takes batch size, parallelism and fail-fast from the session config.
    pub fn from_config(config: &RefineConfig, runner: RetryingRunner) -> Self {
        Self::new(runner, config.batch_size, config.parallelism)
            .with_stop_on_error(config.stop_on_error)
    }

    pub fn with_stop_on_error(mut self, stop: bool) -> Self {
        self.stop_on_error = stop;
        self
    }

    /// Runs every unit and returns the final counts.
    ///
    /// With stop-on-error, the first final failure prevents any further
    /// dispatch; in-flight units are still awaited and recorded before
    /// `SchedulerError::StoppedOnError` is returned.
    pub async fn run(
        &self,
        units: &[WorkUnit],
        writer: &mut SessionManifestWriter,
    ) -> Result<SessionOutcome, SchedulerError> {
        writer.flush()?;
        let total_batches = units.len().div_ceil(self.batch_size);

        for (i, batch) in units.chunks(self.batch_size).enumerate() {
            let batch_index = i + 1;
            info!(
                batch_index,
                total_batches,
                units = batch.len(),
                "Starting batch {}/{}",
                batch_index,
                total_batches
            );

            let stopped = if self.parallelism == 1 || batch.len() == 1 {
                self.run_sequential(batch, batch_index, writer).await?
            } else {
                self.run_parallel(batch, batch_index, writer).await?
            };

            if stopped {
                writer.flush()?;
                error!(
                    batch_index,
                    manifest = %writer.manifest_path().display(),
                    "Stopping after failure (stop-on-error)"
                );
                return Err(SchedulerError::StoppedOnError {
                    batch_index,
                    manifest_path: writer.manifest_path(),
                });
            }
        }

        Ok(SessionOutcome {
            session_id: writer.session_id().to_string(),
            manifest_path: writer.manifest_path(),
            total_selected: units.len(),
            counts: writer.counts(),
        })
    }

    /// Returns true when fail-fast triggered.
    async fn run_sequential(
        &self,
        batch: &[WorkUnit],
        batch_index: usize,
        writer: &mut SessionManifestWriter,
    ) -> Result<bool, SchedulerError> {
        for unit in batch {
            let result = run_guarded(self.runner.clone(), unit.clone()).await;
            if self.record(result, batch_index, writer)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Returns true when fail-fast triggered.
    async fn run_parallel(
        &self,
        batch: &[WorkUnit],
        batch_index: usize,
        writer: &mut SessionManifestWriter,
    ) -> Result<bool, SchedulerError> {
        let limit = self.parallelism.min(batch.len());
        let mut pending = batch.iter().cloned();
        let mut in_flight = JoinSet::new();
        let mut model_ids: HashMap<Id, u32> = HashMap::new();
        for unit in pending.by_ref().take(limit) {
            self.dispatch(&mut in_flight, &mut model_ids, unit);
        }

        let mut stopped = false;
        while let Some(joined) = in_flight.join_next_with_id().await {
            let result = match joined {
                Ok((id, result)) => {
                    model_ids.remove(&id);
                    Some(result)
                }
                Err(e) => match model_ids.remove(&e.id()) {
                    Some(model_id) => Some(join_failure(model_id, &e)),
                    None => {
                        error!(batch_index, error = %e, "Unknown unit task did not complete");
                        None
                    }
                },
            };
            if let Some(result) = result {
                if self.record(result, batch_index, writer)? {
                    stopped = true;
                }
            }
            if !stopped {
                if let Some(unit) = pending.next() {
                    self.dispatch(&mut in_flight, &mut model_ids, unit);
                }
            }
        }
        Ok(stopped)
    }

    fn dispatch(
        &self,
        in_flight: &mut JoinSet<UnitResult>,
        model_ids: &mut HashMap<Id, u32>,
        unit: WorkUnit,
    ) {
        let model_id = unit.model_id;
        let handle = in_flight.spawn(run_guarded(self.runner.clone(), unit));
        model_ids.insert(handle.id(), model_id);
    }

    /// Records one result; returns true when it should stop the session.
    fn record(
        &self,
        result: UnitResult,
        batch_index: usize,
        writer: &mut SessionManifestWriter,
    ) -> Result<bool, SchedulerError> {
        let failed = result.is_failed();
        info!(
            model_id = result.model_id,
            batch_index,
            status = %result.status,
            "Unit finished"
        );
        writer.record(result.with_batch_index(batch_index))?;
        Ok(failed && self.stop_on_error)
    }
}

/// Runs a unit, turning a panic into a failed result.
async fn run_guarded(runner: RetryingRunner, unit: WorkUnit) -> UnitResult {
    let model_id = unit.model_id;
    let fut = async move { runner.run(&unit).await };
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let detail = if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic payload".to_string()
            };
            warn!(model_id, "Runner panicked: {}", detail);
            UnitResult::failed(model_id, format!("runner exception: {detail}"))
        }
    }
}

/// Failed result for a unit whose task was cancelled or panicked outside
/// the runner guard.
fn join_failure(model_id: u32, err: &JoinError) -> UnitResult {
    error!(model_id, error = %err, "Unit task did not complete");
    UnitResult::failed(model_id, format!("runner exception: {err}"))
}
