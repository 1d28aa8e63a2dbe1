//! CSV timing reports derived from the session's results.

use std::path::Path;

use serde::Serialize;

use super::write_atomic;
use crate::error::ManifestError;
use crate::runner::{UnitResult, UnitStatus};

/// One row per unit.
#[derive(Debug, Serialize)]
struct LoopTimingRow<'a> {
    model_id: u32,
    batch_index: Option<usize>,
    status: UnitStatus,
    loop_start_utc: Option<&'a str>,
    loop_end_utc: Option<&'a str>,
    loop_duration_seconds: Option<f64>,
    iterations_completed: Option<usize>,
    tokens_used_total: Option<u64>,
    final_iteration_success: Option<bool>,
    reason: Option<&'a str>,
}

/// One row per refiner iteration.
#[derive(Debug, Serialize)]
struct IterationTimingRow<'a> {
    model_id: u32,
    batch_index: Option<usize>,
    iteration: i64,
    iteration_start: Option<&'a str>,
    iteration_end: Option<&'a str>,
    iteration_duration_seconds: Option<f64>,
    success: bool,
    return_code: Option<i64>,
    tokens_used_this_iter_total: Option<u64>,
    tokens_used_total: Option<u64>,
}

/// Writes the per-unit loop timing report.
pub fn write_loop_timings(path: &Path, results: &[UnitResult]) -> Result<(), ManifestError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    if results.is_empty() {
        writer.write_record([
            "model_id",
            "batch_index",
            "status",
            "loop_start_utc",
            "loop_end_utc",
            "loop_duration_seconds",
            "iterations_completed",
            "tokens_used_total",
            "final_iteration_success",
            "reason",
        ])?;
    }
    for r in results {
        writer.serialize(LoopTimingRow {
            model_id: r.model_id,
            batch_index: r.batch_index,
            status: r.status,
            loop_start_utc: r.loop_start_utc.as_deref(),
            loop_end_utc: r.loop_end_utc.as_deref(),
            loop_duration_seconds: r.loop_duration_seconds,
            iterations_completed: r.iterations_completed,
            tokens_used_total: r.tokens_used_total,
            final_iteration_success: r.final_iteration_success,
            reason: r.reason.as_deref(),
        })?;
    }
    finish(writer, path)
}

/// Writes the per-iteration timing report.
pub fn write_iteration_timings(path: &Path, results: &[UnitResult]) -> Result<(), ManifestError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut wrote_any = false;
    for r in results {
        for step in &r.iteration_timings {
            writer.serialize(IterationTimingRow {
                model_id: r.model_id,
                batch_index: r.batch_index,
                iteration: step.iteration,
                iteration_start: step.iteration_start.as_deref(),
                iteration_end: step.iteration_end.as_deref(),
                iteration_duration_seconds: step.iteration_duration_seconds,
                success: step.success,
                return_code: step.return_code,
                tokens_used_this_iter_total: step.tokens_used_this_iter_total,
                tokens_used_total: step.tokens_used_total,
            })?;
            wrote_any = true;
        }
    }
    if !wrote_any {
        writer.write_record([
            "model_id",
            "batch_index",
            "iteration",
            "iteration_start",
            "iteration_end",
            "iteration_duration_seconds",
            "success",
            "return_code",
            "tokens_used_this_iter_total",
            "tokens_used_total",
        ])?;
    }
    finish(writer, path)
}

// Headers come from the first serialized row; empty reports get them written
// explicitly so the file is never zero bytes.
fn finish(writer: csv::Writer<Vec<u8>>, path: &Path) -> Result<(), ManifestError> {
    let bytes = writer
        .into_inner()
        .map_err(|e| ManifestError::Io(e.into_error()))?;
    write_atomic(path, &bytes)
}
