//! Durable session records.
//!
//! A session manifest and two timing reports live under
//! `<output_root>/_refine_sessions/<session_id>/` and are rewritten in full
//! after every completed unit, so an interrupted run always leaves valid
//! files behind.

pub mod manifest;
pub mod report;

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::ManifestError;

pub use manifest::{SessionManifestWriter, StatusCounts};
pub use report::{write_iteration_timings, write_loop_timings};

/// Writes `content` to a temp file beside `path`, then renames it over `path`.
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> Result<(), ManifestError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| ManifestError::Persist {
        path: path.to_path_buf(),
        reason: e.error.to_string(),
    })?;
    Ok(())
}
