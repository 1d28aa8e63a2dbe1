//! Filesystem copies performed by a unit: ground truth, artifact, and the
//! refiner's raw run directory.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::RunnerError;

/// Copies `from` to `to`, creating parent directories and overwriting.
pub fn copy_file(from: &Path, to: &Path) -> Result<(), RunnerError> {
    let wrap = |source| RunnerError::Copy {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(wrap)?;
    }
    fs::copy(from, to).map_err(wrap)?;
    Ok(())
}

/// Copies the first existing ground-truth candidate to `dest`.
///
/// Returns the destination when a source was found, `None` otherwise.
pub fn copy_groundtruth(
    candidates: &[PathBuf],
    dest: &Path,
) -> Result<Option<PathBuf>, RunnerError> {
    let Some(source) = candidates.iter().find(|p| p.is_file()) else {
        debug!(dest = %dest.display(), "no ground-truth source found");
        return Ok(None);
    };
    copy_file(source, dest)?;
    Ok(Some(dest.to_path_buf()))
}

/// Recursively copies `run_dir` into `archive_root/<run_dir name>`.
///
/// An existing archive of the same name is removed first, so re-running a
/// unit replaces rather than merges.
pub fn archive_run_dir(run_dir: &Path, archive_root: &Path) -> Result<PathBuf, RunnerError> {
    let name = run_dir.file_name().ok_or_else(|| {
        RunnerError::Archive(format!("run dir has no name: {}", run_dir.display()))
    })?;
    let target = archive_root.join(name);
    if target.exists() {
        fs::remove_dir_all(&target)?;
    }
    fs::create_dir_all(&target)?;

    for entry in WalkDir::new(run_dir) {
        let entry = entry.map_err(|e| RunnerError::Archive(e.to_string()))?;
        let rel = entry
            .path()
            .strip_prefix(run_dir)
            .map_err(|e| RunnerError::Archive(e.to_string()))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let dest = target.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else {
            copy_file(entry.path(), &dest)?;
        }
    }
    Ok(target)
}
