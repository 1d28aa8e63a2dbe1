//! Prompt ID discovery and selection.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::runner::config::ConfigError;
use crate::runner::{RefineConfig, WorkUnit};

/// Numeric subdirectories of `prompts_root` that contain `nl.txt`, ascending.
pub fn discover_prompt_ids(prompts_root: &Path) -> Result<Vec<u32>, ConfigError> {
    let mut ids: Vec<u32> = fs::read_dir(prompts_root)?
        .filter_map(Result::ok)
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse::<u32>().ok()))
        .filter(|id| prompts_root.join(id.to_string()).join("nl.txt").is_file())
        .collect();
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

/// Keeps IDs in `[start_id, end_id]` that are not skipped, preserving order.
pub fn select_ids(available: &[u32], start_id: u32, end_id: u32, skip: &[u32]) -> Vec<u32> {
    let skip: HashSet<u32> = skip.iter().copied().collect();
    available
        .iter()
        .copied()
        .filter(|id| (start_id..=end_id).contains(id) && !skip.contains(id))
        .collect()
}

/// Discovers, filters, and resolves the session's work units.
pub fn select_units(config: &RefineConfig) -> Result<Vec<WorkUnit>, ConfigError> {
    let available = discover_prompt_ids(&config.prompts_root)?;
    let selected = select_ids(&available, config.start_id, config.end_id, &config.skip);
    if selected.is_empty() {
        return Err(ConfigError::EmptySelection);
    }
    Ok(selected
        .into_iter()
        .map(|id| WorkUnit::from_config(config, id))
        .collect())
}
