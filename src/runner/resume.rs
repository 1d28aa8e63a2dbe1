//! Resume gate: decides whether a unit already has a usable result.

use std::fs;
use std::path::Path;

use serde_json::Value;

use super::config::RefineConfig;

/// Returns true when `model_id` can be skipped.
///
/// Requires the published artifact, no overwrite request, and a per-unit
/// manifest recording a successful final iteration.
pub fn is_satisfied(config: &RefineConfig, model_id: u32) -> bool {
    if config.overwrite {
        return false;
    }
    if !config.artifact_path(model_id).is_file() {
        return false;
    }
    has_success_manifest(&config.unit_manifest_path(model_id))
}

/// Checks a per-unit manifest for `status == "ok"` and a truthy
/// `final_iteration_success`. Unreadable or malformed files count as absent.
pub fn has_success_manifest(manifest_path: &Path) -> bool {
    let Ok(text) = fs::read_to_string(manifest_path) else {
        return false;
    };
    let Ok(Value::Object(manifest)) = serde_json::from_str::<Value>(&text) else {
        return false;
    };
    let status_ok = manifest.get("status").and_then(Value::as_str) == Some("ok");
    status_ok && manifest.get("final_iteration_success").is_some_and(is_truthy)
}

/// JSON truthiness: false, null, zero and empty containers are falsy.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
