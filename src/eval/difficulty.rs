//! Precision/recall averages per difficulty bucket.
//!
//! Difficulty is the line count of the reference design in the dataset:
//! bucket `"1"` is under 30 lines, then steps of 30 up to `"5"` for 120+.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::evaluator::Evaluation;
use super::score::score_from_record;
use crate::error::EvalError;

const BUCKET_LIMITS: [usize; 4] = [30, 60, 90, 120];

/// Counts lines, unescaping literal `\n` sequences in single-line text.
pub fn count_lines(code: &str) -> usize {
    if code.is_empty() {
        return 0;
    }
    let unescaped;
    let code = if !code.contains('\n') && code.contains("\\n") {
        unescaped = code
            .replace("\\r\\n", "\n")
            .replace("\\n", "\n")
            .replace("\\r", "\n");
        unescaped.as_str()
    } else {
        code
    };
    code.replace("\r\n", "\n")
        .replace('\r', "\n")
        .split('\n')
        .count()
}

/// Bucket label `"1"`..`"5"` for a line count.
pub fn bucket_for(lines: usize) -> &'static str {
    const LABELS: [&str; 5] = ["1", "2", "3", "4", "5"];
    let idx = BUCKET_LIMITS
        .iter()
        .position(|&limit| lines < limit)
        .unwrap_or(BUCKET_LIMITS.len());
    LABELS[idx]
}

/// Groups 1-based dataset indices by bucket. All five buckets are present.
pub fn bucket_ids(dataset: &Value) -> Result<BTreeMap<String, Vec<u32>>, EvalError> {
    let samples = dataset
        .as_array()
        .ok_or_else(|| EvalError::InvalidDataset("expected a JSON array".to_string()))?;
    let mut buckets: BTreeMap<String, Vec<u32>> = ["1", "2", "3", "4", "5"]
        .iter()
        .map(|b| (b.to_string(), Vec::new()))
        .collect();
    for (idx, sample) in samples.iter().enumerate() {
        let id = idx as u32 + 1;
        let design = sample
            .get("design")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                EvalError::InvalidDataset(format!("sample {id} has no \"design\" string"))
            })?;
        let bucket = bucket_for(count_lines(design));
        buckets.entry(bucket.to_string()).or_default().push(id);
    }
    Ok(buckets)
}

/// Averages for one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketMetrics {
    pub precision: f64,
    pub recall: f64,
    pub count: usize,
}

/// Precision and recall ratios for one ID, if both records score.
pub fn load_score_pair(scores_root: &Path, model_id: u32, label: &str) -> Option<(f64, f64)> {
    let model_dir = scores_root.join(model_id.to_string());
    let load = |evaluation: Evaluation| -> Option<f64> {
        let path = model_dir.join(format!("{model_id}_{evaluation}_{label}.json"));
        let text = fs::read_to_string(path).ok()?;
        let record: Value = serde_json::from_str(&text).ok()?;
        score_from_record(&record).map(|s| s.ratio)
    };
    Some((load(Evaluation::Precision)?, load(Evaluation::Recall)?))
}

/// Averages scores per bucket; buckets without any scored ID are omitted.
pub fn bucket_metrics(
    buckets: &BTreeMap<String, Vec<u32>>,
    scores_root: &Path,
    label: &str,
) -> BTreeMap<String, BucketMetrics> {
    let mut metrics = BTreeMap::new();
    for (bucket, ids) in buckets {
        let pairs: Vec<(f64, f64)> = ids
            .iter()
            .filter_map(|&id| load_score_pair(scores_root, id, label))
            .collect();
        if pairs.is_empty() {
            continue;
        }
        let count = pairs.len();
        let precision = pairs.iter().map(|p| p.0).sum::<f64>() / count as f64;
        let recall = pairs.iter().map(|p| p.1).sum::<f64>() / count as f64;
        metrics.insert(
            bucket.clone(),
            BucketMetrics {
                precision,
                recall,
                count,
            },
        );
    }
    metrics
}

/// Default output: `<scores_root parent>/analysis/difficult_result.json`.
pub fn default_output_path(scores_root: &Path) -> PathBuf {
    scores_root
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("analysis")
        .join("difficult_result.json")
}

/// Result of a difficulty run.
#[derive(Debug, Clone)]
pub struct DifficultyReport {
    pub output_path: PathBuf,
    pub distribution: BTreeMap<String, usize>,
    pub metrics: BTreeMap<String, BucketMetrics>,
}

/// Buckets the dataset, averages scores, and writes the result JSON.
pub fn run_difficulty(
    dataset_path: &Path,
    scores_root: &Path,
    label: &str,
    output: Option<&Path>,
) -> Result<DifficultyReport, EvalError> {
    if !dataset_path.is_file() {
        return Err(EvalError::MissingFile(dataset_path.to_path_buf()));
    }
    let dataset: Value = serde_json::from_str(&fs::read_to_string(dataset_path)?)?;
    let buckets = bucket_ids(&dataset)?;
    let distribution: BTreeMap<String, usize> =
        buckets.iter().map(|(b, ids)| (b.clone(), ids.len())).collect();
    for (bucket, count) in &distribution {
        info!(bucket = %bucket, count, "Difficulty bucket");
    }

    let metrics = bucket_metrics(&buckets, scores_root, label);
    let output_path = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_output_path(scores_root));
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&output_path, to_json_4(&metrics)?)?;

    Ok(DifficultyReport {
        output_path,
        distribution,
        metrics,
    })
}

fn to_json_4<T: Serialize>(value: &T) -> Result<Vec<u8>, EvalError> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut ser)?;
    Ok(buf)
}
