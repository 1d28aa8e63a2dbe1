//! LLM-judged precision/recall scoring of generated SysML models.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::score::extract_score;
use crate::error::{EvalError, LlmError};
use crate::llm::{GenerationRequest, LlmProvider, Message};

/// Which side of the comparison a prompt scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Evaluation {
    Precision,
    Recall,
}

impl fmt::Display for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Evaluation::Precision => write!(f, "precision"),
            Evaluation::Recall => write!(f, "recall"),
        }
    }
}

/// Options for one evaluation run.
#[derive(Debug, Clone)]
pub struct EvalConfig {
    /// Root with one subdirectory per generated model.
    pub generated_root: PathBuf,
    /// Root searched for reference models.
    pub reference_root: PathBuf,
    pub precision_prompt: PathBuf,
    pub recall_prompt: PathBuf,
    pub model: String,
    pub temperature: f64,
    pub start_id: u32,
    pub end_id: u32,
    pub skip: Vec<u32>,
    /// Suffix of record file names, e.g. `gpt41` in `12_recall_gpt41.json`.
    pub label: String,
    pub dry_run: bool,
}

impl EvalConfig {
    pub fn new(generated_root: impl Into<PathBuf>) -> Self {
        let generated_root = generated_root.into();
        Self {
            reference_root: generated_root.clone(),
            generated_root,
            precision_prompt: PathBuf::from("Evaluation_Prompts/sysm-eval-p.txt"),
            recall_prompt: PathBuf::from("Evaluation_Prompts/sysm-eval-r.txt"),
            model: "gpt-4.1".to_string(),
            temperature: 0.2,
            start_id: 1,
            end_id: 75,
            skip: Vec::new(),
            label: "gpt41".to_string(),
            dry_run: false,
        }
    }

    pub fn record_path(&self, model_id: u32, evaluation: Evaluation) -> PathBuf {
        self.generated_root
            .join(model_id.to_string())
            .join(format!("{model_id}_{evaluation}_{}.json", self.label))
    }

    fn prompt_file(&self, evaluation: Evaluation) -> &Path {
        match evaluation {
            Evaluation::Precision => &self.precision_prompt,
            Evaluation::Recall => &self.recall_prompt,
        }
    }
}

/// Saved result of one evaluation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub model_id: u32,
    pub evaluation: Evaluation,
    pub model: String,
    pub temperature: f64,
    pub prompt_file: PathBuf,
    pub prompt: String,
    pub reference_path: PathBuf,
    pub generated_path: PathBuf,
    pub response: Value,
    /// Extracted `X/Y` ratio, null when the response has no score.
    pub score: Option<f64>,
}

/// Per-run totals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvalSummary {
    pub evaluated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub records: Vec<PathBuf>,
}

/// Preferred `<id>.sysml`, else the first sorted `*.sysml` that is not a
/// ground-truth copy.
pub fn find_generated_file(model_dir: &Path, model_id: u32) -> Result<PathBuf, EvalError> {
    let preferred = model_dir.join(format!("{model_id}.sysml"));
    if preferred.is_file() {
        return Ok(preferred);
    }
    let mut candidates: Vec<PathBuf> = fs::read_dir(model_dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "sysml"))
        .collect();
    candidates.sort();
    candidates
        .into_iter()
        .find(|p| {
            p.file_name()
                .map(|n| !n.to_string_lossy().to_lowercase().contains("groundtruth"))
                .unwrap_or(false)
        })
        .ok_or_else(|| EvalError::NoGeneratedModel(model_dir.to_path_buf()))
}

/// Reference candidates, colocated ground-truth copies first.
pub fn reference_candidates(reference_root: &Path, model_id: u32) -> [PathBuf; 4] {
    let plain = reference_root.join(model_id.to_string());
    let padded = reference_root.join(format!("{model_id:02}"));
    [
        plain.join(format!("{model_id}_groundtruth.sysml")),
        plain.join("design.sysml"),
        padded.join(format!("{model_id}_groundtruth.sysml")),
        padded.join("design.sysml"),
    ]
}

pub fn find_reference_file(reference_root: &Path, model_id: u32) -> Result<PathBuf, EvalError> {
    let candidates = reference_candidates(reference_root, model_id);
    if let Some(found) = candidates.iter().find(|p| p.is_file()) {
        return Ok(found.clone());
    }
    let tried = candidates
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Err(EvalError::NoReference { model_id, tried })
}

/// Substitutes `{reference_model}` and `{generated_model}` and unescapes
/// doubled braces. Other placeholders are left untouched.
pub fn render_template(template: &str, reference: &str, generated: &str) -> String {
    let mut out = String::with_capacity(template.len() + reference.len() + generated.len());
    let mut rest = template;
    while let Some(pos) = rest.find(|c: char| c == '{' || c == '}') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        if let Some(after) = rest.strip_prefix("{{") {
            out.push('{');
            rest = after;
        } else if let Some(after) = rest.strip_prefix("}}") {
            out.push('}');
            rest = after;
        } else if let Some(after) = rest.strip_prefix("{reference_model}") {
            out.push_str(reference);
            rest = after;
        } else if let Some(after) = rest.strip_prefix("{generated_model}") {
            out.push_str(generated);
            rest = after;
        } else {
            out.push_str(&rest[..1]);
            rest = &rest[1..];
        }
    }
    out.push_str(rest);
    out
}

fn load_text(path: &Path) -> Result<String, EvalError> {
    if !path.is_file() {
        return Err(EvalError::MissingFile(path.to_path_buf()));
    }
    Ok(fs::read_to_string(path)?)
}

/// Scores every selected model with the precision and recall prompts.
///
/// `provider` may be `None` only in dry-run mode. Per-model problems
/// (missing directories, files, or provider errors) are logged and the model
/// is skipped; missing templates abort the run.
pub async fn run_evaluation(
    config: &EvalConfig,
    provider: Option<&dyn LlmProvider>,
) -> Result<EvalSummary, EvalError> {
    let precision_template = load_text(&config.precision_prompt)?;
    let recall_template = load_text(&config.recall_prompt)?;
    if !config.dry_run && provider.is_none() {
        return Err(EvalError::Llm(LlmError::MissingApiKey));
    }

    let mut summary = EvalSummary::default();
    for model_id in config.start_id..=config.end_id {
        if config.skip.contains(&model_id) {
            info!(model_id, "Skipping model");
            summary.skipped += 1;
            continue;
        }

        let generated_dir = config.generated_root.join(model_id.to_string());
        if !generated_dir.is_dir() {
            warn!(model_id, dir = %generated_dir.display(), "Generated dir missing");
            summary.skipped += 1;
            continue;
        }

        let located = find_generated_file(&generated_dir, model_id)
            .and_then(|g| find_reference_file(&config.reference_root, model_id).map(|r| (g, r)));
        let (generated_path, reference_path) = match located {
            Ok(paths) => paths,
            Err(e) => {
                warn!(model_id, "{}", e);
                summary.skipped += 1;
                continue;
            }
        };

        let generated_text = load_text(&generated_path)?;
        let reference_text = load_text(&reference_path)?;

        let jobs = [
            (Evaluation::Precision, &precision_template),
            (Evaluation::Recall, &recall_template),
        ];
        let mut model_failed = false;
        for (evaluation, template) in jobs {
            let prompt = render_template(template, &reference_text, &generated_text);
            let output_path = config.record_path(model_id, evaluation);
            info!(model_id, %evaluation, output = %output_path.display(), "Running evaluation");

            let response = match call_model(config, provider, &prompt).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(model_id, %evaluation, error = %e, "Evaluation call failed");
                    model_failed = true;
                    break;
                }
            };
            let score = response
                .get("response_text")
                .and_then(Value::as_str)
                .and_then(extract_score)
                .map(|s| s.ratio);

            let record = EvaluationRecord {
                model_id,
                evaluation,
                model: config.model.clone(),
                temperature: config.temperature,
                prompt_file: config.prompt_file(evaluation).to_path_buf(),
                prompt,
                reference_path: reference_path.clone(),
                generated_path: generated_path.clone(),
                response,
                score,
            };
            fs::write(&output_path, serde_json::to_string_pretty(&record)?)?;
            summary.records.push(output_path);
        }

        if model_failed {
            summary.failed += 1;
        } else {
            summary.evaluated += 1;
        }
    }
    Ok(summary)
}

async fn call_model(
    config: &EvalConfig,
    provider: Option<&dyn LlmProvider>,
    prompt: &str,
) -> Result<Value, LlmError> {
    let provider = match provider {
        Some(provider) if !config.dry_run => provider,
        _ => return Ok(json!({"dry_run": true, "response_text": ""})),
    };
    let request = GenerationRequest::new(&config.model, vec![Message::user(prompt)])
        .with_temperature(config.temperature);
    let response = provider.generate(request).await?;
    Ok(json!({
        "response_text": response.first_content().unwrap_or_default().trim(),
        "id": response.id,
        "model": response.model,
        "usage": response.usage,
    }))
}
