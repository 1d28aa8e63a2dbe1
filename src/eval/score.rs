//! `Score: X/Y` extraction from evaluator responses.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn score_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)Score:\s*[*_\s]*\s*(\d+(?:\.\d+)?)\s*/\s*(\d+(?:\.\d+)?)\s*[*_\s]*")
            .expect("valid regex")
    })
}

/// A parsed `X/Y` score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreRatio {
    pub ratio: f64,
    pub numerator: f64,
    pub denominator: f64,
}

/// Finds the first `Score: X/Y` in `text`.
///
/// Markdown emphasis around the score is tolerated. Returns `None` when no
/// score is present or the denominator is zero.
pub fn extract_score(text: &str) -> Option<ScoreRatio> {
    let text = text.replace("**\n", "** ").replace("**  ", "** ");
    let caps = score_pattern().captures(&text)?;
    let numerator: f64 = caps[1].parse().ok()?;
    let denominator: f64 = caps[2].parse().ok()?;
    if denominator == 0.0 {
        return None;
    }
    Some(ScoreRatio {
        ratio: numerator / denominator,
        numerator,
        denominator,
    })
}

/// Score from a saved evaluation record's `response.response_text`.
pub fn score_from_record(record: &Value) -> Option<ScoreRatio> {
    let text = record
        .get("response")
        .and_then(|r| r.get("response_text"))
        .and_then(Value::as_str)?;
    extract_score(text)
}
