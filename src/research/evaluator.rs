use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::AuditError;
use crate::llm::{LanguageModel, extract_json_object};
use crate::model::{Chunk, Criterion, Evaluation, Hint, Verdict};
use crate::research::prompts::evaluation_prompt;
use crate::util::{RetryPolicy, retry_with_backoff};

/// Judges whether the supplied evidence settles a criterion.
///
/// Implementations never fail: an unobtainable or unusable judgment is reported
/// as [`Evaluation::sentinel`].
pub trait SufficiencyEvaluator: Send + Sync {
    fn evaluate(&self, criterion: &Criterion, evidence: &[Arc<Chunk>], hint: Option<&Hint>)
    -> Evaluation;
}

pub struct LlmEvaluator<'a> {
    model: &'a dyn LanguageModel,
    retry: RetryPolicy,
}

impl<'a> LlmEvaluator<'a> {
    pub fn new(model: &'a dyn LanguageModel, retry: RetryPolicy) -> Self {
        Self { model, retry }
    }
}

impl SufficiencyEvaluator for LlmEvaluator<'_> {
    fn evaluate(
        &self,
        criterion: &Criterion,
        evidence: &[Arc<Chunk>],
        hint: Option<&Hint>,
    ) -> Evaluation {
        let prompt = evaluation_prompt(criterion, evidence, hint);
        let parsed = retry_with_backoff(&self.retry, "evaluator", || self.model.complete(&prompt))
            .and_then(|raw| parse_evaluation(&raw));

        match parsed {
            Ok(evaluation) => enforce_citations(evaluation, evidence),
            Err(error) => {
                warn!(
                    criterion = criterion.index,
                    error = %error,
                    "evaluation unavailable, recording zero-confidence round"
                );
                Evaluation::sentinel()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEvaluation {
    status: String,
    #[serde(default)]
    evidence: String,
    confidence: Value,
    #[serde(default)]
    relevant_pages: Vec<Value>,
}

pub fn parse_evaluation(raw: &str) -> Result<Evaluation, AuditError> {
    let payload: RawEvaluation = serde_json::from_str(extract_json_object(raw))
        .map_err(|error| AuditError::malformed(format!("evaluation is not valid json: {error}")))?;

    let status = Verdict::parse(&payload.status).ok_or_else(|| {
        AuditError::malformed(format!("unknown evaluation status: {}", payload.status))
    })?;

    let confidence = json_number(&payload.confidence)
        .ok_or_else(|| AuditError::malformed("confidence is not a number"))?;
    if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
        return Err(AuditError::malformed(format!(
            "confidence out of range: {confidence}"
        )));
    }

    let mut cited_pages = BTreeSet::new();
    for page in &payload.relevant_pages {
        match json_number(page) {
            Some(value) if value.fract() == 0.0 && value >= 1.0 && value <= f64::from(u32::MAX) => {
                cited_pages.insert(value as u32);
            }
            _ => return Err(AuditError::malformed(format!("invalid page reference: {page}"))),
        }
    }

    Ok(Evaluation {
        status,
        confidence,
        evidence_text: payload.evidence.trim().to_string(),
        cited_pages,
    })
}

fn json_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Cited pages must all come from the evidence that was shown; any page outside
/// that set discards the whole citation list.
pub fn enforce_citations(mut evaluation: Evaluation, evidence: &[Arc<Chunk>]) -> Evaluation {
    let shown = evidence
        .iter()
        .map(|chunk| chunk.page_number)
        .collect::<BTreeSet<u32>>();

    if !evaluation.cited_pages.is_subset(&shown) {
        let unsupported = evaluation
            .cited_pages
            .difference(&shown)
            .copied()
            .collect::<Vec<u32>>();
        warn!(?unsupported, "evaluator cited pages outside the evidence, dropping citations");
        evaluation.cited_pages.clear();
    }

    if !evaluation.confidence.is_finite() {
        evaluation.confidence = 0.0;
    }
    evaluation.confidence = evaluation.confidence.clamp(0.0, 1.0);
    evaluation
}
