use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::AuditError;
use crate::llm::LanguageModel;
use crate::model::Criterion;
use crate::research::prompts::reformulation_prompt;
use crate::util::{RetryPolicy, normalize_whitespace, query_key, retry_with_backoff};

pub const DEFAULT_MAX_QUERIES: usize = 3;

static LIST_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:(?:[-*\u{2022}]+|\d{1,2}[.)]|(?i:query)\s*\d*\s*:)(?:\s+|$))+")
        .expect("static regex")
});

pub trait QueryReformulator: Send + Sync {
    fn reformulate(
        &self,
        criterion: &Criterion,
        prior_queries: &[String],
        evidence_summary: &str,
    ) -> Result<Vec<String>, AuditError>;
}

pub struct LlmReformulator<'a> {
    model: &'a dyn LanguageModel,
    max_queries: usize,
    retry: RetryPolicy,
}

impl<'a> LlmReformulator<'a> {
    pub fn new(model: &'a dyn LanguageModel, max_queries: usize, retry: RetryPolicy) -> Self {
        Self {
            model,
            max_queries: max_queries.max(1),
            retry,
        }
    }
}

impl QueryReformulator for LlmReformulator<'_> {
    fn reformulate(
        &self,
        criterion: &Criterion,
        prior_queries: &[String],
        evidence_summary: &str,
    ) -> Result<Vec<String>, AuditError> {
        let prompt =
            reformulation_prompt(criterion, prior_queries, evidence_summary, self.max_queries);
        let raw = retry_with_backoff(&self.retry, "reformulator", || self.model.complete(&prompt))?;
        let proposals = parse_proposals(&raw, self.max_queries);
        if proposals.is_empty() {
            return Err(AuditError::malformed("reformulator returned no queries"));
        }
        Ok(proposals)
    }
}

/// One query per non-empty line, list markers and wrapping quotes removed,
/// duplicates dropped, at most `max_queries` kept.
pub fn parse_proposals(raw: &str, max_queries: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.lines()
        .map(|line| LIST_MARKER.replace(line, ""))
        .map(|line| {
            normalize_whitespace(line.trim().trim_matches(|ch| matches!(ch, '"' | '\'' | '`')))
        })
        .filter(|line| !line.is_empty())
        .filter(|line| seen.insert(query_key(line)))
        .take(max_queries)
        .collect()
}

/// Drops proposals that repeat a prior query or an earlier proposal.
pub fn filter_fresh(proposals: Vec<String>, prior_queries: &[String]) -> Vec<String> {
    let mut used = prior_queries
        .iter()
        .map(|query| query_key(query))
        .collect::<HashSet<String>>();
    proposals
        .into_iter()
        .filter(|proposal| !proposal.trim().is_empty())
        .filter(|proposal| used.insert(query_key(proposal)))
        .collect()
}
