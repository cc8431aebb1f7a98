use tracing::{debug, info, warn};

use crate::model::{
    AttemptRecord, Criterion, CriterionOutcome, Evaluation, Hint, TerminalState, Verdict,
};
use crate::research::evaluator::{SufficiencyEvaluator, enforce_citations};
use crate::research::hints::HintLookup;
use crate::research::reformulator::{QueryReformulator, filter_fresh};
use crate::research::retrieval::{HybridRetriever, RoundEvidence};
use crate::util::{CancelToken, query_key, truncate_chars};

pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy)]
pub struct AgentSettings {
    pub max_attempts: usize,
    /// Reformulation requests per round; the second one is the regeneration
    /// after every proposal collided with a prior query.
    pub max_reformulation_requests: usize,
    pub summary_max_chars: usize,
    pub evidence_snippet_chars: usize,
    pub use_hints: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_reformulation_requests: 2,
            summary_max_chars: 1_500,
            evidence_snippet_chars: 200,
            use_hints: true,
        }
    }
}

#[derive(Debug)]
enum SessionState {
    Init,
    Searching { query: String },
    Evaluating { query: String, round: Option<RoundEvidence> },
    Reformulating,
    Sufficient,
    Exhausted,
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Searching { .. } => "searching",
            Self::Evaluating { .. } => "evaluating",
            Self::Reformulating => "reformulating",
            Self::Sufficient => "sufficient",
            Self::Exhausted => "exhausted",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Sufficient | Self::Exhausted)
    }
}

struct Session<'c> {
    criterion: &'c Criterion,
    hint: Option<&'c Hint>,
    attempts: Vec<AttemptRecord>,
    queries: Vec<String>,
    cancelled: bool,
}

pub struct DeepResearchAgent<'a> {
    retriever: &'a HybridRetriever<'a>,
    evaluator: &'a dyn SufficiencyEvaluator,
    reformulator: &'a dyn QueryReformulator,
    hints: &'a dyn HintLookup,
    settings: AgentSettings,
    cancel: CancelToken,
}

impl<'a> DeepResearchAgent<'a> {
    pub fn new(
        retriever: &'a HybridRetriever<'a>,
        evaluator: &'a dyn SufficiencyEvaluator,
        reformulator: &'a dyn QueryReformulator,
        hints: &'a dyn HintLookup,
        settings: AgentSettings,
        cancel: CancelToken,
    ) -> Self {
        Self {
            retriever,
            evaluator,
            reformulator,
            hints,
            settings,
            cancel,
        }
    }

    /// Drives one criterion to a terminal state. Always yields exactly one outcome.
    pub fn run_session(&self, criterion: &Criterion) -> CriterionOutcome {
        let hint = if self.settings.use_hints {
            self.hints.hint_for(criterion)
        } else {
            None
        };
        let mut session = Session {
            criterion,
            hint,
            attempts: Vec::new(),
            queries: Vec::new(),
            cancelled: false,
        };
        info!(
            criterion = criterion.index,
            threshold = criterion.threshold,
            hint = hint.is_some_and(|hint| hint.found),
            "research session started"
        );

        let mut state = SessionState::Init;
        loop {
            if !state.is_terminal() && self.cancel.is_cancelled() {
                warn!(criterion = criterion.index, state = state.name(), "session cancelled");
                session.cancelled = true;
                state = SessionState::Exhausted;
            }

            let from = state.name();
            state = match state {
                SessionState::Init => SessionState::Searching {
                    query: criterion.text.trim().to_string(),
                },
                SessionState::Searching { query } => self.search(&mut session, query),
                SessionState::Evaluating { query, round } => {
                    self.evaluate(&mut session, query, round)
                }
                SessionState::Reformulating => self.reformulate(&mut session),
                SessionState::Sufficient => return self.finish(session, TerminalState::Sufficient),
                SessionState::Exhausted => return self.finish(session, TerminalState::Exhausted),
            };
            debug!(criterion = criterion.index, from, to = state.name(), "state transition");
        }
    }

    fn search(&self, session: &mut Session<'_>, query: String) -> SessionState {
        session.queries.push(query.clone());

        let mut texts = vec![query.as_str()];
        let auxiliary = session
            .hint
            .and_then(Hint::query_text)
            .filter(|auxiliary| query_key(auxiliary) != query_key(&query));
        texts.extend(auxiliary);

        match self.retriever.search_round(&texts) {
            Ok(round) => SessionState::Evaluating {
                query,
                round: Some(round),
            },
            Err(error) => {
                warn!(
                    criterion = session.criterion.index,
                    round = session.attempts.len() + 1,
                    error = %error,
                    "search failed, counting round as failed"
                );
                SessionState::Evaluating { query, round: None }
            }
        }
    }

    fn evaluate(
        &self,
        session: &mut Session<'_>,
        query: String,
        round: Option<RoundEvidence>,
    ) -> SessionState {
        let search_failed = round.is_none();
        let round = round.unwrap_or_default();
        let evaluation = if search_failed {
            Evaluation::sentinel()
        } else {
            let raw = self
                .evaluator
                .evaluate(session.criterion, &round.evidence, session.hint);
            enforce_citations(raw, &round.evidence)
        };

        let attempt = AttemptRecord {
            round: session.attempts.len() + 1,
            query,
            fused: round.fused,
            status: evaluation.status,
            confidence: evaluation.confidence,
            evidence_text: evaluation.evidence_text,
            cited_pages: evaluation.cited_pages,
            search_failed,
        };
        info!(
            criterion = session.criterion.index,
            attempt = attempt.round,
            status = attempt.status.as_str(),
            confidence = attempt.confidence,
            threshold = session.criterion.threshold,
            "round evaluated"
        );
        let confidence = attempt.confidence;
        session.attempts.push(attempt);

        if confidence >= session.criterion.threshold {
            SessionState::Sufficient
        } else if session.attempts.len() >= self.settings.max_attempts {
            SessionState::Exhausted
        } else {
            SessionState::Reformulating
        }
    }

    fn reformulate(&self, session: &mut Session<'_>) -> SessionState {
        let summary = self.evidence_summary(&session.attempts);

        for request in 1..=self.settings.max_reformulation_requests.max(1) {
            let requested = self.reformulator.reformulate(
                session.criterion,
                &session.queries,
                &summary,
            );
            let proposals = match requested {
                Ok(proposals) => proposals,
                Err(error) => {
                    warn!(
                        criterion = session.criterion.index,
                        request,
                        error = %error,
                        "reformulation failed"
                    );
                    continue;
                }
            };

            let proposed = proposals.len();
            if let Some(next) = filter_fresh(proposals, &session.queries).into_iter().next() {
                debug!(criterion = session.criterion.index, query = %next, "reformulated query");
                return SessionState::Searching { query: next };
            }
            warn!(
                criterion = session.criterion.index,
                request, proposed, "every proposal repeats a prior query"
            );
        }

        info!(
            criterion = session.criterion.index,
            attempts = session.attempts.len(),
            "no fresh query available, ending session early"
        );
        SessionState::Exhausted
    }

    fn evidence_summary(&self, attempts: &[AttemptRecord]) -> String {
        let summary = attempts
            .iter()
            .filter(|attempt| !attempt.evidence_text.trim().is_empty())
            .map(|attempt| {
                let snippet = truncate_chars(
                    attempt.evidence_text.trim(),
                    self.settings.evidence_snippet_chars,
                );
                format!("Round {}: {snippet}", attempt.round)
            })
            .collect::<Vec<String>>()
            .join("\n");
        truncate_chars(&summary, self.settings.summary_max_chars).to_string()
    }

    fn finish(&self, session: Session<'_>, terminal_state: TerminalState) -> CriterionOutcome {
        let chosen = match terminal_state {
            TerminalState::Sufficient => session.attempts.last(),
            TerminalState::Exhausted => best_attempt(&session.attempts),
        };

        let outcome = CriterionOutcome {
            criterion: session.criterion.text.clone(),
            threshold: session.criterion.threshold,
            status: chosen.map_or(Verdict::Absent, |attempt| attempt.status),
            confidence: chosen.map_or(0.0, |attempt| attempt.confidence),
            evidence_text: chosen
                .map(|attempt| attempt.evidence_text.clone())
                .unwrap_or_default(),
            cited_pages: chosen
                .map(|attempt| attempt.cited_pages.iter().copied().collect())
                .unwrap_or_default(),
            attempts: session.attempts.len(),
            terminal_state,
            cancelled: session.cancelled,
            queries: session.queries,
        };

        info!(
            criterion = session.criterion.index,
            status = outcome.status.as_str(),
            confidence = outcome.confidence,
            attempts = outcome.attempts,
            terminal = ?outcome.terminal_state,
            cancelled = outcome.cancelled,
            "research session finished"
        );
        outcome
    }
}

/// Highest confidence wins; the earliest round wins ties.
fn best_attempt(attempts: &[AttemptRecord]) -> Option<&AttemptRecord> {
    attempts.iter().fold(None, |best, attempt| match best {
        Some(current) if attempt.confidence <= current.confidence => Some(current),
        _ => Some(attempt),
    })
}
