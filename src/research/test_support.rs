//! Deterministic stand-ins for the embedder, store, evaluator and reformulator.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::AuditError;
use crate::model::{Channel, Chunk, Criterion, Evaluation, Hint, ScoredChunk, Verdict};
use crate::research::evaluator::SufficiencyEvaluator;
use crate::research::reformulator::QueryReformulator;
use crate::semantic::{QueryEmbedder, QueryVectors, SparseVector};
use crate::store::{ChannelHits, EvidenceStore, SearchRequest};

pub fn chunk(chunk_id: &str, page: u32, text: &str) -> Arc<Chunk> {
    Arc::new(Chunk {
        chunk_id: chunk_id.to_string(),
        doc_id: "contract.pdf".to_string(),
        doc_type: "contract".to_string(),
        page_number: page,
        text: text.to_string(),
        char_start: None,
        char_end: None,
    })
}

pub fn criterion(text: &str, threshold: f64) -> Criterion {
    Criterion {
        index: 0,
        text: text.to_string(),
        threshold,
    }
}

pub fn evaluation(status: Verdict, confidence: f64, evidence: &str, pages: &[u32]) -> Evaluation {
    Evaluation {
        status,
        confidence,
        evidence_text: evidence.to_string(),
        cited_pages: pages.iter().copied().collect::<BTreeSet<u32>>(),
    }
}

/// Encodes the raw query text as its only sparse term so the store can key on it.
#[derive(Default)]
pub struct RecordingEmbedder {
    texts: Mutex<Vec<String>>,
}

impl RecordingEmbedder {
    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().map(|texts| texts.clone()).unwrap_or_default()
    }
}

impl QueryEmbedder for RecordingEmbedder {
    fn model_id(&self) -> &str {
        "recording"
    }

    fn embed(&self, text: &str) -> Result<QueryVectors, AuditError> {
        if let Ok(mut texts) = self.texts.lock() {
            texts.push(text.to_string());
        }
        Ok(QueryVectors {
            sparse: SparseVector {
                terms: BTreeMap::from([(text.to_string(), 1.0)]),
            },
            dense: vec![1.0],
        })
    }
}

type ScriptedHits = (Vec<(String, u32, f64)>, Vec<(String, u32, f64)>);

#[derive(Default)]
pub struct ScriptedStore {
    responses: HashMap<String, ScriptedHits>,
    failing_queries: BTreeSet<String>,
    transient_failures: AtomicUsize,
    calls: AtomicUsize,
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(
        mut self,
        query: &str,
        sparse: &[(&str, u32, f64)],
        dense: &[(&str, u32, f64)],
    ) -> Self {
        let own = |hits: &[(&str, u32, f64)]| {
            hits.iter()
                .map(|(id, page, score)| (id.to_string(), *page, *score))
                .collect::<Vec<(String, u32, f64)>>()
        };
        self.responses
            .insert(query.to_string(), (own(sparse), own(dense)));
        self
    }

    /// Every search for `query` fails with a permanent store error.
    pub fn fail_on(mut self, query: &str) -> Self {
        self.failing_queries.insert(query.to_string());
        self
    }

    pub fn fail_transiently(self, times: usize) -> Self {
        self.transient_failures.store(times, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EvidenceStore for ScriptedStore {
    fn search(&self, request: &SearchRequest<'_>) -> Result<ChannelHits, AuditError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AuditError::transient("evidence store", "database is locked"));
        }

        let Some(query) = request.sparse.terms.keys().next() else {
            return Ok(ChannelHits::default());
        };
        if self.failing_queries.contains(query) {
            return Err(AuditError::Store {
                reason: format!("no such table while searching {query}"),
            });
        }
        let Some((sparse, dense)) = self.responses.get(query) else {
            return Ok(ChannelHits::default());
        };

        let scored = |hits: &[(String, u32, f64)], channel: Channel| {
            hits.iter()
                .take(request.top_k)
                .map(|(id, page, score)| ScoredChunk {
                    chunk: chunk(id, *page, &format!("text of {id}")),
                    score: *score,
                    channel,
                })
                .collect::<Vec<ScoredChunk>>()
        };
        Ok(ChannelHits {
            sparse: scored(sparse, Channel::Sparse),
            dense: scored(dense, Channel::Dense),
        })
    }
}

/// What the evaluator was shown on one call.
#[derive(Debug, Clone)]
pub struct EvaluatorCall {
    pub evidence_pages: Vec<u32>,
    pub hint: Option<Hint>,
}

/// Returns the queued evaluations in order, then the sentinel.
#[derive(Default)]
pub struct ScriptedEvaluator {
    script: Mutex<VecDeque<Evaluation>>,
    calls: Mutex<Vec<EvaluatorCall>>,
}

impl ScriptedEvaluator {
    pub fn new(script: Vec<Evaluation>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::default(),
        }
    }

    pub fn calls(&self) -> Vec<EvaluatorCall> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }
}

impl SufficiencyEvaluator for ScriptedEvaluator {
    fn evaluate(
        &self,
        _criterion: &Criterion,
        evidence: &[Arc<Chunk>],
        hint: Option<&Hint>,
    ) -> Evaluation {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(EvaluatorCall {
                evidence_pages: evidence.iter().map(|chunk| chunk.page_number).collect(),
                hint: hint.cloned(),
            });
        }
        self.script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or_else(Evaluation::sentinel)
    }
}

/// Cites pages that were never retrieved and reports a confidence above any threshold.
pub struct AdversarialEvaluator {
    pub cited: Vec<u32>,
}

impl SufficiencyEvaluator for AdversarialEvaluator {
    fn evaluate(&self, _: &Criterion, _: &[Arc<Chunk>], _: Option<&Hint>) -> Evaluation {
        evaluation(Verdict::Present, 1.0, "invented quote", &self.cited)
    }
}

/// Returns one queued batch per call; an exhausted script yields no proposals.
#[derive(Default)]
pub struct ScriptedReformulator {
    script: Mutex<VecDeque<Result<Vec<String>, AuditError>>>,
    seen_prior: Mutex<Vec<Vec<String>>>,
}

impl ScriptedReformulator {
    pub fn new(script: Vec<Vec<&str>>) -> Self {
        let batches = script
            .into_iter()
            .map(|batch| Ok(batch.into_iter().map(str::to_string).collect()))
            .collect::<VecDeque<Result<Vec<String>, AuditError>>>();
        Self {
            script: Mutex::new(batches),
            seen_prior: Mutex::default(),
        }
    }

    pub fn failing() -> Self {
        let batches = VecDeque::from([
            Err(AuditError::Llm {
                reason: "status=400".to_string(),
            }),
            Err(AuditError::Llm {
                reason: "status=400".to_string(),
            }),
        ]);
        Self {
            script: Mutex::new(batches),
            seen_prior: Mutex::default(),
        }
    }

    pub fn requests(&self) -> usize {
        self.seen_prior.lock().map(|seen| seen.len()).unwrap_or_default()
    }

    pub fn seen_prior(&self) -> Vec<Vec<String>> {
        self.seen_prior
            .lock()
            .map(|seen| seen.clone())
            .unwrap_or_default()
    }
}

impl QueryReformulator for ScriptedReformulator {
    fn reformulate(
        &self,
        _criterion: &Criterion,
        prior_queries: &[String],
        _evidence_summary: &str,
    ) -> Result<Vec<String>, AuditError> {
        if let Ok(mut seen) = self.seen_prior.lock() {
            seen.push(prior_queries.to_vec());
        }
        self.script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}
