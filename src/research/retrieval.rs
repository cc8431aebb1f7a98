use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::AuditError;
use crate::model::{Chunk, FusedResult, ScoredChunk};
use crate::research::fusion::{DEFAULT_RRF_K, fuse, positional_ranking};
use crate::semantic::QueryEmbedder;
use crate::store::{ChannelHits, EvidenceStore, SearchFilters, SearchRequest};
use crate::util::{RetryPolicy, retry_with_backoff};

pub const DEFAULT_TOP_K: usize = 10;
pub const DEFAULT_EVIDENCE_LIMIT: usize = 5;

/// Evidence limit scaled to document size: one chunk per hundred indexed,
/// kept within 3..=10.
pub fn dynamic_evidence_limit(total_chunks: usize) -> usize {
    (total_chunks / 100).clamp(3, 10)
}

#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    pub top_k: usize,
    pub evidence_limit: usize,
    pub rrf_k: u32,
    pub retry: RetryPolicy,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            evidence_limit: DEFAULT_EVIDENCE_LIMIT,
            rrf_k: DEFAULT_RRF_K,
            // One retry after the first failure.
            retry: RetryPolicy::new(2, Duration::from_millis(250)),
        }
    }
}

/// Fused ranking of one round plus the hydrated top-N chunks handed to the evaluator.
#[derive(Debug, Clone, Default)]
pub struct RoundEvidence {
    pub fused: FusedResult,
    pub evidence: Vec<Arc<Chunk>>,
}

pub struct HybridRetriever<'a> {
    embedder: &'a dyn QueryEmbedder,
    store: &'a dyn EvidenceStore,
    filters: SearchFilters,
    settings: RetrievalSettings,
}

impl<'a> HybridRetriever<'a> {
    pub fn new(
        embedder: &'a dyn QueryEmbedder,
        store: &'a dyn EvidenceStore,
        filters: SearchFilters,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            embedder,
            store,
            filters,
            settings,
        }
    }

    /// Searches every query, merges the per-channel hits (highest raw score wins
    /// per chunk), fuses the two channels and keeps the top `evidence_limit`.
    ///
    /// The first non-empty query is primary: its failure fails the round. A
    /// failing auxiliary query is logged and skipped.
    pub fn search_round(&self, queries: &[&str]) -> Result<RoundEvidence, AuditError> {
        let mut sparse = HashMap::<String, ScoredChunk>::new();
        let mut dense = HashMap::<String, ScoredChunk>::new();

        let mut queries = queries.iter().filter(|query| !query.trim().is_empty());
        let mut searched = 0_usize;
        if let Some(primary) = queries.next() {
            let hits = self.search_one(primary)?;
            merge_hits(&mut sparse, hits.sparse);
            merge_hits(&mut dense, hits.dense);
            searched += 1;
        }
        for query in queries {
            match self.search_one(query) {
                Ok(hits) => {
                    merge_hits(&mut sparse, hits.sparse);
                    merge_hits(&mut dense, hits.dense);
                    searched += 1;
                }
                Err(error) => {
                    warn!(query = %query, error = %error, "auxiliary query failed, skipping it");
                }
            }
        }

        let sparse_ranked = ranked_hits(sparse);
        let dense_ranked = ranked_hits(dense);
        for top in [sparse_ranked.first(), dense_ranked.first()].into_iter().flatten() {
            debug!(
                channel = top.channel.as_str(),
                chunk_id = %top.chunk.chunk_id,
                page = top.chunk.page_number,
                score = top.score,
                "top channel hit"
            );
        }
        let fused = fuse(
            &positional_ranking(sparse_ranked.iter().map(|hit| hit.chunk.chunk_id.as_str())),
            &positional_ranking(dense_ranked.iter().map(|hit| hit.chunk.chunk_id.as_str())),
            self.settings.rrf_k,
        );

        let by_id = sparse_ranked
            .iter()
            .chain(dense_ranked.iter())
            .map(|hit| (hit.chunk.chunk_id.as_str(), &hit.chunk))
            .collect::<HashMap<&str, &Arc<Chunk>>>();
        let evidence = fused
            .chunk_ids()
            .filter_map(|chunk_id| by_id.get(chunk_id).map(|chunk| Arc::clone(chunk)))
            .take(self.settings.evidence_limit)
            .collect::<Vec<Arc<Chunk>>>();

        debug!(
            queries = searched,
            sparse_hits = sparse_ranked.len(),
            dense_hits = dense_ranked.len(),
            fused = fused.len(),
            evidence = evidence.len(),
            "retrieval round complete"
        );

        Ok(RoundEvidence { fused, evidence })
    }

    fn search_one(&self, query: &str) -> Result<ChannelHits, AuditError> {
        let vectors = retry_with_backoff(&self.settings.retry, "embedding", || {
            self.embedder.embed(query)
        })?;
        let request = SearchRequest {
            sparse: &vectors.sparse,
            dense: &vectors.dense,
            filters: &self.filters,
            top_k: self.settings.top_k,
        };
        retry_with_backoff(&self.settings.retry, "evidence store", || {
            self.store.search(&request)
        })
    }
}

fn merge_hits(merged: &mut HashMap<String, ScoredChunk>, hits: Vec<ScoredChunk>) {
    for hit in hits {
        match merged.get(&hit.chunk.chunk_id) {
            Some(existing) if existing.score >= hit.score => {}
            _ => {
                merged.insert(hit.chunk.chunk_id.clone(), hit);
            }
        }
    }
}

fn ranked_hits(merged: HashMap<String, ScoredChunk>) -> Vec<ScoredChunk> {
    let mut hits = merged.into_values().collect::<Vec<ScoredChunk>>();
    hits.sort_by(|left, right| {
        right
            .score
            .total_cmp(&left.score)
            .then_with(|| left.chunk.chunk_id.cmp(&right.chunk.chunk_id))
    });
    hits
}
