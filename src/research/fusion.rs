//! Reciprocal Rank Fusion over the sparse and dense channels.
//!
//! Each channel contributes `1 / (k + rank)` for every chunk it ranked (rank is
//! 1-based). A chunk seen by both channels keeps a single entry carrying the sum.

use std::collections::HashMap;

use crate::model::{FusedEntry, FusedResult};

pub const DEFAULT_RRF_K: u32 = 60;

/// Inputs need not be sorted. A chunk listed twice in one channel keeps its
/// best (smallest) rank there.
pub fn fuse(
    sparse_ranked: &[(String, usize)],
    dense_ranked: &[(String, usize)],
    k: u32,
) -> FusedResult {
    let mut merged = HashMap::<&str, FusedEntry>::new();

    for (chunk_id, rank) in sparse_ranked {
        let entry = merged
            .entry(chunk_id.as_str())
            .or_insert_with(|| seed_entry(chunk_id));
        entry.sparse_rank = best_rank(entry.sparse_rank, *rank);
    }
    for (chunk_id, rank) in dense_ranked {
        let entry = merged
            .entry(chunk_id.as_str())
            .or_insert_with(|| seed_entry(chunk_id));
        entry.dense_rank = best_rank(entry.dense_rank, *rank);
    }

    let rrf_base = f64::from(k);
    let mut entries = merged
        .into_values()
        .map(|mut entry| {
            entry.score = [entry.sparse_rank, entry.dense_rank]
                .into_iter()
                .flatten()
                .map(|rank| 1.0 / (rrf_base + rank as f64))
                .sum();
            entry
        })
        .collect::<Vec<FusedEntry>>();
    sort_fused(&mut entries);
    FusedResult { entries }
}

/// Ranks a best-first id list as 1, 2, 3, ...
pub fn positional_ranking<'a>(ids: impl IntoIterator<Item = &'a str>) -> Vec<(String, usize)> {
    ids.into_iter()
        .enumerate()
        .map(|(index, id)| (id.to_string(), index + 1))
        .collect()
}

fn best_rank(current: Option<usize>, rank: usize) -> Option<usize> {
    let rank = rank.max(1);
    Some(current.map_or(rank, |current| current.min(rank)))
}

fn seed_entry(chunk_id: &str) -> FusedEntry {
    FusedEntry {
        chunk_id: chunk_id.to_string(),
        score: 0.0,
        sparse_rank: None,
        dense_rank: None,
    }
}

fn sort_fused(entries: &mut [FusedEntry]) {
    entries.sort_by(|left, right| {
        right
            .score
            .total_cmp(&left.score)
            .then(left.best_rank().cmp(&right.best_rank()))
            .then_with(|| left.chunk_id.cmp(&right.chunk_id))
    });
}
