use std::io::{self, Write};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::info;

use crate::cli::QueryArgs;
use crate::commands::{effective_db_path, load_config_or_default};
use crate::model::FusedEntry;
use crate::research::{HybridRetriever, RetrievalSettings};
use crate::semantic::{LocalHashEmbedder, resolve_model_config};
use crate::store::{SearchFilters, SqliteEvidenceStore};
use crate::util::{RetryPolicy, truncate_chars};

const PREVIEW_CHARS: usize = 160;

#[derive(Debug, Serialize)]
struct QueryResult {
    rank: usize,
    chunk_id: String,
    doc_id: String,
    doc_type: String,
    page_number: u32,
    fused_score: f64,
    sparse_rank: Option<usize>,
    dense_rank: Option<usize>,
    text: String,
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    query: String,
    auxiliary_query: Option<String>,
    rrf_k: u32,
    top_k: usize,
    fused_candidates: usize,
    duration_ms: f64,
    results: Vec<QueryResult>,
}

pub fn run(args: QueryArgs) -> Result<()> {
    if args.query.trim().is_empty() {
        bail!("--query must not be empty");
    }
    let config = load_config_or_default(args.config.as_deref())?;
    let db_path = effective_db_path(&config, args.db_path.as_deref());
    if !db_path.exists() {
        bail!("index not found: {}; run `docaudit ingest` first", db_path.display());
    }

    let model = resolve_model_config(&config.embedding.model_id, config.embedding.dimensions);
    let store = SqliteEvidenceStore::open(&db_path, &model, config.store.pool_size)?;
    let embedder = LocalHashEmbedder::new(model);
    let filters = SearchFilters {
        doc_id: args.doc_id.clone(),
        doc_type: args.doc_type.clone(),
        page_number: args.page,
    };
    let retriever = HybridRetriever::new(
        &embedder,
        &store,
        filters,
        RetrievalSettings {
            top_k: args.top_k.max(1),
            evidence_limit: args.evidence_limit.max(1),
            rrf_k: args.rrf_k,
            retry: RetryPolicy::new(2, Duration::from_millis(250)),
        },
    );

    let mut queries = vec![args.query.as_str()];
    queries.extend(args.also.as_deref());

    let started = Instant::now();
    let round = retriever
        .search_round(&queries)
        .with_context(|| format!("hybrid search failed for query: {}", args.query))?;
    let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

    let entries = round
        .fused
        .entries
        .iter()
        .map(|entry| (entry.chunk_id.as_str(), entry))
        .collect::<std::collections::HashMap<&str, &FusedEntry>>();
    let results = round
        .evidence
        .iter()
        .enumerate()
        .filter_map(|(index, chunk)| {
            let entry = entries.get(chunk.chunk_id.as_str())?;
            Some(QueryResult {
                rank: index + 1,
                chunk_id: chunk.chunk_id.clone(),
                doc_id: chunk.doc_id.clone(),
                doc_type: chunk.doc_type.clone(),
                page_number: chunk.page_number,
                fused_score: entry.score,
                sparse_rank: entry.sparse_rank,
                dense_rank: entry.dense_rank,
                text: chunk.text.clone(),
            })
        })
        .collect::<Vec<QueryResult>>();

    info!(
        query = %args.query,
        fused = round.fused.len(),
        returned = results.len(),
        duration_ms,
        "query complete"
    );

    let response = QueryResponse {
        query: args.query.clone(),
        auxiliary_query: args.also.clone(),
        rrf_k: args.rrf_k,
        top_k: args.top_k,
        fused_candidates: round.fused.len(),
        duration_ms,
        results,
    };

    if args.json {
        write_json_response(&response)
    } else {
        write_text_response(&response)
    }
}

fn write_json_response(response: &QueryResponse) -> Result<()> {
    let mut output = io::BufWriter::new(io::stdout().lock());
    serde_json::to_writer_pretty(&mut output, response)
        .context("failed to serialize query json output")?;
    writeln!(output)?;
    output.flush()?;
    Ok(())
}

fn write_text_response(response: &QueryResponse) -> Result<()> {
    let mut output = io::BufWriter::new(io::stdout().lock());

    writeln!(output, "Query: {}", response.query)?;
    if let Some(auxiliary) = &response.auxiliary_query {
        writeln!(output, "Also: {auxiliary}")?;
    }
    writeln!(
        output,
        "Fusion: rrf k={} top_k={} candidates={} duration_ms={:.3}",
        response.rrf_k, response.top_k, response.fused_candidates, response.duration_ms
    )?;
    writeln!(output, "Results: {}", response.results.len())?;

    for result in &response.results {
        writeln!(
            output,
            "{}.\t{}\t{}\tpage {}",
            result.rank, result.doc_id, result.doc_type, result.page_number
        )?;
        writeln!(
            output,
            "\tscore={:.6} sparse_rank={} dense_rank={} chunk_id={}",
            result.fused_score,
            format_rank(result.sparse_rank),
            format_rank(result.dense_rank),
            result.chunk_id
        )?;
        let preview = truncate_chars(&result.text, PREVIEW_CHARS).replace('\n', " ");
        writeln!(output, "\t{preview}")?;
    }

    output.flush()?;
    Ok(())
}

fn format_rank(rank: Option<usize>) -> String {
    rank.map_or_else(|| "-".to_string(), |rank| rank.to_string())
}
