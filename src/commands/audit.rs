use std::io::{self, Write};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::cli::AuditArgs;
use crate::commands::effective_db_path;
use crate::commands::ingest::{
    IndexPlan, PageSource, Pdftotext, index_documents, pdftotext_version,
};
use crate::config::{
    AuditConfig, DocumentConfig, load_config, require_audit_inputs, resolve_config_path,
};
use crate::llm::{ChatClient, LanguageModel};
use crate::model::{Criterion, CriterionOutcome, ToolVersions};
use crate::report::{
    AuditMetrics, AuditReport, CriterionMetrics, render_metrics, render_text, save_report,
};
use crate::research::retrieval::dynamic_evidence_limit;
use crate::research::{
    AgentSettings, DeepResearchAgent, DocumentText, HintBook, HintLookup, HybridRetriever,
    LlmEvaluator, LlmHintGenerator, LlmReformulator, NoHints, RetrievalSettings, generate_hints,
};
use crate::semantic::{LocalHashEmbedder, resolve_model_config};
use crate::store::{SearchFilters, SqliteEvidenceStore};
use crate::util::{CancelToken, RetryPolicy};

const STORE_RETRY_DELAY: Duration = Duration::from_millis(250);

pub fn run(args: AuditArgs) -> Result<()> {
    let config_path = resolve_config_path(args.config.as_deref())?;
    let mut config = load_config(&config_path)?;
    apply_overrides(&mut config, &args);
    config
        .validate()
        .with_context(|| format!("invalid settings for {}", config_path.display()))?;
    require_audit_inputs(&config)?;
    let criteria = config.criteria()?;

    let db_path = effective_db_path(&config, args.db_path.as_deref());
    let model = resolve_model_config(&config.embedding.model_id, config.embedding.dimensions);
    let started = Instant::now();
    let cancel = match config.deep_agent.timeout_secs {
        Some(seconds) => CancelToken::with_deadline(started + Duration::from_secs(seconds)),
        None => CancelToken::new(),
    };

    info!(
        config = %config_path.display(),
        documents = config.documents.len(),
        criteria = criteria.len(),
        max_attempts = config.deep_agent.effective_max_attempts(),
        workers = config.deep_agent.workers,
        "starting audit"
    );

    if args.skip_indexing || config.pipeline.skip_indexing {
        info!("indexing skipped by configuration");
    } else {
        let plan = IndexPlan {
            documents: &config.documents,
            db_path: &db_path,
            model: &model,
            chunking: config.chunking,
            force_reindex: config.pipeline.force_reindex,
            max_pages_per_doc: None,
        };
        let tool_versions = ToolVersions {
            pdftotext: pdftotext_version()?,
        };
        let manifest = index_documents(&plan, &Pdftotext, tool_versions)?;
        info!(
            indexed = manifest.counts.indexed_docs,
            skipped = manifest.counts.skipped_docs,
            chunks_total = manifest.counts.chunks_total,
            "index ready"
        );
    }

    if !db_path.exists() {
        bail!("index not found: {}; run `docaudit ingest` first", db_path.display());
    }
    let store = SqliteEvidenceStore::open(&db_path, &model, config.store.pool_size)?;
    let embedder = LocalHashEmbedder::new(model);
    let llm = ChatClient::new(config.llm.chat_settings());
    info!(
        embedding_model = %embedder.config().model_id,
        llm_model = %llm.model(),
        "research models ready"
    );

    let auditor = DocumentAuditor {
        config: &config,
        store: &store,
        embedder: &embedder,
        llm: &llm,
        pages: &Pdftotext,
        cancel: &cancel,
        use_hints: config.hints.enabled && !args.no_hints,
    };
    let output_dir = args
        .output_dir
        .clone()
        .unwrap_or_else(|| config.output.directory.clone());

    for report in auditor.audit_all(&criteria)? {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{}", render_text(&report))?;
        if config.pipeline.display_metrics {
            writeln!(stdout, "\n{}", render_metrics(&report.metrics))?;
        }
        stdout.flush()?;

        save_report(
            &report,
            &output_dir,
            config.output.save_json,
            config.output.save_txt,
        )?;
    }

    info!(
        elapsed_secs = started.elapsed().as_secs_f64(),
        cancelled = cancel.is_cancelled(),
        "audit complete"
    );
    Ok(())
}

fn apply_overrides(config: &mut AuditConfig, args: &AuditArgs) {
    let agent = &mut config.deep_agent;
    if let Some(rrf_k) = args.rrf_k {
        agent.rrf_k = rrf_k;
    }
    if let Some(top_k) = args.top_k {
        agent.top_k = top_k;
    }
    if let Some(evidence_limit) = args.evidence_limit {
        agent.evidence_limit = Some(evidence_limit);
    }
    if let Some(max_attempts) = args.max_attempts {
        agent.max_attempts = max_attempts;
    }
    if let Some(workers) = args.workers {
        agent.workers = workers;
    }
    if args.timeout_secs.is_some() {
        agent.timeout_secs = args.timeout_secs;
    }
}

struct DocumentAuditor<'a> {
    config: &'a AuditConfig,
    store: &'a SqliteEvidenceStore,
    embedder: &'a LocalHashEmbedder,
    llm: &'a dyn LanguageModel,
    pages: &'a dyn PageSource,
    cancel: &'a CancelToken,
    use_hints: bool,
}

impl DocumentAuditor<'_> {
    /// One report per configured document, in configured order. Every document
    /// must already be indexed; that is checked before any session starts.
    fn audit_all(&self, criteria: &[Criterion]) -> Result<Vec<AuditReport>> {
        let mut chunk_counts = Vec::with_capacity(self.config.documents.len());
        for document in &self.config.documents {
            let doc_id = document.doc_id();
            if self.store.document_type(&doc_id)?.is_none() {
                bail!(
                    "document is not indexed: {doc_id} ({}) in {}",
                    document.path.display(),
                    self.store.db_path().display()
                );
            }
            let chunks = self.store.document_chunk_count(&doc_id)?;
            if chunks == 0 {
                warn!(doc_id = %doc_id, "document has no indexed text");
            }
            chunk_counts.push(chunks);
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.deep_agent.workers)
            .build()
            .context("failed to build criterion worker pool")?;

        Ok(self
            .config
            .documents
            .iter()
            .zip(chunk_counts)
            .map(|(document, chunks)| pool.install(|| self.audit(document, chunks, criteria)))
            .collect())
    }

    /// Runs every criterion against one document. Always returns one outcome per criterion.
    fn audit(
        &self,
        document: &DocumentConfig,
        chunks: usize,
        criteria: &[Criterion],
    ) -> AuditReport {
        let started = Instant::now();
        let doc_id = document.doc_id();
        let llm_retry = self.config.llm.retry_policy().cancelled_by(self.cancel);
        let agent_config = &self.config.deep_agent;
        let evidence_limit = agent_config
            .evidence_limit
            .unwrap_or_else(|| dynamic_evidence_limit(chunks));

        let hint_book = if self.use_hints {
            self.hints_for(document, criteria, llm_retry.clone())
        } else {
            None
        };
        let hints: &dyn HintLookup = match &hint_book {
            Some(book) => book,
            None => &NoHints,
        };

        let retriever = HybridRetriever::new(
            self.embedder,
            self.store,
            SearchFilters::for_document(&doc_id, Some(&document.doc_type)),
            RetrievalSettings {
                top_k: agent_config.top_k,
                evidence_limit,
                rrf_k: agent_config.rrf_k,
                retry: RetryPolicy::new(2, STORE_RETRY_DELAY).cancelled_by(self.cancel),
            },
        );
        let evaluator = LlmEvaluator::new(self.llm, llm_retry.clone());
        let reformulator =
            LlmReformulator::new(self.llm, agent_config.max_reformulations, llm_retry);
        let agent = DeepResearchAgent::new(
            &retriever,
            &evaluator,
            &reformulator,
            hints,
            AgentSettings {
                max_attempts: agent_config.effective_max_attempts(),
                summary_max_chars: agent_config.summary_max_chars,
                use_hints: self.use_hints,
                ..AgentSettings::default()
            },
            self.cancel.clone(),
        );

        info!(
            doc_id = %doc_id,
            criteria = criteria.len(),
            chunks,
            evidence_limit,
            "auditing document"
        );
        let timed = criteria
            .par_iter()
            .map(|criterion| {
                let criterion_started = Instant::now();
                let outcome = agent.run_session(criterion);
                (criterion.index, outcome, criterion_started.elapsed())
            })
            .collect::<Vec<(usize, CriterionOutcome, Duration)>>();

        let metrics = timed
            .iter()
            .map(|(index, outcome, elapsed)| CriterionMetrics {
                index: *index,
                criterion: outcome.criterion.clone(),
                duration_secs: elapsed.as_secs_f64(),
                attempts: outcome.attempts,
                confidence: outcome.confidence,
            })
            .collect::<Vec<CriterionMetrics>>();
        let outcomes = timed
            .into_iter()
            .map(|(_, outcome, _)| outcome)
            .collect::<Vec<CriterionOutcome>>();

        AuditReport::assemble(
            &doc_id,
            &document.doc_type,
            outcomes,
            AuditMetrics::from_criteria(metrics, started.elapsed()),
        )
    }

    fn hints_for(
        &self,
        document: &DocumentConfig,
        criteria: &[Criterion],
        retry: RetryPolicy,
    ) -> Option<HintBook> {
        let pages = match self.pages.pages(&document.path, None) {
            Ok(pages) => pages,
            Err(error) => {
                warn!(
                    path = %document.path.display(),
                    error = %error,
                    "could not read document text, continuing without hints"
                );
                return None;
            }
        };
        let generator =
            LlmHintGenerator::new(self.llm, retry, self.config.hints.max_document_chars);
        Some(generate_hints(
            &generator,
            criteria,
            &DocumentText::from_pages(pages),
            self.cancel,
        ))
    }
}
