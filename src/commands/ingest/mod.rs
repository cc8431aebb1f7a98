mod chunker;
mod pdf;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::cli::IngestArgs;
use crate::commands::{effective_db_path, load_config_or_default};
use crate::config::{ChunkingConfig, DocumentConfig};
use crate::model::{Chunk, IndexedDocument, IngestCounts, IngestRunManifest, ToolVersions};
use crate::semantic::{
    LocalHashEmbedder, SemanticModelConfig, encode_embedding_blob, resolve_model_config,
};
use crate::store::{
    ChunkInsert, DB_SCHEMA_VERSION, DocumentInsert, configure_connection, delete_document,
    ensure_schema, find_document_hash, index_counts, insert_chunks, register_embedding_model,
    sync_fts_index, upsert_document,
};
use crate::util::{
    ensure_directory, now_utc_string, sha256_file, sha256_text, utc_compact_string,
    write_json_pretty,
};

use chunker::split_page;
pub use pdf::{extract_pages, pdftotext_version};

pub const INGEST_MANIFEST_VERSION: u32 = 1;

/// Where page texts come from; `pdftotext` in production.
pub trait PageSource: Send + Sync {
    fn pages(&self, pdf_path: &Path, max_pages: Option<usize>) -> Result<Vec<String>>;
}

pub struct Pdftotext;

impl PageSource for Pdftotext {
    fn pages(&self, pdf_path: &Path, max_pages: Option<usize>) -> Result<Vec<String>> {
        extract_pages(pdf_path, max_pages)
    }
}

pub struct IndexPlan<'a> {
    pub documents: &'a [DocumentConfig],
    pub db_path: &'a Path,
    pub model: &'a SemanticModelConfig,
    pub chunking: ChunkingConfig,
    pub force_reindex: bool,
    pub max_pages_per_doc: Option<usize>,
}

pub fn run(args: IngestArgs) -> Result<()> {
    let started_ts = Utc::now();
    let config = load_config_or_default(args.config.as_deref())?;
    let db_path = effective_db_path(&config, args.db_path.as_deref());

    let documents = if args.pdfs.is_empty() {
        config.documents.clone()
    } else {
        args.pdfs
            .iter()
            .map(|path| DocumentConfig {
                path: path.clone(),
                doc_type: args.doc_type.clone(),
                skip_if_indexed: true,
            })
            .collect()
    };
    if documents.is_empty() {
        bail!("nothing to ingest: pass --pdf or configure documents");
    }

    let model = resolve_model_config(&config.embedding.model_id, config.embedding.dimensions);
    let plan = IndexPlan {
        documents: &documents,
        db_path: &db_path,
        model: &model,
        chunking: config.chunking,
        force_reindex: args.force_reindex || config.pipeline.force_reindex,
        max_pages_per_doc: args.max_pages_per_doc,
    };
    let tool_versions = ToolVersions {
        pdftotext: pdftotext_version()?,
    };

    let manifest = index_documents(&plan, &Pdftotext, tool_versions)?;

    let manifest_path = args.manifest_path.clone().unwrap_or_else(|| {
        manifest_dir_for(&db_path).join(format!(
            "ingest_run_{}.json",
            utc_compact_string(started_ts)
        ))
    });
    write_json_pretty(&manifest_path, &manifest)?;

    info!(
        path = %manifest_path.display(),
        indexed = manifest.counts.indexed_docs,
        skipped = manifest.counts.skipped_docs,
        chunks = manifest.counts.chunks_inserted,
        chunks_total = manifest.counts.chunks_total,
        "ingest complete"
    );
    Ok(())
}

fn manifest_dir_for(db_path: &Path) -> PathBuf {
    db_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default()
        .join("manifests")
}

/// Indexes every planned document that is new, changed, or forced; unchanged
/// documents marked `skip_if_indexed` are left as they are.
pub fn index_documents(
    plan: &IndexPlan<'_>,
    source: &dyn PageSource,
    tool_versions: ToolVersions,
) -> Result<IngestRunManifest> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();

    if let Some(parent) = plan.db_path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        ensure_directory(parent)?;
    }
    let mut connection = Connection::open(plan.db_path)
        .with_context(|| format!("failed to open {}", plan.db_path.display()))?;
    configure_connection(&connection)?;
    ensure_schema(&connection)?;
    register_embedding_model(&connection, plan.model)?;

    let embedder = LocalHashEmbedder::new(plan.model.clone());
    let mut counts = IngestCounts {
        pdf_count: plan.documents.len(),
        indexed_docs: 0,
        skipped_docs: 0,
        pages_extracted: 0,
        empty_pages: 0,
        chunks_inserted: 0,
        embeddings_inserted: 0,
        chunks_total: 0,
    };
    let mut documents = Vec::with_capacity(plan.documents.len());
    let mut warnings = Vec::new();

    for document in plan.documents {
        if !document.path.is_file() {
            bail!("document not found: {}", document.path.display());
        }
        let doc_id = document.doc_id();
        let sha256 = sha256_file(&document.path)?;
        let existing = find_document_hash(&connection, &doc_id)?;

        let unchanged = existing.as_deref() == Some(sha256.as_str());
        if unchanged && document.skip_if_indexed && !plan.force_reindex {
            let chunk_count: i64 = connection
                .query_row(
                    "SELECT COUNT(*) FROM chunks WHERE doc_id = ?1",
                    [&doc_id],
                    |row| row.get(0),
                )
                .with_context(|| format!("failed to count chunks for {doc_id}"))?;
            let page_count: i64 = connection
                .query_row(
                    "SELECT page_count FROM docs WHERE doc_id = ?1",
                    [&doc_id],
                    |row| row.get(0),
                )
                .with_context(|| format!("failed to read page count for {doc_id}"))?;
            info!(doc_id = %doc_id, chunks = chunk_count, "document already indexed, skipping");
            counts.skipped_docs += 1;
            documents.push(IndexedDocument {
                doc_id,
                filename: file_name(&document.path),
                doc_type: document.doc_type.clone(),
                sha256,
                page_count: page_count.max(0) as usize,
                chunk_count: chunk_count.max(0) as usize,
                skipped: true,
            });
            continue;
        }

        let pages = source
            .pages(&document.path, plan.max_pages_per_doc)
            .with_context(|| format!("failed to extract pages from {}", document.path.display()))?;
        let empty_pages = pages.iter().filter(|page| page.trim().is_empty()).count();
        counts.pages_extracted += pages.len();
        counts.empty_pages += empty_pages;
        if pages.len() == empty_pages {
            let message = format!("{doc_id}: no extractable text (scanned PDF?)");
            warn!(doc_id = %doc_id, pages = pages.len(), "no extractable text");
            warnings.push(message);
        }

        let inserts = build_chunks(&doc_id, &document.doc_type, &pages, plan.chunking, &embedder);

        let indexed_at = now_utc_string();
        let filename = file_name(&document.path);
        // Old rows, the docs row and the new chunks commit together; a failed
        // insert leaves the previous index (or no docs row) behind.
        let tx = connection
            .transaction()
            .with_context(|| format!("failed to begin index transaction for {doc_id}"))?;
        if existing.is_some() {
            if !unchanged {
                warn!(doc_id = %doc_id, "document changed since last index, reindexing");
            }
            let removed = delete_document(&tx, &doc_id)?;
            info!(doc_id = %doc_id, removed_chunks = removed, "removed previous index entries");
        }
        upsert_document(
            &tx,
            &DocumentInsert {
                doc_id: &doc_id,
                filename: &filename,
                doc_type: &document.doc_type,
                sha256: &sha256,
                page_count: pages.len(),
                indexed_at: &indexed_at,
            },
        )?;
        let inserted = insert_chunks(&tx, &plan.model.model_id, &inserts)?;
        tx.commit().with_context(|| format!("failed to commit index of {doc_id}"))?;

        info!(
            doc_id = %doc_id,
            pages = pages.len(),
            empty_pages,
            chunks = inserted,
            "document indexed"
        );
        counts.indexed_docs += 1;
        counts.chunks_inserted += inserted;
        counts.embeddings_inserted += inserted;
        documents.push(IndexedDocument {
            doc_id,
            filename,
            doc_type: document.doc_type.clone(),
            sha256,
            page_count: pages.len(),
            chunk_count: inserted,
            skipped: false,
        });
    }

    if counts.indexed_docs > 0 {
        sync_fts_index(&connection)?;
    }
    counts.chunks_total = index_counts(&connection)?.chunks;

    Ok(IngestRunManifest {
        manifest_version: INGEST_MANIFEST_VERSION,
        run_id: format!("run-{}", utc_compact_string(started_ts)),
        db_schema_version: DB_SCHEMA_VERSION.to_string(),
        status: "completed".to_string(),
        started_at,
        updated_at: now_utc_string(),
        db_path: plan.db_path.display().to_string(),
        model_id: plan.model.model_id.clone(),
        chunk_size: plan.chunking.chunk_size,
        chunk_overlap: plan.chunking.chunk_overlap,
        tool_versions,
        counts,
        documents,
        warnings,
    })
}

fn build_chunks(
    doc_id: &str,
    doc_type: &str,
    pages: &[String],
    chunking: ChunkingConfig,
    embedder: &LocalHashEmbedder,
) -> Vec<ChunkInsert> {
    let mut inserts = Vec::new();
    for (page_index, page_text) in pages.iter().enumerate() {
        let page_number = (page_index + 1) as u32;
        for span in split_page(page_text, chunking.chunk_size, chunking.chunk_overlap) {
            let chunk_seq = inserts.len();
            let embedding = embedder.embed_document(&span.text);
            let text_hash = sha256_text(&span.text);
            inserts.push(ChunkInsert {
                chunk: Chunk {
                    chunk_id: format!("{doc_id}:p{page_number}:c{chunk_seq}"),
                    doc_id: doc_id.to_string(),
                    doc_type: doc_type.to_string(),
                    page_number,
                    text: span.text,
                    char_start: Some(span.char_start),
                    char_end: Some(span.char_end),
                },
                chunk_seq,
                embedding_dim: embedding.len(),
                embedding: encode_embedding_blob(&embedding),
                text_hash,
            });
        }
    }
    inserts
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}
