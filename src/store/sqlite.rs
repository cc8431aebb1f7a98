use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;

use crate::error::AuditError;
use crate::model::{Channel, Chunk, ScoredChunk};
use crate::semantic::{SemanticModelConfig, SparseVector, cosine_similarity, decode_embedding_blob};

use super::pool::ConnectionPool;
use super::{ChannelHits, EvidenceStore, SearchFilters, SearchRequest};

const CHUNK_COLUMNS: &str =
    "c.chunk_id, c.doc_id, c.doc_type, c.page_number, c.text, c.char_start, c.char_end";

pub struct SqliteEvidenceStore {
    pool: ConnectionPool,
    model_id: String,
    embedding_dim: usize,
}

impl SqliteEvidenceStore {
    pub fn open(db_path: &Path, model: &SemanticModelConfig, max_idle: usize) -> Result<Self> {
        let pool = ConnectionPool::open(db_path, max_idle)
            .with_context(|| format!("failed to open evidence store: {}", db_path.display()))?;
        Ok(Self {
            pool,
            model_id: model.model_id.clone(),
            embedding_dim: model.dimensions,
        })
    }

    pub fn db_path(&self) -> &Path {
        self.pool.db_path()
    }

    pub fn document_chunk_count(&self, doc_id: &str) -> Result<usize, AuditError> {
        let connection = self.pool.get()?;
        let count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM chunks WHERE doc_id = ?1",
            [doc_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    pub fn document_type(&self, doc_id: &str) -> Result<Option<String>, AuditError> {
        let connection = self.pool.get()?;
        let doc_type = connection
            .query_row(
                "SELECT doc_type FROM docs WHERE doc_id = ?1",
                [doc_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(doc_type)
    }

    fn sparse_hits(
        &self,
        connection: &Connection,
        sparse: &SparseVector,
        filters: &SearchFilters,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, AuditError> {
        let Some(fts_query) = to_fts_query(sparse) else {
            return Ok(Vec::new());
        };

        let sql = format!(
            "
            SELECT {CHUNK_COLUMNS}, bm25(chunks_fts)
            FROM chunks_fts
            JOIN chunks c ON c.rowid = chunks_fts.rowid
            WHERE
              chunks_fts MATCH ?1
              AND (?2 IS NULL OR c.doc_id = ?2)
              AND (?3 IS NULL OR c.doc_type = ?3)
              AND (?4 IS NULL OR c.page_number = ?4)
            ORDER BY bm25(chunks_fts) ASC, c.chunk_id ASC
            LIMIT ?5
            "
        );
        let mut statement = connection.prepare(&sql)?;
        let mut rows = statement.query(params![
            fts_query,
            filters.doc_id,
            filters.doc_type,
            filters.page_number,
            top_k as i64,
        ])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let bm25: f64 = row.get(7)?;
            out.push(ScoredChunk {
                chunk: Arc::new(chunk_from_row(row)?),
                score: -bm25,
                channel: Channel::Sparse,
            });
        }
        Ok(out)
    }

    fn dense_hits(
        &self,
        connection: &Connection,
        dense: &[f32],
        filters: &SearchFilters,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, AuditError> {
        if dense.len() != self.embedding_dim {
            return Err(AuditError::Store {
                reason: format!(
                    "query embedding has {} dimensions, index expects {}",
                    dense.len(),
                    self.embedding_dim
                ),
            });
        }

        let sql = format!(
            "
            SELECT {CHUNK_COLUMNS}, ce.embedding
            FROM chunk_embeddings ce
            JOIN chunks c ON c.chunk_id = ce.chunk_id
            WHERE
              ce.model_id = ?1
              AND ce.embedding_dim = ?2
              AND (?3 IS NULL OR c.doc_id = ?3)
              AND (?4 IS NULL OR c.doc_type = ?4)
              AND (?5 IS NULL OR c.page_number = ?5)
            "
        );
        let mut statement = connection.prepare(&sql)?;
        let mut rows = statement.query(params![
            self.model_id,
            self.embedding_dim as i64,
            filters.doc_id,
            filters.doc_type,
            filters.page_number,
        ])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let blob: Vec<u8> = row.get(7)?;
            let Some(embedding) = decode_embedding_blob(&blob, self.embedding_dim) else {
                continue;
            };
            out.push(ScoredChunk {
                chunk: Arc::new(chunk_from_row(row)?),
                score: cosine_similarity(dense, &embedding),
                channel: Channel::Dense,
            });
        }

        out.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then_with(|| left.chunk.chunk_id.cmp(&right.chunk.chunk_id))
        });
        out.truncate(top_k);
        Ok(out)
    }
}

impl EvidenceStore for SqliteEvidenceStore {
    fn search(&self, request: &SearchRequest<'_>) -> Result<ChannelHits, AuditError> {
        let top_k = request.top_k.max(1);
        let connection = self.pool.get()?;
        let sparse = self.sparse_hits(&connection, request.sparse, request.filters, top_k)?;
        let dense = self.dense_hits(&connection, request.dense, request.filters, top_k)?;

        debug!(
            sparse_hits = sparse.len(),
            dense_hits = dense.len(),
            top_k,
            "evidence store search"
        );
        Ok(ChannelHits { sparse, dense })
    }
}

fn chunk_from_row(row: &Row<'_>) -> rusqlite::Result<Chunk> {
    Ok(Chunk {
        chunk_id: row.get(0)?,
        doc_id: row.get(1)?,
        doc_type: row.get(2)?,
        page_number: row.get(3)?,
        text: row.get(4)?,
        char_start: row.get::<_, Option<i64>>(5)?.map(|value| value.max(0) as usize),
        char_end: row.get::<_, Option<i64>>(6)?.map(|value| value.max(0) as usize),
    })
}

fn to_fts_query(sparse: &SparseVector) -> Option<String> {
    let terms = sparse
        .terms
        .keys()
        .map(|term| term.replace('"', ""))
        .filter(|term| !term.is_empty())
        .map(|term| format!("\"{term}\""))
        .collect::<Vec<String>>();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

#[derive(Debug, Clone)]
pub struct DocumentInsert<'a> {
    pub doc_id: &'a str,
    pub filename: &'a str,
    pub doc_type: &'a str,
    pub sha256: &'a str,
    pub page_count: usize,
    pub indexed_at: &'a str,
}

#[derive(Debug, Clone)]
pub struct ChunkInsert {
    pub chunk: Chunk,
    pub chunk_seq: usize,
    pub embedding: Vec<u8>,
    pub embedding_dim: usize,
    pub text_hash: String,
}

#[derive(Debug, Clone, Default)]
pub struct IndexCounts {
    pub docs: i64,
    pub chunks: i64,
    pub embeddings: i64,
}

pub fn find_document_hash(connection: &Connection, doc_id: &str) -> Result<Option<String>> {
    connection
        .query_row(
            "SELECT sha256 FROM docs WHERE doc_id = ?1",
            [doc_id],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .with_context(|| format!("failed to look up document {doc_id}"))
}

pub fn delete_document(connection: &Connection, doc_id: &str) -> Result<usize> {
    connection
        .execute(
            "DELETE FROM chunk_embeddings
             WHERE chunk_id IN (SELECT chunk_id FROM chunks WHERE doc_id = ?1)",
            [doc_id],
        )
        .with_context(|| format!("failed to delete embeddings for {doc_id}"))?;
    let removed = connection
        .execute("DELETE FROM chunks WHERE doc_id = ?1", [doc_id])
        .with_context(|| format!("failed to delete chunks for {doc_id}"))?;
    connection
        .execute("DELETE FROM docs WHERE doc_id = ?1", [doc_id])
        .with_context(|| format!("failed to delete document {doc_id}"))?;
    Ok(removed)
}

pub fn upsert_document(connection: &Connection, document: &DocumentInsert<'_>) -> Result<()> {
    connection
        .execute(
            "
            INSERT INTO docs(doc_id, filename, doc_type, sha256, page_count, indexed_at)
            VALUES(?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(doc_id) DO UPDATE SET
              filename = excluded.filename,
              doc_type = excluded.doc_type,
              sha256 = excluded.sha256,
              page_count = excluded.page_count,
              indexed_at = excluded.indexed_at
            ",
            params![
                document.doc_id,
                document.filename,
                document.doc_type,
                document.sha256,
                document.page_count as i64,
                document.indexed_at,
            ],
        )
        .with_context(|| format!("failed to upsert document {}", document.doc_id))?;
    Ok(())
}

pub fn register_embedding_model(
    connection: &Connection,
    model: &SemanticModelConfig,
) -> Result<()> {
    connection
        .execute(
            "
            INSERT INTO embedding_models(model_id, dimensions, normalization, backend)
            VALUES(?1, ?2, ?3, ?4)
            ON CONFLICT(model_id) DO UPDATE SET
              dimensions = excluded.dimensions,
              normalization = excluded.normalization,
              backend = excluded.backend
            ",
            params![
                model.model_id,
                model.dimensions as i64,
                model.normalization,
                model.backend,
            ],
        )
        .with_context(|| format!("failed to register embedding model {}", model.model_id))?;
    Ok(())
}

/// Runs inside the caller's transaction so a document's rows land together.
pub fn insert_chunks(
    connection: &Connection,
    model_id: &str,
    chunks: &[ChunkInsert],
) -> Result<usize> {
    let mut chunk_statement = connection.prepare(
        "
        INSERT INTO chunks(chunk_id, doc_id, doc_type, page_number, chunk_seq, text, char_start, char_end)
        VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ",
    )?;
    let mut embedding_statement = connection.prepare(
        "
        INSERT INTO chunk_embeddings(chunk_id, model_id, embedding_dim, embedding, text_hash)
        VALUES(?1, ?2, ?3, ?4, ?5)
        ",
    )?;

    for insert in chunks {
        let chunk = &insert.chunk;
        chunk_statement
            .execute(params![
                chunk.chunk_id,
                chunk.doc_id,
                chunk.doc_type,
                chunk.page_number,
                insert.chunk_seq as i64,
                chunk.text,
                chunk.char_start.map(|value| value as i64),
                chunk.char_end.map(|value| value as i64),
            ])
            .with_context(|| format!("failed to insert chunk {}", chunk.chunk_id))?;
        embedding_statement
            .execute(params![
                chunk.chunk_id,
                model_id,
                insert.embedding_dim as i64,
                insert.embedding,
                insert.text_hash,
            ])
            .with_context(|| format!("failed to insert embedding for {}", chunk.chunk_id))?;
    }
    Ok(chunks.len())
}

pub fn sync_fts_index(connection: &Connection) -> Result<()> {
    connection
        .execute("INSERT INTO chunks_fts(chunks_fts) VALUES('rebuild')", [])
        .context("failed to rebuild FTS index")?;
    Ok(())
}

pub fn index_counts(connection: &Connection) -> Result<IndexCounts> {
    let count = |sql: &str| -> Result<i64> {
        connection
            .query_row(sql, [], |row| row.get(0))
            .with_context(|| format!("failed to run count query: {sql}"))
    };

    Ok(IndexCounts {
        docs: count("SELECT COUNT(*) FROM docs")?,
        chunks: count("SELECT COUNT(*) FROM chunks")?,
        embeddings: count("SELECT COUNT(*) FROM chunk_embeddings")?,
    })
}
