mod pool;
mod schema;
mod sqlite;
#[cfg(test)]
mod tests;

use crate::error::AuditError;
use crate::model::ScoredChunk;
use crate::semantic::SparseVector;

pub use pool::ConnectionPool;
pub use schema::{DB_SCHEMA_VERSION, configure_connection, ensure_schema};
pub use sqlite::{
    ChunkInsert, DocumentInsert, IndexCounts, SqliteEvidenceStore, delete_document,
    find_document_hash, index_counts, insert_chunks, register_embedding_model, sync_fts_index,
    upsert_document,
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilters {
    pub doc_id: Option<String>,
    pub doc_type: Option<String>,
    pub page_number: Option<u32>,
}

impl SearchFilters {
    pub fn for_document(doc_id: &str, doc_type: Option<&str>) -> Self {
        Self {
            doc_id: Some(doc_id.to_string()),
            doc_type: doc_type.map(str::to_string),
            page_number: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    pub sparse: &'a SparseVector,
    pub dense: &'a [f32],
    pub filters: &'a SearchFilters,
    pub top_k: usize,
}

/// Per-channel hits, each list already ordered best first.
#[derive(Debug, Clone, Default)]
pub struct ChannelHits {
    pub sparse: Vec<ScoredChunk>,
    pub dense: Vec<ScoredChunk>,
}

pub trait EvidenceStore: Send + Sync {
    fn search(&self, request: &SearchRequest<'_>) -> Result<ChannelHits, AuditError>;
}
