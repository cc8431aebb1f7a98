use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub doc_type: String,
    pub page_number: u32,
    pub text: String,
    pub char_start: Option<usize>,
    pub char_end: Option<usize>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Sparse,
    Dense,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sparse => "sparse",
            Self::Dense => "dense",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Arc<Chunk>,
    pub score: f64,
    pub channel: Channel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedEntry {
    pub chunk_id: String,
    pub score: f64,
    pub sparse_rank: Option<usize>,
    pub dense_rank: Option<usize>,
}

impl FusedEntry {
    pub fn best_rank(&self) -> usize {
        match (self.sparse_rank, self.dense_rank) {
            (Some(sparse), Some(dense)) => sparse.min(dense),
            (Some(rank), None) | (None, Some(rank)) => rank,
            (None, None) => usize::MAX,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FusedResult {
    pub entries: Vec<FusedEntry>,
}

impl FusedResult {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn chunk_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.chunk_id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Criterion {
    pub index: usize,
    pub text: String,
    pub threshold: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hint {
    pub found: bool,
    pub answer: String,
    pub pages: BTreeSet<u32>,
}

impl Hint {
    /// Answer text usable as an auxiliary search query.
    pub fn query_text(&self) -> Option<&str> {
        let answer = self.answer.trim();
        if self.found && !answer.is_empty() {
            Some(answer)
        } else {
            None
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Present,
    Absent,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "PRESENT",
            Self::Absent => "ABSENT",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PRESENT" => Some(Self::Present),
            "ABSENT" => Some(Self::Absent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub status: Verdict,
    pub confidence: f64,
    pub evidence_text: String,
    pub cited_pages: BTreeSet<u32>,
}

impl Evaluation {
    /// Outcome reported when the judgment could not be obtained.
    pub fn sentinel() -> Self {
        Self {
            status: Verdict::Absent,
            confidence: 0.0,
            evidence_text: String::new(),
            cited_pages: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub round: usize,
    pub query: String,
    pub fused: FusedResult,
    pub status: Verdict,
    pub confidence: f64,
    pub evidence_text: String,
    pub cited_pages: BTreeSet<u32>,
    pub search_failed: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Sufficient,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CriterionOutcome {
    pub criterion: String,
    pub threshold: f64,
    pub status: Verdict,
    pub confidence: f64,
    pub evidence_text: String,
    pub cited_pages: Vec<u32>,
    pub attempts: usize,
    pub terminal_state: TerminalState,
    pub cancelled: bool,
    pub queries: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolVersions {
    pub pdftotext: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestCounts {
    pub pdf_count: usize,
    pub indexed_docs: usize,
    pub skipped_docs: usize,
    pub pages_extracted: usize,
    pub empty_pages: usize,
    pub chunks_inserted: usize,
    pub embeddings_inserted: usize,
    pub chunks_total: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub db_schema_version: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub db_path: String,
    pub model_id: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub tool_versions: ToolVersions,
    pub counts: IngestCounts,
    pub documents: Vec<IndexedDocument>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexedDocument {
    pub doc_id: String,
    pub filename: String,
    pub doc_type: String,
    pub sha256: String,
    pub page_count: usize,
    pub chunk_count: usize,
    pub skipped: bool,
}
