use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AuditError;
use crate::util::normalize_whitespace;

pub const DEFAULT_MODEL_ID: &str = "hash-bigram-384-v1";
pub const DEFAULT_EMBEDDING_DIM: usize = 384;
pub const DEFAULT_NORMALIZATION: &str = "l2";
pub const DEFAULT_BACKEND: &str = "local-hash-v1";

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "any", "are", "as", "at", "be", "by", "does", "do", "for", "from", "has",
    "have", "how", "in", "is", "it", "of", "on", "or", "that", "the", "there", "this", "to",
    "what", "which", "with", "de", "da", "do", "das", "dos", "e", "em", "o", "os", "as", "um",
    "uma", "para", "por", "com", "que", "no", "na", "nos", "nas", "se", "ao",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticModelConfig {
    pub model_id: String,
    pub dimensions: usize,
    pub normalization: String,
    pub backend: String,
}

pub fn resolve_model_config(model_id: &str, dimensions: Option<usize>) -> SemanticModelConfig {
    let trimmed = model_id.trim();
    let resolved_id = if trimmed.is_empty() {
        DEFAULT_MODEL_ID
    } else {
        trimmed
    };

    SemanticModelConfig {
        model_id: resolved_id.to_string(),
        dimensions: dimensions.unwrap_or(DEFAULT_EMBEDDING_DIM).max(8),
        normalization: DEFAULT_NORMALIZATION.to_string(),
        backend: DEFAULT_BACKEND.to_string(),
    }
}

/// Lexical side of a query: normalized terms with their in-query weight.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SparseVector {
    pub terms: BTreeMap<String, f32>,
}

impl SparseVector {
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryVectors {
    pub sparse: SparseVector,
    pub dense: Vec<f32>,
}

pub trait QueryEmbedder: Send + Sync {
    fn model_id(&self) -> &str;

    fn embed(&self, text: &str) -> Result<QueryVectors, AuditError>;
}

#[derive(Debug, Clone)]
pub struct LocalHashEmbedder {
    config: SemanticModelConfig,
}

impl LocalHashEmbedder {
    pub fn new(config: SemanticModelConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SemanticModelConfig {
        &self.config
    }

    pub fn embed_document(&self, text: &str) -> Vec<f32> {
        embed_text_local(text, self.config.dimensions)
    }
}

impl QueryEmbedder for LocalHashEmbedder {
    fn model_id(&self) -> &str {
        &self.config.model_id
    }

    fn embed(&self, text: &str) -> Result<QueryVectors, AuditError> {
        Ok(QueryVectors {
            sparse: sparse_vector(text),
            dense: embed_text_local(text, self.config.dimensions),
        })
    }
}

pub fn sparse_vector(text: &str) -> SparseVector {
    let words = tokenize_words(text)
        .into_iter()
        .filter(|word| word.chars().count() > 1 && !STOP_WORDS.contains(&word.as_str()))
        .collect::<Vec<String>>();

    let mut terms = BTreeMap::<String, f32>::new();
    if words.is_empty() {
        return SparseVector { terms };
    }

    let total = words.len() as f32;
    for word in words {
        *terms.entry(word).or_default() += 1.0;
    }
    for weight in terms.values_mut() {
        *weight /= total;
    }

    SparseVector { terms }
}

pub fn embed_text_local(payload: &str, dimensions: usize) -> Vec<f32> {
    let dims = dimensions.max(8);
    let mut vector = vec![0_f32; dims];
    let tokens = feature_tokens(payload);

    if tokens.is_empty() {
        return vector;
    }

    for token in tokens {
        let hash = stable_hash(&token);
        let index = (hash as usize) % dims;
        let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        let weight = 1.0 + (((hash >> 48) & 0xFF) as f32 / 255.0);
        vector[index] += sign * weight;
    }

    normalize_vector(&mut vector);
    vector
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f64 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }

    left.iter()
        .zip(right.iter())
        .map(|(left_value, right_value)| f64::from(*left_value) * f64::from(*right_value))
        .sum::<f64>()
}

pub fn encode_embedding_blob(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::<u8>::with_capacity(values.len() * 4);
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

pub fn decode_embedding_blob(blob: &[u8], expected_dim: usize) -> Option<Vec<f32>> {
    if expected_dim == 0 || blob.len() != expected_dim.saturating_mul(4) {
        return None;
    }

    let out = blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect::<Vec<f32>>();

    if out.len() == expected_dim {
        Some(out)
    } else {
        None
    }
}

// Hash from sha2 rather than std's hasher so stored vectors stay comparable across builds.
fn stable_hash(value: &str) -> u64 {
    let digest = Sha256::digest(value.as_bytes());
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

fn tokenize_words(payload: &str) -> Vec<String> {
    let normalized = normalize_whitespace(payload);
    if normalized.is_empty() {
        return Vec::new();
    }

    normalized
        .split(' ')
        .map(|value| {
            value
                .chars()
                .filter(|character| character.is_alphanumeric())
                .flat_map(char::to_lowercase)
                .collect::<String>()
        })
        .filter(|value| !value.is_empty())
        .collect()
}

fn feature_tokens(payload: &str) -> Vec<String> {
    let words = tokenize_words(payload);
    let mut features = Vec::<String>::with_capacity(words.len() * 2);
    for (index, word) in words.iter().enumerate() {
        features.push(format!("w:{word}"));
        if let Some(next) = words.get(index + 1) {
            features.push(format!("b:{word}_{next}"));
        }
    }
    features
}

fn normalize_vector(values: &mut [f32]) {
    let squared_norm = values
        .iter()
        .map(|value| f64::from(*value) * f64::from(*value))
        .sum::<f64>();

    if squared_norm <= 0.0 {
        return;
    }

    let norm = squared_norm.sqrt() as f32;
    if norm == 0.0 {
        return;
    }

    for value in values {
        *value /= norm;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_embedding_is_deterministic_and_normalized() {
        let first = embed_text_local("registered tax identification number", 64);
        let second = embed_text_local("registered tax identification number", 64);
        assert_eq!(first, second);

        let norm = first.iter().map(|value| value * value).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn similar_text_scores_higher_than_unrelated_text() {
        let query = embed_text_local("confidentiality clause", 384);
        let close = embed_text_local("the confidentiality clause binds both parties", 384);
        let far = embed_text_local("settlement happens on business days", 384);
        assert!(cosine_similarity(&query, &close) > cosine_similarity(&query, &far));
    }

    #[test]
    fn sparse_vector_drops_stop_words_and_weights_repeats() {
        let sparse = sparse_vector("Is there a penalty? Penalty or fine");
        assert!(!sparse.terms.contains_key("is"));
        assert!(!sparse.terms.contains_key("there"));
        let penalty = sparse.terms.get("penalty").copied().unwrap_or_default();
        let fine = sparse.terms.get("fine").copied().unwrap_or_default();
        assert!(penalty > fine);
    }

    #[test]
    fn sparse_vector_keeps_accented_words() {
        let sparse = sparse_vector("cláusula de confidencialidade");
        assert!(sparse.terms.contains_key("cláusula"));
        assert!(sparse.terms.contains_key("confidencialidade"));
        assert!(!sparse.terms.contains_key("de"));
    }

    #[test]
    fn embedding_blob_round_trips_and_rejects_wrong_width() {
        let values = vec![0.25_f32, -1.5, 3.0];
        let blob = encode_embedding_blob(&values);
        assert_eq!(decode_embedding_blob(&blob, 3), Some(values));
        assert_eq!(decode_embedding_blob(&blob, 4), None);
    }
}
