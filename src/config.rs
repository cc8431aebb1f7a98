use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::error::AuditError;
use crate::llm::ChatSettings;
use crate::model::Criterion;
use crate::research::agent::DEFAULT_MAX_ATTEMPTS;
use crate::research::fusion::DEFAULT_RRF_K;
use crate::research::hints::DEFAULT_MAX_DOCUMENT_CHARS;
use crate::research::reformulator::DEFAULT_MAX_QUERIES;
use crate::research::retrieval::{DEFAULT_EVIDENCE_LIMIT, DEFAULT_TOP_K};
use crate::semantic::DEFAULT_MODEL_ID;
use crate::util::RetryPolicy;

pub const CONFIG_PATH_ENV: &str = "CONFIG_PATH";
const CONFIG_SEARCH_PATHS: [&str; 3] = ["config.yaml", "../config.yaml", "../../config.yaml"];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuditConfig {
    pub store: StoreConfig,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub output: OutputConfig,
    pub documents: Vec<DocumentConfig>,
    pub audit_criteria: Vec<CriterionConfig>,
    pub deep_agent: DeepAgentConfig,
    pub hints: HintsConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    pub pool_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".cache/docaudit/index.sqlite"),
            pool_size: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub model_id: String,
    pub dimensions: Option<usize>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            dimensions: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub api_key_env: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434/v1".to_string(),
            model: "llama3.1".to_string(),
            temperature: 0.0,
            max_tokens: 1024,
            api_key_env: "LLM_API_KEY".to_string(),
            timeout_secs: 120,
            max_retries: 3,
            retry_base_ms: 1000,
        }
    }
}

impl LlmConfig {
    pub fn chat_settings(&self) -> ChatSettings {
        ChatSettings {
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            timeout: Duration::from_secs(self.timeout_secs),
            api_key: env::var(&self.api_key_env)
                .ok()
                .filter(|key| !key.trim().is_empty()),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_base_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: PathBuf,
    pub save_json: bool,
    pub save_txt: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./output"),
            save_json: true,
            save_txt: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocumentConfig {
    pub path: PathBuf,
    pub doc_type: String,
    #[serde(default = "default_true")]
    pub skip_if_indexed: bool,
}

impl DocumentConfig {
    /// Documents are keyed in the index by file name.
    pub fn doc_id(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// A criterion is either a bare question or a question with its own threshold.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CriterionConfig {
    Query(String),
    Detailed {
        query: String,
        #[serde(default)]
        confidence: Option<f64>,
    },
}

impl CriterionConfig {
    fn query(&self) -> &str {
        match self {
            Self::Query(query) | Self::Detailed { query, .. } => query,
        }
    }

    fn confidence(&self) -> Option<f64> {
        match self {
            Self::Query(_) => None,
            Self::Detailed { confidence, .. } => *confidence,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeepAgentConfig {
    pub enabled: bool,
    pub max_attempts: usize,
    /// Threshold for criteria that do not carry their own.
    pub min_confidence: Option<f64>,
    pub top_k: usize,
    /// Chunks handed to the evaluator per round. Unset sizes it to the document.
    pub evidence_limit: Option<usize>,
    pub rrf_k: u32,
    pub max_reformulations: usize,
    pub summary_max_chars: usize,
    pub workers: usize,
    pub timeout_secs: Option<u64>,
}

impl Default for DeepAgentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            min_confidence: None,
            top_k: DEFAULT_TOP_K,
            evidence_limit: None,
            rrf_k: DEFAULT_RRF_K,
            max_reformulations: DEFAULT_MAX_QUERIES,
            summary_max_chars: 1_500,
            workers: 1,
            timeout_secs: None,
        }
    }
}

impl DeepAgentConfig {
    /// Single-pass mode runs exactly one round per criterion.
    pub fn effective_max_attempts(&self) -> usize {
        if self.enabled { self.max_attempts } else { 1 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HintsConfig {
    pub enabled: bool,
    pub max_document_chars: usize,
}

impl Default for HintsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_document_chars: DEFAULT_MAX_DOCUMENT_CHARS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub skip_indexing: bool,
    pub force_reindex: bool,
    pub display_metrics: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            skip_indexing: false,
            force_reindex: false,
            display_metrics: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Explicit path, then `$CONFIG_PATH`, then `config.yaml` in the working
/// directory or up to two parents.
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = env::var_os(CONFIG_PATH_ENV) {
        return Ok(PathBuf::from(path));
    }
    CONFIG_SEARCH_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.is_file())
        .with_context(|| {
            format!("config.yaml not found; pass --config or set {CONFIG_PATH_ENV}")
        })
}

pub fn load_config(path: &Path) -> Result<AuditConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    parse_config(&raw).with_context(|| format!("invalid config: {}", path.display()))
}

pub fn parse_config(raw: &str) -> Result<AuditConfig> {
    let config: AuditConfig = serde_yaml::from_str(raw).context("failed to parse config yaml")?;
    config.validate()?;
    Ok(config)
}

impl AuditConfig {
    pub fn validate(&self) -> Result<(), AuditError> {
        if self.chunking.chunk_size == 0 {
            return Err(AuditError::config("chunking.chunk_size must be positive"));
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err(AuditError::config(format!(
                "chunking.chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunking.chunk_overlap, self.chunking.chunk_size
            )));
        }
        let agent = &self.deep_agent;
        for (name, value) in [
            ("deep_agent.max_attempts", agent.max_attempts),
            ("deep_agent.top_k", agent.top_k),
            (
                "deep_agent.evidence_limit",
                agent.evidence_limit.unwrap_or(DEFAULT_EVIDENCE_LIMIT),
            ),
            ("deep_agent.max_reformulations", agent.max_reformulations),
            ("deep_agent.workers", agent.workers),
            ("store.pool_size", self.store.pool_size),
        ] {
            if value == 0 {
                return Err(AuditError::config(format!("{name} must be at least 1")));
            }
        }
        if let Some(threshold) = agent.min_confidence {
            check_threshold("deep_agent.min_confidence", threshold)?;
        }
        for document in &self.documents {
            if document.doc_type.trim().is_empty() {
                return Err(AuditError::config(format!(
                    "document {} has an empty doc_type",
                    document.path.display()
                )));
            }
        }
        self.criteria().map(|_| ())
    }

    /// Criteria in configured order with their effective thresholds.
    pub fn criteria(&self) -> Result<Vec<Criterion>, AuditError> {
        self.audit_criteria
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let text = entry.query().trim();
                if text.is_empty() {
                    return Err(AuditError::config(format!(
                        "audit_criteria[{index}] has empty query text"
                    )));
                }
                let threshold = entry
                    .confidence()
                    .or(self.deep_agent.min_confidence)
                    .ok_or_else(|| {
                        AuditError::config(format!(
                            "audit_criteria[{index}] has no confidence and deep_agent.min_confidence is unset"
                        ))
                    })?;
                check_threshold(&format!("audit_criteria[{index}].confidence"), threshold)?;
                Ok(Criterion {
                    index,
                    text: text.to_string(),
                    threshold,
                })
            })
            .collect()
    }
}

fn check_threshold(name: &str, threshold: f64) -> Result<(), AuditError> {
    if threshold.is_finite() && threshold > 0.0 && threshold <= 1.0 {
        Ok(())
    } else {
        Err(AuditError::config(format!(
            "{name} must be in (0, 1], got {threshold}"
        )))
    }
}

/// Rejects a run with nothing to audit before any work starts.
pub fn require_audit_inputs(config: &AuditConfig) -> Result<()> {
    if config.documents.is_empty() {
        bail!("no documents configured");
    }
    if config.audit_criteria.is_empty() {
        bail!("no audit_criteria configured");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
store:
  db_path: /tmp/audit.sqlite
documents:
  - path: docs/contract.pdf
    doc_type: contract
audit_criteria:
  - "Is there a registered tax ID?"
  - query: "Are penalties defined?"
    confidence: 0.9
deep_agent:
  max_attempts: 4
  min_confidence: 0.7
"#;

    #[test]
    fn sample_config_resolves_thresholds_and_defaults() {
        let config = parse_config(SAMPLE).expect("config");
        let criteria = config.criteria().expect("criteria");

        assert_eq!(criteria.len(), 2);
        assert_eq!(criteria[0].threshold, 0.7);
        assert_eq!(criteria[1].threshold, 0.9);
        assert_eq!(criteria[1].index, 1);
        assert_eq!(config.chunking.chunk_size, 1000);
        assert_eq!(config.deep_agent.rrf_k, 60);
        assert_eq!(config.deep_agent.effective_max_attempts(), 4);
        assert!(config.documents[0].skip_if_indexed);
        assert_eq!(config.documents[0].doc_id(), "contract.pdf");
    }

    #[test]
    fn criterion_without_any_threshold_is_rejected() {
        let raw = "audit_criteria:\n  - \"Is there a tax ID?\"\n";
        let error = parse_config(raw).expect_err("missing threshold");
        assert!(format!("{error:#}").contains("min_confidence is unset"));
    }

    #[test]
    fn threshold_out_of_range_is_rejected() {
        for bad in ["0", "1.5", "-0.2"] {
            let raw = format!("audit_criteria:\n  - query: tax id\n    confidence: {bad}\n");
            assert!(parse_config(&raw).is_err(), "threshold {bad} accepted");
        }
        let raw = "audit_criteria:\n  - query: tax id\n    confidence: 1.0\n";
        assert!(parse_config(raw).is_ok());
    }

    #[test]
    fn empty_criterion_text_is_rejected() {
        let raw = "deep_agent:\n  min_confidence: 0.7\naudit_criteria:\n  - \"   \"\n";
        assert!(parse_config(raw).is_err());
    }

    #[test]
    fn zero_attempt_budget_is_rejected() {
        let raw = "deep_agent:\n  max_attempts: 0\n";
        assert!(parse_config(raw).is_err());
    }

    #[test]
    fn single_pass_mode_runs_one_round() {
        let raw = "deep_agent:\n  enabled: false\n  max_attempts: 5\n";
        let config = parse_config(raw).expect("config");
        assert_eq!(config.deep_agent.effective_max_attempts(), 1);
    }

    #[test]
    fn example_config_is_valid() {
        let config = parse_config(include_str!("../config.example.yaml")).expect("example");
        let criteria = config.criteria().expect("criteria");
        assert_eq!(criteria.len(), 3);
        assert_eq!(criteria[1].threshold, 0.7);
        assert_eq!(config.documents[0].doc_type, "contract");
    }

    #[test]
    fn unknown_top_level_keys_are_rejected() {
        assert!(parse_config("milvus:\n  uri: http://localhost\n").is_err());
    }
}
