use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "docaudit",
    version,
    about = "Audit PDF documents against compliance criteria with hybrid retrieval and an LLM judge"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Ingest(IngestArgs),
    Query(QueryArgs),
    Audit(AuditArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct IngestArgs {
    /// Audit config; falls back to $CONFIG_PATH or ./config.yaml.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// PDFs to index instead of the configured documents.
    #[arg(long = "pdf")]
    pub pdfs: Vec<PathBuf>,

    #[arg(long, default_value = "document")]
    pub doc_type: String,

    #[arg(long, default_value_t = false)]
    pub force_reindex: bool,

    #[arg(long)]
    pub max_pages_per_doc: Option<usize>,

    #[arg(long)]
    pub manifest_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct QueryArgs {
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub query: String,

    /// Auxiliary query searched alongside the main one, as a hint answer would be.
    #[arg(long)]
    pub also: Option<String>,

    #[arg(long)]
    pub doc_id: Option<String>,

    #[arg(long = "type")]
    pub doc_type: Option<String>,

    #[arg(long)]
    pub page: Option<u32>,

    #[arg(long, default_value_t = 10)]
    pub top_k: usize,

    #[arg(long, default_value_t = 5)]
    pub evidence_limit: usize,

    #[arg(long, default_value_t = 60)]
    pub rrf_k: u32,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

/// Agent tunables left unset here take their value from the config file.
#[derive(Args, Debug, Clone)]
pub struct AuditArgs {
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub rrf_k: Option<u32>,

    #[arg(long)]
    pub top_k: Option<usize>,

    #[arg(long)]
    pub evidence_limit: Option<usize>,

    #[arg(long)]
    pub max_attempts: Option<usize>,

    #[arg(long)]
    pub workers: Option<usize>,

    /// Wall-clock budget for the whole audit.
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    #[arg(long, default_value_t = false)]
    pub no_hints: bool,

    #[arg(long, default_value_t = false)]
    pub skip_indexing: bool,

    #[arg(long)]
    pub output_dir: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub db_path: Option<PathBuf>,
}
