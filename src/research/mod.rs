//! Per-criterion research loop: hybrid retrieval, rank fusion, LLM judgment and
//! query reformulation, bounded by an attempt budget and a confidence gate.

pub mod agent;
pub mod evaluator;
pub mod fusion;
pub mod hints;
pub mod prompts;
pub mod reformulator;
pub mod retrieval;

#[cfg(test)]
mod test_support;

pub use agent::{AgentSettings, DeepResearchAgent};
pub use evaluator::LlmEvaluator;
pub use hints::{DocumentText, HintBook, HintLookup, LlmHintGenerator, NoHints, generate_hints};
pub use reformulator::LlmReformulator;
pub use retrieval::{HybridRetriever, RetrievalSettings};
