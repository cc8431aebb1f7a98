/// Failures crossing the retrieval/evaluation seams.
///
/// Command code works in `anyhow`; these variants exist so the research loop can
/// tell a retryable hiccup from a bad answer without inspecting strings.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("transient failure in {stage}: {reason}")]
    Transient { stage: &'static str, reason: String },

    #[error("evidence store failure: {reason}")]
    Store { reason: String },

    #[error("language model request failed: {reason}")]
    Llm { reason: String },

    #[error("malformed model output: {reason}")]
    MalformedOutput { reason: String },

    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    #[error("cancelled in {stage} after {attempts} attempt(s)")]
    Cancelled { stage: String, attempts: u32 },
}

impl AuditError {
    pub fn transient(stage: &'static str, reason: impl Into<String>) -> Self {
        Self::Transient {
            stage,
            reason: reason.into(),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedOutput {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    pub fn cancelled(stage: &str, attempts: u32) -> Self {
        Self::Cancelled {
            stage: stage.to_string(),
            attempts,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl From<rusqlite::Error> for AuditError {
    fn from(error: rusqlite::Error) -> Self {
        let busy = matches!(
            error.sqlite_error_code(),
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
        );
        if busy {
            Self::transient("evidence store", error.to_string())
        } else {
            Self::Store {
                reason: error.to_string(),
            }
        }
    }
}
