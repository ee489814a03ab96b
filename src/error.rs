use thiserror::Error;

/// Internal failure taxonomy for the filtering pipeline.
///
/// None of these ever reach a client: stage errors make the stage
/// inconclusive, and anything escaping the pipeline lets the request through.
#[derive(Debug, Error)]
pub enum WafError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("lookup via {source_name} exceeded {timeout_ms}ms")]
    LookupTimeout { source_name: String, timeout_ms: u64 },

    #[error("pipeline stage {stage} failed: {message}")]
    Pipeline { stage: &'static str, message: String },

    #[error("invalid rule {rule_id}: {message}")]
    Validation { rule_id: String, message: String },

    #[error("reputation store error: {0}")]
    Store(String),
}

impl WafError {
    pub fn pipeline(stage: &'static str, message: impl Into<String>) -> Self {
        Self::Pipeline {
            stage,
            message: message.into(),
        }
    }

    pub fn validation(rule_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            rule_id: rule_id.into(),
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for WafError {
    fn from(e: rusqlite::Error) -> Self {
        WafError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for WafError {
    fn from(e: serde_json::Error) -> Self {
        WafError::Store(format!("serialization: {}", e))
    }
}

pub type WafResult<T> = std::result::Result<T, WafError>;
