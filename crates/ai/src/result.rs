use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Output of one completion call.
///
/// This is *not* the durable record. The summary job wraps it into a result
/// row owned by the requesting user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryOutput {
    pub summary: String,

    /// Model identifier reported by the provider, if any.
    pub model: Option<String>,

    /// Free-form metadata (token counts, timings, etc).
    pub metadata: JsonValue,
}

impl SummaryOutput {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            model: None,
            metadata: JsonValue::Null,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AiError {
    /// The request itself is unusable (empty text, too long, rejected by the provider's validation).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The provider answered with a server-side failure.
    #[error("upstream error (status {status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("rate limited by provider")]
    RateLimited,

    #[error("provider unreachable: {0}")]
    Unavailable(String),
}
