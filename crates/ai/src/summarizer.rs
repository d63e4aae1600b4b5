use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use scribe_core::{ArticleId, UserId};

use crate::result::{AiError, SummaryOutput};

/// Input to a summary completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryRequest {
    pub user_id: UserId,
    pub article_id: ArticleId,
    pub text: String,
}

/// External AI-completion call.
///
/// Implementations talk to a provider over the network and may block up to
/// the summary queue's job timeout.
#[async_trait]
pub trait Summarizer: Send + Sync + 'static {
    async fn summarize(&self, request: &SummaryRequest) -> Result<SummaryOutput, AiError>;
}

/// Deterministic in-process summarizer for tests/dev: keeps the leading sentences.
#[derive(Debug, Clone)]
pub struct ExtractiveSummarizer {
    max_sentences: usize,
    max_input_chars: usize,
}

impl Default for ExtractiveSummarizer {
    fn default() -> Self {
        Self {
            max_sentences: 3,
            max_input_chars: 100_000,
        }
    }
}

impl ExtractiveSummarizer {
    pub fn new(max_sentences: usize) -> Self {
        Self {
            max_sentences,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(&self, request: &SummaryRequest) -> Result<SummaryOutput, AiError> {
        let text = request.text.trim();
        if text.is_empty() {
            return Err(AiError::InvalidInput("text is empty".to_string()));
        }
        if text.len() > self.max_input_chars {
            return Err(AiError::InvalidInput(format!(
                "text exceeds {} characters",
                self.max_input_chars
            )));
        }

        let summary = text
            .split_inclusive(['.', '!', '?'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .take(self.max_sentences)
            .collect::<Vec<_>>()
            .join(" ");

        Ok(SummaryOutput::new(summary).with_model("extractive"))
    }
}
