use serde::Deserialize;

use scribe_core::ArticleId;
use scribe_infra::{PipelineError, PipelineResult};

/// Longest article text accepted for summarization, in bytes.
pub const MAX_SUMMARY_TEXT: usize = 100_000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSummaryRequest {
    pub article_id: ArticleId,
    pub text: String,
}

impl CreateSummaryRequest {
    pub fn validate(&self) -> PipelineResult<()> {
        if self.text.trim().is_empty() {
            return Err(PipelineError::validation("text must not be empty"));
        }
        if self.text.len() > MAX_SUMMARY_TEXT {
            return Err(PipelineError::validation(format!(
                "text exceeds {MAX_SUMMARY_TEXT} bytes"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateArticleRequest {
    pub title: String,
    pub url: Option<String>,
}

impl CreateArticleRequest {
    pub fn validate(&self) -> PipelineResult<()> {
        if self.title.trim().is_empty() {
            return Err(PipelineError::validation("title must not be empty"));
        }
        if let Some(url) = &self.url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(PipelineError::validation("url must be http(s)"));
            }
        }
        Ok(())
    }
}
