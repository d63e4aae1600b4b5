//! `scribe-ai`
//!
//! **Responsibility:** boundary to the external AI-completion service.
//!
//! How text is summarized is not this workspace's concern. This crate only
//! defines the seam the summary job calls through, the shape of its output,
//! and the error vocabulary the job uses to decide what is worth retrying.

pub mod result;
pub mod summarizer;

pub use result::{AiError, SummaryOutput};
pub use summarizer::{ExtractiveSummarizer, SummaryRequest, Summarizer};
