//! Infrastructure layer: shared stores, cache, locks, quotas, job queues.

pub mod cache;
pub mod config;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod kv;
pub mod lock;
pub mod pipeline;
pub mod quota;
pub mod results;
pub mod status;

pub use config::{ConfigError, PipelineConfig};
pub use error::{PipelineError, PipelineResult};
pub use pipeline::{Backends, Collaborators, Pipeline, PipelineRuntime};
