use std::sync::Arc;

use scribe_core::PlanLimits;
use scribe_infra::quota::InMemoryUsageRepository;
use scribe_infra::results::InMemoryResultStore;
use scribe_infra::{Backends, Pipeline, PipelineConfig, PipelineResult};

/// Services shared by every route.
#[derive(Clone)]
pub struct AppServices {
    pub pipeline: Pipeline,
    /// Authoritative per-user records (articles, summary requests).
    pub usage: Arc<InMemoryUsageRepository>,
}

/// Connect the configured backing stores (Redis when `REDIS_URL` is set).
pub async fn build_services(config: PipelineConfig) -> PipelineResult<AppServices> {
    let usage = InMemoryUsageRepository::arc();
    let backends = Backends::connect(config.redis_url.as_deref(), InMemoryResultStore::arc(), usage.clone()).await?;
    Ok(AppServices {
        pipeline: Pipeline::new(config, backends, PlanLimits::default()),
        usage,
    })
}

/// Everything in process memory (dev/test).
pub fn in_memory_services(config: PipelineConfig) -> AppServices {
    let (pipeline, usage) = Pipeline::in_memory(config);
    AppServices { pipeline, usage }
}
