use std::sync::Arc;

use anyhow::Context;

use scribe_infra::{Collaborators, PipelineConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    scribe_observability::init();

    let config = PipelineConfig::from_env().context("invalid configuration")?;
    let bind_addr = config.bind_addr;

    let services = Arc::new(
        scribe_api::app::services::build_services(config)
            .await
            .context("failed to initialize backing stores")?,
    );
    let runtime = services.pipeline.start(Collaborators::default());
    let app = scribe_api::app::build_app(services);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("draining job workers");
    runtime.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}
