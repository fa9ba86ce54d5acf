//! Sync synthetic contact change events to the contact endpoints of the target systems.
use std::sync::Arc;

use axum::Router;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use contact_common::metrics::{serve, setup_metrics_routes};
use contact_worker::config::Config;
use contact_worker::error::PipelineError;
use contact_worker::handlers::{add_routes, AppState};
use contact_worker::ingest::ContactEventGenerator;
use contact_worker::pipeline::Pipeline;
use health::HealthRegistry;

#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::load()?;

    let liveness = HealthRegistry::new("liveness");
    let pipeline = Arc::new(Pipeline::from_config(
        &config,
        Box::new(ContactEventGenerator::new()),
        liveness.clone(),
    )?);

    let router = add_routes(
        Router::new(),
        AppState {
            pipeline: pipeline.clone(),
            liveness,
        },
    );
    let router = setup_metrics_routes(router).expect("failed to install metrics recorder");

    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    pipeline.start().await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {}", e);
    }
    info!("shutdown signal received");
    pipeline.stop().await;

    Ok(())
}
