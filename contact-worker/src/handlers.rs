use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing, Json, Router};
use health::{HealthRegistry, HealthStatus};

use crate::pipeline::Pipeline;
use crate::stats::PipelineSnapshot;

/// Everything the routes read from.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub liveness: HealthRegistry,
}

pub fn add_routes(router: Router, state: AppState) -> Router {
    router
        .route("/", routing::get(index))
        .route(
            "/_liveness",
            routing::get(liveness).with_state(state.liveness.clone()),
        )
        .route(
            "/_readiness",
            routing::get(readiness).with_state(state.pipeline.clone()),
        )
        .route("/stats", routing::get(stats).with_state(state.pipeline))
}

pub async fn index() -> &'static str {
    "contact sync worker"
}

async fn liveness(State(liveness): State<HealthRegistry>) -> HealthStatus {
    liveness.get_status()
}

/// Ready while the pipeline is running.
async fn readiness(State(pipeline): State<Arc<Pipeline>>) -> StatusCode {
    match pipeline.is_running() {
        true => StatusCode::OK,
        false => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn stats(State(pipeline): State<Arc<Pipeline>>) -> Json<PipelineSnapshot> {
    Json(pipeline.snapshot())
}
