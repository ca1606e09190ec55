use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use storyboard_core::{ErrorKind, JobFailure, JobOutput, Loader, Worker};

pub fn router<L: Loader>(worker: Arc<Worker<L>>) -> Router {
    Router::new()
        .route("/run", post(run_job::<L>))
        .route("/runsync", post(run_job::<L>))
        .route("/health", get(health::<L>))
        .with_state(worker)
}

fn status_of(output: &JobOutput) -> StatusCode {
    match output {
        JobOutput::Success(_) => StatusCode::OK,
        JobOutput::Failure(failure) => match failure.kind {
            ErrorKind::Validation | ErrorKind::Decode => StatusCode::BAD_REQUEST,
            ErrorKind::Model => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

/// Runs one job envelope. Unparseable bodies still get an error envelope back.
async fn run_job<L: Loader>(State(worker): State<Arc<Worker<L>>>, body: Bytes) -> impl IntoResponse {
    let output = match serde_json::from_slice::<Value>(&body) {
        Ok(envelope) => worker.handle(&envelope).await,
        Err(e) => {
            tracing::warn!(error = %e, "rejected job with invalid JSON body");
            JobOutput::Failure(JobFailure {
                error: format!("invalid job envelope: {e}"),
                kind: ErrorKind::Validation,
            })
        }
    };
    (status_of(&output), Json(output))
}

async fn health<L: Loader>(State(worker): State<Arc<Worker<L>>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "variant": worker.cache().settings().variant.to_string(),
        "model_loaded": worker.cache().is_loaded(),
    }))
}
