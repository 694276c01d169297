//! HTTP routes.

pub mod health;
pub mod jobs;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Page images arrive base64-encoded inside the JSON body.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/jobs",
            post(jobs::submit_job)
                .get(jobs::list_jobs)
                .delete(jobs::delete_all_jobs),
        )
        .route("/jobs/:job_id", axum::routing::delete(jobs::delete_job))
        .route("/jobs/:job_id/status", get(jobs::job_status))
        .route("/models", get(health::models))
        .route("/health", get(health::health))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Runs blocking store or broker work off the async executor.
pub(crate) async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> ApiResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("Blocking task failed: {}", e)))?
}
