use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use super::blocking;
use crate::error::ApiResult;
use crate::state::AppState;

/// GET /health
pub async fn health(State(state): State<AppState>) -> ApiResult<(StatusCode, Json<Value>)> {
    let report = blocking(move || Ok(state.health())).await?;
    let (code, status) = if report.is_healthy() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    Ok((
        code,
        Json(json!({
            "status": status,
            "components": report,
            "version": env!("CARGO_PKG_VERSION"),
        })),
    ))
}

/// GET /models
pub async fn models(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "models": state.submitter().catalog().ids() }))
}
