//! Health probe endpoint: actually dials the configured backends rather than
//! answering unconditionally, since this gateway is useless without them.
//!
//! Grounded on `original_source/src/app.py`'s `/health` handler (parallel probes of
//! both local backends, the cloud backend checked only when a key is configured)
//! and `api/health.rs` for the axum handler shape.

use std::sync::Arc;

use axum::extract::State;
use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::backends::Target;
use crate::state::AppState;

/// `GET /health` — dials local-fast and local-reasoning (and the cloud backend, if
/// an API key is configured) in parallel. 200 `healthy` only if both local backends
/// respond; 503 `degraded` otherwise. The cloud backend's result is reported but
/// never downgrades the overall status — `xai` and `enrich` degrade independently
/// and the gateway still serves `primary` traffic without it.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (local_fast, local_reasoning, cloud) = tokio::join!(
        state.backend.health_check(Target::LocalFast),
        state.backend.health_check(Target::LocalReasoning),
        probe_cloud(&state),
    );

    let local_fast_ok = local_fast.is_ok();
    let local_reasoning_ok = local_reasoning.is_ok();
    let healthy = local_fast_ok && local_reasoning_ok;

    let body = json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "local_fast": describe(local_fast),
        "local_reasoning": describe(local_reasoning),
        "cloud": describe_optional(cloud),
    });

    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(body))
}

async fn probe_cloud(state: &AppState) -> Option<anyhow::Result<()>> {
    if !state.backend.cloud_configured() {
        return None;
    }
    Some(state.backend.health_check(Target::Cloud).await)
}

fn describe(result: anyhow::Result<()>) -> serde_json::Value {
    match result {
        Ok(()) => json!({"ok": true}),
        Err(e) => json!({"ok": false, "error": e.to_string()}),
    }
}

fn describe_optional(result: Option<anyhow::Result<()>>) -> serde_json::Value {
    match result {
        Some(r) => describe(r),
        None => json!({"ok": null, "configured": false}),
    }
}
