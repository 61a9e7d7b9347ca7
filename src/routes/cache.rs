use axum::{extract::State, routing::get, Json, Router};

use crate::cache::CacheMetricsSnapshot;
use crate::errors::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/metrics", get(cache_metrics))
}

/// GET /api/cache/metrics - hit rate and entry counts for dashboards.
/// Read-only; nothing here is load-bearing for correctness.
async fn cache_metrics(
    State(state): State<AppState>,
) -> Result<Json<CacheMetricsSnapshot>, AppError> {
    let snapshot = state
        .cache
        .metrics()
        .await
        .map_err(|e| AppError::External(e.to_string()))?;
    Ok(Json(snapshot))
}
