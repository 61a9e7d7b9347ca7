use axum::Router;
use tower_http::cors::CorsLayer;

use crate::routes::{cache, health, reports};
use crate::state::AppState;

pub fn create_app(state: AppState) -> Router {
    Router::<AppState>::new()
        .nest("/health", health::router())
        .nest("/api/reports", reports::router())
        .nest("/api/cache", cache::router())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
