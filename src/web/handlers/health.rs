//! Health check handler

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::web::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub index: &'static str,
    pub cache_enabled: bool,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Reports unhealthy when the durable index cannot be queried
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let index_ok = state.cache.index().count().await.is_ok();
    let status = if index_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = HealthResponse {
        status: if index_ok { "healthy" } else { "unhealthy" },
        index: if index_ok { "connected" } else { "unavailable" },
        cache_enabled: state.cache.is_enabled(),
        timestamp: chrono::Utc::now(),
    };
    (status, Json(body))
}
