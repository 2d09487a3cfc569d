//! Cache administration handlers

use axum::{
    Json,
    extract::{Query, State},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::models::{EntryListParams, EntryListQuery};
use crate::web::AppState;
use crate::web::responses::ApiResponse;

#[derive(Debug, Clone, Deserialize)]
pub struct SetEnabledRequest {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnabledState {
    pub enabled: bool,
}

/// POST /admin/cache/sync
pub async fn sync_cache(State(state): State<AppState>) -> Response {
    match state.cache.sync().await {
        Ok(report) => {
            info!("Manual sync flushed {} entries", report.flushed);
            ApiResponse::success(report).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// POST /admin/cache/enabled
pub async fn set_enabled(State(state): State<AppState>, Json(body): Json<SetEnabledRequest>) -> Response {
    match state.cache.set_enabled(body.enabled).await {
        Ok(()) => ApiResponse::success(EnabledState {
            enabled: state.cache.is_enabled(),
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /admin/cache/stats
pub async fn cache_stats(State(state): State<AppState>) -> impl IntoResponse {
    ApiResponse::success(state.cache.stats())
}

/// GET /admin/cache/entries?page=1&page_size=20&sort=last_access&format=webp
pub async fn list_entries(State(state): State<AppState>, Query(params): Query<EntryListParams>) -> Response {
    let query = EntryListQuery::from_params(&params);
    match state.cache.list_entries(&query).await {
        Ok(page) => ApiResponse::success(page).into_response(),
        Err(e) => e.into_response(),
    }
}
