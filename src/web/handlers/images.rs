//! Image proxy handlers
//!
//! Two request forms resolve to the same `TransformRequest`:
//! - `/image?url=https://a.test/x.png&w=100&format=png`
//! - `/https:_DS_a.test_DS_x.png?w=100` (source encoded in the path)

use axum::{
    extract::{Path, Query, RawQuery, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::errors::ProxyError;
use crate::models::{TransformParams, TransformRequest};
use crate::services::decode_path_source;
use crate::web::AppState;
use crate::web::responses::image_response;

/// GET /image?url=...
pub async fn image_by_query(
    State(state): State<AppState>,
    Query(params): Query<TransformParams>,
    headers: HeaderMap,
) -> Response {
    let Some(source) = params.url.as_deref().filter(|u| !u.trim().is_empty()) else {
        return ProxyError::invalid_request("missing 'url' query parameter").into_response();
    };
    serve(&state, source, &params, &headers).await
}

/// GET /{*path}
pub async fn image_by_path(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(params): Query<TransformParams>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let mut source = decode_path_source(&path);
    // The origin's own query string travels with ours; proxy parameters are stripped later
    if let Some(query) = raw_query.filter(|q| !q.is_empty()) {
        source.push('?');
        source.push_str(&query);
    }
    serve(&state, &source, &params, &headers).await
}

async fn serve(state: &AppState, source: &str, params: &TransformParams, headers: &HeaderMap) -> Response {
    let request = match TransformRequest::parse(source, params) {
        Ok(request) => request,
        Err(e) => return e.into_response(),
    };
    debug!("Resolving {}", request.source);

    match state.cache.resolve(&request).await {
        Ok(image) => image_response(image, headers),
        Err(e) => e.into_response(),
    }
}
