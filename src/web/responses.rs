//! HTTP response types and error mapping

use axum::{
    Json,
    body::Body,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::errors::{ProxyError, UpstreamFailure};
use crate::models::ResolvedImage;

/// Header reporting whether a response came from the cache
pub const X_CACHE: &str = "x-cache";

/// Standard JSON wrapper for admin and error responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now(),
        }
    }
}

impl ApiResponse<()> {
    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now(),
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let status = if self.success {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, Json(self)).into_response()
    }
}

pub fn status_for(error: &ProxyError) -> StatusCode {
    match error {
        ProxyError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
        ProxyError::NotFound { .. } => StatusCode::NOT_FOUND,
        ProxyError::Decode { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        ProxyError::UpstreamFetch {
            kind: UpstreamFailure::Timeout,
            ..
        } => StatusCode::GATEWAY_TIMEOUT,
        ProxyError::UpstreamFetch { .. } => StatusCode::BAD_GATEWAY,
        ProxyError::Encode { .. }
        | ProxyError::DurableStore(_)
        | ProxyError::CacheInconsistency { .. }
        | ProxyError::Index(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status.is_server_error() && !self.is_upstream_error() {
            error!("Request failed: {}", self);
        } else {
            warn!("Request rejected ({}): {}", status.as_u16(), self);
        }

        let message = match &self {
            // Internal details stay in the log
            ProxyError::DurableStore(_) | ProxyError::Index(_) => "Internal storage failure".to_string(),
            other => other.to_string(),
        };
        (status, Json(ApiResponse::error(message))).into_response()
    }
}

/// Image body with cache headers, or an empty 304 when `If-None-Match` matches
pub fn image_response(image: ResolvedImage, request_headers: &HeaderMap) -> Response {
    let mut headers = HeaderMap::new();
    insert_header(&mut headers, header::CACHE_CONTROL, &image.cache_control);
    insert_header(&mut headers, header::ETAG, &image.etag);
    headers.insert(X_CACHE, HeaderValue::from_static(image.cache_status.into()));

    if etag_matches(request_headers, &image.etag) {
        return (StatusCode::NOT_MODIFIED, headers).into_response();
    }

    insert_header(&mut headers, header::CONTENT_TYPE, &image.content_type);
    (StatusCode::OK, headers, Body::from(image.bytes)).into_response()
}

fn insert_header(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(e) => warn!("Skipping invalid {} header value {:?}: {}", name, value, e),
    }
}

fn etag_matches(request_headers: &HeaderMap, etag: &str) -> bool {
    request_headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|candidates| {
            candidates
                .split(',')
                .map(str::trim)
                .any(|candidate| candidate == "*" || candidate.trim_start_matches("W/") == etag)
        })
}
