//! Thumbnails, uploads and stored originals
//!
//! - `GET /thumb/{id}.webp` serves the thumbnail stored next to a cached image
//! - `POST /api/upload` stores multipart `images` fields by content hash
//! - `GET /storage/{id}.{ext}` serves an upload, transformed when parameters are given

use axum::{
    Json,
    extract::{Multipart, Path, Query, State, multipart::MultipartError},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::models::TransformParams;
use crate::services::UploadedFile;
use crate::web::AppState;
use crate::web::responses::{ApiResponse, image_response};

/// Multipart field carrying uploaded images
pub const UPLOAD_FIELD: &str = "images";

/// GET /thumb/{file}
pub async fn thumbnail(State(state): State<AppState>, Path(file): Path<String>, headers: HeaderMap) -> Response {
    match state.cache.thumbnail(&file).await {
        Ok(image) => image_response(image, &headers),
        Err(e) => e.into_response(),
    }
}

/// POST /api/upload
pub async fn upload(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let mut files = Vec::new();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return multipart_error(e),
        };
        if field.name() != Some(UPLOAD_FIELD) {
            debug!("Ignoring upload field {:?}", field.name());
            continue;
        }

        let filename = field.file_name().map(str::to_string);
        match field.bytes().await {
            Ok(bytes) => files.push(UploadedFile { filename, bytes }),
            Err(e) => return multipart_error(e),
        }
    }

    match state.cache.uploads().upload(files).await {
        Ok(report) => ApiResponse::success(report).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /storage/{file}
pub async fn stored_image(
    State(state): State<AppState>,
    Path(file): Path<String>,
    Query(params): Query<TransformParams>,
    headers: HeaderMap,
) -> Response {
    match state.cache.uploads().fetch(&file, &params).await {
        Ok(image) => image_response(image, &headers),
        Err(e) => e.into_response(),
    }
}

fn multipart_error(error: MultipartError) -> Response {
    debug!("Rejecting upload: {}", error);
    (error.status(), Json(ApiResponse::error(error.body_text()))).into_response()
}
