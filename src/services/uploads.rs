//! Uploaded originals and their transformed variants
//!
//! Uploads are stored in the tiered store under the SHA-256 of their content and served
//! back from `/storage/{id}.{ext}`. A request carrying transform parameters is answered
//! with a variant derived from the stored original. Variants are stored under the
//! storage id of their `/storage/{id}` cache key, so each is transformed once.

use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::cache_key::{CacheKey, content_id};
use super::proxy_pipeline::etag_for;
use crate::codec::{SourceFormat, TransformCodec};
use crate::errors::{ProxyError, ProxyResult, StorageError};
use crate::models::{CacheStatus, ResolvedImage, TransformParams, TransformRequest};
use crate::storage::{BlobMetadata, TieredStore};

/// One file field of an upload request
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: Option<String>,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    /// Paths the stored images are served from, in upload order
    pub urls: Vec<String>,
    pub count: usize,
    /// Names of the files that were skipped
    pub rejected: Vec<String>,
}

pub struct UploadService {
    store: Arc<TieredStore>,
    codec: Arc<TransformCodec>,
    cache_control: String,
    max_upload_bytes: usize,
}

impl UploadService {
    pub fn new(
        store: Arc<TieredStore>,
        codec: Arc<TransformCodec>,
        cache_control: String,
        max_upload_bytes: usize,
    ) -> Self {
        Self {
            store,
            codec,
            cache_control,
            max_upload_bytes,
        }
    }

    /// Request body limit for upload requests
    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_bytes
    }

    /// Store every file whose leading bytes identify an image.
    ///
    /// Non-image files are reported in `rejected`. The call fails only when nothing was
    /// stored: `InvalidRequest` if no file was an image, the last storage error otherwise.
    pub async fn upload(&self, files: Vec<UploadedFile>) -> ProxyResult<UploadReport> {
        let mut report = UploadReport::default();
        let mut last_error: Option<StorageError> = None;

        for (position, file) in files.into_iter().enumerate() {
            let name = file.filename.clone().unwrap_or_else(|| format!("file {}", position + 1));
            let format = SourceFormat::detect(&file.bytes);
            if !format.content_type().starts_with("image/") {
                debug!("Skipping upload {}: detected {}", name, format.content_type());
                report.rejected.push(name);
                continue;
            }

            let metadata = BlobMetadata::default().content_type(format.content_type());
            match self.store.store(file.bytes, &metadata).await {
                Ok(stored) => {
                    if stored.degraded {
                        warn!("Upload {} stored without a durable copy", stored.id);
                    }
                    report.urls.push(format!("/storage/{}.{}", stored.id, extension(format)));
                }
                Err(e) => {
                    warn!("Storing upload {} failed: {}", name, e);
                    report.rejected.push(name);
                    last_error = Some(e);
                }
            }
        }

        report.count = report.urls.len();
        if report.count == 0 {
            return Err(match last_error {
                Some(e) => ProxyError::DurableStore(e),
                None => ProxyError::invalid_request("upload contained no image files"),
            });
        }
        info!("Stored {} uploaded image(s)", report.count);
        Ok(report)
    }

    /// Serve `/storage/{file}`: the original, or a variant when transform parameters are given
    pub async fn fetch(&self, file: &str, params: &TransformParams) -> ProxyResult<ResolvedImage> {
        let id = content_id(file).ok_or_else(|| ProxyError::not_found(format!("/storage/{file}")))?;
        let path = format!("/storage/{id}");

        if !params.has_transform() {
            let bytes = self.read(id, &path).await?;
            return Ok(self.resolved(bytes, None, CacheStatus::Hit, path));
        }

        let request = TransformRequest::from_params(path.as_str(), params)?;
        let key = CacheKey::for_request(&request);
        let variant_id = key.storage_id();

        match self.store.get(&variant_id).await {
            Ok(bytes) => return Ok(self.resolved(bytes, None, CacheStatus::Hit, key.to_string())),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!("Reading variant {} failed, regenerating: {}", key, e),
        }

        let original = self.read(id, &path).await?;
        let codec = Arc::clone(&self.codec);
        let output = tokio::task::spawn_blocking(move || codec.transform(&original, &request))
            .await
            .map_err(|e| ProxyError::encode(format!("transform task failed: {e}")))??;

        let metadata = BlobMetadata::with_id(&variant_id).content_type(output.content_type);
        if let Err(e) = self.store.store(output.bytes.clone(), &metadata).await {
            warn!("Storing variant {} failed: {}", key, e);
        }
        debug!("Generated variant {} ({} bytes)", key, output.bytes.len());

        Ok(self.resolved(
            output.bytes,
            Some(output.content_type),
            CacheStatus::Miss,
            key.to_string(),
        ))
    }

    async fn read(&self, id: &str, path: &str) -> ProxyResult<Bytes> {
        match self.store.get(id).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.is_not_found() => Err(ProxyError::not_found(path)),
            Err(e) => Err(e.into()),
        }
    }

    fn resolved(
        &self,
        bytes: Bytes,
        content_type: Option<&str>,
        cache_status: CacheStatus,
        key: String,
    ) -> ResolvedImage {
        let content_type = content_type
            .unwrap_or_else(|| SourceFormat::detect(&bytes).content_type())
            .to_string();
        ResolvedImage {
            etag: etag_for(&bytes),
            bytes,
            content_type,
            cache_control: self.cache_control.clone(),
            cache_status,
            key,
        }
    }
}

/// File extension for URLs of stored images
fn extension(format: SourceFormat) -> &'static str {
    match format {
        SourceFormat::Jpeg => "jpg",
        SourceFormat::Other(mime) => mime.rsplit('/').next().unwrap_or("bin"),
        other => other.name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{TestHarness, png_bytes};

    fn file(name: &str, bytes: impl Into<Bytes>) -> UploadedFile {
        UploadedFile {
            filename: Some(name.to_string()),
            bytes: bytes.into(),
        }
    }

    fn width(value: &str) -> TransformParams {
        TransformParams {
            w: Some(value.to_string()),
            ..TransformParams::default()
        }
    }

    fn stored_file(url: &str) -> &str {
        url.trim_start_matches("/storage/")
    }

    #[tokio::test]
    async fn test_upload_then_fetch_original() {
        let harness = TestHarness::new(|_| {}).await;
        let uploads = harness.service.uploads();
        let png = png_bytes(30, 20);

        let report = uploads.upload(vec![file("a.png", png.clone())]).await.unwrap();

        assert_eq!(report.count, 1);
        assert!(report.rejected.is_empty());
        assert!(report.urls[0].starts_with("/storage/"));
        assert!(report.urls[0].ends_with(".png"));

        let served = uploads
            .fetch(stored_file(&report.urls[0]), &TransformParams::default())
            .await
            .unwrap();
        assert_eq!(served.bytes.as_ref(), png.as_slice());
        assert_eq!(served.content_type, "image/png");
        assert_eq!(served.etag, etag_for(&png));
    }

    #[tokio::test]
    async fn test_identical_uploads_share_an_id() {
        let harness = TestHarness::new(|_| {}).await;
        let png = png_bytes(8, 8);

        let report = harness
            .service
            .uploads()
            .upload(vec![file("a.png", png.clone()), file("b.png", png)])
            .await
            .unwrap();

        assert_eq!(report.count, 2);
        assert_eq!(report.urls[0], report.urls[1]);
    }

    #[tokio::test]
    async fn test_variant_is_generated_once() {
        let harness = TestHarness::new(|_| {}).await;
        let uploads = harness.service.uploads();
        let report = uploads.upload(vec![file("a.png", png_bytes(40, 20))]).await.unwrap();
        let stored = stored_file(&report.urls[0]);

        let first = uploads.fetch(stored, &width("10")).await.unwrap();
        let second = uploads.fetch(stored, &width("10")).await.unwrap();

        assert_eq!(first.cache_status, CacheStatus::Miss);
        assert_eq!(second.cache_status, CacheStatus::Hit);
        assert_eq!(first.bytes, second.bytes);
        assert_eq!(second.content_type, "image/webp");

        let decoded = image::load_from_memory(&second.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (10, 5));
    }

    #[tokio::test]
    async fn test_non_images_are_rejected() {
        let harness = TestHarness::new(|_| {}).await;
        let uploads = harness.service.uploads();

        let mixed = uploads
            .upload(vec![file("notes.txt", &b"plain text"[..]), file("a.png", png_bytes(4, 4))])
            .await
            .unwrap();
        assert_eq!(mixed.count, 1);
        assert_eq!(mixed.rejected, vec!["notes.txt".to_string()]);

        let err = uploads
            .upload(vec![file("notes.txt", &b"plain text"[..])])
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_unknown_or_malformed_ids_are_not_found() {
        let harness = TestHarness::new(|_| {}).await;
        let uploads = harness.service.uploads();
        let missing = "0".repeat(64);

        for name in [format!("{missing}.png"), "not-a-digest.png".to_string()] {
            let err = uploads.fetch(&name, &TransformParams::default()).await.unwrap_err();
            assert!(matches!(err, ProxyError::NotFound { .. }), "{name}: {err}");
        }

        let err = uploads.fetch(&missing, &width("10")).await.unwrap_err();
        assert!(matches!(err, ProxyError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_invalid_transform_parameters_are_client_errors() {
        let harness = TestHarness::new(|_| {}).await;
        let uploads = harness.service.uploads();
        let report = uploads.upload(vec![file("a.png", png_bytes(4, 4))]).await.unwrap();

        let err = uploads.fetch(stored_file(&report.urls[0]), &width("0")).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidRequest { .. }));
    }

    #[test]
    fn test_extensions() {
        assert_eq!(extension(SourceFormat::Jpeg), "jpg");
        assert_eq!(extension(SourceFormat::Webp), "webp");
        assert_eq!(extension(SourceFormat::Other("image/bmp")), "bmp");
    }
}
