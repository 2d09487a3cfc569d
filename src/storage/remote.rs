//! Centralized object store reached over HTTP
//!
//! Wire contract, every request carrying `X-API-Key` when a key is configured:
//!
//! | operation | request                   | success            |
//! |-----------|---------------------------|--------------------|
//! | store     | `PUT /api/file/{id}` body | 200/201/204        |
//! | get       | `GET /api/file/{id}`      | 200 + bytes        |
//! | exists    | `GET /api/exists/{id}`    | 200 (404 = absent) |
//! | delete    | `DELETE /api/file/{id}`   | 200/204            |

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::debug;

use super::{BlobMetadata, StorageBackend, blob_id, validate_id};
use crate::config::RemoteStorageConfig;
use crate::errors::{StorageError, StorageResult};

pub const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, Clone)]
pub struct RemoteBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl RemoteBackend {
    pub fn new(config: &RemoteStorageConfig) -> StorageResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| StorageError::remote("remote", format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => builder.header(API_KEY_HEADER, key),
            None => builder,
        }
    }

    fn transport_error(&self, err: reqwest::Error) -> StorageError {
        let message = if err.is_timeout() {
            format!("timeout: {err}")
        } else {
            err.to_string()
        };
        StorageError::remote(self.name(), message)
    }

    fn status_error(&self, id: &str, status: StatusCode) -> StorageError {
        if status == StatusCode::NOT_FOUND {
            StorageError::not_found(id)
        } else {
            StorageError::remote(self.name(), format!("HTTP {}", status.as_u16()))
        }
    }
}

#[async_trait]
impl StorageBackend for RemoteBackend {
    fn name(&self) -> &str {
        "remote"
    }

    async fn store(&self, data: Bytes, metadata: &BlobMetadata) -> StorageResult<String> {
        let id = blob_id(&data, metadata);
        validate_id(self.name(), &id)?;

        let mut request = self.request(reqwest::Method::PUT, &format!("/api/file/{id}"));
        if let Some(content_type) = &metadata.content_type {
            request = request.header(reqwest::header::CONTENT_TYPE, content_type);
        }
        let size = data.len();
        let response = request.body(data).send().await.map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            return Err(self.status_error(&id, response.status()));
        }
        debug!("Stored blob {} ({} bytes) in remote store", id, size);
        Ok(id)
    }

    async fn get(&self, id: &str) -> StorageResult<Bytes> {
        validate_id(self.name(), id)?;
        let response = self
            .request(reqwest::Method::GET, &format!("/api/file/{id}"))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            return Err(self.status_error(id, response.status()));
        }
        response.bytes().await.map_err(|e| self.transport_error(e))
    }

    async fn exists(&self, id: &str) -> bool {
        if validate_id(self.name(), id).is_err() {
            return false;
        }
        match self
            .request(reqwest::Method::GET, &format!("/api/exists/{id}"))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Remote exists check for {} failed: {}", id, e);
                false
            }
        }
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        validate_id(self.name(), id)?;
        let response = self
            .request(reqwest::Method::DELETE, &format!("/api/file/{id}"))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(self.status_error(id, response.status()))
        }
    }
}
