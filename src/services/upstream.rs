//! Origin fetches
//!
//! `UpstreamFetcher` is the seam the pipeline depends on; `HttpFetcher` is the reqwest
//! implementation. Failures are reported as `ProxyError::UpstreamFetch` so they are never
//! confused with our own errors.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::config::UpstreamConfig;
use crate::errors::{ProxyError, ProxyResult, UpstreamFailure};

#[async_trait]
pub trait UpstreamFetcher: Send + Sync {
    /// GET `url` and return the full body
    async fn fetch(&self, url: &str) -> ProxyResult<Bytes>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    max_body_bytes: usize,
}

impl HttpFetcher {
    pub fn new(config: &UpstreamConfig) -> ProxyResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout.min(Duration::from_secs(5)))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| ProxyError::encode(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            max_body_bytes: config.max_source_bytes(),
        })
    }

    fn classify(url: &str, err: &reqwest::Error) -> ProxyError {
        let kind = if err.is_timeout() {
            UpstreamFailure::Timeout
        } else {
            UpstreamFailure::Network(err.to_string())
        };
        ProxyError::upstream(url, kind)
    }
}

#[async_trait]
impl UpstreamFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> ProxyResult<Bytes> {
        debug!("Fetching upstream {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Self::classify(url, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::upstream(url, UpstreamFailure::Status(status.as_u16())));
        }

        let limit = self.max_body_bytes;
        let too_large = || ProxyError::upstream(url, UpstreamFailure::TooLarge { limit });
        if response.content_length().is_some_and(|len| len > limit as u64) {
            return Err(too_large());
        }

        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Self::classify(url, &e))?;
            if body.len() + chunk.len() > limit {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }

        debug!("Fetched {} bytes from {}", body.len(), url);
        Ok(body.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, http::StatusCode, routing::get};

    async fn spawn_origin() -> String {
        let app = Router::new()
            .route("/ok.png", get(|| async { vec![1u8, 2, 3, 4] }))
            .route("/big.png", get(|| async { vec![0u8; 4096] }))
            .route("/missing.png", get(|| async { StatusCode::NOT_FOUND }))
            .route(
                "/slow.png",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn fetcher(timeout: Duration, max_source_size_mb: u64) -> HttpFetcher {
        HttpFetcher::new(&UpstreamConfig {
            timeout,
            max_source_size_mb,
            ..UpstreamConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let origin = spawn_origin().await;
        let body = fetcher(Duration::from_secs(5), 1)
            .fetch(&format!("{origin}/ok.png"))
            .await
            .unwrap();
        assert_eq!(body.as_ref(), &[1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_status_is_upstream_error() {
        let origin = spawn_origin().await;
        let err = fetcher(Duration::from_secs(5), 1)
            .fetch(&format!("{origin}/missing.png"))
            .await
            .unwrap_err();
        assert!(err.is_upstream_error());
        assert!(matches!(
            err,
            ProxyError::UpstreamFetch { kind: UpstreamFailure::Status(404), .. }
        ));
    }

    #[tokio::test]
    async fn test_timeout_is_distinguished() {
        let origin = spawn_origin().await;
        let err = fetcher(Duration::from_millis(200), 1)
            .fetch(&format!("{origin}/slow.png"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProxyError::UpstreamFetch { kind: UpstreamFailure::Timeout, .. }
        ));
    }

    #[tokio::test]
    async fn test_body_limit() {
        let origin = spawn_origin().await;
        let mut small = fetcher(Duration::from_secs(5), 1);
        small.max_body_bytes = 1024;
        let err = small.fetch(&format!("{origin}/big.png")).await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::UpstreamFetch { kind: UpstreamFailure::TooLarge { .. }, .. }
        ));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_error() {
        let err = fetcher(Duration::from_secs(2), 1)
            .fetch("http://127.0.0.1:9/none.png")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProxyError::UpstreamFetch { kind: UpstreamFailure::Network(_), .. }
        ));
    }
}
