//! Web layer
//!
//! Thin axum handlers over the shared `CacheService`:
//! - `GET /image?url=...` and `GET /{*path}` serve transformed images
//! - `GET /thumb/{id}.webp`, `POST /api/upload`, `GET /storage/{id}.{ext}`
//! - `POST /admin/cache/sync`, `POST /admin/cache/enabled`, `GET /admin/cache/stats`,
//!   `GET /admin/cache/entries`
//! - `GET /health`

use anyhow::Result;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::services::CacheService;

pub mod handlers;
pub mod responses;

pub use responses::{ApiResponse, X_CACHE};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<CacheService>,
}

pub fn create_router(cache: Arc<CacheService>) -> Router {
    let upload_limit = cache.uploads().max_upload_bytes();
    let state = AppState { cache };

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/image", get(handlers::images::image_by_query))
        .route("/thumb/{file}", get(handlers::storage::thumbnail))
        .route("/storage/{file}", get(handlers::storage::stored_image))
        .route(
            "/api/upload",
            post(handlers::storage::upload).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .nest("/admin/cache", admin_routes())
        .route("/{*path}", get(handlers::images::image_by_path))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/sync", post(handlers::admin::sync_cache))
        .route("/enabled", post(handlers::admin::set_enabled))
        .route("/stats", get(handlers::admin::cache_stats))
        .route("/entries", get(handlers::admin::list_entries))
}

/// Web server configuration and setup
pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(config: &Config, cache: Arc<CacheService>) -> Result<Self> {
        let addr: SocketAddr = config.listen_addr().parse()?;
        Ok(Self {
            app: create_router(cache),
            addr,
        })
    }

    /// Serve until `cancellation_token` fires, then finish in-flight requests
    pub async fn serve_with_cancellation(self, cancellation_token: CancellationToken) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.addr, e))?;
        info!("Listening on {}", self.addr);

        let shutdown_signal = async move {
            cancellation_token.cancelled().await;
            info!("Web server received cancellation signal, shutting down gracefully");
        };

        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal)
            .await?;
        Ok(())
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}
