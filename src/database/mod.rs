//! SeaORM-backed durable index
//!
//! The index is a single SQLite database owned by this process. The file and its parent
//! directory are created on first start.

use anyhow::{Context, Result};
use sea_orm::{ConnectOptions, Database as SeaOrmDatabase, DatabaseConnection};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::DatabaseConfig;

pub mod entities;
pub mod migrations;
pub mod repositories;

/// Database connection manager
#[derive(Clone)]
pub struct Database {
    pub connection: Arc<DatabaseConnection>,
}

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        if !config.url.starts_with("sqlite:") {
            anyhow::bail!("Unsupported database URL format: {}", config.url);
        }

        info!("Connecting to SQLite index database");
        let connection_url = Self::ensure_sqlite_auto_creation(&config.url)?;

        // Every connection to :memory: is its own database
        let max_connections = if connection_url.contains(":memory:") {
            1
        } else {
            config.max_connections.unwrap_or(10)
        };

        let mut connect_options = ConnectOptions::new(&connection_url);
        connect_options
            .max_connections(max_connections)
            .min_connections(1)
            .connect_timeout(Duration::from_secs(5))
            .acquire_timeout(Duration::from_secs(3))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .sqlx_logging_level(tracing::log::LevelFilter::Debug);

        let connection = match SeaOrmDatabase::connect(connect_options).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!("Database connection failed: {:?}", e);
                let mut source = e.source();
                let mut level = 0;
                while let Some(err) = source {
                    tracing::error!("  Level {}: {}", level, err);
                    source = err.source();
                    level += 1;
                }
                return Err(anyhow::anyhow!("Failed to connect to database at '{}': {}", &config.url, e));
            }
        };

        debug!("Database connection established successfully");
        Ok(Self {
            connection: Arc::new(connection),
        })
    }

    /// Add `mode=rwc` so SQLite creates a missing file
    fn ensure_sqlite_auto_creation(url: &str) -> Result<String> {
        if url.contains("mode=") || url.contains(":memory:") {
            return Ok(url.to_string());
        }

        let file_path = if let Some(path) = url.strip_prefix("sqlite://") {
            path
        } else if let Some(path) = url.strip_prefix("sqlite:") {
            path
        } else {
            anyhow::bail!("Invalid SQLite URL format: {}", url);
        };
        let file_path = file_path.split('?').next().unwrap_or(file_path);

        let path = std::path::Path::new(file_path);
        if path.exists() {
            return Ok(url.to_string());
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create directory for SQLite database: {}", parent.display())
                })?;
                info!("Created directory for SQLite database: {}", parent.display());
            }
        }

        let auto_create_url = if url.contains('?') {
            format!("{url}&mode=rwc")
        } else {
            format!("{url}?mode=rwc")
        };
        debug!("SQLite URL with auto-creation: {}", auto_create_url);
        Ok(auto_create_url)
    }

    pub async fn migrate(&self) -> Result<()> {
        use migrations::Migrator;
        use sea_orm_migration::MigratorTrait;

        info!("Running database migrations");
        Migrator::up(&*self.connection, None)
            .await
            .context("Failed to run migrations")?;
        info!("Database migrations completed successfully");
        Ok(())
    }

    pub fn connection(&self) -> Arc<DatabaseConnection> {
        self.connection.clone()
    }

    /// Fresh, migrated in-memory database
    #[cfg(test)]
    pub async fn in_memory() -> Self {
        let db = Self::new(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: None,
        })
        .await
        .unwrap();
        db.migrate().await.unwrap();
        db
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_creation_url() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/nested/index.db", dir.path().display());

        let rewritten = Database::ensure_sqlite_auto_creation(&url).unwrap();

        assert!(rewritten.ends_with("?mode=rwc"));
        assert!(dir.path().join("nested").is_dir());
    }

    #[test]
    fn test_memory_and_explicit_mode_untouched() {
        assert_eq!(Database::ensure_sqlite_auto_creation("sqlite::memory:").unwrap(), "sqlite::memory:");
        assert_eq!(
            Database::ensure_sqlite_auto_creation("sqlite://x.db?mode=ro").unwrap(),
            "sqlite://x.db?mode=ro"
        );
    }

    #[tokio::test]
    async fn test_rejects_other_backends() {
        let config = DatabaseConfig {
            url: "postgres://localhost/db".to_string(),
            max_connections: None,
        };
        assert!(Database::new(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_file_database_migrates() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            url: format!("sqlite://{}/index.db", dir.path().display()),
            max_connections: Some(2),
        };
        let db = Database::new(&config).await.unwrap();
        db.migrate().await.unwrap();
        assert!(dir.path().join("index.db").exists());
    }
}
