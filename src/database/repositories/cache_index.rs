//! SeaORM repository for the durable cache index
//!
//! Every call is wrapped in `with_retry`, so SQLite "database is locked" contention is
//! absorbed here rather than surfacing to the request path.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Select,
    Set, TransactionTrait,
};
use std::sync::Arc;
use tracing::debug;

use crate::config::defaults::DEFAULT_SYNC_BATCH_SIZE;
use crate::database::entities::cache_entries;
use crate::database::entities::prelude::CacheEntries;
use crate::errors::{RepositoryError, RepositoryResult};
use crate::models::{CacheEntry, EntryListQuery, EntrySort};
use crate::utils::{RetryConfig, with_retry};

#[derive(Clone)]
pub struct CacheIndexRepository {
    connection: Arc<DatabaseConnection>,
    batch_size: usize,
    read_retry: RetryConfig,
    write_retry: RetryConfig,
}

impl CacheIndexRepository {
    pub fn new(connection: Arc<DatabaseConnection>) -> Self {
        Self {
            connection,
            batch_size: DEFAULT_SYNC_BATCH_SIZE,
            read_retry: RetryConfig::for_reads(),
            write_retry: RetryConfig::for_writes(),
        }
    }

    /// Rows per INSERT statement inside a batch transaction
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Insert or replace every entry in one transaction. Nothing is written if any
    /// statement fails.
    pub async fn upsert_batch(&self, entries: &[CacheEntry]) -> RepositoryResult<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let connection = &self.connection;
        let batch_size = self.batch_size;
        with_retry(
            &self.write_retry,
            || async move {
                let txn = connection.begin().await?;
                for chunk in entries.chunks(batch_size) {
                    CacheEntries::insert_many(chunk.iter().map(to_active_model))
                        .on_conflict(upsert_conflict())
                        .exec_without_returning(&txn)
                        .await?;
                }
                txn.commit().await?;
                Ok::<_, RepositoryError>(entries.len())
            },
            "upsert cache index batch",
        )
        .await
        .inspect(|written| debug!("Upserted {} cache index rows", written))
    }

    pub async fn upsert(&self, entry: &CacheEntry) -> RepositoryResult<()> {
        self.upsert_batch(std::slice::from_ref(entry)).await.map(|_| ())
    }

    pub async fn find(&self, key: &str) -> RepositoryResult<Option<CacheEntry>> {
        let connection = &self.connection;
        let model = with_retry(
            &self.read_retry,
            || async move { Ok::<_, RepositoryError>(CacheEntries::find_by_id(key.to_string()).one(&**connection).await?) },
            "find cache index row",
        )
        .await?;
        Ok(model.map(to_domain))
    }

    /// Returns whether a row was removed
    pub async fn delete(&self, key: &str) -> RepositoryResult<bool> {
        let connection = &self.connection;
        let result = with_retry(
            &self.write_retry,
            || async move { Ok::<_, RepositoryError>(CacheEntries::delete_by_id(key.to_string()).exec(&**connection).await?) },
            "delete cache index row",
        )
        .await?;
        Ok(result.rows_affected > 0)
    }

    /// Bump access metadata for a hit served straight from the index
    pub async fn record_access(&self, key: &str, now: DateTime<Utc>) -> RepositoryResult<Option<CacheEntry>> {
        let connection = &self.connection;
        let result = with_retry(
            &self.write_retry,
            || async move {
                Ok::<_, RepositoryError>(CacheEntries::update_many()
                    .col_expr(
                        cache_entries::Column::AccessCount,
                        Expr::col(cache_entries::Column::AccessCount).add(1),
                    )
                    .col_expr(cache_entries::Column::LastAccess, Expr::value(now))
                    .filter(cache_entries::Column::CacheKey.eq(key))
                    .exec(&**connection)
                    .await?)
            },
            "record cache index access",
        )
        .await?;

        if result.rows_affected == 0 {
            return Ok(None);
        }
        self.find(key).await
    }

    /// Rows not accessed since `cutoff`, oldest first
    pub async fn find_stale(&self, cutoff: DateTime<Utc>, limit: u64) -> RepositoryResult<Vec<CacheEntry>> {
        let connection = &self.connection;
        let models = with_retry(
            &self.read_retry,
            || async move {
                Ok::<_, RepositoryError>(CacheEntries::find()
                    .filter(cache_entries::Column::LastAccess.lt(cutoff))
                    .order_by_asc(cache_entries::Column::LastAccess)
                    .limit(limit)
                    .all(&**connection)
                    .await?)
            },
            "find stale cache index rows",
        )
        .await?;
        Ok(models.into_iter().map(to_domain).collect())
    }

    /// Most recently accessed rows, newest first
    pub async fn load_recent(&self, limit: u64) -> RepositoryResult<Vec<CacheEntry>> {
        let connection = &self.connection;
        let models = with_retry(
            &self.read_retry,
            || async move {
                Ok::<_, RepositoryError>(CacheEntries::find()
                    .order_by_desc(cache_entries::Column::LastAccess)
                    .limit(limit)
                    .all(&**connection)
                    .await?)
            },
            "load recent cache index rows",
        )
        .await?;
        Ok(models.into_iter().map(to_domain).collect())
    }

    /// One page of rows in the requested order, plus the number of rows matching the filter
    pub async fn list(&self, query: &EntryListQuery) -> RepositoryResult<(Vec<CacheEntry>, u64)> {
        let connection = &self.connection;
        let (models, total) = with_retry(
            &self.read_retry,
            || async move {
                let mut select = CacheEntries::find();
                if let Some(format) = &query.format {
                    select = select.filter(cache_entries::Column::Format.eq(format.as_str()));
                }
                let total = select.clone().count(&**connection).await?;
                let models = sorted(select, query.sort)
                    .offset(query.offset())
                    .limit(query.page_size)
                    .all(&**connection)
                    .await?;
                Ok::<_, RepositoryError>((models, total))
            },
            "list cache index rows",
        )
        .await?;
        Ok((models.into_iter().map(to_domain).collect(), total))
    }

    pub async fn count(&self) -> RepositoryResult<u64> {
        let connection = &self.connection;
        with_retry(
            &self.read_retry,
            || async move { Ok::<_, RepositoryError>(CacheEntries::find().count(&**connection).await?) },
            "count cache index rows",
        )
        .await
    }
}

fn sorted(select: Select<CacheEntries>, sort: EntrySort) -> Select<CacheEntries> {
    let ordered = match sort {
        EntrySort::LastAccess => select.order_by_desc(cache_entries::Column::LastAccess),
        EntrySort::AccessCount => select.order_by_desc(cache_entries::Column::AccessCount),
        EntrySort::CreatedAt => select.order_by_desc(cache_entries::Column::CreatedAt),
        EntrySort::Size => select.order_by_desc(cache_entries::Column::SizeBytes),
        EntrySort::Url => return select.order_by_asc(cache_entries::Column::CacheKey),
    };
    // Stable pages when the sort column ties
    ordered.order_by_asc(cache_entries::Column::CacheKey)
}

fn upsert_conflict() -> OnConflict {
    OnConflict::column(cache_entries::Column::CacheKey)
        .update_columns([
            cache_entries::Column::Locator,
            cache_entries::Column::ThumbLocator,
            cache_entries::Column::ContentType,
            cache_entries::Column::Format,
            cache_entries::Column::SizeBytes,
            cache_entries::Column::Etag,
            cache_entries::Column::AccessCount,
            cache_entries::Column::LastAccess,
        ])
        .to_owned()
}

fn to_active_model(entry: &CacheEntry) -> cache_entries::ActiveModel {
    cache_entries::ActiveModel {
        cache_key: Set(entry.key.clone()),
        locator: Set(entry.locator.clone()),
        thumb_locator: Set(entry.thumb_locator.clone()),
        content_type: Set(entry.content_type.clone()),
        format: Set(entry.format.clone()),
        size_bytes: Set(i64::try_from(entry.size).unwrap_or(i64::MAX)),
        etag: Set(entry.etag.clone()),
        access_count: Set(i64::try_from(entry.access_count).unwrap_or(i64::MAX)),
        last_access: Set(entry.last_access),
        created_at: Set(entry.created_at),
    }
}

fn to_domain(model: cache_entries::Model) -> CacheEntry {
    CacheEntry {
        key: model.cache_key,
        locator: model.locator,
        thumb_locator: model.thumb_locator,
        content_type: model.content_type,
        format: model.format,
        size: model.size_bytes.max(0) as u64,
        etag: model.etag,
        access_count: model.access_count.max(0) as u64,
        last_access: model.last_access,
        created_at: model.created_at,
        dirty: false,
    }
}
