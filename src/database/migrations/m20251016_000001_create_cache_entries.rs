//! Create the cache_entries table
//!
//! One row per cache key. `last_access` is indexed for the staleness scan run by cleanup
//! and for loading the most recent rows at startup.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CacheEntries::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CacheEntries::CacheKey)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(CacheEntries::Locator).string().not_null())
                    .col(ColumnDef::new(CacheEntries::ThumbLocator).string().null())
                    .col(ColumnDef::new(CacheEntries::ContentType).string().not_null())
                    .col(ColumnDef::new(CacheEntries::Format).string().not_null())
                    .col(
                        ColumnDef::new(CacheEntries::SizeBytes)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(CacheEntries::Etag).string().not_null())
                    .col(
                        ColumnDef::new(CacheEntries::AccessCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(CacheEntries::LastAccess)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CacheEntries::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_cache_entries_last_access")
                    .table(CacheEntries::Table)
                    .col(CacheEntries::LastAccess)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(CacheEntries::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum CacheEntries {
    Table,
    CacheKey,
    Locator,
    ThumbLocator,
    ContentType,
    Format,
    SizeBytes,
    Etag,
    AccessCount,
    LastAccess,
    CreatedAt,
}
