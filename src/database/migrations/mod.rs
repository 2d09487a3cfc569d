//! SeaORM migrations for the durable cache index

use sea_orm_migration::prelude::*;

pub mod m20251016_000001_create_cache_entries;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(m20251016_000001_create_cache_entries::Migration)]
    }
}
