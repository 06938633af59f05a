//! Database migrations for the connector sync engine.

pub use sea_orm_migration::prelude::*;

mod m2025_11_01_102800_create_connections;
mod m2025_11_01_103100_create_sync_jobs;
mod m2025_11_03_000100_add_sync_job_unique_interval_guard;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_11_01_102800_create_connections::Migration),
            Box::new(m2025_11_01_103100_create_sync_jobs::Migration),
            Box::new(m2025_11_03_000100_add_sync_job_unique_interval_guard::Migration),
        ]
    }
}
