//! Partial unique index allowing at most one pending interval job per connection.
//!
//! Interval jobs are `full` and `incremental`; `webhook` jobs are exempt. A second
//! scheduler instance racing to enqueue the same slot hits this index and backs off.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::{DatabaseBackend, Statement};

const INDEX_NAME: &str = "idx_sync_jobs_interval_pending";
const INDEX_PREDICATE: &str =
    "job_type IN ('full','incremental') AND status IN ('queued','running')";

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let backend = manager.get_database_backend();
        let sql = match backend {
            DatabaseBackend::Postgres => format!(
                "DO $$\nBEGIN\n    IF NOT EXISTS (\n        SELECT 1 FROM pg_indexes\n        WHERE schemaname = current_schema()\n          AND indexname = '{INDEX_NAME}'\n    ) THEN\n        CREATE UNIQUE INDEX {INDEX_NAME}\n            ON sync_jobs (connection_id)\n            WHERE {INDEX_PREDICATE};\n    END IF;\nEND\n$$;"
            ),
            _ => format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {INDEX_NAME} ON sync_jobs (connection_id) WHERE {INDEX_PREDICATE}"
            ),
        };

        manager
            .get_connection()
            .execute(Statement::from_string(backend, sql))
            .await
            .map(|_| ())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                format!("DROP INDEX IF EXISTS {INDEX_NAME}"),
            ))
            .await
            .map(|_| ())
    }
}
