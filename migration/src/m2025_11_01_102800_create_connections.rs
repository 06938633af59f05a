//! Creates the connections table.
//!
//! A connection is a tenant-scoped authorization to one provider account. The
//! scheduler's bookkeeping (`sync_interval_seconds`, `next_run_at`,
//! `last_jitter_seconds`, `first_activated_at`) lives on the same row so that
//! job creation and cadence updates commit together.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Connections::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Connections::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Connections::TenantId).uuid().not_null())
                    .col(ColumnDef::new(Connections::ProviderSlug).text().not_null())
                    .col(ColumnDef::new(Connections::ExternalId).text().not_null())
                    .col(ColumnDef::new(Connections::DisplayName).text().null())
                    .col(
                        ColumnDef::new(Connections::Status)
                            .text()
                            .not_null()
                            .default("active"),
                    )
                    .col(
                        ColumnDef::new(Connections::AccessTokenCiphertext)
                            .binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Connections::RefreshTokenCiphertext)
                            .binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Connections::ExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(Connections::Scopes).json_binary().null())
                    .col(ColumnDef::new(Connections::Metadata).json_binary().null())
                    .col(
                        ColumnDef::new(Connections::SyncIntervalSeconds)
                            .big_integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Connections::NextRunAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Connections::LastJitterSeconds)
                            .big_integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Connections::FirstActivatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Connections::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Connections::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_connections_tenant_provider_external")
                    .table(Connections::Table)
                    .col(Connections::TenantId)
                    .col(Connections::ProviderSlug)
                    .col(Connections::ExternalId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Scheduler scan: active rows ordered by next due time.
        manager
            .create_index(
                Index::create()
                    .name("idx_connections_status_next_run")
                    .table(Connections::Table)
                    .col(Connections::Status)
                    .col(Connections::NextRunAt)
                    .to_owned(),
            )
            .await?;

        // Refresh sweep: active rows ordered by expiry.
        manager
            .create_index(
                Index::create()
                    .name("idx_connections_status_expires")
                    .table(Connections::Table)
                    .col(Connections::Status)
                    .col(Connections::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for index in [
            "idx_connections_tenant_provider_external",
            "idx_connections_status_next_run",
            "idx_connections_status_expires",
        ] {
            manager
                .drop_index(Index::drop().name(index).to_owned())
                .await?;
        }

        manager
            .drop_table(Table::drop().table(Connections::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Connections {
    Table,
    Id,
    TenantId,
    ProviderSlug,
    ExternalId,
    DisplayName,
    Status,
    AccessTokenCiphertext,
    RefreshTokenCiphertext,
    ExpiresAt,
    Scopes,
    Metadata,
    SyncIntervalSeconds,
    NextRunAt,
    LastJitterSeconds,
    FirstActivatedAt,
    CreatedAt,
    UpdatedAt,
}
