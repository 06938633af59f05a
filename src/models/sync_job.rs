//! SyncJob entity model
//!
//! One unit of dispatched work. Interval jobs (`full`, `incremental`) are created
//! by the scheduler, `webhook` jobs by webhook ingestion. Rows are retained after
//! they finish.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    #[sea_orm(string_value = "full")]
    Full,
    #[sea_orm(string_value = "incremental")]
    Incremental,
    #[sea_orm(string_value = "webhook")]
    Webhook,
}

impl JobType {
    /// Interval jobs are subject to the one-pending-per-connection guard.
    pub fn is_interval(self) -> bool {
        matches!(self, JobType::Full | JobType::Incremental)
    }

    /// Default dispatch priority; higher runs first.
    pub fn default_priority(self) -> i16 {
        match self {
            JobType::Webhook => 50,
            JobType::Full => 40,
            JobType::Incremental => 30,
        }
    }

    pub const INTERVAL: [JobType; 2] = [JobType::Full, JobType::Incremental];
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[sea_orm(string_value = "queued")]
    Queued,
    #[sea_orm(string_value = "running")]
    Running,
    #[sea_orm(string_value = "succeeded")]
    Succeeded,
    #[sea_orm(string_value = "failed")]
    Failed,
}

impl JobStatus {
    pub const PENDING: [JobStatus; 2] = [JobStatus::Queued, JobStatus::Running];
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub tenant_id: Uuid,

    pub provider_slug: String,

    pub connection_id: Uuid,

    pub job_type: JobType,

    pub status: JobStatus,

    /// Higher values are claimed first
    pub priority: i16,

    /// Number of times a worker has claimed this job
    pub attempts: i32,

    pub scheduled_at: DateTimeWithTimeZone,

    /// Not eligible for claiming before this instant
    pub retry_after: Option<DateTimeWithTimeZone>,

    pub started_at: Option<DateTimeWithTimeZone>,

    pub finished_at: Option<DateTimeWithTimeZone>,

    /// Connector cursor, or the payload envelope for webhook jobs
    #[sea_orm(column_type = "JsonBinary")]
    pub cursor: Option<JsonValue>,

    /// Diagnostic detail of the last failure
    #[sea_orm(column_type = "JsonBinary")]
    pub error: Option<JsonValue>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::connection::Entity",
        from = "Column::ConnectionId",
        to = "super::connection::Column::Id"
    )]
    Connection,
}

impl Related<super::connection::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Connection.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
