//! # SyncJob Repository
//!
//! Insert, claim and terminal transitions for `sync_jobs`, plus the tenant job
//! listing. Methods that take a generic `C: ConnectionTrait` run inside the
//! caller's transaction.

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, EntityTrait,
    IntoActiveModel, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
    sea_query::{LockBehavior, LockType},
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::cursor::JobCursor;
use crate::db::to_db_time;
use crate::error::EngineError;
use crate::models::connection::Model as ConnectionModel;
use crate::models::sync_job::{ActiveModel, Column, Entity, JobStatus, JobType, Model};

pub const DEFAULT_LIST_LIMIT: u64 = 50;
pub const MAX_LIST_LIMIT: u64 = 100;

/// Job row as exposed to callers outside the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct JobInfo {
    pub id: Uuid,
    pub provider_slug: String,
    pub connection_id: Uuid,
    #[schema(value_type = String, example = "incremental")]
    pub job_type: JobType,
    #[schema(value_type = String, example = "queued")]
    pub status: JobStatus,
    pub priority: i16,
    pub attempts: i32,
    pub scheduled_at: DateTime<Utc>,
    pub retry_after: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<Model> for JobInfo {
    fn from(job: Model) -> Self {
        Self {
            id: job.id,
            provider_slug: job.provider_slug,
            connection_id: job.connection_id,
            job_type: job.job_type,
            status: job.status,
            priority: job.priority,
            attempts: job.attempts,
            scheduled_at: job.scheduled_at.with_timezone(&Utc),
            retry_after: job.retry_after.map(|at| at.with_timezone(&Utc)),
            started_at: job.started_at.map(|at| at.with_timezone(&Utc)),
            finished_at: job.finished_at.map(|at| at.with_timezone(&Utc)),
        }
    }
}

/// Optional filters for [`SyncJobRepository::list_jobs`].
#[derive(Debug, Clone, Default)]
pub struct JobListFilter {
    pub status: Option<JobStatus>,
    pub provider_slug: Option<String>,
    pub job_type: Option<JobType>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobPage {
    pub jobs: Vec<JobInfo>,
    pub next_cursor: Option<String>,
}

/// Repository for sync job database operations
#[derive(Debug, Clone)]
pub struct SyncJobRepository {
    db: DatabaseConnection,
}

impl SyncJobRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<Model>, EngineError> {
        Ok(Entity::find_by_id(id).one(&self.db).await?)
    }

    /// Enqueue a webhook job. Webhook jobs are exempt from the interval guard.
    pub async fn enqueue_webhook_job(
        &self,
        connection: &ConnectionModel,
        payload: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<Model, EngineError> {
        let job = insert_job(
            &self.db,
            connection,
            JobType::Webhook,
            now,
            Some(payload),
            now,
        )
        .await?;

        tracing::info!(
            tenant_id = %job.tenant_id,
            provider_slug = %job.provider_slug,
            connection_id = %job.connection_id,
            job_id = %job.id,
            "Webhook sync job enqueued"
        );
        Ok(job)
    }

    /// Tenant job listing ordered `scheduled_at DESC, id DESC`.
    pub async fn list_jobs(
        &self,
        tenant_id: Uuid,
        filter: &JobListFilter,
        limit: Option<u64>,
        cursor: Option<&str>,
    ) -> Result<JobPage, EngineError> {
        let limit = limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);

        let mut query = Entity::find()
            .filter(Column::TenantId.eq(tenant_id))
            .order_by_desc(Column::ScheduledAt)
            .order_by_desc(Column::Id);

        if let Some(status) = filter.status {
            query = query.filter(Column::Status.eq(status));
        }
        if let Some(provider) = &filter.provider_slug {
            query = query.filter(Column::ProviderSlug.eq(provider.as_str()));
        }
        if let Some(job_type) = filter.job_type {
            query = query.filter(Column::JobType.eq(job_type));
        }

        if let Some(cursor) = cursor.filter(|c| !c.is_empty()) {
            let after = JobCursor::decode(cursor)?;
            let scheduled_at = to_db_time(after.scheduled_at);
            query = query.filter(
                Condition::any()
                    .add(Column::ScheduledAt.lt(scheduled_at))
                    .add(
                        Condition::all()
                            .add(Column::ScheduledAt.eq(scheduled_at))
                            .add(Column::Id.lt(after.id)),
                    ),
            );
        }

        let mut rows = query.limit(limit + 1).all(&self.db).await?;
        let next_cursor = if rows.len() as u64 > limit {
            rows.truncate(limit as usize);
            rows.last()
                .map(|last| JobCursor::new(last.scheduled_at.with_timezone(&Utc), last.id).encode())
        } else {
            None
        };

        Ok(JobPage {
            jobs: rows.into_iter().map(JobInfo::from).collect(),
            next_cursor,
        })
    }

    /// Claims up to `limit` runnable jobs: queued, due, past any `retry_after`,
    /// at most one per connection and none for a connection with a running job.
    /// Claimed rows move to `running` with `attempts` incremented.
    pub async fn claim_ready(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Model>, EngineError> {
        let txn = self.db.begin().await?;
        let db_now = to_db_time(now);

        let busy: Vec<Uuid> = Entity::find()
            .select_only()
            .column(Column::ConnectionId)
            .filter(Column::Status.eq(JobStatus::Running))
            .distinct()
            .into_tuple()
            .all(&txn)
            .await?;

        let candidates = Entity::find()
            .filter(Column::Status.eq(JobStatus::Queued))
            .filter(Column::ScheduledAt.lte(db_now))
            .filter(
                Condition::any()
                    .add(Column::RetryAfter.is_null())
                    .add(Column::RetryAfter.lte(db_now)),
            )
            .filter(Column::ConnectionId.is_not_in(busy))
            .order_by_desc(Column::Priority)
            .order_by_asc(Column::ScheduledAt)
            .order_by_asc(Column::Id)
            .limit(limit.saturating_mul(4).max(limit))
            .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
            .all(&txn)
            .await?;

        let mut claimed = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for job in candidates {
            if claimed.len() as u64 >= limit {
                break;
            }
            if !seen.insert(job.connection_id) {
                continue;
            }

            let attempts = job.attempts + 1;
            let mut active: ActiveModel = job.into();
            active.status = Set(JobStatus::Running);
            active.attempts = Set(attempts);
            active.started_at = Set(Some(db_now));
            active.updated_at = Set(db_now);
            claimed.push(active.update(&txn).await?);
        }

        txn.commit().await?;
        Ok(claimed)
    }

    /// Terminal success. When `follow_up_cursor` is set, an incremental job
    /// continuing from it is queued in the same transaction.
    pub async fn complete(
        &self,
        job: &Model,
        connection: &ConnectionModel,
        follow_up_cursor: Option<JsonValue>,
        now: DateTime<Utc>,
    ) -> Result<Model, EngineError> {
        let txn = self.db.begin().await?;
        let db_now = to_db_time(now);

        let mut active: ActiveModel = job.clone().into();
        active.status = Set(JobStatus::Succeeded);
        active.finished_at = Set(Some(db_now));
        active.retry_after = Set(None);
        active.error = Set(None);
        active.updated_at = Set(db_now);
        let completed = active.update(&txn).await?;

        if let Some(cursor) = follow_up_cursor {
            let next = insert_job(
                &txn,
                connection,
                JobType::Incremental,
                now,
                Some(cursor),
                now,
            )
            .await?;
            tracing::debug!(job_id = %next.id, "queued continuation job");
        }

        txn.commit().await?;
        Ok(completed)
    }

    /// Puts a running job back in the queue until `retry_after`.
    pub async fn requeue(
        &self,
        job: &Model,
        retry_after: DateTime<Utc>,
        error: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<Model, EngineError> {
        let mut active: ActiveModel = job.clone().into();
        active.status = Set(JobStatus::Queued);
        active.retry_after = Set(Some(to_db_time(retry_after)));
        active.started_at = Set(None);
        active.error = Set(Some(error));
        active.updated_at = Set(to_db_time(now));
        Ok(active.update(&self.db).await?)
    }

    /// Terminal failure with a diagnostic payload.
    pub async fn fail(
        &self,
        job: &Model,
        error: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<Model, EngineError> {
        let db_now = to_db_time(now);
        let mut active: ActiveModel = job.clone().into();
        active.status = Set(JobStatus::Failed);
        active.finished_at = Set(Some(db_now));
        active.error = Set(Some(error));
        active.updated_at = Set(db_now);
        Ok(active.update(&self.db).await?)
    }
}

/// Inserts a queued job for `connection` with the type's default priority.
pub async fn insert_job<C: ConnectionTrait>(
    conn: &C,
    connection: &ConnectionModel,
    job_type: JobType,
    scheduled_at: DateTime<Utc>,
    cursor: Option<JsonValue>,
    now: DateTime<Utc>,
) -> Result<Model, EngineError> {
    let db_now = to_db_time(now);
    let job = Model {
        id: Uuid::new_v4(),
        tenant_id: connection.tenant_id,
        provider_slug: connection.provider_slug.clone(),
        connection_id: connection.id,
        job_type,
        status: JobStatus::Queued,
        priority: job_type.default_priority(),
        attempts: 0,
        scheduled_at: to_db_time(scheduled_at),
        retry_after: None,
        started_at: None,
        finished_at: None,
        cursor,
        error: None,
        created_at: db_now,
        updated_at: db_now,
    };

    match Entity::insert(job.clone().into_active_model().reset_all())
        .exec(conn)
        .await
    {
        Ok(_) | Err(sea_orm::DbErr::UnpackInsertId) => Ok(job),
        Err(err) => Err(err.into()),
    }
}

/// Whether an interval job for the connection is queued or running.
pub async fn has_pending_interval_job<C: ConnectionTrait>(
    conn: &C,
    connection_id: Uuid,
) -> Result<bool, EngineError> {
    let pending = Entity::find()
        .filter(Column::ConnectionId.eq(connection_id))
        .filter(Column::JobType.is_in(JobType::INTERVAL))
        .filter(Column::Status.is_in(JobStatus::PENDING))
        .one(conn)
        .await?;
    Ok(pending.is_some())
}

/// `finished_at` of the most recent succeeded interval job.
pub async fn last_completed_interval_at<C: ConnectionTrait>(
    conn: &C,
    connection_id: Uuid,
) -> Result<Option<DateTime<Utc>>, EngineError> {
    let last = Entity::find()
        .filter(Column::ConnectionId.eq(connection_id))
        .filter(Column::JobType.is_in(JobType::INTERVAL))
        .filter(Column::Status.eq(JobStatus::Succeeded))
        .filter(Column::FinishedAt.is_not_null())
        .order_by_desc(Column::FinishedAt)
        .one(conn)
        .await?;
    Ok(last
        .and_then(|job| job.finished_at)
        .map(|at| at.with_timezone(&Utc)))
}
