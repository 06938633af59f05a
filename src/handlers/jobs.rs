//! # Jobs API Handlers
//!
//! Operator listing of a tenant's sync jobs with keyset pagination.

use axum::{
    extract::{Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::{OperatorAuth, TenantExtension};
use crate::error::{ApiError, validation_error};
use crate::models::sync_job::{JobStatus, JobType};
use crate::repositories::sync_job::{DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT};
use crate::repositories::{JobInfo, JobListFilter};
use crate::server::AppState;

/// Query parameters for listing jobs
#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    /// One of: queued, running, succeeded, failed
    pub status: Option<String>,
    /// Provider slug
    pub provider: Option<String>,
    /// One of: full, incremental, webhook
    pub job_type: Option<String>,
    /// Page size (default 50, max 100)
    pub limit: Option<u64>,
    /// Opaque cursor from a previous page
    pub cursor: Option<String>,
}

/// Documented job status values for OpenAPI enumeration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobStatusParam {
    Queued,
    Running,
    Succeeded,
    Failed,
}

/// Documented job type values for OpenAPI enumeration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobTypeParam {
    Full,
    Incremental,
    Webhook,
}

/// One page of jobs
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobsResponse {
    pub jobs: Vec<JobInfo>,
    /// Cursor for the next page; absent on the last page
    pub next_cursor: Option<String>,
}

fn parse_status(raw: &str) -> Result<JobStatus, ApiError> {
    match raw {
        "queued" => Ok(JobStatus::Queued),
        "running" => Ok(JobStatus::Running),
        "succeeded" => Ok(JobStatus::Succeeded),
        "failed" => Ok(JobStatus::Failed),
        _ => Err(validation_error(
            "Invalid status",
            serde_json::json!({ "status": "Must be one of: queued, running, succeeded, failed" }),
        )),
    }
}

fn parse_job_type(raw: &str) -> Result<JobType, ApiError> {
    match raw {
        "full" => Ok(JobType::Full),
        "incremental" => Ok(JobType::Incremental),
        "webhook" => Ok(JobType::Webhook),
        _ => Err(validation_error(
            "Invalid job_type",
            serde_json::json!({ "job_type": "Must be one of: full, incremental, webhook" }),
        )),
    }
}

/// List jobs endpoint requiring operator auth and tenant header
#[utoipa::path(
    get,
    path = "/jobs",
    security(("bearer_auth" = [])),
    params(
        crate::auth::TenantHeader,
        ("cursor" = Option<String>, Query, description = "Opaque pagination cursor"),
        ("limit" = Option<u64>, Query, description = "Maximum number of jobs to return (default 50, max 100)"),
        ("status" = Option<JobStatusParam>, Query, description = "Filter by job status"),
        ("provider" = Option<String>, Query, description = "Filter by provider slug"),
        ("job_type" = Option<JobTypeParam>, Query, description = "Filter by job type")
    ),
    responses(
        (status = 200, description = "Jobs for the tenant, newest first", body = JobsResponse),
        (status = 400, description = "Invalid query parameters", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    TenantExtension(tenant): TenantExtension,
    Query(params): Query<ListJobsQuery>,
) -> Result<Json<JobsResponse>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    if !(1..=MAX_LIST_LIMIT).contains(&limit) {
        return Err(validation_error(
            "Invalid limit",
            serde_json::json!({ "limit": format!("Must be between 1 and {MAX_LIST_LIMIT}") }),
        ));
    }

    let filter = JobListFilter {
        status: params.status.as_deref().map(parse_status).transpose()?,
        provider_slug: params.provider.filter(|slug| !slug.is_empty()),
        job_type: params.job_type.as_deref().map(parse_job_type).transpose()?,
    };

    let page = state
        .jobs
        .list_jobs(tenant.0, &filter, Some(limit), params.cursor.as_deref())
        .await?;

    Ok(Json(JobsResponse {
        jobs: page.jobs,
        next_cursor: page.next_cursor,
    }))
}
