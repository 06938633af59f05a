//! Sync Executor
//!
//! Reference worker: claims due jobs, runs them through their provider connector
//! with a fresh access token, and applies the backoff policy to failures. Interval
//! jobs advance the connector cursor stored on the connection; webhook jobs hand
//! the verified payload to the connector.

use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, histogram};
use serde_json::{Value as JsonValue, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::{RetryDecision, RetryPolicy};
use crate::clock::SharedClock;
use crate::config::ExecutorConfig;
use crate::connectors::{
    ConnectionContext, Connector, ConnectorError, Cursor, Registry, SyncParams, SyncResult,
    WebhookParams,
};
use crate::error::EngineError;
use crate::models::connection::{ConnectionStatus, Model as ConnectionModel};
use crate::models::sync_job::{JobType, Model as SyncJob};
use crate::repositories::{ConnectionRepository, SyncJobRepository, sync_cursor};
use crate::task::PeriodicTask;
use crate::token_refresh::{FreshTokenError, RefreshError, TokenRefreshService};

/// Upper bound on any requeue delay, including provider `Retry-After` hints.
const MAX_RETRY_DELAY_SECONDS: u64 = 7 * 24 * 60 * 60;

/// How a claimed job ended this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Retried,
    Failed,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Succeeded => "succeeded",
            JobOutcome::Retried => "retried",
            JobOutcome::Failed => "failed",
        }
    }
}

enum RunResult {
    Synced(SyncResult),
    Webhook { items: u64 },
}

/// Sync executor responsible for running background sync jobs
pub struct SyncExecutor {
    config: ExecutorConfig,
    jobs: SyncJobRepository,
    refresh: Arc<TokenRefreshService>,
    registry: Arc<Registry>,
    policy: RetryPolicy,
    clock: SharedClock,
}

impl SyncExecutor {
    pub fn new(
        config: ExecutorConfig,
        jobs: SyncJobRepository,
        refresh: Arc<TokenRefreshService>,
        registry: Arc<Registry>,
        policy: RetryPolicy,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            jobs,
            refresh,
            registry,
            policy,
            clock,
        }
    }

    fn connections(&self) -> &ConnectionRepository {
        self.refresh.connections()
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let period = StdDuration::from_secs(self.config.tick_seconds);
        PeriodicTask::new("sync_executor", period)
            .run(shutdown, |token| {
                let executor = self.clone();
                async move {
                    executor.tick(&token).await;
                }
            })
            .await;
    }

    /// Claims one batch and runs it to completion. Jobs already started are not
    /// abandoned on shutdown, since a job left `running` blocks its connection.
    #[instrument(skip_all, fields(batch_size = self.config.claim_batch))]
    pub async fn tick(self: &Arc<Self>, shutdown: &CancellationToken) -> usize {
        if shutdown.is_cancelled() {
            return 0;
        }

        let claimed = match self
            .jobs
            .claim_ready(self.clock.now(), self.config.claim_batch)
            .await
        {
            Ok(claimed) => claimed,
            Err(err) => {
                error!(error = %err, "failed to claim sync jobs");
                return 0;
            }
        };
        if claimed.is_empty() {
            debug!("no due jobs found to claim");
            return 0;
        }

        let count = claimed.len();
        let started = Instant::now();
        info!(count, "claimed jobs for execution");

        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1) as usize));
        let mut tasks = JoinSet::new();
        for job in claimed {
            let executor = self.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok()?;
                Some(executor.run_job(job).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "sync job task panicked");
            }
        }

        info!(
            count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "finished executor batch"
        );
        count
    }

    /// Runs one claimed job and records its outcome on the row.
    #[instrument(
        skip_all,
        fields(
            job_id = %job.id,
            connection_id = %job.connection_id,
            provider_slug = %job.provider_slug,
            attempt = job.attempts
        )
    )]
    pub async fn run_job(&self, job: SyncJob) -> JobOutcome {
        let outcome = match self.execute(&job).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(error = %err, "failed to record job outcome");
                JobOutcome::Failed
            }
        };

        counter!(
            "sync_executor_jobs_total",
            "outcome" => outcome.as_str(),
            "provider_slug" => job.provider_slug.clone()
        )
        .increment(1);
        outcome
    }

    async fn execute(&self, job: &SyncJob) -> Result<JobOutcome, EngineError> {
        let connection = match self.connections().get_by_id(job.connection_id).await? {
            Some(connection) if connection.status == ConnectionStatus::Active => connection,
            Some(connection) => {
                let detail = json!({
                    "kind": "connection_inactive",
                    "status": connection.status,
                });
                return self.fail(job, detail).await;
            }
            None => {
                return self
                    .fail(job, json!({ "kind": "connection_missing" }))
                    .await;
            }
        };

        let connector = match self.registry.get(&job.provider_slug) {
            Ok(connector) => connector,
            Err(err) => {
                let detail = json!({ "kind": "unknown_provider", "message": err.to_string() });
                return self.fail(job, detail).await;
            }
        };

        let started = Instant::now();
        let result = tokio::time::timeout(
            StdDuration::from_secs(self.config.max_run_seconds),
            self.invoke(job, &connection, connector),
        )
        .await
        .unwrap_or_else(|_| {
            Err(FreshTokenError::Connector(ConnectorError::NetworkError {
                details: format!(
                    "job exceeded max run time of {}s",
                    self.config.max_run_seconds
                ),
            }))
        });
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "connector call finished");

        match result {
            Ok(run) => self.succeed(job, &connection, run).await,
            Err(FreshTokenError::Connector(err)) => self.handle_connector_error(job, &err).await,
            Err(FreshTokenError::Refresh(err)) => self.handle_refresh_error(job, &err).await,
        }
    }

    async fn invoke(
        &self,
        job: &SyncJob,
        connection: &ConnectionModel,
        connector: Arc<dyn Connector>,
    ) -> Result<RunResult, FreshTokenError> {
        let context = ConnectionContext::from(connection);

        if job.job_type == JobType::Webhook {
            let payload = job
                .cursor
                .as_ref()
                .and_then(|envelope| envelope.get("payload"))
                .cloned()
                .unwrap_or(JsonValue::Null);

            let items = self
                .refresh
                .call_with_fresh_token(connection.id, |access_token| {
                    let connector = connector.clone();
                    let params = WebhookParams {
                        connection: context.clone(),
                        access_token,
                        payload: payload.clone(),
                    };
                    async move { connector.handle_webhook(params).await }
                })
                .await?;
            return Ok(RunResult::Webhook { items });
        }

        // A continuation job carries its cursor; otherwise resume from the
        // connection's stored position.
        let cursor = job
            .cursor
            .clone()
            .or_else(|| sync_cursor(connection))
            .map(Cursor::from);

        let result = self
            .refresh
            .call_with_fresh_token(connection.id, |access_token| {
                let connector = connector.clone();
                let params = SyncParams {
                    connection: context.clone(),
                    access_token,
                    cursor: cursor.clone(),
                };
                async move { connector.sync(params).await }
            })
            .await?;
        Ok(RunResult::Synced(result))
    }

    async fn succeed(
        &self,
        job: &SyncJob,
        connection: &ConnectionModel,
        run: RunResult,
    ) -> Result<JobOutcome, EngineError> {
        let now = self.clock.now();

        let follow_up = match run {
            RunResult::Webhook { items } => {
                info!(items, "webhook job processed");
                None
            }
            RunResult::Synced(result) => {
                info!(
                    items = result.items_processed,
                    has_more = result.has_more,
                    "sync job processed"
                );
                if let Some(next) = &result.next_cursor {
                    self.connections()
                        .store_sync_cursor(connection.id, next.0.clone(), now)
                        .await?;
                }
                result
                    .next_cursor
                    .filter(|_| result.has_more)
                    .map(JsonValue::from)
            }
        };

        let has_follow_up = follow_up.is_some();
        match self.jobs.complete(job, connection, follow_up, now).await {
            Ok(_) => {}
            Err(err) if err.is_benign() && has_follow_up => {
                // Another interval job got queued first; it will pick up the stored cursor.
                debug!("continuation job already queued");
                self.jobs.complete(job, connection, None, now).await?;
            }
            Err(err) => return Err(err),
        }
        Ok(JobOutcome::Succeeded)
    }

    async fn handle_connector_error(
        &self,
        job: &SyncJob,
        err: &ConnectorError,
    ) -> Result<JobOutcome, EngineError> {
        let now = self.clock.now();
        let attempts = u32::try_from(job.attempts).unwrap_or(0);
        let decision =
            self.policy
                .classify(&job.provider_slug, err, attempts, now, &mut rand::thread_rng());

        match decision {
            RetryDecision::Retry {
                after_seconds,
                reason,
            } => {
                warn!(
                    error = %err,
                    retry_after_seconds = after_seconds,
                    reason = reason.as_str(),
                    "sync job failed; requeueing"
                );
                let detail = json!({
                    "kind": reason.as_str(),
                    "message": err.to_string(),
                    "status": err.status(),
                    "attempts": attempts,
                });
                self.requeue(job, after_seconds, detail, now).await
            }
            RetryDecision::Permanent { detail } => {
                warn!(error = %err, kind = detail.kind, "sync job failed permanently");
                self.fail(job, detail.to_json()).await
            }
            RetryDecision::Unauthorized => {
                // The token was already refreshed once for this run.
                warn!("provider rejected refreshed credentials");
                let detail = json!({
                    "kind": "unauthorized",
                    "message": err.to_string(),
                    "attempts": attempts,
                });
                self.fail(job, detail).await
            }
        }
    }

    async fn handle_refresh_error(
        &self,
        job: &SyncJob,
        err: &RefreshError,
    ) -> Result<JobOutcome, EngineError> {
        let attempts = u32::try_from(job.attempts).unwrap_or(0);
        let detail = json!({
            "kind": "token_refresh",
            "classification": err.classification(),
            "message": err.to_string(),
            "attempts": attempts,
        });

        if err.is_permanent() || attempts >= self.policy.max_attempts() {
            warn!(error = %err, "token refresh failed; failing job");
            return self.fail(job, detail).await;
        }

        let after_seconds = match err {
            RefreshError::RateLimited {
                retry_after: Some(seconds),
            } => *seconds,
            _ => self.policy.backoff_seconds(
                &job.provider_slug,
                attempts.saturating_sub(1),
                &mut rand::thread_rng(),
            ),
        };
        warn!(error = %err, retry_after_seconds = after_seconds, "token refresh failed; requeueing");
        self.requeue(job, after_seconds, detail, self.clock.now())
            .await
    }

    async fn requeue(
        &self,
        job: &SyncJob,
        after_seconds: u64,
        detail: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<JobOutcome, EngineError> {
        let after_seconds = after_seconds.min(MAX_RETRY_DELAY_SECONDS);
        let retry_after = now + Duration::seconds(after_seconds as i64);
        self.jobs.requeue(job, retry_after, detail, now).await?;
        histogram!(
            "sync_executor_backoff_seconds",
            "provider_slug" => job.provider_slug.clone()
        )
        .record(after_seconds as f64);
        Ok(JobOutcome::Retried)
    }

    async fn fail(&self, job: &SyncJob, detail: JsonValue) -> Result<JobOutcome, EngineError> {
        self.jobs.fail(job, detail, self.clock.now()).await?;
        Ok(JobOutcome::Failed)
    }
}
