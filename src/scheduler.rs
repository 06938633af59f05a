//! # Sync Scheduler
//!
//! Periodically walks active connections and enqueues at most one interval job
//! per connection. Cadence is anchored on the last completed interval job, so a
//! connection that was offline for several intervals gets a single catch-up job
//! rather than a burst. The partial unique index on `sync_jobs` makes concurrent
//! scheduler instances safe without leader election.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, gauge, histogram};
use rand::{Rng, RngCore, SeedableRng, rngs::StdRng};
use sea_orm::sea_query::{LockBehavior, LockType};
use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, DatabaseTransaction, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, TransactionTrait,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::SchedulerConfig;
use crate::db::to_db_time;
use crate::error::EngineError;
use crate::models::connection::{
    self, ConnectionStatus, Entity as Connection, Model as ConnectionModel,
};
use crate::models::sync_job::JobType;
use crate::repositories::effective_interval_seconds;
use crate::repositories::sync_job::{
    has_pending_interval_job, insert_job, last_completed_interval_at,
};
use crate::task::PeriodicTask;

/// What the scheduler should do with one connection on this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulePlan {
    /// Enqueue a job for `slot` (plus jitter) and move `next_run_at` forward.
    Enqueue {
        job_type: JobType,
        slot: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    },
    /// Not due yet; `next_run_at` is stale and should be rewritten.
    Repair { next_run_at: DateTime<Utc> },
    /// Not due yet and `next_run_at` is accurate.
    Wait,
}

/// Inputs to [`plan_connection`], all read inside the connection's transaction.
#[derive(Debug, Clone, Copy)]
pub struct PlanInput {
    pub base_interval: Duration,
    pub last_completed_at: Option<DateTime<Utc>>,
    /// `first_activated_at`, else the connection's creation time.
    pub anchor: DateTime<Utc>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

/// First `from + k * interval` (k >= 1) strictly after `now`.
fn next_boundary_after(from: DateTime<Utc>, interval: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
    let interval_secs = interval.num_seconds().max(1);
    let elapsed = (now - from).num_seconds();
    let k = if elapsed < 0 {
        1
    } else {
        elapsed / interval_secs + 1
    };
    from + Duration::seconds(k * interval_secs)
}

/// Pure cadence decision for one connection.
pub fn plan_connection(input: PlanInput) -> SchedulePlan {
    let PlanInput {
        base_interval,
        last_completed_at,
        anchor,
        next_run_at,
        now,
    } = input;

    // A future next_run_at wins over history; it keeps a connection whose first
    // job failed from being re-bootstrapped every tick.
    if next_run_at.is_some_and(|at| at > now) {
        return SchedulePlan::Wait;
    }

    let Some(last) = last_completed_at else {
        return SchedulePlan::Enqueue {
            job_type: JobType::Full,
            slot: now,
            next_run_at: next_boundary_after(anchor, base_interval, now),
        };
    };

    let due = last + base_interval;
    if due > now {
        return if next_run_at == Some(due) {
            SchedulePlan::Wait
        } else {
            SchedulePlan::Repair { next_run_at: due }
        };
    }

    let upcoming = next_boundary_after(last, base_interval, now);
    SchedulePlan::Enqueue {
        job_type: JobType::Incremental,
        slot: upcoming - base_interval,
        next_run_at: upcoming,
    }
}

/// Jitter in whole seconds within `[jitter_pct_min * base, jitter_pct_max * base]`.
/// The rounded sample is clamped to the whole seconds inside that range; when the
/// range holds none, the largest value not above the upper bound is used.
pub fn sample_jitter_seconds<R: Rng + ?Sized>(
    config: &SchedulerConfig,
    base_interval_seconds: u64,
    rng: &mut R,
) -> i64 {
    const EPSILON: f64 = 1e-9;
    let base = base_interval_seconds as f64;
    let low = (config.jitter_pct_min * base - EPSILON).ceil() as i64;
    let high = (config.jitter_pct_max * base + EPSILON).floor() as i64;
    if low > high {
        return high.max(0);
    }

    let pct = if config.jitter_pct_max > config.jitter_pct_min {
        rng.gen_range(config.jitter_pct_min..=config.jitter_pct_max)
    } else {
        config.jitter_pct_min
    };
    ((pct * base).round() as i64).clamp(low, high)
}

/// Per-tick counters, returned for logging and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub examined: u64,
    pub enqueued: u64,
    pub repaired: u64,
    pub skipped_pending: u64,
    pub skipped_locked: u64,
    pub conflicts: u64,
    pub errors: u64,
    pub backlog: u64,
}

enum Outcome {
    Enqueued,
    Repaired,
    Waiting,
    Pending,
    Locked,
}

/// Background scheduler service.
pub struct SyncScheduler {
    config: SchedulerConfig,
    db: DatabaseConnection,
    clock: SharedClock,
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl SyncScheduler {
    pub fn new(config: SchedulerConfig, db: DatabaseConnection, clock: SharedClock) -> Self {
        Self {
            config,
            db,
            clock,
            rng: Mutex::new(Box::new(StdRng::from_entropy())),
        }
    }

    /// Replaces the jitter source (deterministic tests).
    pub fn with_rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.rng = Mutex::new(Box::new(rng));
        self
    }

    /// Runs a tick every `tick_interval_seconds` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let period = std::time::Duration::from_secs(self.config.tick_interval_seconds);
        PeriodicTask::new("sync_scheduler", period)
            .run(shutdown, |token| {
                let scheduler = self.clone();
                async move {
                    scheduler.tick(&token).await;
                }
            })
            .await;
    }

    /// One tick at the clock's current time.
    pub async fn tick(&self, shutdown: &CancellationToken) -> TickReport {
        self.tick_at(self.clock.now(), shutdown).await
    }

    #[instrument(skip_all, fields(now = %now))]
    pub async fn tick_at(&self, now: DateTime<Utc>, shutdown: &CancellationToken) -> TickReport {
        let started = Instant::now();
        let mut report = TickReport::default();

        let candidates = match self.load_candidates(now).await {
            Ok(candidates) => candidates,
            Err(err) => {
                error!(error = %err, "failed to load scheduling candidates");
                report.errors += 1;
                return report;
            }
        };

        match self.count_backlog(now).await {
            Ok(backlog) => {
                report.backlog = backlog;
                gauge!("sync_scheduler_backlog_gauge").set(backlog as f64);
            }
            Err(err) => warn!(error = %err, "failed to count scheduler backlog"),
        }

        for connection in candidates {
            if shutdown.is_cancelled() {
                info!("shutdown requested; stopping scheduler tick early");
                break;
            }

            report.examined += 1;
            match self.process_connection(connection.id, now).await {
                Ok(Outcome::Enqueued) => report.enqueued += 1,
                Ok(Outcome::Repaired) => report.repaired += 1,
                Ok(Outcome::Waiting) => {}
                Ok(Outcome::Pending) => report.skipped_pending += 1,
                Ok(Outcome::Locked) => report.skipped_locked += 1,
                Err(err) if err.is_benign() => {
                    report.conflicts += 1;
                    debug!(
                        connection_id = %connection.id,
                        "interval job enqueued concurrently; skipping"
                    );
                }
                Err(err) => {
                    report.errors += 1;
                    error!(
                        connection_id = %connection.id,
                        error = %err,
                        "failed to schedule connection"
                    );
                }
            }
        }

        histogram!("sync_scheduler_tick_duration_ms")
            .record(started.elapsed().as_secs_f64() * 1_000.0);
        debug!(?report, "scheduler tick completed");
        report
    }

    /// Active connections whose `next_run_at` is unset or has passed.
    async fn load_candidates(&self, now: DateTime<Utc>) -> Result<Vec<ConnectionModel>, EngineError> {
        Ok(Connection::find()
            .filter(connection::Column::Status.eq(ConnectionStatus::Active))
            .filter(
                Condition::any()
                    .add(connection::Column::NextRunAt.is_null())
                    .add(connection::Column::NextRunAt.lte(to_db_time(now))),
            )
            .order_by_asc(connection::Column::NextRunAt)
            .order_by_asc(connection::Column::CreatedAt)
            .limit(self.config.batch_size)
            .all(&self.db)
            .await?)
    }

    /// Active connections more than one tick overdue, counted across the whole
    /// table rather than the current batch.
    async fn count_backlog(&self, now: DateTime<Utc>) -> Result<u64, EngineError> {
        let lag = Duration::seconds(self.config.tick_interval_seconds as i64);
        Ok(Connection::find()
            .filter(connection::Column::Status.eq(ConnectionStatus::Active))
            .filter(connection::Column::NextRunAt.is_not_null())
            .filter(connection::Column::NextRunAt.lt(to_db_time(now - lag)))
            .count(&self.db)
            .await?)
    }

    async fn process_connection(
        &self,
        connection_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Outcome, EngineError> {
        let txn = self.db.begin().await?;

        // Another instance holding the row lock is scheduling this connection.
        let Some(connection) = Connection::find_by_id(connection_id)
            .filter(connection::Column::Status.eq(ConnectionStatus::Active))
            .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
            .one(&txn)
            .await?
        else {
            txn.rollback().await?;
            return Ok(Outcome::Locked);
        };

        if has_pending_interval_job(&txn, connection.id).await? {
            txn.rollback().await?;
            debug!(%connection_id, "interval job already pending");
            return Ok(Outcome::Pending);
        }

        let base_seconds = effective_interval_seconds(&connection, &self.config);
        let base_interval = Duration::seconds(base_seconds as i64);
        let anchor = connection
            .first_activated_at
            .unwrap_or(connection.created_at)
            .with_timezone(&Utc);

        let plan = plan_connection(PlanInput {
            base_interval,
            last_completed_at: last_completed_interval_at(&txn, connection.id).await?,
            anchor,
            next_run_at: connection.next_run_at.map(|at| at.with_timezone(&Utc)),
            now,
        });

        let outcome = match plan {
            SchedulePlan::Wait => {
                txn.rollback().await?;
                return Ok(Outcome::Waiting);
            }
            SchedulePlan::Repair { next_run_at } => {
                debug!(%connection_id, %next_run_at, "repairing next_run_at");
                self.write_metadata(&txn, &connection, next_run_at, None, anchor, now)
                    .await?;
                Outcome::Repaired
            }
            SchedulePlan::Enqueue {
                job_type,
                slot,
                next_run_at,
            } => {
                let jitter_seconds = {
                    let mut rng = self
                        .rng
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    sample_jitter_seconds(&self.config, base_seconds, &mut *rng)
                };
                let scheduled_at = slot + Duration::seconds(jitter_seconds);

                if let Err(err) =
                    insert_job(&txn, &connection, job_type, scheduled_at, None, now).await
                {
                    txn.rollback().await?;
                    return Err(err);
                }
                self.write_metadata(
                    &txn,
                    &connection,
                    next_run_at,
                    Some(jitter_seconds),
                    anchor,
                    now,
                )
                .await?;

                let provider_slug = connection.provider_slug.clone();
                let tenant_id = connection.tenant_id.to_string();
                counter!(
                    "sync_scheduler_jobs_scheduled_total",
                    "provider_slug" => provider_slug.clone(),
                    "tenant_id" => tenant_id.clone()
                )
                .increment(1);
                histogram!(
                    "sync_scheduler_jitter_seconds",
                    "provider_slug" => provider_slug,
                    "tenant_id" => tenant_id
                )
                .record(jitter_seconds as f64);

                info!(
                    %connection_id,
                    provider_slug = %connection.provider_slug,
                    tenant_id = %connection.tenant_id,
                    job_type = ?job_type,
                    base_interval_seconds = base_seconds,
                    boundary = %slot,
                    jitter_seconds,
                    scheduled_at = %scheduled_at,
                    next_run_at = %next_run_at,
                    "enqueued interval sync job"
                );
                Outcome::Enqueued
            }
        };

        txn.commit().await?;
        Ok(outcome)
    }

    async fn write_metadata(
        &self,
        txn: &DatabaseTransaction,
        connection: &ConnectionModel,
        next_run_at: DateTime<Utc>,
        jitter_seconds: Option<i64>,
        anchor: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let mut update = Connection::update_many()
            .col_expr(
                connection::Column::NextRunAt,
                Some(to_db_time(next_run_at)).into(),
            )
            .col_expr(connection::Column::UpdatedAt, to_db_time(now).into());
        if let Some(jitter) = jitter_seconds {
            update = update.col_expr(connection::Column::LastJitterSeconds, Some(jitter).into());
        }
        if connection.first_activated_at.is_none() {
            update = update.col_expr(
                connection::Column::FirstActivatedAt,
                Some(to_db_time(anchor)).into(),
            );
        }

        let result = update
            .filter(connection::Column::Id.eq(connection.id))
            .exec(txn)
            .await?;
        if result.rows_affected != 1 {
            warn!(
                connection_id = %connection.id,
                rows = result.rows_affected,
                "unexpected row count updating scheduler metadata"
            );
        }
        Ok(())
    }
}
