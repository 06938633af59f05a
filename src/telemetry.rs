//! Telemetry: global tracing subscriber, request-scoped trace ids and the
//! catalogue of metrics the engine emits.

use std::any::type_name_of_val;
use std::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;
use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use thiserror::Error;
use tokio::task_local;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::Layer,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};
use uuid::Uuid;

use crate::config::AppConfig;

/// Header carrying an inbound correlation id.
pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Request correlation context.
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub trace_id: String,
}

impl TraceContext {
    /// Uses the caller-supplied id when it is short and printable, otherwise generates one.
    pub fn from_header(value: Option<&str>) -> Self {
        let trace_id = value
            .map(str::trim)
            .filter(|v| !v.is_empty() && v.len() <= 64 && v.chars().all(|c| c.is_ascii_graphic()))
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        Self { trace_id }
    }
}

task_local! {
    static ACTIVE_TRACE_CONTEXT: TraceContext;
}

#[derive(Debug, Error)]
pub enum TelemetryInitError {
    #[error("failed to install log tracer bridge: {0}")]
    LogTracer(#[from] log::SetLoggerError),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

static TELEMETRY_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Installs the global subscriber once. `RUST_LOG` wins over the configured level;
/// `LOG_FORMAT=pretty` selects human-readable output, anything else JSON.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryInitError> {
    if TELEMETRY_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }

    // sqlx logs through `log`; route it into tracing.
    if let Err(err) = LogTracer::builder()
        .with_max_level(LevelFilter::Trace)
        .init()
    {
        let logger_type = type_name_of_val(log::logger());
        if !logger_type.contains("LogTracer") {
            return Err(err.into());
        }
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = match config.log_format.as_str() {
        "pretty" => fmt::layer().pretty().boxed(),
        _ => fmt::layer().json().with_current_span(true).boxed(),
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        TELEMETRY_INITIALIZED.store(false, Ordering::SeqCst);
        return Err(err.into());
    }

    describe_metrics();
    Ok(())
}

/// Registers descriptions for every metric the engine records.
pub fn describe_metrics() {
    describe_counter!(
        "sync_scheduler_jobs_scheduled_total",
        "Interval jobs enqueued by the scheduler"
    );
    describe_histogram!(
        "sync_scheduler_jitter_seconds",
        Unit::Seconds,
        "Jitter sampled for scheduled jobs"
    );
    describe_gauge!(
        "sync_scheduler_backlog_gauge",
        "Active connections overdue at the start of a tick"
    );
    describe_histogram!(
        "sync_scheduler_tick_duration_ms",
        Unit::Milliseconds,
        "Scheduler tick wall time"
    );
    describe_counter!("token_refresh_attempts_total", "Upstream refresh calls");
    describe_counter!("token_refresh_success_total", "Successful refreshes");
    describe_counter!(
        "token_refresh_failure_total",
        "Failed refreshes by classification"
    );
    describe_counter!(
        "token_refresh_coalesced_total",
        "Refresh requests served by an in-flight call"
    );
    describe_histogram!(
        "token_refresh_latency_ms",
        Unit::Milliseconds,
        "Upstream refresh latency"
    );
    describe_histogram!(
        "token_refresh_tick_duration_ms",
        Unit::Milliseconds,
        "Refresh sweep wall time"
    );
    describe_counter!(
        "webhook_verification_success_total",
        "Webhooks admitted by signature or operator credential"
    );
    describe_counter!(
        "webhook_verification_failure_total",
        "Webhooks rejected by reason"
    );
    describe_counter!(
        "webhook_verification_replay_rejected_total",
        "Webhooks rejected for a stale or future timestamp"
    );
    describe_counter!(
        "webhook_admission_rejected_total",
        "Webhooks rejected by the admission limiter"
    );
    describe_counter!("sync_executor_jobs_total", "Finished job runs by outcome");
    describe_histogram!(
        "sync_executor_backoff_seconds",
        Unit::Seconds,
        "Delay applied to requeued jobs"
    );
}

/// Runs `future` with `context` available through [`current_trace_id`].
pub async fn with_trace_context<Fut, R>(context: TraceContext, future: Fut) -> R
where
    Fut: std::future::Future<Output = R>,
{
    ACTIVE_TRACE_CONTEXT.scope(context, future).await
}

pub fn current_trace_id() -> Option<String> {
    ACTIVE_TRACE_CONTEXT
        .try_with(|ctx| ctx.trace_id.clone())
        .ok()
}
