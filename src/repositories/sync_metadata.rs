//! Scheduler metadata embedded in the `connections` row.
//!
//! `sync_interval_seconds` is written by operators and other services, so it is
//! validated every time it is read.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use tracing::warn;

use crate::config::SchedulerConfig;
use crate::models::connection::Model as Connection;

/// Minimum override interval allowed by the scheduler (one minute).
pub const MIN_SYNC_INTERVAL_SECONDS: u64 = 60;

/// Read-side view of the scheduling columns.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSyncMetadata {
    pub interval_seconds: Option<u64>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_jitter_seconds: Option<u64>,
    pub first_activated_at: Option<DateTime<Utc>>,
}

impl ConnectionSyncMetadata {
    pub fn from_connection(connection: &Connection) -> Self {
        Self {
            interval_seconds: connection
                .sync_interval_seconds
                .map(|value| u64::try_from(value).unwrap_or(0)),
            next_run_at: connection.next_run_at.map(|at| at.with_timezone(&Utc)),
            last_jitter_seconds: connection
                .last_jitter_seconds
                .and_then(|value| u64::try_from(value).ok()),
            first_activated_at: connection
                .first_activated_at
                .map(|at| at.with_timezone(&Utc)),
        }
    }

    /// Drops an override outside `[60, max_overridden_interval_seconds]`.
    ///
    /// Returns `true` if the override was discarded.
    pub fn sanitize_interval(&mut self, scheduler: &SchedulerConfig) -> bool {
        if let Some(value) = self.interval_seconds
            && (value < MIN_SYNC_INTERVAL_SECONDS
                || value > scheduler.max_overridden_interval_seconds)
        {
            warn!(
                interval_seconds = value,
                max_allowed = scheduler.max_overridden_interval_seconds,
                min_allowed = MIN_SYNC_INTERVAL_SECONDS,
                "Invalid sync interval override; reverting to scheduler default"
            );
            self.interval_seconds = None;
            return true;
        }
        false
    }

    /// Interval in effect: the override when valid, else the configured default.
    pub fn effective_interval_seconds(&self, scheduler: &SchedulerConfig) -> u64 {
        self.interval_seconds
            .unwrap_or(scheduler.default_interval_seconds)
    }
}

/// Validated interval for `connection`, logging and ignoring a bad override.
pub fn effective_interval_seconds(connection: &Connection, scheduler: &SchedulerConfig) -> u64 {
    let mut metadata = ConnectionSyncMetadata::from_connection(connection);
    metadata.sanitize_interval(scheduler);
    metadata.effective_interval_seconds(scheduler)
}

/// Connector cursor persisted under `metadata.sync.cursor`.
pub fn sync_cursor(connection: &Connection) -> Option<JsonValue> {
    connection
        .metadata
        .as_ref()
        .and_then(|metadata| metadata.get("sync"))
        .and_then(|sync| sync.get("cursor"))
        .filter(|cursor| !cursor.is_null())
        .cloned()
}

/// Returns `metadata` with `sync.cursor` replaced, keeping every other key.
pub fn with_sync_cursor(metadata: Option<JsonValue>, cursor: JsonValue) -> JsonValue {
    let mut root = match metadata {
        Some(JsonValue::Object(map)) => map,
        _ => Map::new(),
    };
    let mut sync = match root.remove("sync") {
        Some(JsonValue::Object(map)) => map,
        _ => Map::new(),
    };
    sync.insert("cursor".to_string(), cursor);
    root.insert("sync".to_string(), JsonValue::Object(sync));
    JsonValue::Object(root)
}
