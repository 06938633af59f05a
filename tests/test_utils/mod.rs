//! Test utilities for database testing.
//!
//! In-memory SQLite with migrations applied, connection and job fixtures, and a
//! scriptable connector whose responses each test controls.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration as StdDuration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use migration::{Migrator, MigratorTrait};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Database, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use uuid::Uuid;
use zeroize::Zeroizing;

use connector_sync::clock::{ManualClock, SharedClock};
use connector_sync::config::AppConfig;
use connector_sync::connectors::{
    AuthType, Connector, ConnectorError, ProviderMetadata, RefreshParams, Registry, SyncParams,
    SyncResult, TokenSet, WebhookParams,
};
use connector_sync::crypto::CryptoKey;
use connector_sync::db::to_db_time;
use connector_sync::models::connection::Model as ConnectionModel;
use connector_sync::models::sync_job::{self, JobStatus, JobType};
use connector_sync::repositories::sync_job::insert_job;
use connector_sync::repositories::{ConnectionRepository, NewConnection, SyncJobRepository};
use connector_sync::server::AppState;
use connector_sync::webhook_verification::WebhookVerifier;

pub const TEST_OPERATOR_TOKEN: &str = "operator-test-token";
pub const SCRIPTED_PROVIDER: &str = "scripted";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

pub fn test_crypto_key() -> CryptoKey {
    CryptoKey::new(vec![7u8; 32]).expect("32-byte key")
}

/// Fixed instant on 2024-03-01.
pub fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, hour, minute, second)
        .single()
        .expect("valid timestamp")
}

pub fn manual_clock(now: DateTime<Utc>) -> (Arc<ManualClock>, SharedClock) {
    let clock = Arc::new(ManualClock::new(now));
    let shared: SharedClock = clock.clone();
    (clock, shared)
}

/// Options for [`create_connection`]; defaults describe an active connection
/// holding both tokens.
pub struct ConnectionFixture<'a> {
    pub tenant_id: Uuid,
    pub provider_slug: &'a str,
    pub access_token: &'a str,
    pub refresh_token: Option<&'a str>,
    pub expires_at: Option<DateTime<Utc>>,
    pub sync_interval_seconds: Option<i64>,
}

impl Default for ConnectionFixture<'_> {
    fn default() -> Self {
        Self {
            tenant_id: Uuid::new_v4(),
            provider_slug: SCRIPTED_PROVIDER,
            access_token: "access-0",
            refresh_token: Some("refresh-0"),
            expires_at: None,
            sync_interval_seconds: None,
        }
    }
}

pub async fn create_connection(
    repo: &ConnectionRepository,
    fixture: ConnectionFixture<'_>,
    created_at: DateTime<Utc>,
) -> ConnectionModel {
    let external_id = format!("acct-{}", Uuid::new_v4());
    repo.create_with_tokens(
        NewConnection {
            tenant_id: fixture.tenant_id,
            provider_slug: fixture.provider_slug,
            external_id: &external_id,
            display_name: Some("Test connection"),
            access_token: fixture.access_token,
            refresh_token: fixture.refresh_token,
            expires_at: fixture.expires_at,
            sync_interval_seconds: fixture.sync_interval_seconds,
        },
        created_at,
    )
    .await
    .expect("create connection")
}

/// Records a succeeded interval job that finished at `finished_at`.
pub async fn insert_succeeded_interval_job(
    db: &DatabaseConnection,
    connection: &ConnectionModel,
    finished_at: DateTime<Utc>,
) -> sync_job::Model {
    let job = insert_job(
        db,
        connection,
        JobType::Incremental,
        finished_at,
        None,
        finished_at,
    )
    .await
    .expect("insert job");

    let mut active: sync_job::ActiveModel = job.into();
    active.status = Set(JobStatus::Succeeded);
    active.attempts = Set(1);
    active.started_at = Set(Some(to_db_time(finished_at)));
    active.finished_at = Set(Some(to_db_time(finished_at)));
    active.update(db).await.expect("mark job succeeded")
}

/// Every job of a connection, oldest `scheduled_at` first.
pub async fn jobs_for(db: &DatabaseConnection, connection_id: Uuid) -> Vec<sync_job::Model> {
    sync_job::Entity::find()
        .filter(sync_job::Column::ConnectionId.eq(connection_id))
        .order_by_asc(sync_job::Column::ScheduledAt)
        .order_by_asc(sync_job::Column::CreatedAt)
        .all(db)
        .await
        .expect("load jobs")
}

pub async fn reload_connection(repo: &ConnectionRepository, id: Uuid) -> ConnectionModel {
    repo.require(id).await.expect("connection exists")
}

/// Connector whose sync results and refresh behavior are queued by the test.
///
/// Calls carrying any access token other than the currently valid one get a 401.
/// A successful refresh issues `fresh-<n>` and makes it the valid token.
pub struct ScriptedConnector {
    valid_token: Mutex<String>,
    sync_script: Mutex<VecDeque<Result<SyncResult, ConnectorError>>>,
    refresh_script: Mutex<VecDeque<ConnectorError>>,
    refresh_delay: StdDuration,
    refresh_calls: AtomicU64,
    refreshes_in_flight: AtomicU64,
    peak_refreshes_in_flight: AtomicU64,
    refresh_started: Mutex<Vec<Instant>>,
    sync_calls: AtomicU64,
    webhook_items: AtomicU64,
    seen_cursors: Mutex<Vec<Option<serde_json::Value>>>,
}

impl ScriptedConnector {
    pub fn new(valid_token: &str) -> Self {
        Self {
            valid_token: Mutex::new(valid_token.to_string()),
            sync_script: Mutex::new(VecDeque::new()),
            refresh_script: Mutex::new(VecDeque::new()),
            refresh_delay: StdDuration::ZERO,
            refresh_calls: AtomicU64::new(0),
            refreshes_in_flight: AtomicU64::new(0),
            peak_refreshes_in_flight: AtomicU64::new(0),
            refresh_started: Mutex::new(Vec::new()),
            sync_calls: AtomicU64::new(0),
            webhook_items: AtomicU64::new(0),
            seen_cursors: Mutex::new(Vec::new()),
        }
    }

    pub fn with_refresh_delay(mut self, delay: StdDuration) -> Self {
        self.refresh_delay = delay;
        self
    }

    pub fn push_sync(&self, result: Result<SyncResult, ConnectorError>) {
        self.sync_script.lock().unwrap().push_back(result);
    }

    pub fn push_refresh_error(&self, error: ConnectorError) {
        self.refresh_script.lock().unwrap().push_back(error);
    }

    pub fn refresh_calls(&self) -> u64 {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Highest number of `refresh_token` calls that were running at once.
    pub fn peak_refreshes_in_flight(&self) -> u64 {
        self.peak_refreshes_in_flight.load(Ordering::SeqCst)
    }

    pub fn refresh_start_times(&self) -> Vec<Instant> {
        self.refresh_started.lock().unwrap().clone()
    }

    pub fn sync_calls(&self) -> u64 {
        self.sync_calls.load(Ordering::SeqCst)
    }

    pub fn webhook_items(&self) -> u64 {
        self.webhook_items.load(Ordering::SeqCst)
    }

    pub fn seen_cursors(&self) -> Vec<Option<serde_json::Value>> {
        self.seen_cursors.lock().unwrap().clone()
    }

    fn check_token(&self, token: &str) -> Result<(), ConnectorError> {
        if *self.valid_token.lock().unwrap() == token {
            Ok(())
        } else {
            Err(ConnectorError::http(401))
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn sync(&self, params: SyncParams) -> Result<SyncResult, ConnectorError> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        self.check_token(&params.access_token)?;
        self.seen_cursors
            .lock()
            .unwrap()
            .push(params.cursor.map(|cursor| cursor.0));

        let scripted = self.sync_script.lock().unwrap().pop_front();
        scripted.unwrap_or(Ok(SyncResult {
            items_processed: 0,
            next_cursor: None,
            has_more: false,
        }))
    }

    async fn refresh_token(&self, _params: RefreshParams) -> Result<TokenSet, ConnectorError> {
        let call = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.refresh_started.lock().unwrap().push(Instant::now());
        let running = self.refreshes_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_refreshes_in_flight
            .fetch_max(running, Ordering::SeqCst);
        if !self.refresh_delay.is_zero() {
            tokio::time::sleep(self.refresh_delay).await;
        }
        self.refreshes_in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(error) = self.refresh_script.lock().unwrap().pop_front() {
            return Err(error);
        }

        let token = format!("fresh-{call}");
        *self.valid_token.lock().unwrap() = token.clone();
        Ok(TokenSet {
            access_token: Zeroizing::new(token),
            refresh_token: Some(Zeroizing::new(format!("rotated-{call}"))),
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
        })
    }

    async fn handle_webhook(&self, params: WebhookParams) -> Result<u64, ConnectorError> {
        self.check_token(&params.access_token)?;
        let items = params
            .payload
            .get("events")
            .and_then(|events| events.as_u64())
            .unwrap_or(1);
        self.webhook_items.fetch_add(items, Ordering::SeqCst);
        Ok(items)
    }
}

/// Registry holding `connector` under each of `providers`, all webhook-capable.
pub fn registry_with(connector: Arc<ScriptedConnector>, providers: &[&str]) -> Arc<Registry> {
    let mut registry = Registry::new();
    for provider in providers {
        registry.register(
            connector.clone(),
            ProviderMetadata::new(*provider, AuthType::OAuth2, true),
        );
    }
    Arc::new(registry)
}

pub fn test_config() -> AppConfig {
    AppConfig {
        profile: "test".to_string(),
        operator_tokens: vec![TEST_OPERATOR_TOKEN.to_string()],
        crypto_key: Some(vec![7u8; 32]),
        ..AppConfig::default()
    }
}

/// HTTP state over `db` using `config` for verification and auth.
pub fn app_state(
    db: DatabaseConnection,
    config: AppConfig,
    registry: Arc<Registry>,
    clock: SharedClock,
) -> AppState {
    AppState {
        verifier: WebhookVerifier::from_config(&config, clock.clone()),
        config: Arc::new(config),
        jobs: SyncJobRepository::new(db.clone()),
        connections: ConnectionRepository::new(db.clone(), test_crypto_key()),
        db,
        registry,
        clock,
    }
}
