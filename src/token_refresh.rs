//! # Token Refresh Service
//!
//! Keeps provider credentials usable. A periodic sweep refreshes tokens that are
//! about to expire; callers that hit a 401 refresh on demand through
//! [`TokenRefreshService::call_with_fresh_token`]. Both paths share a per-connection
//! single-flight guard, so concurrent triggers cost one upstream call.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Duration;
use metrics::{counter, histogram};
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, instrument, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::backoff::{OAuthFailure, classify_refresh_error};
use crate::clock::SharedClock;
use crate::config::TokenRefreshConfig;
use crate::connectors::{ConnectionContext, ConnectorError, RefreshParams, Registry, TokenSet};
use crate::error::EngineError;
use crate::models::connection::{ConnectionStatus, Model as Connection};
use crate::repositories::ConnectionRepository;
use crate::single_flight::{Abandoned, Role, SingleFlight};
use crate::task::PeriodicTask;

/// Connections examined per sweep.
const SWEEP_BATCH: u64 = 500;

/// Why a refresh produced no usable token. Cloneable so every coalesced caller
/// receives the same outcome.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RefreshError {
    #[error("connection {0} not found")]
    NotFound(Uuid),
    #[error("connection {connection_id} is {status:?}")]
    Inactive {
        connection_id: Uuid,
        status: ConnectionStatus,
    },
    #[error("connection {0} has no refresh token")]
    NoRefreshToken(Uuid),
    #[error("provider '{0}' is not registered")]
    UnknownProvider(String),
    #[error("refresh rejected permanently for connection {connection_id}: {detail}")]
    Permanent { connection_id: Uuid, detail: String },
    #[error("credential revoked for connection {0}")]
    Revoked(Uuid),
    #[error("token endpoint rate limited")]
    RateLimited { retry_after: Option<u64> },
    #[error("transient refresh failure: {0}")]
    Transient(String),
    #[error("credential storage failure: {0}")]
    Storage(String),
}

impl RefreshError {
    /// Label used for `token_refresh_failure_total`.
    pub fn classification(&self) -> &'static str {
        match self {
            RefreshError::Permanent { .. }
            | RefreshError::NoRefreshToken(_)
            | RefreshError::Inactive { .. }
            | RefreshError::UnknownProvider(_)
            | RefreshError::NotFound(_) => "permanent",
            RefreshError::Revoked(_) => "revoked",
            RefreshError::RateLimited { .. } => "rate_limited",
            RefreshError::Transient(_) | RefreshError::Storage(_) => "transient",
        }
    }

    /// Whether the connection can no longer be used without user action.
    pub fn is_permanent(&self) -> bool {
        matches!(self.classification(), "permanent" | "revoked")
    }
}

impl From<EngineError> for RefreshError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound { id, .. } => RefreshError::NotFound(id),
            other => RefreshError::Storage(other.to_string()),
        }
    }
}

impl From<RefreshError> for EngineError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::NotFound(id) => EngineError::NotFound {
                entity: "connection",
                id,
            },
            RefreshError::RateLimited { retry_after } => EngineError::RateLimited {
                retry_after_seconds: retry_after.unwrap_or(0),
            },
            RefreshError::Transient(detail) | RefreshError::Storage(detail) => {
                EngineError::Transient { detail }
            }
            RefreshError::Revoked(connection_id) => EngineError::PermanentAuthFailure {
                connection_id,
                detail: "revoked".to_string(),
            },
            RefreshError::Permanent {
                connection_id,
                detail,
            } => EngineError::PermanentAuthFailure {
                connection_id,
                detail,
            },
            other @ (RefreshError::Inactive { .. }
            | RefreshError::NoRefreshToken(_)
            | RefreshError::UnknownProvider(_)) => EngineError::Transient {
                detail: other.to_string(),
            },
        }
    }
}

/// Failure of an operation run through [`TokenRefreshService::call_with_fresh_token`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum FreshTokenError {
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error(transparent)]
    Refresh(#[from] RefreshError),
}

type RefreshOutcome = Result<TokenSet, RefreshError>;

#[derive(Debug, Default)]
struct SweepStats {
    due: usize,
    succeeded: u64,
    failed: u64,
    skipped: u64,
}

/// Background token refresh service
pub struct TokenRefreshService {
    config: TokenRefreshConfig,
    refresher: Arc<Refresher>,
    in_flight: SingleFlight<Uuid, RefreshOutcome>,
}

/// The call-then-persist sequence. Owned by an `Arc` so a coalesced refresh can
/// run on its own task and outlive the caller that started it.
struct Refresher {
    connections: ConnectionRepository,
    registry: Arc<Registry>,
    clock: SharedClock,
}

impl TokenRefreshService {
    pub fn new(
        config: TokenRefreshConfig,
        connections: ConnectionRepository,
        registry: Arc<Registry>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            refresher: Arc::new(Refresher {
                connections,
                registry,
                clock,
            }),
            in_flight: SingleFlight::new(),
        }
    }

    pub fn connections(&self) -> &ConnectionRepository {
        &self.refresher.connections
    }

    /// Runs the sweep every `tick_seconds` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let period = std::time::Duration::from_secs(self.config.tick_seconds);
        PeriodicTask::new("token_refresh", period)
            .run(shutdown, |token| {
                let service = self.clone();
                async move { service.sweep(token).await }
            })
            .await;
    }

    /// One pass over connections expiring within the lead time.
    #[instrument(skip_all)]
    pub async fn sweep(self: Arc<Self>, shutdown: CancellationToken) {
        let started = Instant::now();
        let now = self.refresher.clock.now();
        let lead = Duration::seconds(self.config.lead_time_seconds as i64);

        let due = match self
            .connections()
            .list_due_for_refresh(now, lead, SWEEP_BATCH)
            .await
        {
            Ok(due) => due,
            Err(err) => {
                error!(error = %err, "failed to load connections due for refresh");
                return;
            }
        };

        let mut stats = SweepStats {
            due: due.len(),
            ..SweepStats::default()
        };
        info!(
            due = stats.due,
            lead_time_seconds = self.config.lead_time_seconds,
            "token refresh sweep started"
        );

        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1) as usize));
        let max_jitter_ms =
            (self.config.jitter_factor * self.config.lead_time_seconds as f64 * 1_000.0) as u64;
        let mut tasks = JoinSet::new();

        for connection in due {
            if shutdown.is_cancelled() {
                info!("shutdown requested; no further refreshes scheduled");
                break;
            }

            let delay = if max_jitter_ms > 0 {
                std::time::Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter_ms))
            } else {
                std::time::Duration::ZERO
            };
            let service = self.clone();
            let permits = permits.clone();
            let shutdown = shutdown.clone();

            tasks.spawn(async move {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
                let _permit = permits.acquire_owned().await.ok()?;
                if shutdown.is_cancelled() {
                    return None;
                }
                Some(service.refresh(connection.id).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(Ok(_))) => stats.succeeded += 1,
                Ok(Some(Err(_))) => stats.failed += 1,
                Ok(None) => stats.skipped += 1,
                Err(err) => {
                    stats.failed += 1;
                    error!(error = %err, "refresh task panicked");
                }
            }
        }

        histogram!("token_refresh_tick_duration_ms")
            .record(started.elapsed().as_secs_f64() * 1_000.0);
        info!(
            due = stats.due,
            succeeded = stats.succeeded,
            failed = stats.failed,
            skipped = stats.skipped,
            "token refresh sweep finished"
        );
    }

    /// Refreshes one connection, joining an in-flight refresh if there is one.
    /// The refresh itself runs detached: a caller that times out or is dropped
    /// leaves it to finish and persist for everyone else.
    pub async fn refresh(&self, connection_id: Uuid) -> RefreshOutcome {
        let refresher = self.refresher.clone();
        let joined = self
            .in_flight
            .run(connection_id, move || {
                async move { refresher.refresh(connection_id).await }.in_current_span()
            })
            .await;

        match joined {
            Ok((outcome, role)) => {
                if role == Role::Follower {
                    counter!("token_refresh_coalesced_total").increment(1);
                    debug!(%connection_id, "joined in-flight token refresh");
                }
                outcome
            }
            Err(Abandoned) => {
                error!(%connection_id, "token refresh task ended without a result");
                Err(RefreshError::Transient("refresh task aborted".to_string()))
            }
        }
    }

    /// Runs `op` with the connection's current access token. On a 401 the token is
    /// refreshed (coalesced with concurrent callers) and `op` is retried exactly once.
    pub async fn call_with_fresh_token<T, F, Fut>(
        &self,
        connection_id: Uuid,
        mut op: F,
    ) -> Result<T, FreshTokenError>
    where
        F: FnMut(Zeroizing<String>) -> Fut,
        Fut: Future<Output = Result<T, ConnectorError>>,
    {
        let connections = self.connections();
        let connection = connections
            .get_by_id(connection_id)
            .await
            .map_err(RefreshError::from)?
            .ok_or(RefreshError::NotFound(connection_id))?;

        let current = connections
            .decrypt_tokens(&connection)
            .map_err(|err| RefreshError::Storage(err.to_string()))?
            .access_token;

        let token = match current {
            Some(token) => token,
            None => self.refresh(connection_id).await?.access_token,
        };

        match op(token).await {
            Err(err) if err.status() == Some(401) => {
                debug!(%connection_id, "provider returned 401; refreshing token");
                let fresh = self.refresh(connection_id).await?;
                Ok(op(fresh.access_token).await?)
            }
            other => Ok(other?),
        }
    }
}

impl Refresher {
    #[instrument(skip_all, fields(connection_id = %connection_id))]
    async fn refresh(&self, connection_id: Uuid) -> RefreshOutcome {
        let connection = self
            .connections
            .get_by_id(connection_id)
            .await?
            .ok_or(RefreshError::NotFound(connection_id))?;

        if connection.status != ConnectionStatus::Active {
            return Err(RefreshError::Inactive {
                connection_id,
                status: connection.status,
            });
        }

        let refresh_token = self
            .connections
            .decrypt_tokens(&connection)
            .map_err(|err| RefreshError::Storage(err.to_string()))?
            .refresh_token
            .ok_or(RefreshError::NoRefreshToken(connection_id))?;

        let connector = self
            .registry
            .get(&connection.provider_slug)
            .map_err(|_| RefreshError::UnknownProvider(connection.provider_slug.clone()))?;

        counter!("token_refresh_attempts_total").increment(1);
        let started = Instant::now();
        let result = connector
            .refresh_token(RefreshParams {
                connection: ConnectionContext::from(&connection),
                refresh_token,
            })
            .await;
        histogram!("token_refresh_latency_ms").record(started.elapsed().as_secs_f64() * 1_000.0);

        let outcome = match result {
            Ok(tokens) => self.persist(&connection, tokens).await,
            Err(err) => Err(self.handle_failure(&connection, &err).await),
        };

        match &outcome {
            Ok(_) => {
                counter!("token_refresh_success_total").increment(1);
                info!(
                    provider_slug = %connection.provider_slug,
                    "refreshed connection tokens"
                );
            }
            Err(err) => {
                counter!(
                    "token_refresh_failure_total",
                    "classification" => err.classification()
                )
                .increment(1);
            }
        }
        outcome
    }

    async fn persist(&self, connection: &Connection, tokens: TokenSet) -> RefreshOutcome {
        self.connections
            .apply_refreshed_tokens(connection, &tokens, self.clock.now())
            .await
            .map_err(|err| {
                error!(error = %err, "failed to persist refreshed tokens");
                RefreshError::Storage(err.to_string())
            })?;
        Ok(tokens)
    }

    /// Classifies a provider failure and moves the connection out of the active
    /// set when the credential is dead.
    async fn handle_failure(&self, connection: &Connection, err: &ConnectorError) -> RefreshError {
        let classification = classify_refresh_error(err);
        let (error, status) = match classification {
            OAuthFailure::Revoked => (
                RefreshError::Revoked(connection.id),
                Some(ConnectionStatus::Revoked),
            ),
            OAuthFailure::Permanent => (
                RefreshError::Permanent {
                    connection_id: connection.id,
                    detail: err.to_string(),
                },
                Some(ConnectionStatus::Error),
            ),
            OAuthFailure::RateLimited => {
                let retry_after = match err {
                    ConnectorError::RateLimitError { retry_after } => *retry_after,
                    other => other
                        .header("retry-after")
                        .and_then(|value| value.trim().parse().ok()),
                };
                (RefreshError::RateLimited { retry_after }, None)
            }
            OAuthFailure::Transient => (RefreshError::Transient(err.to_string()), None),
        };

        match status {
            Some(status) => {
                error!(
                    provider_slug = %connection.provider_slug,
                    classification = classification.as_str(),
                    ?status,
                    "token refresh failed permanently; deactivating connection"
                );
                if let Err(db_err) = self
                    .connections
                    .mark_status(self.connections.db(), connection.id, status, self.clock.now())
                    .await
                {
                    error!(error = %db_err, "failed to record connection status");
                }
            }
            None => warn!(
                provider_slug = %connection.provider_slug,
                classification = classification.as_str(),
                "token refresh failed; connection stays active"
            ),
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_labels() {
        let id = Uuid::new_v4();
        assert_eq!(RefreshError::Revoked(id).classification(), "revoked");
        assert!(RefreshError::Revoked(id).is_permanent());
        assert!(!RefreshError::Transient("x".into()).is_permanent());
        assert_eq!(
            RefreshError::RateLimited { retry_after: None }.classification(),
            "rate_limited"
        );
    }

    #[test]
    fn permanent_failures_map_to_engine_errors() {
        let id = Uuid::new_v4();
        assert!(matches!(
            EngineError::from(RefreshError::Revoked(id)),
            EngineError::PermanentAuthFailure { connection_id, .. } if connection_id == id
        ));
        assert!(matches!(
            EngineError::from(RefreshError::RateLimited { retry_after: Some(9) }),
            EngineError::RateLimited { retry_after_seconds: 9 }
        ));
    }
}
