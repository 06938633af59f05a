//! Connector trait definition
//!
//! The engine never talks to a provider API itself; it drives implementations of
//! [`Connector`]. Errors are reported as [`ConnectorError`] and classified by the
//! backoff policy into retry, refresh or permanent-failure decisions.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::models::connection::Model as Connection;

/// Failure reported by a provider call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectorError {
    /// Non-success HTTP response. `headers` is kept so `Retry-After` can be honored.
    #[error("HTTP error {status}")]
    HttpError {
        status: u16,
        body: Option<String>,
        headers: Vec<(String, String)>,
    },
    /// Provider signalled a quota problem outside of HTTP status codes.
    #[error("rate limit exceeded")]
    RateLimitError { retry_after: Option<u64> },
    #[error("network error: {details}")]
    NetworkError { details: String },
    /// OAuth token endpoint rejected the grant (`error_code` is the RFC 6749 `error`).
    #[error("authentication error: {details}")]
    AuthenticationError {
        details: String,
        error_code: Option<String>,
    },
    #[error("malformed response: {details}")]
    MalformedResponse { details: String },
    #[error("configuration error: {details}")]
    ConfigurationError { details: String },
}

impl ConnectorError {
    pub fn http(status: u16) -> Self {
        ConnectorError::HttpError {
            status,
            body: None,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let ConnectorError::HttpError { headers, .. } = &mut self {
            headers.push((name.to_string(), value.to_string()));
        }
        self
    }

    /// Case-insensitive header lookup on HTTP errors.
    pub fn header(&self, name: &str) -> Option<&str> {
        match self {
            ConnectorError::HttpError { headers, .. } => headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ConnectorError::HttpError { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Opaque pagination cursor owned by the connector.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Cursor(pub serde_json::Value);

impl From<Cursor> for serde_json::Value {
    fn from(cursor: Cursor) -> Self {
        cursor.0
    }
}

impl From<serde_json::Value> for Cursor {
    fn from(value: serde_json::Value) -> Self {
        Cursor(value)
    }
}

/// Secret-free view of a connection handed to connectors.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionContext {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub provider_slug: String,
    pub external_id: String,
    pub metadata: Option<serde_json::Value>,
}

impl From<&Connection> for ConnectionContext {
    fn from(connection: &Connection) -> Self {
        Self {
            id: connection.id,
            tenant_id: connection.tenant_id,
            provider_slug: connection.provider_slug.clone(),
            external_id: connection.external_id.clone(),
            metadata: connection.metadata.clone(),
        }
    }
}

/// Fresh credentials returned by a refresh. Debug output never shows token material.
#[derive(Clone)]
pub struct TokenSet {
    pub access_token: Zeroizing<String>,
    /// Present only when the provider rotated the refresh token.
    pub refresh_token: Option<Zeroizing<String>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

pub struct SyncParams {
    pub connection: ConnectionContext,
    pub access_token: Zeroizing<String>,
    pub cursor: Option<Cursor>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncResult {
    pub items_processed: u64,
    pub next_cursor: Option<Cursor>,
    pub has_more: bool,
}

pub struct RefreshParams {
    pub connection: ConnectionContext,
    pub refresh_token: Zeroizing<String>,
}

pub struct WebhookParams {
    pub connection: ConnectionContext,
    pub access_token: Zeroizing<String>,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Pull changes since `cursor` (or everything when absent).
    async fn sync(&self, params: SyncParams) -> Result<SyncResult, ConnectorError>;

    /// Exchange the refresh token for new credentials.
    async fn refresh_token(&self, params: RefreshParams) -> Result<TokenSet, ConnectorError>;

    /// Process one verified webhook delivery; returns the number of items handled.
    async fn handle_webhook(&self, params: WebhookParams) -> Result<u64, ConnectorError>;
}
