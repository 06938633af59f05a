//! Example connector implementation
//!
//! Deterministic stub used by the `local` profile and by tests. It pages through
//! a fixed number of synthetic items and mints new tokens on every refresh.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use zeroize::Zeroizing;

use crate::connectors::{
    AuthType, Connector, ConnectorError, Cursor, ProviderMetadata, RefreshParams, Registry,
    SyncParams, SyncResult, TokenSet, WebhookParams,
};

/// Provider slug the example connector registers under.
pub const EXAMPLE_PROVIDER: &str = "example";

/// Example stub connector
pub struct ExampleConnector {
    pages: u64,
    page_size: u64,
    refreshes: AtomicU64,
}

impl Default for ExampleConnector {
    fn default() -> Self {
        Self::new(3, 25)
    }
}

impl ExampleConnector {
    pub fn new(pages: u64, page_size: u64) -> Self {
        Self {
            pages: pages.max(1),
            page_size,
            refreshes: AtomicU64::new(0),
        }
    }

    /// Number of refresh calls served so far.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    fn page_of(cursor: Option<&Cursor>) -> Result<u64, ConnectorError> {
        match cursor {
            None => Ok(0),
            Some(Cursor(value)) => value
                .get("page")
                .and_then(|page| page.as_u64())
                .ok_or_else(|| ConnectorError::MalformedResponse {
                    details: format!("unrecognised cursor: {value}"),
                }),
        }
    }
}

#[async_trait]
impl Connector for ExampleConnector {
    async fn sync(&self, params: SyncParams) -> Result<SyncResult, ConnectorError> {
        if params.access_token.is_empty() {
            return Err(ConnectorError::http(401));
        }

        let page = Self::page_of(params.cursor.as_ref())?;
        let next_page = page + 1;
        let has_more = next_page < self.pages;

        tracing::debug!(
            connection_id = %params.connection.id,
            page,
            has_more,
            "example connector sync page"
        );

        Ok(SyncResult {
            items_processed: self.page_size,
            next_cursor: has_more.then(|| Cursor(json!({ "page": next_page }))),
            has_more,
        })
    }

    async fn refresh_token(&self, params: RefreshParams) -> Result<TokenSet, ConnectorError> {
        if params.refresh_token.is_empty() {
            return Err(ConnectorError::AuthenticationError {
                details: "refresh token missing".to_string(),
                error_code: Some("invalid_grant".to_string()),
            });
        }

        let generation = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TokenSet {
            access_token: Zeroizing::new(format!(
                "example-access-{}-{generation}",
                params.connection.id.simple()
            )),
            refresh_token: None,
            expires_at: Some(Utc::now() + Duration::hours(1)),
        })
    }

    async fn handle_webhook(&self, params: WebhookParams) -> Result<u64, ConnectorError> {
        let items = params
            .payload
            .get("events")
            .and_then(|events| events.as_array())
            .map_or(1, |events| events.len() as u64);
        Ok(items)
    }
}

/// Registers the example connector and its metadata.
pub fn register_example_connector(registry: &mut Registry) {
    registry.register(
        Arc::new(ExampleConnector::default()),
        ProviderMetadata::new(EXAMPLE_PROVIDER, AuthType::OAuth2, true).with_scopes(["read"]),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::ConnectionContext;
    use uuid::Uuid;

    fn context() -> ConnectionContext {
        ConnectionContext {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            provider_slug: EXAMPLE_PROVIDER.to_string(),
            external_id: "acct".to_string(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn sync_pages_until_exhausted() {
        let connector = ExampleConnector::new(2, 10);

        let first = connector
            .sync(SyncParams {
                connection: context(),
                access_token: Zeroizing::new("at".into()),
                cursor: None,
            })
            .await
            .unwrap();
        assert!(first.has_more);
        assert_eq!(first.items_processed, 10);

        let second = connector
            .sync(SyncParams {
                connection: context(),
                access_token: Zeroizing::new("at".into()),
                cursor: first.next_cursor,
            })
            .await
            .unwrap();
        assert!(!second.has_more);
        assert!(second.next_cursor.is_none());
    }

    #[tokio::test]
    async fn empty_access_token_is_unauthorized() {
        let err = ExampleConnector::default()
            .sync(SyncParams {
                connection: context(),
                access_token: Zeroizing::new(String::new()),
                cursor: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(401));
    }

    #[tokio::test]
    async fn refresh_mints_distinct_tokens() {
        let connector = ExampleConnector::default();
        let params = || RefreshParams {
            connection: context(),
            refresh_token: Zeroizing::new("rt".into()),
        };
        let a = connector.refresh_token(params()).await.unwrap();
        let b = connector.refresh_token(params()).await.unwrap();
        assert_ne!(*a.access_token, *b.access_token);
        assert!(a.expires_at.is_some());
        assert_eq!(connector.refresh_count(), 2);
    }
}
