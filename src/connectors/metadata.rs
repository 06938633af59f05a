//! Provider metadata catalogue entries.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    /// OAuth 2.0 with refreshable access tokens
    OAuth2,
    /// Long-lived API key; nothing to refresh
    ApiKey,
}

/// Read-only facts the engine needs about a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMetadata {
    pub name: String,
    pub auth_type: AuthType,
    pub scopes: Vec<String>,
    /// Whether inbound webhooks for this provider may become jobs
    pub webhooks: bool,
}

impl ProviderMetadata {
    pub fn new(name: impl Into<String>, auth_type: AuthType, webhooks: bool) -> Self {
        Self {
            name: name.into(),
            auth_type,
            scopes: Vec::new(),
            webhooks,
        }
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Only OAuth providers participate in token refresh.
    pub fn supports_refresh(&self) -> bool {
        matches!(self.auth_type, AuthType::OAuth2)
    }
}
