//! Provider registry
//!
//! Owned map from provider slug to connector and metadata. Built once at startup
//! and shared behind an `Arc`; there is no process-wide instance.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::connectors::{Connector, ProviderMetadata};

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("Provider '{name}' not found")]
    ProviderNotFound { name: String },
}

#[derive(Clone, Default)]
pub struct Registry {
    connectors: HashMap<String, Arc<dyn Connector>>,
    metadata: HashMap<String, ProviderMetadata>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the connectors bundled in this crate. The example connector
    /// is only available to the `local` and `test` profiles.
    pub fn with_builtin(config: &AppConfig) -> Self {
        let mut registry = Self::new();
        if matches!(config.profile.as_str(), "local" | "test") {
            crate::connectors::example::register_example_connector(&mut registry);
        } else {
            tracing::info!(profile = %config.profile, "no built-in connectors for profile");
        }
        registry
    }

    pub fn register(&mut self, connector: Arc<dyn Connector>, metadata: ProviderMetadata) {
        let name = metadata.name.clone();
        self.connectors.insert(name.clone(), connector);
        self.metadata.insert(name, metadata);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Connector>, RegistryError> {
        self.connectors
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::ProviderNotFound {
                name: name.to_string(),
            })
    }

    pub fn get_metadata(&self, name: &str) -> Result<&ProviderMetadata, RegistryError> {
        self.metadata
            .get(name)
            .ok_or_else(|| RegistryError::ProviderNotFound {
                name: name.to_string(),
            })
    }

    /// Metadata sorted by provider name.
    pub fn list_metadata(&self) -> Vec<ProviderMetadata> {
        let mut metadata: Vec<_> = self.metadata.values().cloned().collect();
        metadata.sort_by(|a, b| a.name.cmp(&b.name));
        metadata
    }

    pub fn supports_webhooks(&self, name: &str) -> bool {
        self.metadata.get(name).is_some_and(|m| m.webhooks)
    }
}
