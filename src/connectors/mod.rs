//! Connector SDK: the provider capability trait, provider metadata, the registry
//! and a bundled example connector for local development.

pub mod example;
pub mod metadata;
pub mod registry;
pub mod trait_;

pub use example::{EXAMPLE_PROVIDER, ExampleConnector, register_example_connector};
pub use metadata::{AuthType, ProviderMetadata};
pub use registry::{Registry, RegistryError};
pub use trait_::{
    ConnectionContext, Connector, ConnectorError, Cursor, RefreshParams, SyncParams, SyncResult,
    TokenSet, WebhookParams,
};
