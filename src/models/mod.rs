//! # Data Models
//!
//! SeaORM entities for the two tables the engine owns.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod connection;
pub mod sync_job;

pub use connection::{ConnectionStatus, Entity as Connection};
pub use sync_job::{Entity as SyncJob, JobStatus, JobType};

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    pub service: String,
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
