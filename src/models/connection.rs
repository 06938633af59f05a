//! Connection entity model
//!
//! A connection is a tenant-scoped authorization to one provider account. Token
//! material is stored encrypted (see [`crate::crypto`]); the scheduler's cadence
//! bookkeeping lives in the trailing columns.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Credential lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[sea_orm(string_value = "active")]
    Active,
    /// Refresh failed permanently; needs operator attention.
    #[sea_orm(string_value = "error")]
    Error,
    /// Provider reported the grant as revoked.
    #[sea_orm(string_value = "revoked")]
    Revoked,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "connections")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub tenant_id: Uuid,

    pub provider_slug: String,

    /// Provider-side account identifier (unique per tenant & provider)
    pub external_id: String,

    pub display_name: Option<String>,

    pub status: ConnectionStatus,

    pub access_token_ciphertext: Option<Vec<u8>>,

    pub refresh_token_ciphertext: Option<Vec<u8>>,

    /// Access token expiry, when the provider reports one
    pub expires_at: Option<DateTimeWithTimeZone>,

    #[sea_orm(column_type = "JsonBinary")]
    pub scopes: Option<JsonValue>,

    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: Option<JsonValue>,

    /// Per-connection cadence override. Untrusted: validated on every read.
    pub sync_interval_seconds: Option<i64>,

    /// Earliest time the scheduler reconsiders this connection
    pub next_run_at: Option<DateTimeWithTimeZone>,

    /// Jitter sampled for the most recently scheduled job
    pub last_jitter_seconds: Option<i64>,

    /// Anchor for the very first interval
    pub first_activated_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::sync_job::Entity")]
    SyncJobs,
}

impl Related<super::sync_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SyncJobs.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
