//! Connection repository for database operations
//!
//! Owns every write to the credential columns of `connections`. Tokens are
//! encrypted before any statement is issued, so a failed encryption never leaves
//! a half-written row behind.

use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, IntoActiveModel, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::connectors::TokenSet;
use crate::crypto::{CryptoKey, DecryptedTokens, decrypt_connection_tokens, encrypt_token};
use crate::db::to_db_time;
use crate::error::EngineError;
use crate::models::connection::{self, ConnectionStatus, Entity as Connection};
use crate::repositories::sync_metadata::with_sync_cursor;

/// Input for creating a connection together with its initial credentials.
pub struct NewConnection<'a> {
    pub tenant_id: Uuid,
    pub provider_slug: &'a str,
    pub external_id: &'a str,
    pub display_name: Option<&'a str>,
    pub access_token: &'a str,
    pub refresh_token: Option<&'a str>,
    pub expires_at: Option<DateTime<Utc>>,
    pub sync_interval_seconds: Option<i64>,
}

/// Repository for connection database operations
#[derive(Debug, Clone)]
pub struct ConnectionRepository {
    db: DatabaseConnection,
    crypto_key: CryptoKey,
}

impl ConnectionRepository {
    pub fn new(db: DatabaseConnection, crypto_key: CryptoKey) -> Self {
        Self { db, crypto_key }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Creates a connection with encrypted tokens; `now` becomes the scheduling anchor.
    pub async fn create_with_tokens(
        &self,
        new: NewConnection<'_>,
        now: DateTime<Utc>,
    ) -> Result<connection::Model, EngineError> {
        let now = to_db_time(now);
        let mut model = connection::Model {
            id: Uuid::new_v4(),
            tenant_id: new.tenant_id,
            provider_slug: new.provider_slug.to_string(),
            external_id: new.external_id.to_string(),
            display_name: new.display_name.map(str::to_string),
            status: ConnectionStatus::Active,
            access_token_ciphertext: None,
            refresh_token_ciphertext: None,
            expires_at: new.expires_at.map(to_db_time),
            scopes: None,
            metadata: None,
            sync_interval_seconds: new.sync_interval_seconds,
            next_run_at: None,
            last_jitter_seconds: None,
            first_activated_at: Some(now),
            created_at: now,
            updated_at: now,
        };

        // The AAD only needs the identity columns, which are already final.
        model.access_token_ciphertext =
            Some(encrypt_token(&self.crypto_key, &model, new.access_token)?);
        model.refresh_token_ciphertext = new
            .refresh_token
            .map(|token| encrypt_token(&self.crypto_key, &model, token))
            .transpose()?;

        let id = model.id;
        let active: connection::ActiveModel = model.into_active_model().reset_all();
        match Connection::insert(active).exec(&self.db).await {
            Ok(_) | Err(sea_orm::DbErr::UnpackInsertId) => {}
            Err(err) => return Err(err.into()),
        }

        self.get_by_id(id)
            .await?
            .ok_or(EngineError::NotFound {
                entity: "connection",
                id,
            })
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<connection::Model>, EngineError> {
        Ok(Connection::find_by_id(id).one(&self.db).await?)
    }

    pub async fn require(&self, id: Uuid) -> Result<connection::Model, EngineError> {
        self.get_by_id(id).await?.ok_or(EngineError::NotFound {
            entity: "connection",
            id,
        })
    }

    /// Active connections of a tenant for one provider, oldest first.
    pub async fn find_active_by_tenant_and_provider(
        &self,
        tenant_id: Uuid,
        provider_slug: &str,
    ) -> Result<Vec<connection::Model>, EngineError> {
        Ok(Connection::find()
            .filter(connection::Column::TenantId.eq(tenant_id))
            .filter(connection::Column::ProviderSlug.eq(provider_slug))
            .filter(connection::Column::Status.eq(ConnectionStatus::Active))
            .order_by_asc(connection::Column::CreatedAt)
            .order_by_asc(connection::Column::Id)
            .all(&self.db)
            .await?)
    }

    /// Decrypts both tokens. Failures are logged without any token material.
    pub fn decrypt_tokens(
        &self,
        connection: &connection::Model,
    ) -> Result<DecryptedTokens, EngineError> {
        decrypt_connection_tokens(&self.crypto_key, connection).map_err(|err| {
            tracing::error!(
                connection_id = %connection.id,
                tenant_id = %connection.tenant_id,
                provider_slug = %connection.provider_slug,
                "Token decryption failed"
            );
            EngineError::from(err)
        })
    }

    /// Active connections holding a refresh token whose access token expires
    /// within `lead`.
    pub async fn list_due_for_refresh(
        &self,
        now: DateTime<Utc>,
        lead: Duration,
        limit: u64,
    ) -> Result<Vec<connection::Model>, EngineError> {
        Ok(Connection::find()
            .filter(connection::Column::Status.eq(ConnectionStatus::Active))
            .filter(connection::Column::RefreshTokenCiphertext.is_not_null())
            .filter(connection::Column::ExpiresAt.is_not_null())
            .filter(connection::Column::ExpiresAt.lte(to_db_time(now + lead)))
            .order_by_asc(connection::Column::ExpiresAt)
            .order_by_asc(connection::Column::Id)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    /// Persists refreshed credentials in their own transaction.
    pub async fn apply_refreshed_tokens(
        &self,
        connection: &connection::Model,
        tokens: &TokenSet,
        now: DateTime<Utc>,
    ) -> Result<connection::Model, EngineError> {
        let txn = self.db.begin().await?;
        let updated = self
            .apply_refreshed_tokens_in_txn(&txn, connection, tokens, now)
            .await?;
        txn.commit().await?;
        Ok(updated)
    }

    /// Writes access ciphertext, rotated refresh ciphertext and expiry in one
    /// UPDATE on `txn`. Nothing is visible until the caller commits.
    pub async fn apply_refreshed_tokens_in_txn(
        &self,
        txn: &DatabaseTransaction,
        connection: &connection::Model,
        tokens: &TokenSet,
        now: DateTime<Utc>,
    ) -> Result<connection::Model, EngineError> {
        let access = encrypt_token(&self.crypto_key, connection, &tokens.access_token)?;
        let refresh = tokens
            .refresh_token
            .as_ref()
            .map(|token| encrypt_token(&self.crypto_key, connection, token))
            .transpose()?;

        let mut active: connection::ActiveModel = connection.clone().into();
        active.access_token_ciphertext = Set(Some(access));
        if let Some(refresh) = refresh {
            active.refresh_token_ciphertext = Set(Some(refresh));
        }
        active.expires_at = Set(tokens.expires_at.map(to_db_time));
        active.updated_at = Set(to_db_time(now));

        Ok(active.update(txn).await?)
    }

    /// Stores the connector cursor under `metadata.sync.cursor`.
    pub async fn store_sync_cursor(
        &self,
        connection_id: Uuid,
        cursor: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let connection = self.require(connection_id).await?;
        let metadata = with_sync_cursor(connection.metadata.clone(), cursor);

        let mut active: connection::ActiveModel = connection.into();
        active.metadata = Set(Some(metadata));
        active.updated_at = Set(to_db_time(now));
        active.update(&self.db).await?;
        Ok(())
    }

    /// Moves a connection out of (or back into) the active set.
    pub async fn mark_status<C: ConnectionTrait>(
        &self,
        conn: &C,
        connection_id: Uuid,
        status: ConnectionStatus,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let result = Connection::update_many()
            .col_expr(connection::Column::Status, status.into())
            .col_expr(connection::Column::UpdatedAt, to_db_time(now).into())
            .filter(connection::Column::Id.eq(connection_id))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(EngineError::NotFound {
                entity: "connection",
                id: connection_id,
            });
        }
        Ok(())
    }
}
