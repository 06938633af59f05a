//! # Webhook Handlers
//!
//! Public ingestion endpoint for provider callbacks. Every request passes the
//! [`WebhookVerifier`](crate::webhook_verification::WebhookVerifier) before the
//! body is parsed; only admitted deliveries become webhook jobs.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, Request, State},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tracing::{debug, info, warn};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::error::{ApiError, EngineError, validation_error};
use crate::models::connection::Model as ConnectionModel;
use crate::server::AppState;
use crate::webhook_verification::{
    GITHUB_SIGNATURE_HEADER, SLACK_SIGNATURE_HEADER, SLACK_TIMESTAMP_HEADER, Verified,
};

/// Maximum accepted webhook body.
pub const MAX_WEBHOOK_BODY_BYTES: usize = 1024 * 1024;

pub const CONNECTION_ID_HEADER: &str = "x-connection-id";

/// Headers never persisted with the job payload.
const FILTERED_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "proxy-authorization",
    "x-api-key",
    "x-auth-token",
    "x-webhook-secret",
    GITHUB_SIGNATURE_HEADER,
    "x-hub-signature",
    SLACK_SIGNATURE_HEADER,
    SLACK_TIMESTAMP_HEADER,
];

/// Path parameters for public webhook routes
#[derive(Debug, Deserialize, IntoParams)]
pub struct ProviderTenantPath {
    /// Provider slug (e.g., "github", "slack", "zoho-cliq")
    #[param(min_length = 1, example = "github")]
    pub provider: String,
    /// Tenant UUID for scoping the webhook
    #[param(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub tenant_id: String,
}

/// Webhook accept response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WebhookAcceptResponse {
    /// Acceptance status
    pub status: String,
    /// Queued webhook job
    pub job_id: Uuid,
    pub connection_id: Uuid,
}

/// Ingest a provider webhook
#[utoipa::path(
    post,
    path = "/webhooks/{provider}/{tenant_id}",
    params(ProviderTenantPath),
    request_body(content = String, description = "Raw provider payload (JSON)", content_type = "application/json"),
    responses(
        (status = 202, description = "Webhook accepted and queued", body = WebhookAcceptResponse),
        (status = 400, description = "Malformed request", body = ApiError),
        (status = 401, description = "Signature or credential rejected", body = ApiError),
        (status = 404, description = "Unknown provider or connection", body = ApiError),
        (status = 413, description = "Body too large", body = ApiError),
        (status = 429, description = "Admission limit exceeded", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn ingest_public_webhook(
    State(state): State<AppState>,
    Path(path): Path<ProviderTenantPath>,
    request: Request,
) -> Result<(StatusCode, Json<WebhookAcceptResponse>), ApiError> {
    let provider_slug = path.provider;
    let tenant_id = path.tenant_id.parse::<Uuid>().map_err(|_| {
        validation_error(
            "Invalid tenant ID",
            json!({ "tenant_id": "Must be a valid UUID" }),
        )
    })?;

    let (parts, body) = request.into_parts();
    let headers = parts.headers;
    let body = axum::body::to_bytes(body, MAX_WEBHOOK_BODY_BYTES)
        .await
        .map_err(|err| {
            warn!(provider_slug = %provider_slug, error = %err, "failed to read webhook body");
            ApiError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "PAYLOAD_TOO_LARGE",
                format!("Webhook body exceeds {MAX_WEBHOOK_BODY_BYTES} bytes"),
            )
        })?;

    let source = format!("{provider_slug}:{tenant_id}");
    let verified = state
        .verifier
        .verify(&provider_slug, &source, &headers, &body)
        .map_err(EngineError::from)?;

    if !state.registry.supports_webhooks(&provider_slug) {
        info!(provider_slug = %provider_slug, "webhook for provider without webhook support");
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("provider '{provider_slug}' does not accept webhooks"),
        ));
    }

    let connection = resolve_connection(&state, tenant_id, &provider_slug, &headers).await?;

    let payload: JsonValue = serde_json::from_slice(&body).map_err(|err| {
        validation_error(
            "Invalid webhook payload",
            json!({ "body": format!("Body must be JSON: {err}") }),
        )
    })?;

    let verification = match verified {
        Verified::Operator => "operator",
        Verified::Signature => "signature",
    };
    let envelope = json!({
        "payload": payload,
        "headers": persisted_headers(&headers),
        "verification": verification,
    });

    let job = state
        .jobs
        .enqueue_webhook_job(&connection, envelope, state.clock.now())
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookAcceptResponse {
            status: "accepted".to_string(),
            job_id: job.id,
            connection_id: connection.id,
        }),
    ))
}

/// Picks the target connection: the `X-Connection-Id` header when present,
/// otherwise the tenant's only active connection for the provider.
async fn resolve_connection(
    state: &AppState,
    tenant_id: Uuid,
    provider_slug: &str,
    headers: &HeaderMap,
) -> Result<ConnectionModel, ApiError> {
    let requested = headers
        .get(CONNECTION_ID_HEADER)
        .map(|value| {
            value
                .to_str()
                .ok()
                .and_then(|raw| raw.trim().parse::<Uuid>().ok())
                .ok_or_else(|| {
                    validation_error(
                        "Invalid X-Connection-Id header",
                        json!({ "X-Connection-Id": "Must be a valid UUID" }),
                    )
                })
        })
        .transpose()?;

    let mut active = state
        .connections
        .find_active_by_tenant_and_provider(tenant_id, provider_slug)
        .await?;

    let not_found = || {
        ApiError::new(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "connection not found for tenant/provider",
        )
    };

    match requested {
        Some(connection_id) => active
            .into_iter()
            .find(|connection| connection.id == connection_id)
            .ok_or_else(|| {
                debug!(%connection_id, %tenant_id, provider_slug, "webhook target not active");
                not_found()
            }),
        None if active.len() == 1 => Ok(active.remove(0)),
        None if active.is_empty() => Err(not_found()),
        None => Err(validation_error(
            "Ambiguous webhook target",
            json!({
                "X-Connection-Id": format!(
                    "Required when the tenant has {} active connections for this provider",
                    active.len()
                )
            }),
        )),
    }
}

/// Lower-cased, UTF-8 request headers minus credentials and signatures.
fn persisted_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !FILTERED_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}
