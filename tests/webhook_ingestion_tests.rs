//! End-to-end webhook ingestion through the router.

mod test_utils;

use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
    response::Response,
};
use chrono::Duration;
use hmac::{Hmac, Mac};
use serde_json::{Value as JsonValue, json};
use sha2::Sha256;
use tower::ServiceExt;
use uuid::Uuid;

use connector_sync::clock::ManualClock;
use connector_sync::config::AppConfig;
use connector_sync::models::connection::Model as ConnectionModel;
use connector_sync::models::sync_job::{JobStatus, JobType};
use connector_sync::repositories::ConnectionRepository;
use connector_sync::server::create_app;

use test_utils::{
    ConnectionFixture, ScriptedConnector, TEST_OPERATOR_TOKEN, app_state, at, create_connection,
    jobs_for, manual_clock, registry_with, setup_test_db, test_config, test_crypto_key,
};

const GITHUB_SECRET: &str = "gh-webhook-secret";
const SLACK_SECRET: &str = "slack-signing-secret";

type HmacSha256 = Hmac<Sha256>;

struct Harness {
    app: Router,
    db: sea_orm::DatabaseConnection,
    repo: ConnectionRepository,
    clock: Arc<ManualClock>,
}

fn webhook_config() -> AppConfig {
    let mut config = test_config();
    config.webhooks.github_secret = Some(GITHUB_SECRET.to_string());
    config.webhooks.slack_signing_secret = Some(SLACK_SECRET.to_string());
    config
}

async fn harness(config: AppConfig) -> Harness {
    let db = setup_test_db().await.expect("db");
    let (clock, shared) = manual_clock(at(12, 0, 0));
    let registry = registry_with(
        Arc::new(ScriptedConnector::new("access-0")),
        &["github", "slack", "jira"],
    );
    let app = create_app(app_state(db.clone(), config, registry, shared));
    Harness {
        app,
        repo: ConnectionRepository::new(db.clone(), test_crypto_key()),
        db,
        clock,
    }
}

async fn connection_for(h: &Harness, tenant_id: Uuid, provider: &str) -> ConnectionModel {
    create_connection(
        &h.repo,
        ConnectionFixture {
            tenant_id,
            provider_slug: provider,
            ..Default::default()
        },
        at(11, 0, 0),
    )
    .await
}

fn github_signature(body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(GITHUB_SECRET.as_bytes()).expect("hmac key");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn slack_signature(timestamp: i64, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(SLACK_SECRET.as_bytes()).expect("hmac key");
    mac.update(format!("v0:{timestamp}:").as_bytes());
    mac.update(body);
    format!("v0={}", hex::encode(mac.finalize().into_bytes()))
}

fn post(uri: &str, headers: &[(&str, &str)], body: &[u8]) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::from(body.to_vec())).expect("request")
}

async fn send(h: &Harness, request: Request<Body>) -> Response {
    h.app.clone().oneshot(request).await.expect("response")
}

async fn json_body(response: Response) -> JsonValue {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn signed_github_delivery_is_queued() {
    let h = harness(webhook_config()).await;
    let tenant = Uuid::new_v4();
    let connection = connection_for(&h, tenant, "github").await;

    let body = br#"{"action":"opened","number":7}"#;
    let signature = github_signature(body);
    let response = send(
        &h,
        post(
            &format!("/webhooks/github/{tenant}"),
            &[
                ("x-hub-signature-256", signature.as_str()),
                ("x-github-event", "pull_request"),
            ],
            body,
        ),
    )
    .await;

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let accepted = json_body(response).await;
    assert_eq!(accepted["status"], "accepted");
    assert_eq!(accepted["connection_id"], json!(connection.id));

    let jobs = jobs_for(&h.db, connection.id).await;
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job.job_type, JobType::Webhook);
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(accepted["job_id"], json!(job.id));

    let envelope = job.cursor.as_ref().expect("envelope");
    assert_eq!(envelope["payload"]["number"], 7);
    assert_eq!(envelope["verification"], "signature");
    assert_eq!(envelope["headers"]["x-github-event"], "pull_request");
    assert!(envelope["headers"].get("x-hub-signature-256").is_none());
}

#[tokio::test]
async fn tampered_github_delivery_is_rejected() {
    let h = harness(webhook_config()).await;
    let tenant = Uuid::new_v4();
    let connection = connection_for(&h, tenant, "github").await;

    let signature = github_signature(br#"{"number":7}"#);
    let response = send(
        &h,
        post(
            &format!("/webhooks/github/{tenant}"),
            &[("x-hub-signature-256", signature.as_str())],
            br#"{"number":8}"#,
        ),
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/problem+json"
    );
    assert!(jobs_for(&h.db, connection.id).await.is_empty());
}

#[tokio::test]
async fn unsigned_delivery_is_rejected() {
    let h = harness(webhook_config()).await;
    let tenant = Uuid::new_v4();
    connection_for(&h, tenant, "github").await;

    let response = send(
        &h,
        post(&format!("/webhooks/github/{tenant}"), &[], br#"{}"#),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn slack_delivery_inside_tolerance_is_accepted() {
    let h = harness(webhook_config()).await;
    let tenant = Uuid::new_v4();
    let connection = connection_for(&h, tenant, "slack").await;

    let body = br#"{"type":"event_callback"}"#;
    let timestamp = (at(12, 0, 0) - Duration::seconds(299)).timestamp();
    let signature = slack_signature(timestamp, body);
    let timestamp = timestamp.to_string();
    let response = send(
        &h,
        post(
            &format!("/webhooks/slack/{tenant}"),
            &[
                ("x-slack-signature", signature.as_str()),
                ("x-slack-request-timestamp", timestamp.as_str()),
            ],
            body,
        ),
    )
    .await;

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(jobs_for(&h.db, connection.id).await.len(), 1);
}

#[tokio::test]
async fn replayed_slack_delivery_is_rejected() {
    let h = harness(webhook_config()).await;
    let tenant = Uuid::new_v4();
    let connection = connection_for(&h, tenant, "slack").await;

    let body = br#"{"type":"event_callback"}"#;
    let timestamp = at(12, 0, 0).timestamp();
    let signature = slack_signature(timestamp, body);
    let timestamp = timestamp.to_string();
    // A correctly signed delivery replayed 301 seconds later.
    h.clock.advance(Duration::seconds(301));

    let response = send(
        &h,
        post(
            &format!("/webhooks/slack/{tenant}"),
            &[
                ("x-slack-signature", signature.as_str()),
                ("x-slack-request-timestamp", timestamp.as_str()),
            ],
            body,
        ),
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(jobs_for(&h.db, connection.id).await.is_empty());
}

#[tokio::test]
async fn operator_token_bypasses_signature_check() {
    let h = harness(test_config()).await;
    let tenant = Uuid::new_v4();
    let connection = connection_for(&h, tenant, "jira").await;

    let bearer = format!("Bearer {TEST_OPERATOR_TOKEN}");
    let response = send(
        &h,
        post(
            &format!("/webhooks/jira/{tenant}"),
            &[("authorization", bearer.as_str())],
            br#"{"issue":"ABC-1"}"#,
        ),
    )
    .await;

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let jobs = jobs_for(&h.db, connection.id).await;
    let envelope = jobs[0].cursor.as_ref().expect("envelope");
    assert_eq!(envelope["verification"], "operator");
    assert!(envelope["headers"].get("authorization").is_none());
}

#[tokio::test]
async fn provider_without_secret_rejects_unauthenticated_delivery() {
    let h = harness(test_config()).await;
    let tenant = Uuid::new_v4();
    connection_for(&h, tenant, "jira").await;

    let response = send(
        &h,
        post(
            &format!("/webhooks/jira/{tenant}"),
            &[("authorization", "Bearer not-an-operator")],
            br#"{}"#,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admission_limit_returns_retry_after() {
    let mut config = webhook_config();
    config.webhooks.rate_limit_per_minute = 1;
    let h = harness(config).await;
    let tenant = Uuid::new_v4();
    connection_for(&h, tenant, "github").await;

    let body = br#"{"n":1}"#;
    let signature = github_signature(body);
    let uri = format!("/webhooks/github/{tenant}");
    let headers = [("x-hub-signature-256", signature.as_str())];

    let first = send(&h, post(&uri, &headers, body)).await;
    assert_eq!(first.status(), StatusCode::ACCEPTED);

    let second = send(&h, post(&uri, &headers, body)).await;
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = second
        .headers()
        .get("retry-after")
        .expect("retry-after header")
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));
}

#[tokio::test]
async fn ambiguous_target_requires_connection_header() {
    let h = harness(webhook_config()).await;
    let tenant = Uuid::new_v4();
    connection_for(&h, tenant, "github").await;
    let second = connection_for(&h, tenant, "github").await;

    let body = br#"{"n":1}"#;
    let signature = github_signature(body);
    let uri = format!("/webhooks/github/{tenant}");

    let ambiguous = send(
        &h,
        post(&uri, &[("x-hub-signature-256", signature.as_str())], body),
    )
    .await;
    assert_eq!(ambiguous.status(), StatusCode::BAD_REQUEST);

    let target = second.id.to_string();
    let targeted = send(
        &h,
        post(
            &uri,
            &[("x-hub-signature-256", signature.as_str()), ("x-connection-id", target.as_str())],
            body,
        ),
    )
    .await;
    assert_eq!(targeted.status(), StatusCode::ACCEPTED);
    assert_eq!(jobs_for(&h.db, second.id).await.len(), 1);
}

#[tokio::test]
async fn delivery_without_active_connection_is_not_found() {
    let h = harness(webhook_config()).await;
    let tenant = Uuid::new_v4();

    let body = br#"{"n":1}"#;
    let signature = github_signature(body);
    let response = send(
        &h,
        post(
            &format!("/webhooks/github/{tenant}"),
            &[("x-hub-signature-256", signature.as_str())],
            body,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_requests_are_rejected() {
    let h = harness(webhook_config()).await;
    let tenant = Uuid::new_v4();
    connection_for(&h, tenant, "github").await;

    let bad_tenant = send(
        &h,
        post("/webhooks/github/not-a-uuid", &[], br#"{}"#),
    )
    .await;
    assert_eq!(bad_tenant.status(), StatusCode::BAD_REQUEST);

    let body = b"not json";
    let signature = github_signature(body);
    let not_json = send(
        &h,
        post(
            &format!("/webhooks/github/{tenant}"),
            &[("x-hub-signature-256", signature.as_str())],
            body,
        ),
    )
    .await;
    assert_eq!(not_json.status(), StatusCode::BAD_REQUEST);
    let problem = json_body(not_json).await;
    assert_eq!(problem["code"], "VALIDATION_FAILED");
    assert!(problem["trace_id"].is_string());
}
