//! Operator job listing: auth, tenant scoping, filters and keyset pagination.

mod test_utils;

use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use chrono::Duration;
use serde_json::Value as JsonValue;
use tower::ServiceExt;
use uuid::Uuid;

use connector_sync::auth::TENANT_HEADER;
use connector_sync::models::sync_job::JobType;
use connector_sync::repositories::sync_job::insert_job;
use connector_sync::repositories::{ConnectionRepository, JobListFilter, SyncJobRepository};
use connector_sync::server::create_app;

use test_utils::{
    ConnectionFixture, ScriptedConnector, TEST_OPERATOR_TOKEN, app_state, at, create_connection,
    manual_clock, registry_with, setup_test_db, test_config, test_crypto_key,
};

struct Harness {
    app: Router,
    jobs: SyncJobRepository,
    tenant: Uuid,
}

/// One tenant with three webhook jobs at 10:00, 10:05 and 10:10 plus one job
/// belonging to another tenant.
async fn harness() -> Harness {
    let db = setup_test_db().await.expect("db");
    let (_, clock) = manual_clock(at(12, 0, 0));
    let repo = ConnectionRepository::new(db.clone(), test_crypto_key());
    let tenant = Uuid::new_v4();

    let connection = create_connection(
        &repo,
        ConnectionFixture {
            tenant_id: tenant,
            ..Default::default()
        },
        at(9, 0, 0),
    )
    .await;
    for offset in [0, 5, 10] {
        let scheduled = at(10, 0, 0) + Duration::minutes(offset);
        insert_job(&db, &connection, JobType::Webhook, scheduled, None, scheduled)
            .await
            .expect("insert job");
    }
    insert_job(&db, &connection, JobType::Full, at(10, 15, 0), None, at(10, 15, 0))
        .await
        .expect("insert full job");

    let other = create_connection(&repo, ConnectionFixture::default(), at(9, 0, 0)).await;
    insert_job(&db, &other, JobType::Webhook, at(11, 0, 0), None, at(11, 0, 0))
        .await
        .expect("insert foreign job");

    let registry = registry_with(Arc::new(ScriptedConnector::new("access-0")), &[]);
    Harness {
        app: create_app(app_state(db.clone(), test_config(), registry, clock)),
        jobs: SyncJobRepository::new(db),
        tenant,
    }
}

async fn get(h: &Harness, uri: &str, token: Option<&str>, tenant: Option<String>) -> (StatusCode, JsonValue) {
    let mut request = Request::builder().uri(uri);
    if let Some(token) = token {
        request = request.header("authorization", format!("Bearer {token}"));
    }
    if let Some(tenant) = tenant {
        request = request.header(TENANT_HEADER, tenant);
    }
    let response = h
        .app
        .clone()
        .oneshot(request.body(Body::empty()).expect("request"))
        .await
        .expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    let body = if bytes.is_empty() {
        JsonValue::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, body)
}

fn scheduled_times(body: &JsonValue) -> Vec<String> {
    body["jobs"]
        .as_array()
        .expect("jobs array")
        .iter()
        .map(|job| job["scheduled_at"].as_str().expect("timestamp").to_string())
        .collect()
}

#[tokio::test]
async fn listing_requires_operator_token() {
    let h = harness().await;
    let tenant = Some(h.tenant.to_string());

    let (status, _) = get(&h, "/jobs", None, tenant.clone()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = get(&h, "/jobs", Some("wrong"), tenant).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = get(&h, "/jobs", Some(TEST_OPERATOR_TOKEN), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_FAILED");
}

#[tokio::test]
async fn pages_walk_newest_first_without_overlap() {
    let h = harness().await;
    let tenant = Some(h.tenant.to_string());

    let (status, first) = get(&h, "/jobs?limit=2", Some(TEST_OPERATOR_TOKEN), tenant.clone()).await;
    assert_eq!(status, StatusCode::OK);
    let first_times = scheduled_times(&first);
    assert_eq!(first_times.len(), 2);
    assert!(first_times[0].starts_with("2024-03-01T10:15:00"));
    assert!(first_times[1].starts_with("2024-03-01T10:10:00"));
    let cursor = first["next_cursor"].as_str().expect("next cursor").to_string();

    let (status, second) = get(
        &h,
        &format!("/jobs?limit=2&cursor={cursor}"),
        Some(TEST_OPERATOR_TOKEN),
        tenant,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let second_times = scheduled_times(&second);
    assert_eq!(second_times.len(), 2);
    assert!(second_times[0].starts_with("2024-03-01T10:05:00"));
    assert!(second_times[1].starts_with("2024-03-01T10:00:00"));
    assert!(second["next_cursor"].is_null());
}

#[tokio::test]
async fn filters_narrow_the_listing() {
    let h = harness().await;
    let tenant = Some(h.tenant.to_string());

    let (status, body) = get(
        &h,
        "/jobs?job_type=full",
        Some(TEST_OPERATOR_TOKEN),
        tenant.clone(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let jobs = body["jobs"].as_array().expect("jobs");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["job_type"], "full");

    let (status, body) = get(
        &h,
        "/jobs?status=succeeded",
        Some(TEST_OPERATOR_TOKEN),
        tenant.clone(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["jobs"].as_array().expect("jobs").is_empty());

    let (status, _) = get(&h, "/jobs?status=done", Some(TEST_OPERATOR_TOKEN), tenant).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn invalid_limit_and_cursor_are_rejected() {
    let h = harness().await;
    let tenant = Some(h.tenant.to_string());

    let (status, _) = get(&h, "/jobs?limit=0", Some(TEST_OPERATOR_TOKEN), tenant.clone()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = get(&h, "/jobs?limit=101", Some(TEST_OPERATOR_TOKEN), tenant.clone()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = get(
        &h,
        "/jobs?cursor=not-a-cursor",
        Some(TEST_OPERATOR_TOKEN),
        tenant,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn listing_is_scoped_to_the_tenant() {
    let h = harness().await;

    let page = h
        .jobs
        .list_jobs(h.tenant, &JobListFilter::default(), None, None)
        .await
        .expect("list");
    assert_eq!(page.jobs.len(), 4);
    assert!(page.next_cursor.is_none());

    let (status, body) = get(
        &h,
        "/jobs",
        Some(TEST_OPERATOR_TOKEN),
        Some(Uuid::new_v4().to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["jobs"].as_array().expect("jobs").is_empty());
}
