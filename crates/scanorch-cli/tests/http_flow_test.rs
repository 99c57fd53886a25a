//! End-to-end HTTP coverage over `build_router`: a caller that never touches
//! the database handles directly, only requests and responses.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use scanorch_cli::serve_cmd::build_router;
use scanorch_cli::state::{bootstrap_registry, AppState};
use scanorch_core::observability::ObservabilitySink;
use scanorch_core::orchestrator::OrchestratorConfig;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

async fn test_state() -> (Arc<AppState>, String) {
    let (pool, db_name) = scanorch_test_utils::create_test_db().await;
    let (_join, sweeper) = scanorch_core::cache::spawn_sweeper(
        pool.clone(),
        Duration::from_secs(3600),
        CancellationToken::new(),
    );
    let state = Arc::new(AppState {
        pool,
        registry: bootstrap_registry(),
        sink: Arc::new(ObservabilitySink::new("test")),
        orchestrator_config: OrchestratorConfig {
            scan_timeout: Duration::from_secs(5),
            default_service_timeout: Duration::from_secs(2),
            service_timeouts: Default::default(),
        },
        cache_ttl: Default::default(),
        normalize_opts: Default::default(),
        cors_origins: Vec::new(),
        sweeper,
        environment: "test".to_string(),
    });
    (state, db_name)
}

fn post(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Every request through `oneshot` still needs `ConnectInfo`, which normally
/// comes from `into_make_service_with_connect_info`; a plain `oneshot` call
/// skips that layer, so handlers reading `ConnectInfo` need it injected.
fn with_connect_info(mut req: Request<Body>) -> Request<Body> {
    let addr: SocketAddr = "203.0.113.99:12345".parse().unwrap();
    req.extensions_mut().insert(axum::extract::ConnectInfo(addr));
    req
}

#[tokio::test]
async fn full_scan_lifecycle_reaches_completed_via_http() {
    let (state, db_name) = test_state().await;
    let app = build_router(Arc::clone(&state));

    let create = app
        .clone()
        .oneshot(with_connect_info(post(
            "/scan",
            serde_json::json!({ "url": "https://example.com", "services": ["accessibility"] }),
        )))
        .await
        .unwrap();
    assert_eq!(create.status(), StatusCode::ACCEPTED);
    let created = json_body(create).await;
    let scan_id = created["scanId"].as_str().unwrap().to_string();
    assert_eq!(created["status"], "pending");

    // The orchestrator runs in a background task spawned by the handler;
    // poll the scan resource until it settles.
    let mut status = String::new();
    for _ in 0..50 {
        let response = app
            .clone()
            .oneshot(get(&format!("/scan/{scan_id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        status = body["data"]["status"].as_str().unwrap().to_string();
        if status != "pending" && status != "running" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, "completed");

    scanorch_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn retry_flow_reopens_a_failed_scan_via_http() {
    let (state, db_name) = test_state().await;
    let app = build_router(Arc::clone(&state));

    // accessibility is the only service in the registry by default, and
    // duplicateContent isn't there at all, so requesting both leaves
    // duplicateContent perpetually failed (no service to execute it)
    // once the registry lookup itself reports failure.
    let create = app
        .clone()
        .oneshot(with_connect_info(post(
            "/scan",
            serde_json::json!({
                "url": "https://example.org",
                "services": ["accessibility", "duplicateContent"],
            }),
        )))
        .await
        .unwrap();
    assert_eq!(create.status(), StatusCode::ACCEPTED);
    let created = json_body(create).await;
    let scan_id = created["scanId"].as_str().unwrap().to_string();

    let mut status = String::new();
    for _ in 0..50 {
        let response = app.clone().oneshot(get(&format!("/scan/{scan_id}"))).await.unwrap();
        let body = json_body(response).await;
        status = body["data"]["status"].as_str().unwrap().to_string();
        if status != "pending" && status != "running" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(status == "partial" || status == "failed", "unexpected status {status}");

    let retry = app
        .clone()
        .oneshot(with_connect_info(post(
            &format!("/scan/{scan_id}/retry"),
            serde_json::json!({}),
        )))
        .await
        .unwrap();
    assert_eq!(retry.status(), StatusCode::OK);
    let retry_body = json_body(retry).await;
    assert_eq!(retry_body["scanId"], scan_id);
    assert!(!retry_body["retriedServices"].as_array().unwrap().is_empty());

    scanorch_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn create_scan_enforces_the_guest_daily_limit() {
    let (state, db_name) = test_state().await;
    let app = build_router(Arc::clone(&state));

    let first = app
        .clone()
        .oneshot(with_connect_info(post(
            "/scan",
            serde_json::json!({ "url": "https://example.net", "services": ["accessibility"] }),
        )))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::ACCEPTED);

    let second = app
        .clone()
        .oneshot(with_connect_info(post(
            "/scan",
            serde_json::json!({ "url": "https://another-example.net", "services": ["accessibility"] }),
        )))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = json_body(second).await;
    assert_eq!(body["error"]["code"], "DAILY_LIMIT_REACHED");

    scanorch_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn create_scan_with_an_invalid_url_is_rejected() {
    let (state, db_name) = test_state().await;
    let app = build_router(Arc::clone(&state));

    let response = app
        .clone()
        .oneshot(with_connect_info(post(
            "/scan",
            serde_json::json!({ "url": "not a url" }),
        )))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "INVALID_URL");

    scanorch_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cached_scan_is_served_without_re_dispatching() {
    let (state, db_name) = test_state().await;
    let app = build_router(Arc::clone(&state));

    let first = app
        .clone()
        .oneshot(with_connect_info(post(
            "/scan",
            serde_json::json!({ "url": "https://cache-me.example", "services": ["accessibility"] }),
        )))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::ACCEPTED);
    let created = json_body(first).await;
    let scan_id = created["scanId"].as_str().unwrap().to_string();

    let mut status = String::new();
    for _ in 0..50 {
        let response = app.clone().oneshot(get(&format!("/scan/{scan_id}"))).await.unwrap();
        let body = json_body(response).await;
        status = body["data"]["status"].as_str().unwrap().to_string();
        if status != "pending" && status != "running" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, "completed");

    // A different identity (no x-user-id, but a different client IP) is
    // still served the cached bundle; a cache hit returns 200, not 202.
    let mut second_request = post(
        "/scan",
        serde_json::json!({ "url": "https://cache-me.example", "services": ["accessibility"] }),
    );
    second_request
        .headers_mut()
        .insert("x-forwarded-for", "198.51.100.7".parse().unwrap());
    let second = app.clone().oneshot(with_connect_info(second_request)).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let second_body = json_body(second).await;
    assert_eq!(second_body["data"]["scanId"], scan_id);

    scanorch_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn unknown_user_id_header_is_rejected_as_bad_request() {
    let (state, db_name) = test_state().await;
    let app = build_router(Arc::clone(&state));

    let mut request = post(
        "/scan",
        serde_json::json!({ "url": "https://example.com" }),
    );
    request
        .headers_mut()
        .insert("x-user-id", "not-a-uuid".parse().unwrap());
    let response = app.clone().oneshot(with_connect_info(request)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "INVALID_USER_ID");

    scanorch_test_utils::drop_test_db(&db_name).await;
}
