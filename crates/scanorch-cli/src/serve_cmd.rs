//! HTTP surface: one `axum` router over [`AppState`], matching the locked
//! response shapes the Status Projector produces. Spec §6.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use scanorch_core::enforcement::{self, EnforcementError};
use scanorch_core::observability::Event;
use scanorch_core::orchestrator;
use scanorch_core::plan;
use scanorch_core::projector;
use scanorch_core::retry::{self, RetryError};
use scanorch_core::{cache, normalize};
use scanorch_db::models::Identity;
use scanorch_db::queries::metrics;
use scanorch_db::queries::scans::{self, CreateScanError, NewScan};

use crate::state::AppState;

/// A JSON error envelope matching `{success:false, error:{code, ...}}`,
/// distinct from the `{success:true, data:...}` shape the projector emits.
struct AppError {
    status: StatusCode,
    body: serde_json::Value,
}

impl AppError {
    fn domain(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: serde_json::json!({
                "success": false,
                "error": { "code": code, "message": message.into() },
            }),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::domain(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    fn bad_request(code: &str, message: impl Into<String>) -> Self {
        Self::domain(StatusCode::BAD_REQUEST, code, message)
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        tracing::error!(error = %err, "internal error handling request");
        Self::domain(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", err.to_string())
    }

    fn from_enforcement(err: EnforcementError) -> Self {
        match err {
            EnforcementError::DailyLimitReached { limit, current } => Self {
                status: StatusCode::TOO_MANY_REQUESTS,
                body: serde_json::json!({
                    "success": false,
                    "error": {
                        "code": "DAILY_LIMIT_REACHED",
                        "limit": limit,
                        "current": current,
                        "upgradeRequired": true,
                    },
                }),
            },
            EnforcementError::RetryLimitReached { limit, current } => Self {
                status: StatusCode::TOO_MANY_REQUESTS,
                body: serde_json::json!({
                    "success": false,
                    "error": {
                        "code": "RETRY_LIMIT_REACHED",
                        "limit": limit,
                        "current": current,
                        "upgradeRequired": true,
                    },
                }),
            },
            EnforcementError::DownloadsRestricted => Self::domain(
                StatusCode::FORBIDDEN,
                "DOWNLOADS_RESTRICTED",
                "downloads are not available on this plan",
            ),
        }
    }

    fn from_retry(err: RetryError) -> Self {
        match &err {
            RetryError::NotFound(id) => Self::not_found(format!("scan {id} not found")),
            RetryError::NotTerminal(id) => Self::bad_request(
                "NOT_TERMINAL",
                format!("scan {id} is not in a terminal state"),
            ),
            RetryError::NothingEligible => Self::bad_request(
                "NO_RETRYABLE_SERVICES",
                "no service in this scan is eligible for retry",
            ),
            RetryError::Enforcement(e) => return Self::from_enforcement(e.clone()),
            RetryError::Transition(_) | RetryError::Db(_) => Self::internal(&err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Build the router. CORS is permissive when no origins are configured
/// (development default); otherwise restricted to the configured list.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = build_cors(&state.cors_origins);

    Router::new()
        .route("/", get(root))
        .route("/scan", post(create_scan))
        .route("/scan/{scanId}", get(get_scan))
        .route("/scan/{scanId}/progress", get(get_scan_progress))
        .route("/scan/{scanId}/results", get(get_scan))
        .route("/scan/{scanId}/retry", post(retry_scan))
        .route("/scan/{scanId}/retry/status", get(get_retry_status))
        .route("/health", get(health))
        .route("/monitoring/metrics", get(monitoring_metrics))
        .layer(cors)
        .with_state(state)
}

fn build_cors(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let allowed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods(Any)
        .allow_headers(Any)
}

fn resolve_client_ip(headers: &HeaderMap, addr: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| addr.ip().to_string())
}

fn parse_user_id_header(headers: &HeaderMap) -> Result<Option<Uuid>, AppError> {
    let Some(value) = headers.get("x-user-id") else {
        return Ok(None);
    };
    let raw = value.to_str().map_err(|_| {
        AppError::bad_request("INVALID_USER_ID", "x-user-id header is not valid UTF-8")
    })?;
    Uuid::parse_str(raw)
        .map(Some)
        .map_err(|_| AppError::bad_request("INVALID_USER_ID", "x-user-id header is not a valid UUID"))
}

#[derive(Debug, Deserialize)]
struct CreateScanRequest {
    url: String,
    services: Option<Vec<String>>,
    force: Option<bool>,
}

/// `POST /scan`: identity resolution, cache lookup, quota admission, scan
/// creation, and background dispatch. Spec §6, §8 Scenarios 1-4.
async fn create_scan(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<CreateScanRequest>,
) -> Result<Response, AppError> {
    let user_id = parse_user_id_header(&headers)?;
    let client_ip = resolve_client_ip(&headers, addr);

    let resolved = enforcement::resolve_identity(&state.pool, user_id, &client_ip)
        .await
        .map_err(AppError::internal)?;
    let limits = plan::limits_for(resolved.plan);

    let normalized = normalize::normalize(&req.url, state.normalize_opts)
        .map_err(|e| AppError::bad_request("INVALID_URL", e.to_string()))?;

    let requested_by_caller: Vec<&str> = match &req.services {
        Some(names) if !names.is_empty() => names.iter().map(|s| s.as_str()).collect(),
        _ => plan::SERVICE_CATALOGUE.to_vec(),
    };
    let (allowed, _) = enforcement::filter_allowed_services(&requested_by_caller, &limits);
    let restricted: Vec<&str> = plan::SERVICE_CATALOGUE
        .iter()
        .copied()
        .filter(|name| !allowed.contains(name))
        .collect();

    let fingerprint = normalize::fingerprint(&normalized, &requested_by_caller);
    let force = req.force.unwrap_or(false);

    if let Some(bundle) = cache::lookup(&state.pool, &fingerprint, force)
        .await
        .map_err(AppError::internal)?
    {
        let response = projector::project(&bundle);
        return Ok((StatusCode::OK, Json(response)).into_response());
    }

    enforcement::admit_scan(&state.pool, &resolved.identity, &limits)
        .await
        .map_err(AppError::from_enforcement)?;

    let (user_id, owner_ip) = match &resolved.identity {
        Identity::User(id) => (Some(*id), None),
        Identity::Ip(ip) => (None, Some(ip.as_str())),
    };

    let catalogue_names: Vec<String> = plan::SERVICE_CATALOGUE
        .iter()
        .map(|s| s.to_string())
        .collect();
    let max_attempts = limits.max_attempts();

    let scan_id = create_scan_row(
        &state.pool,
        &req.url,
        &normalized,
        &fingerprint,
        user_id,
        owner_ip,
        resolved.plan,
        &catalogue_names,
        max_attempts,
    )
    .await?;

    for name in &restricted {
        scanorch_db::queries::services::mark_service_restricted(
            &state.pool,
            &scan_id,
            name,
            "SERVICE_RESTRICTED",
            "service is not included in the caller's plan",
        )
        .await
        .map_err(AppError::internal)?;
    }

    state.sink.emit(Event::ScanCreated {
        scan_id: scan_id.clone(),
        url: normalized.clone(),
    });

    let allowed_owned: Vec<String> = allowed.iter().map(|s| s.to_string()).collect();
    spawn_orchestration(Arc::clone(&state), scan_id.clone(), normalized, allowed_owned, resolved.plan, fingerprint);

    let body = serde_json::json!({
        "scanId": scan_id,
        "status": scanorch_db::models::ScanStatus::Pending,
        "url": req.url,
        "startedAt": Option::<chrono::DateTime<chrono::Utc>>::None,
        "plan": {
            "type": resolved.plan,
            "allowedServices": allowed,
            "restrictedServices": restricted,
        },
    });
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}

/// Insert the scan row and all six catalogue service rows, retrying with a
/// fresh opaque id on the astronomically unlikely collision.
#[allow(clippy::too_many_arguments)]
async fn create_scan_row(
    pool: &sqlx::PgPool,
    submitted_url: &str,
    normalized_url: &str,
    fingerprint: &str,
    user_id: Option<Uuid>,
    owner_ip: Option<&str>,
    plan: scanorch_db::models::PlanTier,
    service_names: &[String],
    max_attempts: i32,
) -> Result<String, AppError> {
    for _ in 0..3 {
        let scan_id = Uuid::new_v4().to_string();
        let new_scan = NewScan {
            id: &scan_id,
            submitted_url,
            normalized_url,
            fingerprint,
            user_id,
            owner_ip,
            plan,
            service_names,
            max_attempts,
        };
        match scans::create_scan_with_services(pool, new_scan).await {
            Ok(()) => return Ok(scan_id),
            Err(CreateScanError::DuplicateScanId(_)) => continue,
            Err(CreateScanError::Other(e)) => return Err(AppError::internal(e)),
        }
    }
    Err(AppError::internal("could not allocate a unique scan id"))
}

/// Run the orchestrator in the background; the HTTP response has already
/// been sent (202 Accepted). Errors are logged, never surfaced to a caller
/// who already moved on to polling.
fn spawn_orchestration(
    state: Arc<AppState>,
    scan_id: String,
    normalized_url: String,
    allowed: Vec<String>,
    plan_tier: scanorch_db::models::PlanTier,
    fingerprint: String,
) {
    tokio::spawn(async move {
        let limits = plan::limits_for(plan_tier);
        let allowed_refs: Vec<&str> = allowed.iter().map(|s| s.as_str()).collect();
        if let Err(e) = orchestrator::orchestrate_new(
            &state.pool,
            &state.registry,
            &state.sink,
            &state.orchestrator_config,
            &scan_id,
            &normalized_url,
            &allowed_refs,
            &limits,
            &fingerprint,
            plan_tier,
            &state.cache_ttl,
        )
        .await
        {
            tracing::error!(scan_id = %scan_id, error = %e, "scan orchestration failed");
        }
    });
}

/// `GET /scan/:scanId` and `GET /scan/:scanId/results` (kept as an alias
/// for backward compatibility, spec §6).
async fn get_scan(
    State(state): State<Arc<AppState>>,
    Path(scan_id): Path<String>,
) -> Result<Response, AppError> {
    let bundle = scans::load_scan_bundle(&state.pool, &scan_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("scan {scan_id} not found")))?;
    Ok(Json(projector::project(&bundle)).into_response())
}

async fn get_scan_progress(
    State(state): State<Arc<AppState>>,
    Path(scan_id): Path<String>,
) -> Result<Response, AppError> {
    let bundle = scans::load_scan_bundle(&state.pool, &scan_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("scan {scan_id} not found")))?;
    Ok(Json(projector::project_progress(&bundle)).into_response())
}

async fn get_retry_status(
    State(state): State<Arc<AppState>>,
    Path(scan_id): Path<String>,
) -> Result<Response, AppError> {
    let bundle = scans::load_scan_bundle(&state.pool, &scan_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("scan {scan_id} not found")))?;
    Ok(Json(projector::project_retry_status(&bundle)).into_response())
}

#[derive(Debug, Deserialize)]
struct RetryRequest {
    services: Option<Vec<String>>,
}

/// `POST /scan/:scanId/retry`. Spec §8 Scenario 6: the caller that loses the
/// terminal->running CAS race gets a 200 with the current state and an
/// empty `retriedServices`, not an error.
async fn retry_scan(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(scan_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<RetryRequest>,
) -> Result<Response, AppError> {
    let user_id = parse_user_id_header(&headers)?;
    let client_ip = resolve_client_ip(&headers, addr);
    let resolved = enforcement::resolve_identity(&state.pool, user_id, &client_ip)
        .await
        .map_err(AppError::internal)?;
    let limits = plan::limits_for(resolved.plan);

    let requested_owned = req.services;
    let requested_refs: Option<Vec<&str>> = requested_owned
        .as_ref()
        .map(|names| names.iter().map(|s| s.as_str()).collect());

    let admitted = match retry::retry(
        &state.pool,
        &resolved.identity,
        &limits,
        &scan_id,
        requested_refs.as_deref(),
    )
    .await
    {
        Ok(admitted) => admitted,
        Err(RetryError::Transition(_)) => {
            let bundle = scans::load_scan_bundle(&state.pool, &scan_id)
                .await
                .map_err(AppError::internal)?
                .ok_or_else(|| AppError::not_found(format!("scan {scan_id} not found")))?;
            return Ok(Json(serde_json::json!({
                "scanId": scan_id,
                "status": bundle.scan.status,
                "retriedServices": Vec::<String>::new(),
            }))
            .into_response());
        }
        Err(e) => return Err(AppError::from_retry(e)),
    };

    let bundle = scans::load_scan_bundle(&state.pool, &scan_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("scan {scan_id} not found")))?;

    let state_clone = Arc::clone(&state);
    let scan_id_clone = scan_id.clone();
    let normalized_url = bundle.scan.normalized_url.clone();
    let fingerprint = bundle.scan.fingerprint.clone();
    let plan_tier = bundle.scan.plan;
    let services_to_run = admitted.services.clone();

    tokio::spawn(async move {
        if let Err(e) = orchestrator::orchestrate_retry(
            &state_clone.pool,
            &state_clone.registry,
            &state_clone.sink,
            &state_clone.orchestrator_config,
            &scan_id_clone,
            &normalized_url,
            &services_to_run,
            &fingerprint,
            plan_tier,
            &state_clone.cache_ttl,
        )
        .await
        {
            tracing::error!(scan_id = %scan_id_clone, error = %e, "retry orchestration failed");
        }
    });

    Ok(Json(serde_json::json!({
        "scanId": scan_id,
        "retriedServices": admitted.services,
    }))
    .into_response())
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    let db_ok = sqlx::query("SELECT 1").execute(&state.pool).await.is_ok();
    let body = serde_json::json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "environment": state.environment,
        "database": db_ok,
        "cacheSweeper": { "lastSweepUnix": state.sweeper.last_sweep_unix() },
        "config": {
            "scanTimeoutSecs": state.orchestrator_config.scan_timeout.as_secs(),
            "defaultServiceTimeoutSecs": state.orchestrator_config.default_service_timeout.as_secs(),
        },
    });
    let status = if db_ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(body)).into_response()
}

#[derive(Debug, Deserialize)]
struct MetricsQuery {
    #[serde(rename = "timeRange")]
    time_range: Option<String>,
}

/// Parse a `timeRange` query value like `24h` or `7d` into a lower bound.
/// Unrecognized or absent values mean "all time".
fn parse_time_range(raw: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    let raw = raw.trim();
    if raw.len() < 2 {
        return None;
    }
    let (digits, unit) = raw.split_at(raw.len() - 1);
    let n: i64 = digits.parse().ok()?;
    let now = chrono::Utc::now();
    match unit {
        "h" => Some(now - chrono::Duration::hours(n)),
        "d" => Some(now - chrono::Duration::days(n)),
        _ => None,
    }
}

async fn monitoring_metrics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MetricsQuery>,
) -> Result<Response, AppError> {
    let since = query.time_range.as_deref().and_then(parse_time_range);
    let summary = metrics::summarize(&state.pool, since)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(summary).into_response())
}

/// Liveness banner at the API root.
async fn root() -> &'static str {
    "scanorch"
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install ctrl-c handler");
    tracing::info!("shutdown signal received");
}

/// Bind and serve the HTTP API until a ctrl-c signal arrives.
pub async fn run_serve(state: Arc<AppState>, bind: &str, port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "scanorch HTTP API listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanorch_core::observability::ObservabilitySink;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    async fn test_state() -> (Arc<AppState>, String) {
        let (pool, db_name) = scanorch_test_utils::create_test_db().await;
        let (_join, sweeper) = scanorch_core::cache::spawn_sweeper(
            pool.clone(),
            std::time::Duration::from_secs(3600),
            CancellationToken::new(),
        );
        let state = Arc::new(AppState {
            pool,
            registry: crate::state::bootstrap_registry(),
            sink: Arc::new(ObservabilitySink::new("test")),
            orchestrator_config: scanorch_core::orchestrator::OrchestratorConfig {
                scan_timeout: std::time::Duration::from_secs(5),
                default_service_timeout: std::time::Duration::from_secs(2),
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

    #[tokio::test]
    async fn health_reports_ok_against_a_live_database() {
        let (state, db_name) = test_state().await;
        let app = build_router(Arc::clone(&state));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        scanorch_test_utils::drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn get_unknown_scan_returns_404() {
        let (state, db_name) = test_state().await;
        let app = build_router(Arc::clone(&state));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/scan/does-not-exist")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        scanorch_test_utils::drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn monitoring_metrics_is_empty_on_a_fresh_database() {
        let (state, db_name) = test_state().await;
        let app = build_router(Arc::clone(&state));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/monitoring/metrics")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let summary: metrics::MetricsSummary = serde_json::from_slice(&body).unwrap();
        assert_eq!(summary.total_scans, 0);
        scanorch_test_utils::drop_test_db(&db_name).await;
    }
}
