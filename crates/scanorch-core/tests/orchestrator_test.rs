//! End-to-end database-backed coverage of `orchestrate_new`/`orchestrate_retry`:
//! fan-out, finalization, caching, and the global timeout path.

use std::sync::Arc;
use std::time::Duration;

use scanorch_core::observability::ObservabilitySink;
use scanorch_core::orchestrator::{orchestrate_new, orchestrate_retry, recover_orphaned_scans, OrchestratorConfig};
use scanorch_core::plan::{limits_for, SERVICE_CATALOGUE};
use scanorch_core::service::{ErrorKind, FakeService, ServiceRegistry, SlowService};
use scanorch_db::config::CacheTtlConfig;
use scanorch_db::models::{PlanTier, ScanStatus, ServiceStatus};
use scanorch_db::queries::cache::find_cache_entry;
use scanorch_db::queries::metrics::summarize;
use scanorch_db::queries::scans::{create_scan_with_services, get_scan, load_scan_bundle, NewScan};

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        scan_timeout: Duration::from_secs(5),
        default_service_timeout: Duration::from_secs(2),
        service_timeouts: scanorch_db::config::ServiceTimeouts::default(),
    }
}

async fn seed_pending_scan(pool: &sqlx::PgPool, scan_id: &str, fingerprint: &str, names: &[&str]) {
    let service_names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
    create_scan_with_services(
        pool,
        NewScan {
            id: scan_id,
            submitted_url: "https://example.com",
            normalized_url: "https://example.com/",
            fingerprint,
            user_id: None,
            owner_ip: Some("203.0.113.20"),
            plan: PlanTier::Free,
            service_names: &service_names,
            max_attempts: 2,
        },
    )
    .await
    .expect("scan should be created");
}

#[tokio::test]
async fn all_succeeding_services_complete_the_scan_and_populate_cache() {
    let (pool, db_name) = scanorch_test_utils::create_test_db().await;
    seed_pending_scan(&pool, "orch-complete", "fp-orch-complete", &["accessibility", "duplicateContent"]).await;

    let mut registry = ServiceRegistry::new();
    registry.register(FakeService::succeeding("accessibility"));
    registry.register(FakeService::succeeding("duplicateContent"));

    let sink = Arc::new(ObservabilitySink::new("test"));
    let limits = limits_for(PlanTier::Free);

    orchestrate_new(
        &pool,
        &registry,
        &sink,
        &config(),
        "orch-complete",
        "https://example.com/",
        &["accessibility", "duplicateContent"],
        &limits,
        "fp-orch-complete",
        PlanTier::Free,
        &CacheTtlConfig::default(),
    )
    .await
    .unwrap();

    let scan = get_scan(&pool, "orch-complete").await.unwrap().unwrap();
    assert_eq!(scan.status, ScanStatus::Completed);
    assert!(scan.cached);

    let entry = find_cache_entry(&pool, "fp-orch-complete").await.unwrap();
    assert!(entry.is_some());

    scanorch_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn finalize_records_scan_and_service_metrics_through_the_real_sink() {
    let (pool, db_name) = scanorch_test_utils::create_test_db().await;
    seed_pending_scan(&pool, "orch-metrics", "fp-orch-metrics", &["accessibility", "duplicateContent"]).await;

    let mut registry = ServiceRegistry::new();
    registry.register(FakeService::succeeding("accessibility"));
    registry.register(FakeService::failing("duplicateContent", ErrorKind::Network, "refused"));

    let sink = Arc::new(ObservabilitySink::with_pool("test", pool.clone()));
    let limits = limits_for(PlanTier::Free);

    orchestrate_new(
        &pool,
        &registry,
        &sink,
        &config(),
        "orch-metrics",
        "https://example.com/",
        &["accessibility", "duplicateContent"],
        &limits,
        "fp-orch-metrics",
        PlanTier::Free,
        &CacheTtlConfig::default(),
    )
    .await
    .unwrap();

    let mut summary = summarize(&pool, None).await.unwrap();
    for _ in 0..50 {
        if summary.total_scans >= 1 && !summary.service_failures.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        summary = summarize(&pool, None).await.unwrap();
    }

    assert_eq!(summary.total_scans, 1);
    assert_eq!(summary.partial, 1);
    assert_eq!(summary.service_failures.len(), 1);
    assert_eq!(summary.service_failures[0].service_name, "duplicateContent");

    scanorch_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn mixed_outcomes_finalize_as_partial_and_mark_restricted_services() {
    let (pool, db_name) = scanorch_test_utils::create_test_db().await;
    // Seed all six catalogue services so the restricted set has rows to mark.
    seed_pending_scan(&pool, "orch-partial", "fp-orch-partial", SERVICE_CATALOGUE).await;

    let mut registry = ServiceRegistry::new();
    registry.register(FakeService::succeeding("accessibility"));
    registry.register(FakeService::failing("duplicateContent", ErrorKind::Upstream5xx, "boom"));

    let sink = Arc::new(ObservabilitySink::new("test"));
    // FREE only allows accessibility+duplicateContent; everything else in
    // the requested set gets restricted by the orchestrator itself.
    let limits = limits_for(PlanTier::Free);

    orchestrate_new(
        &pool,
        &registry,
        &sink,
        &config(),
        "orch-partial",
        "https://example.com/",
        SERVICE_CATALOGUE,
        &limits,
        "fp-orch-partial",
        PlanTier::Free,
        &CacheTtlConfig::default(),
    )
    .await
    .unwrap();

    let bundle = load_scan_bundle(&pool, "orch-partial").await.unwrap().unwrap();
    assert_eq!(bundle.scan.status, ScanStatus::Partial);
    assert_eq!(bundle.services.len(), SERVICE_CATALOGUE.len());

    let backlinks = bundle
        .services
        .iter()
        .find(|s| s.service_name == "backlinks")
        .unwrap();
    assert_eq!(backlinks.status, ServiceStatus::Failed);
    assert_eq!(backlinks.error_code.as_deref(), Some("SERVICE_RESTRICTED"));

    scanorch_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn global_timeout_marks_unsettled_services_as_timed_out() {
    let (pool, db_name) = scanorch_test_utils::create_test_db().await;
    seed_pending_scan(&pool, "orch-timeout", "fp-orch-timeout", &["accessibility"]).await;

    let mut registry = ServiceRegistry::new();
    registry.register(SlowService::new("accessibility", Duration::from_millis(300)));

    let sink = Arc::new(ObservabilitySink::new("test"));
    let limits = limits_for(PlanTier::Free);
    let mut cfg = config();
    cfg.scan_timeout = Duration::from_millis(30);
    cfg.default_service_timeout = Duration::from_secs(5);

    orchestrate_new(
        &pool,
        &registry,
        &sink,
        &cfg,
        "orch-timeout",
        "https://example.com/",
        &["accessibility"],
        &limits,
        "fp-orch-timeout",
        PlanTier::Free,
        &CacheTtlConfig::default(),
    )
    .await
    .unwrap();

    let bundle = load_scan_bundle(&pool, "orch-timeout").await.unwrap().unwrap();
    assert_eq!(bundle.scan.status, ScanStatus::Failed);
    assert_eq!(bundle.services[0].error_code.as_deref(), Some("SCAN_TIMEOUT"));

    scanorch_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn recover_orphaned_scans_finalizes_running_scans_past_their_deadline() {
    let (pool, db_name) = scanorch_test_utils::create_test_db().await;
    seed_pending_scan(&pool, "orch-orphan", "fp-orch-orphan", &["accessibility"]).await;

    scanorch_core::state::dispatch::start_scan(&pool, "orch-orphan").await.unwrap();
    scanorch_db::queries::services::mark_service_running(&pool, "orch-orphan", "accessibility")
        .await
        .unwrap();
    // Backdate started_at well past the deadline the crash-recovery sweep
    // will check, simulating a process that died mid-scan.
    sqlx::query("UPDATE scans SET started_at = NOW() - INTERVAL '1 hour' WHERE id = $1")
        .bind("orch-orphan")
        .execute(&pool)
        .await
        .unwrap();

    let sink = Arc::new(ObservabilitySink::new("test"));
    let mut cfg = config();
    cfg.scan_timeout = Duration::from_secs(120);

    let recovered = recover_orphaned_scans(&pool, &sink, &cfg, &CacheTtlConfig::default())
        .await
        .unwrap();
    assert_eq!(recovered, 1);

    let bundle = load_scan_bundle(&pool, "orch-orphan").await.unwrap().unwrap();
    assert_eq!(bundle.scan.status, ScanStatus::Failed);
    assert_eq!(bundle.services[0].error_code.as_deref(), Some("SCAN_TIMEOUT"));

    scanorch_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn recover_orphaned_scans_leaves_scans_still_within_their_deadline_alone() {
    let (pool, db_name) = scanorch_test_utils::create_test_db().await;
    seed_pending_scan(&pool, "orch-fresh", "fp-orch-fresh", &["accessibility"]).await;
    scanorch_core::state::dispatch::start_scan(&pool, "orch-fresh").await.unwrap();
    scanorch_db::queries::services::mark_service_running(&pool, "orch-fresh", "accessibility")
        .await
        .unwrap();

    let sink = Arc::new(ObservabilitySink::new("test"));
    let recovered = recover_orphaned_scans(&pool, &sink, &config(), &CacheTtlConfig::default())
        .await
        .unwrap();
    assert_eq!(recovered, 0);

    let scan = get_scan(&pool, "orch-fresh").await.unwrap().unwrap();
    assert_eq!(scan.status, ScanStatus::Running);

    scanorch_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn orchestrate_retry_only_dispatches_the_given_subset() {
    let (pool, db_name) = scanorch_test_utils::create_test_db().await;
    seed_pending_scan(&pool, "orch-retry", "fp-orch-retry", &["accessibility", "duplicateContent"]).await;

    let mut registry = ServiceRegistry::new();
    registry.register(FakeService::succeeding("accessibility"));
    registry.register(FakeService::succeeding("duplicateContent"));

    let sink = Arc::new(ObservabilitySink::new("test"));

    // First pass: fail duplicateContent so there's something to retry.
    let mut failing_registry = ServiceRegistry::new();
    failing_registry.register(FakeService::succeeding("accessibility"));
    failing_registry.register(FakeService::failing(
        "duplicateContent",
        ErrorKind::Network,
        "refused",
    ));
    let limits = limits_for(PlanTier::Free);
    orchestrate_new(
        &pool,
        &failing_registry,
        &sink,
        &config(),
        "orch-retry",
        "https://example.com/",
        &["accessibility", "duplicateContent"],
        &limits,
        "fp-orch-retry",
        PlanTier::Free,
        &CacheTtlConfig::default(),
    )
    .await
    .unwrap();
    assert_eq!(
        get_scan(&pool, "orch-retry").await.unwrap().unwrap().status,
        ScanStatus::Partial
    );

    scanorch_db::queries::services::reset_service_for_retry(&pool, "orch-retry", "duplicateContent")
        .await
        .unwrap();
    scanorch_core::state::dispatch::retry_scan(&pool, "orch-retry", ScanStatus::Partial)
        .await
        .unwrap();

    orchestrate_retry(
        &pool,
        &registry,
        &sink,
        &config(),
        "orch-retry",
        "https://example.com/",
        &["duplicateContent".to_string()],
        "fp-orch-retry",
        PlanTier::Free,
        &CacheTtlConfig::default(),
    )
    .await
    .unwrap();

    let scan = get_scan(&pool, "orch-retry").await.unwrap().unwrap();
    assert_eq!(scan.status, ScanStatus::Completed);

    scanorch_test_utils::drop_test_db(&db_name).await;
}
