//! Database-backed coverage of the Retry Subsystem: quota consumption,
//! eligibility, surgical resets, and the terminal-to-running transition.

use scanorch_db::models::{Identity, PlanTier, ScanStatus, ServiceStatus};
use scanorch_db::queries::scans::{create_scan_with_services, get_scan, load_scan_bundle, NewScan};

use scanorch_core::plan::limits_for;
use scanorch_core::retry::{retry, RetryError};
use scanorch_core::state::dispatch;

async fn seed_failed_scan(pool: &sqlx::PgPool, scan_id: &str, owner_ip: &str) {
    create_scan_with_services(
        pool,
        NewScan {
            id: scan_id,
            submitted_url: "https://example.com",
            normalized_url: "https://example.com/",
            fingerprint: "fp-retry",
            user_id: None,
            owner_ip: Some(owner_ip),
            plan: PlanTier::Free,
            service_names: &["accessibility".to_string(), "duplicateContent".to_string()],
            max_attempts: 2,
        },
    )
    .await
    .unwrap();

    dispatch::start_scan(pool, scan_id).await.unwrap();

    scanorch_db::queries::services::mark_service_running(pool, scan_id, "accessibility")
        .await
        .unwrap();
    scanorch_db::queries::services::update_service(
        pool,
        scan_id,
        "accessibility",
        ServiceStatus::Success,
        scanorch_db::queries::services::ServicePatch {
            result: Some(serde_json::json!({"ok": true})),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    scanorch_db::queries::services::mark_service_running(pool, scan_id, "duplicateContent")
        .await
        .unwrap();
    scanorch_db::queries::services::update_service(
        pool,
        scan_id,
        "duplicateContent",
        ServiceStatus::Failed,
        scanorch_db::queries::services::ServicePatch {
            error_code: Some("NETWORK".into()),
            error_message: Some("refused".into()),
            error_retryable: Some(true),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    dispatch::finalize_scan(pool, scan_id, ScanStatus::Partial, 100)
        .await
        .unwrap();
}

#[tokio::test]
async fn retry_resets_the_failed_service_and_reopens_the_scan() {
    let (pool, db_name) = scanorch_test_utils::create_test_db().await;
    seed_failed_scan(&pool, "retry-basic", "203.0.113.30").await;

    let identity = Identity::Ip("203.0.113.30".into());
    let limits = limits_for(PlanTier::Free);

    let admitted = retry(&pool, &identity, &limits, "retry-basic", None).await.unwrap();
    assert_eq!(admitted.services, vec!["duplicateContent".to_string()]);
    assert_eq!(admitted.from, ScanStatus::Partial);

    let bundle = load_scan_bundle(&pool, "retry-basic").await.unwrap().unwrap();
    assert_eq!(bundle.scan.status, ScanStatus::Running);
    let dup = bundle
        .services
        .iter()
        .find(|s| s.service_name == "duplicateContent")
        .unwrap();
    assert_eq!(dup.status, ServiceStatus::Pending);
    assert!(dup.error_code.is_none());

    scanorch_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn retry_on_non_terminal_scan_is_rejected() {
    let (pool, db_name) = scanorch_test_utils::create_test_db().await;
    create_scan_with_services(
        &pool,
        NewScan {
            id: "retry-pending",
            submitted_url: "https://example.com",
            normalized_url: "https://example.com/",
            fingerprint: "fp-retry-pending",
            user_id: None,
            owner_ip: Some("203.0.113.31"),
            plan: PlanTier::Free,
            service_names: &["accessibility".to_string()],
            max_attempts: 2,
        },
    )
    .await
    .unwrap();

    let identity = Identity::Ip("203.0.113.31".into());
    let limits = limits_for(PlanTier::Free);
    let err = retry(&pool, &identity, &limits, "retry-pending", None)
        .await
        .unwrap_err();
    assert!(matches!(err, RetryError::NotTerminal(_)));

    scanorch_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn retry_with_nothing_eligible_is_rejected() {
    let (pool, db_name) = scanorch_test_utils::create_test_db().await;
    seed_failed_scan(&pool, "retry-exhausted", "203.0.113.32").await;

    // Exhaust the FREE plan's single retry for duplicateContent by bumping
    // attempts to max before asking for a retry.
    sqlx::query("UPDATE service_executions SET attempts = max_attempts WHERE scan_id = $1")
        .bind("retry-exhausted")
        .execute(&pool)
        .await
        .unwrap();

    let identity = Identity::Ip("203.0.113.32".into());
    let limits = limits_for(PlanTier::Free);
    let err = retry(&pool, &identity, &limits, "retry-exhausted", None)
        .await
        .unwrap_err();
    assert!(matches!(err, RetryError::NothingEligible));

    scanorch_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn guest_identity_cannot_retry_because_its_budget_is_zero() {
    let (pool, db_name) = scanorch_test_utils::create_test_db().await;
    seed_failed_scan(&pool, "retry-guest", "203.0.113.33").await;

    let identity = Identity::Ip("203.0.113.33".into());
    let limits = limits_for(PlanTier::Guest);
    let err = retry(&pool, &identity, &limits, "retry-guest", None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RetryError::Enforcement(scanorch_core::enforcement::EnforcementError::RetryLimitReached { limit: 0, .. })
    ));

    scanorch_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn concurrent_retries_only_the_first_reaches_running() {
    let (pool, db_name) = scanorch_test_utils::create_test_db().await;
    seed_failed_scan(&pool, "retry-race", "203.0.113.34").await;

    let identity = Identity::Ip("203.0.113.34".into());
    let limits = limits_for(PlanTier::Free);

    let pool_a = pool.clone();
    let pool_b = pool.clone();
    let identity_a = identity.clone();
    let identity_b = identity.clone();
    let limits_a = limits;
    let limits_b = limits;

    let (a, b) = tokio::join!(
        retry(&pool_a, &identity_a, &limits_a, "retry-race", None),
        retry(&pool_b, &identity_b, &limits_b, "retry-race", None),
    );

    let transitions = [&a, &b]
        .iter()
        .filter(|r| matches!(r, Err(RetryError::Transition(_))))
        .count();
    let oks = [&a, &b].iter().filter(|r| r.is_ok()).count();

    // Both callers pass quota/eligibility (eligibility doesn't mutate rows
    // until reset), but only one wins the CAS back to `running`.
    assert_eq!(oks + transitions, 2);
    assert!(oks >= 1);

    let scan = get_scan(&pool, "retry-race").await.unwrap().unwrap();
    assert_eq!(scan.status, ScanStatus::Running);

    scanorch_test_utils::drop_test_db(&db_name).await;
}
