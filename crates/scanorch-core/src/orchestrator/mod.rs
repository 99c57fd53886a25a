//! Async Orchestrator: fans out Service Executors for one scan and
//! finalizes the scan once every dispatched service has settled. Spec §4.H.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::{mpsc, Semaphore};

use scanorch_db::models::{ScanStatus, ServiceStatus};
use scanorch_db::queries::scans::{self, TransitionScanError};
use scanorch_db::queries::services;

use crate::cache;
use crate::executor::{self, ExecutionOutcome};
use crate::enforcement::filter_allowed_services;
use crate::observability::{Event, ObservabilitySink, ScanMetricRow, ServiceMetricRow};
use crate::plan::PlanLimits;
use crate::service::{ServiceConfig, ServiceRegistry};
use crate::state::dispatch;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("scan {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Transition(#[from] TransitionScanError),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Static configuration for one orchestrator run.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Global scan deadline (spec §5, default 2 min).
    pub scan_timeout: Duration,
    /// Per-service timeout, passed through to each executor unless
    /// overridden (spec §4.G, default 30 s).
    pub default_service_timeout: Duration,
    pub service_timeouts: scanorch_db::config::ServiceTimeouts,
}

/// Message sent from a spawned executor task back to the fan-out loop.
struct ExecutorDone {
    service_name: String,
    outcome: Result<ExecutionOutcome, sqlx::Error>,
}

/// `orchestrateNew`: dispatch every allowed requested service for a
/// freshly-created, still-`pending` scan, then finalize.
pub async fn orchestrate_new(
    pool: &PgPool,
    registry: &ServiceRegistry,
    sink: &Arc<ObservabilitySink>,
    config: &OrchestratorConfig,
    scan_id: &str,
    normalized_url: &str,
    requested_services: &[&str],
    limits: &PlanLimits,
    fingerprint: &str,
    plan_tier: scanorch_db::models::PlanTier,
    cache_ttl: &scanorch_db::config::CacheTtlConfig,
) -> Result<(), OrchestratorError> {
    let bundle = scans::load_scan_bundle(pool, scan_id)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(scan_id.to_string()))?;
    debug_assert_eq!(bundle.scan.status, ScanStatus::Pending);

    dispatch::start_scan(pool, scan_id).await?;

    let (allowed, restricted) = filter_allowed_services(requested_services, limits);
    for name in &restricted {
        services::mark_service_restricted(
            pool,
            scan_id,
            name,
            "SERVICE_RESTRICTED",
            "service is not included in the caller's plan",
        )
        .await?;
    }

    run_fan_out(pool, registry, sink, config, scan_id, normalized_url, &allowed).await?;
    finalize(pool, sink, scan_id, fingerprint, plan_tier, cache_ttl).await
}

/// `orchestrateRetry`: step 4 onward of the new-scan algorithm, restricted
/// to the service names the Retry Subsystem already reset to `pending`.
pub async fn orchestrate_retry(
    pool: &PgPool,
    registry: &ServiceRegistry,
    sink: &Arc<ObservabilitySink>,
    config: &OrchestratorConfig,
    scan_id: &str,
    normalized_url: &str,
    services_to_run: &[String],
    fingerprint: &str,
    plan_tier: scanorch_db::models::PlanTier,
    cache_ttl: &scanorch_db::config::CacheTtlConfig,
) -> Result<(), OrchestratorError> {
    let names: Vec<&str> = services_to_run.iter().map(|s| s.as_str()).collect();
    run_fan_out(pool, registry, sink, config, scan_id, normalized_url, &names).await?;
    finalize(pool, sink, scan_id, fingerprint, plan_tier, cache_ttl).await
}

/// Startup crash recovery (spec §5): any scan left `running` whose global
/// deadline has already passed gets its unsettled service rows marked
/// `SCAN_TIMEOUT` and is finalized, the same way a live global-timeout
/// firing would. Meant to be called once at process startup, before the
/// HTTP listener accepts traffic, so a process crash or redeploy never
/// leaves a scan stuck in `running` forever.
pub async fn recover_orphaned_scans(
    pool: &PgPool,
    sink: &Arc<ObservabilitySink>,
    config: &OrchestratorConfig,
    cache_ttl: &scanorch_db::config::CacheTtlConfig,
) -> Result<usize, OrchestratorError> {
    let running = scans::find_running_scans(pool).await?;
    let now = chrono::Utc::now();
    let deadline_span = chrono::Duration::from_std(config.scan_timeout).unwrap_or(chrono::Duration::zero());

    let mut recovered = 0;
    for scan in running {
        let Some(started_at) = scan.started_at else {
            continue;
        };
        if now < started_at + deadline_span {
            continue;
        }
        tracing::warn!(scan_id = %scan.id, "recovering orphaned running scan past its deadline at startup");
        services::mark_unsettled_as_timed_out(pool, &scan.id).await?;
        finalize(pool, sink, &scan.id, &scan.fingerprint, scan.plan, cache_ttl).await?;
        recovered += 1;
    }
    Ok(recovered)
}

/// Concurrently dispatch one executor per name in `names`, await all to
/// settle (never short-circuiting on the first failure), and enforce the
/// global scan deadline.
async fn run_fan_out(
    pool: &PgPool,
    registry: &ServiceRegistry,
    sink: &Arc<ObservabilitySink>,
    config: &OrchestratorConfig,
    scan_id: &str,
    normalized_url: &str,
    names: &[&str],
) -> Result<(), OrchestratorError> {
    if names.is_empty() {
        return Ok(());
    }

    let semaphore = Arc::new(Semaphore::new(names.len()));
    let (tx, mut rx) = mpsc::channel::<ExecutorDone>(names.len());
    let service_config = ServiceConfig::default();

    for &name in names {
        let Some(service) = registry.get(name) else {
            tracing::error!(scan_id = %scan_id, service = %name, "service not found in registry, skipping dispatch");
            continue;
        };
        let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");

        let pool = pool.clone();
        let timeout = config.service_timeouts.resolve(name, config.default_service_timeout);
        let scan_id = scan_id.to_string();
        let normalized_url = normalized_url.to_string();
        let service_config = service_config.clone();
        let tx = tx.clone();
        let sink = Arc::clone(sink);

        tokio::spawn(async move {
            let outcome = executor::execute_service(
                &pool,
                &sink,
                service.as_ref(),
                &scan_id,
                &normalized_url,
                &service_config,
                timeout,
            )
            .await;
            drop(permit);
            let _ = tx
                .send(ExecutorDone {
                    service_name: service.name().to_string(),
                    outcome,
                })
                .await;
        });
    }
    drop(tx);

    let mut remaining = names.len();
    let deadline = tokio::time::Instant::now() + config.scan_timeout;

    while remaining > 0 {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(done)) => {
                remaining -= 1;
                if let Err(e) = done.outcome {
                    tracing::error!(
                        scan_id = %scan_id,
                        service = %done.service_name,
                        error = %e,
                        "database error while persisting service outcome"
                    );
                }
            }
            Ok(None) => break,
            Err(_timeout) => {
                tracing::warn!(scan_id = %scan_id, "scan exceeded global timeout, marking unsettled services as timed out");
                services::mark_unsettled_as_timed_out(pool, scan_id).await?;
                break;
            }
        }
    }

    Ok(())
}

/// Reload the service row set, compute the terminal status, transition the
/// scan, store to cache when appropriate, and emit the finalization event.
async fn finalize(
    pool: &PgPool,
    sink: &Arc<ObservabilitySink>,
    scan_id: &str,
    fingerprint: &str,
    plan_tier: scanorch_db::models::PlanTier,
    cache_ttl: &scanorch_db::config::CacheTtlConfig,
) -> Result<(), OrchestratorError> {
    let rows = services::list_services_for_scan(pool, scan_id).await?;
    let terminal = crate::state::terminal_status(&rows);

    let bundle = scans::load_scan_bundle(pool, scan_id)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(scan_id.to_string()))?;
    let total_execution_ms = bundle
        .scan
        .started_at
        .map(|started| (chrono::Utc::now() - started).num_milliseconds().max(0))
        .unwrap_or(0);

    dispatch::finalize_scan(pool, scan_id, terminal, total_execution_ms).await?;

    if matches!(terminal, ScanStatus::Completed | ScanStatus::Partial) {
        if let Err(e) = cache::store(pool, fingerprint, scan_id, terminal, plan_tier, cache_ttl).await
        {
            tracing::warn!(scan_id = %scan_id, error = %e, "failed to store cache entry after finalization");
        }
    }

    // Re-read `cached` rather than assume the store above landed: it's
    // best-effort and swallows its own database errors.
    let cached = scans::get_scan(pool, scan_id)
        .await?
        .map(|s| s.cached)
        .unwrap_or(false);

    let services_failed = rows.iter().filter(|s| s.status == ServiceStatus::Failed).count() as i32;
    let user_type = if bundle.scan.user_id.is_some() { "user" } else { "guest" };
    sink.record_scan_metric(ScanMetricRow {
        scan_id: scan_id.to_string(),
        user_type: user_type.to_string(),
        plan: plan_tier,
        url: bundle.scan.normalized_url.clone(),
        status: terminal,
        cached,
        total_execution_ms: Some(total_execution_ms),
        services_executed: rows.len() as i32,
        services_failed,
    });
    for row in &rows {
        sink.record_service_metric(ServiceMetricRow {
            scan_id: scan_id.to_string(),
            service_name: row.service_name.clone(),
            status: row.status,
            execution_ms: row.execution_ms,
            retry_attempts: row.attempts,
            error_code: row.error_code.clone(),
            error_message: row.error_message.clone(),
        });
    }

    match terminal {
        ScanStatus::Completed => sink.emit(Event::ScanCompleted {
            scan_id: scan_id.to_string(),
        }),
        _ => sink.emit(Event::ScanFailed {
            scan_id: scan_id.to_string(),
        }),
    }

    Ok(())
}
