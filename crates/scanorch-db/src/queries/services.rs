//! Database query functions for the per-service side of `service_executions`.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::{ServiceExecution, ServiceStatus};

/// Patch applied when a service transitions pending->running or settles into
/// success/failed. All fields are optional; `None` leaves the column
/// untouched (`COALESCE`).
#[derive(Debug, Default)]
pub struct ServicePatch {
    pub result: Option<serde_json::Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub error_retryable: Option<bool>,
    pub execution_ms: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Set a service's status and patch fields, and increment `attempts` by one,
/// but only while the row is still `running`. Used by the Service Executor,
/// which always bumps the attempt counter "irrespective of outcome" (spec
/// §4.G) -- except a row the global timeout already settled to
/// `failed(SCAN_TIMEOUT)` must stay there even if the underlying call later
/// completes; the `running` guard makes that a no-op rather than a
/// resurrection back to `success`.
pub async fn update_service(
    pool: &PgPool,
    scan_id: &str,
    service_name: &str,
    status: ServiceStatus,
    patch: ServicePatch,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE service_executions \
         SET status = $1, \
             attempts = attempts + 1, \
             result = COALESCE($2, result), \
             error_code = $3, \
             error_message = $4, \
             error_retryable = $5, \
             execution_ms = COALESCE($6, execution_ms), \
             started_at = COALESCE($7, started_at), \
             completed_at = COALESCE($8, completed_at) \
         WHERE scan_id = $9 AND service_name = $10 AND status = 'running'",
    )
    .bind(status)
    .bind(patch.result)
    .bind(patch.error_code)
    .bind(patch.error_message)
    .bind(patch.error_retryable)
    .bind(patch.execution_ms)
    .bind(patch.started_at)
    .bind(patch.completed_at)
    .bind(scan_id)
    .bind(service_name)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Transition a service row `pending -> running`, recording the attempt
/// start time, without incrementing `attempts` (the attempt is only counted
/// once the invocation settles, in [`update_service`]).
pub async fn mark_service_running(
    pool: &PgPool,
    scan_id: &str,
    service_name: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE service_executions \
         SET status = 'running', started_at = NOW() \
         WHERE scan_id = $1 AND service_name = $2 AND status = 'pending'",
    )
    .bind(scan_id)
    .bind(service_name)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Write a `failed` row synchronously without ever transitioning through
/// `running` (used for `SERVICE_RESTRICTED` at fan-out, and for scans that
/// fail before dispatch).
pub async fn mark_service_restricted(
    pool: &PgPool,
    scan_id: &str,
    service_name: &str,
    code: &str,
    message: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE service_executions \
         SET status = 'failed', \
             error_code = $1, \
             error_message = $2, \
             error_retryable = false, \
             completed_at = NOW() \
         WHERE scan_id = $3 AND service_name = $4",
    )
    .bind(code)
    .bind(message)
    .bind(scan_id)
    .bind(service_name)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Surgical reset (spec glossary): set a failed service back to `pending`,
/// clear its error and execution time, but never touch `attempts` or any
/// other service's row.
pub async fn reset_service_for_retry(
    pool: &PgPool,
    scan_id: &str,
    service_name: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE service_executions \
         SET status = 'pending', \
             error_code = NULL, \
             error_message = NULL, \
             error_retryable = NULL, \
             execution_ms = NULL, \
             started_at = NULL, \
             completed_at = NULL \
         WHERE scan_id = $1 AND service_name = $2 AND status = 'failed'",
    )
    .bind(scan_id)
    .bind(service_name)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Mark every still-running or still-pending service in a scan as
/// `failed(SCAN_TIMEOUT)`. Used by the orchestrator's deadline handling and
/// by startup crash recovery for orphaned scans.
pub async fn mark_unsettled_as_timed_out(
    pool: &PgPool,
    scan_id: &str,
) -> Result<Vec<ServiceExecution>, sqlx::Error> {
    sqlx::query_as::<_, ServiceExecution>(
        "UPDATE service_executions \
         SET status = 'failed', \
             error_code = 'SCAN_TIMEOUT', \
             error_message = 'scan exceeded its global timeout', \
             error_retryable = true, \
             completed_at = NOW() \
         WHERE scan_id = $1 AND status IN ('pending', 'running') \
         RETURNING *",
    )
    .bind(scan_id)
    .fetch_all(pool)
    .await
}

/// List all service rows for a scan, ordered by name (stable projector
/// output ordering).
pub async fn list_services_for_scan(
    pool: &PgPool,
    scan_id: &str,
) -> Result<Vec<ServiceExecution>, sqlx::Error> {
    sqlx::query_as::<_, ServiceExecution>(
        "SELECT * FROM service_executions WHERE scan_id = $1 ORDER BY service_name",
    )
    .bind(scan_id)
    .fetch_all(pool)
    .await
}
