//! Database query functions for the append-only `scan_metrics` and
//! `service_metrics` tables, and the aggregate views behind
//! `GET /monitoring/metrics`.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::{PlanTier, ScanStatus, ServiceStatus};

/// Parameters for inserting a scan-level metric row.
pub struct NewScanMetric<'a> {
    pub scan_id: &'a str,
    pub user_type: &'a str,
    pub plan: PlanTier,
    pub url: &'a str,
    pub status: ScanStatus,
    pub cached: bool,
    pub total_execution_ms: Option<i64>,
    pub services_executed: i32,
    pub services_failed: i32,
}

/// Insert a scan-level analytics row. Fire-and-forget: callers log and
/// swallow errors (spec §3, §4.K) rather than letting this affect the scan.
pub async fn insert_scan_metric(pool: &PgPool, row: NewScanMetric<'_>) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO scan_metrics \
         (scan_id, user_type, plan, url, status, cached, total_execution_ms, services_executed, services_failed) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(row.scan_id)
    .bind(row.user_type)
    .bind(row.plan)
    .bind(row.url)
    .bind(row.status)
    .bind(row.cached)
    .bind(row.total_execution_ms)
    .bind(row.services_executed)
    .bind(row.services_failed)
    .execute(pool)
    .await?;
    Ok(())
}

/// Parameters for inserting a service-level metric row.
pub struct NewServiceMetric<'a> {
    pub scan_id: &'a str,
    pub service_name: &'a str,
    pub status: ServiceStatus,
    pub execution_ms: Option<i64>,
    pub retry_attempts: i32,
    pub error_code: Option<&'a str>,
    pub error_message: Option<&'a str>,
}

/// Insert a service-level analytics row. Fire-and-forget, same as
/// [`insert_scan_metric`].
pub async fn insert_service_metric(
    pool: &PgPool,
    row: NewServiceMetric<'_>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO service_metrics \
         (scan_id, service_name, status, execution_ms, retry_attempts, error_code, error_message) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(row.scan_id)
    .bind(row.service_name)
    .bind(row.status)
    .bind(row.execution_ms)
    .bind(row.retry_attempts)
    .bind(row.error_code)
    .bind(row.error_message)
    .execute(pool)
    .await?;
    Ok(())
}

/// Aggregate counts and rates for `GET /monitoring/metrics`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MetricsSummary {
    pub total_scans: i64,
    pub completed: i64,
    pub partial: i64,
    pub failed: i64,
    pub avg_execution_ms: Option<f64>,
    pub cache_hits: i64,
    pub cache_hit_rate: f64,
    pub service_failures: Vec<ServiceFailureCount>,
}

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct ServiceFailureCount {
    pub service_name: String,
    pub failures: i64,
}

/// Summarize `scan_metrics`/`service_metrics` within an optional time
/// window. `since` is inclusive; `None` means "all time".
pub async fn summarize(
    pool: &PgPool,
    since: Option<DateTime<Utc>>,
) -> Result<MetricsSummary, sqlx::Error> {
    let scan_rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*) FROM scan_metrics \
         WHERE recorded_at >= COALESCE($1, to_timestamp(0)) \
         GROUP BY status",
    )
    .bind(since)
    .fetch_all(pool)
    .await?;

    let mut summary = MetricsSummary::default();
    for (status, count) in scan_rows {
        summary.total_scans += count;
        match status.as_str() {
            "completed" => summary.completed = count,
            "partial" => summary.partial = count,
            "failed" => summary.failed = count,
            _ => {}
        }
    }

    let avg_row: (Option<f64>,) = sqlx::query_as(
        "SELECT AVG(total_execution_ms) FROM scan_metrics \
         WHERE recorded_at >= COALESCE($1, to_timestamp(0))",
    )
    .bind(since)
    .fetch_one(pool)
    .await?;
    summary.avg_execution_ms = avg_row.0;

    let cache_row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM scan_metrics \
         WHERE cached = true AND recorded_at >= COALESCE($1, to_timestamp(0))",
    )
    .bind(since)
    .fetch_one(pool)
    .await?;
    summary.cache_hits = cache_row.0;
    summary.cache_hit_rate = if summary.total_scans > 0 {
        summary.cache_hits as f64 / summary.total_scans as f64
    } else {
        0.0
    };

    summary.service_failures = sqlx::query_as::<_, ServiceFailureCount>(
        "SELECT service_name, COUNT(*) AS failures FROM service_metrics \
         WHERE status = 'failed' AND recorded_at >= COALESCE($1, to_timestamp(0)) \
         GROUP BY service_name \
         ORDER BY failures DESC",
    )
    .bind(since)
    .fetch_all(pool)
    .await?;

    Ok(summary)
}
