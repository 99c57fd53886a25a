//! Database query functions for the `scans` and `service_executions` tables
//! (the scan side; see `queries::services` for the per-service side).

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::{Scan, ScanStatus, ServiceExecution};

/// Parameters for inserting a new scan together with its pending service rows.
pub struct NewScan<'a> {
    pub id: &'a str,
    pub submitted_url: &'a str,
    pub normalized_url: &'a str,
    pub fingerprint: &'a str,
    pub user_id: Option<uuid::Uuid>,
    pub owner_ip: Option<&'a str>,
    pub plan: crate::models::PlanTier,
    pub service_names: &'a [String],
    pub max_attempts: i32,
}

/// Error returned by [`create_scan_with_services`].
#[derive(Debug, thiserror::Error)]
pub enum CreateScanError {
    #[error("scan id {0} already exists")]
    DuplicateScanId(String),
    #[error(transparent)]
    Other(#[from] sqlx::Error),
}

/// Atomically insert a scan row and one pending service row per requested
/// name. Runs inside a single transaction so a crash between the two inserts
/// never leaves a scan without its service rows.
pub async fn create_scan_with_services(
    pool: &PgPool,
    new_scan: NewScan<'_>,
) -> Result<(), CreateScanError> {
    let mut tx = pool.begin().await?;

    let insert_scan = sqlx::query(
        "INSERT INTO scans (id, submitted_url, normalized_url, fingerprint, user_id, owner_ip, plan, status) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')",
    )
    .bind(new_scan.id)
    .bind(new_scan.submitted_url)
    .bind(new_scan.normalized_url)
    .bind(new_scan.fingerprint)
    .bind(new_scan.user_id)
    .bind(new_scan.owner_ip)
    .bind(new_scan.plan)
    .execute(&mut *tx)
    .await;

    if let Err(sqlx::Error::Database(ref db_err)) = insert_scan {
        if db_err.is_unique_violation() {
            return Err(CreateScanError::DuplicateScanId(new_scan.id.to_string()));
        }
    }
    insert_scan?;

    for name in new_scan.service_names {
        sqlx::query(
            "INSERT INTO service_executions (scan_id, service_name, status, attempts, max_attempts) \
             VALUES ($1, $2, 'pending', 0, $3)",
        )
        .bind(new_scan.id)
        .bind(name)
        .bind(new_scan.max_attempts)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// A scan row plus all of its service rows, read as a single consistent
/// snapshot (one query per table, inside an implicit repeatable read is not
/// required here since both reads observe the same transactionally-committed
/// state on Postgres's default read-committed isolation for a single-query
/// join would also work; we use two queries joined by the caller for
/// simplicity and to keep `ServiceExecution` reusable standalone).
#[derive(Debug, Clone)]
pub struct ScanBundle {
    pub scan: Scan,
    pub services: Vec<ServiceExecution>,
}

/// Load a scan and all its service rows in one consistent snapshot.
pub async fn load_scan_bundle(pool: &PgPool, scan_id: &str) -> Result<Option<ScanBundle>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let scan = sqlx::query_as::<_, Scan>("SELECT * FROM scans WHERE id = $1")
        .bind(scan_id)
        .fetch_optional(&mut *tx)
        .await?;

    let Some(scan) = scan else {
        tx.rollback().await?;
        return Ok(None);
    };

    let services = sqlx::query_as::<_, ServiceExecution>(
        "SELECT * FROM service_executions WHERE scan_id = $1 ORDER BY service_name",
    )
    .bind(scan_id)
    .fetch_all(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some(ScanBundle { scan, services }))
}

/// Fetch a scan row alone, without its services.
pub async fn get_scan(pool: &PgPool, scan_id: &str) -> Result<Option<Scan>, sqlx::Error> {
    sqlx::query_as::<_, Scan>("SELECT * FROM scans WHERE id = $1")
        .bind(scan_id)
        .fetch_optional(pool)
        .await
}

/// Error returned by [`transition_scan`].
#[derive(Debug, thiserror::Error)]
pub enum TransitionScanError {
    #[error("scan {0} not found")]
    NotFound(String),
    #[error("scan {scan_id} has status {actual}, expected {expected}")]
    InvalidTransition {
        scan_id: String,
        expected: ScanStatus,
        actual: ScanStatus,
    },
    #[error(transparent)]
    Other(#[from] sqlx::Error),
}

/// CAS transition of `scans.status`. The `WHERE status = $from` clause means
/// at most one concurrent caller observes `rows_affected() == 1`.
pub async fn transition_scan(
    pool: &PgPool,
    scan_id: &str,
    from: ScanStatus,
    to: ScanStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    total_execution_ms: Option<i64>,
) -> Result<(), TransitionScanError> {
    let result = sqlx::query(
        "UPDATE scans \
         SET status = $1, \
             started_at = COALESCE($2, started_at), \
             completed_at = COALESCE($3, completed_at), \
             total_execution_ms = COALESCE($4, total_execution_ms) \
         WHERE id = $5 AND status = $6",
    )
    .bind(to)
    .bind(started_at)
    .bind(completed_at)
    .bind(total_execution_ms)
    .bind(scan_id)
    .bind(from)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        let actual = get_scan(pool, scan_id).await?;
        return match actual {
            None => Err(TransitionScanError::NotFound(scan_id.to_string())),
            Some(s) => Err(TransitionScanError::InvalidTransition {
                scan_id: scan_id.to_string(),
                expected: from,
                actual: s.status,
            }),
        };
    }

    Ok(())
}

/// Mark `cached = true` on a scan (set once a cache entry has been stored).
pub async fn mark_cached(pool: &PgPool, scan_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE scans SET cached = true WHERE id = $1")
        .bind(scan_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Scans stuck in `running` past their deadline (process crashed or was
/// killed mid-scan). Used for startup crash recovery.
pub async fn find_running_scans(pool: &PgPool) -> Result<Vec<Scan>, sqlx::Error> {
    sqlx::query_as::<_, Scan>("SELECT * FROM scans WHERE status = 'running'")
        .fetch_all(pool)
        .await
}
