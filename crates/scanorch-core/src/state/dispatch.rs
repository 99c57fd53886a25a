//! Convenience dispatch helpers that validate a transition against
//! [`super::is_valid_scan_transition`] before delegating to the repository's
//! CAS-guarded `transition_scan`.

use chrono::Utc;
use sqlx::PgPool;

use scanorch_db::models::ScanStatus;
use scanorch_db::queries::scans::{self, TransitionScanError};

use super::is_valid_scan_transition;

/// Assert the transition is a legal edge (a programming error if not --
/// every public function in this module only ever requests a valid edge),
/// then attempt the CAS update. A [`TransitionScanError::InvalidTransition`]
/// from the repository means the database's current status no longer
/// matches `from`: an optimistic lock loss, which is the expected shape of
/// "someone else already claimed this transition" (spec §4.I idempotency).
async fn guarded_transition(
    pool: &PgPool,
    scan_id: &str,
    from: ScanStatus,
    to: ScanStatus,
    started_at: Option<chrono::DateTime<Utc>>,
    completed_at: Option<chrono::DateTime<Utc>>,
    total_execution_ms: Option<i64>,
) -> Result<(), TransitionScanError> {
    debug_assert!(
        is_valid_scan_transition(from, to),
        "dispatch requested an illegal scan transition {from} -> {to}"
    );

    scans::transition_scan(
        pool,
        scan_id,
        from,
        to,
        started_at,
        completed_at,
        total_execution_ms,
    )
    .await
}

/// `pending -> running`: the orchestrator is about to start fan-out.
pub async fn start_scan(pool: &PgPool, scan_id: &str) -> Result<(), TransitionScanError> {
    guarded_transition(
        pool,
        scan_id,
        ScanStatus::Pending,
        ScanStatus::Running,
        Some(Utc::now()),
        None,
        None,
    )
    .await
}

/// `pending -> failed`: a fatal error occurred before any service was
/// dispatched.
pub async fn fail_before_dispatch(
    pool: &PgPool,
    scan_id: &str,
) -> Result<(), TransitionScanError> {
    guarded_transition(
        pool,
        scan_id,
        ScanStatus::Pending,
        ScanStatus::Failed,
        None,
        Some(Utc::now()),
        Some(0),
    )
    .await
}

/// `running -> {completed, partial, failed}`: the orchestrator finalizes
/// the scan once every service has settled.
pub async fn finalize_scan(
    pool: &PgPool,
    scan_id: &str,
    terminal: ScanStatus,
    total_execution_ms: i64,
) -> Result<(), TransitionScanError> {
    debug_assert!(terminal.is_terminal());
    guarded_transition(
        pool,
        scan_id,
        ScanStatus::Running,
        terminal,
        None,
        Some(Utc::now()),
        Some(total_execution_ms),
    )
    .await
}

/// `{completed, partial, failed} -> running`: an admitted retry. Only the
/// first concurrent caller observes `Ok`; the rest see
/// [`TransitionScanError::InvalidTransition`] because the row has already
/// flipped out of the expected `from` status (spec §4.I idempotency rule).
/// `started_at` is left untouched: it records the scan's original start,
/// set once on its first transition to `running` (spec §3), not the retry.
pub async fn retry_scan(
    pool: &PgPool,
    scan_id: &str,
    from: ScanStatus,
) -> Result<(), TransitionScanError> {
    guarded_transition(pool, scan_id, from, ScanStatus::Running, None, None, None).await
}
