//! Retry Subsystem: surgical per-service retry of a terminal scan.
//! Spec §4.I.
//!
//! ```text
//! 1. consume the daily retry quota for the caller's identity
//! 2. load the scan bundle, assert it is in a terminal state
//! 3. compute the eligible set: failed, retryable, attempts < max_attempts,
//!    intersected with the caller's requested subset (or all eligible if none given)
//! 4. surgically reset each eligible row to pending
//! 5. transition the scan back to running (idempotent: only the first
//!    concurrent caller wins the CAS)
//! 6. hand the eligible set to the orchestrator's retry entry point
//! ```

use sqlx::PgPool;

use scanorch_db::models::{Identity, ScanStatus, ServiceExecution};
use scanorch_db::queries::scans::TransitionScanError;
use scanorch_db::queries::services;

use crate::enforcement::{self, EnforcementError};
use crate::plan::PlanLimits;
use crate::state::dispatch;

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("scan {0} not found")]
    NotFound(String),
    #[error("scan {0} is not in a terminal state and cannot be retried")]
    NotTerminal(String),
    #[error("no service in this scan is eligible for retry")]
    NothingEligible,
    #[error(transparent)]
    Enforcement(#[from] EnforcementError),
    #[error(transparent)]
    Transition(#[from] TransitionScanError),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// The outcome of an admitted retry: the scan id and the service names that
/// were reset and must now be re-dispatched by the orchestrator.
#[derive(Debug, Clone)]
pub struct AdmittedRetry {
    pub scan_id: String,
    pub services: Vec<String>,
    pub from: ScanStatus,
}

/// Compute which service rows are retry-eligible, optionally restricted to a
/// caller-requested subset of names.
pub fn eligible_services<'a>(
    services: &'a [ServiceExecution],
    requested: Option<&[&str]>,
) -> Vec<&'a ServiceExecution> {
    services
        .iter()
        .filter(|s| s.can_retry())
        .filter(|s| match requested {
            None => true,
            Some(names) => names.contains(&s.service_name.as_str()),
        })
        .collect()
}

/// Admit and execute the bookkeeping half of a retry request: quota
/// consumption, eligibility computation, surgical resets, and the
/// terminal-to-running transition. Does **not** dispatch any service; the
/// caller (the orchestrator's retry entry point) is responsible for that.
pub async fn retry(
    pool: &PgPool,
    identity: &Identity,
    limits: &PlanLimits,
    scan_id: &str,
    requested_services: Option<&[&str]>,
) -> Result<AdmittedRetry, RetryError> {
    enforcement::admit_retry(pool, identity, limits).await?;

    let bundle = scanorch_db::queries::scans::load_scan_bundle(pool, scan_id)
        .await?
        .ok_or_else(|| RetryError::NotFound(scan_id.to_string()))?;

    if !bundle.scan.status.is_terminal() {
        return Err(RetryError::NotTerminal(scan_id.to_string()));
    }

    let eligible = eligible_services(&bundle.services, requested_services);
    if eligible.is_empty() {
        return Err(RetryError::NothingEligible);
    }
    let eligible_names: Vec<String> = eligible.iter().map(|s| s.service_name.clone()).collect();

    for name in &eligible_names {
        services::reset_service_for_retry(pool, scan_id, name).await?;
    }

    let from = bundle.scan.status;
    dispatch::retry_scan(pool, scan_id, from).await?;

    Ok(AdmittedRetry {
        scan_id: scan_id.to_string(),
        services: eligible_names,
        from,
    })
}
