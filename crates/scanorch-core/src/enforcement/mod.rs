//! Plan Enforcement: identity resolution, quota checks, and the
//! allowed-service filter. Spec §4.D.

use chrono::{NaiveDate, Utc};
use sqlx::PgPool;

use scanorch_db::models::{Identity, PlanTier, User};
use scanorch_db::queries::usage::{self, QuotaResult};
use scanorch_db::queries::users;

use crate::plan::{self, PlanLimits};

/// The resolved identity and effective plan for one request.
#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    pub identity: Identity,
    pub plan: PlanTier,
}

/// Resolve the caller's identity and effective plan tier (spec §4.D):
/// a verified user id resolves against their stored plan (demoted to FREE
/// if their subscription has expired); otherwise the caller is GUEST,
/// identified by IP.
pub async fn resolve_identity(
    pool: &PgPool,
    user_id: Option<uuid::Uuid>,
    client_ip: &str,
) -> Result<ResolvedIdentity, sqlx::Error> {
    let Some(user_id) = user_id else {
        return Ok(ResolvedIdentity {
            identity: Identity::Ip(client_ip.to_string()),
            plan: PlanTier::Guest,
        });
    };

    let user = users::get_user(pool, user_id).await?;
    let plan = match user {
        Some(User {
            plan,
            subscription_active,
            subscription_expires_at,
            ..
        }) => {
            let expired = !subscription_active
                || subscription_expires_at.is_some_and(|exp| exp < Utc::now());
            if expired {
                PlanTier::Free
            } else {
                plan
            }
        }
        None => PlanTier::Guest,
    };

    Ok(ResolvedIdentity {
        identity: Identity::User(user_id),
        plan,
    })
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EnforcementError {
    #[error("daily scan limit reached: {current}/{limit}")]
    DailyLimitReached { limit: i32, current: i32 },
    #[error("daily retry limit reached: {current}/{limit}")]
    RetryLimitReached { limit: i32, current: i32 },
    #[error("downloads are not available on this plan")]
    DownloadsRestricted,
}

/// Admit a new scan request against the daily scan quota. On success, the
/// quota has already been incremented (spec §4.D: "increments happen after
/// successful admission").
pub async fn admit_scan(
    pool: &PgPool,
    identity: &Identity,
    limits: &PlanLimits,
) -> Result<(), EnforcementError> {
    let today = Utc::now().date_naive();
    consume(
        pool,
        identity,
        today,
        limits.daily_scans,
        Quota::Scan,
    )
    .await
    .map_err(|current| EnforcementError::DailyLimitReached {
        limit: limits.daily_scans,
        current,
    })
}

/// Admit a retry request against the daily retry quota.
pub async fn admit_retry(
    pool: &PgPool,
    identity: &Identity,
    limits: &PlanLimits,
) -> Result<(), EnforcementError> {
    let today = Utc::now().date_naive();
    consume(
        pool,
        identity,
        today,
        daily_retry_limit(limits),
        Quota::Retry,
    )
    .await
    .map_err(|current| EnforcementError::RetryLimitReached {
        limit: daily_retry_limit(limits),
        current,
    })
}

/// The daily retry budget: spec §9 resolves the "per-day vs per-scan"
/// ambiguity in favor of per-day-per-identity, sized to the plan's
/// per-service retry allowance (0 for GUEST, since GUEST cannot retry).
fn daily_retry_limit(limits: &PlanLimits) -> i32 {
    if limits.retries_per_service == 0 {
        0
    } else {
        // A generous daily ceiling: enough retry calls to exhaust every
        // catalogue service's per-service budget at least once per day.
        limits.retries_per_service * plan::SERVICE_CATALOGUE.len() as i32
    }
}

/// Check whether the plan allows downloads/exports.
pub fn check_downloads(limits: &PlanLimits) -> Result<(), EnforcementError> {
    if limits.downloads_allowed {
        Ok(())
    } else {
        Err(EnforcementError::DownloadsRestricted)
    }
}

enum Quota {
    Scan,
    Retry,
}

async fn consume(
    pool: &PgPool,
    identity: &Identity,
    date: NaiveDate,
    limit: i32,
    kind: Quota,
) -> Result<(), i32> {
    let key = identity.key();
    let result = match kind {
        Quota::Scan => usage::consume_daily_scan(pool, &key, date, limit).await,
        Quota::Retry => usage::consume_retry(pool, &key, date, limit).await,
    };
    match result {
        Ok(QuotaResult::Admitted { .. }) => Ok(()),
        Ok(QuotaResult::Exceeded { current }) => Err(current),
        Err(e) => {
            tracing::error!(error = %e, "quota consumption query failed");
            Err(limit)
        }
    }
}

/// Split a requested service set into the effective (allowed) set and the
/// restricted set, per spec §4.D: "given requested service set S and
/// plan's allowed set A, the orchestrator will only run S ∩ A."
pub fn filter_allowed_services<'a>(
    requested: &[&'a str],
    limits: &PlanLimits,
) -> (Vec<&'a str>, Vec<&'a str>) {
    let mut allowed = Vec::new();
    let mut restricted = Vec::new();
    for &name in requested {
        if limits.allows(name) {
            allowed.push(name);
        } else {
            restricted.push(name);
        }
    }
    (allowed, restricted)
}
