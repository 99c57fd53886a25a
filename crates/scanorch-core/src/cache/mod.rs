//! Cache Service: lookup/store of completed scans by fingerprint, under a
//! plan-dependent TTL, plus a background sweeper. Spec §4.E.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use scanorch_db::models::{PlanTier, ScanStatus};
use scanorch_db::queries::cache;
use scanorch_db::queries::scans::{self, ScanBundle};

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("scan status {0} is not cacheable (only completed/partial scans are)")]
    NotCacheable(ScanStatus),
}

/// TTL per plan tier, per spec §4.E (GUEST 6h, FREE 12h, PRO 24h) and
/// overridable via [`scanorch_db::config::CacheTtlConfig`].
pub fn ttl_for(plan: PlanTier, ttl_config: &scanorch_db::config::CacheTtlConfig) -> Duration {
    match plan {
        PlanTier::Guest => ttl_config.guest,
        PlanTier::Free => ttl_config.free,
        PlanTier::Pro => ttl_config.pro,
    }
}

/// Look up a fresh cache entry and its referenced scan bundle.
///
/// Returns `None` when `allow_bypass` is set (retries and explicit `force`
/// requests always miss), when no entry exists, or when the entry has
/// expired (in which case it is asynchronously deleted).
pub async fn lookup(
    pool: &PgPool,
    fingerprint: &str,
    allow_bypass: bool,
) -> Result<Option<ScanBundle>, sqlx::Error> {
    if allow_bypass {
        return Ok(None);
    }

    let Some(entry) = cache::find_cache_entry(pool, fingerprint).await? else {
        return Ok(None);
    };

    if entry.expires_at <= Utc::now() {
        let pool = pool.clone();
        let fp = fingerprint.to_string();
        tokio::spawn(async move {
            if let Err(e) = cache::delete_cache_entry(&pool, &fp).await {
                tracing::warn!(error = %e, fingerprint = %fp, "failed to delete expired cache entry");
            }
        });
        return Ok(None);
    }

    scans::load_scan_bundle(pool, &entry.scan_id).await
}

/// Store a completed or partial scan under its fingerprint with a
/// plan-dependent TTL.
pub async fn store(
    pool: &PgPool,
    fingerprint: &str,
    scan_id: &str,
    status: ScanStatus,
    plan: PlanTier,
    ttl_config: &scanorch_db::config::CacheTtlConfig,
) -> Result<(), CacheError> {
    if !matches!(status, ScanStatus::Completed | ScanStatus::Partial) {
        return Err(CacheError::NotCacheable(status));
    }

    let expires_at = Utc::now()
        + chrono::Duration::from_std(ttl_for(plan, ttl_config))
            .unwrap_or_else(|_| chrono::Duration::hours(6));

    if let Err(e) = cache::put_cache_entry(pool, fingerprint, scan_id, expires_at).await {
        tracing::error!(error = %e, scan_id = %scan_id, "failed to store cache entry");
    } else if let Err(e) = scans::mark_cached(pool, scan_id).await {
        tracing::warn!(error = %e, scan_id = %scan_id, "failed to flag scan as cached");
    }

    Ok(())
}

/// Liveness marker for the background sweeper, surfaced by `GET /health`.
#[derive(Clone, Default)]
pub struct SweeperHandle {
    last_sweep_unix: Arc<AtomicI64>,
}

impl SweeperHandle {
    /// Seconds since the Unix epoch at which the sweeper last completed a
    /// cycle, or `None` if it has not run yet.
    pub fn last_sweep_unix(&self) -> Option<i64> {
        let v = self.last_sweep_unix.load(Ordering::Relaxed);
        if v == 0 {
            None
        } else {
            Some(v)
        }
    }
}

/// Spawn the background sweeper: on `interval`, delete expired cache
/// entries. Best-effort (stale entries are also rejected on read), runs
/// until `cancel` fires.
pub fn spawn_sweeper(
    pool: PgPool,
    interval: Duration,
    cancel: CancellationToken,
) -> (tokio::task::JoinHandle<()>, SweeperHandle) {
    let handle = SweeperHandle::default();
    let handle_clone = handle.clone();

    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match cache::sweep_expired(&pool).await {
                        Ok(count) if count > 0 => {
                            tracing::info!(removed = count, "cache sweeper removed expired entries");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "cache sweep failed (best-effort)");
                        }
                    }
                    handle_clone
                        .last_sweep_unix
                        .store(Utc::now().timestamp(), Ordering::Relaxed);
                }
                _ = cancel.cancelled() => {
                    tracing::info!("cache sweeper stopping on cancellation");
                    break;
                }
            }
        }
    });

    (join, handle)
}
