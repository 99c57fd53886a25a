//! Database query functions for the `cache_entries` table.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::CacheEntry;

/// Look up a cache entry by fingerprint. Does not check expiry; callers
/// decide freshness against `expires_at`.
pub async fn find_cache_entry(
    pool: &PgPool,
    fingerprint: &str,
) -> Result<Option<CacheEntry>, sqlx::Error> {
    sqlx::query_as::<_, CacheEntry>("SELECT * FROM cache_entries WHERE fingerprint = $1")
        .bind(fingerprint)
        .fetch_optional(pool)
        .await
}

/// Insert or replace the cache entry for a fingerprint. On collision the
/// newer entry replaces the older (spec §3 CacheEntry invariant); this is a
/// single upsert so concurrent writers never raise.
pub async fn put_cache_entry(
    pool: &PgPool,
    fingerprint: &str,
    scan_id: &str,
    expires_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO cache_entries (fingerprint, scan_id, expires_at) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (fingerprint) \
         DO UPDATE SET scan_id = EXCLUDED.scan_id, \
                       created_at = NOW(), \
                       expires_at = EXCLUDED.expires_at",
    )
    .bind(fingerprint)
    .bind(scan_id)
    .bind(expires_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Delete a single stale entry (best-effort, called on a cache-miss read
/// that found an expired row).
pub async fn delete_cache_entry(pool: &PgPool, fingerprint: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM cache_entries WHERE fingerprint = $1")
        .bind(fingerprint)
        .execute(pool)
        .await?;
    Ok(())
}

/// Delete every entry whose `expires_at` has passed. Returns the number of
/// rows removed. Used by the background sweeper.
pub async fn sweep_expired(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= NOW()")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
