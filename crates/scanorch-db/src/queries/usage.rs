//! Database query functions for the `usage_counters` table.
//!
//! Quota increments use a single `INSERT ... ON CONFLICT DO UPDATE ...
//! RETURNING` statement so the read-check-increment sequence is atomic under
//! concurrent callers sharing the same `(identity_key, usage_date)` key, per
//! spec §4.B / §5.

use chrono::NaiveDate;
use sqlx::PgPool;

/// Outcome of attempting to consume one unit of a daily quota.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaResult {
    /// The unit was admitted; `used` is the counter's new value.
    Admitted { used: i32 },
    /// The counter was already at or above `limit`; no increment occurred.
    Exceeded { current: i32 },
}

/// Atomically increment `scans_used` for `(identity_key, usage_date)` if
/// doing so would not exceed `limit`, inserting the row with `scans_used=1`
/// on first use for the day.
pub async fn consume_daily_scan(
    pool: &PgPool,
    identity_key: &str,
    usage_date: NaiveDate,
    limit: i32,
) -> Result<QuotaResult, sqlx::Error> {
    consume_counter(pool, identity_key, usage_date, limit, "scans_used").await
}

/// Analogous to [`consume_daily_scan`] for the retry quota.
pub async fn consume_retry(
    pool: &PgPool,
    identity_key: &str,
    usage_date: NaiveDate,
    limit: i32,
) -> Result<QuotaResult, sqlx::Error> {
    consume_counter(pool, identity_key, usage_date, limit, "retries_used").await
}

/// Analogous to [`consume_daily_scan`] for the downloads quota.
pub async fn consume_download(
    pool: &PgPool,
    identity_key: &str,
    usage_date: NaiveDate,
    limit: i32,
) -> Result<QuotaResult, sqlx::Error> {
    consume_counter(pool, identity_key, usage_date, limit, "downloads_used").await
}

async fn consume_counter(
    pool: &PgPool,
    identity_key: &str,
    usage_date: NaiveDate,
    limit: i32,
    column: &'static str,
) -> Result<QuotaResult, sqlx::Error> {
    // `column` is one of a fixed, hard-coded set of three identifiers above,
    // never caller-supplied, so string interpolation here is not an
    // injection vector.
    let query = format!(
        "INSERT INTO usage_counters (identity_key, usage_date, {column}) \
         VALUES ($1, $2, 1) \
         ON CONFLICT (identity_key, usage_date) \
         DO UPDATE SET {column} = usage_counters.{column} + 1 \
         WHERE usage_counters.{column} < $3 \
         RETURNING {column}"
    );

    let row: Option<(i32,)> = sqlx::query_as(&query)
        .bind(identity_key)
        .bind(usage_date)
        .bind(limit)
        .fetch_optional(pool)
        .await?;

    match row {
        Some((used,)) => Ok(QuotaResult::Admitted { used }),
        None => {
            let current = get_counter_value(pool, identity_key, usage_date, column).await?;
            Ok(QuotaResult::Exceeded { current })
        }
    }
}

async fn get_counter_value(
    pool: &PgPool,
    identity_key: &str,
    usage_date: NaiveDate,
    column: &'static str,
) -> Result<i32, sqlx::Error> {
    let query = format!(
        "SELECT {column} FROM usage_counters WHERE identity_key = $1 AND usage_date = $2"
    );
    let row: Option<(i32,)> = sqlx::query_as(&query)
        .bind(identity_key)
        .bind(usage_date)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(v,)| v).unwrap_or(0))
}
