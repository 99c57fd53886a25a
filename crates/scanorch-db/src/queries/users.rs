//! Database query functions for the `users` table.

use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{PlanTier, User};

/// Fetch a user by id. Guest callers have no row; absence is a normal,
/// non-error outcome for them.
pub async fn get_user(pool: &PgPool, id: Uuid) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Insert a new user row with the given plan tier (test/admin helper; no
/// public signup flow is part of this system's scope).
pub async fn insert_user(pool: &PgPool, id: Uuid, plan: PlanTier) -> Result<User, sqlx::Error> {
    sqlx::query_as::<_, User>(
        "INSERT INTO users (id, plan, subscription_active) VALUES ($1, $2, true) RETURNING *",
    )
    .bind(id)
    .bind(plan)
    .fetch_one(pool)
    .await
}
