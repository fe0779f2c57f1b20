//! Query layer over the `tokens` and `token_usages` tables.
//!
//! The allocator's correctness hangs on two row-lock disciplines here:
//! `pick_available_for_update` uses SKIP LOCKED so concurrent activations
//! fan out over distinct available rows instead of queueing on one, and
//! `pick_oldest_active_for_update` takes a plain blocking lock so
//! preemption serializes on the single oldest row.
//!
//! Methods take an executor, so the same query runs against the pool for
//! plain reads or against `&mut *tx` inside an allocator transaction.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgExecutor;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Token, TokenUsage};

#[derive(Clone)]
pub struct TokenRepository {
    pool: PgPool,
}

impl TokenRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // -- Counts --

    pub async fn count_total(&self, executor: impl PgExecutor<'_>) -> sqlx::Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM tokens")
            .fetch_one(executor)
            .await
    }

    pub async fn count_active(&self, executor: impl PgExecutor<'_>) -> sqlx::Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM tokens WHERE status = 'active'")
            .fetch_one(executor)
            .await
    }

    pub async fn count_open_usages(&self, executor: impl PgExecutor<'_>) -> sqlx::Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM token_usages WHERE ended_at IS NULL")
            .fetch_one(executor)
            .await
    }

    // -- Token reads --

    pub async fn list_tokens(&self, executor: impl PgExecutor<'_>) -> sqlx::Result<Vec<Token>> {
        sqlx::query_as::<_, Token>(
            "SELECT id, status, current_user_id, activated_at, created_at, updated_at
             FROM tokens
             ORDER BY activated_at DESC NULLS LAST, id ASC",
        )
        .fetch_all(executor)
        .await
    }

    pub async fn get_token(
        &self,
        executor: impl PgExecutor<'_>,
        token_id: Uuid,
    ) -> sqlx::Result<Option<Token>> {
        sqlx::query_as::<_, Token>(
            "SELECT id, status, current_user_id, activated_at, created_at, updated_at
             FROM tokens WHERE id = $1",
        )
        .bind(token_id)
        .fetch_optional(executor)
        .await
    }

    /// Row-locked load, for transactions that will mutate the token.
    pub async fn get_token_for_update(
        &self,
        executor: impl PgExecutor<'_>,
        token_id: Uuid,
    ) -> sqlx::Result<Option<Token>> {
        sqlx::query_as::<_, Token>(
            "SELECT id, status, current_user_id, activated_at, created_at, updated_at
             FROM tokens WHERE id = $1 FOR UPDATE",
        )
        .bind(token_id)
        .fetch_optional(executor)
        .await
    }

    pub async fn get_user_active_token(
        &self,
        executor: impl PgExecutor<'_>,
        user_id: Uuid,
    ) -> sqlx::Result<Option<Token>> {
        sqlx::query_as::<_, Token>(
            "SELECT id, status, current_user_id, activated_at, created_at, updated_at
             FROM tokens WHERE status = 'active' AND current_user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(executor)
        .await
    }

    // -- Locked picks --

    /// Lock one available token, skipping rows other transactions already
    /// hold. Concurrent activators never block here and never observe the
    /// same row twice.
    pub async fn pick_available_for_update(
        &self,
        executor: impl PgExecutor<'_>,
    ) -> sqlx::Result<Option<Token>> {
        sqlx::query_as::<_, Token>(
            "SELECT id, status, current_user_id, activated_at, created_at, updated_at
             FROM tokens
             WHERE status = 'available'
             LIMIT 1
             FOR UPDATE SKIP LOCKED",
        )
        .fetch_optional(executor)
        .await
    }

    /// Lock the oldest active token, blocking until it is free. Ties on
    /// `activated_at` break by id so preemption stays deterministic.
    pub async fn pick_oldest_active_for_update(
        &self,
        executor: impl PgExecutor<'_>,
    ) -> sqlx::Result<Option<Token>> {
        sqlx::query_as::<_, Token>(
            "SELECT id, status, current_user_id, activated_at, created_at, updated_at
             FROM tokens
             WHERE status = 'active'
             ORDER BY activated_at ASC, id ASC
             LIMIT 1
             FOR UPDATE",
        )
        .fetch_optional(executor)
        .await
    }

    // -- Token writes --

    pub async fn mark_active(
        &self,
        executor: impl PgExecutor<'_>,
        token_id: Uuid,
        user_id: Uuid,
        activated_at: DateTime<Utc>,
    ) -> sqlx::Result<Token> {
        sqlx::query_as::<_, Token>(
            "UPDATE tokens
             SET status = 'active', current_user_id = $2, activated_at = $3, updated_at = NOW()
             WHERE id = $1
             RETURNING id, status, current_user_id, activated_at, created_at, updated_at",
        )
        .bind(token_id)
        .bind(user_id)
        .bind(activated_at)
        .fetch_one(executor)
        .await
    }

    pub async fn mark_available(
        &self,
        executor: impl PgExecutor<'_>,
        token_id: Uuid,
    ) -> sqlx::Result<Token> {
        sqlx::query_as::<_, Token>(
            "UPDATE tokens
             SET status = 'available', current_user_id = NULL, activated_at = NULL, updated_at = NOW()
             WHERE id = $1
             RETURNING id, status, current_user_id, activated_at, created_at, updated_at",
        )
        .bind(token_id)
        .fetch_one(executor)
        .await
    }

    /// Reset every active token and close every open usage at one
    /// timestamp (NOW() is stable within the enclosing transaction).
    /// Returns the reset token ids and the closed-usage count.
    pub async fn clear_all_active(
        &self,
        conn: &mut sqlx::PgConnection,
    ) -> sqlx::Result<(Vec<Uuid>, u64)> {
        let usages_closed =
            sqlx::query("UPDATE token_usages SET ended_at = NOW() WHERE ended_at IS NULL")
                .execute(&mut *conn)
                .await?
                .rows_affected();

        let token_ids = sqlx::query_scalar::<_, Uuid>(
            "UPDATE tokens
             SET status = 'available', current_user_id = NULL, activated_at = NULL, updated_at = NOW()
             WHERE status = 'active'
             RETURNING id",
        )
        .fetch_all(&mut *conn)
        .await?;

        Ok((token_ids, usages_closed))
    }

    // -- Usages --

    pub async fn insert_usage(
        &self,
        executor: impl PgExecutor<'_>,
        token_id: Uuid,
        user_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> sqlx::Result<TokenUsage> {
        sqlx::query_as::<_, TokenUsage>(
            "INSERT INTO token_usages (token_id, user_id, started_at)
             VALUES ($1, $2, $3)
             RETURNING id, token_id, user_id, started_at, ended_at, created_at",
        )
        .bind(token_id)
        .bind(user_id)
        .bind(started_at)
        .fetch_one(executor)
        .await
    }

    pub async fn close_usage(
        &self,
        executor: impl PgExecutor<'_>,
        usage_id: Uuid,
        ended_at: DateTime<Utc>,
    ) -> sqlx::Result<TokenUsage> {
        sqlx::query_as::<_, TokenUsage>(
            "UPDATE token_usages SET ended_at = $2
             WHERE id = $1
             RETURNING id, token_id, user_id, started_at, ended_at, created_at",
        )
        .bind(usage_id)
        .bind(ended_at)
        .fetch_one(executor)
        .await
    }

    pub async fn get_open_usage(
        &self,
        executor: impl PgExecutor<'_>,
        token_id: Uuid,
    ) -> sqlx::Result<Option<TokenUsage>> {
        sqlx::query_as::<_, TokenUsage>(
            "SELECT id, token_id, user_id, started_at, ended_at, created_at
             FROM token_usages
             WHERE token_id = $1 AND ended_at IS NULL",
        )
        .bind(token_id)
        .fetch_optional(executor)
        .await
    }

    /// Full usage history for a token, newest first. The open usage, when
    /// one exists, is included.
    pub async fn list_usages(
        &self,
        executor: impl PgExecutor<'_>,
        token_id: Uuid,
    ) -> sqlx::Result<Vec<TokenUsage>> {
        sqlx::query_as::<_, TokenUsage>(
            "SELECT id, token_id, user_id, started_at, ended_at, created_at
             FROM token_usages
             WHERE token_id = $1
             ORDER BY started_at DESC, created_at DESC",
        )
        .bind(token_id)
        .fetch_all(executor)
        .await
    }

    // -- Seeding --

    /// Top the pool up to `target` rows. Inserts nothing once the pool is
    /// full; never deletes.
    pub async fn seed_pool(&self, target: i64) -> sqlx::Result<u64> {
        let inserted = sqlx::query(
            "INSERT INTO tokens (id, status)
             SELECT gen_random_uuid(), 'available'
             FROM generate_series(1, GREATEST($1 - (SELECT COUNT(*) FROM tokens), 0))",
        )
        .bind(target)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(inserted)
    }
}
