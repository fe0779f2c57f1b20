//! Transactional token lifecycle operations.
//!
//! Every state change to a token happens inside one database transaction
//! here; the queue schedule, cache update and event publish run only after
//! commit, so a rolled-back operation leaves no external trace. Post-commit
//! side effects are best-effort: failures are logged and the periodic
//! reconciler bounds any divergence.

use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::errors::AppError;
use crate::events::{EventBus, TokenEvent};
use crate::jobs::release_queue::ReleaseQueue;
use crate::models::token::{LEASE_SECONDS, POOL_SIZE};
use crate::models::{Token, TokenStatus, TokenUsage};
use crate::state::TokenStateManager;
use crate::store::TokenRepository;

/// Result of a successful activation: the token and its open usage.
#[derive(Debug)]
pub struct Activation {
    pub token: Token,
    pub usage: TokenUsage,
}

/// Result of an expiration attempt. `NotExpired` and `NotFound` are
/// success-no-ops so the release queue can mark the job complete.
#[derive(Debug)]
pub enum ExpireOutcome {
    Released(Token),
    NotExpired,
    NotFound,
}

#[derive(Clone)]
pub struct TokenService {
    repo: TokenRepository,
    queue: ReleaseQueue,
    cache: TokenStateManager,
    bus: EventBus,
}

impl TokenService {
    pub fn new(
        repo: TokenRepository,
        queue: ReleaseQueue,
        cache: TokenStateManager,
        bus: EventBus,
    ) -> Self {
        Self {
            repo,
            queue,
            cache,
            bus,
        }
    }

    /// Hand a token to `user_id`, preempting the oldest active holder when
    /// the pool is saturated. One transaction; fails if the user already
    /// holds a token.
    pub async fn activate(&self, user_id: Uuid) -> Result<Activation, AppError> {
        let now = Utc::now();
        let mut tx = self.repo.pool().begin().await?;

        if self
            .repo
            .get_user_active_token(&mut *tx, user_id)
            .await?
            .is_some()
        {
            return Err(AppError::AlreadyHasActiveToken);
        }

        let slot = self.select_slot(&mut tx, now).await?;

        // The partial unique index backs up the holder check above against
        // a concurrent activation for the same user.
        let token = self
            .repo
            .mark_active(&mut *tx, slot.id, user_id, now)
            .await
            .map_err(AppError::from_activation_write)?;
        let usage = self
            .repo
            .insert_usage(&mut *tx, token.id, user_id, now)
            .await?;

        tx.commit().await?;

        if let Err(e) = self
            .queue
            .schedule(token.id, std::time::Duration::from_secs(LEASE_SECONDS as u64))
            .await
        {
            tracing::error!(token_id = %token.id, "failed to schedule delayed release: {}", e);
        }
        self.cache.mark_active(&token);
        self.bus.publish(TokenEvent::Activated {
            token_id: token.id,
            user_id,
            activated_at: now,
        });

        tracing::info!(token_id = %token.id, user_id = %user_id, "token activated");
        Ok(Activation { token, usage })
    }

    /// Pick the row the activation will take: an available token when one
    /// exists, otherwise the oldest active token, released in-line.
    async fn select_slot(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        now: DateTime<Utc>,
    ) -> Result<Token, AppError> {
        if let Some(token) = self.repo.pick_available_for_update(&mut **tx).await? {
            return Ok(token);
        }

        // Advisory only: the count decides between a quick retry and
        // preemption, never substitutes for the row locks.
        let active = self.repo.count_active(&mut **tx).await?;
        if active < POOL_SIZE {
            // A concurrent release may have freed a row since the pick.
            if let Some(token) = self.repo.pick_available_for_update(&mut **tx).await? {
                return Ok(token);
            }
            return Err(AppError::NoTokensAvailable);
        }

        let oldest = self
            .repo
            .pick_oldest_active_for_update(&mut **tx)
            .await?
            .ok_or(AppError::NoTokensAvailable)?;

        tracing::info!(
            token_id = %oldest.id,
            holder = ?oldest.current_user_id,
            "pool saturated; preempting oldest active token"
        );

        if let Some(usage) = self.repo.get_open_usage(&mut **tx, oldest.id).await? {
            self.repo.close_usage(&mut **tx, usage.id, now).await?;
        }
        let released = self.repo.mark_available(&mut **tx, oldest.id).await?;
        Ok(released)
    }

    /// Release a token, closing its open usage. Releasing an
    /// already-available token succeeds without touching history.
    pub async fn release(&self, token_id: Uuid) -> Result<Token, AppError> {
        let mut tx = self.repo.pool().begin().await?;
        let token = self
            .repo
            .get_token_for_update(&mut *tx, token_id)
            .await?
            .ok_or(AppError::TokenNotFound)?;

        if token.status == TokenStatus::Available {
            return Ok(token);
        }

        let now = Utc::now();
        if let Some(usage) = self.repo.get_open_usage(&mut *tx, token_id).await? {
            self.repo.close_usage(&mut *tx, usage.id, now).await?;
        }
        let released = self.repo.mark_available(&mut *tx, token_id).await?;
        tx.commit().await?;

        self.cache.mark_available(token_id);
        self.bus.publish(TokenEvent::Released { token_id });

        tracing::info!(token_id = %token_id, "token released");
        Ok(released)
    }

    /// Force-release every active token at one timestamp. The operator
    /// escape hatch; always succeeds, returning how many tokens it reset.
    pub async fn clear_active(&self) -> Result<u64, AppError> {
        let mut tx = self.repo.pool().begin().await?;
        let (token_ids, usages_closed) = self.repo.clear_all_active(&mut *tx).await?;
        tx.commit().await?;

        let cleared = token_ids.len() as u64;
        self.cache.bulk_mark_available(token_ids.clone());
        for token_id in &token_ids {
            self.bus.publish(TokenEvent::Released {
                token_id: *token_id,
            });
        }

        if cleared > 0 {
            tracing::info!(tokens = cleared, usages = usages_closed, "cleared active tokens");
        }
        Ok(cleared)
    }

    /// Release a token whose lease has run out. Called by the release
    /// queue; duplicate and stale invocations are no-ops, so at most one
    /// release happens per activation epoch.
    pub async fn expire_if_due(&self, token_id: Uuid) -> Result<ExpireOutcome, AppError> {
        let now = Utc::now();
        let mut tx = self.repo.pool().begin().await?;

        let token = match self.repo.get_token_for_update(&mut *tx, token_id).await? {
            Some(token) => token,
            None => return Ok(ExpireOutcome::NotFound),
        };
        if token.status != TokenStatus::Active {
            return Ok(ExpireOutcome::NotExpired);
        }

        let usage = match self.repo.get_open_usage(&mut *tx, token_id).await? {
            Some(usage) => usage,
            None => return Ok(ExpireOutcome::NotExpired),
        };
        let activated_at = token.activated_at.ok_or(AppError::InvalidTokenState)?;

        // A stale job can fire against a newer activation epoch; that
        // epoch has its own scheduled job.
        if now < activated_at + chrono::Duration::seconds(LEASE_SECONDS) {
            return Ok(ExpireOutcome::NotExpired);
        }

        self.repo.close_usage(&mut *tx, usage.id, now).await?;
        let released = self.repo.mark_available(&mut *tx, token_id).await?;
        tx.commit().await?;

        self.cache.mark_available(token_id);
        self.bus.publish(TokenEvent::Released { token_id });

        tracing::info!(token_id = %token_id, "token lease expired; released");
        Ok(ExpireOutcome::Released(released))
    }
}
