//! Durable delayed-release queue.
//!
//! Activation schedules a `release_jobs` row to fire two minutes later;
//! rows survive restarts, so scheduled reclamation does too. A partial
//! unique index keeps at most one live job per token and drops duplicate
//! schedules at insert time. The worker claims due jobs with SKIP LOCKED,
//! invokes the allocator's expiration entry point, and retries failures
//! with exponential backoff up to `max_attempts` before parking the job
//! as failed. Delivery is at-least-once; the allocator side is idempotent.

use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::service::{ExpireOutcome, TokenService};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

const CLAIM_BATCH: i64 = 10;
const RETRY_BASE_SECS: i64 = 10;
const MAX_BACKOFF_DOUBLINGS: u32 = 6;

#[derive(Clone)]
pub struct ReleaseQueue {
    pool: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct DueJob {
    id: Uuid,
    token_id: Uuid,
    attempts: i32,
    max_attempts: i32,
}

impl ReleaseQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Enqueue a release for `delay` from now. Returns false when the
    /// token already has a live job and the duplicate was dropped.
    pub async fn schedule(&self, token_id: Uuid, delay: Duration) -> sqlx::Result<bool> {
        let run_at = Utc::now() + chrono::Duration::seconds(delay.as_secs() as i64);

        let inserted = sqlx::query(
            "INSERT INTO release_jobs (token_id, run_at)
             VALUES ($1, $2)
             ON CONFLICT (token_id) WHERE status IN ('scheduled', 'running') DO NOTHING",
        )
        .bind(token_id)
        .bind(run_at)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        if inserted {
            tracing::debug!(token_id = %token_id, %run_at, "release job scheduled");
        } else {
            tracing::debug!(token_id = %token_id, "duplicate release job dropped");
        }
        Ok(inserted)
    }

    /// Return jobs stranded in `running` by a crash to `scheduled`.
    /// Call once at startup, before spawning the worker.
    pub async fn recover(&self) -> sqlx::Result<u64> {
        let recovered = sqlx::query(
            "UPDATE release_jobs SET status = 'scheduled', updated_at = NOW()
             WHERE status = 'running'",
        )
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(recovered)
    }

    /// Claim a batch of due jobs, marking them running. SKIP LOCKED keeps
    /// concurrent workers off each other's claims.
    async fn claim_due(&self) -> sqlx::Result<Vec<DueJob>> {
        sqlx::query_as::<_, DueJob>(
            "UPDATE release_jobs SET status = 'running', updated_at = NOW()
             WHERE id IN (
                 SELECT id FROM release_jobs
                 WHERE status = 'scheduled' AND run_at <= NOW()
                 ORDER BY run_at ASC
                 LIMIT $1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id, token_id, attempts, max_attempts",
        )
        .bind(CLAIM_BATCH)
        .fetch_all(&self.pool)
        .await
    }

    async fn complete(&self, job_id: Uuid) -> sqlx::Result<()> {
        sqlx::query(
            "UPDATE release_jobs SET status = 'completed', updated_at = NOW() WHERE id = $1",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn retry_or_fail(&self, job: &DueJob, error: &str) -> sqlx::Result<()> {
        let attempts = job.attempts + 1;

        if attempts >= job.max_attempts {
            sqlx::query(
                "UPDATE release_jobs
                 SET status = 'failed', attempts = $2, last_error = $3, updated_at = NOW()
                 WHERE id = $1",
            )
            .bind(job.id)
            .bind(attempts)
            .bind(error)
            .execute(&self.pool)
            .await?;
            tracing::error!(
                token_id = %job.token_id,
                attempts,
                "release job failed permanently: {}",
                error
            );
        } else {
            let run_at = Utc::now() + backoff_delay(attempts);
            sqlx::query(
                "UPDATE release_jobs
                 SET status = 'scheduled', attempts = $2, last_error = $3, run_at = $4,
                     updated_at = NOW()
                 WHERE id = $1",
            )
            .bind(job.id)
            .bind(attempts)
            .bind(error)
            .bind(run_at)
            .execute(&self.pool)
            .await?;
            tracing::warn!(
                token_id = %job.token_id,
                attempts,
                %run_at,
                "release job failed; retrying: {}",
                error
            );
        }
        Ok(())
    }
}

/// Retry delay after `attempts` failures, doubling from the base and
/// capped so a poisoned job never schedules itself into next week.
fn backoff_delay(attempts: i32) -> chrono::Duration {
    let doublings = (attempts.max(0) as u32).min(MAX_BACKOFF_DOUBLINGS);
    chrono::Duration::seconds(RETRY_BASE_SECS << doublings)
}

/// Spawn the release worker. Call this once at startup.
pub fn spawn_worker(
    queue: ReleaseQueue,
    service: TokenService,
    poll_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll_interval);
        loop {
            interval.tick().await;
            if let Err(e) = drain_due(&queue, &service).await {
                tracing::error!("release worker poll failed: {}", e);
            }
        }
    })
}

/// Work through everything currently due, batch by batch.
async fn drain_due(queue: &ReleaseQueue, service: &TokenService) -> sqlx::Result<()> {
    loop {
        let jobs = queue.claim_due().await?;
        if jobs.is_empty() {
            return Ok(());
        }
        let claimed = jobs.len() as i64;
        for job in jobs {
            run_job(queue, service, job).await?;
        }
        if claimed < CLAIM_BATCH {
            return Ok(());
        }
    }
}

async fn run_job(queue: &ReleaseQueue, service: &TokenService, job: DueJob) -> sqlx::Result<()> {
    match service.expire_if_due(job.token_id).await {
        Ok(outcome) => {
            match outcome {
                ExpireOutcome::Released(_) => {
                    tracing::debug!(token_id = %job.token_id, "release job completed");
                }
                ExpireOutcome::NotExpired => {
                    tracing::debug!(token_id = %job.token_id, "release job superseded; no-op");
                }
                ExpireOutcome::NotFound => {
                    tracing::warn!(token_id = %job.token_id, "release job for unknown token");
                }
            }
            queue.complete(job.id).await
        }
        Err(e) => queue.retry_or_fail(&job, &e.to_string()).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(0), chrono::Duration::seconds(10));
        assert_eq!(backoff_delay(1), chrono::Duration::seconds(20));
        assert_eq!(backoff_delay(2), chrono::Duration::seconds(40));
        assert_eq!(backoff_delay(3), chrono::Duration::seconds(80));
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff_delay(6), backoff_delay(7));
        assert_eq!(backoff_delay(6), backoff_delay(1000));
    }
}
