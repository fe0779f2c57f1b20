//! Periodic cache reconciliation.
//!
//! Cache updates ride on post-commit side effects and bus events, either
//! of which can be missed. Every five minutes the snapshot is rebuilt
//! from the store to erase accumulated drift.

use std::time::Duration;

use tokio::time;

use crate::state::TokenStateManager;

pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(300);

/// Spawn the reconciliation task. Call this once at startup.
pub fn spawn(cache: TokenStateManager) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(RECONCILE_INTERVAL);
        // the first tick fires immediately; startup already requests a load
        interval.tick().await;
        loop {
            interval.tick().await;
            tracing::debug!("reconciling token state cache");
            cache.reload();
        }
    })
}
