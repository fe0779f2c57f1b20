//! Process-local pub/sub for token state changes.
//!
//! Writers (the allocator, the release worker) publish after their
//! transaction commits; the state cache folds events into its snapshot.
//! Delivery is best-effort and at-most-once: a publish with no receivers
//! is not an error, and lagged receivers drop events. Anything that needs
//! authoritative state re-reads the store.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Buffer size for the global and per-token broadcast channels. Bounded so
/// a stuck subscriber cannot grow memory without limit.
pub const EVENT_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenEvent {
    Activated {
        token_id: Uuid,
        user_id: Uuid,
        activated_at: DateTime<Utc>,
    },
    Released {
        token_id: Uuid,
    },
}

impl TokenEvent {
    pub fn token_id(&self) -> Uuid {
        match self {
            TokenEvent::Activated { token_id, .. } => *token_id,
            TokenEvent::Released { token_id } => *token_id,
        }
    }
}

/// Broadcast bus with a global topic and lazily-created per-token topics.
#[derive(Clone)]
pub struct EventBus {
    global: broadcast::Sender<TokenEvent>,
    per_token: Arc<DashMap<Uuid, broadcast::Sender<TokenEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (global, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self {
            global,
            per_token: Arc::new(DashMap::new()),
        }
    }

    /// Subscribe to every token's state changes.
    pub fn subscribe_all(&self) -> broadcast::Receiver<TokenEvent> {
        self.global.subscribe()
    }

    /// Subscribe to a single token's state changes.
    pub fn subscribe(&self, token_id: Uuid) -> broadcast::Receiver<TokenEvent> {
        self.per_token
            .entry(token_id)
            .or_insert_with(|| broadcast::channel(EVENT_BUFFER_SIZE).0)
            .subscribe()
    }

    /// Publish to the token's topic (if anyone ever subscribed) and to the
    /// global topic. Never blocks; zero receivers is fine.
    pub fn publish(&self, event: TokenEvent) {
        if let Some(sender) = self.per_token.get(&event.token_id()) {
            let _ = sender.send(event.clone());
        }

        match self.global.send(event) {
            Ok(receivers) => {
                tracing::debug!(receivers, "token event sent");
            }
            Err(_) => {
                tracing::debug!("token event dropped (no receivers)");
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
