//! In-memory mirror of token states for the hot read path.
//!
//! The snapshot lives in a `DashMap` shared between readers and one writer
//! task. Readers (`get`, `list_*`, `stats`) never wait on the writer and may
//! transiently lag the store; the store stays authoritative. All mutations
//! funnel through a command channel consumed by the single `CacheWriter`,
//! which also folds event-bus messages into the same stream, so snapshot
//! updates apply in one place and one order.
//!
//! Drift from missed events is bounded by `reload`, requested at startup,
//! by the periodic reconciler, and whenever the bus reports lag.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::events::{EventBus, TokenEvent};
use crate::models::{Token, TokenStatus};
use crate::store::TokenRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub available: usize,
}

#[derive(Debug, Clone)]
enum CacheCommand {
    /// Full post-activation snapshot from the allocator.
    Insert(Token),
    /// Partial update from a bus event; ignored for tokens not yet cached.
    SetActive {
        token_id: Uuid,
        user_id: Uuid,
        activated_at: DateTime<Utc>,
    },
    SetAvailable {
        token_id: Uuid,
    },
    BulkSetAvailable(Vec<Uuid>),
    Reload,
}

impl From<TokenEvent> for CacheCommand {
    fn from(event: TokenEvent) -> Self {
        match event {
            TokenEvent::Activated {
                token_id,
                user_id,
                activated_at,
            } => CacheCommand::SetActive {
                token_id,
                user_id,
                activated_at,
            },
            TokenEvent::Released { token_id } => CacheCommand::SetAvailable { token_id },
        }
    }
}

/// Shared, cheaply-cloneable handle over the token snapshot.
#[derive(Clone)]
pub struct TokenStateManager {
    entries: Arc<DashMap<Uuid, Token>>,
    commands: mpsc::UnboundedSender<CacheCommand>,
    bus: EventBus,
}

impl TokenStateManager {
    /// Build the manager and its writer. The writer must be spawned for
    /// mutations to take effect; until then the cache serves an empty map.
    pub fn new(bus: EventBus, repo: TokenRepository) -> (Self, CacheWriter) {
        let entries = Arc::new(DashMap::new());
        let (commands, rx) = mpsc::unbounded_channel();

        let writer = CacheWriter {
            entries: entries.clone(),
            commands: rx,
            bus_rx: bus.subscribe_all(),
            repo,
        };

        (
            Self {
                entries,
                commands,
                bus,
            },
            writer,
        )
    }

    // -- Reads --

    pub fn get(&self, token_id: Uuid) -> Option<Token> {
        self.entries.get(&token_id).map(|entry| entry.value().clone())
    }

    pub fn list_all(&self) -> Vec<Token> {
        let mut tokens: Vec<Token> = self.entries.iter().map(|e| e.value().clone()).collect();
        tokens.sort_by(cmp_tokens);
        tokens
    }

    pub fn list_active(&self) -> Vec<Token> {
        let mut tokens: Vec<Token> = self
            .entries
            .iter()
            .filter(|e| e.status == TokenStatus::Active)
            .map(|e| e.value().clone())
            .collect();
        tokens.sort_by(cmp_tokens);
        tokens
    }

    pub fn list_available(&self) -> Vec<Token> {
        let mut tokens: Vec<Token> = self
            .entries
            .iter()
            .filter(|e| e.status == TokenStatus::Available)
            .map(|e| e.value().clone())
            .collect();
        tokens.sort_by(cmp_tokens);
        tokens
    }

    pub fn stats(&self) -> PoolStats {
        let mut active = 0;
        let mut available = 0;
        for entry in self.entries.iter() {
            match entry.status {
                TokenStatus::Active => active += 1,
                TokenStatus::Available => available += 1,
            }
        }
        PoolStats {
            total: active + available,
            active,
            available,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // -- Mutations (enqueued for the writer) --

    pub fn mark_active(&self, token: &Token) {
        self.send(CacheCommand::Insert(token.clone()));
    }

    pub fn mark_available(&self, token_id: Uuid) {
        self.send(CacheCommand::SetAvailable { token_id });
    }

    pub fn bulk_mark_available(&self, token_ids: Vec<Uuid>) {
        self.send(CacheCommand::BulkSetAvailable(token_ids));
    }

    /// Request a rebuild from the store.
    pub fn reload(&self) {
        self.send(CacheCommand::Reload);
    }

    fn send(&self, command: CacheCommand) {
        if self.commands.send(command).is_err() {
            tracing::warn!("state cache writer is gone; dropping cache update");
        }
    }

    // -- Subscription passthroughs --

    pub fn subscribe(&self, token_id: Uuid) -> broadcast::Receiver<TokenEvent> {
        self.bus.subscribe(token_id)
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<TokenEvent> {
        self.bus.subscribe_all()
    }
}

/// The single writer behind `TokenStateManager`. Owns all snapshot
/// mutations; consumes explicit commands and bus events in one loop.
pub struct CacheWriter {
    entries: Arc<DashMap<Uuid, Token>>,
    commands: mpsc::UnboundedReceiver<CacheCommand>,
    bus_rx: broadcast::Receiver<TokenEvent>,
    repo: TokenRepository,
}

impl CacheWriter {
    pub async fn run(mut self) {
        let mut bus_open = true;
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command).await,
                    None => break,
                },
                event = self.bus_rx.recv(), if bus_open => match event {
                    Ok(event) => self.apply(event.into()).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "state cache lagged behind event bus; reloading");
                        self.apply(CacheCommand::Reload).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        bus_open = false;
                    }
                },
            }
        }
        tracing::debug!("state cache writer stopped");
    }

    async fn apply(&self, command: CacheCommand) {
        match command {
            CacheCommand::Reload => {
                match self.repo.list_tokens(self.repo.pool()).await {
                    Ok(tokens) => {
                        let count = tokens.len();
                        replace_entries(&self.entries, tokens);
                        tracing::debug!(count, "state cache reloaded");
                    }
                    Err(e) => {
                        tracing::error!("state cache reload failed: {}", e);
                    }
                }
            }
            other => apply_update(&self.entries, other),
        }
    }
}

fn apply_update(entries: &DashMap<Uuid, Token>, command: CacheCommand) {
    match command {
        CacheCommand::Insert(token) => {
            entries.insert(token.id, token);
        }
        CacheCommand::SetActive {
            token_id,
            user_id,
            activated_at,
        } => {
            if let Some(mut entry) = entries.get_mut(&token_id) {
                entry.status = TokenStatus::Active;
                entry.current_user_id = Some(user_id);
                entry.activated_at = Some(activated_at);
                entry.updated_at = activated_at;
            }
        }
        CacheCommand::SetAvailable { token_id } => set_available(entries, token_id),
        CacheCommand::BulkSetAvailable(token_ids) => {
            for token_id in token_ids {
                set_available(entries, token_id);
            }
        }
        CacheCommand::Reload => unreachable!("reload is handled by the writer"),
    }
}

fn set_available(entries: &DashMap<Uuid, Token>, token_id: Uuid) {
    if let Some(mut entry) = entries.get_mut(&token_id) {
        entry.status = TokenStatus::Available;
        entry.current_user_id = None;
        entry.activated_at = None;
        entry.updated_at = Utc::now();
    }
}

/// Swap the snapshot to `fresh` without a clear-then-fill window: upsert
/// everything, then drop ids the store no longer reports.
fn replace_entries(entries: &DashMap<Uuid, Token>, fresh: Vec<Token>) {
    let keep: HashSet<Uuid> = fresh.iter().map(|t| t.id).collect();
    for token in fresh {
        entries.insert(token.id, token);
    }
    entries.retain(|id, _| keep.contains(id));
}

/// List order: most recently activated first, never-activated last,
/// id as the stable tie-break.
fn cmp_tokens(a: &Token, b: &Token) -> Ordering {
    match (a.activated_at, b.activated_at) {
        (Some(x), Some(y)) => y.cmp(&x).then_with(|| a.id.cmp(&b.id)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.id.cmp(&b.id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn token(status: TokenStatus, activated_at: Option<DateTime<Utc>>) -> Token {
        let created = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        Token {
            id: Uuid::new_v4(),
            status,
            current_user_id: match status {
                TokenStatus::Active => Some(Uuid::new_v4()),
                TokenStatus::Available => None,
            },
            activated_at,
            created_at: created,
            updated_at: created,
        }
    }

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, secs).unwrap()
    }

    #[test]
    fn insert_then_set_available_clears_holder() {
        let entries = DashMap::new();
        let active = token(TokenStatus::Active, Some(at(10)));
        let id = active.id;

        apply_update(&entries, CacheCommand::Insert(active));
        assert_eq!(entries.get(&id).unwrap().status, TokenStatus::Active);

        apply_update(&entries, CacheCommand::SetAvailable { token_id: id });
        let entry = entries.get(&id).unwrap();
        assert_eq!(entry.status, TokenStatus::Available);
        assert_eq!(entry.current_user_id, None);
        assert_eq!(entry.activated_at, None);
    }

    #[test]
    fn set_active_ignores_unknown_tokens() {
        let entries: DashMap<Uuid, Token> = DashMap::new();
        apply_update(
            &entries,
            CacheCommand::SetActive {
                token_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                activated_at: at(0),
            },
        );
        assert!(entries.is_empty());
    }

    #[test]
    fn bulk_set_available_touches_every_id() {
        let entries = DashMap::new();
        let a = token(TokenStatus::Active, Some(at(1)));
        let b = token(TokenStatus::Active, Some(at(2)));
        let ids = vec![a.id, b.id];
        apply_update(&entries, CacheCommand::Insert(a));
        apply_update(&entries, CacheCommand::Insert(b));

        apply_update(&entries, CacheCommand::BulkSetAvailable(ids.clone()));
        for id in ids {
            assert_eq!(entries.get(&id).unwrap().status, TokenStatus::Available);
        }
    }

    #[test]
    fn replace_entries_drops_stale_ids() {
        let entries = DashMap::new();
        let stale = token(TokenStatus::Available, None);
        entries.insert(stale.id, stale);

        let fresh = vec![
            token(TokenStatus::Active, Some(at(5))),
            token(TokenStatus::Available, None),
        ];
        let fresh_ids: HashSet<Uuid> = fresh.iter().map(|t| t.id).collect();

        replace_entries(&entries, fresh);
        assert_eq!(entries.len(), 2);
        for entry in entries.iter() {
            assert!(fresh_ids.contains(&entry.id));
        }
    }

    #[test]
    fn list_order_is_newest_activation_first_nulls_last() {
        let older = token(TokenStatus::Active, Some(at(10)));
        let newer = token(TokenStatus::Active, Some(at(20)));
        let idle = token(TokenStatus::Available, None);

        let mut tokens = vec![idle.clone(), older.clone(), newer.clone()];
        tokens.sort_by(cmp_tokens);

        assert_eq!(tokens[0].id, newer.id);
        assert_eq!(tokens[1].id, older.id);
        assert_eq!(tokens[2].id, idle.id);
    }

    async fn wait_until(deadline_checks: u32, mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..deadline_checks {
            if check() {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn writer_applies_manager_commands_and_bus_events() {
        let bus = EventBus::new();
        let repo = TokenRepository::new(
            sqlx::PgPool::connect_lazy("postgres://localhost/tokenpool").unwrap(),
        );
        let (cache, writer) = TokenStateManager::new(bus.clone(), repo);
        tokio::spawn(writer.run());

        let mut events = cache.subscribe_all();

        let active = token(TokenStatus::Active, Some(at(30)));
        let id = active.id;
        cache.mark_active(&active);

        assert!(wait_until(100, || cache.get(id).is_some()).await);
        let snapshot = cache.get(id).expect("writer should apply the insert");
        assert!(snapshot.is_active());
        assert_eq!(cache.list_active().len(), 1);
        assert!(cache.list_available().is_empty());
        assert_eq!(
            cache.stats(),
            PoolStats {
                total: 1,
                active: 1,
                available: 0
            }
        );

        // a release published on the bus folds into the snapshot too
        bus.publish(TokenEvent::Released { token_id: id });
        assert_eq!(
            events.recv().await.unwrap(),
            TokenEvent::Released { token_id: id }
        );
        assert!(
            wait_until(100, || {
                cache
                    .get(id)
                    .map(|t| t.status == TokenStatus::Available)
                    .unwrap_or(false)
            })
            .await
        );
        assert_eq!(cache.list_available().len(), 1);
    }
}
