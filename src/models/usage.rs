use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// One activation epoch of a token, as stored in `token_usages`.
///
/// Opened when a token is handed to a user and closed (`ended_at` set)
/// on release, preemption, expiration or bulk clear. Closed usages are
/// never rewritten; history is append-only.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TokenUsage {
    pub id: Uuid,
    pub token_id: Uuid,
    pub user_id: Uuid,
    #[serde(with = "super::timestamps")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "super::timestamps::option")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(with = "super::timestamps")]
    pub created_at: DateTime<Utc>,
}

impl TokenUsage {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}
