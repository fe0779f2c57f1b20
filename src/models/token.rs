use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Seconds a token may be held before the delayed-release queue reclaims it.
pub const LEASE_SECONDS: i64 = 120;

/// Number of tokens in the pool. Seeding tops the table up to exactly this
/// many rows; the allocator preempts instead of growing past it.
pub const POOL_SIZE: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TokenStatus {
    Available,
    Active,
}

/// One of the pool's 100 allocation slots, as stored in `tokens`.
///
/// `status = active` always goes together with a holder and an activation
/// time; `available` never has either. The partial unique index on
/// `current_user_id` keeps a user from holding two tokens at once.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Token {
    pub id: Uuid,
    pub status: TokenStatus,
    pub current_user_id: Option<Uuid>,
    #[serde(with = "super::timestamps::option")]
    pub activated_at: Option<DateTime<Utc>>,
    #[serde(with = "super::timestamps")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "super::timestamps")]
    pub updated_at: DateTime<Utc>,
}

impl Token {
    pub fn is_active(&self) -> bool {
        self.status == TokenStatus::Active
    }

    /// When the current activation epoch expires, if the token is active.
    pub fn lease_expires_at(&self) -> Option<DateTime<Utc>> {
        self.activated_at
            .map(|at| at + chrono::Duration::seconds(LEASE_SECONDS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn available_token() -> Token {
        let created = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        Token {
            id: Uuid::new_v4(),
            status: TokenStatus::Available,
            current_user_id: None,
            activated_at: None,
            created_at: created,
            updated_at: created,
        }
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(TokenStatus::Available).unwrap(),
            "available"
        );
        assert_eq!(serde_json::to_value(TokenStatus::Active).unwrap(), "active");
    }

    #[test]
    fn lease_expiry_is_two_minutes_after_activation() {
        let mut token = available_token();
        assert_eq!(token.lease_expires_at(), None);

        let at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        token.status = TokenStatus::Active;
        token.current_user_id = Some(Uuid::new_v4());
        token.activated_at = Some(at);

        assert_eq!(
            token.lease_expires_at(),
            Some(at + chrono::Duration::seconds(120))
        );
    }
}
