use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{Token, TokenStatus, TokenUsage};
use crate::AppState;

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub data: T,
}

#[derive(Debug, Deserialize)]
pub struct ActivateRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ActivateData {
    pub token_id: Uuid,
    pub user_id: Uuid,
    #[serde(with = "crate::models::timestamps")]
    pub activated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct TokenEntry {
    pub id: Uuid,
    pub status: TokenStatus,
    pub current_user_id: Option<Uuid>,
    #[serde(with = "crate::models::timestamps::option")]
    pub activated_at: Option<DateTime<Utc>>,
}

impl From<&Token> for TokenEntry {
    fn from(token: &Token) -> Self {
        Self {
            id: token.id,
            status: token.status,
            current_user_id: token.current_user_id,
            activated_at: token.activated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ActiveUsage {
    pub user_id: Uuid,
    #[serde(with = "crate::models::timestamps")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "crate::models::timestamps::option")]
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct TokenDetail {
    #[serde(flatten)]
    pub token: TokenEntry,
    pub active_usage: Option<ActiveUsage>,
}

#[derive(Debug, Serialize)]
pub struct UsageEntry {
    pub user_id: Uuid,
    #[serde(with = "crate::models::timestamps")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "crate::models::timestamps::option")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl From<&TokenUsage> for UsageEntry {
    fn from(usage: &TokenUsage) -> Self {
        Self {
            user_id: usage.user_id,
            started_at: usage.started_at,
            ended_at: usage.ended_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryData {
    pub token_id: Uuid,
    pub usages: Vec<UsageEntry>,
}

#[derive(Debug, Serialize)]
pub struct ClearData {
    pub cleared_tokens: u64,
}

fn active_usage_of(token: &Token) -> Option<ActiveUsage> {
    match (token.status, token.current_user_id, token.activated_at) {
        (TokenStatus::Active, Some(user_id), Some(started_at)) => Some(ActiveUsage {
            user_id,
            started_at,
            ended_at: None,
        }),
        _ => None,
    }
}

// ── Handlers ─────────────────────────────────────────────────

/// POST /api/tokens/activate — hand a token to a user
pub async fn activate(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ActivateRequest>,
) -> Result<Json<Envelope<ActivateData>>, AppError> {
    let activation = state.service.activate(payload.user_id).await?;

    Ok(Json(Envelope {
        data: ActivateData {
            token_id: activation.token.id,
            user_id: activation.usage.user_id,
            activated_at: activation.usage.started_at,
        },
    }))
}

/// GET /api/tokens — all 100 tokens, served from the cache; falls back to
/// the store while the cache is still loading
pub async fn list_tokens(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Envelope<Vec<TokenEntry>>>, AppError> {
    let tokens = if state.cache.is_empty() {
        state.repo.list_tokens(state.repo.pool()).await?
    } else {
        state.cache.list_all()
    };

    Ok(Json(Envelope {
        data: tokens.iter().map(TokenEntry::from).collect(),
    }))
}

/// GET /api/tokens/:id — one token with its open usage, if any
pub async fn show_token(
    State(state): State<Arc<AppState>>,
    Path(token_id): Path<Uuid>,
) -> Result<Json<Envelope<TokenDetail>>, AppError> {
    let token = match state.cache.get(token_id) {
        Some(token) => token,
        None => state
            .repo
            .get_token(state.repo.pool(), token_id)
            .await?
            .ok_or(AppError::TokenNotFound)?,
    };

    Ok(Json(Envelope {
        data: TokenDetail {
            active_usage: active_usage_of(&token),
            token: TokenEntry::from(&token),
        },
    }))
}

/// GET /api/tokens/:id/history — full usage history, newest first.
/// Always reads through the store; history needs guaranteed freshness.
pub async fn token_history(
    State(state): State<Arc<AppState>>,
    Path(token_id): Path<Uuid>,
) -> Result<Json<Envelope<HistoryData>>, AppError> {
    let token = state
        .repo
        .get_token(state.repo.pool(), token_id)
        .await?
        .ok_or(AppError::TokenNotFound)?;
    let usages = state.repo.list_usages(state.repo.pool(), token.id).await?;

    Ok(Json(Envelope {
        data: HistoryData {
            token_id: token.id,
            usages: usages.iter().map(UsageEntry::from).collect(),
        },
    }))
}

/// POST /api/tokens/clear — force-release every active token
pub async fn clear_tokens(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Envelope<ClearData>>, AppError> {
    let cleared = state.service.clear_active().await?;

    Ok(Json(Envelope {
        data: ClearData {
            cleared_tokens: cleared,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn active_token(at: DateTime<Utc>) -> Token {
        Token {
            id: Uuid::new_v4(),
            status: TokenStatus::Active,
            current_user_id: Some(Uuid::new_v4()),
            activated_at: Some(at),
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn token_detail_embeds_open_usage_for_active_tokens() {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let token = active_token(at);
        let detail = TokenDetail {
            active_usage: active_usage_of(&token),
            token: TokenEntry::from(&token),
        };

        let json = serde_json::to_value(&detail).unwrap();
        assert_eq!(json["id"], token.id.to_string());
        assert_eq!(json["status"], "active");
        assert_eq!(json["activated_at"], "2025-06-01T12:00:00Z");
        assert_eq!(
            json["active_usage"]["user_id"],
            token.current_user_id.unwrap().to_string()
        );
        assert_eq!(json["active_usage"]["started_at"], "2025-06-01T12:00:00Z");
        assert!(json["active_usage"]["ended_at"].is_null());
    }

    #[test]
    fn token_detail_has_null_usage_for_available_tokens() {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let token = Token {
            status: TokenStatus::Available,
            current_user_id: None,
            activated_at: None,
            ..active_token(at)
        };
        let detail = TokenDetail {
            active_usage: active_usage_of(&token),
            token: TokenEntry::from(&token),
        };

        let json = serde_json::to_value(&detail).unwrap();
        assert_eq!(json["status"], "available");
        assert!(json["current_user_id"].is_null());
        assert!(json["activated_at"].is_null());
        assert!(json["active_usage"].is_null());
    }

    #[test]
    fn envelope_wraps_data() {
        let json = serde_json::to_value(Envelope {
            data: ClearData { cleared_tokens: 3 },
        })
        .unwrap();
        assert_eq!(json["data"]["cleared_tokens"], 3);
    }
}
