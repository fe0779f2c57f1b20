use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("user already has an active token")]
    AlreadyHasActiveToken,

    #[error("no tokens available")]
    NoTokensAvailable,

    #[error("token not found")]
    TokenNotFound,

    #[error("invalid token state")]
    InvalidTokenState,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Name of the partial unique index enforcing one active token per user.
/// A violation here means a concurrent activation won the race; it is the
/// second line of defense behind the in-transaction holder check.
const ACTIVE_USER_CONSTRAINT: &str = "tokens_active_user_idx";

impl AppError {
    /// Translate a failed activation write into a domain error.
    pub fn from_activation_write(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.constraint() == Some(ACTIVE_USER_CONSTRAINT) {
                return AppError::AlreadyHasActiveToken;
            }
        }
        AppError::Database(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self {
            AppError::AlreadyHasActiveToken => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "user already has an active token",
            ),
            AppError::NoTokensAvailable => {
                (StatusCode::UNPROCESSABLE_ENTITY, "no tokens available")
            }
            AppError::InvalidTokenState => {
                (StatusCode::UNPROCESSABLE_ENTITY, "invalid token state")
            }
            AppError::TokenNotFound => (StatusCode::NOT_FOUND, "token not found"),
            AppError::Database(e) => {
                tracing::error!("database error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            }
        };

        let body = Json(json!({ "errors": { "detail": detail } }));
        (status, body).into_response()
    }
}
