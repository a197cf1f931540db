//! API error type and HTTP mapping
//!
//! Authentication and authorization failures reach the caller with a stable
//! reason code. Everything else is logged and rendered as a generic
//! `internal_error`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use walletguard_shared::StoreError;

use crate::auth::{AuthError, SessionError, TokenError};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("Channel token is invalid, expired, or already used")]
    ChannelUnauthorized,
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Session store error: {0}")]
    Session(#[from] SessionError),
    #[error("User store error: {0}")]
    Store(#[from] StoreError),
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

const INTERNAL_MESSAGE: &str = "Internal server error";

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::Auth(err) => {
                let status = match err {
                    AuthError::UsernameTaken => StatusCode::CONFLICT,
                    AuthError::InvalidCredentials
                    | AuthError::NotAuthenticated
                    | AuthError::UserVanished => StatusCode::UNAUTHORIZED,
                    AuthError::Validation(_) => StatusCode::BAD_REQUEST,
                    AuthError::Store(_) | AuthError::Session(_) | AuthError::Internal(_) => {
                        return internal()
                    }
                };
                (status, err.reason_code(), err.to_string())
            }
            ApiError::Token(err) => match err {
                TokenError::MissingToken | TokenError::UnknownOrExpiredToken => {
                    (StatusCode::FORBIDDEN, err.reason_code(), err.to_string())
                }
                TokenError::Store(_) => internal(),
            },
            ApiError::ChannelUnauthorized => (
                StatusCode::UNAUTHORIZED,
                "channel_unauthorized",
                self.to_string(),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            ApiError::Session(_) | ApiError::Store(_) | ApiError::Internal(_) => internal(),
        }
    }
}

fn internal() -> (StatusCode, &'static str, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        INTERNAL_MESSAGE.to_string(),
    )
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed with internal error");
        }

        let body = Json(json!({
            "error": code,
            "message": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_errors_keep_reason_codes() {
        let (status, code, _) = ApiError::from(AuthError::UsernameTaken).parts();
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(code, "username_taken");

        let (status, code, message) = ApiError::from(AuthError::InvalidCredentials).parts();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(code, "invalid_credentials");
        assert_eq!(message, "Invalid username or password");
    }

    #[test]
    fn test_token_errors_are_forbidden() {
        let (status, code, _) = ApiError::from(TokenError::MissingToken).parts();
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(code, "missing_token");

        let (status, code, _) = ApiError::from(TokenError::UnknownOrExpiredToken).parts();
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(code, "unknown_or_expired_token");
    }

    #[test]
    fn test_internal_errors_do_not_leak_details() {
        let err = ApiError::from(AuthError::Store(StoreError::Corrupt(
            "password_hash column truncated".to_string(),
        )));
        let (status, code, message) = err.parts();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(code, "internal_error");
        assert!(!message.contains("password_hash"));

        let (_, code, message) =
            ApiError::Internal(anyhow::anyhow!("db at 10.0.0.5 refused")).parts();
        assert_eq!(code, "internal_error");
        assert_eq!(message, INTERNAL_MESSAGE);
    }
}
