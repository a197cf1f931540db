//! One-time security tokens
//!
//! Every successful read response hands the client a fresh token; every
//! mutating request must spend exactly one. A token moves from issued to
//! consumed or expired and never back, so a replayed write always fails.

use serde_json::Value;
use time::{Duration, OffsetDateTime};

use super::sessions::{generate_secret, log_prefix, Session, SessionError, SessionStore};

/// Request header carrying the token on writes
pub const SECURITY_TOKEN_HEADER: &str = "x-security-token";

/// Reserved response field carrying a freshly issued token
pub const SECURITY_TOKEN_FIELD: &str = "securityToken";

/// Default token lifetime
pub const DEFAULT_TOKEN_TTL: Duration = Duration::hours(1);

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Security token required")]
    MissingToken,
    /// Consumed and expired tokens are deliberately indistinguishable
    #[error("Security token is invalid, expired, or already used")]
    UnknownOrExpiredToken,
    #[error("Session store error: {0}")]
    Store(#[from] SessionError),
}

impl TokenError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            TokenError::MissingToken => "missing_token",
            TokenError::UnknownOrExpiredToken => "unknown_or_expired_token",
            TokenError::Store(_) => "internal_error",
        }
    }
}

/// Insert `token` into a JSON object body under the reserved field.
///
/// Non-object bodies are returned unchanged.
pub fn decorate_body(mut body: Value, token: &str) -> Value {
    if let Value::Object(map) = &mut body {
        map.insert(
            SECURITY_TOKEN_FIELD.to_string(),
            Value::String(token.to_string()),
        );
    }
    body
}

/// Issues tokens on reads and consumes them on writes
#[derive(Clone)]
pub struct OneTimeTokenGuard {
    sessions: SessionStore,
    ttl: Duration,
}

impl OneTimeTokenGuard {
    pub fn new(sessions: SessionStore, ttl: Duration) -> Self {
        Self { sessions, ttl }
    }

    /// Mint a token and record it in the session's pool.
    ///
    /// Returns `None` if the session disappeared in the meantime.
    pub async fn issue(&self, session: &Session) -> Result<Option<String>, TokenError> {
        let now = OffsetDateTime::now_utc();
        let token = generate_secret();
        let recorded = self
            .sessions
            .backend()
            .insert_token(&session.session_id, &token, now + self.ttl, now)
            .await?;

        if !recorded {
            tracing::debug!(
                session = log_prefix(&session.session_id),
                "Session gone before token could be issued"
            );
            return Ok(None);
        }
        Ok(Some(token))
    }

    /// Attach a fresh token to a structured read response body.
    ///
    /// Bodies that are not JSON objects pass through without minting a token.
    pub async fn issue_on_response(
        &self,
        session: &Session,
        body: Value,
    ) -> Result<Value, TokenError> {
        if !body.is_object() {
            return Ok(body);
        }
        match self.issue(session).await? {
            Some(token) => Ok(decorate_body(body, &token)),
            None => Ok(body),
        }
    }

    /// Require a presented token and spend it.
    ///
    /// Without a session there is no pool, so any presented token is unknown.
    pub async fn require_and_consume(
        &self,
        session: Option<&Session>,
        presented: Option<&str>,
    ) -> Result<(), TokenError> {
        let presented = presented
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(TokenError::MissingToken)?;

        let Some(session) = session else {
            return Err(TokenError::UnknownOrExpiredToken);
        };

        let consumed = self
            .sessions
            .backend()
            .consume_token(&session.session_id, presented, OffsetDateTime::now_utc())
            .await?;

        if !consumed {
            tracing::warn!(
                session = log_prefix(&session.session_id),
                user_id = %session.user_id,
                token = log_prefix(presented),
                "Rejected unknown, expired, or replayed security token"
            );
            return Err(TokenError::UnknownOrExpiredToken);
        }
        Ok(())
    }
}
