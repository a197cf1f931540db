//! Authentication module for WalletGuard

pub mod middleware;
#[cfg(test)]
mod middleware_tests;
pub mod password;
pub mod redis_sessions;
pub mod service;
pub mod sessions;
pub mod tokens;

pub use middleware::{
    clear_session_cookie, one_time_token_guard, resolve_session, session_cookie, CurrentSession,
    MaybeSession, SESSION_COOKIE,
};
pub use password::{hash_password, validate_password_strength, verify_password};
pub use redis_sessions::RedisSessionBackend;
pub use service::{AuthError, AuthOutcome, AuthenticationService};
pub use sessions::{
    MemorySessionBackend, Session, SessionBackend, SessionError, SessionResult, SessionStore,
};
pub use tokens::{
    OneTimeTokenGuard, TokenError, SECURITY_TOKEN_FIELD, SECURITY_TOKEN_HEADER,
};
