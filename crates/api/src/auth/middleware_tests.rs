//! Router-level tests for session resolution and the one-time token guard
//!
//! Tests cover:
//! - Token issuance on reads and consumption on writes
//! - Replay, missing and foreign tokens
//! - Exempt write endpoints
//! - Logout, re-login and password change invalidating tokens
//! - Login surviving a session backend that cannot remove the old session

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{header, Method, Request, StatusCode},
        Router,
    };
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use time::OffsetDateTime;
    use tower::ServiceExt;
    use uuid::Uuid;
    use walletguard_shared::InMemoryUserStore;

    use crate::{
        auth::{
            MemorySessionBackend, Session, SessionBackend, SessionError, SessionResult,
            SessionStore, SECURITY_TOKEN_FIELD, SECURITY_TOKEN_HEADER,
        },
        config::Config,
        routes::create_router,
        state::AppState,
    };

    const PASSWORD: &str = "Secr3tPW!";

    struct Reply {
        status: StatusCode,
        set_cookie: Option<String>,
        body: Value,
    }

    fn test_app() -> Router {
        create_router(AppState::in_memory(Config::default()))
    }

    async fn send(
        app: &Router,
        method: Method,
        uri: &str,
        cookie: Option<&str>,
        token: Option<&str>,
        body: Option<Value>,
    ) -> Reply {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        if let Some(token) = token {
            builder = builder.header(SECURITY_TOKEN_HEADER, token);
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let set_cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .map(|v| v.to_str().unwrap().to_string());
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

        Reply {
            status,
            set_cookie,
            body,
        }
    }

    /// `name=value` part of a `Set-Cookie` header
    fn cookie_pair(set_cookie: &str) -> String {
        set_cookie.split(';').next().unwrap().to_string()
    }

    async fn register(app: &Router, username: &str) -> String {
        let reply = send(
            app,
            Method::POST,
            "/api/v1/auth/register",
            None,
            None,
            Some(json!({
                "username": username,
                "password": PASSWORD,
                "email": format!("{username}@example.com"),
            })),
        )
        .await;
        assert_eq!(reply.status, StatusCode::CREATED, "{}", reply.body);
        cookie_pair(&reply.set_cookie.unwrap())
    }

    /// Read `/auth/me` and return the token attached to it
    async fn fresh_token(app: &Router, cookie: &str) -> String {
        let reply = send(app, Method::GET, "/api/v1/auth/me", Some(cookie), None, None).await;
        assert_eq!(reply.status, StatusCode::OK);
        reply.body[SECURITY_TOKEN_FIELD].as_str().unwrap().to_string()
    }

    async fn update_email(app: &Router, cookie: &str, token: Option<&str>, email: &str) -> Reply {
        send(
            app,
            Method::PUT,
            "/api/v1/auth/me",
            Some(cookie),
            token,
            Some(json!({ "email": email })),
        )
        .await
    }

    #[tokio::test]
    async fn test_register_read_write_replay() {
        let app = test_app();

        let reply = send(
            &app,
            Method::POST,
            "/api/v1/auth/register",
            None,
            None,
            Some(json!({ "username": "alice", "password": PASSWORD, "email": "alice@example.com" })),
        )
        .await;
        assert_eq!(reply.status, StatusCode::CREATED);
        let set_cookie = reply.set_cookie.unwrap();
        assert!(set_cookie.starts_with("wg_session="));
        assert!(set_cookie.contains("HttpOnly"));
        assert_eq!(reply.body["user"]["username"], "alice");
        assert!(reply.body["user"].get("password_hash").is_none());
        assert!(reply.body.get(SECURITY_TOKEN_FIELD).is_none());
        let cookie = cookie_pair(&set_cookie);

        let token = fresh_token(&app, &cookie).await;

        let first = update_email(&app, &cookie, Some(&token), "a@example.com").await;
        assert_eq!(first.status, StatusCode::OK);
        assert_eq!(first.body["user"]["email"], "a@example.com");

        let replay = update_email(&app, &cookie, Some(&token), "b@example.com").await;
        assert_eq!(replay.status, StatusCode::FORBIDDEN);
        assert_eq!(replay.body["error"], "unknown_or_expired_token");
    }

    #[tokio::test]
    async fn test_write_without_token_is_rejected_before_handler() {
        let app = test_app();
        let cookie = register(&app, "alice").await;

        let reply = update_email(&app, &cookie, None, "changed@example.com").await;
        assert_eq!(reply.status, StatusCode::FORBIDDEN);
        assert_eq!(reply.body["error"], "missing_token");

        let reply = update_email(&app, &cookie, Some("   "), "changed@example.com").await;
        assert_eq!(reply.body["error"], "missing_token");

        let reply = update_email(&app, &cookie, Some("deadbeef"), "changed@example.com").await;
        assert_eq!(reply.status, StatusCode::FORBIDDEN);
        assert_eq!(reply.body["error"], "unknown_or_expired_token");

        let me = send(&app, Method::GET, "/api/v1/auth/me", Some(&cookie), None, None).await;
        assert_eq!(me.body["user"]["email"], "alice@example.com");
    }

    #[tokio::test]
    async fn test_each_read_issues_distinct_usable_tokens() {
        let app = test_app();
        let cookie = register(&app, "alice").await;

        let t1 = fresh_token(&app, &cookie).await;
        let t2 = fresh_token(&app, &cookie).await;
        assert_ne!(t1, t2);

        // consumption order is free
        let reply = update_email(&app, &cookie, Some(&t2), "two@example.com").await;
        assert_eq!(reply.status, StatusCode::OK);
        let reply = update_email(&app, &cookie, Some(&t1), "one@example.com").await;
        assert_eq!(reply.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rejected_handler_still_spends_token() {
        let app = test_app();
        let cookie = register(&app, "alice").await;
        let token = fresh_token(&app, &cookie).await;

        let reply = update_email(&app, &cookie, Some(&token), "not-an-email").await;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);
        assert_eq!(reply.body["error"], "validation_failed");

        let reply = update_email(&app, &cookie, Some(&token), "ok@example.com").await;
        assert_eq!(reply.body["error"], "unknown_or_expired_token");
    }

    #[tokio::test]
    async fn test_tokens_do_not_cross_sessions() {
        let app = test_app();
        let alice = register(&app, "alice").await;
        let bob = register(&app, "bob").await;

        let alice_token = fresh_token(&app, &alice).await;
        let reply = update_email(&app, &bob, Some(&alice_token), "bob2@example.com").await;
        assert_eq!(reply.status, StatusCode::FORBIDDEN);
        assert_eq!(reply.body["error"], "unknown_or_expired_token");

        // the failed attempt against bob's pool left alice's token intact
        let reply = update_email(&app, &alice, Some(&alice_token), "alice2@example.com").await;
        assert_eq!(reply.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_exempt_writes_need_no_token() {
        let app = test_app();
        register(&app, "alice").await;

        let reply = send(
            &app,
            Method::POST,
            "/api/v1/auth/login",
            None,
            None,
            Some(json!({ "username": "alice", "password": PASSWORD })),
        )
        .await;
        assert_eq!(reply.status, StatusCode::OK);
        assert!(reply.set_cookie.is_some());

        let reply = send(&app, Method::POST, "/api/v1/ws/token", None, None, None).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body["token"].as_str().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_login_failures_are_indistinguishable() {
        let app = test_app();
        register(&app, "alice").await;

        let wrong_password = send(
            &app,
            Method::POST,
            "/api/v1/auth/login",
            None,
            None,
            Some(json!({ "username": "alice", "password": "Wr0ngPassword" })),
        )
        .await;
        let unknown_user = send(
            &app,
            Method::POST,
            "/api/v1/auth/login",
            None,
            None,
            Some(json!({ "username": "mallory", "password": PASSWORD })),
        )
        .await;

        assert_eq!(wrong_password.status, StatusCode::UNAUTHORIZED);
        assert_eq!(wrong_password.status, unknown_user.status);
        assert_eq!(wrong_password.body, unknown_user.body);
        assert!(wrong_password.set_cookie.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_registration_conflicts() {
        let app = test_app();
        register(&app, "alice").await;

        let reply = send(
            &app,
            Method::POST,
            "/api/v1/auth/register",
            None,
            None,
            Some(json!({ "username": "alice", "password": PASSWORD, "email": "x@example.com" })),
        )
        .await;
        assert_eq!(reply.status, StatusCode::CONFLICT);
        assert_eq!(reply.body["error"], "username_taken");
        assert!(reply.set_cookie.is_none());
    }

    #[tokio::test]
    async fn test_logout_invalidates_outstanding_tokens() {
        let app = test_app();
        let cookie = register(&app, "alice").await;
        let t1 = fresh_token(&app, &cookie).await;
        let t2 = fresh_token(&app, &cookie).await;

        let reply = send(&app, Method::POST, "/api/v1/auth/logout", Some(&cookie), Some(&t1), None).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert!(reply.set_cookie.unwrap().contains("Max-Age=0"));

        let reply = update_email(&app, &cookie, Some(&t2), "late@example.com").await;
        assert_eq!(reply.status, StatusCode::FORBIDDEN);
        assert_eq!(reply.body["error"], "unknown_or_expired_token");

        let me = send(&app, Method::GET, "/api/v1/auth/me", Some(&cookie), None, None).await;
        assert_eq!(me.status, StatusCode::UNAUTHORIZED);
        assert_eq!(me.body["error"], "not_authenticated");
    }

    #[tokio::test]
    async fn test_logout_requires_token() {
        let app = test_app();
        let cookie = register(&app, "alice").await;

        let reply = send(&app, Method::POST, "/api/v1/auth/logout", Some(&cookie), None, None).await;
        assert_eq!(reply.status, StatusCode::FORBIDDEN);
        assert_eq!(reply.body["error"], "missing_token");

        let me = send(&app, Method::GET, "/api/v1/auth/me", Some(&cookie), None, None).await;
        assert_eq!(me.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_no_token_without_session() {
        let app = test_app();

        let health = send(&app, Method::GET, "/health", None, None, None).await;
        assert_eq!(health.status, StatusCode::OK);
        assert_eq!(health.body["status"], "ok");
        assert!(health.body.get(SECURITY_TOKEN_FIELD).is_none());

        let stale = send(&app, Method::GET, "/health", Some("wg_session=unknown"), None, None).await;
        assert!(stale.body.get(SECURITY_TOKEN_FIELD).is_none());

        let me = send(&app, Method::GET, "/api/v1/auth/me", None, None, None).await;
        assert_eq!(me.status, StatusCode::UNAUTHORIZED);
        assert!(me.body.get(SECURITY_TOKEN_FIELD).is_none());
    }

    #[tokio::test]
    async fn test_any_successful_read_issues_token() {
        let app = test_app();
        let cookie = register(&app, "alice").await;

        let health = send(&app, Method::GET, "/health", Some(&cookie), None, None).await;
        let token = health.body[SECURITY_TOKEN_FIELD].as_str().unwrap().to_string();
        assert_eq!(health.body["status"], "ok");

        let reply = update_email(&app, &cookie, Some(&token), "h@example.com").await;
        assert_eq!(reply.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_login_replaces_existing_session() {
        let app = test_app();
        let old_cookie = register(&app, "alice").await;

        let reply = send(
            &app,
            Method::POST,
            "/api/v1/auth/login",
            Some(&old_cookie),
            None,
            Some(json!({ "username": "alice", "password": PASSWORD })),
        )
        .await;
        assert_eq!(reply.status, StatusCode::OK);
        let new_cookie = cookie_pair(&reply.set_cookie.unwrap());
        assert_ne!(old_cookie, new_cookie);

        let old = send(&app, Method::GET, "/api/v1/auth/me", Some(&old_cookie), None, None).await;
        assert_eq!(old.status, StatusCode::UNAUTHORIZED);
        let new = send(&app, Method::GET, "/api/v1/auth/me", Some(&new_cookie), None, None).await;
        assert_eq!(new.status, StatusCode::OK);
        assert!(new.body["user"]["last_login_at"].is_string());
    }

    /// Session backend whose removals always fail
    struct StuckRemovals(MemorySessionBackend);

    #[async_trait]
    impl SessionBackend for StuckRemovals {
        async fn insert(&self, session: &Session) -> SessionResult<()> {
            self.0.insert(session).await
        }
        async fn load(&self, session_id: &str) -> SessionResult<Option<Session>> {
            self.0.load(session_id).await
        }
        async fn touch(&self, session_id: &str, now: OffsetDateTime) -> SessionResult<()> {
            self.0.touch(session_id, now).await
        }
        async fn remove(&self, _session_id: &str) -> SessionResult<()> {
            Err(SessionError::Corrupt("backend unavailable".to_string()))
        }
        async fn remove_user_sessions(
            &self,
            _user_id: Uuid,
            _keep: Option<&str>,
        ) -> SessionResult<usize> {
            Err(SessionError::Corrupt("backend unavailable".to_string()))
        }
        async fn insert_token(
            &self,
            session_id: &str,
            token: &str,
            expires_at: OffsetDateTime,
            now: OffsetDateTime,
        ) -> SessionResult<bool> {
            self.0.insert_token(session_id, token, expires_at, now).await
        }
        async fn consume_token(
            &self,
            session_id: &str,
            token: &str,
            now: OffsetDateTime,
        ) -> SessionResult<bool> {
            self.0.consume_token(session_id, token, now).await
        }
        async fn pool_size(&self, session_id: &str) -> SessionResult<usize> {
            self.0.pool_size(session_id).await
        }
        async fn sweep_idle(&self, cutoff: OffsetDateTime) -> SessionResult<usize> {
            self.0.sweep_idle(cutoff).await
        }
    }

    #[tokio::test]
    async fn test_login_succeeds_when_old_session_cannot_be_removed() {
        let sessions = SessionStore::new(Arc::new(StuckRemovals(MemorySessionBackend::new())), None);
        let state = AppState::new(Config::default(), Arc::new(InMemoryUserStore::new()), sessions);
        let app = create_router(state);
        let old_cookie = register(&app, "alice").await;

        let reply = send(
            &app,
            Method::POST,
            "/api/v1/auth/login",
            Some(&old_cookie),
            None,
            Some(json!({ "username": "alice", "password": PASSWORD })),
        )
        .await;
        assert_eq!(reply.status, StatusCode::OK, "{}", reply.body);
        let new_cookie = cookie_pair(&reply.set_cookie.unwrap());
        assert_ne!(new_cookie, old_cookie);

        let me = send(&app, Method::GET, "/api/v1/auth/me", Some(&new_cookie), None, None).await;
        assert_eq!(me.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_password_change_revokes_other_sessions() {
        let app = test_app();
        let first = register(&app, "alice").await;

        let login = send(
            &app,
            Method::POST,
            "/api/v1/auth/login",
            None,
            None,
            Some(json!({ "username": "alice", "password": PASSWORD })),
        )
        .await;
        let second = cookie_pair(&login.set_cookie.unwrap());

        let token = fresh_token(&app, &first).await;
        let reply = send(
            &app,
            Method::POST,
            "/api/v1/auth/password",
            Some(&first),
            Some(&token),
            Some(json!({ "currentPassword": PASSWORD, "newPassword": "N3wPassword!" })),
        )
        .await;
        assert_eq!(reply.status, StatusCode::OK, "{}", reply.body);

        let kept = send(&app, Method::GET, "/api/v1/auth/me", Some(&first), None, None).await;
        assert_eq!(kept.status, StatusCode::OK);
        let revoked = send(&app, Method::GET, "/api/v1/auth/me", Some(&second), None, None).await;
        assert_eq!(revoked.status, StatusCode::UNAUTHORIZED);

        let relogin = send(
            &app,
            Method::POST,
            "/api/v1/auth/login",
            None,
            None,
            Some(json!({ "username": "alice", "password": "N3wPassword!" })),
        )
        .await;
        assert_eq!(relogin.status, StatusCode::OK);
    }
}
