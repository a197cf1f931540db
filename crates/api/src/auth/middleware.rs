//! Session and security-token middleware for Axum
//!
//! Layer order on the router (outermost first):
//! 1. [`resolve_session`] maps the session cookie to a [`Session`] extension
//! 2. [`one_time_token_guard`] consumes a token on writes and decorates reads

use std::convert::Infallible;

use axum::{
    body::{to_bytes, Body, HttpBody},
    extract::{FromRequestParts, Request, State},
    http::{
        header::{CONTENT_LENGTH, CONTENT_TYPE, COOKIE},
        request::Parts,
        HeaderMap, Method,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::service::AuthError;
use super::sessions::{log_prefix, Session};
use super::tokens::SECURITY_TOKEN_HEADER;
use crate::{error::ApiError, state::AppState};

/// Name of the session cookie
pub const SESSION_COOKIE: &str = "wg_session";

/// Largest read response body the guard will buffer for decoration.
/// Larger bodies are passed through without a token.
const MAX_DECORATED_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Write endpoints reachable before any security token can exist
const TOKEN_EXEMPT_PATHS: &[&str] = &[
    "/api/v1/auth/login",
    "/api/v1/auth/register",
    "/api/v1/ws/token",
];

/// `Set-Cookie` value establishing a session
pub fn session_cookie(session_id: &str, secure: bool) -> String {
    let mut cookie = format!("{SESSION_COOKIE}={session_id}; Path=/; HttpOnly; SameSite=Strict");
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// `Set-Cookie` value removing the session cookie
pub fn clear_session_cookie(secure: bool) -> String {
    let mut cookie = format!("{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Strict; Max-Age=0");
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Extract the session identifier from the Cookie header(s)
pub(crate) fn extract_session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .find_map(|cookie| {
            cookie
                .trim()
                .strip_prefix(SESSION_COOKIE)
                .and_then(|rest| rest.strip_prefix('='))
                .filter(|value| !value.is_empty())
                .map(String::from)
        })
}

fn extract_security_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SECURITY_TOKEN_HEADER)
        .and_then(|h| h.to_str().ok())
}

/// Check if the HTTP method is read-only
fn is_read_only_method(method: &Method) -> bool {
    matches!(method, &Method::GET | &Method::HEAD | &Method::OPTIONS)
}

fn is_token_exempt(path: &str) -> bool {
    TOKEN_EXEMPT_PATHS.contains(&path)
}

fn is_json_response(response: &Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"))
}

/// Middleware that resolves the session cookie into a [`Session`] extension
pub async fn resolve_session(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(session_id) = extract_session_id(request.headers()) {
        match state.sessions.get(&session_id).await {
            Ok(Some(session)) => {
                request.extensions_mut().insert(session);
            }
            Ok(None) => {
                tracing::debug!(
                    session = log_prefix(&session_id),
                    "resolve_session: unknown or expired session cookie"
                );
            }
            Err(err) => {
                tracing::error!(error = ?err, "resolve_session: session lookup failed");
                return ApiError::from(err).into_response();
            }
        }
    }

    next.run(request).await
}

/// Middleware enforcing the one-time security token protocol
///
/// Writes outside the exempt list must present an unexpired token, which is
/// consumed before the handler runs. Successful JSON object responses to
/// `GET` requests carry a freshly issued token.
pub async fn one_time_token_guard(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let session = request.extensions().get::<Session>().cloned();

    if !is_read_only_method(&method) {
        if !is_token_exempt(&path) {
            let presented = extract_security_token(request.headers());
            if let Err(err) = state
                .token_guard
                .require_and_consume(session.as_ref(), presented)
                .await
            {
                tracing::warn!(
                    path = %path,
                    method = %method,
                    reason = err.reason_code(),
                    "one_time_token_guard: write rejected"
                );
                return ApiError::from(err).into_response();
            }
        }
        return next.run(request).await;
    }

    let response = next.run(request).await;

    match session {
        Some(session)
            if method == Method::GET
                && response.status().as_u16() < 400
                && is_json_response(&response) =>
        {
            decorate_response(&state, &session, response).await
        }
        _ => response,
    }
}

/// Buffer a JSON response and attach a fresh security token to it
async fn decorate_response(state: &AppState, session: &Session, response: Response) -> Response {
    if response.body().size_hint().lower() > MAX_DECORATED_BODY_BYTES as u64 {
        tracing::debug!(
            session = log_prefix(&session.session_id),
            "one_time_token_guard: body too large to decorate, passing through"
        );
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match to_bytes(body, MAX_DECORATED_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::error!(error = ?err, "one_time_token_guard: failed to buffer response body");
            return ApiError::Internal(anyhow::anyhow!("response body unavailable")).into_response();
        }
    };

    let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes) else {
        return Response::from_parts(parts, Body::from(bytes));
    };
    if !value.is_object() {
        return Response::from_parts(parts, Body::from(bytes));
    }

    let decorated = match state.token_guard.issue_on_response(session, value).await {
        Ok(decorated) => decorated,
        Err(err) => {
            tracing::error!(error = ?err, "one_time_token_guard: token issuance failed");
            return ApiError::from(err).into_response();
        }
    };

    match serde_json::to_vec(&decorated) {
        Ok(body) => {
            parts.headers.remove(CONTENT_LENGTH);
            Response::from_parts(parts, Body::from(body))
        }
        Err(err) => ApiError::Internal(err.into()).into_response(),
    }
}

/// The authenticated session of the current request
#[derive(Debug, Clone)]
pub struct CurrentSession(pub Session);

impl<S> FromRequestParts<S> for CurrentSession
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Session>()
            .cloned()
            .map(CurrentSession)
            .ok_or(ApiError::Auth(AuthError::NotAuthenticated))
    }
}

/// The session of the current request, if any
#[derive(Debug, Clone)]
pub struct MaybeSession(pub Option<Session>);

impl<S> FromRequestParts<S> for MaybeSession
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(MaybeSession(parts.extensions.get::<Session>().cloned()))
    }
}
