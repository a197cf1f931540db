//! Authentication routes

use axum::{
    extract::State,
    http::{header::SET_COOKIE, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use walletguard_shared::PublicUser;

use crate::{
    auth::{clear_session_cookie, session_cookie, CurrentSession, MaybeSession},
    error::ApiResult,
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProfileRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub user: PublicUser,
}

/// POST /api/v1/auth/register
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state
        .auth
        .register(&req.username, &req.password, &req.email)
        .await?;

    let cookie = session_cookie(&outcome.session.session_id, state.config.cookie_secure);
    Ok((
        StatusCode::CREATED,
        [(SET_COOKIE, cookie)],
        Json(UserResponse { user: outcome.user }),
    ))
}

/// POST /api/v1/auth/login
///
/// A session already attached to the request is replaced. Failing to remove
/// it does not fail the login; the new session is already live.
pub async fn login(
    State(state): State<AppState>,
    MaybeSession(previous): MaybeSession,
    Json(req): Json<LoginRequest>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state.auth.login(&req.username, &req.password).await?;

    if let Some(previous) = previous {
        if let Err(err) = state.auth.logout(&previous.session_id).await {
            tracing::error!(
                error = ?err,
                user_id = %outcome.user.id,
                "Failed to remove replaced session after login"
            );
        }
    }

    let cookie = session_cookie(&outcome.session.session_id, state.config.cookie_secure);
    Ok(([(SET_COOKIE, cookie)], Json(UserResponse { user: outcome.user })))
}

/// POST /api/v1/auth/logout
pub async fn logout(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
) -> ApiResult<impl IntoResponse> {
    state.auth.logout(&session.session_id).await?;

    Ok((
        [(SET_COOKIE, clear_session_cookie(state.config.cookie_secure))],
        Json(json!({ "success": true })),
    ))
}

/// GET /api/v1/auth/me
pub async fn me(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
) -> ApiResult<Json<UserResponse>> {
    let user = state.auth.current_user(&session.session_id).await?;
    Ok(Json(UserResponse { user }))
}

/// PUT /api/v1/auth/me
pub async fn update_me(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Json(req): Json<UpdateProfileRequest>,
) -> ApiResult<Json<UserResponse>> {
    let user = state.auth.update_profile(&session, &req.email).await?;
    Ok(Json(UserResponse { user }))
}

/// POST /api/v1/auth/password
pub async fn change_password(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Json(req): Json<ChangePasswordRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .auth
        .change_password(&session, &req.current_password, &req.new_password)
        .await?;
    Ok(Json(json!({ "success": true })))
}
