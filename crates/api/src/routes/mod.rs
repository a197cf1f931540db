//! HTTP routes

pub mod auth;
pub mod channel;
pub mod health;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::{
    auth::{one_time_token_guard, resolve_session},
    state::AppState,
};

/// Build the application router with session and token enforcement applied
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/me", get(auth::me).put(auth::update_me))
        .route("/auth/password", post(auth::change_password))
        .route("/ws/token", post(channel::issue_channel_token));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/ws", get(channel::channel_upgrade))
        .route("/health", get(health::health))
        // layers run bottom-up: session resolution precedes the token guard
        .layer(middleware::from_fn_with_state(
            state.clone(),
            one_time_token_guard,
        ))
        .layer(middleware::from_fn_with_state(state.clone(), resolve_session))
        .with_state(state)
}
