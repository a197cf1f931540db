//! Realtime channel routes
//!
//! `POST /api/v1/ws/token` hands out a single-use channel token, and
//! `GET /ws?token=...` upgrades to a WebSocket only if that token is accepted.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
    Json,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::{
    auth::sessions::log_prefix,
    error::{ApiError, ApiResult},
    state::AppState,
    websocket::{dispatch_text, ServerFrame},
};

#[derive(Debug, Serialize)]
pub struct ChannelTokenResponse {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct ChannelQuery {
    pub token: Option<String>,
}

/// POST /api/v1/ws/token
pub async fn issue_channel_token(State(state): State<AppState>) -> Json<ChannelTokenResponse> {
    let token = state.channels.issue_channel_token().await;
    Json(ChannelTokenResponse { token })
}

/// GET /ws
///
/// The token is checked and consumed before the upgrade is accepted, so a
/// rejected caller never gets a channel.
pub async fn channel_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<ChannelQuery>,
) -> ApiResult<Response> {
    let token = query.token.unwrap_or_default();
    if token.is_empty() || !state.channels.authorize_upgrade(&token).await {
        tracing::warn!(
            token = log_prefix(&token),
            "Channel upgrade rejected: invalid, expired, or reused token"
        );
        return Err(ApiError::ChannelUnauthorized);
    }

    tracing::info!(token = log_prefix(&token), "Channel upgrade authorized");
    Ok(ws.on_upgrade(move |socket| handle_channel(socket, state)))
}

async fn handle_channel(mut socket: WebSocket, state: AppState) {
    let _open = state.channels.channel_opened();
    tracing::debug!(active = state.channels.active_channels(), "Channel opened");

    while let Some(msg) = socket.next().await {
        let reply = match msg {
            Ok(Message::Text(text)) => dispatch_text(text.as_str()),
            Ok(Message::Binary(_)) => ServerFrame::error("Binary frames are not supported"),
            Ok(Message::Close(_)) => break,
            // transport answers pings itself
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Err(err) => {
                tracing::debug!(error = %err, "Channel transport error");
                break;
            }
        };

        if socket.send(Message::Text(reply.to_json().into())).await.is_err() {
            break;
        }
    }

    tracing::debug!("Channel closed");
}
