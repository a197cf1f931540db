//! Application state

use std::sync::Arc;

use walletguard_shared::{InMemoryUserStore, UserStore};

use crate::{
    auth::{AuthenticationService, OneTimeTokenGuard, SessionStore},
    config::Config,
    websocket::ChannelGate,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub users: Arc<dyn UserStore>,
    pub sessions: SessionStore,
    pub auth: AuthenticationService,
    /// One-time security tokens gating every write
    pub token_guard: OneTimeTokenGuard,
    /// Channel tokens and live channel accounting
    pub channels: ChannelGate,
}

impl AppState {
    pub fn new(config: Config, users: Arc<dyn UserStore>, sessions: SessionStore) -> Self {
        let auth = AuthenticationService::new(users.clone(), sessions.clone())
            .with_admin_usernames(config.admin_usernames.iter().cloned());
        let token_guard = OneTimeTokenGuard::new(sessions.clone(), config.security_token_ttl);
        let channels = ChannelGate::new(config.channel_token_ttl);

        tracing::info!(
            token_ttl_secs = config.security_token_ttl.whole_seconds(),
            channel_token_ttl_secs = config.channel_token_ttl.as_secs(),
            idle_timeout_secs = ?config.session_idle_timeout.map(|d| d.whole_seconds()),
            "Authentication state initialized"
        );

        Self {
            config,
            users,
            sessions,
            auth,
            token_guard,
            channels,
        }
    }

    /// State backed entirely by process memory
    pub fn in_memory(config: Config) -> Self {
        let sessions = SessionStore::in_memory(config.session_idle_timeout);
        Self::new(config, Arc::new(InMemoryUserStore::new()), sessions)
    }
}
