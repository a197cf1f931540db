//! Server-side session management
//!
//! A session binds the opaque cookie identifier to a user and owns that
//! user's pool of outstanding security tokens. Storage is pluggable through
//! [`SessionBackend`]; the process-resident [`MemorySessionBackend`] is the
//! default and `RedisSessionBackend` backs multi-instance deployments.
//!
//! Every token-pool mutation for one session is serialized: the memory backend
//! holds one mutex per session, Redis relies on single-command atomicity.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::RngCore;
use time::{Duration, OffsetDateTime};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Bytes of entropy in session identifiers and one-time tokens (256 bits)
pub const SECRET_BYTES: usize = 32;

/// Outstanding security tokens allowed per session before the oldest is evicted
pub const MAX_TOKENS_PER_SESSION: usize = 128;

/// Generate an unguessable hex-encoded secret
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Cheap shape check before a backend lookup
pub(crate) fn is_well_formed_secret(value: &str) -> bool {
    value.len() == SECRET_BYTES * 2 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Short prefix of a secret, safe for logs
pub(crate) fn log_prefix(value: &str) -> &str {
    value.get(..8).unwrap_or(value)
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Corrupt session record: {0}")]
    Corrupt(String),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Server-side session record
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: String,
    pub user_id: Uuid,
    pub is_admin: bool,
    pub created_at: OffsetDateTime,
    pub last_seen_at: OffsetDateTime,
}

/// Storage for sessions and their token pools
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn insert(&self, session: &Session) -> SessionResult<()>;

    async fn load(&self, session_id: &str) -> SessionResult<Option<Session>>;

    /// Record activity on a session
    async fn touch(&self, session_id: &str, now: OffsetDateTime) -> SessionResult<()>;

    /// Remove a session and its whole token pool. Idempotent.
    async fn remove(&self, session_id: &str) -> SessionResult<()>;

    /// Remove every session of a user except `keep`, returning how many went away
    async fn remove_user_sessions(&self, user_id: Uuid, keep: Option<&str>)
        -> SessionResult<usize>;

    /// Add a token to the pool, first dropping entries expired at `now` and
    /// evicting the entry closest to expiry if the pool is full.
    ///
    /// Returns false when the session no longer exists.
    async fn insert_token(
        &self,
        session_id: &str,
        token: &str,
        expires_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> SessionResult<bool>;

    /// Atomically remove `token` from the pool.
    ///
    /// Returns true only for the single caller that removed an entry still
    /// valid at `now`.
    async fn consume_token(
        &self,
        session_id: &str,
        token: &str,
        now: OffsetDateTime,
    ) -> SessionResult<bool>;

    /// Number of tokens currently held in the pool
    async fn pool_size(&self, session_id: &str) -> SessionResult<usize>;

    /// Remove sessions whose last activity is before `cutoff`
    async fn sweep_idle(&self, cutoff: OffsetDateTime) -> SessionResult<usize>;
}

// =============================================================================
// Session store
// =============================================================================

/// Session lifecycle on top of a [`SessionBackend`]
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    idle_timeout: Option<Duration>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SessionBackend>, idle_timeout: Option<Duration>) -> Self {
        Self {
            backend,
            idle_timeout,
        }
    }

    pub fn in_memory(idle_timeout: Option<Duration>) -> Self {
        Self::new(Arc::new(MemorySessionBackend::new()), idle_timeout)
    }

    pub(crate) fn backend(&self) -> &dyn SessionBackend {
        self.backend.as_ref()
    }

    /// Allocate a new session with an empty token pool
    pub async fn create(&self, user_id: Uuid, is_admin: bool) -> SessionResult<Session> {
        let now = OffsetDateTime::now_utc();
        let session = Session {
            session_id: generate_secret(),
            user_id,
            is_admin,
            created_at: now,
            last_seen_at: now,
        };
        self.backend.insert(&session).await?;

        tracing::debug!(
            session = log_prefix(&session.session_id),
            user_id = %user_id,
            is_admin,
            "Session created"
        );
        Ok(session)
    }

    /// Look up a live session. Missing, malformed and idle-expired ids yield `None`.
    pub async fn get(&self, session_id: &str) -> SessionResult<Option<Session>> {
        if !is_well_formed_secret(session_id) {
            return Ok(None);
        }

        let Some(mut session) = self.backend.load(session_id).await? else {
            return Ok(None);
        };

        let now = OffsetDateTime::now_utc();
        if let Some(idle_timeout) = self.idle_timeout {
            if session.last_seen_at + idle_timeout <= now {
                tracing::info!(
                    session = log_prefix(session_id),
                    user_id = %session.user_id,
                    "Session expired after idle timeout"
                );
                self.backend.remove(session_id).await?;
                return Ok(None);
            }
        }

        self.backend.touch(session_id, now).await?;
        session.last_seen_at = now;
        Ok(Some(session))
    }

    /// Remove a session; all of its outstanding tokens die with it. Idempotent.
    pub async fn destroy(&self, session_id: &str) -> SessionResult<()> {
        if !is_well_formed_secret(session_id) {
            return Ok(());
        }
        self.backend.remove(session_id).await?;
        tracing::debug!(session = log_prefix(session_id), "Session destroyed");
        Ok(())
    }

    /// Revoke every session of a user, optionally keeping one
    ///
    /// Used after a password change.
    pub async fn destroy_user_sessions(
        &self,
        user_id: Uuid,
        keep: Option<&str>,
    ) -> SessionResult<usize> {
        let removed = self.backend.remove_user_sessions(user_id, keep).await?;
        if removed > 0 {
            tracing::info!(user_id = %user_id, removed, "Revoked user sessions");
        }
        Ok(removed)
    }

    /// Drop sessions idle past the configured timeout. No-op without a timeout.
    pub async fn sweep_idle(&self) -> SessionResult<usize> {
        let Some(idle_timeout) = self.idle_timeout else {
            return Ok(0);
        };
        let cutoff = OffsetDateTime::now_utc() - idle_timeout;
        self.backend.sweep_idle(cutoff).await
    }
}

// =============================================================================
// In-memory backend
// =============================================================================

#[derive(Debug)]
struct SlotState {
    last_seen_at: OffsetDateTime,
    tokens: HashMap<String, OffsetDateTime>,
    closed: bool,
}

/// One session plus its lock-protected mutable state
#[derive(Debug)]
struct SessionSlot {
    session: Session,
    state: Mutex<SlotState>,
}

/// Process-resident sessions; state lives as long as the process
#[derive(Default)]
pub struct MemorySessionBackend {
    slots: RwLock<HashMap<String, Arc<SessionSlot>>>,
}

impl MemorySessionBackend {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, session_id: &str) -> Option<Arc<SessionSlot>> {
        self.slots.read().await.get(session_id).cloned()
    }
}

/// Close a slot so that holders of a stale `Arc` observe an empty, dead pool
async fn close_slot(slot: &SessionSlot) {
    let mut state = slot.state.lock().await;
    state.closed = true;
    state.tokens.clear();
}

#[async_trait]
impl SessionBackend for MemorySessionBackend {
    async fn insert(&self, session: &Session) -> SessionResult<()> {
        let slot = Arc::new(SessionSlot {
            session: session.clone(),
            state: Mutex::new(SlotState {
                last_seen_at: session.last_seen_at,
                tokens: HashMap::new(),
                closed: false,
            }),
        });
        self.slots
            .write()
            .await
            .insert(session.session_id.clone(), slot);
        Ok(())
    }

    async fn load(&self, session_id: &str) -> SessionResult<Option<Session>> {
        let Some(slot) = self.slot(session_id).await else {
            return Ok(None);
        };
        let state = slot.state.lock().await;
        if state.closed {
            return Ok(None);
        }
        let mut session = slot.session.clone();
        session.last_seen_at = state.last_seen_at;
        Ok(Some(session))
    }

    async fn touch(&self, session_id: &str, now: OffsetDateTime) -> SessionResult<()> {
        if let Some(slot) = self.slot(session_id).await {
            let mut state = slot.state.lock().await;
            if now > state.last_seen_at {
                state.last_seen_at = now;
            }
        }
        Ok(())
    }

    async fn remove(&self, session_id: &str) -> SessionResult<()> {
        let removed = self.slots.write().await.remove(session_id);
        if let Some(slot) = removed {
            close_slot(&slot).await;
        }
        Ok(())
    }

    async fn remove_user_sessions(
        &self,
        user_id: Uuid,
        keep: Option<&str>,
    ) -> SessionResult<usize> {
        let removed: Vec<Arc<SessionSlot>> = {
            let mut slots = self.slots.write().await;
            let ids: Vec<String> = slots
                .iter()
                .filter(|(id, slot)| slot.session.user_id == user_id && Some(id.as_str()) != keep)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| slots.remove(id)).collect()
        };

        for slot in &removed {
            close_slot(slot).await;
        }
        Ok(removed.len())
    }

    async fn insert_token(
        &self,
        session_id: &str,
        token: &str,
        expires_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> SessionResult<bool> {
        let Some(slot) = self.slot(session_id).await else {
            return Ok(false);
        };
        let mut state = slot.state.lock().await;
        if state.closed {
            return Ok(false);
        }

        state.tokens.retain(|_, expiry| *expiry > now);
        if state.tokens.len() >= MAX_TOKENS_PER_SESSION {
            let oldest = state
                .tokens
                .iter()
                .min_by_key(|(_, expiry)| **expiry)
                .map(|(value, _)| value.clone());
            if let Some(oldest) = oldest {
                state.tokens.remove(&oldest);
            }
        }
        state.tokens.insert(token.to_string(), expires_at);
        Ok(true)
    }

    async fn consume_token(
        &self,
        session_id: &str,
        token: &str,
        now: OffsetDateTime,
    ) -> SessionResult<bool> {
        let Some(slot) = self.slot(session_id).await else {
            return Ok(false);
        };
        let mut state = slot.state.lock().await;
        Ok(matches!(state.tokens.remove(token), Some(expiry) if expiry > now))
    }

    async fn pool_size(&self, session_id: &str) -> SessionResult<usize> {
        match self.slot(session_id).await {
            Some(slot) => Ok(slot.state.lock().await.tokens.len()),
            None => Ok(0),
        }
    }

    async fn sweep_idle(&self, cutoff: OffsetDateTime) -> SessionResult<usize> {
        let snapshot: Vec<(String, Arc<SessionSlot>)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        let mut removed = 0;
        for (id, slot) in snapshot {
            let idle = slot.state.lock().await.last_seen_at < cutoff;
            if idle {
                self.remove(&id).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed, "Swept idle sessions");
        }
        Ok(removed)
    }
}
