//! Realtime channel support
//!
//! A channel is a WebSocket authenticated once, at upgrade time, by a
//! single-use channel token. Channel tokens live in one process-wide pool that
//! is independent of sessions and remove themselves when they expire.

pub mod messages;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::auth::sessions::{generate_secret, log_prefix};

pub use messages::{dispatch_text, ClientEnvelope, ServerFrame};

/// Default lifetime of an unused channel token
pub const DEFAULT_CHANNEL_TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

/// Longest lifetime a gate accepts; larger values are clamped
pub const MAX_CHANNEL_TOKEN_TTL: Duration = Duration::from_secs(u32::MAX as u64);

/// Default bound on unused tokens held at once
pub const DEFAULT_MAX_PENDING_TOKENS: usize = 10_000;

struct PendingToken {
    expires_at: Instant,
    /// Issue order; the lowest is the next to expire
    seq: u64,
    expiry_task: AbortHandle,
}

#[derive(Default)]
struct PendingPool {
    tokens: HashMap<String, PendingToken>,
    next_seq: u64,
}

struct GateInner {
    pool: Mutex<PendingPool>,
    ttl: Duration,
    max_pending: usize,
    active_channels: AtomicUsize,
}

/// Issues channel tokens and authorizes channel upgrades
#[derive(Clone)]
pub struct ChannelGate {
    inner: Arc<GateInner>,
}

impl ChannelGate {
    pub fn new(ttl: Duration) -> Self {
        Self::with_max_pending(ttl, DEFAULT_MAX_PENDING_TOKENS)
    }

    /// Gate holding at most `max_pending` unused tokens; issuing past the
    /// bound drops the token closest to expiry
    pub fn with_max_pending(ttl: Duration, max_pending: usize) -> Self {
        Self {
            inner: Arc::new(GateInner {
                pool: Mutex::new(PendingPool::default()),
                ttl: ttl.min(MAX_CHANNEL_TOKEN_TTL),
                max_pending: max_pending.max(1),
                active_channels: AtomicUsize::new(0),
            }),
        }
    }

    /// Issue a token and schedule its removal at expiry.
    ///
    /// Must be called inside a Tokio runtime.
    pub async fn issue_channel_token(&self) -> String {
        let token = generate_secret();
        let expires_at = Instant::now() + self.inner.ttl;

        let mut pool = self.inner.pool.lock().await;
        if pool.tokens.len() >= self.inner.max_pending {
            let oldest = pool
                .tokens
                .iter()
                .min_by_key(|(_, pending)| pending.seq)
                .map(|(value, _)| value.clone());
            if let Some(evicted) = oldest.and_then(|value| pool.tokens.remove(&value)) {
                evicted.expiry_task.abort();
                tracing::warn!(
                    max_pending = self.inner.max_pending,
                    "Channel token pool full, dropped oldest unused token"
                );
            }
        }

        // the task cannot observe the pool before this insert: it needs the lock
        let weak: Weak<GateInner> = Arc::downgrade(&self.inner);
        let scheduled = token.clone();
        let expiry_task = tokio::spawn(async move {
            tokio::time::sleep_until(expires_at).await;
            if let Some(inner) = weak.upgrade() {
                if inner.pool.lock().await.tokens.remove(&scheduled).is_some() {
                    tracing::debug!(token = log_prefix(&scheduled), "Unused channel token expired");
                }
            }
        })
        .abort_handle();

        let seq = pool.next_seq;
        pool.next_seq += 1;
        pool.tokens.insert(
            token.clone(),
            PendingToken {
                expires_at,
                seq,
                expiry_task,
            },
        );
        drop(pool);

        tracing::debug!(token = log_prefix(&token), "Channel token issued");
        token
    }

    /// Check and invalidate a token in one step.
    ///
    /// At most one caller can succeed for any token value.
    pub async fn authorize_upgrade(&self, presented: &str) -> bool {
        let removed = self.inner.pool.lock().await.tokens.remove(presented);
        match removed {
            Some(pending) => {
                pending.expiry_task.abort();
                Instant::now() < pending.expires_at
            }
            None => false,
        }
    }

    /// Unused tokens currently in the pool
    pub async fn pending_tokens(&self) -> usize {
        self.inner.pool.lock().await.tokens.len()
    }

    pub fn active_channels(&self) -> usize {
        self.inner.active_channels.load(Ordering::Relaxed)
    }

    /// Count a channel as open until the returned guard is dropped
    pub fn channel_opened(&self) -> OpenChannel {
        self.inner.active_channels.fetch_add(1, Ordering::Relaxed);
        OpenChannel {
            inner: self.inner.clone(),
        }
    }
}

impl Default for ChannelGate {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_TOKEN_TTL)
    }
}

/// Marks one live channel
pub struct OpenChannel {
    inner: Arc<GateInner>,
}

impl Drop for OpenChannel {
    fn drop(&mut self) {
        self.inner.active_channels.fetch_sub(1, Ordering::Relaxed);
    }
}
