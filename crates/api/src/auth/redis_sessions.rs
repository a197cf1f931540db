//! Redis-backed sessions for deployments running several API instances
//!
//! Key layout:
//! - `wg:session:{id}`        hash: user_id, is_admin, created_at, last_seen_at
//! - `wg:session:{id}:tokens` hash: token -> expiry (unix millis)
//! - `wg:user:{uuid}:sessions` set of session ids
//!
//! Token consumption is `HGET` followed by `HDEL`; only the caller whose
//! `HDEL` removed the field may proceed, so concurrent consumers of one token
//! cannot both succeed.
//!
//! Writes to an existing session (`touch`, token insertion) run as Lua scripts
//! that check the session hash and write in one step, so a concurrent logout
//! can never leave a partial hash behind.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use super::sessions::{
    log_prefix, Session, SessionBackend, SessionError, SessionResult, MAX_TOKENS_PER_SESSION,
};

fn session_key(session_id: &str) -> String {
    format!("wg:session:{session_id}")
}

fn tokens_key(session_id: &str) -> String {
    format!("wg:session:{session_id}:tokens")
}

fn user_key(user_id: Uuid) -> String {
    format!("wg:user:{user_id}:sessions")
}

fn to_millis(at: OffsetDateTime) -> i64 {
    i64::try_from(at.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

fn from_millis(millis: i64) -> SessionResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|e| SessionError::Corrupt(e.to_string()))
}

fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> SessionResult<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| SessionError::Corrupt(format!("missing field '{name}'")))
}

fn parse_millis(value: &str) -> SessionResult<OffsetDateTime> {
    let millis = value
        .parse::<i64>()
        .map_err(|e| SessionError::Corrupt(e.to_string()))?;
    from_millis(millis)
}

/// KEYS: session, tokens. ARGV: last_seen_at millis, ttl seconds (0 = none)
const TOUCH_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
redis.call('HSET', KEYS[1], 'last_seen_at', ARGV[1])
local ttl = tonumber(ARGV[2])
if ttl > 0 then
    redis.call('EXPIRE', KEYS[1], ttl)
    redis.call('EXPIRE', KEYS[2], ttl)
end
return 1
"#;

/// KEYS: session, tokens. ARGV: ttl seconds (0 = none), token, expiry millis,
/// then the token values to evict
const WRITE_TOKEN_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
for i = 4, #ARGV do
    redis.call('HDEL', KEYS[2], ARGV[i])
end
redis.call('HSET', KEYS[2], ARGV[2], ARGV[3])
local ttl = tonumber(ARGV[1])
if ttl > 0 then
    redis.call('EXPIRE', KEYS[1], ttl)
    redis.call('EXPIRE', KEYS[2], ttl)
end
return 1
"#;

/// Build a session from its hash.
///
/// A hash without `user_id` is a fragment left by an interrupted write and
/// reads as no session.
fn decode_session(
    session_id: &str,
    fields: &HashMap<String, String>,
) -> SessionResult<Option<Session>> {
    let Some(user_id) = fields.get("user_id") else {
        return Ok(None);
    };
    let user_id =
        Uuid::parse_str(user_id).map_err(|e| SessionError::Corrupt(e.to_string()))?;

    Ok(Some(Session {
        session_id: session_id.to_string(),
        user_id,
        is_admin: field(fields, "is_admin")? == "true",
        created_at: parse_millis(field(fields, "created_at")?)?,
        last_seen_at: parse_millis(field(fields, "last_seen_at")?)?,
    }))
}

/// Tokens to drop before inserting one more: all expired entries, plus the
/// live entries closest to expiry when the pool is full
fn tokens_to_evict(pool: &HashMap<String, i64>, now_millis: i64) -> Vec<String> {
    let mut live: Vec<(&String, i64)> = pool
        .iter()
        .filter(|(_, expiry)| **expiry > now_millis)
        .map(|(value, expiry)| (value, *expiry))
        .collect();
    let mut doomed: Vec<String> = pool
        .iter()
        .filter(|(_, expiry)| **expiry <= now_millis)
        .map(|(value, _)| value.clone())
        .collect();

    if live.len() >= MAX_TOKENS_PER_SESSION {
        live.sort_by_key(|(_, expiry)| *expiry);
        let excess = live.len() + 1 - MAX_TOKENS_PER_SESSION;
        doomed.extend(live.iter().take(excess).map(|(value, _)| (*value).clone()));
    }
    doomed
}

#[derive(Clone)]
pub struct RedisSessionBackend {
    conn: ConnectionManager,
    /// Mirrors the store's idle timeout as a key TTL so Redis expires idle sessions itself
    idle_timeout: Option<Duration>,
    touch_script: Script,
    write_token_script: Script,
}

impl RedisSessionBackend {
    pub async fn connect(redis_url: &str, idle_timeout: Option<Duration>) -> SessionResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("Redis session backend connected");
        Ok(Self {
            conn,
            idle_timeout,
            touch_script: Script::new(TOUCH_SCRIPT),
            write_token_script: Script::new(WRITE_TOKEN_SCRIPT),
        })
    }

    fn ttl_seconds(&self) -> i64 {
        self.idle_timeout
            .map(|idle| idle.whole_seconds().max(1))
            .unwrap_or(0)
    }

    async fn refresh_ttl(&self, session_id: &str) -> SessionResult<()> {
        let seconds = self.ttl_seconds();
        if seconds == 0 {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .expire(session_key(session_id), seconds)
            .ignore()
            .expire(tokens_key(session_id), seconds)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove_with_owner(
        &self,
        session_id: &str,
        user_id: Option<Uuid>,
    ) -> SessionResult<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(vec![session_key(session_id), tokens_key(session_id)])
            .ignore();
        if let Some(user_id) = user_id {
            pipe.srem(user_key(user_id), session_id).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionBackend for RedisSessionBackend {
    async fn insert(&self, session: &Session) -> SessionResult<()> {
        let mut conn = self.conn.clone();
        let fields = [
            ("user_id", session.user_id.to_string()),
            ("is_admin", session.is_admin.to_string()),
            ("created_at", to_millis(session.created_at).to_string()),
            ("last_seen_at", to_millis(session.last_seen_at).to_string()),
        ];
        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(session_key(&session.session_id), &fields)
            .ignore()
            .sadd(user_key(session.user_id), &session.session_id)
            .ignore()
            .query_async(&mut conn)
            .await?;

        self.refresh_ttl(&session.session_id).await
    }

    async fn load(&self, session_id: &str) -> SessionResult<Option<Session>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(session_key(session_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let session = decode_session(session_id, &fields)?;
        if session.is_none() {
            tracing::warn!(
                session = log_prefix(session_id),
                "Discarding partial session hash"
            );
            let _: () = conn
                .del(vec![session_key(session_id), tokens_key(session_id)])
                .await?;
        }
        Ok(session)
    }

    async fn touch(&self, session_id: &str, now: OffsetDateTime) -> SessionResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .touch_script
            .key(session_key(session_id))
            .key(tokens_key(session_id))
            .arg(to_millis(now))
            .arg(self.ttl_seconds())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove(&self, session_id: &str) -> SessionResult<()> {
        let owner = self.load(session_id).await?.map(|s| s.user_id);
        self.remove_with_owner(session_id, owner).await
    }

    async fn remove_user_sessions(
        &self,
        user_id: Uuid,
        keep: Option<&str>,
    ) -> SessionResult<usize> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(user_key(user_id)).await?;

        let mut removed = 0;
        for id in ids.iter().filter(|id| Some(id.as_str()) != keep) {
            let exists: bool = conn.exists(session_key(id)).await?;
            self.remove_with_owner(id, Some(user_id)).await?;
            if exists {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn insert_token(
        &self,
        session_id: &str,
        token: &str,
        expires_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> SessionResult<bool> {
        let mut conn = self.conn.clone();
        let pool: HashMap<String, i64> = conn.hgetall(tokens_key(session_id)).await?;
        let doomed = tokens_to_evict(&pool, to_millis(now));

        let written: i64 = self
            .write_token_script
            .key(session_key(session_id))
            .key(tokens_key(session_id))
            .arg(self.ttl_seconds())
            .arg(token)
            .arg(to_millis(expires_at))
            .arg(doomed)
            .invoke_async(&mut conn)
            .await?;
        Ok(written == 1)
    }

    async fn consume_token(
        &self,
        session_id: &str,
        token: &str,
        now: OffsetDateTime,
    ) -> SessionResult<bool> {
        let mut conn = self.conn.clone();
        let key = tokens_key(session_id);
        let expiry: Option<i64> = conn.hget(&key, token).await?;
        let Some(expiry) = expiry else {
            return Ok(false);
        };

        let removed: i64 = conn.hdel(&key, token).await?;
        Ok(removed == 1 && expiry > to_millis(now))
    }

    async fn pool_size(&self, session_id: &str) -> SessionResult<usize> {
        let mut conn = self.conn.clone();
        let size: usize = conn.hlen(tokens_key(session_id)).await?;
        Ok(size)
    }

    async fn sweep_idle(&self, _cutoff: OffsetDateTime) -> SessionResult<usize> {
        // Key TTLs expire idle sessions server-side
        Ok(0)
    }
}
