//! Configuration loaded from environment variables

use std::str::FromStr;

use crate::auth::tokens::DEFAULT_TOKEN_TTL;
use crate::websocket::DEFAULT_CHANNEL_TOKEN_TTL;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    /// PostgreSQL URL; in-memory users when unset
    pub database_url: Option<String>,
    pub run_migrations: bool,
    /// Redis URL; in-memory sessions when unset
    pub redis_url: Option<String>,
    /// Mark the session cookie `Secure` (serving over TLS)
    pub cookie_secure: bool,
    pub security_token_ttl: time::Duration,
    pub channel_token_ttl: std::time::Duration,
    /// Idle sessions expire after this long; disabled when `None`
    pub session_idle_timeout: Option<time::Duration>,
    pub allowed_origins: Vec<String>,
    /// Usernames granted the admin role at registration
    pub admin_usernames: Vec<String>,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            database_url: None,
            run_migrations: false,
            redis_url: None,
            cookie_secure: false,
            security_token_ttl: DEFAULT_TOKEN_TTL,
            channel_token_ttl: DEFAULT_CHANNEL_TOKEN_TTL,
            session_idle_timeout: None,
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
            admin_usernames: Vec::new(),
            log_format: LogFormat::Pretty,
        }
    }
}

fn parse<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        name,
        value: value.to_string(),
    })
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Config::default();

        if let Some(addr) = get("BIND_ADDRESS") {
            config.bind_address = addr;
        }
        config.database_url = get("DATABASE_URL");
        config.redis_url = get("REDIS_URL");

        if let Some(v) = get("RUN_MIGRATIONS") {
            config.run_migrations = parse("RUN_MIGRATIONS", &v)?;
        }
        if let Some(v) = get("COOKIE_SECURE") {
            config.cookie_secure = parse("COOKIE_SECURE", &v)?;
        }
        if let Some(v) = get("SECURITY_TOKEN_TTL_SECS") {
            let secs: u32 = parse("SECURITY_TOKEN_TTL_SECS", &v)?;
            config.security_token_ttl = time::Duration::seconds(i64::from(secs));
        }
        if let Some(v) = get("CHANNEL_TOKEN_TTL_SECS") {
            let secs: u32 = parse("CHANNEL_TOKEN_TTL_SECS", &v)?;
            config.channel_token_ttl = std::time::Duration::from_secs(u64::from(secs));
        }
        if let Some(v) = get("SESSION_IDLE_TIMEOUT_SECS") {
            let secs: u32 = parse("SESSION_IDLE_TIMEOUT_SECS", &v)?;
            config.session_idle_timeout =
                (secs > 0).then(|| time::Duration::seconds(i64::from(secs)));
        }
        if let Some(v) = get("ALLOWED_ORIGINS") {
            config.allowed_origins = parse_list(&v);
        }
        if let Some(v) = get("ADMIN_USERNAMES") {
            config.admin_usernames = parse_list(&v);
        }
        if let Some(v) = get("LOG_FORMAT") {
            config.log_format = parse("LOG_FORMAT", &v)?;
        }

        Ok(config)
    }
}
