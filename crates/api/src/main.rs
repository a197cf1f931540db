//! WalletGuard API Server

use std::{net::SocketAddr, sync::Arc};

use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::middleware;
use tokio::time::{interval, Duration};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use walletguard_api::{
    auth::{RedisSessionBackend, SessionStore, SECURITY_TOKEN_HEADER},
    config::LogFormat,
    create_router,
    security::security_headers_middleware,
    AppState, Config,
};
use walletguard_shared::{create_pool, run_migrations, InMemoryUserStore, PgUserStore, UserStore};

/// How often idle sessions are swept from the in-memory backend
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    init_tracing(config.log_format);

    tracing::info!("Starting WalletGuard API Server v{}", env!("CARGO_PKG_VERSION"));

    let users: Arc<dyn UserStore> = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to database...");
            let pool = create_pool(url).await?;
            if config.run_migrations {
                run_migrations(&pool).await?;
                tracing::info!("Database migrations applied");
            }
            Arc::new(PgUserStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set - users are kept in memory");
            Arc::new(InMemoryUserStore::new())
        }
    };

    let sessions = match &config.redis_url {
        Some(url) => {
            let backend = RedisSessionBackend::connect(url, config.session_idle_timeout).await?;
            SessionStore::new(Arc::new(backend), config.session_idle_timeout)
        }
        None => {
            tracing::warn!("REDIS_URL not set - sessions are kept in memory");
            SessionStore::in_memory(config.session_idle_timeout)
        }
    };

    let state = AppState::new(config.clone(), users, sessions.clone());

    if config.session_idle_timeout.is_some() {
        tokio::spawn(idle_sweep_task(sessions));
        tracing::info!("Idle session sweeper started");
    }

    let allowed_origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    tracing::info!(
        allowed_origins = ?allowed_origins,
        "CORS configured with {} allowed origins",
        allowed_origins.len()
    );

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::ORIGIN,
            HeaderName::from_static(SECURITY_TOKEN_HEADER),
        ])
        .expose_headers([header::CONTENT_TYPE])
        .allow_credentials(true);

    let app = create_router(state)
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,walletguard_api=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Periodically expire sessions that have been idle too long
async fn idle_sweep_task(sessions: SessionStore) {
    let mut interval = interval(IDLE_SWEEP_INTERVAL);
    interval.tick().await; // nothing to sweep at startup

    loop {
        interval.tick().await;
        match sessions.sweep_idle().await {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(removed, "Idle sessions swept"),
            Err(e) => tracing::error!(error = ?e, "Idle session sweep failed"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = ?e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
