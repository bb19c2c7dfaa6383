use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audiorounds::{
    abuse::{self, RateLimiter},
    api,
    config::AppConfig,
    state::AppState,
    store::{self, KeyValueStore, MemoryStore},
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env var reads)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist, only log if it's a different issue
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audiorounds=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting audiorounds...");

    let config = AppConfig::from_env();

    let kv = match connect_store(&config).await {
        Ok(kv) => kv,
        Err(e) => {
            tracing::error!(error = %e, "Failed to connect to store");
            std::process::exit(1);
        }
    };
    tracing::info!(store = kv.name(), "Store ready");

    let state = Arc::new(AppState::new(kv, config.clone()));
    if let Err(e) = state.uploads.ensure_root().await {
        tracing::error!(error = %e, "Upload directory is not usable");
        std::process::exit(1);
    }

    let limiter = RateLimiter::from_config(&config.rate_limit);
    if let Some(limiter) = &limiter {
        abuse::spawn_cleanup(limiter.clone());
    }

    let app = api::router(state, limiter);

    let listener = match tokio::net::TcpListener::bind(config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %config.bind_addr, error = %e, "Failed to bind");
            std::process::exit(1);
        }
    };
    tracing::info!("Listening on http://{}", config.bind_addr);

    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    {
        tracing::error!(error = %e, "Server error");
    }
    tracing::info!("Shut down");
}

fn memory_store() -> Arc<dyn KeyValueStore> {
    let store = Arc::new(MemoryStore::new());
    store::spawn_expiry_sweeper(store.clone(), SWEEP_INTERVAL);
    store
}

#[cfg(feature = "redis")]
async fn connect_store(
    config: &AppConfig,
) -> Result<Arc<dyn KeyValueStore>, audiorounds::error::StoreError> {
    match &config.redis_url {
        Some(url) => Ok(Arc::new(store::RedisStore::connect(url).await?)),
        None => {
            tracing::warn!("REDIS_URL not set, using in-memory store");
            Ok(memory_store())
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn connect_store(
    config: &AppConfig,
) -> Result<Arc<dyn KeyValueStore>, audiorounds::error::StoreError> {
    if config.redis_url.is_some() {
        tracing::warn!("REDIS_URL is set but this build lacks the `redis` feature; using in-memory store");
    }
    Ok(memory_store())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
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
