use axum::{
    routing::{get, post},
    Router,
};
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kirogate_server::{
    auth::Authenticator,
    caches::{BlockedIpCache, IpConfigCache, OnlineTracker, SettingsCache, CACHE_TTL},
    coordinator::Gateway,
    db, handlers, health, jobs, metrics,
    pool::AccountPool,
    ratelimit::{self, RateLimiters},
    refresh::TokenRefresher,
    upstream::{UpstreamClient, UpstreamConfig},
    writeback::WritePipeline,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing with production-safe defaults
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            "debug".to_string()
        }

        #[cfg(not(debug_assertions))]
        {
            "warn".to_string()
        }
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("Starting Kirogate server");

    // Initialize metrics
    let metrics_recorder = metrics::MetricsRecorder::new();
    let metrics_handle = metrics_recorder.handle().clone();
    tracing::info!("Metrics initialized");

    // Initialize database
    let db_pool = db::init_db_default().await?;
    tracing::info!("Database initialized");

    let cancel = CancellationToken::new();

    // Config caches and trackers
    let settings = Arc::new(SettingsCache::new(db_pool.clone(), CACHE_TTL));
    let blocked_ips = Arc::new(BlockedIpCache::new(db_pool.clone(), CACHE_TTL));
    let ip_configs = Arc::new(IpConfigCache::new(db_pool.clone(), CACHE_TTL));
    let online = Arc::new(OnlineTracker::new());

    // Rate limiters plus their 5-minute cleanup sweep
    let limiters = Arc::new(RateLimiters::default());
    tokio::spawn(ratelimit::run_cleanup_worker(
        limiters.clone(),
        cancel.clone(),
    ));
    tracing::info!("Rate limiter cleanup worker started");

    // Upstream client and token refresher
    let upstream = Arc::new(UpstreamClient::new(UpstreamConfig::from_env())?);
    let refresher = Arc::new(TokenRefresher::new(db_pool.clone(), upstream.clone()));

    // Account pool with periodic snapshot refresh
    let account_pool = Arc::new(AccountPool::new(db_pool.clone(), settings.clone()));
    if let Err(e) = account_pool.refresh().await {
        tracing::warn!(error = ?e, "initial account pool refresh failed");
    }
    tokio::spawn(kirogate_server::pool::run_refresh_worker(
        account_pool.clone(),
        cancel.clone(),
    ));
    tracing::info!(accounts = account_pool.len(), "Account pool initialized");

    // Background token sweep and quota sync
    tokio::spawn(jobs::run_token_sweep_worker(
        db_pool.clone(),
        settings.clone(),
        refresher.clone(),
        cancel.clone(),
    ));
    tokio::spawn(jobs::run_quota_sync_worker(
        db_pool.clone(),
        settings.clone(),
        upstream.clone(),
        account_pool.clone(),
        cancel.clone(),
    ));
    tracing::info!("Background account workers started");

    // Asynchronous write pipeline
    let writeback = WritePipeline::start(db_pool.clone());

    // Authentication
    let admin_keys = Authenticator::admin_keys_from_env();
    tracing::info!(
        admin_keys_configured = admin_keys.len(),
        "Authentication configured"
    );
    let auth = Arc::new(Authenticator::new(db_pool.clone(), admin_keys));

    let max_attempts = std::env::var("GATEWAY_MAX_ATTEMPTS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(3)
        .max(1);
    let strict_sse = matches!(
        std::env::var("STRICT_SSE").as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE")
    );
    let model_map: HashMap<String, String> = Gateway::model_map_from_env();

    let gateway = Arc::new(Gateway {
        db: db_pool.clone(),
        settings,
        blocked_ips,
        ip_configs,
        online,
        limiters,
        pool: account_pool,
        refresher,
        upstream,
        writeback: writeback.clone(),
        auth,
        model_map,
        max_attempts,
        strict_sse,
    });

    // Only expose metrics when explicitly enabled
    let metrics_router = if matches!(
        std::env::var("ENABLE_METRICS").as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES")
    ) {
        Router::new()
            .route("/metrics", get(metrics::metrics_handler))
            .with_state(metrics_handle)
    } else {
        Router::new()
    };

    let app = Router::new()
        // Health check endpoints
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        // Chat surfaces
        .route("/v1/messages", post(handlers::messages))
        .route("/v1/messages/count_tokens", post(handlers::count_tokens))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/unified", post(handlers::unified))
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(gateway);

    let port = std::env::var("SERVER_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse::<u16>()
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown_cancel = cancel.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        shutdown_cancel.cancel();
    })
    .await?;

    // Stop background workers, then drain the write queues (bounded).
    cancel.cancel();
    tracing::info!("Draining write pipeline");
    writeback.shutdown().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");

    // small grace period so in-flight responses can flush
    tokio::time::sleep(Duration::from_millis(100)).await;
}
