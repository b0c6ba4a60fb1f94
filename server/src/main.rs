use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use para_ws_server::auth::JwtVerifier;
use para_ws_server::config::Config;
use para_ws_server::notifier::{InMemoryNotifier, Notifier, RedisNotifier};
use para_ws_server::{db, health, metrics, middleware, realtime, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

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

    tracing::info!("starting duplex session server");

    let config = Config::from_env()?;

    let metrics_recorder = metrics::MetricsRecorder::new();
    let metrics_handle = metrics_recorder.handle().clone();
    tracing::info!("metrics initialized");

    let db_config = db::DbConfig {
        database_url: config.database_url.clone(),
        max_connections: config.db_max_connections,
        min_connections: config.db_min_connections,
        ..db::DbConfig::default()
    };
    let db_pool = db::init_db(db_config).await?;
    tracing::info!("database initialized");

    let notifier: Arc<dyn Notifier> = match &config.redis_url {
        Some(url) => {
            let redis_notifier = RedisNotifier::connect(url)
                .await
                .map_err(|e| anyhow::anyhow!("failed to connect to redis: {e}"))?;
            tracing::info!("using redis notifier binding");
            Arc::new(redis_notifier)
        }
        None => {
            tracing::warn!(
                "REDIS_URL not set; falling back to an in-process notifier, \
                 which only fans out within this single server instance"
            );
            Arc::new(InMemoryNotifier::new())
        }
    };

    let jwt = Arc::new(JwtVerifier::new(config.jwt_secret.clone()));

    let state = AppState {
        db: db_pool,
        notifier,
        jwt,
        config: Arc::new(config.clone()),
    };

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
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/ws/v1", get(realtime::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(
            middleware::logging::log_headers_middleware,
        ))
        .layer(axum::middleware::from_fn(metrics::track_request_metrics))
        .with_state(state)
        .merge(metrics_router);

    tracing::info!(addr = %config.bind_addr, "listening");
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
