use axum::{
    extract::FromRef,
    routing::get,
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chat_hub::auth::{Authenticator, JwtAuthenticator};
use chat_hub::config::Config;
use chat_hub::hub::{Hub, HubHandle};
use chat_hub::persistence::memory::InMemoryStore;
use chat_hub::persistence::sqlx_store::{DbConfig, PostgresStore};
use chat_hub::persistence::Persistence;
use chat_hub::upgrade::{ws_upgrade, UpgradeState};
use chat_hub::{health, metrics, middleware};

#[derive(Clone, FromRef)]
struct AppState {
    hub: HubHandle,
    persistence: Arc<dyn Persistence>,
    authenticator: Arc<dyn Authenticator>,
    config: Arc<Config>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(Config::log_level()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("starting chat hub");

    let config = Arc::new(Config::from_env());

    let metrics_recorder = metrics::MetricsRecorder::new();
    let metrics_handle = metrics_recorder.handle().clone();
    tracing::info!("metrics initialized");

    let persistence: Arc<dyn Persistence> = if std::env::var("USE_IN_MEMORY_STORE")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
    {
        tracing::warn!("USE_IN_MEMORY_STORE is set; persistence is process-memory only");
        Arc::new(InMemoryStore::new())
    } else {
        let db_config = DbConfig::from_url(config.database_url.clone());
        Arc::new(PostgresStore::connect(db_config).await?)
    };
    tracing::info!("persistence initialized");

    let (hub, hub_handle) = Hub::new(persistence.clone(), config.hub_channel_capacity);
    tokio::spawn(hub.run());
    tracing::info!("hub loop started");

    let authenticator: Arc<dyn Authenticator> = Arc::new(JwtAuthenticator::new(&config.jwt_secret));

    let app_state = AppState {
        hub: hub_handle.clone(),
        persistence: persistence.clone(),
        authenticator: authenticator.clone(),
        config: config.clone(),
    };

    let upgrade_state = UpgradeState {
        hub: hub_handle,
        authenticator,
        persistence,
        config: config.clone(),
    };

    let metrics_router = if config.enable_metrics {
        Router::new()
            .route("/metrics", get(metrics::metrics_handler))
            .with_state(metrics_handle)
    } else {
        Router::new()
    };

    let health_router = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .with_state(app_state);

    let ws_router = Router::new()
        .route("/api/v1/ws", get(ws_upgrade))
        .with_state(upgrade_state);

    let app = health_router
        .merge(ws_router)
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(middleware::logging::log_requests_middleware))
        .layer(axum::middleware::from_fn(metrics::track_request_metrics));

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.server_port));
    tracing::info!(%addr, "server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
