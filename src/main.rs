use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, routing::get, routing::post};
use clickhouse::Client;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use wide_trace_api::config::WideConfig;
use wide_trace_api::dispatcher::Dispatcher;
use wide_trace_api::event_store::EventStore;
use wide_trace_api::handlers;
use wide_trace_api::migrations;
use wide_trace_api::oltp_store::OltpStore;
use wide_trace_api::supervisor::TaskSupervisor;
use wide_trace_api::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wide_trace_api=debug,tower_http=debug")),
        )
        .init();

    let clickhouse_url = std::env::var("CLICKHOUSE_URL").unwrap_or_else(|_| "http://localhost:8123".to_string());
    let clickhouse_db = std::env::var("CLICKHOUSE_DATABASE").unwrap_or_else(|_| "wide_events".to_string());
    let clickhouse_user = std::env::var("CLICKHOUSE_USER").unwrap_or_else(|_| "default".to_string());
    let clickhouse_password = std::env::var("CLICKHOUSE_PASSWORD").unwrap_or_default();

    let ch = Client::default()
        .with_url(&clickhouse_url)
        .with_database(&clickhouse_db)
        .with_user(&clickhouse_user)
        .with_password(&clickhouse_password);

    migrations::run(&ch).await?;

    let oltp_path = std::env::var("WIDE_OLTP_DB").unwrap_or_else(|_| "./wide_oltp.db".to_string());
    let oltp = Arc::new(OltpStore::open(&oltp_path)?);
    tracing::info!("OLTP store opened at {oltp_path}");

    let credential_secret = match std::env::var("WIDE_CREDENTIAL_SECRET") {
        Ok(secret) => secret,
        Err(_) => {
            tracing::warn!("WIDE_CREDENTIAL_SECRET not set, using an insecure development default");
            "insecure-development-secret".to_string()
        }
    };

    let redis_url = std::env::var("WIDE_REDIS_URL").ok();
    let dispatcher = Arc::new(Dispatcher::connect(redis_url.as_deref()).await);

    let analysis_service_url = std::env::var("WIDE_ANALYSIS_SERVICE_URL").ok().map(Arc::new);

    let config_path = std::env::var("WIDE_CONFIG_FILE").unwrap_or_else(|_| "./wide.toml".to_string());
    let config = Arc::new(WideConfig::load(&config_path)?);

    let event_store = Arc::new(EventStore::new(ch.clone()));
    let supervisor = Arc::new(TaskSupervisor::new());

    let state = AppState {
        ch,
        event_store,
        oltp,
        dispatcher,
        supervisor: supervisor.clone(),
        config,
        credential_secret: Arc::new(credential_secret),
        analysis_service_url,
        http_client: reqwest::Client::new(),
    };

    let app = Router::new()
        .route("/api/v1/events/ingest", post(handlers::ingest::ingest))
        .route("/api/v1/traces", get(handlers::traces::list_traces))
        .route("/api/v1/traces/{trace_id}", get(handlers::traces::get_trace))
        .route("/api/v1/analysis/analyze", post(handlers::analysis::analyze))
        .route("/api/v1/analysis/queue/stats", get(handlers::analysis::queue_stats))
        .route("/health", get(handlers::health::healthz))
        .route("/health/detailed", get(handlers::health::healthz_detailed))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));
    tracing::info!("wide-trace-api listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    supervisor.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
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
    tracing::info!("shutdown signal received, draining supervised tasks");
}
