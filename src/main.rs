mod api;
mod auth;
mod clamp;
mod config;
mod dispatcher;
mod errors;
mod es_client;
mod mcp_api;
mod models;
mod policy;
mod shaper;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use config::Config;
use dispatcher::Dispatcher;
use es_client::EsClient;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub dispatcher: Dispatcher,
}

pub fn app_state(config: Config) -> Result<AppState> {
    let client = EsClient::new(&config.es)?;
    let dispatcher = Dispatcher::new(client, config.policy);
    Ok(AppState { config, dispatcher })
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(api::healthz))
        .route("/readyz", get(api::readyz))
        .route("/mcp", post(mcp_api::mcp))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "es_mcp_governor=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    if config.mcp_api_key.is_none() {
        warn!("MCP_API_KEY not set; /mcp accepts unauthenticated requests");
    }
    if config.es.skip_tls_verify {
        warn!("ES_SSL_SKIP_VERIFY is on; Elasticsearch certificates are not verified");
    }

    let policy = config.policy;
    info!(
        es_url = %config.es.url,
        max_result_size = policy.max_result_size(),
        default_size = policy.default_size(),
        max_response_bytes = policy.max_response_bytes(),
        max_field_chars = policy.max_field_chars(),
        max_list_items = policy.max_list_items(),
        "Size policy loaded"
    );

    let bind_addr = config.bind_addr;
    let state = app_state(config)?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("es-mcp-governor listening on {}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
