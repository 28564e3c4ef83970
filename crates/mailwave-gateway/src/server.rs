//! HTTP server implementation using Axum.

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post, put},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use mailwave_core::config::GatewayConfig;
use mailwave_engine::{CampaignStore, Dispatcher};
use mailwave_queue::TaskQueue;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<CampaignStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub queue: Arc<dyn TaskQueue>,
    pub start_time: std::time::Instant,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    Router::new()
        .route("/health", get(routes_health))
        .route("/api/v1/campaigns", get(super::routes::list_campaigns))
        .route("/api/v1/campaigns", post(super::routes::create_campaign))
        .route("/api/v1/campaigns/{id}", get(super::routes::get_campaign))
        .route("/api/v1/campaigns/{id}", put(super::routes::update_campaign))
        .route(
            "/api/v1/campaigns/{id}",
            axum::routing::delete(super::routes::delete_campaign),
        )
        .route(
            "/api/v1/campaigns/{id}/send",
            post(super::routes::send_campaign),
        )
        .route(
            "/api/v1/campaigns/{id}/stop",
            post(super::routes::stop_campaign),
        )
        .route(
            "/api/v1/campaigns/{id}/reset",
            post(super::routes::reset_campaign),
        )
        .route(
            "/api/v1/campaigns/{id}/deliveries",
            get(super::routes::list_deliveries),
        )
        .layer(
            CorsLayer::new()
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::PUT,
                    axum::http::Method::DELETE,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers(Any)
                .allow_origin(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

async fn routes_health(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "service": "mailwave-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Start the HTTP server.
pub async fn start(config: &GatewayConfig, state: AppState) -> anyhow::Result<()> {
    let app = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🌐 Gateway listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
