// Stock Cards - Web Server
// REST API over one AggregationController with Axum

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stock_cards::{
    AggregationController, Config, HttpSource, RefreshOutcome, SessionState, SqliteCache,
    StockCard,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    controller: Arc<AggregationController>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }
}

impl ApiResponse<()> {
    fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: (),
            error: Some(message.into()),
        }
    }
}

#[derive(Deserialize)]
struct RefreshParams {
    #[serde(default)]
    offline: bool,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/state - Current session snapshot
async fn get_state(State(state): State<AppState>) -> Json<ApiResponse<SessionState>> {
    Json(ApiResponse::ok(state.controller.snapshot()))
}

/// POST /api/refresh?offline=bool - Run one refresh cycle
async fn refresh(
    State(state): State<AppState>,
    Query(params): Query<RefreshParams>,
) -> Json<ApiResponse<RefreshOutcome>> {
    let outcome = state.controller.refresh(!params.offline).await;
    Json(ApiResponse::ok(outcome))
}

/// POST /api/sort/:order - Reorder current results (asc | desc)
async fn sort(State(state): State<AppState>, Path(order): Path<String>) -> impl IntoResponse {
    let ascending = match order.to_lowercase().as_str() {
        "asc" => true,
        "desc" => false,
        other => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::error(format!("unknown sort order {:?}", other))),
            )
                .into_response()
        }
    };

    state.controller.sort(ascending);
    (StatusCode::OK, Json(ApiResponse::ok(state.controller.snapshot()))).into_response()
}

/// GET /api/stocks/:code - One card from the current results
async fn get_stock(State(state): State<AppState>, Path(code): Path<String>) -> impl IntoResponse {
    let snapshot = state.controller.snapshot();
    let found: Option<StockCard> = snapshot
        .results
        .into_iter()
        .find(|card| card.code.as_str() == code.trim());

    match found {
        Some(card) => (StatusCode::OK, Json(ApiResponse::ok(card))).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("no card for {}", code))),
        )
            .into_response(),
    }
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stock_cards=info,tower_http=info,warn")),
        )
        .init();

    let config = Config::from_env()?;

    let cache = Arc::new(
        SqliteCache::open(&config.db_path)
            .with_context(|| format!("Failed to open cache {}", config.db_path.display()))?,
    );
    let source = Arc::new(HttpSource::new(&config.base_url, config.fetch_timeout)?);
    let controller = Arc::new(
        AggregationController::new(source, cache).with_fetch_timeout(config.fetch_timeout),
    );

    // First load runs in the background; /api/state shows loading meanwhile
    controller.spawn_initialize(true);

    let state = AppState { controller };

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/state", get(get_state))
        .route("/refresh", post(refresh))
        .route("/sort/:order", post(sort))
        .route("/stocks/:code", get(get_stock))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    );

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "server running");
    axum::serve(listener, app).await?;

    Ok(())
}
