//! API module
//!
//! HTTP API endpoints and middleware.

pub mod middleware;
pub mod routes;

use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::ledger::LedgerQueryService;
use crate::pipeline::PostingService;
use crate::store::Store;

pub use routes::create_router;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub posting: PostingService,
    pub ledger: LedgerQueryService,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, max_attempts: u32) -> Self {
        Self {
            posting: PostingService::new(store.clone(), max_attempts),
            ledger: LedgerQueryService::new(store.clone()),
            store,
        }
    }
}

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    // Layers run last-added first: correlation id -> logging -> handler
    let api_routes = create_router()
        .layer(axum::middleware::from_fn(middleware::logging_middleware))
        .layer(axum::middleware::from_fn(
            middleware::correlation_id_middleware,
        ));

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
