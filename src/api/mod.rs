pub mod metrics;
mod rules;

use axum::{middleware, routing::get, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::CoreState;

pub fn create_router(state: Arc<CoreState>) -> Router {
    let api_routes = Router::new()
        .route("/rules/health", get(rules::list_rule_health))
        .route("/rules/health/:id", get(rules::get_rule_health));

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics::metrics_endpoint))
        .nest("/api/v1", api_routes)
        .layer(middleware::from_fn(metrics::metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
