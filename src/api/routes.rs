use axum::{
    routing::{get, post},
    Router,
};

use crate::server::AppState;

use super::handlers::{application_message, pushover_message, submit_message};
use super::health::{live, ready};
use super::metrics::prometheus_metrics;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        // Health & metrics
        .route("/_internal/health/live", get(live))
        .route("/_internal/health/ready", get(ready))
        .route("/metrics", get(prometheus_metrics))
        // Ingestion
        .route("/1/messages.json", post(pushover_message))
        .route("/_internal/submit/{token}", post(submit_message))
        .route("/{token}", post(application_message))
}
