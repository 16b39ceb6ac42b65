//! Liveness and readiness endpoints.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::queue::QueueStats;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct LiveResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub status: String,
    pub repository: ComponentHealth,
    pub queue: ComponentHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_stats: Option<QueueStats>,
}

#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// GET /_internal/health/live
pub async fn live() -> Json<LiveResponse> {
    Json(LiveResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /_internal/health/ready
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let repository = match state.repository.health_check().await {
        Ok(()) => ComponentHealth {
            name: state.repository.name().to_string(),
            healthy: true,
            error: None,
        },
        Err(e) => ComponentHealth {
            name: state.repository.name().to_string(),
            healthy: false,
            error: Some(e.to_string()),
        },
    };

    let (queue, queue_stats) = match state.queue.stats().await {
        Ok(stats) => (
            ComponentHealth {
                name: state.queue.backend_name().to_string(),
                healthy: true,
                error: None,
            },
            Some(stats),
        ),
        Err(e) => (
            ComponentHealth {
                name: state.queue.backend_name().to_string(),
                healthy: false,
                error: Some(e.to_string()),
            },
            None,
        ),
    };

    let healthy = repository.healthy && queue.healthy;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyResponse {
            status: if healthy { "ready" } else { "degraded" }.to_string(),
            repository,
            queue,
            queue_stats,
        }),
    )
}
