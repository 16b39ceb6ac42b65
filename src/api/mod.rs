//! API layer - HTTP endpoint handlers.

mod handlers;
mod health;
mod metrics;
mod routes;

// Re-export all handlers for use in server/app.rs
pub use handlers::{application_message, pushover_message, submit_message};
pub use health::{live, ready, ComponentHealth, LiveResponse, ReadyResponse};
pub use metrics::prometheus_metrics;
pub use routes::api_routes;
