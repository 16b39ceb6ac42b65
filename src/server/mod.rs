//! HTTP server wiring: shared state, middleware and the router.

mod app;
pub mod middleware;
mod state;

pub use app::create_app;
pub use middleware::{request_id, REQUEST_ID_HEADER};
pub use state::AppState;
