// Shared infrastructure
pub mod config;
pub mod error;
pub mod metrics;
pub mod postgres;
pub mod repository;

// Domain
pub mod encryption;
pub mod format;
pub mod message;
pub mod targets;
pub mod tenant;

// Transport and dispatch
pub mod queue;
pub mod worker;

// Application layer
pub mod api;
pub mod server;

// Supporting modules
pub mod shutdown;
