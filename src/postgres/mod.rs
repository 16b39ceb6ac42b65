//! PostgreSQL connection management.

mod pool;

pub use pool::{PostgresPool, PostgresPoolError};
