//! Storage abstraction for tenant records and per-application statistics.
//!
//! Two providers implement [`Repository`]:
//!
//! - `StaticRepository`: users and targets declared in the configuration file
//! - `PostgresRepository`: tables in PostgreSQL (see `sql/schema.sql`)
//!
//! Use `create_repository()` to build the provider selected by configuration.

mod factory;
pub mod postgres_repository;
pub mod static_repository;

pub use factory::create_repository;
pub use postgres_repository::PostgresRepository;
pub use static_repository::StaticRepository;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::tenant::{Application, Target, User};

/// Errors that can occur during repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// No row matched the lookup
    #[error("Record not found")]
    NotFound,

    /// The call did not complete in time
    #[error("Repository call timed out after {0:?}")]
    Timeout(Duration),

    /// PostgreSQL operation failed
    #[error("PostgreSQL error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored data could not be decoded
    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    /// Provider is temporarily unavailable
    #[error("Repository unavailable: {0}")]
    Unavailable(String),
}

impl RepositoryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RepositoryError::NotFound)
    }
}

/// Per-application counters that may be incremented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stat {
    Received,
    Processed,
    Sent,
}

impl Stat {
    /// Backing column name. Only these three columns are ever written.
    pub fn column(&self) -> &'static str {
        match self {
            Stat::Received => "stat_received",
            Stat::Processed => "stat_processed",
            Stat::Sent => "stat_sent",
        }
    }
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stat::Received => write!(f, "received"),
            Stat::Processed => write!(f, "processed"),
            Stat::Sent => write!(f, "sent"),
        }
    }
}

/// Lookup interface used by ingestion and dispatch.
///
/// Implementations must be thread-safe (`Send + Sync`); one instance is
/// shared by the HTTP handlers and every worker task. Missing rows are
/// reported as `RepositoryError::NotFound`, never as an empty record.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &'static str;

    /// Find the user owning the application identified by `token`.
    async fn get_user_from_token(&self, token: &str) -> Result<User, RepositoryError>;

    /// Find the application `token` belonging to `user_key`.
    async fn get_application(
        &self,
        user_key: &str,
        token: &str,
    ) -> Result<Application, RepositoryError>;

    /// Every configured target, enabled or not.
    async fn get_targets(&self) -> Result<Vec<Target>, RepositoryError>;

    async fn get_target_by_id(&self, id: &str) -> Result<Target, RepositoryError>;

    /// Increment one counter of the application identified by `token`.
    async fn increment_stat(&self, token: &str, stat: Stat) -> Result<(), RepositoryError>;

    /// Record a raw request dump for the application identified by `token`.
    async fn save_input(&self, token: &str, dump: &str) -> Result<(), RepositoryError>;

    /// Check the provider can serve requests.
    async fn health_check(&self) -> Result<(), RepositoryError> {
        Ok(())
    }

    /// Release held resources.
    async fn close(&self) {}
}
