//! Repository provider factory

use std::sync::Arc;

use crate::config::Settings;
use crate::postgres::PostgresPool;

use super::postgres_repository::PostgresRepository;
use super::static_repository::StaticRepository;
use super::Repository;

/// Create the repository selected by configuration.
///
/// - `database.enabled = true` with a pool: `PostgresRepository`
/// - otherwise: `StaticRepository` built from `users` and `targets`
///
/// # Example
///
/// ```rust,ignore
/// let repository = create_repository(&settings, postgres_pool.clone());
/// ```
pub fn create_repository(
    settings: &Settings,
    postgres_pool: Option<PostgresPool>,
) -> Arc<dyn Repository> {
    match postgres_pool {
        Some(pool) if settings.database.enabled => {
            tracing::info!(
                provider = "postgres",
                url = %pool.database_url_masked(),
                "Creating PostgreSQL repository"
            );
            Arc::new(PostgresRepository::new(pool))
        }
        _ => {
            if settings.database.enabled {
                tracing::warn!(
                    "PostgreSQL repository requested but no pool provided, falling back to static configuration"
                );
            }
            tracing::info!(
                provider = "static",
                users = settings.users.len(),
                targets = settings.targets.len(),
                "Creating static repository"
            );
            Arc::new(StaticRepository::new(
                settings.users.clone(),
                settings.targets.clone(),
            ))
        }
    }
}
