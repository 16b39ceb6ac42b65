//! Repository backed by the users and targets declared in configuration.
//!
//! Statistics and raw inputs are not recorded by this provider.

use std::collections::HashMap;

use async_trait::async_trait;

use super::{Repository, RepositoryError, Stat};
use crate::tenant::{Application, Target, User};

pub struct StaticRepository {
    users: Vec<User>,
    targets: Vec<Target>,
    /// application token -> index into `users`
    token_index: HashMap<String, usize>,
}

impl StaticRepository {
    pub fn new(users: Vec<User>, targets: Vec<Target>) -> Self {
        let mut token_index = HashMap::new();
        for (position, user) in users.iter().enumerate() {
            for app in &user.applications {
                if token_index.insert(app.token.clone(), position).is_some() {
                    tracing::warn!(token = %app.token, "Duplicate application token in configuration");
                }
            }
        }

        tracing::debug!(
            users = users.len(),
            targets = targets.len(),
            "Static repository loaded"
        );

        Self {
            users,
            targets,
            token_index,
        }
    }
}

#[async_trait]
impl Repository for StaticRepository {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn get_user_from_token(&self, token: &str) -> Result<User, RepositoryError> {
        self.token_index
            .get(token)
            .and_then(|position| self.users.get(*position))
            .cloned()
            .ok_or(RepositoryError::NotFound)
    }

    async fn get_application(
        &self,
        user_key: &str,
        token: &str,
    ) -> Result<Application, RepositoryError> {
        self.users
            .iter()
            .filter(|user| user.key == user_key)
            .find_map(|user| user.application(token))
            .cloned()
            .ok_or(RepositoryError::NotFound)
    }

    async fn get_targets(&self) -> Result<Vec<Target>, RepositoryError> {
        Ok(self.targets.clone())
    }

    async fn get_target_by_id(&self, id: &str) -> Result<Target, RepositoryError> {
        self.targets
            .iter()
            .find(|target| target.id == id)
            .cloned()
            .ok_or(RepositoryError::NotFound)
    }

    async fn increment_stat(&self, _token: &str, _stat: Stat) -> Result<(), RepositoryError> {
        Ok(())
    }

    async fn save_input(&self, _token: &str, _dump: &str) -> Result<(), RepositoryError> {
        Ok(())
    }
}
