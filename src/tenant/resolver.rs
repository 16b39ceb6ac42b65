use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::{Application, Target, TargetArgs, User};
use crate::repository::{Repository, RepositoryError, Stat};

/// Upper bound for every repository call made by the resolver.
pub const REPOSITORY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("No active user with supplied token")]
    UserNotFound,

    #[error("No active application with supplied token")]
    ApplicationNotFound,

    #[error("Target not found: {0}")]
    TargetNotFound(String),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl ResolveError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ResolveError::UserNotFound
                | ResolveError::ApplicationNotFound
                | ResolveError::TargetNotFound(_)
        )
    }
}

/// A target together with the merged argument map for one application.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTarget {
    pub target: Target,
    pub args: TargetArgs,
}

/// Stitches users, applications and targets together from a repository.
#[derive(Clone)]
pub struct Resolver {
    repository: Arc<dyn Repository>,
    timeout: Duration,
}

impl Resolver {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self {
            repository,
            timeout: REPOSITORY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    /// Bump an application counter, bounded like every other lookup.
    pub async fn increment_stat(&self, token: &str, stat: Stat) -> Result<(), RepositoryError> {
        self.bounded(self.repository.increment_stat(token, stat)).await
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<T, RepositoryError>
    where
        F: Future<Output = Result<T, RepositoryError>>,
    {
        tokio::time::timeout(self.timeout, operation)
            .await
            .map_err(|_| RepositoryError::Timeout(self.timeout))?
    }

    /// Ingestion side lookup. Disabled records count as missing unless the
    /// request came through the submission route.
    #[tracing::instrument(name = "resolver.by_token", skip(self, token))]
    pub async fn resolve_by_token(
        &self,
        token: &str,
        via_submit: bool,
    ) -> Result<(User, Application), ResolveError> {
        let user = match self.bounded(self.repository.get_user_from_token(token)).await {
            Ok(user) => user,
            Err(RepositoryError::NotFound) => return Err(ResolveError::UserNotFound),
            Err(e) => return Err(e.into()),
        };
        if !user.enable && !via_submit {
            return Err(ResolveError::UserNotFound);
        }

        let application = match self
            .bounded(self.repository.get_application(&user.key, token))
            .await
        {
            Ok(app) => app,
            Err(RepositoryError::NotFound) => return Err(ResolveError::ApplicationNotFound),
            Err(e) => return Err(e.into()),
        };
        if !application.enable && !via_submit {
            return Err(ResolveError::ApplicationNotFound);
        }

        Ok((user, application))
    }

    /// Worker side lookup. The enable flag is reported, not enforced.
    pub async fn resolve_application(
        &self,
        user_key: &str,
        token: &str,
    ) -> Result<Application, ResolveError> {
        match self
            .bounded(self.repository.get_application(user_key, token))
            .await
        {
            Ok(app) => Ok(app),
            Err(RepositoryError::NotFound) => Err(ResolveError::ApplicationNotFound),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn resolve_target(
        &self,
        application: &Application,
    ) -> Result<ResolvedTarget, ResolveError> {
        let target = match self
            .bounded(self.repository.get_target_by_id(&application.target))
            .await
        {
            Ok(target) => target,
            Err(RepositoryError::NotFound) => {
                return Err(ResolveError::TargetNotFound(application.target.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        let args = merge_target_args(&target, &application.target_args);
        Ok(ResolvedTarget { target, args })
    }
}

/// Overlay the application's arguments on the target's own arguments.
///
/// When `app_args` holds an object under the target id, that object is the
/// application's argument map; otherwise `app_args` is used as is.
pub fn merge_target_args(target: &Target, app_args: &TargetArgs) -> TargetArgs {
    let selected = match app_args.get(&target.id) {
        Some(serde_json::Value::Object(per_target)) => per_target,
        _ => app_args,
    };

    let mut merged = target.args.clone();
    for (key, value) in selected {
        merged.insert(key.clone(), value.clone());
    }
    merged
}
