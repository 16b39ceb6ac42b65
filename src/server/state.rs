use std::sync::Arc;

use crate::config::Settings;
use crate::queue::TaskQueue;
use crate::repository::Repository;
use crate::tenant::Resolver;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub repository: Arc<dyn Repository>,
    pub resolver: Resolver,
    pub queue: Arc<dyn TaskQueue>,
}

impl AppState {
    pub fn new(
        settings: Settings,
        repository: Arc<dyn Repository>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        let resolver = Resolver::new(repository.clone());

        Self {
            settings: Arc::new(settings),
            repository,
            resolver,
            queue,
        }
    }
}
