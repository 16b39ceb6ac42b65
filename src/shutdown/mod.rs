//! Graceful shutdown handling for the relay.
//!
//! This module provides coordinated shutdown functionality that:
//! 1. Signals the HTTP server and the queue consumer to stop taking work
//! 2. Waits for the consumer to drain its in-flight tasks
//! 3. Shuts down every delivery target
//! 4. Closes the repository (database pool)

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::queue::ConsumerReport;
use crate::repository::Repository;
use crate::targets::TargetRegistry;

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for the consumer to finish, on top of its own grace period
    pub consumer_timeout: Duration,
    /// Time to wait for all targets to shut down (default: 10 seconds)
    pub targets_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            consumer_timeout: Duration::from_secs(20),
            targets_timeout: Duration::from_secs(10),
        }
    }
}

impl ShutdownConfig {
    /// Derive the consumer wait from the worker grace period.
    pub fn for_grace_period(grace: Duration) -> Self {
        Self {
            consumer_timeout: grace + Duration::from_secs(5),
            ..Self::default()
        }
    }
}

/// Outcome of a shutdown sequence
#[derive(Debug, Default)]
pub struct ShutdownResult {
    pub success: bool,
    pub consumer: Option<ConsumerReport>,
    pub targets_stopped: bool,
    pub duration: Duration,
}

/// Handles graceful shutdown of the relay
pub struct GracefulShutdown {
    registry: Arc<TargetRegistry>,
    repository: Arc<dyn Repository>,
    shutdown_tx: broadcast::Sender<()>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(
        registry: Arc<TargetRegistry>,
        repository: Arc<dyn Repository>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self::with_config(registry, repository, shutdown_tx, ShutdownConfig::default())
    }

    pub fn with_config(
        registry: Arc<TargetRegistry>,
        repository: Arc<dyn Repository>,
        shutdown_tx: broadcast::Sender<()>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            registry,
            repository,
            shutdown_tx,
            config,
        }
    }

    /// Execute graceful shutdown sequence
    #[tracing::instrument(name = "graceful_shutdown", skip(self, consumer))]
    pub async fn execute(
        &self,
        reason: &str,
        consumer: Option<JoinHandle<ConsumerReport>>,
    ) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        // Phase 1: Stop accepting work
        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Signaling tasks to stop");
        let _ = self.shutdown_tx.send(());

        // Phase 2: Wait for the consumer to drain
        if let Some(handle) = consumer {
            tracing::info!("Phase 2: Waiting for queue consumer");
            result.consumer = self.wait_for_consumer(handle).await;
        }

        // Phase 3: Shut down delivery targets
        tracing::info!(targets = self.registry.len(), "Phase 3: Shutting down targets");
        result.targets_stopped = match timeout(self.config.targets_timeout, self.registry.shutdown_all()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Some targets failed to shut down");
                false
            }
            Err(_) => {
                tracing::warn!("Target shutdown timed out");
                false
            }
        };

        // Phase 4: Close persistence
        tracing::info!(repository = self.repository.name(), "Phase 4: Closing repository");
        self.repository.close().await;

        result.duration = start.elapsed();
        result.success = result.targets_stopped
            && result.consumer.as_ref().map_or(true, |report| report.aborted == 0);

        tracing::info!(
            success = result.success,
            targets_stopped = result.targets_stopped,
            duration_ms = result.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );

        result
    }

    async fn wait_for_consumer(&self, mut handle: JoinHandle<ConsumerReport>) -> Option<ConsumerReport> {
        match timeout(self.config.consumer_timeout, &mut handle).await {
            Ok(Ok(report)) => {
                tracing::info!(
                    started = report.started,
                    aborted = report.aborted,
                    "Queue consumer drained"
                );
                Some(report)
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Queue consumer task failed");
                None
            }
            Err(_) => {
                tracing::warn!("Queue consumer did not stop in time, aborting");
                handle.abort();
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::queue::{
        ConsumerConfig, MemoryTaskQueue, QueueConsumer, Task, TaskFailure, TaskHandler, TaskQueue,
    };
    use crate::repository::{RepositoryError, Stat, StaticRepository};
    use crate::targets::{Backend, BackendError, LifecycleState, TargetKind};
    use crate::tenant::{Application, Target, TargetArgs, User};
    use async_trait::async_trait;

    struct IdleBackend;

    #[async_trait]
    impl Backend for IdleBackend {
        fn kind(&self) -> TargetKind {
            TargetKind::Apprise
        }

        async fn load(&mut self) -> Result<(), BackendError> {
            Ok(())
        }

        async fn run(&mut self) -> Result<(), BackendError> {
            Ok(())
        }

        async fn execute(&mut self, _message: &Message, _args: &TargetArgs) -> Result<(), BackendError> {
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<(), BackendError> {
            Ok(())
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl TaskHandler for SlowHandler {
        async fn handle(&self, _task: &Task) -> Result<(), TaskFailure> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        }
    }

    async fn create_test_registry() -> Arc<TargetRegistry> {
        let registry = TargetRegistry::with_backends(vec![(
            "idle".to_string(),
            Box::new(IdleBackend) as Box<dyn Backend>,
        )]);
        registry.load_all().await.unwrap();
        registry.run_all().await.unwrap();
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_shutdown_sequence() {
        let registry = create_test_registry().await;
        let repository: Arc<dyn Repository> = Arc::new(StaticRepository::new(vec![], vec![]));
        let queue = Arc::new(MemoryTaskQueue::new());
        queue.enqueue(Task::message("{}".to_string())).await.unwrap();

        let (shutdown_tx, _) = broadcast::channel(1);
        let consumer = QueueConsumer::new(
            queue.clone(),
            Arc::new(SlowHandler),
            ConsumerConfig {
                poll_interval: Duration::from_millis(5),
                ..ConsumerConfig::default()
            },
        );
        let shutdown_rx = shutdown_tx.subscribe();
        let handle = tokio::spawn(async move { consumer.run(shutdown_rx).await });

        while queue.stats().await.unwrap().pending > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let shutdown = GracefulShutdown::new(registry.clone(), repository, shutdown_tx);
        let result = shutdown.execute("test", Some(handle)).await;

        assert!(result.success);
        assert!(result.targets_stopped);
        assert_eq!(result.consumer.unwrap().started, 1);
        assert_eq!(registry.state("idle").await, Some(LifecycleState::Shutdown));
        assert_eq!(queue.stats().await.unwrap().inflight, 0);
    }

    #[tokio::test]
    async fn test_shutdown_without_consumer() {
        let registry = create_test_registry().await;
        let repository: Arc<dyn Repository> = Arc::new(StaticRepository::new(vec![], vec![]));
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let shutdown = GracefulShutdown::new(registry, repository, shutdown_tx);
        let result = shutdown.execute("signal", None).await;

        assert!(result.success);
        assert!(result.consumer.is_none());
        assert!(shutdown_rx.try_recv().is_ok());
    }

    /// Records whether the sequence released the repository.
    struct ClosingRepository {
        inner: StaticRepository,
        closed: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Repository for ClosingRepository {
        fn name(&self) -> &'static str {
            "closing"
        }

        async fn get_user_from_token(&self, token: &str) -> Result<User, RepositoryError> {
            self.inner.get_user_from_token(token).await
        }

        async fn get_application(&self, user_key: &str, token: &str) -> Result<Application, RepositoryError> {
            self.inner.get_application(user_key, token).await
        }

        async fn get_targets(&self) -> Result<Vec<Target>, RepositoryError> {
            self.inner.get_targets().await
        }

        async fn get_target_by_id(&self, id: &str) -> Result<Target, RepositoryError> {
            self.inner.get_target_by_id(id).await
        }

        async fn increment_stat(&self, token: &str, stat: Stat) -> Result<(), RepositoryError> {
            self.inner.increment_stat(token, stat).await
        }

        async fn save_input(&self, token: &str, dump: &str) -> Result<(), RepositoryError> {
            self.inner.save_input(token, dump).await
        }

        async fn close(&self) {
            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_startup_failure_releases_targets_and_repository() {
        // a failed startup step runs the sequence before any consumer exists
        let registry = create_test_registry().await;
        let repository = Arc::new(ClosingRepository {
            inner: StaticRepository::new(vec![], vec![]),
            closed: Default::default(),
        });
        let (shutdown_tx, _) = broadcast::channel(1);

        let shutdown = GracefulShutdown::new(registry.clone(), repository.clone(), shutdown_tx);
        let result = shutdown.execute("queue unavailable", None).await;

        assert!(result.success);
        assert_eq!(registry.state("idle").await, Some(LifecycleState::Shutdown));
        assert!(repository.closed.load(std::sync::atomic::Ordering::SeqCst));
    }
}
