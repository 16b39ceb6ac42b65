//! Dispatch worker: turns a queued message into a delivery.
//!
//! Per task: deserialize, resolve the application and its target, apply
//! the encryption policy, then execute through the target registry. The
//! worker never retries on its own; it classifies failures and the queue
//! transport decides what happens next.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::encryption::{encrypt_message, EncryptionError};
use crate::message::Message;
use crate::metrics::DispatchMetrics;
use crate::queue::{Task, TaskFailure, TaskHandler};
use crate::repository::Stat;
use crate::targets::{RegistryError, TargetKind, TargetRegistry, UnsupportedTargetType};
use crate::tenant::{ResolveError, Resolver};

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Malformed task: {0}")]
    Malformed(String),

    #[error("Resolution failed: {0}")]
    Resolution(#[from] ResolveError),

    #[error("Encryption failed: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("Delivery failed: {0}")]
    Delivery(#[from] RegistryError),

    #[error(transparent)]
    UnsupportedKind(#[from] UnsupportedTargetType),
}

impl TaskError {
    /// Transient failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Resolution(_) | TaskError::Delivery(_))
    }
}

impl From<TaskError> for TaskFailure {
    fn from(err: TaskError) -> Self {
        if err.is_retryable() {
            TaskFailure::Retry(err.to_string())
        } else {
            TaskFailure::Fatal(err.to_string())
        }
    }
}

/// Why a message was dropped without delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ApplicationMissing,
    ApplicationDisabled,
    TargetMissing,
    TargetDisabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Delivered,
    Skipped(SkipReason),
}

/// Counters kept by one worker instance.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub delivered: AtomicU64,
    pub skipped: AtomicU64,
    pub failed: AtomicU64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub delivered: u64,
    pub skipped: u64,
    pub failed: u64,
}

pub struct DispatchWorker {
    resolver: Resolver,
    registry: Arc<TargetRegistry>,
    stats: WorkerStats,
}

impl DispatchWorker {
    pub fn new(resolver: Resolver, registry: Arc<TargetRegistry>) -> Self {
        Self {
            resolver,
            registry,
            stats: WorkerStats::default(),
        }
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Deliver one message.
    #[tracing::instrument(
        name = "worker.process",
        skip(self, message),
        fields(token = %message.token, via_submit = message.is_via_submit())
    )]
    pub async fn process(&self, mut message: Message) -> Result<TaskOutcome, TaskError> {
        let via_submit = message.is_via_submit();

        let application = match self
            .resolver
            .resolve_application(&message.user, &message.token)
            .await
        {
            Ok(app) => app,
            Err(e) if e.is_not_found() && via_submit => {
                return Ok(TaskOutcome::Skipped(SkipReason::ApplicationMissing))
            }
            Err(e) => return Err(e.into()),
        };

        if !application.enable {
            tracing::debug!("Application disabled, dropping message");
            return Ok(TaskOutcome::Skipped(SkipReason::ApplicationDisabled));
        }

        let resolved = match self.resolver.resolve_target(&application).await {
            Ok(resolved) => resolved,
            Err(e) if e.is_not_found() && via_submit => {
                return Ok(TaskOutcome::Skipped(SkipReason::TargetMissing))
            }
            Err(e) => return Err(e.into()),
        };

        if !resolved.target.enable {
            tracing::debug!(target_id = %resolved.target.id, "Target disabled, dropping message");
            return Ok(TaskOutcome::Skipped(SkipReason::TargetDisabled));
        }

        resolved.target.kind.parse::<TargetKind>()?;

        if encrypt_message(&mut message, &application.encryption_policy())? {
            tracing::debug!(encryption = %application.encryption_type, "Message encrypted");
        }

        self.registry
            .execute(&resolved.target.id, &message, &resolved.args)
            .await?;

        if !via_submit {
            if let Err(e) = self.resolver.increment_stat(&message.token, Stat::Sent).await {
                tracing::warn!(error = %e, "Failed to record sent stat");
            }
        }

        Ok(TaskOutcome::Delivered)
    }

    fn decode(task: &Task) -> Result<Message, TaskError> {
        if task.kind != Task::MESSAGE {
            return Err(TaskError::Malformed(format!("unknown task kind: {}", task.kind)));
        }
        serde_json::from_str(&task.payload).map_err(|e| TaskError::Malformed(e.to_string()))
    }

    fn record(&self, result: &Result<TaskOutcome, TaskError>) {
        match result {
            Ok(TaskOutcome::Delivered) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                DispatchMetrics::record_delivered();
            }
            Ok(TaskOutcome::Skipped(reason)) => {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                DispatchMetrics::record_skipped();
                tracing::info!(reason = ?reason, "Message skipped");
            }
            Err(e) if e.is_retryable() => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                DispatchMetrics::record_retryable();
            }
            Err(_) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                DispatchMetrics::record_fatal();
            }
        }
    }
}

#[async_trait]
impl TaskHandler for DispatchWorker {
    async fn handle(&self, task: &Task) -> Result<(), TaskFailure> {
        let result = match Self::decode(task) {
            Ok(message) => self.process(message).await,
            Err(e) => Err(e),
        };
        self.record(&result);

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, retryable = e.is_retryable(), "Task failed");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::targets::{Backend, BackendError};
    use crate::repository::{Repository, RepositoryError, StaticRepository};
    use crate::tenant::{Application, Target, TargetArgs, User};
    use serde_json::json;
    use std::sync::Mutex;

    type Deliveries = Arc<Mutex<Vec<(Message, TargetArgs)>>>;

    struct RecordingBackend {
        deliveries: Deliveries,
        fail: bool,
    }

    #[async_trait]
    impl Backend for RecordingBackend {
        fn kind(&self) -> TargetKind {
            TargetKind::Xmpp
        }

        async fn load(&mut self) -> Result<(), BackendError> {
            Ok(())
        }

        async fn run(&mut self) -> Result<(), BackendError> {
            Ok(())
        }

        async fn execute(&mut self, message: &Message, args: &TargetArgs) -> Result<(), BackendError> {
            if self.fail {
                return Err(BackendError::Connection("connection reset".to_string()));
            }
            self.deliveries
                .lock()
                .unwrap()
                .push((message.clone(), args.clone()));
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn create_test_application(enable: bool) -> Application {
        Application {
            token: "azGDORePK8gMaC0QOYAMyEEuzJnyUi".to_string(),
            enable,
            name: "Grafana".to_string(),
            target: "xmpp_main".to_string(),
            target_args: json!({"destination": "ops@example.org"})
                .as_object()
                .cloned()
                .unwrap(),
            ..Default::default()
        }
    }

    fn create_test_target(enable: bool) -> Target {
        Target {
            id: "xmpp_main".to_string(),
            enable,
            kind: "xmpp".to_string(),
            args: json!({"server": "example.org:5222"}).as_object().cloned().unwrap(),
        }
    }

    async fn create_test_worker(
        application: Application,
        target: Target,
        fail: bool,
    ) -> (DispatchWorker, Deliveries) {
        let user = User {
            key: "uQiRzpo4DXghDmr9QzzfQu27cmVRsG".to_string(),
            enable: true,
            applications: vec![application],
        };
        let repository: Arc<dyn Repository> =
            Arc::new(StaticRepository::new(vec![user], vec![target]));
        create_worker_over(repository, fail).await
    }

    async fn create_worker_over(
        repository: Arc<dyn Repository>,
        fail: bool,
    ) -> (DispatchWorker, Deliveries) {
        let deliveries: Deliveries = Arc::default();
        let backend = RecordingBackend {
            deliveries: deliveries.clone(),
            fail,
        };
        let registry = TargetRegistry::with_backends(vec![(
            "xmpp_main".to_string(),
            Box::new(backend) as Box<dyn Backend>,
        )]);
        registry.load_all().await.unwrap();
        registry.run_all().await.unwrap();

        let worker = DispatchWorker::new(Resolver::new(repository), Arc::new(registry));
        (worker, deliveries)
    }

    fn create_test_message(via_submit: bool) -> Message {
        let mut message = Message {
            message: "Disk full".to_string(),
            title: "Alert".to_string(),
            ..Default::default()
        };
        message.assign_identity("azGDORePK8gMaC0QOYAMyEEuzJnyUi", "uQiRzpo4DXghDmr9QzzfQu27cmVRsG");
        message.set_via_submit(via_submit);
        message
    }

    #[tokio::test]
    async fn test_delivers_with_merged_args() {
        let (worker, deliveries) =
            create_test_worker(create_test_application(true), create_test_target(true), false).await;

        let outcome = worker.process(create_test_message(false)).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Delivered);

        let deliveries = deliveries.lock().unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].0.message, "Disk full");
        assert_eq!(deliveries[0].1["destination"], "ops@example.org");
        assert_eq!(deliveries[0].1["server"], "example.org:5222");
    }

    #[tokio::test]
    async fn test_disabled_application_is_skipped() {
        for via_submit in [false, true] {
            let (worker, deliveries) =
                create_test_worker(create_test_application(false), create_test_target(true), false)
                    .await;

            let outcome = worker.process(create_test_message(via_submit)).await.unwrap();
            assert_eq!(outcome, TaskOutcome::Skipped(SkipReason::ApplicationDisabled));
            assert!(deliveries.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_disabled_target_is_skipped() {
        let (worker, deliveries) =
            create_test_worker(create_test_application(true), create_test_target(false), false).await;

        let outcome = worker.process(create_test_message(true)).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Skipped(SkipReason::TargetDisabled));
        assert!(deliveries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_application() {
        let (worker, _) =
            create_test_worker(create_test_application(true), create_test_target(true), false).await;

        let mut message = create_test_message(true);
        message.assign_identity("unknown", "uQiRzpo4DXghDmr9QzzfQu27cmVRsG");
        let outcome = worker.process(message.clone()).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Skipped(SkipReason::ApplicationMissing));

        message.set_via_submit(false);
        let err = worker.process(message).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, TaskError::Resolution(ResolveError::ApplicationNotFound)));
    }

    #[tokio::test]
    async fn test_backend_error_is_retryable() {
        let (worker, _) =
            create_test_worker(create_test_application(true), create_test_target(true), true).await;

        let err = worker.process(create_test_message(false)).await.unwrap_err();
        assert!(matches!(err, TaskError::Delivery(_)));
        assert!(matches!(TaskFailure::from(err), TaskFailure::Retry(_)));
    }

    #[tokio::test]
    async fn test_encryption_failure_is_fatal() {
        let mut application = create_test_application(true);
        application.encryption_type = crate::encryption::EncryptionType::Age;
        application.encryption_recipients = vec!["not-a-recipient".to_string()];
        application.encrypt_message = true;
        let (worker, deliveries) =
            create_test_worker(application, create_test_target(true), false).await;

        let err = worker.process(create_test_message(false)).await.unwrap_err();
        assert!(matches!(err, TaskError::Encryption(_)));
        assert!(!err.is_retryable());
        assert!(deliveries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_target_type_is_fatal() {
        let mut target = create_test_target(true);
        target.kind = "foo".to_string();
        let (worker, _) = create_test_worker(create_test_application(true), target, false).await;

        let err = worker.process(create_test_message(false)).await.unwrap_err();
        assert!(matches!(err, TaskError::UnsupportedKind(_)));
        assert_eq!(err.to_string(), "Unsupported target type: foo");
    }

    #[tokio::test]
    async fn test_malformed_payload_is_fatal() {
        let (worker, _) =
            create_test_worker(create_test_application(true), create_test_target(true), false).await;

        let task = Task::message("{not json".to_string());
        let failure = worker.handle(&task).await.unwrap_err();
        assert!(matches!(failure, TaskFailure::Fatal(ref reason) if reason.starts_with("Malformed task")));
        assert_eq!(worker.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_handle_round_trips_queue_payload() {
        let (worker, deliveries) =
            create_test_worker(create_test_application(true), create_test_target(true), false).await;

        let payload = serde_json::to_string(&create_test_message(false)).unwrap();
        worker.handle(&Task::message(payload)).await.unwrap();

        assert_eq!(worker.stats().delivered, 1);
        assert_eq!(deliveries.lock().unwrap()[0].0.title, "Alert");
    }

    /// Serves lookups from the wrapped repository but never finishes a stat update.
    struct StalledStats(StaticRepository);

    #[async_trait]
    impl Repository for StalledStats {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn get_user_from_token(&self, token: &str) -> Result<User, RepositoryError> {
            self.0.get_user_from_token(token).await
        }

        async fn get_application(&self, user_key: &str, token: &str) -> Result<Application, RepositoryError> {
            self.0.get_application(user_key, token).await
        }

        async fn get_targets(&self) -> Result<Vec<Target>, RepositoryError> {
            self.0.get_targets().await
        }

        async fn get_target_by_id(&self, id: &str) -> Result<Target, RepositoryError> {
            self.0.get_target_by_id(id).await
        }

        async fn increment_stat(&self, _token: &str, _stat: Stat) -> Result<(), RepositoryError> {
            std::future::pending().await
        }

        async fn save_input(&self, token: &str, dump: &str) -> Result<(), RepositoryError> {
            self.0.save_input(token, dump).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_sent_stat_does_not_block_delivery() {
        let user = User {
            key: "uQiRzpo4DXghDmr9QzzfQu27cmVRsG".to_string(),
            enable: true,
            applications: vec![create_test_application(true)],
        };
        let repository: Arc<dyn Repository> = Arc::new(StalledStats(StaticRepository::new(
            vec![user],
            vec![create_test_target(true)],
        )));
        let (worker, deliveries) = create_worker_over(repository, false).await;

        let outcome = worker.process(create_test_message(false)).await.unwrap();

        assert_eq!(outcome, TaskOutcome::Delivered);
        assert_eq!(deliveries.lock().unwrap().len(), 1);
    }
}
