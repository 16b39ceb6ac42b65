//! Concurrent queue consumer.
//!
//! Polls the queue, runs the handler for each task on its own tokio task
//! (bounded by a semaphore) and settles the task afterwards:
//!
//! - handler `Ok`: ack
//! - `TaskFailure::Retry`: reschedule with backoff, dead-letter once
//!   `max_retries` is exhausted
//! - `TaskFailure::Fatal`: dead-letter immediately

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;

use super::{BackoffConfig, Delivery, ExponentialBackoff, TaskFailure, TaskHandler, TaskQueue};
use crate::config::WorkerConfig;
use crate::metrics::QueueMetrics;

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub concurrency: usize,
    pub max_retries: u32,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
    pub backoff: BackoffConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for ConsumerConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            max_retries: config.max_retries,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            shutdown_grace: Duration::from_secs(config.shutdown_grace_seconds),
            backoff: BackoffConfig {
                initial_delay_ms: config.backoff_initial_delay_ms,
                max_delay_ms: config.backoff_max_delay_ms,
                ..BackoffConfig::default()
            },
        }
    }
}

/// What happened while the consumer ran.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    pub started: u64,
    /// Tasks still running when the grace period ran out
    pub aborted: usize,
}

pub struct QueueConsumer {
    queue: Arc<dyn TaskQueue>,
    handler: Arc<dyn TaskHandler>,
    config: ConsumerConfig,
}

impl QueueConsumer {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        handler: Arc<dyn TaskHandler>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            queue,
            handler,
            config,
        }
    }

    /// Consume until `shutdown` fires, then drain in-flight tasks.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> ConsumerReport {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut in_flight = JoinSet::new();
        let mut error_backoff = ExponentialBackoff::with_config(self.config.backoff.clone());
        let mut report = ConsumerReport::default();

        match self.queue.recover_inflight().await {
            Ok(0) => {}
            Ok(recovered) => tracing::info!(recovered, "Requeued tasks left in flight"),
            Err(e) => tracing::warn!(error = %e, "Failed to recover in-flight tasks"),
        }

        tracing::info!(
            backend = self.queue.backend_name(),
            concurrency = self.config.concurrency,
            max_retries = self.config.max_retries,
            "Queue consumer started"
        );

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Task handler panicked");
                }
            }

            let permit = tokio::select! {
                _ = shutdown.recv() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.queue.dequeue().await {
                Ok(Some(delivery)) => {
                    error_backoff.reset();
                    report.started += 1;

                    let queue = self.queue.clone();
                    let handler = self.handler.clone();
                    let config = self.config.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        process(queue, handler, &config, delivery).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    let delay = error_backoff.next_delay();
                    tracing::warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Dequeue failed"
                    );
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        tracing::info!(in_flight = in_flight.len(), "Queue consumer stopping");

        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            report.aborted = in_flight.len();
            tracing::warn!(
                aborted = report.aborted,
                "Grace period elapsed, aborting in-flight tasks"
            );
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
        }

        tracing::info!(started = report.started, "Queue consumer stopped");
        report
    }
}

async fn process(
    queue: Arc<dyn TaskQueue>,
    handler: Arc<dyn TaskHandler>,
    config: &ConsumerConfig,
    delivery: Delivery,
) {
    let task_id = delivery.task.id;
    let attempts = delivery.task.attempts;

    let settled = match handler.handle(&delivery.task).await {
        Ok(()) => {
            QueueMetrics::record_ack();
            queue.ack(&delivery).await
        }
        Err(TaskFailure::Retry(reason)) if attempts < config.max_retries => {
            let delay = config.backoff.delay_for_attempt(attempts + 1);
            tracing::warn!(
                task_id = %task_id,
                attempt = attempts + 1,
                retry_in_ms = delay.as_millis() as u64,
                reason = %reason,
                "Task failed, scheduling retry"
            );
            QueueMetrics::record_retry();
            queue.retry(delivery, delay).await
        }
        Err(failure) => {
            let reason = match &failure {
                TaskFailure::Retry(reason) => format!("retries exhausted: {}", reason),
                TaskFailure::Fatal(reason) => reason.clone(),
            };
            tracing::error!(task_id = %task_id, attempts, reason = %reason, "Task dead-lettered");
            QueueMetrics::record_dead_letter();
            queue.dead_letter(delivery, &reason).await
        }
    };

    if let Err(e) = settled {
        tracing::error!(task_id = %task_id, error = %e, "Failed to settle task");
    }
}
