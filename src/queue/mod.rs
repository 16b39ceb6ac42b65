//! Task queue transport between ingestion and dispatch.
//!
//! Delivery is at-least-once: a dequeued task stays in flight until it is
//! acknowledged, rescheduled or dead-lettered, and in-flight tasks left over
//! from a crash are requeued on the next start.
//!
//! - `MemoryTaskQueue`: in-process, for tests and single-process setups
//! - `RedisTaskQueue`: Redis lists plus a scheduled sorted set
//!
//! Use `create_task_queue()` to build the backend selected by configuration.

pub mod backoff;
mod consumer;
mod factory;
pub mod memory_backend;
pub mod redis_backend;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use consumer::{ConsumerConfig, ConsumerReport, QueueConsumer};
pub use factory::create_task_queue;
pub use memory_backend::MemoryTaskQueue;
pub use redis_backend::RedisTaskQueue;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Redis operation failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend is temporarily unavailable
    #[error("Queue unavailable: {0}")]
    Unavailable(String),
}

/// A unit of work on the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub kind: String,
    /// JSON-serialized canonical message
    pub payload: String,
    /// Retries performed so far
    #[serde(default)]
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl Task {
    /// The only task kind: deliver one message.
    pub const MESSAGE: &'static str = "message";

    pub fn message(payload: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: Self::MESSAGE.to_string(),
            payload,
            attempts: 0,
            enqueued_at: Utc::now(),
        }
    }
}

/// A dequeued task together with the backend's handle on it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub task: Task,
    /// Backend specific identity of the in-flight entry
    receipt: String,
}

impl Delivery {
    pub(crate) fn new(task: Task, receipt: String) -> Self {
        Self { task, receipt }
    }

    pub(crate) fn receipt(&self) -> &str {
        &self.receipt
    }
}

/// Record kept for a dead-lettered task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub task: Task,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Snapshot of queue depth.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub backend: String,
    pub pending: usize,
    pub scheduled: usize,
    pub inflight: usize,
    pub dead: usize,
}

/// Queue transport contract.
///
/// Implementations must be thread-safe (`Send + Sync`); one instance is
/// shared by the HTTP handlers and the consumer.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Backend name for logs and stats.
    fn backend_name(&self) -> &'static str;

    async fn enqueue(&self, task: Task) -> Result<(), QueueError>;

    /// Take the next ready task, moving it in flight. Never blocks.
    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError>;

    /// Remove a handled task.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Schedule the task again after `delay`, counting one more attempt.
    async fn retry(&self, delivery: Delivery, delay: Duration) -> Result<(), QueueError>;

    /// Park the task on the dead-letter list.
    async fn dead_letter(&self, delivery: Delivery, reason: &str) -> Result<(), QueueError>;

    /// Requeue tasks left in flight by a previous run. Returns how many.
    async fn recover_inflight(&self) -> Result<usize, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;
}

/// How a handler failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    /// Transient; the transport retries with backoff
    Retry(String),
    /// Permanent; the task is dead-lettered
    Fatal(String),
}

impl TaskFailure {
    pub fn reason(&self) -> &str {
        match self {
            TaskFailure::Retry(reason) | TaskFailure::Fatal(reason) => reason,
        }
    }
}

/// Processes one task taken off the queue.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<(), TaskFailure>;
}
