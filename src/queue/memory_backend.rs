//! In-memory task queue.
//!
//! State lives in the process; nothing survives a restart, so
//! `recover_inflight` only matters for tests that simulate one.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::{DeadLetter, Delivery, QueueError, QueueStats, Task, TaskQueue};

#[derive(Default)]
struct MemoryState {
    pending: VecDeque<Task>,
    scheduled: Vec<(Instant, Task)>,
    inflight: HashMap<Uuid, Task>,
    dead: Vec<DeadLetter>,
}

impl MemoryState {
    fn promote_due(&mut self, now: Instant) {
        let mut index = 0;
        while index < self.scheduled.len() {
            if self.scheduled[index].0 <= now {
                let (_, task) = self.scheduled.remove(index);
                self.pending.push_back(task);
            } else {
                index += 1;
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryTaskQueue {
    state: Mutex<MemoryState>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dead-lettered tasks, oldest first.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead.clone()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        self.state.lock().await.pending.push_back(task);
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let mut state = self.state.lock().await;
        state.promote_due(Instant::now());

        let Some(task) = state.pending.pop_front() else {
            return Ok(None);
        };
        state.inflight.insert(task.id, task.clone());
        let receipt = task.id.to_string();
        Ok(Some(Delivery::new(task, receipt)))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.state.lock().await.inflight.remove(&delivery.task.id);
        Ok(())
    }

    async fn retry(&self, delivery: Delivery, delay: Duration) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.inflight.remove(&delivery.task.id);

        let mut task = delivery.task;
        task.attempts += 1;
        state.scheduled.push((Instant::now() + delay, task));
        Ok(())
    }

    async fn dead_letter(&self, delivery: Delivery, reason: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.inflight.remove(&delivery.task.id);
        state.dead.push(DeadLetter {
            task: delivery.task,
            reason: reason.to_string(),
            failed_at: Utc::now(),
        });
        Ok(())
    }

    async fn recover_inflight(&self) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let recovered: Vec<Task> = state.inflight.drain().map(|(_, task)| task).collect();
        let count = recovered.len();
        state.pending.extend(recovered);
        Ok(count)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.state.lock().await;
        Ok(QueueStats {
            backend: self.backend_name().to_string(),
            pending: state.pending.len(),
            scheduled: state.scheduled.len(),
            inflight: state.inflight.len(),
            dead: state.dead.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_task(payload: &str) -> Task {
        Task::message(payload.to_string())
    }

    #[tokio::test]
    async fn test_fifo_and_ack() {
        let queue = MemoryTaskQueue::new();
        queue.enqueue(create_test_task("first")).await.unwrap();
        queue.enqueue(create_test_task("second")).await.unwrap();

        let delivery = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(delivery.task.payload, "first");
        assert_eq!(queue.stats().await.unwrap().inflight, 1);

        queue.ack(&delivery).await.unwrap();
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.inflight, 0);
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn test_empty_queue_returns_none() {
        let queue = MemoryTaskQueue::new();
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_is_delayed() {
        let queue = MemoryTaskQueue::new();
        queue.enqueue(create_test_task("x")).await.unwrap();

        let delivery = queue.dequeue().await.unwrap().unwrap();
        queue.retry(delivery, Duration::from_secs(30)).await.unwrap();

        assert!(queue.dequeue().await.unwrap().is_none());
        assert_eq!(queue.stats().await.unwrap().scheduled, 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        let retried = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(retried.task.attempts, 1);
        assert_eq!(retried.task.payload, "x");
    }

    #[tokio::test]
    async fn test_dead_letter() {
        let queue = MemoryTaskQueue::new();
        queue.enqueue(create_test_task("broken")).await.unwrap();

        let delivery = queue.dequeue().await.unwrap().unwrap();
        queue.dead_letter(delivery, "malformed payload").await.unwrap();

        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "malformed payload");
        assert_eq!(queue.stats().await.unwrap().inflight, 0);
    }

    #[tokio::test]
    async fn test_recover_inflight() {
        let queue = MemoryTaskQueue::new();
        queue.enqueue(create_test_task("a")).await.unwrap();
        let _lost = queue.dequeue().await.unwrap().unwrap();

        assert_eq!(queue.recover_inflight().await.unwrap(), 1);
        let again = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(again.task.payload, "a");
    }
}
