//! Redis task queue.
//!
//! Keys, all under the configured prefix:
//!
//! - `{prefix}:pending`: list of ready tasks (LPUSH in, LMOVE out)
//! - `{prefix}:processing`: list of in-flight tasks
//! - `{prefix}:scheduled`: sorted set of delayed retries, scored by due time (ms)
//! - `{prefix}:dead`: list of dead-letter records
//!
//! Tasks are stored as their JSON encoding; that exact string is the receipt
//! used to remove an in-flight entry.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;

use super::{DeadLetter, Delivery, QueueError, QueueStats, Task, TaskQueue};

/// Scheduled tasks promoted per dequeue call.
const PROMOTE_BATCH: isize = 100;

pub struct RedisTaskQueue {
    conn: ConnectionManager,
    keys: QueueKeys,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueKeys {
    pending: String,
    processing: String,
    scheduled: String,
    dead: String,
}

impl QueueKeys {
    fn new(prefix: &str) -> Self {
        Self {
            pending: format!("{}:pending", prefix),
            processing: format!("{}:processing", prefix),
            scheduled: format!("{}:scheduled", prefix),
            dead: format!("{}:dead", prefix),
        }
    }
}

fn due_score(delay: Duration) -> i64 {
    Utc::now().timestamp_millis() + delay.as_millis() as i64
}

impl RedisTaskQueue {
    /// Connect to Redis at `url`.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, prefix))
    }

    pub fn new(conn: ConnectionManager, prefix: &str) -> Self {
        Self {
            conn,
            keys: QueueKeys::new(prefix),
        }
    }

    /// Move due retries from the scheduled set to the pending list.
    async fn promote_due(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp_millis();

        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.keys.scheduled)
            .arg("-inf")
            .arg(now)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(&mut conn)
            .await?;

        let mut promoted = 0;
        for raw in due {
            // only the caller that wins the ZREM pushes the task
            let removed: i64 = redis::cmd("ZREM")
                .arg(&self.keys.scheduled)
                .arg(&raw)
                .query_async(&mut conn)
                .await?;
            if removed == 1 {
                let _: () = redis::cmd("LPUSH")
                    .arg(&self.keys.pending)
                    .arg(&raw)
                    .query_async(&mut conn)
                    .await?;
                promoted += 1;
            }
        }

        Ok(promoted)
    }

    /// Remove an in-flight entry and push `value` onto `list` atomically.
    async fn move_inflight(&self, receipt: &str, list: &str, value: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(&self.keys.processing)
            .arg(1)
            .arg(receipt)
            .ignore()
            .cmd("LPUSH")
            .arg(list)
            .arg(value)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        let raw = serde_json::to_string(&task)?;
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("LPUSH")
            .arg(&self.keys.pending)
            .arg(&raw)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let promoted = self.promote_due().await?;
        if promoted > 0 {
            tracing::debug!(promoted, "Promoted scheduled retries");
        }

        let mut conn = self.conn.clone();
        loop {
            let raw: Option<String> = redis::cmd("LMOVE")
                .arg(&self.keys.pending)
                .arg(&self.keys.processing)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await?;

            let Some(raw) = raw else {
                return Ok(None);
            };

            match serde_json::from_str::<Task>(&raw) {
                Ok(task) => return Ok(Some(Delivery::new(task, raw))),
                Err(e) => {
                    // unreadable envelope: park it and keep going
                    tracing::warn!(error = %e, "Dead-lettering undecodable task envelope");
                    let record = serde_json::json!({
                        "raw": raw,
                        "reason": format!("undecodable task envelope: {}", e),
                        "failed_at": Utc::now(),
                    });
                    self.move_inflight(&raw, &self.keys.dead, &record.to_string())
                        .await?;
                }
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("LREM")
            .arg(&self.keys.processing)
            .arg(1)
            .arg(delivery.receipt())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn retry(&self, delivery: Delivery, delay: Duration) -> Result<(), QueueError> {
        let mut task = delivery.task.clone();
        task.attempts += 1;
        let raw = serde_json::to_string(&task)?;

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(&self.keys.processing)
            .arg(1)
            .arg(delivery.receipt())
            .ignore()
            .cmd("ZADD")
            .arg(&self.keys.scheduled)
            .arg(due_score(delay))
            .arg(&raw)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn dead_letter(&self, delivery: Delivery, reason: &str) -> Result<(), QueueError> {
        let record = DeadLetter {
            task: delivery.task.clone(),
            reason: reason.to_string(),
            failed_at: Utc::now(),
        };
        let raw = serde_json::to_string(&record)?;
        self.move_inflight(delivery.receipt(), &self.keys.dead, &raw)
            .await
    }

    async fn recover_inflight(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let mut recovered = 0;

        loop {
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(&self.keys.processing)
                .arg(&self.keys.pending)
                .arg("RIGHT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }

        Ok(recovered)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.conn.clone();
        let (pending, scheduled, inflight, dead): (usize, usize, usize, usize) = redis::pipe()
            .cmd("LLEN")
            .arg(&self.keys.pending)
            .cmd("ZCARD")
            .arg(&self.keys.scheduled)
            .cmd("LLEN")
            .arg(&self.keys.processing)
            .cmd("LLEN")
            .arg(&self.keys.dead)
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats {
            backend: self.backend_name().to_string(),
            pending,
            scheduled,
            inflight,
            dead,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = QueueKeys::new("push_relay:tasks");
        assert_eq!(keys.pending, "push_relay:tasks:pending");
        assert_eq!(keys.processing, "push_relay:tasks:processing");
        assert_eq!(keys.scheduled, "push_relay:tasks:scheduled");
        assert_eq!(keys.dead, "push_relay:tasks:dead");
    }

    #[test]
    fn test_due_score_is_in_the_future() {
        let now = Utc::now().timestamp_millis();
        let score = due_score(Duration::from_secs(10));
        assert!(score >= now + 10_000);
        assert!(score < now + 11_000);
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let result = RedisTaskQueue::connect("not-a-redis-url", "test").await;
        assert!(matches!(result, Err(QueueError::Redis(_))));
    }
}
