use std::sync::Arc;

use super::{MemoryTaskQueue, QueueError, RedisTaskQueue, TaskQueue};
use crate::config::Settings;

/// Build the task queue selected by `queue.backend`.
///
/// The memory backend only connects ingress and worker inside one process;
/// use Redis whenever they run separately.
pub async fn create_task_queue(settings: &Settings) -> Result<Arc<dyn TaskQueue>, QueueError> {
    match settings.queue.backend.to_ascii_lowercase().as_str() {
        "memory" => {
            tracing::info!(backend = "memory", "Task queue initialized");
            Ok(Arc::new(MemoryTaskQueue::new()))
        }
        "redis" => {
            let queue = RedisTaskQueue::connect(&settings.redis.url, &settings.queue.prefix).await?;
            tracing::info!(
                backend = "redis",
                prefix = %settings.queue.prefix,
                "Task queue initialized"
            );
            Ok(Arc::new(queue))
        }
        other => Err(QueueError::Unavailable(format!(
            "Unknown queue backend: {}",
            other
        ))),
    }
}
