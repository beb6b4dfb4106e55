//! Message queue transport abstraction.
//!
//! Three logical channel kinds share one interface: the task queue, the
//! result queue, and per-task stream queues. The in-memory backend is the
//! required implementation; `redis`/`amqp` are selectable but unimplemented,
//! which the runtime treats as a fatal configuration error at startup.

pub mod memory;

use crate::{
    config::{MqBackend, MqConfig},
    constants::{DLQ_SUFFIX, STREAM_QUEUE_PREFIX},
    models::Priority,
    Result, RuntimeError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

pub use memory::InMemoryQueue;

/// Kind of payload carried by a queue message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskRequest,
    TaskResult,
    StreamChunk,
    Control,
}

/// Envelope wrapping every payload that crosses the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: Uuid,
    pub message_type: MessageType,
    pub payload: serde_json::Value,
    pub priority: Priority,
    /// Task id the payload belongs to; `wait_result` correlates on this.
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl QueueMessage {
    pub fn new<T: Serialize>(
        message_type: MessageType,
        payload: &T,
        priority: Priority,
        correlation_id: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            message_type,
            payload: serde_json::to_value(payload)?,
            priority,
            correlation_id: correlation_id.into(),
            created_at: Utc::now(),
            retry_count: 0,
            max_retries: crate::constants::DEFAULT_MAX_RETRIES,
        })
    }

    /// Decodes the payload into its concrete type.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Per-queue counters exposed through `stats()`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: u64,
    pub failed: u64,
    pub average_processing_time_ms: f64,
}

/// Capability-minimum transport contract shared by all backends
///
/// `publish` is non-blocking at the interface: a full bounded queue returns
/// `QueueFull` immediately. `consume` on a deleted queue returns `None`
/// forever. Acking an unknown id is a no-op.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Creates a queue; idempotent for an existing name.
    async fn create_queue(&self, name: &str, max_size: Option<usize>) -> Result<()>;

    /// Deletes a queue, discarding pending messages; idempotent.
    async fn delete_queue(&self, name: &str) -> Result<()>;

    async fn publish(&self, queue: &str, message: QueueMessage) -> Result<()>;

    /// Next message, prioritised critical→low, FIFO within a priority.
    /// Returns `None` on timeout or closed queue.
    async fn consume(&self, queue: &str, timeout: Duration) -> Result<Option<QueueMessage>>;

    /// Like `consume` but only takes the message whose `correlation_id`
    /// matches; other messages are left for their owners.
    async fn consume_correlated(
        &self,
        queue: &str,
        correlation_id: &str,
        timeout: Duration,
    ) -> Result<Option<QueueMessage>>;

    async fn ack(&self, queue: &str, message_id: &Uuid) -> Result<()>;

    /// Negative acknowledgement. With `requeue` and retries remaining the
    /// message re-enters the queue with `retry_count + 1`; otherwise it moves
    /// to the dead-letter companion queue.
    async fn nack(&self, queue: &str, message_id: &Uuid, requeue: bool) -> Result<()>;

    /// Drops pending messages older than `max_age`; returns how many.
    async fn purge_expired(&self, queue: &str, max_age: Duration) -> Result<usize>;

    async fn stats(&self, queue: &str) -> Result<QueueStats>;

    fn backend_name(&self) -> &'static str;
}

/// Dead-letter companion queue for `queue`.
pub fn dlq_name(queue: &str) -> String {
    format!("{queue}{DLQ_SUFFIX}")
}

/// Name of the dedicated stream queue for a task.
pub fn stream_queue_name(task_id: &str) -> String {
    format!("{STREAM_QUEUE_PREFIX}{task_id}")
}

/// Builds the configured backend. Optional backends fail here, at startup,
/// never at runtime.
pub fn build(config: &MqConfig) -> Result<Arc<dyn MessageQueue>> {
    match config.backend {
        MqBackend::Memory => Ok(Arc::new(InMemoryQueue::new())),
        MqBackend::Redis => Err(RuntimeError::NotImplemented(
            "redis MQ backend is not available in this build".to_string(),
        )),
        MqBackend::Amqp => Err(RuntimeError::NotImplemented(
            "amqp MQ backend is not available in this build".to_string(),
        )),
    }
}
