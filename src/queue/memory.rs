//! In-memory queue backend: single-process, multi-producer multi-consumer.

use super::{dlq_name, MessageQueue, QueueMessage, QueueStats};
use crate::{Result, RuntimeError};
use async_trait::async_trait;
use std::{
    collections::{HashMap, VecDeque},
    pin::pin,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::debug;
use uuid::Uuid;

/// Number of priority buckets (critical, high, normal, low).
const PRIORITY_LEVELS: usize = 4;

struct InFlight {
    message: QueueMessage,
    consumed_at: Instant,
}

struct QueueState {
    /// One FIFO per priority, indexed by `Priority::bucket()`.
    buckets: [VecDeque<QueueMessage>; PRIORITY_LEVELS],
    processing: HashMap<Uuid, InFlight>,
    max_size: Option<usize>,
    closed: bool,
    completed: u64,
    failed: u64,
    average_processing_time_ms: f64,
}

impl QueueState {
    fn new(max_size: Option<usize>) -> Self {
        Self {
            buckets: std::array::from_fn(|_| VecDeque::new()),
            processing: HashMap::new(),
            max_size,
            closed: false,
            completed: 0,
            failed: 0,
            average_processing_time_ms: 0.0,
        }
    }

    fn pending(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    fn pop_next(&mut self) -> Option<QueueMessage> {
        self.buckets.iter_mut().find_map(VecDeque::pop_front)
    }

    fn pop_correlated(&mut self, correlation_id: &str) -> Option<QueueMessage> {
        for bucket in self.buckets.iter_mut() {
            if let Some(pos) = bucket.iter().position(|m| m.correlation_id == correlation_id) {
                return bucket.remove(pos);
            }
        }
        None
    }

    fn record_completed(&mut self, elapsed_ms: f64) {
        self.completed += 1;
        self.average_processing_time_ms = (self.average_processing_time_ms
            * (self.completed - 1) as f64
            + elapsed_ms)
            / self.completed as f64;
    }
}

struct QueueInner {
    state: Mutex<QueueState>,
    notify: Notify,
}

/// Required backend: bounded priority FIFO queues with ack/nack, dead
/// lettering, and correlated consumption.
pub struct InMemoryQueue {
    queues: RwLock<HashMap<String, Arc<QueueInner>>>,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
        }
    }

    async fn get(&self, name: &str) -> Option<Arc<QueueInner>> {
        let queues = self.queues.read().await;
        queues.get(name).cloned()
    }

    async fn get_or_create(&self, name: &str, max_size: Option<usize>) -> Arc<QueueInner> {
        {
            let queues = self.queues.read().await;
            if let Some(inner) = queues.get(name) {
                return inner.clone();
            }
        }
        let mut queues = self.queues.write().await;
        queues
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(QueueInner {
                    state: Mutex::new(QueueState::new(max_size)),
                    notify: Notify::new(),
                })
            })
            .clone()
    }

    /// Shared wait loop for `consume` / `consume_correlated`.
    async fn consume_with<F>(
        &self,
        queue: &str,
        timeout: Duration,
        mut take: F,
    ) -> Result<Option<QueueMessage>>
    where
        F: FnMut(&mut QueueState) -> Option<QueueMessage> + Send,
    {
        let Some(inner) = self.get(queue).await else {
            // Deleted or never-created queues behave as closed.
            return Ok(None);
        };
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let mut notified = pin!(inner.notify.notified());
            // Register interest before checking state so a publish between
            // the check and the await is not missed.
            notified.as_mut().enable();

            {
                let mut state = inner.state.lock().await;
                if state.closed {
                    return Ok(None);
                }
                if let Some(message) = take(&mut state) {
                    state.processing.insert(
                        message.id,
                        InFlight {
                            message: message.clone(),
                            consumed_at: Instant::now(),
                        },
                    );
                    return Ok(Some(message));
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn create_queue(&self, name: &str, max_size: Option<usize>) -> Result<()> {
        self.get_or_create(name, max_size).await;
        debug!("queue {} ready (max_size: {:?})", name, max_size);
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        let removed = {
            let mut queues = self.queues.write().await;
            queues.remove(name)
        };
        if let Some(inner) = removed {
            let mut state = inner.state.lock().await;
            state.closed = true;
            for bucket in state.buckets.iter_mut() {
                bucket.clear();
            }
            drop(state);
            inner.notify.notify_waiters();
            debug!("queue {} deleted", name);
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, message: QueueMessage) -> Result<()> {
        let Some(inner) = self.get(queue).await else {
            return Err(RuntimeError::QueueClosed(queue.to_string()));
        };
        {
            let mut state = inner.state.lock().await;
            if state.closed {
                return Err(RuntimeError::QueueClosed(queue.to_string()));
            }
            if let Some(max) = state.max_size {
                if state.pending() >= max {
                    return Err(RuntimeError::QueueFull(queue.to_string()));
                }
            }
            let bucket = message.priority.bucket();
            state.buckets[bucket].push_back(message);
        }
        inner.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str, timeout: Duration) -> Result<Option<QueueMessage>> {
        self.consume_with(queue, timeout, QueueState::pop_next).await
    }

    async fn consume_correlated(
        &self,
        queue: &str,
        correlation_id: &str,
        timeout: Duration,
    ) -> Result<Option<QueueMessage>> {
        self.consume_with(queue, timeout, |state| state.pop_correlated(correlation_id))
            .await
    }

    async fn ack(&self, queue: &str, message_id: &Uuid) -> Result<()> {
        let Some(inner) = self.get(queue).await else {
            return Ok(());
        };
        let mut state = inner.state.lock().await;
        if let Some(in_flight) = state.processing.remove(message_id) {
            let elapsed_ms = in_flight.consumed_at.elapsed().as_secs_f64() * 1000.0;
            state.record_completed(elapsed_ms);
        }
        Ok(())
    }

    async fn nack(&self, queue: &str, message_id: &Uuid, requeue: bool) -> Result<()> {
        let Some(inner) = self.get(queue).await else {
            return Ok(());
        };
        let dead = {
            let mut state = inner.state.lock().await;
            let Some(in_flight) = state.processing.remove(message_id) else {
                return Ok(());
            };
            let mut message = in_flight.message;
            if requeue && message.retry_count < message.max_retries {
                message.retry_count += 1;
                let bucket = message.priority.bucket();
                state.buckets[bucket].push_back(message);
                None
            } else {
                state.failed += 1;
                Some(message)
            }
        };

        match dead {
            None => {
                inner.notify.notify_waiters();
            }
            Some(message) => {
                // Dead-letter insert happens outside the source queue's lock.
                let dlq = self.get_or_create(&dlq_name(queue), None).await;
                let mut state = dlq.state.lock().await;
                let bucket = message.priority.bucket();
                debug!(
                    "message {} exhausted retries, moving to {}",
                    message.id,
                    dlq_name(queue)
                );
                state.buckets[bucket].push_back(message);
                drop(state);
                dlq.notify.notify_waiters();
            }
        }
        Ok(())
    }

    async fn purge_expired(&self, queue: &str, max_age: Duration) -> Result<usize> {
        let Some(inner) = self.get(queue).await else {
            return Ok(0);
        };
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(max_age)
                .map_err(|e| RuntimeError::Queue(e.to_string()))?;
        let mut state = inner.state.lock().await;
        let before = state.pending();
        for bucket in state.buckets.iter_mut() {
            bucket.retain(|m| m.created_at > cutoff);
        }
        Ok(before - state.pending())
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let Some(inner) = self.get(queue).await else {
            return Ok(QueueStats::default());
        };
        let state = inner.state.lock().await;
        Ok(QueueStats {
            pending: state.pending(),
            processing: state.processing.len(),
            completed: state.completed,
            failed: state.failed,
            average_processing_time_ms: state.average_processing_time_ms,
        })
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
