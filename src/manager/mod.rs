//! Task manager: session-keyed dispatch with a worker pool.
//!
//! Owns the task and result queues, the worker activities, and the janitor.
//! Callers interact through `submit_task` / `wait_result` /
//! `subscribe_stream`; everything past submission travels through the
//! message queue.

mod janitor;
mod worker;

use crate::{
    config::RuntimeConfig,
    constants::{CONSUME_POLL_TIMEOUT_MS, RESULT_QUEUE, TASK_QUEUE},
    context::ContextStore,
    models::{SessionKey, StreamChunk, TaskRequest, TaskResult},
    queue::{stream_queue_name, MessageQueue, MessageType, QueueMessage, QueueStats},
    registry::{InstanceInfo, InstanceRegistry},
    Result, RuntimeError,
};
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Aggregate runtime statistics exposed by `stats()`
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub worker_count: usize,
    pub active_instances: usize,
    pub running_tasks: usize,
    pub queue_type: String,
    pub task_queue_stats: QueueStats,
    pub result_queue_stats: QueueStats,
}

/// Bookkeeping for one live stream queue
pub(crate) struct StreamState {
    created_at: Instant,
    producer_active: bool,
    finished: bool,
    subscribed: bool,
}

impl StreamState {
    fn new() -> Self {
        Self {
            created_at: Instant::now(),
            producer_active: false,
            finished: false,
            subscribed: false,
        }
    }
}

pub struct TaskManager {
    pub(crate) queue: Arc<dyn MessageQueue>,
    pub(crate) registry: Arc<InstanceRegistry>,
    pub(crate) contexts: Arc<ContextStore>,
    pub(crate) config: Arc<RuntimeConfig>,
    running_tasks: AtomicUsize,
    streams: Mutex<HashMap<String, StreamState>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
}

impl TaskManager {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        registry: Arc<InstanceRegistry>,
        contexts: Arc<ContextStore>,
        config: Arc<RuntimeConfig>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            queue,
            registry,
            contexts,
            config,
            running_tasks: AtomicUsize::new(0),
            streams: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
            shutdown_tx,
            started: AtomicBool::new(false),
        })
    }

    /// Creates the shared queues and spawns the worker pool and janitor.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.queue
            .create_queue(TASK_QUEUE, Some(self.config.mq.max_queue_size))
            .await?;
        self.queue.create_queue(RESULT_QUEUE, None).await?;

        let mut workers = self.workers.lock().await;
        for worker_id in 0..self.config.workers {
            let manager = self.clone();
            let shutdown = self.shutdown_tx.subscribe();
            workers.push(tokio::spawn(worker::worker_loop(
                manager, worker_id, shutdown,
            )));
        }
        let manager = self.clone();
        let shutdown = self.shutdown_tx.subscribe();
        workers.push(tokio::spawn(janitor::janitor_loop(manager, shutdown)));

        info!(
            "task manager started: {} workers, {} backend",
            self.config.workers,
            self.queue.backend_name()
        );
        Ok(())
    }

    /// Signals workers and the janitor to stop and waits for them to drain
    /// their current task.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
        info!("task manager stopped");
    }

    /// Validates and enqueues a task. For streaming tasks the dedicated
    /// stream queue exists before this returns. Fails fast with
    /// `QueueSaturated` when the task queue is at capacity.
    pub async fn submit_task(&self, request: TaskRequest) -> Result<String> {
        request.validate()?;
        let task_id = request.task_id.clone();

        if request.stream {
            self.queue
                .create_queue(
                    &stream_queue_name(&task_id),
                    Some(self.config.mq.stream_queue_size),
                )
                .await?;
            let mut streams = self.streams.lock().await;
            streams.insert(task_id.clone(), StreamState::new());
        }

        let message = QueueMessage::new(
            MessageType::TaskRequest,
            &request,
            request.priority,
            &task_id,
        )?;
        match self.queue.publish(TASK_QUEUE, message).await {
            Ok(()) => {
                debug!(
                    "task {} submitted for {} (stream: {})",
                    task_id, request.agent_id, request.stream
                );
                Ok(task_id)
            }
            Err(error) => {
                if request.stream {
                    self.drop_stream(&task_id).await;
                }
                match error {
                    RuntimeError::QueueFull(_) => Err(RuntimeError::QueueSaturated),
                    other => Err(other),
                }
            }
        }
    }

    /// Blocks until the result correlated with `task_id` arrives, leaving
    /// other tasks' results queued for their owners.
    pub async fn wait_result(&self, task_id: &str, timeout: Duration) -> Result<TaskResult> {
        let consumed = self
            .queue
            .consume_correlated(RESULT_QUEUE, task_id, timeout)
            .await?;
        match consumed {
            Some(message) => {
                let result: TaskResult = message.decode()?;
                self.queue.ack(RESULT_QUEUE, &message.id).await?;
                Ok(result)
            }
            None => Err(RuntimeError::Timeout {
                message: format!("no result for task {task_id} within {timeout:?}"),
            }),
        }
    }

    /// Subscribes to a task's stream queue. The returned stream yields
    /// chunks in `chunk_index` order and ends after the terminal chunk.
    /// Dropping it cancels the subscription: the queue is closed and the
    /// producing worker stops at its next publish.
    pub async fn subscribe_stream(
        self: &Arc<Self>,
        task_id: &str,
    ) -> Result<ReceiverStream<StreamChunk>> {
        {
            let mut streams = self.streams.lock().await;
            match streams.get_mut(task_id) {
                Some(state) => state.subscribed = true,
                None => {
                    return Err(RuntimeError::NotFound(format!("stream for task {task_id}")))
                }
            }
        }

        let (tx, rx) = mpsc::channel(self.config.mq.stream_queue_size);
        let manager = self.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            forward_stream(manager, task_id, tx).await;
        });
        Ok(ReceiverStream::new(rx))
    }

    pub async fn list_instances(&self) -> Vec<InstanceInfo> {
        self.registry.list().await
    }

    /// Runs one janitor sweep immediately, outside the periodic schedule.
    pub async fn sweep_now(self: &Arc<Self>) {
        janitor::sweep(self).await;
    }

    /// Destroys the cached instance and context for one session; idempotent.
    pub async fn destroy_session_instance(
        &self,
        agent_id: &str,
        session_id: Option<&str>,
    ) -> bool {
        let key = SessionKey::new(agent_id, session_id.map(str::to_string));
        let destroyed = self.registry.destroy(&key).await;
        self.contexts.destroy(&key).await;
        destroyed
    }

    /// Destroys every cached instance (and context) derived from an agent.
    pub async fn destroy_agent_instances(&self, agent_id: &str) -> usize {
        let doomed: Vec<SessionKey> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| key.agent_id() == agent_id)
            .collect();
        let mut removed = 0;
        for key in doomed {
            if self.registry.destroy(&key).await {
                self.contexts.destroy(&key).await;
                removed += 1;
            }
        }
        removed
    }

    pub async fn stats(&self) -> Result<ManagerStats> {
        Ok(ManagerStats {
            worker_count: self.config.workers,
            active_instances: self.registry.count().await,
            running_tasks: self.running_tasks.load(Ordering::SeqCst),
            queue_type: self.queue.backend_name().to_string(),
            task_queue_stats: self.queue.stats(TASK_QUEUE).await?,
            result_queue_stats: self.queue.stats(RESULT_QUEUE).await?,
        })
    }

    pub(crate) fn task_started(&self) {
        self.running_tasks.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn task_finished(&self) {
        self.running_tasks.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) async fn mark_stream_producing(&self, task_id: &str) {
        let mut streams = self.streams.lock().await;
        if let Some(state) = streams.get_mut(task_id) {
            state.producer_active = true;
        }
    }

    pub(crate) async fn mark_stream_finished(&self, task_id: &str) {
        let mut streams = self.streams.lock().await;
        if let Some(state) = streams.get_mut(task_id) {
            state.producer_active = false;
            state.finished = true;
        }
    }

    /// Tears a stream queue down and forgets its bookkeeping.
    pub(crate) async fn drop_stream(&self, task_id: &str) {
        let _ = self.queue.delete_queue(&stream_queue_name(task_id)).await;
        let mut streams = self.streams.lock().await;
        streams.remove(task_id);
    }

    /// Stream queues eligible for janitor teardown. Subscribed streams are
    /// left to their forwarder, which tears the queue down itself on the
    /// terminal chunk or disconnect.
    pub(crate) async fn stale_streams(&self) -> Vec<String> {
        let deadline = Duration::from_secs(self.config.task_timeout_seconds);
        let streams = self.streams.lock().await;
        let mut stale = Vec::new();
        for (task_id, state) in streams.iter() {
            if state.subscribed {
                continue;
            }
            if state.finished {
                stale.push(task_id.clone());
                continue;
            }
            if !state.producer_active && state.created_at.elapsed() > deadline {
                let pending = self
                    .queue
                    .stats(&stream_queue_name(task_id))
                    .await
                    .map(|s| s.pending)
                    .unwrap_or(0);
                if pending == 0 {
                    stale.push(task_id.clone());
                }
            }
        }
        stale
    }
}

/// Forwards queue chunks to an in-process subscriber until the terminal
/// chunk, consumer cancellation, or stream inactivity timeout.
async fn forward_stream(
    manager: Arc<TaskManager>,
    task_id: String,
    tx: mpsc::Sender<StreamChunk>,
) {
    let stream_queue = stream_queue_name(&task_id);
    let poll = Duration::from_millis(CONSUME_POLL_TIMEOUT_MS);
    let inactivity_limit = Duration::from_secs(manager.config.task_timeout_seconds);
    let mut last_activity = Instant::now();

    loop {
        let waited = Instant::now();
        match manager.queue.consume(&stream_queue, poll).await {
            Ok(Some(message)) => {
                last_activity = Instant::now();
                let chunk: StreamChunk = match message.decode() {
                    Ok(chunk) => chunk,
                    Err(error) => {
                        warn!("malformed chunk on {}: {}", stream_queue, error);
                        let _ = manager.queue.ack(&stream_queue, &message.id).await;
                        continue;
                    }
                };
                let _ = manager.queue.ack(&stream_queue, &message.id).await;
                let terminal = chunk.is_terminal();
                if tx.send(chunk).await.is_err() {
                    debug!("stream consumer for {} disconnected", task_id);
                    break;
                }
                if terminal {
                    break;
                }
            }
            Ok(None) => {
                // A live empty queue waits out the poll; an immediate None
                // means the queue was deleted under us.
                if waited.elapsed() < poll / 2 {
                    debug!("stream queue {} closed", stream_queue);
                    break;
                }
                if last_activity.elapsed() > inactivity_limit {
                    warn!("stream {} inactive past deadline, closing", task_id);
                    break;
                }
            }
            Err(error) => {
                warn!("stream {} consume failed: {}", task_id, error);
                break;
            }
        }
    }

    manager.drop_stream(&task_id).await;
}
