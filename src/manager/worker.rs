//! Worker loop: dequeue, resolve instance, execute, publish, ack.
//!
//! Executor failures become error-bearing results or terminal error chunks;
//! they never propagate past the worker. Only transport failures reach the
//! retry/dead-letter machinery.

use super::TaskManager;
use crate::{
    constants::{
        CONSUME_POLL_TIMEOUT_MS, RESULT_QUEUE, RETRY_BASE_DELAY_MS, RETRY_MAX_DELAY_MS,
        STREAM_BACKPRESSURE_DELAY_MS, TASK_QUEUE,
    },
    models::{ChatMessage, FinishReason, Priority, StreamChunk, TaskRequest, TaskResult},
    queue::{stream_queue_name, MessageType, QueueMessage},
    registry::AgentInstance,
    templates::ExecutionParams,
    Result, RuntimeError,
};
use futures::StreamExt;
use rand::Rng;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::watch;
use tracing::{debug, error, warn};

pub(super) async fn worker_loop(
    manager: Arc<TaskManager>,
    worker_id: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("worker {} started", worker_id);
    let poll = Duration::from_millis(CONSUME_POLL_TIMEOUT_MS);

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            consumed = manager.queue.consume(TASK_QUEUE, poll) => match consumed {
                Ok(Some(message)) => handle_message(&manager, worker_id, message).await,
                Ok(None) => {}
                Err(e) => {
                    warn!("worker {} consume failed: {}", worker_id, e);
                    tokio::time::sleep(Duration::from_millis(RETRY_BASE_DELAY_MS)).await;
                }
            },
        }
    }
    debug!("worker {} stopped", worker_id);
}

async fn handle_message(manager: &Arc<TaskManager>, worker_id: usize, message: QueueMessage) {
    let request: TaskRequest = match message.decode() {
        Ok(request) => request,
        Err(e) => {
            warn!("worker {} dropping malformed task payload: {}", worker_id, e);
            let _ = manager.queue.ack(TASK_QUEUE, &message.id).await;
            return;
        }
    };

    manager.task_started();
    let outcome = process_task(manager, &request).await;
    manager.task_finished();

    match outcome {
        Ok(()) => {
            let _ = manager.queue.ack(TASK_QUEUE, &message.id).await;
        }
        Err(e) => {
            // Delivery machinery failed after in-place retries; dead-letter
            // the task message rather than re-executing it.
            error!("task {} failed in transport: {}", request.task_id, e);
            let _ = manager.queue.nack(TASK_QUEUE, &message.id, false).await;
        }
    }
}

async fn process_task(manager: &Arc<TaskManager>, request: &TaskRequest) -> Result<()> {
    let session_key = request.session_key();
    let started = Instant::now();

    let instance = match manager
        .registry
        .get_or_create(&request.agent_id, request.session_id.as_deref())
        .await
    {
        Ok(instance) => instance,
        Err(e) => return report_dispatch_failure(manager, request, &e.to_string()).await,
    };

    // One execution per instance at a time; held across the whole run.
    let _guard = instance.acquire().await;

    manager
        .contexts
        .append(&session_key, request.messages.clone())
        .await;
    let history = manager.contexts.history(&session_key).await;
    let params = ExecutionParams::from_request(request);

    let outcome = if request.stream {
        run_streaming(manager, request, &instance, &history, &params).await
    } else {
        run_single(manager, request, &instance, &history, &params, started).await
    };

    manager.contexts.touch(&session_key).await;
    outcome
}

/// Instance resolution failed before execution: surface the error on the
/// channel the submitter is watching.
async fn report_dispatch_failure(
    manager: &Arc<TaskManager>,
    request: &TaskRequest,
    error: &str,
) -> Result<()> {
    warn!("task {} dispatch failed: {}", request.task_id, error);
    if request.stream {
        let chunk = StreamChunk::terminal_error(&request.task_id, 0, error);
        publish_chunk(manager, request, chunk).await;
        manager.mark_stream_finished(&request.task_id).await;
        Ok(())
    } else {
        let result = TaskResult::failure(&request.task_id, error);
        publish_result(manager, request, &result).await
    }
}

async fn run_single(
    manager: &Arc<TaskManager>,
    request: &TaskRequest,
    instance: &Arc<AgentInstance>,
    history: &[ChatMessage],
    params: &ExecutionParams,
    started: Instant,
) -> Result<()> {
    let session_key = request.session_key();
    let result = match remaining_time(request) {
        None => TaskResult::timed_out(&request.task_id),
        Some(remaining) => {
            let execution = instance.executor().execute(history, params);
            match tokio::time::timeout(remaining, execution).await {
                Err(_) => TaskResult::timed_out(&request.task_id),
                Ok(Err(e)) => TaskResult::failure(&request.task_id, e.to_string()),
                Ok(Ok(mut result)) => {
                    result.task_id = request.task_id.clone();
                    result
                }
            }
        }
    };
    let result = result.with_processing_time(started.elapsed().as_millis() as u64);

    if result.success {
        if let Some(message) = &result.message {
            manager
                .contexts
                .append(&session_key, vec![message.clone()])
                .await;
        }
    }

    publish_result(manager, request, &result).await
}

async fn run_streaming(
    manager: &Arc<TaskManager>,
    request: &TaskRequest,
    instance: &Arc<AgentInstance>,
    history: &[ChatMessage],
    params: &ExecutionParams,
) -> Result<()> {
    let session_key = request.session_key();
    manager.mark_stream_producing(&request.task_id).await;

    let mut next_index = 0u64;
    let mut assembled = String::new();
    let mut sent_terminal = false;

    match instance.executor().stream_execute(history, params).await {
        Err(e) => {
            let chunk = StreamChunk::terminal_error(&request.task_id, next_index, e.to_string());
            publish_chunk(manager, request, chunk).await;
            sent_terminal = true;
        }
        Ok(mut stream) => {
            let deadline = stream_deadline(request);
            loop {
                let next = tokio::time::timeout_at(deadline, stream.next()).await;
                match next {
                    // Deadline expired mid-stream: stop generating, report
                    // length with a timeout marker.
                    Err(_) => {
                        let mut chunk = StreamChunk::terminal(
                            &request.task_id,
                            next_index,
                            FinishReason::Length,
                        );
                        chunk
                            .metadata
                            .insert("timeout".to_string(), serde_json::Value::Bool(true));
                        sent_terminal = publish_chunk(manager, request, chunk).await;
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        let chunk = StreamChunk::terminal_error(
                            &request.task_id,
                            next_index,
                            e.to_string(),
                        );
                        sent_terminal = publish_chunk(manager, request, chunk).await;
                        break;
                    }
                    Ok(Some(Ok(mut chunk))) => {
                        chunk.task_id = request.task_id.clone();
                        chunk.chunk_index = next_index;
                        let terminal = chunk.is_terminal();
                        assembled.push_str(&chunk.content);
                        if !publish_chunk(manager, request, chunk).await {
                            // Consumer cancelled; stop generating.
                            debug!("stream {} cancelled by consumer", request.task_id);
                            break;
                        }
                        next_index += 1;
                        if terminal {
                            sent_terminal = true;
                            break;
                        }
                    }
                }
            }

            if !sent_terminal {
                // Producer ended without a finish_reason; synthesize stop.
                let chunk =
                    StreamChunk::terminal(&request.task_id, next_index, FinishReason::Stop);
                publish_chunk(manager, request, chunk).await;
            }
        }
    }

    if !assembled.is_empty() {
        manager
            .contexts
            .append(&session_key, vec![ChatMessage::assistant(assembled)])
            .await;
    }
    manager.mark_stream_finished(&request.task_id).await;
    Ok(())
}

/// Time left before the task's effective deadline, if any.
fn remaining_time(request: &TaskRequest) -> Option<Duration> {
    let remaining = request.deadline() - chrono::Utc::now();
    remaining.to_std().ok().filter(|d| !d.is_zero())
}

fn stream_deadline(request: &TaskRequest) -> tokio::time::Instant {
    let remaining = remaining_time(request).unwrap_or(Duration::ZERO);
    tokio::time::Instant::now() + remaining
}

/// Publishes one chunk to the task's stream queue, waiting out a slow
/// consumer. Returns false once the consumer is gone (queue closed) or the
/// deadline passes; the caller stops generating.
async fn publish_chunk(
    manager: &Arc<TaskManager>,
    request: &TaskRequest,
    chunk: StreamChunk,
) -> bool {
    let queue_name = stream_queue_name(&request.task_id);
    let deadline = stream_deadline(request);

    let message = match QueueMessage::new(
        MessageType::StreamChunk,
        &chunk,
        Priority::High,
        &request.task_id,
    ) {
        Ok(message) => message,
        Err(e) => {
            error!("failed to encode chunk for {}: {}", request.task_id, e);
            return false;
        }
    };

    loop {
        match manager.queue.publish(&queue_name, message.clone()).await {
            Ok(()) => return true,
            Err(RuntimeError::QueueClosed(_)) => return false,
            Err(RuntimeError::QueueFull(_)) => {
                // Slow consumer; back off until space frees or the deadline
                // passes.
                if tokio::time::Instant::now() >= deadline {
                    warn!("stream {} backpressure past deadline", request.task_id);
                    return false;
                }
                tokio::time::sleep(Duration::from_millis(STREAM_BACKPRESSURE_DELAY_MS)).await;
            }
            Err(e) => {
                warn!("stream {} publish failed: {}", request.task_id, e);
                return false;
            }
        }
    }
}

/// Publishes the task result to the shared result queue, retrying transient
/// failures with exponential backoff before giving up.
async fn publish_result(
    manager: &Arc<TaskManager>,
    request: &TaskRequest,
    result: &TaskResult,
) -> Result<()> {
    let message = QueueMessage::new(
        MessageType::TaskResult,
        result,
        request.priority,
        &request.task_id,
    )?;

    let mut delay = RETRY_BASE_DELAY_MS;
    let max_retries = crate::constants::DEFAULT_MAX_RETRIES;
    let mut attempt = 0;
    loop {
        match manager.queue.publish(RESULT_QUEUE, message.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt < max_retries => {
                attempt += 1;
                let jitter = rand::thread_rng().gen_range(0..=delay / 4 + 1);
                warn!(
                    "result publish for {} failed (attempt {}): {}",
                    request.task_id, attempt, e
                );
                tokio::time::sleep(Duration::from_millis(delay + jitter)).await;
                delay = (delay * 2).min(RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}
