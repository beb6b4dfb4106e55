//! Shared fixtures: throwaway runtimes and instrumented test templates.

use crate::{
    config::RuntimeConfig,
    models::{AgentConfiguration, ChatMessage, Role, StreamChunk, TaskResult, Usage},
    runtime::AgentRuntime,
    service::dto::CreateAgentRequest,
    templates::{
        AgentExecutor, ChunkStream, ConfigSchema, ExecutionParams, TemplateFactory,
        TemplateMetadata,
    },
    Result, RuntimeError,
};
use async_trait::async_trait;
use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub(crate) fn test_config(workers: usize) -> RuntimeConfig {
    RuntimeConfig {
        workers,
        // Keep the periodic janitor out of the way; sweeps are triggered
        // explicitly where a test needs one.
        cleanup_interval_seconds: 3600,
        instance_timeout_seconds: 7200,
        ..RuntimeConfig::default()
    }
}

/// Runtime with the built-in echo template and a seeded `echo` agent.
pub(crate) async fn echo_runtime(workers: usize) -> AgentRuntime {
    let runtime = AgentRuntime::start(test_config(workers)).await.unwrap();
    runtime.seed_default_agent().await.unwrap();
    runtime
}

pub(crate) fn user(content: &str) -> ChatMessage {
    ChatMessage::user(content)
}

fn plain_metadata(template_id: &str, description: &str) -> TemplateMetadata {
    TemplateMetadata {
        template_id: template_id.to_string(),
        template_version: "1.0".to_string(),
        description: description.to_string(),
        config_schema: ConfigSchema::default(),
    }
}

fn last_user_content(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

fn single_chunk_stream(params: &ExecutionParams, content: String) -> ChunkStream {
    let task_id = params.task_id.clone();
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        let _ = tx.send(Ok(StreamChunk::delta(task_id.clone(), 0, content))).await;
        let _ = tx
            .send(Ok(StreamChunk::terminal(
                task_id,
                1,
                crate::models::FinishReason::Stop,
            )))
            .await;
    });
    Box::pin(ReceiverStream::new(rx))
}

/// Records execution intervals so tests can assert serialisation.
pub(crate) struct RecordingTemplate {
    metadata: TemplateMetadata,
    pub spans: Arc<Mutex<Vec<(Instant, Instant)>>>,
    busy_for: Duration,
}

impl RecordingTemplate {
    pub(crate) fn new(busy_for: Duration) -> Self {
        Self {
            metadata: plain_metadata("recording", "records execution spans"),
            spans: Arc::new(Mutex::new(Vec::new())),
            busy_for,
        }
    }
}

#[async_trait]
impl TemplateFactory for RecordingTemplate {
    fn metadata(&self) -> &TemplateMetadata {
        &self.metadata
    }

    async fn instantiate(&self, _config: &AgentConfiguration) -> Result<Arc<dyn AgentExecutor>> {
        Ok(Arc::new(RecordingExecutor {
            metadata: self.metadata.clone(),
            spans: self.spans.clone(),
            busy_for: self.busy_for,
        }))
    }
}

struct RecordingExecutor {
    metadata: TemplateMetadata,
    spans: Arc<Mutex<Vec<(Instant, Instant)>>>,
    busy_for: Duration,
}

#[async_trait]
impl AgentExecutor for RecordingExecutor {
    fn metadata(&self) -> &TemplateMetadata {
        &self.metadata
    }

    async fn execute(
        &self,
        messages: &[ChatMessage],
        params: &ExecutionParams,
    ) -> Result<TaskResult> {
        let start = Instant::now();
        tokio::time::sleep(self.busy_for).await;
        let reply = last_user_content(messages);
        self.spans.lock().unwrap().push((start, Instant::now()));
        Ok(TaskResult::success(
            params.task_id.clone(),
            ChatMessage::assistant(reply),
            Usage::new(1, 1),
        ))
    }

    async fn stream_execute(
        &self,
        messages: &[ChatMessage],
        params: &ExecutionParams,
    ) -> Result<ChunkStream> {
        Ok(single_chunk_stream(params, last_user_content(messages)))
    }
}

/// Fails on demand: any user message containing `explode` raises.
pub(crate) struct FlakyTemplate {
    metadata: TemplateMetadata,
}

impl FlakyTemplate {
    pub(crate) fn new() -> Self {
        Self {
            metadata: plain_metadata("flaky", "fails when told to"),
        }
    }
}

#[async_trait]
impl TemplateFactory for FlakyTemplate {
    fn metadata(&self) -> &TemplateMetadata {
        &self.metadata
    }

    async fn instantiate(&self, _config: &AgentConfiguration) -> Result<Arc<dyn AgentExecutor>> {
        Ok(Arc::new(FlakyExecutor {
            metadata: self.metadata.clone(),
        }))
    }
}

struct FlakyExecutor {
    metadata: TemplateMetadata,
}

#[async_trait]
impl AgentExecutor for FlakyExecutor {
    fn metadata(&self) -> &TemplateMetadata {
        &self.metadata
    }

    async fn execute(
        &self,
        messages: &[ChatMessage],
        params: &ExecutionParams,
    ) -> Result<TaskResult> {
        let content = last_user_content(messages);
        if content.contains("explode") {
            return Err(RuntimeError::Executor {
                message: "template detonated".to_string(),
            });
        }
        Ok(TaskResult::success(
            params.task_id.clone(),
            ChatMessage::assistant(content),
            Usage::new(1, 1),
        ))
    }

    async fn stream_execute(
        &self,
        messages: &[ChatMessage],
        params: &ExecutionParams,
    ) -> Result<ChunkStream> {
        let content = last_user_content(messages);
        if content.contains("explode") {
            return Err(RuntimeError::Executor {
                message: "template detonated".to_string(),
            });
        }
        Ok(single_chunk_stream(params, content))
    }
}

/// Registers an extra template and one agent bound to it.
pub(crate) async fn add_agent(
    runtime: &AgentRuntime,
    factory: Arc<dyn TemplateFactory>,
    agent_id: &str,
) {
    let template_id = factory.metadata().template_id.clone();
    runtime.templates.register(factory).await.unwrap();
    runtime
        .service
        .create_agent(CreateAgentRequest {
            id: Some(agent_id.to_string()),
            name: agent_id.to_string(),
            template_id,
            template_version: None,
            configuration: Default::default(),
            metadata: Default::default(),
        })
        .await
        .unwrap();
}
