//! Execution service: thin orchestrator above the task manager.
//!
//! Looks up agent configurations, mints sessions, shapes task requests, and
//! converts manager results into the caller's wire types.

pub mod dto;

use crate::{
    manager::TaskManager,
    models::{AgentConfiguration, ChatMessage, TaskRequest},
    store::AgentConfigStore,
    templates::{TemplateMetadata, TemplateRegistry},
    Result, RuntimeError,
};
use dto::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, CreateAgentRequest,
};
use futures::{stream::BoxStream, StreamExt};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};
use uuid::Uuid;

pub struct ExecutionService {
    manager: Arc<TaskManager>,
    configs: Arc<dyn AgentConfigStore>,
    templates: Arc<TemplateRegistry>,
    wait_timeout: Duration,
}

impl ExecutionService {
    pub fn new(
        manager: Arc<TaskManager>,
        configs: Arc<dyn AgentConfigStore>,
        templates: Arc<TemplateRegistry>,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            manager,
            configs,
            templates,
            wait_timeout,
        }
    }

    pub fn manager(&self) -> &Arc<TaskManager> {
        &self.manager
    }

    /// Validates the configuration against the template schema and stores
    /// the agent. Schema errors reject the agent; warnings are logged.
    pub async fn create_agent(&self, request: CreateAgentRequest) -> Result<AgentConfiguration> {
        let factory = self
            .templates
            .resolve(&request.template_id, request.template_version.as_deref())
            .await?;
        let validation = factory.validate_config(&request.configuration);
        for warning in &validation.warnings {
            warn!("agent configuration warning: {}", warning);
        }
        if !validation.is_valid() {
            return Err(RuntimeError::Validation(validation.errors.join("; ")));
        }

        let metadata = factory.metadata();
        let config = AgentConfiguration {
            id: request.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: request.name,
            template_id: metadata.template_id.clone(),
            template_version: metadata.template_version.clone(),
            configuration: request.configuration,
            metadata: request.metadata,
        };
        self.configs.save(config.clone()).await?;
        info!("created agent {} ({})", config.id, config.name);
        Ok(config)
    }

    /// Deletes an agent configuration and every cached session instance
    /// derived from it.
    pub async fn delete_agent(&self, agent_id: &str) -> Result<bool> {
        let existed = self.configs.delete(agent_id).await?;
        if existed {
            let destroyed = self.manager.destroy_agent_instances(agent_id).await;
            info!(
                "deleted agent {} and {} cached instances",
                agent_id, destroyed
            );
        }
        Ok(existed)
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<AgentConfiguration> {
        self.configs.find(agent_id).await
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentConfiguration>> {
        self.configs.list().await
    }

    pub async fn list_templates(&self) -> Vec<TemplateMetadata> {
        self.templates.list().await
    }

    /// Non-streaming completion: submit, await the correlated result,
    /// convert.
    pub async fn complete(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse> {
        let config = self.configs.find(&request.model).await?;
        let (task, session_id) = self.build_task(&request, false)?;
        let task_id = self.manager.submit_task(task).await?;
        let result = self.manager.wait_result(&task_id, self.wait_timeout).await?;
        Ok(dto::completion_response(&config.id, &session_id, &result))
    }

    /// Streaming completion: submit, subscribe, convert each chunk. The
    /// caller's disconnect drops the stream, which cancels the subscription
    /// and stops the worker.
    pub async fn complete_stream(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<(String, BoxStream<'static, ChatCompletionChunk>)> {
        let config = self.configs.find(&request.model).await?;
        let (task, session_id) = self.build_task(&request, true)?;
        let task_id = self.manager.submit_task(task).await?;
        let chunks = self.manager.subscribe_stream(&task_id).await?;

        let model = config.id.clone();
        let echoed_session = session_id.clone();
        let events = chunks
            .map(move |chunk| dto::completion_chunk(&model, &echoed_session, &chunk))
            .boxed();
        Ok((session_id, events))
    }

    /// Shapes a task request, minting a session id when the caller omitted
    /// one so the conversation can continue.
    fn build_task(
        &self,
        request: &ChatCompletionRequest,
        stream: bool,
    ) -> Result<(TaskRequest, String)> {
        let messages: Vec<ChatMessage> = request
            .messages
            .iter()
            .map(ChatMessage::try_from)
            .collect::<Result<_>>()?;

        let session_id = request
            .session_id
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut task = TaskRequest::new(&request.model, messages)
            .with_session(session_id.clone())
            .with_stream(stream);
        task.temperature = request.temperature;
        task.max_tokens = request.max_tokens;
        task.metadata = request.metadata.clone();
        if let Some(priority) = request.priority {
            task.priority = priority;
        }
        task.timeout_seconds = self.manager.config.task_timeout_seconds;
        task.validate()?;
        Ok((task, session_id))
    }
}
