//! Runtime assembly.
//!
//! All long-lived components are owned by an explicit [`AgentRuntime`]
//! handle constructed at startup and passed down; there are no process-wide
//! singletons, and tests construct throwaway runtimes.

use crate::{
    config::RuntimeConfig,
    context::ContextStore,
    manager::TaskManager,
    models::AgentConfiguration,
    queue::{self, MessageQueue},
    registry::InstanceRegistry,
    service::{dto::CreateAgentRequest, ExecutionService},
    store::{AgentConfigStore, InMemoryAgentConfigStore},
    templates::{EchoTemplate, TemplateRegistry},
    Result,
};
use std::{sync::Arc, time::Duration};
use tracing::info;

pub struct AgentRuntime {
    pub config: Arc<RuntimeConfig>,
    pub queue: Arc<dyn MessageQueue>,
    pub templates: Arc<TemplateRegistry>,
    pub configs: Arc<dyn AgentConfigStore>,
    pub contexts: Arc<ContextStore>,
    pub registry: Arc<InstanceRegistry>,
    pub manager: Arc<TaskManager>,
    pub service: Arc<ExecutionService>,
}

impl AgentRuntime {
    /// Builds every component, registers the built-in templates, and starts
    /// the task manager. An unimplemented MQ backend fails here, at startup.
    pub async fn start(config: RuntimeConfig) -> Result<Self> {
        let config = Arc::new(config);
        let queue = queue::build(&config.mq)?;

        let templates = Arc::new(TemplateRegistry::new());
        templates.register(Arc::new(EchoTemplate::new())).await?;

        let configs: Arc<dyn AgentConfigStore> = Arc::new(InMemoryAgentConfigStore::new());
        let contexts = Arc::new(ContextStore::new(config.max_history));
        let registry = Arc::new(InstanceRegistry::new(templates.clone(), configs.clone()));

        let manager = TaskManager::new(
            queue.clone(),
            registry.clone(),
            contexts.clone(),
            config.clone(),
        );
        manager.start().await?;

        let service = Arc::new(ExecutionService::new(
            manager.clone(),
            configs.clone(),
            templates.clone(),
            Duration::from_secs(config.task_timeout_seconds),
        ));

        info!("agent runtime assembled");
        Ok(Self {
            config,
            queue,
            templates,
            configs,
            contexts,
            registry,
            manager,
            service,
        })
    }

    /// Seeds the default `echo` agent so a fresh deployment answers
    /// completions without any setup.
    pub async fn seed_default_agent(&self) -> Result<AgentConfiguration> {
        self.service
            .create_agent(CreateAgentRequest {
                id: Some("echo".to_string()),
                name: "Echo".to_string(),
                template_id: "echo".to_string(),
                template_version: None,
                configuration: Default::default(),
                metadata: Default::default(),
            })
            .await
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}
