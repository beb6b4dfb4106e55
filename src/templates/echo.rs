//! Built-in deterministic reference template.
//!
//! Answers with the last user message, optionally prefixed. The streamed
//! rendition splits the same reply into whitespace-preserving fragments, so
//! concatenating the deltas reproduces the non-streamed content exactly.

use super::{
    AgentExecutor, ChunkStream, ConfigField, ConfigSchema, ExecutionParams, FieldType,
    TemplateFactory, TemplateMetadata, ValidationResult,
};
use crate::{
    models::{AgentConfiguration, ChatMessage, FinishReason, Role, StreamChunk, TaskResult, Usage},
    Result, RuntimeError,
};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const TEMPLATE_ID: &str = "echo";
const DEFAULT_VERSION: &str = "1.0";
/// Channel capacity between the producing task and the stream consumer.
const STREAM_BUFFER: usize = 16;

fn echo_metadata(version: &str) -> TemplateMetadata {
    TemplateMetadata {
        template_id: TEMPLATE_ID.to_string(),
        template_version: version.to_string(),
        description: "Deterministic template answering with the last user message".to_string(),
        config_schema: ConfigSchema {
            fields: vec![
                ConfigField {
                    name: "prefix".to_string(),
                    field_type: FieldType::String,
                    required: false,
                    description: "Text prepended to every reply".to_string(),
                    default: Some(serde_json::json!("")),
                },
                ConfigField {
                    name: "delay_ms".to_string(),
                    field_type: FieldType::Integer,
                    required: false,
                    description: "Artificial delay between streamed fragments".to_string(),
                    default: Some(serde_json::json!(0)),
                },
            ],
        },
    }
}

fn estimate_tokens(content: &str) -> u32 {
    content.split_whitespace().count() as u32
}

/// Factory for the echo template
pub struct EchoTemplate {
    metadata: TemplateMetadata,
}

impl Default for EchoTemplate {
    fn default() -> Self {
        Self::new()
    }
}

impl EchoTemplate {
    pub fn new() -> Self {
        Self::with_version(DEFAULT_VERSION)
    }

    pub fn with_version(version: &str) -> Self {
        Self {
            metadata: echo_metadata(version),
        }
    }
}

#[async_trait]
impl TemplateFactory for EchoTemplate {
    fn metadata(&self) -> &TemplateMetadata {
        &self.metadata
    }

    fn validate_config(&self, config: &HashMap<String, serde_json::Value>) -> ValidationResult {
        let mut result = self.metadata.config_schema.validate(config);
        if let Some(delay) = config.get("delay_ms").and_then(|v| v.as_u64()) {
            if delay > 10_000 {
                result
                    .warnings
                    .push("delay_ms above 10s will starve stream consumers".to_string());
            }
        }
        result
    }

    async fn instantiate(&self, config: &AgentConfiguration) -> Result<Arc<dyn AgentExecutor>> {
        let validation = self.validate_config(&config.configuration);
        if !validation.is_valid() {
            return Err(RuntimeError::Validation(validation.errors.join("; ")));
        }
        let prefix = config
            .configuration
            .get("prefix")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let delay_ms = config
            .configuration
            .get("delay_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        Ok(Arc::new(EchoExecutor {
            metadata: self.metadata.clone(),
            prefix,
            delay: Duration::from_millis(delay_ms),
        }))
    }
}

/// Live executor produced by [`EchoTemplate`]
pub struct EchoExecutor {
    metadata: TemplateMetadata,
    prefix: String,
    delay: Duration,
}

impl EchoExecutor {
    fn reply_for(&self, messages: &[ChatMessage]) -> String {
        let source = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .or_else(|| messages.last());
        match source {
            Some(message) => format!("{}{}", self.prefix, message.content),
            None => self.prefix.clone(),
        }
    }

    fn usage_for(&self, messages: &[ChatMessage], reply: &str) -> Usage {
        let prompt = messages.iter().map(|m| estimate_tokens(&m.content)).sum();
        Usage::new(prompt, estimate_tokens(reply))
    }
}

#[async_trait]
impl AgentExecutor for EchoExecutor {
    fn metadata(&self) -> &TemplateMetadata {
        &self.metadata
    }

    async fn execute(
        &self,
        messages: &[ChatMessage],
        params: &ExecutionParams,
    ) -> Result<TaskResult> {
        let reply = self.reply_for(messages);
        let usage = self.usage_for(messages, &reply);
        Ok(TaskResult::success(
            params.task_id.clone(),
            ChatMessage::assistant(reply),
            usage,
        ))
    }

    async fn stream_execute(
        &self,
        messages: &[ChatMessage],
        params: &ExecutionParams,
    ) -> Result<ChunkStream> {
        let reply = self.reply_for(messages);
        let task_id = params.task_id.clone();
        let delay = self.delay;

        let fragments: Vec<String> = if reply.is_empty() {
            Vec::new()
        } else {
            reply.split_inclusive(' ').map(str::to_string).collect()
        };

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let mut index = 0u64;
            for fragment in fragments {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let chunk = StreamChunk::delta(task_id.clone(), index, fragment);
                if tx.send(Ok(chunk)).await.is_err() {
                    // Consumer gone; stop producing.
                    return;
                }
                index += 1;
            }
            let terminal = StreamChunk::terminal(task_id, index, FinishReason::Stop);
            let _ = tx.send(Ok(terminal)).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn executor(prefix: &str) -> Arc<dyn AgentExecutor> {
        let config = AgentConfiguration::new("a1", "echo agent", TEMPLATE_ID, DEFAULT_VERSION)
            .with_option("prefix", serde_json::json!(prefix));
        EchoTemplate::new().instantiate(&config).await.unwrap()
    }

    #[tokio::test]
    async fn execute_echoes_last_user_message() {
        let executor = executor("you said: ").await;
        let messages = vec![
            ChatMessage::user("hello"),
            ChatMessage::assistant("hi"),
            ChatMessage::user("ping pong"),
        ];
        let params = ExecutionParams {
            task_id: "t1".to_string(),
            ..ExecutionParams::default()
        };

        let result = executor.execute(&messages, &params).await.unwrap();
        assert!(result.success);
        let message = result.message.unwrap();
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.content, "you said: ping pong");
        assert_eq!(result.finish_reason, FinishReason::Stop);
        assert_eq!(result.usage.completion_tokens, 4);
    }

    #[tokio::test]
    async fn stream_concatenation_matches_execute() {
        let executor = executor("").await;
        let messages = vec![ChatMessage::user("the quick brown fox")];
        let params = ExecutionParams {
            task_id: "t2".to_string(),
            ..ExecutionParams::default()
        };

        let single = executor.execute(&messages, &params).await.unwrap();
        let mut stream = executor.stream_execute(&messages, &params).await.unwrap();

        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk.unwrap());
        }

        assert!(chunks.len() > 1);
        let (terminal, deltas) = chunks.split_last().unwrap();
        assert_eq!(terminal.finish_reason, Some(FinishReason::Stop));
        assert!(deltas.iter().all(|c| c.finish_reason.is_none()));

        let assembled: String = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(assembled, single.message.unwrap().content);
    }

    #[tokio::test]
    async fn invalid_config_fails_instantiation() {
        let config = AgentConfiguration::new("a1", "bad", TEMPLATE_ID, DEFAULT_VERSION)
            .with_option("prefix", serde_json::json!(42));
        assert!(EchoTemplate::new().instantiate(&config).await.is_err());
    }
}
