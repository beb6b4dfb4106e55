//! OpenAI-compatible wire types.
//!
//! These shapes are what the HTTP surface serialises; the runtime's internal
//! types never leak onto the wire. Streamed chunks carry per-event deltas,
//! never cumulative content.

use crate::{
    models::{ChatMessage, Priority, Role, StreamChunk, TaskResult, Usage},
    Result, RuntimeError,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

pub const OBJECT_COMPLETION: &str = "chat.completion";
pub const OBJECT_COMPLETION_CHUNK: &str = "chat.completion.chunk";

/// Incoming completion request
///
/// `model` addresses an agent id. `session_id` is the continuation
/// extension: echoed back in response metadata, minted when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatCompletionMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionMessage {
    pub role: String,
    pub content: String,
}

impl TryFrom<&ChatCompletionMessage> for ChatMessage {
    type Error = RuntimeError;

    fn try_from(message: &ChatCompletionMessage) -> Result<Self> {
        let role = Role::from_str(&message.role).map_err(RuntimeError::Validation)?;
        Ok(ChatMessage::new(role, message.content.clone()))
    }
}

impl From<&ChatMessage> for ChatCompletionMessage {
    fn from(message: &ChatMessage) -> Self {
        Self {
            role: message.role.to_string(),
            content: message.content.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatCompletionMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChunkChoice>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChunkChoice {
    pub index: u32,
    pub delta: ChatDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCard {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelCard>,
}

/// Agent creation payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAgentRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub template_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_version: Option<String>,
    #[serde(default)]
    pub configuration: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Builds the non-streaming response shape from a task result.
pub fn completion_response(
    model: &str,
    session_id: &str,
    result: &TaskResult,
) -> ChatCompletionResponse {
    let message = match (&result.message, &result.error) {
        (Some(message), _) => ChatCompletionMessage::from(message),
        (None, error) => ChatCompletionMessage {
            role: Role::Assistant.to_string(),
            content: error.clone().unwrap_or_default(),
        },
    };

    let mut metadata = result.metadata.clone();
    metadata.insert(
        "session_id".to_string(),
        serde_json::Value::String(session_id.to_string()),
    );
    metadata.insert(
        "task_id".to_string(),
        serde_json::Value::String(result.task_id.clone()),
    );

    ChatCompletionResponse {
        id: format!("chatcmpl-{}", result.task_id),
        object: OBJECT_COMPLETION.to_string(),
        created: chrono::Utc::now().timestamp(),
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message,
            finish_reason: Some(result.finish_reason.as_str().to_string()),
        }],
        usage: result.usage,
        metadata,
    }
}

/// Builds one streamed event from a chunk. The first event carries the
/// assistant role and the session id; only the terminal event carries a
/// finish reason.
pub fn completion_chunk(
    model: &str,
    session_id: &str,
    chunk: &StreamChunk,
) -> ChatCompletionChunk {
    let first = chunk.chunk_index == 0;
    let delta = ChatDelta {
        role: first.then(|| Role::Assistant.to_string()),
        content: (!chunk.content.is_empty()).then(|| chunk.content.clone()),
    };

    let mut metadata = HashMap::new();
    if first {
        metadata.insert(
            "session_id".to_string(),
            serde_json::Value::String(session_id.to_string()),
        );
    }
    if let Some(error) = chunk.metadata.get("error") {
        metadata.insert("error".to_string(), error.clone());
    }

    ChatCompletionChunk {
        id: format!("chatcmpl-{}", chunk.task_id),
        object: OBJECT_COMPLETION_CHUNK.to_string(),
        created: chrono::Utc::now().timestamp(),
        model: model.to_string(),
        choices: vec![ChatChunkChoice {
            index: 0,
            delta,
            finish_reason: chunk.finish_reason.map(|r| r.as_str().to_string()),
        }],
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FinishReason;

    #[test]
    fn response_echoes_session_and_finish_reason() {
        let result = TaskResult::success(
            "t1",
            ChatMessage::assistant("pong"),
            Usage::new(1, 1),
        );
        let response = completion_response("a1", "s1", &result);

        assert_eq!(response.object, "chat.completion");
        assert_eq!(response.choices[0].message.content, "pong");
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(
            response.metadata.get("session_id"),
            Some(&serde_json::Value::String("s1".to_string()))
        );
    }

    #[test]
    fn chunk_events_follow_delta_conventions() {
        let first = completion_chunk("a1", "s1", &StreamChunk::delta("t1", 0, "he"));
        assert_eq!(first.choices[0].delta.role.as_deref(), Some("assistant"));
        assert_eq!(first.choices[0].delta.content.as_deref(), Some("he"));
        assert!(first.choices[0].finish_reason.is_none());
        assert!(first.metadata.contains_key("session_id"));

        let middle = completion_chunk("a1", "s1", &StreamChunk::delta("t1", 1, "llo"));
        assert!(middle.choices[0].delta.role.is_none());
        assert!(middle.metadata.is_empty());

        let last = completion_chunk(
            "a1",
            "s1",
            &StreamChunk::terminal("t1", 2, FinishReason::Stop),
        );
        assert_eq!(last.choices[0].finish_reason.as_deref(), Some("stop"));
        assert!(last.choices[0].delta.content.is_none());
    }

    #[test]
    fn invalid_role_is_rejected() {
        let message = ChatCompletionMessage {
            role: "wizard".to_string(),
            content: "cast".to_string(),
        };
        assert!(ChatMessage::try_from(&message).is_err());
    }
}
