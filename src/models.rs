use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, str::FromStr};
use uuid::Uuid;

use crate::constants::DEFAULT_TASK_TIMEOUT_SECS;

/// Role of a chat message author
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            _ => Err(format!("unknown role: {s}")),
        }
    }
}

/// One immutable turn of a conversation
///
/// Equality is by role, content, and timestamp; metadata is carried but not
/// compared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Role::Tool, content)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

impl PartialEq for ChatMessage {
    fn eq(&self, other: &Self) -> bool {
        self.role == other.role
            && self.content == other.content
            && self.timestamp == other.timestamp
    }
}

impl Eq for ChatMessage {}

/// Task priority levels
///
/// Higher priorities are dequeued before lower ones; ties are FIFO.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Bucket index used by queue backends: 0 = critical .. 3 = low.
    pub fn bucket(self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            _ => Err(format!("unknown priority: {s}")),
        }
    }
}

/// Why a completion (or stream) ended
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Error,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::Error => "error",
        }
    }
}

/// Token accounting for one execution
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Registry key for a cached agent instance: `{agent_id}#{session_id}`
///
/// When no session is supplied the agent id alone is the key (single implicit
/// session per agent).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    agent_id: String,
    session_id: Option<String>,
}

impl SessionKey {
    pub fn new(agent_id: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            session_id: session_id.filter(|s| !s.is_empty()),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.session_id {
            Some(session) => write!(f, "{}#{}", self.agent_id, session),
            None => write!(f, "{}", self.agent_id),
        }
    }
}

/// One request for one execution, single-shot or streaming
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: String,
    pub agent_id: String,
    pub session_id: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub priority: Priority,
    pub timeout_seconds: u64,
    pub submitted_at: DateTime<Utc>,
}

impl TaskRequest {
    pub fn new(agent_id: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            session_id: None,
            messages,
            temperature: None,
            max_tokens: None,
            stream: false,
            metadata: HashMap::new(),
            priority: Priority::Normal,
            timeout_seconds: DEFAULT_TASK_TIMEOUT_SECS,
            submitted_at: Utc::now(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(&self.agent_id, self.session_id.clone())
    }

    /// Effective deadline: `submitted_at + timeout`.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.submitted_at + Duration::seconds(self.timeout_seconds as i64)
    }

    /// Shape validation performed before a request enters the queue.
    pub fn validate(&self) -> crate::Result<()> {
        if self.agent_id.trim().is_empty() {
            return Err(crate::RuntimeError::Validation(
                "agent_id must not be empty".to_string(),
            ));
        }
        if self.messages.is_empty() {
            return Err(crate::RuntimeError::Validation(
                "messages must not be empty".to_string(),
            ));
        }
        if self.messages.iter().any(|m| m.content.is_empty()) {
            return Err(crate::RuntimeError::Validation(
                "message content must not be empty".to_string(),
            ));
        }
        if self.timeout_seconds == 0 {
            return Err(crate::RuntimeError::Validation(
                "timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of one execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub success: bool,
    pub message: Option<ChatMessage>,
    pub error: Option<String>,
    #[serde(default)]
    pub usage: Usage,
    pub finish_reason: FinishReason,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub processing_time_ms: u64,
}

impl TaskResult {
    pub fn success(task_id: impl Into<String>, message: ChatMessage, usage: Usage) -> Self {
        Self {
            task_id: task_id.into(),
            success: true,
            message: Some(message),
            error: None,
            usage,
            finish_reason: FinishReason::Stop,
            metadata: HashMap::new(),
            processing_time_ms: 0,
        }
    }

    pub fn failure(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        let error = error.into();
        let mut metadata = HashMap::new();
        metadata.insert("error".to_string(), serde_json::Value::String(error.clone()));
        Self {
            task_id: task_id.into(),
            success: false,
            message: None,
            error: Some(error),
            usage: Usage::default(),
            finish_reason: FinishReason::Error,
            metadata,
            processing_time_ms: 0,
        }
    }

    /// Deadline expiry shape: `finish_reason = length` with a timeout marker.
    pub fn timed_out(task_id: impl Into<String>) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("timeout".to_string(), serde_json::Value::Bool(true));
        Self {
            task_id: task_id.into(),
            success: false,
            message: None,
            error: Some("task deadline exceeded".to_string()),
            usage: Usage::default(),
            finish_reason: FinishReason::Length,
            metadata,
            processing_time_ms: 0,
        }
    }

    pub fn with_processing_time(mut self, elapsed_ms: u64) -> Self {
        self.processing_time_ms = elapsed_ms;
        self
    }

    pub fn with_finish_reason(mut self, reason: FinishReason) -> Self {
        self.finish_reason = reason;
        self
    }
}

/// Incremental delta of a streamed response
///
/// Only the last chunk of a stream carries a `finish_reason`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamChunk {
    pub task_id: String,
    pub content: String,
    pub finish_reason: Option<FinishReason>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub chunk_index: u64,
}

impl StreamChunk {
    pub fn delta(task_id: impl Into<String>, chunk_index: u64, content: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            content: content.into(),
            finish_reason: None,
            metadata: HashMap::new(),
            chunk_index,
        }
    }

    pub fn terminal(task_id: impl Into<String>, chunk_index: u64, reason: FinishReason) -> Self {
        Self {
            task_id: task_id.into(),
            content: String::new(),
            finish_reason: Some(reason),
            metadata: HashMap::new(),
            chunk_index,
        }
    }

    /// Terminal error chunk with the error text preserved in metadata.
    pub fn terminal_error(
        task_id: impl Into<String>,
        chunk_index: u64,
        error: impl Into<String>,
    ) -> Self {
        let mut chunk = Self::terminal(task_id, chunk_index, FinishReason::Error);
        chunk
            .metadata
            .insert("error".to_string(), serde_json::Value::String(error.into()));
        chunk
    }

    pub fn is_terminal(&self) -> bool {
        self.finish_reason.is_some()
    }
}

/// Agent configuration as stored by the configuration collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfiguration {
    pub id: String,
    pub name: String,
    pub template_id: String,
    pub template_version: String,
    #[serde(default)]
    pub configuration: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AgentConfiguration {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        template_id: impl Into<String>,
        template_version: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            template_id: template_id.into(),
            template_version: template_version.into(),
            configuration: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.configuration.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_composes_agent_and_session() {
        let key = SessionKey::new("a1", Some("s1".to_string()));
        assert_eq!(key.to_string(), "a1#s1");

        let implicit = SessionKey::new("a1", None);
        assert_eq!(implicit.to_string(), "a1");
        assert_ne!(key, implicit);
    }

    #[test]
    fn chat_message_equality_ignores_metadata() {
        let a = ChatMessage::user("hello");
        let mut b = a.clone();
        b.metadata
            .insert("k".to_string(), serde_json::Value::Bool(true));
        assert_eq!(a, b);
    }

    #[test]
    fn priority_orders_critical_first() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::Critical.bucket(), 0);
        assert_eq!(Priority::Low.bucket(), 3);
    }

    #[test]
    fn task_request_validation_rejects_empty_messages() {
        let req = TaskRequest::new("a1", vec![]);
        assert!(req.validate().is_err());

        let req = TaskRequest::new("a1", vec![ChatMessage::user("ping")]);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn stream_chunk_roundtrips_through_json() {
        let chunk = StreamChunk::terminal_error("t1", 4, "boom");
        let json = serde_json::to_string(&chunk).unwrap();
        let back: StreamChunk = serde_json::from_str(&json).unwrap();
        assert_eq!(chunk, back);
        assert!(back.is_terminal());
    }
}
