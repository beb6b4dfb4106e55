//! Per-session conversation state.
//!
//! One `ExecutionContext` exists per `SessionKey`. The task manager's
//! per-instance lock serialises all mutation for a given key, so appends are
//! serial within a session and independent across sessions.

use crate::models::{ChatMessage, Role, SessionKey};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::constants::HISTORY_FLOOR;

/// Conversation history and metadata bound to a session key
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub session_key: SessionKey,
    history: Vec<ChatMessage>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub last_active: DateTime<Utc>,
}

impl ExecutionContext {
    fn new(session_key: SessionKey) -> Self {
        Self {
            session_key,
            history: Vec::new(),
            metadata: HashMap::new(),
            last_active: Utc::now(),
        }
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    fn append(&mut self, messages: impl IntoIterator<Item = ChatMessage>, max_history: usize) {
        self.history.extend(messages);
        self.trim(max_history);
    }

    /// Trims from the head while the history exceeds `max_history`.
    ///
    /// The surviving head is never a partial assistant/tool turn: the cut
    /// advances to the next system/user message, unless doing so would empty
    /// the history past the floor of one message.
    fn trim(&mut self, max_history: usize) {
        let max = max_history.max(HISTORY_FLOOR);
        if self.history.len() <= max {
            return;
        }
        let mut cut = self.history.len() - max;
        while cut < self.history.len() - 1
            && matches!(self.history[cut].role, Role::Assistant | Role::Tool)
        {
            cut += 1;
        }
        self.history.drain(..cut);
    }
}

/// Store of execution contexts, keyed by session
pub struct ContextStore {
    contexts: Arc<RwLock<HashMap<SessionKey, ExecutionContext>>>,
    max_history: usize,
}

impl ContextStore {
    pub fn new(max_history: usize) -> Self {
        Self {
            contexts: Arc::new(RwLock::new(HashMap::new())),
            max_history: max_history.max(HISTORY_FLOOR),
        }
    }

    /// Snapshot of the context for a key, creating it if absent.
    pub async fn get_or_create(&self, session_key: &SessionKey) -> ExecutionContext {
        {
            let contexts = self.contexts.read().await;
            if let Some(context) = contexts.get(session_key) {
                return context.clone();
            }
        }
        let mut contexts = self.contexts.write().await;
        contexts
            .entry(session_key.clone())
            .or_insert_with(|| ExecutionContext::new(session_key.clone()))
            .clone()
    }

    /// Appends messages, trimming from the head past the configured cap.
    pub async fn append(
        &self,
        session_key: &SessionKey,
        messages: impl IntoIterator<Item = ChatMessage> + Send,
    ) {
        let mut contexts = self.contexts.write().await;
        let context = contexts
            .entry(session_key.clone())
            .or_insert_with(|| ExecutionContext::new(session_key.clone()));
        context.append(messages, self.max_history);
    }

    /// Current history snapshot for a key.
    pub async fn history(&self, session_key: &SessionKey) -> Vec<ChatMessage> {
        let contexts = self.contexts.read().await;
        contexts
            .get(session_key)
            .map(|c| c.history.clone())
            .unwrap_or_default()
    }

    pub async fn set_metadata(
        &self,
        session_key: &SessionKey,
        key: impl Into<String>,
        value: serde_json::Value,
    ) {
        let mut contexts = self.contexts.write().await;
        if let Some(context) = contexts.get_mut(session_key) {
            context.metadata.insert(key.into(), value);
        }
    }

    /// Updates `last_active` for a key.
    pub async fn touch(&self, session_key: &SessionKey) {
        let mut contexts = self.contexts.write().await;
        if let Some(context) = contexts.get_mut(session_key) {
            context.last_active = Utc::now();
        }
    }

    pub async fn destroy(&self, session_key: &SessionKey) {
        let mut contexts = self.contexts.write().await;
        if contexts.remove(session_key).is_some() {
            debug!("destroyed execution context for {}", session_key);
        }
    }

    pub async fn len(&self) -> usize {
        let contexts = self.contexts.read().await;
        contexts.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
