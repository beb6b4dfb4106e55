//! Agent configuration storage collaborator.
//!
//! The runtime consumes this through the trait; only the in-memory
//! implementation ships. Persistence adapters plug in behind the same
//! contract.

use crate::{models::AgentConfiguration, Result, RuntimeError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Lookup and lifecycle of agent configurations
#[async_trait]
pub trait AgentConfigStore: Send + Sync {
    /// Finds a configuration by agent id.
    async fn find(&self, agent_id: &str) -> Result<AgentConfiguration>;

    async fn save(&self, config: AgentConfiguration) -> Result<()>;

    /// Removes a configuration; returns whether it existed.
    async fn delete(&self, agent_id: &str) -> Result<bool>;

    async fn list(&self) -> Result<Vec<AgentConfiguration>>;
}

/// In-memory configuration store
pub struct InMemoryAgentConfigStore {
    configs: Arc<RwLock<HashMap<String, AgentConfiguration>>>,
}

impl Default for InMemoryAgentConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAgentConfigStore {
    pub fn new() -> Self {
        Self {
            configs: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl AgentConfigStore for InMemoryAgentConfigStore {
    async fn find(&self, agent_id: &str) -> Result<AgentConfiguration> {
        let configs = self.configs.read().await;
        configs
            .get(agent_id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("agent {agent_id}")))
    }

    async fn save(&self, config: AgentConfiguration) -> Result<()> {
        let mut configs = self.configs.write().await;
        info!("saved agent configuration {} ({})", config.id, config.name);
        configs.insert(config.id.clone(), config);
        Ok(())
    }

    async fn delete(&self, agent_id: &str) -> Result<bool> {
        let mut configs = self.configs.write().await;
        let existed = configs.remove(agent_id).is_some();
        if existed {
            info!("deleted agent configuration {}", agent_id);
        }
        Ok(existed)
    }

    async fn list(&self) -> Result<Vec<AgentConfiguration>> {
        let configs = self.configs.read().await;
        let mut all: Vec<AgentConfiguration> = configs.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_find_delete_roundtrip() {
        let store = InMemoryAgentConfigStore::new();
        let config = AgentConfiguration::new("a1", "test agent", "echo", "1.0");
        store.save(config).await.unwrap();

        let found = store.find("a1").await.unwrap();
        assert_eq!(found.name, "test agent");

        assert!(store.delete("a1").await.unwrap());
        assert!(!store.delete("a1").await.unwrap());
        assert!(matches!(
            store.find("a1").await,
            Err(RuntimeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_is_sorted_by_id() {
        let store = InMemoryAgentConfigStore::new();
        store
            .save(AgentConfiguration::new("b", "b", "echo", "1.0"))
            .await
            .unwrap();
        store
            .save(AgentConfiguration::new("a", "a", "echo", "1.0"))
            .await
            .unwrap();

        let all = store.list().await.unwrap();
        let ids: Vec<&str> = all.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
