//! Agent instance registry.
//!
//! Maps `SessionKey` to a live, template-produced instance. The registry
//! exclusively owns instance lifetimes; the task manager sees instances as
//! opaque handles. Lock discipline: the registry map lock is always released
//! before an instance execution lock is taken, and never re-acquired while
//! one is held.

use crate::{
    models::{AgentConfiguration, SessionKey},
    store::AgentConfigStore,
    templates::{AgentExecutor, TemplateRegistry},
    Result,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info};

/// Lifecycle of an instance: `initializing → idle ⇄ running → destroyed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Initializing,
    Idle,
    Running,
    Destroyed,
}

/// A live agent bound to one session
///
/// Holds the executor produced by the template factory (with whatever
/// compiled state the template cached inside it) plus bookkeeping. The
/// `idle → running → idle` transitions ride on the execution lock, so they
/// are atomic under concurrent dispatch.
pub struct AgentInstance {
    session_key: SessionKey,
    config: AgentConfiguration,
    executor: Arc<dyn AgentExecutor>,
    created_at: DateTime<Utc>,
    last_used: std::sync::RwLock<DateTime<Utc>>,
    state: std::sync::RwLock<InstanceState>,
    exec_lock: Arc<Mutex<()>>,
}

impl AgentInstance {
    fn new(
        session_key: SessionKey,
        config: AgentConfiguration,
        executor: Arc<dyn AgentExecutor>,
    ) -> Self {
        Self {
            session_key,
            config,
            executor,
            created_at: Utc::now(),
            last_used: std::sync::RwLock::new(Utc::now()),
            state: std::sync::RwLock::new(InstanceState::Initializing),
            exec_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.session_key
    }

    pub fn config(&self) -> &AgentConfiguration {
        &self.config
    }

    pub fn executor(&self) -> &Arc<dyn AgentExecutor> {
        &self.executor
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_used(&self) -> DateTime<Utc> {
        *self.last_used.read().expect("last_used lock poisoned")
    }

    pub fn state(&self) -> InstanceState {
        *self.state.read().expect("state lock poisoned")
    }

    fn set_state(&self, state: InstanceState) {
        *self.state.write().expect("state lock poisoned") = state;
    }

    /// Waits for exclusive execution rights on this instance. At most one
    /// execution per instance at a time.
    pub async fn acquire(self: &Arc<Self>) -> ExecutionGuard {
        let guard = self.exec_lock.clone().lock_owned().await;
        self.set_state(InstanceState::Running);
        ExecutionGuard {
            instance: self.clone(),
            _guard: guard,
        }
    }

    /// Non-blocking acquire; used by the janitor to establish that no task
    /// is currently executing before reclaiming.
    pub fn try_acquire(self: &Arc<Self>) -> Option<ExecutionGuard> {
        let guard = self.exec_lock.clone().try_lock_owned().ok()?;
        Some(ExecutionGuard {
            instance: self.clone(),
            _guard: guard,
        })
    }
}

/// Exclusive execution rights over an instance
///
/// Dropping the guard returns the instance to idle and refreshes
/// `last_used`.
pub struct ExecutionGuard {
    instance: Arc<AgentInstance>,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        *self
            .instance
            .last_used
            .write()
            .expect("last_used lock poisoned") = Utc::now();
        let mut state = self.instance.state.write().expect("state lock poisoned");
        if *state != InstanceState::Destroyed {
            *state = InstanceState::Idle;
        }
    }
}

/// Observable snapshot of a cached instance
#[derive(Debug, Clone, Serialize)]
pub struct InstanceInfo {
    pub session_key: String,
    pub agent_id: String,
    pub session_id: Option<String>,
    pub state: InstanceState,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

/// Session-keyed instance cache
pub struct InstanceRegistry {
    instances: RwLock<HashMap<SessionKey, Arc<AgentInstance>>>,
    templates: Arc<TemplateRegistry>,
    configs: Arc<dyn AgentConfigStore>,
}

impl InstanceRegistry {
    pub fn new(templates: Arc<TemplateRegistry>, configs: Arc<dyn AgentConfigStore>) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            templates,
            configs,
        }
    }

    /// Returns the cached instance for the key, instantiating it from the
    /// agent's template on a miss. Concurrent first-time callers race
    /// idempotently: the loser's partially constructed instance is dropped
    /// and the winner's is returned.
    pub async fn get_or_create(
        &self,
        agent_id: &str,
        session_id: Option<&str>,
    ) -> Result<Arc<AgentInstance>> {
        let key = SessionKey::new(agent_id, session_id.map(str::to_string));
        {
            let instances = self.instances.read().await;
            if let Some(instance) = instances.get(&key) {
                return Ok(instance.clone());
            }
        }

        // Build outside the map lock; instantiation may be slow.
        let config = self.configs.find(agent_id).await?;
        let factory = self
            .templates
            .resolve(&config.template_id, Some(&config.template_version))
            .await?;
        let executor = factory.instantiate(&config).await?;
        let fresh = Arc::new(AgentInstance::new(key.clone(), config, executor));

        let mut instances = self.instances.write().await;
        match instances.get(&key) {
            Some(existing) => {
                debug!("lost instantiation race for {}, reusing winner", key);
                Ok(existing.clone())
            }
            None => {
                fresh.set_state(InstanceState::Idle);
                instances.insert(key.clone(), fresh.clone());
                info!("created agent instance for {}", key);
                Ok(fresh)
            }
        }
    }

    pub async fn get(&self, session_key: &SessionKey) -> Option<Arc<AgentInstance>> {
        let instances = self.instances.read().await;
        instances.get(session_key).cloned()
    }

    /// Snapshot of active keys with metadata, for observability.
    pub async fn list(&self) -> Vec<InstanceInfo> {
        let instances = self.instances.read().await;
        let mut infos: Vec<InstanceInfo> = instances
            .values()
            .map(|instance| InstanceInfo {
                session_key: instance.session_key.to_string(),
                agent_id: instance.session_key.agent_id().to_string(),
                session_id: instance.session_key.session_id().map(str::to_string),
                state: instance.state(),
                created_at: instance.created_at,
                last_used: instance.last_used(),
            })
            .collect();
        infos.sort_by(|a, b| a.session_key.cmp(&b.session_key));
        infos
    }

    /// Snapshot of live instances, for the janitor sweep.
    pub(crate) async fn snapshot(&self) -> Vec<(SessionKey, Arc<AgentInstance>)> {
        let instances = self.instances.read().await;
        instances
            .iter()
            .map(|(key, instance)| (key.clone(), instance.clone()))
            .collect()
    }

    /// Removes and releases an instance; idempotent.
    pub async fn destroy(&self, session_key: &SessionKey) -> bool {
        let removed = {
            let mut instances = self.instances.write().await;
            instances.remove(session_key)
        };
        match removed {
            Some(instance) => {
                instance.set_state(InstanceState::Destroyed);
                info!("destroyed agent instance for {}", session_key);
                true
            }
            None => false,
        }
    }

    /// Removes every session instance derived from an agent. Used when the
    /// underlying agent configuration is deleted.
    pub async fn destroy_all_for(&self, agent_id: &str) -> usize {
        let doomed: Vec<SessionKey> = {
            let instances = self.instances.read().await;
            instances
                .keys()
                .filter(|key| key.agent_id() == agent_id)
                .cloned()
                .collect()
        };
        let mut removed = 0;
        for key in doomed {
            if self.destroy(&key).await {
                removed += 1;
            }
        }
        removed
    }

    pub async fn count(&self) -> usize {
        let instances = self.instances.read().await;
        instances.len()
    }
}
