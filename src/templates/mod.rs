//! Template and executor contracts.
//!
//! A template, bound to an agent configuration, produces an `AgentExecutor`.
//! Executors are stateless across calls: the manager owns conversation
//! context, the executor turns `(history + new)` into a response. Any cached
//! reasoning state (compiled graphs, tool clients) lives inside the instance
//! wrapper, never across call inputs.

pub mod echo;

use crate::{
    models::{AgentConfiguration, ChatMessage, StreamChunk, TaskResult},
    Result, RuntimeError,
};
use async_trait::async_trait;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, pin::Pin, sync::Arc};
use tokio::sync::RwLock;
use tracing::info;

pub use echo::EchoTemplate;

/// Lazy, finite, non-restartable sequence of stream chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Pure template description, exposed for discovery and agent creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateMetadata {
    pub template_id: String,
    pub template_version: String,
    pub description: String,
    pub config_schema: ConfigSchema,
}

/// Machine-readable configuration schema for a template
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigSchema {
    pub fields: Vec<ConfigField>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigField {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Object,
    Array,
}

impl FieldType {
    fn matches(self, value: &serde_json::Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
        }
    }
}

/// Outcome of validating an agent configuration against a schema
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl ConfigSchema {
    /// Structural validation: required fields present, types match, unknown
    /// keys flagged as warnings.
    pub fn validate(&self, config: &HashMap<String, serde_json::Value>) -> ValidationResult {
        let mut result = ValidationResult::default();

        for field in &self.fields {
            match config.get(&field.name) {
                Some(value) => {
                    if !field.field_type.matches(value) {
                        result.errors.push(format!(
                            "field '{}' has wrong type (expected {:?})",
                            field.name, field.field_type
                        ));
                    }
                }
                None if field.required => {
                    result
                        .errors
                        .push(format!("required field '{}' is missing", field.name));
                }
                None => {}
            }
        }

        for key in config.keys() {
            if !self.fields.iter().any(|f| &f.name == key) {
                result
                    .warnings
                    .push(format!("unknown configuration key '{key}'"));
            }
        }

        result
    }
}

/// Knobs passed through to one execution
#[derive(Debug, Clone, Default)]
pub struct ExecutionParams {
    pub task_id: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ExecutionParams {
    pub fn from_request(request: &crate::models::TaskRequest) -> Self {
        Self {
            task_id: request.task_id.clone(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            metadata: request.metadata.clone(),
        }
    }
}

/// Stateless execution contract a template instance satisfies
///
/// `execute` and `stream_execute` receive the full message window the
/// manager chose to pass and must not retain references to it after return.
/// Streams end with exactly one chunk carrying a `finish_reason`.
/// Cancellation is cooperative: dropping the stream stops the producer at
/// its next suspension point.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    fn metadata(&self) -> &TemplateMetadata;

    async fn execute(&self, messages: &[ChatMessage], params: &ExecutionParams)
        -> Result<TaskResult>;

    async fn stream_execute(
        &self,
        messages: &[ChatMessage],
        params: &ExecutionParams,
    ) -> Result<ChunkStream>;
}

/// Factory that binds an agent configuration to a live executor
#[async_trait]
pub trait TemplateFactory: Send + Sync {
    fn metadata(&self) -> &TemplateMetadata;

    /// Validates a configuration against the template's schema. Called at
    /// agent creation time.
    fn validate_config(&self, config: &HashMap<String, serde_json::Value>) -> ValidationResult {
        self.metadata().config_schema.validate(config)
    }

    async fn instantiate(&self, config: &AgentConfiguration) -> Result<Arc<dyn AgentExecutor>>;
}

/// Registry of template factories, keyed by `(template_id, template_version)`
pub struct TemplateRegistry {
    factories: RwLock<HashMap<(String, String), Arc<dyn TemplateFactory>>>,
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, factory: Arc<dyn TemplateFactory>) -> Result<()> {
        let meta = factory.metadata().clone();
        let key = (meta.template_id.clone(), meta.template_version.clone());
        let mut factories = self.factories.write().await;
        if factories.contains_key(&key) {
            return Err(RuntimeError::Validation(format!(
                "template {}@{} already registered",
                key.0, key.1
            )));
        }
        factories.insert(key, factory);
        info!(
            "registered template {}@{}",
            meta.template_id, meta.template_version
        );
        Ok(())
    }

    /// Resolves a factory. With no version requested, the highest registered
    /// version for the id wins.
    pub async fn resolve(
        &self,
        template_id: &str,
        template_version: Option<&str>,
    ) -> Result<Arc<dyn TemplateFactory>> {
        let factories = self.factories.read().await;
        match template_version {
            Some(version) => factories
                .get(&(template_id.to_string(), version.to_string()))
                .cloned()
                .ok_or_else(|| {
                    RuntimeError::NotFound(format!("template {template_id}@{version}"))
                }),
            None => factories
                .iter()
                .filter(|((id, _), _)| id.as_str() == template_id)
                .max_by(|((_, a), _), ((_, b), _)| a.cmp(b))
                .map(|(_, factory)| factory.clone())
                .ok_or_else(|| RuntimeError::NotFound(format!("template {template_id}"))),
        }
    }

    pub async fn list(&self) -> Vec<TemplateMetadata> {
        let factories = self.factories.read().await;
        let mut metas: Vec<TemplateMetadata> =
            factories.values().map(|f| f.metadata().clone()).collect();
        metas.sort_by(|a, b| {
            (a.template_id.as_str(), a.template_version.as_str())
                .cmp(&(b.template_id.as_str(), b.template_version.as_str()))
        });
        metas
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> ConfigSchema {
        ConfigSchema {
            fields: vec![
                ConfigField {
                    name: "prefix".to_string(),
                    field_type: FieldType::String,
                    required: true,
                    description: "response prefix".to_string(),
                    default: None,
                },
                ConfigField {
                    name: "delay_ms".to_string(),
                    field_type: FieldType::Integer,
                    required: false,
                    description: "per-chunk delay".to_string(),
                    default: Some(serde_json::json!(0)),
                },
            ],
        }
    }

    #[test]
    fn schema_validation_reports_missing_and_mistyped() {
        let schema = schema();

        let mut config = HashMap::new();
        config.insert("delay_ms".to_string(), serde_json::json!("slow"));
        let result = schema.validate(&config);
        assert!(!result.is_valid());
        assert_eq!(result.errors.len(), 2);

        let mut ok = HashMap::new();
        ok.insert("prefix".to_string(), serde_json::json!("> "));
        ok.insert("extra".to_string(), serde_json::json!(1));
        let result = schema.validate(&ok);
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 1);
    }

    #[tokio::test]
    async fn registry_resolves_exact_and_latest_version() {
        let registry = TemplateRegistry::new();
        registry
            .register(Arc::new(EchoTemplate::with_version("1.0")))
            .await
            .unwrap();
        registry
            .register(Arc::new(EchoTemplate::with_version("2.0")))
            .await
            .unwrap();

        let exact = registry.resolve("echo", Some("1.0")).await.unwrap();
        assert_eq!(exact.metadata().template_version, "1.0");

        let latest = registry.resolve("echo", None).await.unwrap();
        assert_eq!(latest.metadata().template_version, "2.0");

        assert!(registry.resolve("echo", Some("9.9")).await.is_err());
        assert!(registry.resolve("missing", None).await.is_err());
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let registry = TemplateRegistry::new();
        registry
            .register(Arc::new(EchoTemplate::new()))
            .await
            .unwrap();
        assert!(registry
            .register(Arc::new(EchoTemplate::new()))
            .await
            .is_err());
    }
}
