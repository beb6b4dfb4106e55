//! HTTP surface: OpenAI-compatible completions plus agent and system
//! management endpoints.

use crate::{
    config::ApiConfig,
    manager::TaskManager,
    service::{
        dto::{
            ChatCompletionRequest, CreateAgentRequest, ErrorResponse, ModelCard, ModelList,
        },
        ExecutionService,
    },
    Result, RuntimeError,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures::StreamExt;
use std::{convert::Infallible, sync::Arc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

const SERVICE_NAME: &str = "agent-runtime";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

const ROUTE_HEALTH: &str = "/health";
const ROUTE_CHAT_COMPLETIONS: &str = "/v1/chat/completions";
const ROUTE_MODELS: &str = "/v1/models";
const ROUTE_TEMPLATES: &str = "/v1/templates";
const ROUTE_AGENTS: &str = "/v1/agents";
const ROUTE_AGENT_BY_ID: &str = "/v1/agents/{agent_id}";
const ROUTE_SYSTEM_STATUS: &str = "/system/status";
const ROUTE_SYSTEM_INSTANCES: &str = "/system/instances";
const ROUTE_SYSTEM_INSTANCE: &str = "/system/instances/{agent_id}/{session_id}";

#[derive(Clone)]
struct AppState {
    service: Arc<ExecutionService>,
    manager: Arc<TaskManager>,
}

/// Error wrapper mapping runtime errors to status codes
struct ApiError(RuntimeError);

impl From<RuntimeError> for ApiError {
    fn from(error: RuntimeError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RuntimeError::NotFound(_) => StatusCode::NOT_FOUND,
            RuntimeError::Validation(_) => StatusCode::BAD_REQUEST,
            RuntimeError::QueueSaturated => StatusCode::SERVICE_UNAVAILABLE,
            RuntimeError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            RuntimeError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorResponse {
            error: self.0.to_string(),
            details: None,
        };
        (status, Json(body)).into_response()
    }
}

pub struct ApiServer {
    config: ApiConfig,
    service: Arc<ExecutionService>,
    manager: Arc<TaskManager>,
}

impl ApiServer {
    pub fn new(
        config: ApiConfig,
        service: Arc<ExecutionService>,
        manager: Arc<TaskManager>,
    ) -> Self {
        Self {
            config,
            service,
            manager,
        }
    }

    pub fn build_router(&self) -> Router {
        let state = AppState {
            service: self.service.clone(),
            manager: self.manager.clone(),
        };

        let cors_layer = CorsLayer::new()
            .allow_origin(
                self.config
                    .allowed_origins
                    .iter()
                    .filter_map(|origin| origin.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::DELETE,
            ])
            .allow_headers([axum::http::header::CONTENT_TYPE]);

        Router::new()
            .route(ROUTE_HEALTH, get(health))
            .route(ROUTE_CHAT_COMPLETIONS, post(chat_completions))
            .route(ROUTE_MODELS, get(list_models))
            .route(ROUTE_TEMPLATES, get(list_templates))
            .route(ROUTE_AGENTS, post(create_agent).get(list_agents))
            .route(ROUTE_AGENT_BY_ID, get(get_agent).delete(delete_agent))
            .route(ROUTE_SYSTEM_STATUS, get(system_status))
            .route(ROUTE_SYSTEM_INSTANCES, get(list_instances))
            .route(ROUTE_SYSTEM_INSTANCE, delete(destroy_instance))
            .layer(TraceLayer::new_for_http())
            .layer(cors_layer)
            .with_state(state)
    }

    pub async fn run(&self) -> Result<()> {
        let app = self.build_router();
        let listener =
            tokio::net::TcpListener::bind(format!("{}:{}", self.config.host, self.config.port))
                .await
                .map_err(|e| RuntimeError::Internal(e.into()))?;

        info!(
            "API server listening on {}:{}",
            self.config.host, self.config.port
        );

        axum::serve(listener, app)
            .await
            .map_err(|e| RuntimeError::Internal(e.into()))?;
        Ok(())
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
    }))
}

/// Completion entry point. Streaming requests answer with SSE
/// `chat.completion.chunk` events and a terminal `[DONE]` sentinel;
/// non-streaming requests answer with one `chat.completion` object.
async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionRequest>,
) -> std::result::Result<Response, ApiError> {
    if request.stream {
        let (_session_id, events) = state.service.complete_stream(request).await?;
        let stream = events
            .map(|chunk| {
                Event::default()
                    .json_data(&chunk)
                    .unwrap_or_else(|_| Event::default().data("{}"))
            })
            .chain(futures::stream::once(async {
                Event::default().data("[DONE]")
            }))
            .map(Ok::<_, Infallible>);
        Ok(Sse::new(stream)
            .keep_alive(KeepAlive::default())
            .into_response())
    } else {
        let response = state.service.complete(request).await?;
        Ok(Json(response).into_response())
    }
}

/// One model card per configured agent.
async fn list_models(
    State(state): State<AppState>,
) -> std::result::Result<Json<ModelList>, ApiError> {
    let agents = state.service.list_agents().await?;
    let created = chrono::Utc::now().timestamp();
    let data = agents
        .into_iter()
        .map(|agent| ModelCard {
            id: agent.id,
            object: "model".to_string(),
            created,
            owned_by: SERVICE_NAME.to_string(),
        })
        .collect();
    Ok(Json(ModelList {
        object: "list".to_string(),
        data,
    }))
}

async fn list_templates(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.list_templates().await)
}

async fn create_agent(
    State(state): State<AppState>,
    Json(request): Json<CreateAgentRequest>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let config = state.service.create_agent(request).await?;
    Ok((StatusCode::CREATED, Json(config)))
}

async fn list_agents(
    State(state): State<AppState>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.list_agents().await?))
}

async fn get_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.get_agent(&agent_id).await?))
}

async fn delete_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    if state.service.delete_agent(&agent_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(RuntimeError::NotFound(format!("agent {agent_id}")).into())
    }
}

async fn system_status(
    State(state): State<AppState>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    Ok(Json(state.manager.stats().await?))
}

async fn list_instances(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.list_instances().await)
}

async fn destroy_instance(
    State(state): State<AppState>,
    Path((agent_id, session_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let destroyed = state
        .manager
        .destroy_session_instance(&agent_id, Some(&session_id))
        .await;
    Json(serde_json::json!({ "destroyed": destroyed }))
}
