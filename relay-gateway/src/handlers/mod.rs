//! # HTTP Handlers
//!
//! The OpenAI-compatible surface: chat completions (JSON and SSE), legacy
//! text completions, embeddings, the model listing, and the health/ready
//! probes. Handlers are thin: they build the execute closure handed to the
//! dispatch core, substitute `instance.provider_model` into the upstream
//! payload, and shape the response. All retry and fallback behavior lives
//! behind `ModelManager::execute_with_failover`.

use crate::gateway_error::GatewayError;
use crate::server::AppState;
use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use futures::StreamExt;
use relay_dispatch::failover::FailoverRequest;
use relay_dispatch::models::{
    ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, Message, Usage,
};
use relay_dispatch::registry::Instance;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Chat completions, streaming or not depending on the request flag.
pub async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Response<Body>, GatewayError> {
    if request.model.is_empty() {
        return Err(GatewayError::invalid_request("model is required"));
    }
    if request.messages.is_empty() {
        return Err(GatewayError::invalid_request("messages must not be empty"));
    }

    if request.stream.unwrap_or(false) {
        return stream_chat_completions(state, request).await;
    }

    let requested_model = request.model.clone();
    let payload = request;
    let dispatch = FailoverRequest::new(requested_model.clone(), move |instance: Arc<Instance>| {
        let mut upstream = payload.clone();
        upstream.model = instance.provider_model().to_string();
        upstream.stream = None;
        let provider = Arc::clone(&instance.provider);
        async move { provider.chat_completion(upstream).await }
    });

    let result = state.manager.execute_with_failover(dispatch).await?;
    state.manager.record_request_end(
        &result.instance,
        result.response.total_tokens() as u64,
        result.latency,
    );

    // Callers see the logical model name, not the upstream one.
    let mut response = result.response;
    response.model = requested_model;

    Ok(json_response(&response)?)
}

/// SSE streaming path. The first successful upstream connection decides
/// which instance won; retries after streaming has started are not
/// attempted.
async fn stream_chat_completions(
    state: AppState,
    request: ChatRequest,
) -> Result<Response<Body>, GatewayError> {
    let requested_model = request.model.clone();
    let payload = request;
    let dispatch = FailoverRequest::new(requested_model.clone(), move |instance: Arc<Instance>| {
        let mut upstream = payload.clone();
        upstream.model = instance.provider_model().to_string();
        let provider = Arc::clone(&instance.provider);
        async move { provider.stream_chat_completion(upstream).await }
    })
    .streaming(true);

    let result = state.manager.execute_with_failover(dispatch).await?;
    state
        .manager
        .record_request_end(&result.instance, 0, result.latency);

    let mut upstream = result.response;
    let body_stream = async_stream::stream! {
        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(mut chunk) => {
                    chunk.model = requested_model.clone();
                    match serde_json::to_string(&chunk) {
                        Ok(data) => {
                            yield Ok::<_, std::convert::Infallible>(
                                format!("data: {data}\n\n").into_bytes(),
                            );
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "dropping unserializable stream chunk");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "upstream stream ended with error");
                    break;
                }
            }
        }
        yield Ok("data: [DONE]\n\n".to_string().into_bytes());
    };

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .body(Body::from_stream(body_stream))
        .map_err(|e| GatewayError::Internal {
            message: e.to_string(),
        })
}

/// Legacy text-completion request.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: PromptInput,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PromptInput {
    Text(String),
    Batch(Vec<String>),
}

impl PromptInput {
    fn joined(&self) -> String {
        match self {
            PromptInput::Text(text) => text.clone(),
            PromptInput::Batch(parts) => parts.join("\n"),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Serialize)]
pub struct CompletionChoice {
    pub text: String,
    pub index: u32,
    pub finish_reason: Option<String>,
}

/// Legacy completions mapped onto the chat surface: the prompt becomes a
/// single user message and the reply text is lifted back out.
pub async fn completions(
    State(state): State<AppState>,
    Json(request): Json<CompletionRequest>,
) -> Result<Response<Body>, GatewayError> {
    if request.stream.unwrap_or(false) {
        return Err(GatewayError::invalid_request(
            "streaming is not supported on /v1/completions; use /v1/chat/completions",
        ));
    }

    let requested_model = request.model.clone();
    let chat = ChatRequest {
        model: requested_model.clone(),
        messages: vec![Message::user(request.prompt.joined())],
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        stop: request.stop.clone(),
        user: request.user.clone(),
        ..Default::default()
    };

    let dispatch = FailoverRequest::new(requested_model.clone(), move |instance: Arc<Instance>| {
        let mut upstream = chat.clone();
        upstream.model = instance.provider_model().to_string();
        let provider = Arc::clone(&instance.provider);
        async move { provider.chat_completion(upstream).await }
    });

    let result = state.manager.execute_with_failover(dispatch).await?;
    state.manager.record_request_end(
        &result.instance,
        result.response.total_tokens() as u64,
        result.latency,
    );

    let response = completion_from_chat(result.response, &requested_model);
    Ok(json_response(&response)?)
}

fn completion_from_chat(chat: ChatResponse, model: &str) -> CompletionResponse {
    let choices = chat
        .choices
        .into_iter()
        .map(|choice| CompletionChoice {
            text: choice.message.content,
            index: choice.index,
            finish_reason: choice.finish_reason,
        })
        .collect();

    CompletionResponse {
        id: format!("cmpl-{}", uuid::Uuid::new_v4().simple()),
        object: "text_completion".to_string(),
        created: chrono::Utc::now().timestamp() as u64,
        model: model.to_string(),
        choices,
        usage: chat.usage,
    }
}

pub async fn embeddings(
    State(state): State<AppState>,
    Json(request): Json<EmbeddingRequest>,
) -> Result<Response<Body>, GatewayError> {
    let requested_model = request.model.clone();
    let payload = request;
    let dispatch = FailoverRequest::new(requested_model.clone(), move |instance: Arc<Instance>| {
        let mut upstream = payload.clone();
        upstream.model = instance.provider_model().to_string();
        let provider = Arc::clone(&instance.provider);
        async move { provider.embeddings(upstream).await }
    });

    let result = state.manager.execute_with_failover(dispatch).await?;
    let tokens = result
        .response
        .usage
        .as_ref()
        .map(|u| u.total_tokens as u64)
        .unwrap_or(0);
    state
        .manager
        .record_request_end(&result.instance, tokens, result.latency);

    let mut response: EmbeddingResponse = result.response;
    response.model = requested_model;
    Ok(json_response(&response)?)
}

/// Available models, route slugs included.
pub async fn list_models(State(state): State<AppState>) -> Result<Json<Value>, GatewayError> {
    let created = chrono::Utc::now().timestamp();
    let data: Vec<Value> = state
        .manager
        .get_available_models()
        .into_iter()
        .map(|model| {
            json!({
                "id": model,
                "object": "model",
                "created": created,
                "owned_by": "relay"
            })
        })
        .collect();

    Ok(Json(json!({ "object": "list", "data": data })))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

/// Ready when at least one model is registered.
pub async fn ready(State(state): State<AppState>) -> Result<Json<Value>, GatewayError> {
    let models = state.manager.get_available_models();
    if models.is_empty() {
        return Err(GatewayError::Dispatch(
            relay_dispatch::DispatchError::unavailable("no models registered", Vec::new()),
        ));
    }
    Ok(Json(json!({ "status": "ready", "models": models.len() })))
}

fn json_response<T: Serialize>(value: &T) -> Result<Response<Body>, GatewayError> {
    let body = serde_json::to_string(value)?;
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .map_err(|e| GatewayError::Internal {
            message: e.to_string(),
        })
}
