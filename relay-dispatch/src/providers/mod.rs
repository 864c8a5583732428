//! # Provider Adapters
//!
//! The uniform upstream client contract and its implementations. Every
//! adapter exposes the same minimum surface to the dispatch core:
//!
//! - **Chat completions** — request/response and streaming variants
//! - **Embeddings** — optional; adapters without the capability report
//!   [`ProviderError::Unimplemented`]
//! - **Health checks** — an active probe proving the endpoint is reachable
//!   and credentialed
//! - **Descriptive accessors** — provider kind and model listing
//!
//! Adapters are created once per distinct (kind, base URL, credential,
//! deployment) tuple and shared across all instances that target the same
//! endpoint; they own their transport and are safe for concurrent use.
//!
//! ## Probe semantics
//!
//! A probe succeeds iff it demonstrates the endpoint is reachable and the
//! credential is accepted. Some upstreams have no cheap probe method; for
//! those the adapter sends its natural request and treats a 4xx status
//! other than 401/403/429 as success — the rejection itself proves
//! connectivity.

use crate::common::duration_serde;
use crate::error::ProviderError;
use crate::models::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, StreamChunk};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub mod anthropic;
pub mod azure;
pub mod custom;
pub mod http_client;
pub mod openai;
pub mod openrouter;

/// Pinned boxed stream of completion chunks.
pub type StreamResult = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

/// Supported upstream provider kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Azure,
    OpenRouter,
    /// Any OpenAI-compatible endpoint (local inference servers, proxies)
    Custom,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Azure => "azure",
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::Custom => "custom",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "azure" => Ok(ProviderKind::Azure),
            "openrouter" => Ok(ProviderKind::OpenRouter),
            "custom" => Ok(ProviderKind::Custom),
            other => Err(ProviderError::UnsupportedProvider {
                kind: other.to_string(),
            }),
        }
    }
}

/// Contract implemented by every upstream adapter.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// The provider kind this adapter implements.
    fn kind(&self) -> ProviderKind;

    /// Whether the upstream serves the given provider-side model name.
    fn supports_model(&self, model: &str) -> bool;

    /// Provider-side model names this adapter knows about.
    fn list_models(&self) -> Vec<String>;

    /// Perform a chat completion request.
    async fn chat_completion(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Perform a streaming chat completion request.
    async fn stream_chat_completion(
        &self,
        request: ChatRequest,
    ) -> Result<StreamResult, ProviderError>;

    /// Generate embeddings. Adapters without the capability keep the default.
    async fn embeddings(
        &self,
        _request: EmbeddingRequest,
    ) -> Result<EmbeddingResponse, ProviderError> {
        Err(ProviderError::Unimplemented {
            feature: "embeddings".to_string(),
        })
    }

    /// Active probe. `Ok(())` iff the endpoint is reachable and credentialed.
    async fn health_check(&self) -> Result<(), ProviderError>;
}

/// Configuration for one upstream endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Which adapter to instantiate
    pub kind: ProviderKind,
    /// Credential; `${VAR}` expansion happens in the configuration loader
    #[serde(default)]
    pub api_key: String,
    /// Override the adapter's default base URL
    #[serde(default)]
    pub base_url: Option<String>,
    /// Azure deployment name; ignored by other kinds
    #[serde(default)]
    pub deployment: Option<String>,
    /// Azure api-version query parameter; ignored by other kinds
    #[serde(default)]
    pub api_version: Option<String>,
    /// Extra HTTP headers sent with every request
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Transport timeout for this endpoint
    #[serde(with = "duration_serde", default = "default_timeout")]
    pub timeout: Duration,
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind, api_key: impl Into<String>) -> Self {
        Self {
            kind,
            api_key: api_key.into(),
            base_url: None,
            deployment: None,
            api_version: None,
            headers: HashMap::new(),
            timeout: default_timeout(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The key under which the registry caches the adapter built from this
    /// configuration. Instances whose configurations produce equal keys
    /// share one adapter and its connection pool.
    pub fn cache_key(&self) -> ProviderKey {
        ProviderKey {
            kind: self.kind,
            base_url: self.base_url.clone().unwrap_or_default(),
            credential: self.api_key.clone(),
            deployment: if self.kind == ProviderKind::Azure {
                self.deployment.clone()
            } else {
                None
            },
        }
    }
}

/// Cache key for shared adapters: (kind, base URL, credential, and for
/// Azure only, deployment name).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderKey {
    pub kind: ProviderKind,
    pub base_url: String,
    pub credential: String,
    pub deployment: Option<String>,
}

/// Build the adapter for a configuration.
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    match config.kind {
        ProviderKind::OpenAi => Ok(Arc::new(openai::OpenAiProvider::new(config.clone())?)),
        ProviderKind::Anthropic => Ok(Arc::new(anthropic::AnthropicProvider::new(config.clone())?)),
        ProviderKind::Azure => Ok(Arc::new(azure::AzureOpenAiProvider::new(config.clone())?)),
        ProviderKind::OpenRouter => {
            Ok(Arc::new(openrouter::OpenRouterProvider::new(config.clone())?))
        }
        ProviderKind::Custom => Ok(Arc::new(custom::CustomProvider::new(config.clone())?)),
    }
}
