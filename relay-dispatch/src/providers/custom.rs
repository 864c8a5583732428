use crate::error::ProviderError;
use crate::models::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse};
use crate::providers::{Provider, ProviderConfig, ProviderKind, StreamResult};

use super::http_client::{probe_outcome, sse_chunk_stream, Credential, ProviderHttp};

/// Adapter for any OpenAI-compatible endpoint: local inference servers,
/// proxies, or self-hosted gateways. Requires an explicit base URL; auth is
/// bearer when a key is configured, none otherwise.
pub struct CustomProvider {
    http: ProviderHttp,
}

impl CustomProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| ProviderError::Configuration {
                message: "custom provider requires a base URL".to_string(),
            })?;

        let credential = if config.api_key.is_empty() {
            Credential::Anonymous
        } else {
            Credential::BearerToken(config.api_key.clone())
        };

        let http = ProviderHttp::build(
            Some(base_url),
            "",
            credential,
            &config.headers,
            config.timeout,
        )?;

        Ok(Self { http })
    }
}

#[async_trait::async_trait]
impl Provider for CustomProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Custom
    }

    fn supports_model(&self, _model: &str) -> bool {
        // The operator decides what the endpoint serves.
        true
    }

    fn list_models(&self) -> Vec<String> {
        Vec::new()
    }

    async fn chat_completion(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.http.post_json("/v1/chat/completions", &request).await
    }

    async fn stream_chat_completion(
        &self,
        mut request: ChatRequest,
    ) -> Result<StreamResult, ProviderError> {
        request.stream = Some(true);

        let response = self
            .http
            .open_stream("/v1/chat/completions", &request)
            .await?;
        Ok(sse_chunk_stream(response))
    }

    async fn embeddings(
        &self,
        request: EmbeddingRequest,
    ) -> Result<EmbeddingResponse, ProviderError> {
        self.http.post_json("/v1/embeddings", &request).await
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let result = self
            .http
            .get_json::<serde_json::Value>("/v1/models")
            .await
            .map(|_| ());
        probe_outcome(result)
    }
}
