use crate::error::ProviderError;
use crate::models::{ChatRequest, ChatResponse};
use crate::providers::{Provider, ProviderConfig, ProviderKind, StreamResult};

use super::http_client::{probe_outcome, sse_chunk_stream, Credential, ProviderHttp};

pub struct OpenRouterProvider {
    http: ProviderHttp,
}

impl OpenRouterProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let http = ProviderHttp::build(
            config.base_url.clone(),
            "https://openrouter.ai/api/v1",
            Credential::BearerToken(config.api_key.clone()),
            &config.headers,
            config.timeout,
        )?;

        Ok(Self { http })
    }
}

#[async_trait::async_trait]
impl Provider for OpenRouterProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenRouter
    }

    fn supports_model(&self, model: &str) -> bool {
        // OpenRouter names are vendor-prefixed ("openai/gpt-4o").
        model.contains('/')
    }

    fn list_models(&self) -> Vec<String> {
        vec![
            "openai/gpt-4o".to_string(),
            "anthropic/claude-3.5-sonnet".to_string(),
            "meta-llama/llama-3.1-70b-instruct".to_string(),
        ]
    }

    async fn chat_completion(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.http.post_json("/chat/completions", &request).await
    }

    async fn stream_chat_completion(
        &self,
        mut request: ChatRequest,
    ) -> Result<StreamResult, ProviderError> {
        request.stream = Some(true);

        let response = self.http.open_stream("/chat/completions", &request).await?;
        Ok(sse_chunk_stream(response))
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let result = self
            .http
            .get_json::<serde_json::Value>("/models")
            .await
            .map(|_| ());
        probe_outcome(result)
    }
}
