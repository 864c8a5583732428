use crate::error::ProviderError;
use crate::models::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse};
use crate::providers::{Provider, ProviderConfig, ProviderKind, StreamResult};

use super::http_client::{probe_outcome, sse_chunk_stream, Credential, ProviderHttp};

pub struct OpenAiProvider {
    http: ProviderHttp,
}

impl OpenAiProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let http = ProviderHttp::build(
            config.base_url.clone(),
            "https://api.openai.com/v1",
            Credential::BearerToken(config.api_key.clone()),
            &config.headers,
            config.timeout,
        )?;

        Ok(Self { http })
    }
}

#[async_trait::async_trait]
impl Provider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn supports_model(&self, model: &str) -> bool {
        model.starts_with("gpt-") || model.starts_with("o") || model.starts_with("text-embedding-")
    }

    fn list_models(&self) -> Vec<String> {
        vec![
            "gpt-4o".to_string(),
            "gpt-4o-mini".to_string(),
            "gpt-4-turbo".to_string(),
            "gpt-3.5-turbo".to_string(),
            "text-embedding-3-small".to_string(),
            "text-embedding-3-large".to_string(),
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

    async fn embeddings(
        &self,
        request: EmbeddingRequest,
    ) -> Result<EmbeddingResponse, ProviderError> {
        self.http.post_json("/embeddings", &request).await
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
