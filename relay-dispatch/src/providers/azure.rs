use crate::error::ProviderError;
use crate::models::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse};
use crate::providers::{Provider, ProviderConfig, ProviderKind, StreamResult};

use super::http_client::{probe_outcome, sse_chunk_stream, Credential, ProviderHttp};

const DEFAULT_API_VERSION: &str = "2024-02-15-preview";

/// Azure OpenAI speaks the OpenAI wire format, but routes by deployment
/// name rather than by model, and authenticates with an `api-key` header.
pub struct AzureOpenAiProvider {
    http: ProviderHttp,
    deployment: String,
    api_version: String,
}

impl AzureOpenAiProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let deployment = config
            .deployment
            .clone()
            .ok_or_else(|| ProviderError::Configuration {
                message: "azure provider requires a deployment name".to_string(),
            })?;
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| ProviderError::Configuration {
                message: "azure provider requires a resource base URL".to_string(),
            })?;

        let http = ProviderHttp::build(
            Some(base_url),
            "",
            Credential::HeaderPair {
                name: "api-key".to_string(),
                value: config.api_key.clone(),
            },
            &config.headers,
            config.timeout,
        )?;

        Ok(Self {
            http,
            deployment,
            api_version: config
                .api_version
                .clone()
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
        })
    }

    fn endpoint(&self, operation: &str) -> String {
        format!(
            "/openai/deployments/{}/{}?api-version={}",
            self.deployment, operation, self.api_version
        )
    }
}

#[async_trait::async_trait]
impl Provider for AzureOpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Azure
    }

    fn supports_model(&self, model: &str) -> bool {
        // The deployment decides the model on the Azure side.
        model == self.deployment || model.starts_with("gpt-")
    }

    fn list_models(&self) -> Vec<String> {
        vec![self.deployment.clone()]
    }

    async fn chat_completion(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.http
            .post_json(&self.endpoint("chat/completions"), &request)
            .await
    }

    async fn stream_chat_completion(
        &self,
        mut request: ChatRequest,
    ) -> Result<StreamResult, ProviderError> {
        request.stream = Some(true);

        let response = self
            .http
            .open_stream(&self.endpoint("chat/completions"), &request)
            .await?;
        Ok(sse_chunk_stream(response))
    }

    async fn embeddings(
        &self,
        request: EmbeddingRequest,
    ) -> Result<EmbeddingResponse, ProviderError> {
        self.http
            .post_json(&self.endpoint("embeddings"), &request)
            .await
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        // Azure has no unauthenticated listing under the deployment path;
        // probe with an empty-body POST and accept shape rejections.
        let result = self
            .http
            .post_json::<serde_json::Value, serde_json::Value>(
                &self.endpoint("chat/completions"),
                &serde_json::json!({}),
            )
            .await
            .map(|_| ());
        probe_outcome(result)
    }
}
