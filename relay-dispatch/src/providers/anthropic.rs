use crate::error::ProviderError;
use crate::models::{
    ChatRequest, ChatResponse, Choice, Delta, Message, Role, StreamChoice, StreamChunk, Usage,
};
use crate::providers::{Provider, ProviderConfig, ProviderKind, StreamResult};
use async_stream::stream;
use serde::{Deserialize, Serialize};

use super::http_client::{probe_outcome, Credential, ProviderHttp};

pub struct AnthropicProvider {
    http: ProviderHttp,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    id: String,
    content: Vec<AnthropicContent>,
    model: String,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

impl AnthropicProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let mut headers = config.headers.clone();
        headers
            .entry("anthropic-version".to_string())
            .or_insert_with(|| "2023-06-01".to_string());
        let http = ProviderHttp::build(
            config.base_url.clone(),
            "https://api.anthropic.com",
            Credential::HeaderPair {
                name: "x-api-key".to_string(),
                value: config.api_key.clone(),
            },
            &headers,
            config.timeout,
        )?;

        Ok(Self { http })
    }

    /// Split out system messages and convert the rest to Anthropic roles.
    fn convert_request(&self, request: &ChatRequest, streaming: bool) -> AnthropicRequest {
        let mut system = String::new();
        let mut messages = Vec::new();

        for msg in &request.messages {
            match msg.role {
                Role::System => {
                    if !system.is_empty() {
                        system.push('\n');
                    }
                    system.push_str(&msg.content);
                }
                Role::User => messages.push(AnthropicMessage {
                    role: "user".to_string(),
                    content: msg.content.clone(),
                }),
                Role::Assistant => messages.push(AnthropicMessage {
                    role: "assistant".to_string(),
                    content: msg.content.clone(),
                }),
                Role::Tool => continue,
            }
        }

        AnthropicRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(4096),
            messages,
            system: if system.is_empty() { None } else { Some(system) },
            temperature: request.temperature,
            stream: if streaming { Some(true) } else { None },
        }
    }

    fn convert_response(&self, response: AnthropicResponse) -> ChatResponse {
        let content = response
            .content
            .into_iter()
            .map(|c| c.text)
            .collect::<Vec<_>>()
            .join("");

        ChatResponse {
            id: response.id,
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp() as u64,
            model: response.model,
            choices: vec![Choice {
                index: 0,
                message: Message {
                    role: Role::Assistant,
                    content,
                    name: None,
                },
                finish_reason: response.stop_reason,
            }],
            usage: Some(Usage {
                prompt_tokens: response.usage.input_tokens,
                completion_tokens: response.usage.output_tokens,
                total_tokens: response.usage.input_tokens + response.usage.output_tokens,
            }),
            system_fingerprint: None,
        }
    }
}

#[async_trait::async_trait]
impl Provider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn supports_model(&self, model: &str) -> bool {
        model.starts_with("claude")
    }

    fn list_models(&self) -> Vec<String> {
        vec![
            "claude-sonnet-4-20250514".to_string(),
            "claude-3-5-sonnet-20241022".to_string(),
            "claude-3-5-haiku-20241022".to_string(),
            "claude-3-haiku-20240307".to_string(),
        ]
    }

    async fn chat_completion(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let anthropic_request = self.convert_request(&request, false);
        let anthropic_response: AnthropicResponse = self
            .http
            .post_json("/v1/messages", &anthropic_request)
            .await?;
        Ok(self.convert_response(anthropic_response))
    }

    async fn stream_chat_completion(
        &self,
        request: ChatRequest,
    ) -> Result<StreamResult, ProviderError> {
        let anthropic_request = self.convert_request(&request, true);

        let response = self
            .http
            .open_stream("/v1/messages", &anthropic_request)
            .await?;

        // Anthropic streams its own event format; convert text deltas to
        // OpenAI-shaped chunks on the fly.
        let stream = Box::pin(stream! {
            let mut bytes_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk_result) = futures::StreamExt::next(&mut bytes_stream).await {
                match chunk_result {
                    Ok(chunk) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));

                        while let Some(line_end) = buffer.find('\n') {
                            let line = buffer[..line_end].trim().to_string();
                            buffer = buffer[line_end + 1..].to_string();

                            let Some(json_str) = line.strip_prefix("data: ") else {
                                continue;
                            };
                            if json_str == "[DONE]" {
                                return;
                            }

                            match serde_json::from_str::<serde_json::Value>(json_str) {
                                Ok(event) => {
                                    if event.get("type").and_then(|t| t.as_str())
                                        == Some("message_stop")
                                    {
                                        return;
                                    }
                                    let Some(text) = event
                                        .get("delta")
                                        .and_then(|d| d.get("text"))
                                        .and_then(|t| t.as_str())
                                    else {
                                        continue;
                                    };

                                    yield Ok(StreamChunk {
                                        id: event
                                            .get("id")
                                            .and_then(|id| id.as_str())
                                            .unwrap_or("anthropic-stream")
                                            .to_string(),
                                        object: "chat.completion.chunk".to_string(),
                                        created: chrono::Utc::now().timestamp() as u64,
                                        model: event
                                            .get("model")
                                            .and_then(|m| m.as_str())
                                            .unwrap_or_default()
                                            .to_string(),
                                        choices: vec![StreamChoice {
                                            index: 0,
                                            delta: Delta {
                                                role: None,
                                                content: Some(text.to_string()),
                                            },
                                            finish_reason: None,
                                        }],
                                    });
                                }
                                Err(e) => yield Err(ProviderError::Serialization(e)),
                            }
                        }
                    }
                    Err(e) => yield Err(ProviderError::Http(e)),
                }
            }
        });

        Ok(stream)
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        // No cheap probe endpoint; a minimal one-token message proves both
        // reachability and credential. Shape rejections still count.
        let probe = AnthropicRequest {
            model: "claude-3-5-haiku-20241022".to_string(),
            max_tokens: 1,
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: "Hi".to_string(),
            }],
            system: None,
            temperature: Some(0.0),
            stream: None,
        };

        let result = self
            .http
            .post_json::<AnthropicRequest, serde_json::Value>("/v1/messages", &probe)
            .await
            .map(|_| ());
        probe_outcome(result)
    }
}
