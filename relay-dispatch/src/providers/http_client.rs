use crate::error::ProviderError;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// How an adapter authenticates against its upstream.
#[derive(Clone, Debug)]
pub enum Credential {
    BearerToken(String),
    HeaderPair { name: String, value: String },
    Anonymous,
}

impl Credential {
    fn apply(&self, headers: &mut HeaderMap) -> Result<(), ProviderError> {
        let pair = match self {
            Credential::BearerToken(token) => {
                Some(("Authorization".to_string(), format!("Bearer {token}")))
            }
            Credential::HeaderPair { name, value } => Some((name.clone(), value.clone())),
            Credential::Anonymous => None,
        };
        if let Some((name, value)) = pair {
            let name = name
                .parse::<HeaderName>()
                .map_err(|_| bad_header(&name))?;
            let value = value
                .parse::<HeaderValue>()
                .map_err(|_| bad_header(name.as_str()))?;
            headers.insert(name, value);
        }
        Ok(())
    }
}

fn bad_header(name: &str) -> ProviderError {
    ProviderError::Configuration {
        message: format!("invalid header: {name}"),
    }
}

/// HTTP plumbing shared by the upstream adapters. One dispatcher builds and
/// sends every request; the public helpers only differ in method, body, and
/// how the response is consumed.
#[derive(Clone)]
pub struct ProviderHttp {
    transport: Client,
    root: String,
    headers: HeaderMap,
}

impl ProviderHttp {
    pub fn build(
        base_url: Option<String>,
        default_base: &str,
        credential: Credential,
        extra_headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let transport =
            Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| ProviderError::Configuration {
                    message: format!("failed to create HTTP client: {e}"),
                })?;

        // Operator-supplied headers first, then the credential, which may
        // not be silently dropped.
        let mut headers = HeaderMap::new();
        for (name, value) in extra_headers {
            match (name.parse::<HeaderName>(), value.parse::<HeaderValue>()) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => tracing::warn!(header = %name, "skipping malformed extra header"),
            }
        }
        credential.apply(&mut headers)?;

        let root = base_url
            .unwrap_or_else(|| default_base.to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            transport,
            root,
            headers,
        })
    }

    async fn dispatch<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response, ProviderError> {
        let url = format!("{}/{}", self.root, path.trim_start_matches('/'));
        let mut request = self
            .transport
            .request(method, url)
            .headers(self.headers.clone());
        if let Some(body) = body {
            request = request.json(body);
        }
        request.send().await.map_err(classify_transport_error)
    }

    pub async fn post_json<TReq: Serialize, TResp: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<TResp, ProviderError> {
        decode(self.dispatch(Method::POST, path, Some(body)).await?).await
    }

    pub async fn get_json<TResp: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<TResp, ProviderError> {
        decode(self.dispatch::<()>(Method::GET, path, None).await?).await
    }

    /// POST whose successful response body is consumed incrementally (SSE).
    /// Upstream rejections are mapped here, so callers only see a response
    /// they can stream from.
    pub async fn open_stream<TReq: Serialize>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<Response, ProviderError> {
        let response = self.dispatch(Method::POST, path, Some(body)).await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response)
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ProviderError> {
    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }
    response.json().await.map_err(ProviderError::Http)
}

/// Connection-level failures become `Unavailable`, timeouts become
/// `Timeout`; everything else stays a raw HTTP error.
fn classify_transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else if err.is_connect() {
        ProviderError::Unavailable {
            message: err.to_string(),
        }
    } else {
        ProviderError::Http(err)
    }
}

/// Map a non-success upstream response to a provider error kind, pulling a
/// message out of the common `{"error": {"message": ...}}` shape when one
/// is present.
async fn error_from_response(response: Response) -> ProviderError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or(body);

    match status {
        401 | 403 => ProviderError::Unauthenticated,
        429 => ProviderError::RateLimited,
        500..=599 => ProviderError::Unavailable {
            message: format!("upstream {status}: {message}"),
        },
        other => ProviderError::Api {
            status: other,
            message,
        },
    }
}

/// Drain an OpenAI-wire-format SSE body into a chunk stream.
///
/// Frames are `data: <json>` lines; the `data: [DONE]` sentinel ends the
/// stream. Used by every adapter whose upstream already speaks the OpenAI
/// streaming format.
pub fn sse_chunk_stream(response: Response) -> crate::providers::StreamResult {
    use crate::models::StreamChunk;
    use async_stream::stream;

    Box::pin(stream! {
        let mut bytes_stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk_result) = futures::StreamExt::next(&mut bytes_stream).await {
            match chunk_result {
                Ok(chunk) => {
                    buffer.push_str(&String::from_utf8_lossy(&chunk));

                    while let Some(line_end) = buffer.find('\n') {
                        let line = buffer[..line_end].trim().to_string();
                        buffer = buffer[line_end + 1..].to_string();

                        if let Some(json_str) = line.strip_prefix("data: ") {
                            if json_str == "[DONE]" {
                                return;
                            }

                            match serde_json::from_str::<StreamChunk>(json_str) {
                                Ok(stream_chunk) => yield Ok(stream_chunk),
                                Err(e) => yield Err(ProviderError::Serialization(e)),
                            }
                        }
                    }
                }
                Err(e) => yield Err(ProviderError::Http(e)),
            }
        }
    })
}

/// Shared probe-outcome classification: a 4xx other than 401/403/429 still
/// proves the endpoint is reachable and credentialed.
pub fn probe_outcome(result: Result<(), ProviderError>) -> Result<(), ProviderError> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.indicates_reachable() => Ok(()),
        Err(e) => Err(e),
    }
}
