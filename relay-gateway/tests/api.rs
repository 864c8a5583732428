// End-to-end gateway surface tests against a mock upstream.

use axum_test::TestServer;
use relay_gateway::config::{Config, ServerConfig, StoreConfig};
use relay_gateway::server::create_server;
use relay_dispatch::manager::ManagerConfig;
use relay_dispatch::providers::{ProviderConfig, ProviderKind};
use relay_dispatch::registry::{InstanceConfig, InstanceSource};
use relay_dispatch::route::{RouteConfig, RouteModel};
use serde_json::{json, Value};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn instance(id: &str, model: &str, base_url: &str, priority: i32) -> InstanceConfig {
    InstanceConfig {
        id: id.to_string(),
        model: model.to_string(),
        provider: ProviderConfig::new(ProviderKind::Custom, "")
            .with_base_url(base_url)
            .with_timeout(Duration::from_secs(2)),
        provider_model: format!("{model}-upstream"),
        source: InstanceSource::System,
        enabled: true,
        priority,
        weight: 1.0,
        timeout: Duration::from_secs(2),
        tags: Vec::new(),
        requests_per_minute: None,
        tokens_per_minute: None,
    }
}

fn base_config(instances: Vec<InstanceConfig>, routes: Vec<RouteConfig>) -> Config {
    Config {
        server: ServerConfig::default(),
        routing: ManagerConfig::default(),
        store: StoreConfig::default(),
        instances,
        routes,
    }
}

async fn mock_upstream() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-mock",
            "object": "chat.completion",
            "created": 1700000000,
            "model": "mock-upstream",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hello from upstream"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 4, "total_tokens": 9}
        })))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn chat_completion_round_trips_through_the_gateway() {
    let upstream = mock_upstream().await;
    let config = base_config(
        vec![instance("i1", "gpt-4o", &upstream.uri(), 100)],
        Vec::new(),
    );

    let app = create_server(config).await.unwrap();
    let server = TestServer::new(app).unwrap();

    let response = server
        .post("/v1/chat/completions")
        .json(&json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "Hello"}]
        }))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["choices"][0]["message"]["content"], "Hello from upstream");
    // The logical model name is reflected back, not the upstream one.
    assert_eq!(body["model"], "gpt-4o");
    assert_eq!(body["usage"]["total_tokens"], 9);
}

#[tokio::test]
async fn failing_instance_fails_over_to_the_healthy_one() {
    let upstream = mock_upstream().await;
    let config = base_config(
        vec![
            // Preferred instance points at a dead port; the gateway must
            // mask the failure.
            instance("dead", "gpt-4o", "http://127.0.0.1:9", 100),
            instance("alive", "gpt-4o", &upstream.uri(), 50),
        ],
        Vec::new(),
    );

    let app = create_server(config).await.unwrap();
    let server = TestServer::new(app).unwrap();

    let response = server
        .post("/v1/chat/completions")
        .json(&json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "Hello"}]
        }))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["choices"][0]["message"]["content"], "Hello from upstream");
}

#[tokio::test]
async fn exhausted_models_return_the_service_unavailable_envelope() {
    let config = base_config(
        vec![
            instance("dead-1", "gpt-4o", "http://127.0.0.1:9", 100),
            instance("dead-2", "gpt-4o", "http://127.0.0.1:9", 50),
        ],
        Vec::new(),
    );

    let app = create_server(config).await.unwrap();
    let server = TestServer::new(app).unwrap();

    let response = server
        .post("/v1/chat/completions")
        .json(&json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "Hello"}]
        }))
        .await;

    response.assert_status(axum::http::StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json();
    assert_eq!(body["error"]["type"], "service_unavailable_error");
}

#[tokio::test]
async fn unknown_model_is_a_404_envelope() {
    let upstream = mock_upstream().await;
    let config = base_config(
        vec![instance("i1", "gpt-4o", &upstream.uri(), 1)],
        Vec::new(),
    );

    let app = create_server(config).await.unwrap();
    let server = TestServer::new(app).unwrap();

    let response = server
        .post("/v1/chat/completions")
        .json(&json!({
            "model": "nonexistent",
            "messages": [{"role": "user", "content": "Hello"}]
        }))
        .await;

    response.assert_status(axum::http::StatusCode::NOT_FOUND);
    let body: Value = response.json();
    assert_eq!(body["error"]["type"], "model_not_found");
}

#[tokio::test]
async fn missing_messages_is_an_invalid_request() {
    let upstream = mock_upstream().await;
    let config = base_config(
        vec![instance("i1", "gpt-4o", &upstream.uri(), 1)],
        Vec::new(),
    );

    let app = create_server(config).await.unwrap();
    let server = TestServer::new(app).unwrap();

    let response = server
        .post("/v1/chat/completions")
        .json(&json!({"model": "gpt-4o", "messages": []}))
        .await;

    response.assert_status(axum::http::StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn model_listing_includes_route_slugs() {
    let upstream = mock_upstream().await;
    let config = base_config(
        vec![instance("i1", "gpt-4o", &upstream.uri(), 1)],
        vec![RouteConfig {
            slug: "smart".to_string(),
            strategy: "priority".to_string(),
            models: vec![RouteModel {
                name: "gpt-4o".to_string(),
                weight: 1.0,
                priority: 0,
                enabled: true,
            }],
            fallback_models: Vec::new(),
            enabled: true,
        }],
    );

    let app = create_server(config).await.unwrap();
    let server = TestServer::new(app).unwrap();

    let response = server.get("/v1/models").await;
    response.assert_status_ok();
    let body: Value = response.json();
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"gpt-4o"));
    assert!(ids.contains(&"smart"));
}

#[tokio::test]
async fn requests_to_a_route_slug_dispatch_to_members() {
    let upstream = mock_upstream().await;
    let config = base_config(
        vec![instance("i1", "gpt-4o", &upstream.uri(), 1)],
        vec![RouteConfig {
            slug: "smart".to_string(),
            strategy: "priority".to_string(),
            models: vec![RouteModel {
                name: "gpt-4o".to_string(),
                weight: 1.0,
                priority: 0,
                enabled: true,
            }],
            fallback_models: Vec::new(),
            enabled: true,
        }],
    );

    let app = create_server(config).await.unwrap();
    let server = TestServer::new(app).unwrap();

    let response = server
        .post("/v1/chat/completions")
        .json(&json!({
            "model": "smart",
            "messages": [{"role": "user", "content": "Hello"}]
        }))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["choices"][0]["message"]["content"], "Hello from upstream");
}

#[tokio::test]
async fn streaming_responses_are_sse_framed() {
    let upstream = MockServer::start().await;
    let sse_body = concat!(
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n"
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse_body),
        )
        .mount(&upstream)
        .await;

    let config = base_config(
        vec![instance("i1", "gpt-4o", &upstream.uri(), 1)],
        Vec::new(),
    );
    let app = create_server(config).await.unwrap();
    let server = TestServer::new(app).unwrap();

    let response = server
        .post("/v1/chat/completions")
        .json(&json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "Hello"}],
            "stream": true
        }))
        .await;

    response.assert_status_ok();
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    let body = response.text();
    assert!(body.contains("data: "));
    assert!(body.trim_end().ends_with("data: [DONE]"));
    assert!(body.contains("Hel"));
}

#[tokio::test]
async fn health_and_ready_probes() {
    let upstream = mock_upstream().await;
    let config = base_config(
        vec![instance("i1", "gpt-4o", &upstream.uri(), 1)],
        Vec::new(),
    );
    let app = create_server(config).await.unwrap();
    let server = TestServer::new(app).unwrap();

    server.get("/health").await.assert_status_ok();
    server.get("/ready").await.assert_status_ok();

    // A gateway with nothing registered is alive but not ready.
    let empty = create_server(base_config(Vec::new(), Vec::new())).await.unwrap();
    let empty_server = TestServer::new(empty).unwrap();
    empty_server.get("/health").await.assert_status_ok();
    empty_server
        .get("/ready")
        .await
        .assert_status(axum::http::StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn legacy_completions_shape() {
    let upstream = mock_upstream().await;
    let config = base_config(
        vec![instance("i1", "gpt-4o", &upstream.uri(), 1)],
        Vec::new(),
    );
    let app = create_server(config).await.unwrap();
    let server = TestServer::new(app).unwrap();

    let response = server
        .post("/v1/completions")
        .json(&json!({"model": "gpt-4o", "prompt": "Say hello"}))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["object"], "text_completion");
    assert_eq!(body["choices"][0]["text"], "Hello from upstream");
    assert_eq!(body["model"], "gpt-4o");
}
