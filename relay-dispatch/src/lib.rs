//! # Relay Dispatch
//!
//! The request-dispatch core of the relay gateway: resolve a logical model
//! name to a concrete upstream endpoint, distribute load, track latency and
//! health across a cluster of gateway replicas, and mask upstream failures
//! from callers through transparent retry and fallback.
//!
//! ## Components
//!
//! - [`providers`] — the uniform upstream adapter contract and the
//!   OpenAI / Anthropic / Azure / OpenRouter / custom implementations
//! - [`registry`] — instances, model buckets sorted by priority, and the
//!   shared provider-adapter cache
//! - [`health`] — consecutive-failure gating plus the periodic prober
//! - [`metrics`] — per-instance counters and the latency EMA
//! - [`latency`] — sliding-window latency samples, shared through Redis
//!   with an in-memory fallback
//! - [`strategy`] — priority, random, least-latency, and weighted
//!   round-robin selection, including the route-level smooth interleave
//! - [`route`] — named model groups with their own strategy and fallbacks
//! - [`failover`] — the two-level retry executor
//! - [`manager`] — the facade composing all of the above
//!
//! ## Dispatch flow
//!
//! ```text
//! handler → ModelManager::execute_with_failover
//!         → executor picks healthy candidates from the registry
//!         → strategy selects one instance
//!         → caller-supplied closure performs the upstream call
//!         → outcome recorded (health, metrics, shared latency)
//!         → on failure: next instance, then the fallback chain
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use relay_dispatch::failover::FailoverRequest;
//! use relay_dispatch::manager::{ManagerConfig, ModelManager};
//!
//! # async fn run(instances: Vec<relay_dispatch::registry::InstanceConfig>) {
//! let manager = ModelManager::new(ManagerConfig::default(), None);
//! manager.load(instances).unwrap();
//! manager.start_health_checker();
//!
//! let request = FailoverRequest::new("gpt-4o", |instance| async move {
//!     let mut req = relay_dispatch::models::ChatRequest::default();
//!     req.model = instance.provider_model().to_string();
//!     instance.provider.chat_completion(req).await
//! });
//! let result = manager.execute_with_failover(request).await.unwrap();
//! println!("answered by {} in {} attempts", result.instance.id(), result.attempts);
//! # }
//! ```

pub mod common;
pub mod error;
pub mod failover;
pub mod health;
pub mod latency;
pub mod manager;
pub mod metrics;
pub mod models;
pub mod providers;
pub mod registry;
pub mod route;
pub mod store;
pub mod strategy;

pub use error::{DispatchError, ProviderError};
pub use failover::{FailoverConfig, FailoverRequest, FailoverResult};
pub use manager::{ManagerConfig, ModelManager};
pub use models::{
    ChatRequest, ChatResponse, Choice, EmbeddingRequest, EmbeddingResponse, Message, Role,
    StreamChunk, Usage,
};
pub use providers::{Provider, ProviderConfig, ProviderKind};
pub use registry::{Instance, InstanceConfig, ModelRegistry};
pub use route::{RouteConfig, RouteModel};

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;
