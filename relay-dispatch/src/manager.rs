//! # Model Manager
//!
//! The public facade composing the registry, routes, health tracking,
//! metrics, the distributed latency tracker, and the failover executor.
//! Handlers hold one `ModelManager` behind an `Arc` and drive everything
//! through it; the registry's read-write lock remains the single
//! synchronization point for structural changes.

use crate::error::DispatchError;
use crate::failover::{FailoverConfig, FailoverExecutor, FailoverRequest, FailoverResult};
use crate::health::{HealthChecker, HealthTracker, DEFAULT_CHECK_INTERVAL, DEFAULT_PROBE_TIMEOUT};
use crate::latency::{LatencyPercentiles, LatencyTracker, DEFAULT_MAX_SAMPLES, DEFAULT_WINDOW};
use crate::metrics::{InstanceMetrics, MetricsCollector};
use crate::providers::ProviderKind;
use crate::registry::{Instance, InstanceConfig, InstanceSource, ModelRegistry};
use crate::route::{RouteConfig, RouteRegistry};
use crate::store::SharedStore;
use crate::strategy::{self, Candidate};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::common::duration_serde;

/// Everything the manager needs beyond the instance list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// One of priority, least-latency, weighted-round-robin, random.
    /// Unknown names downgrade to priority with a warning.
    #[serde(default = "default_strategy")]
    pub routing_strategy: String,
    #[serde(flatten)]
    pub failover: FailoverConfig,
    #[serde(with = "duration_serde", default = "default_interval")]
    pub health_check_interval: Duration,
    #[serde(with = "duration_serde", default = "default_probe_timeout")]
    pub probe_timeout: Duration,
    #[serde(with = "duration_serde", default = "default_window")]
    pub latency_window: Duration,
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
}

fn default_strategy() -> String {
    strategy::PRIORITY.to_string()
}

fn default_interval() -> Duration {
    DEFAULT_CHECK_INTERVAL
}

fn default_probe_timeout() -> Duration {
    DEFAULT_PROBE_TIMEOUT
}

fn default_window() -> Duration {
    DEFAULT_WINDOW
}

fn default_max_samples() -> usize {
    DEFAULT_MAX_SAMPLES
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            routing_strategy: default_strategy(),
            failover: FailoverConfig::default(),
            health_check_interval: default_interval(),
            probe_timeout: default_probe_timeout(),
            latency_window: default_window(),
            max_samples: default_max_samples(),
        }
    }
}

/// Aggregated per-model statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStats {
    pub model: String,
    pub instance_count: usize,
    pub healthy_count: usize,
    pub total_requests: u64,
    pub total_tokens: u64,
    pub avg_ema_latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_percentiles: Option<LatencyPercentiles>,
}

/// Entity metadata for one instance, as exposed by the detailed listing.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceInfo {
    pub id: String,
    pub provider: ProviderKind,
    pub provider_model: String,
    pub source: InstanceSource,
    pub enabled: bool,
    pub priority: i32,
    pub weight: f64,
    pub healthy: bool,
    pub ema_latency_ms: f64,
    pub tags: Vec<String>,
}

/// Detailed per-model entity listing (route slugs excluded).
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub model: String,
    pub instances: Vec<InstanceInfo>,
}

/// Started-request handle returned by [`ModelManager::record_request_start`].
pub struct RequestTimer {
    started: Instant,
}

impl RequestTimer {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Facade over the dispatch core.
pub struct ModelManager {
    registry: Arc<ModelRegistry>,
    routes: Arc<RouteRegistry>,
    health: Arc<HealthTracker>,
    metrics: Arc<MetricsCollector>,
    latency: Arc<LatencyTracker>,
    executor: FailoverExecutor,
    store: Option<SharedStore>,
    config: ManagerConfig,
    checker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ModelManager {
    pub fn new(config: ManagerConfig, store: Option<SharedStore>) -> Self {
        let registry = Arc::new(ModelRegistry::new());
        let routes = Arc::new(RouteRegistry::new());
        let health = Arc::new(HealthTracker::new());
        let metrics = Arc::new(MetricsCollector::new());

        let latency = Arc::new(match &store {
            Some(shared) => LatencyTracker::shared(
                shared.clone(),
                config.latency_window,
                config.max_samples,
            ),
            None => LatencyTracker::in_memory(config.latency_window, config.max_samples),
        });

        let selection =
            strategy::from_name_or_default(&config.routing_strategy, Some(Arc::clone(&latency)));
        tracing::info!(strategy = selection.name(), "model manager initialized");

        let executor = FailoverExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&routes),
            Arc::clone(&health),
            selection,
            Some(Arc::clone(&latency)),
            config.failover.clone(),
        );

        Self {
            registry,
            routes,
            health,
            metrics,
            latency,
            executor,
            store,
            config,
            checker: Mutex::new(None),
        }
    }

    /// Replace registry contents from configuration.
    pub fn load(&self, instances: Vec<InstanceConfig>) -> Result<(), DispatchError> {
        self.registry.load(instances)
    }

    pub fn add_instance(&self, config: InstanceConfig) -> Result<(), DispatchError> {
        self.registry.add_instance(config)
    }

    pub fn remove_instance(&self, id: &str) -> Result<(), DispatchError> {
        self.registry.remove_instance(id)
    }

    pub fn update_instance(&self, id: &str, config: InstanceConfig) -> Result<(), DispatchError> {
        self.registry.update_instance(id, config)
    }

    pub fn register_route(&self, route: RouteConfig) -> Result<(), DispatchError> {
        self.routes.register(route, &self.registry)
    }

    pub fn unregister_route(&self, slug: &str) -> Result<(), DispatchError> {
        self.routes.unregister(slug)
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Select the instance the configured strategy would dispatch to now.
    pub async fn get_best_instance(&self, model: &str) -> Result<Arc<Instance>, DispatchError> {
        if self.registry.get_model_instances(model).is_empty() {
            return Err(DispatchError::NotFound {
                model: model.to_string(),
            });
        }
        let healthy = self.registry.get_healthy_instances(model);
        if healthy.is_empty() {
            return Err(DispatchError::unavailable(
                format!("no healthy instances for model: {model}"),
                Vec::new(),
            ));
        }
        let candidates: Vec<Candidate> =
            healthy.iter().map(|i| Candidate::from_instance(i)).collect();
        let index = self.executor_strategy_select(&candidates).await?;
        Ok(Arc::clone(&healthy[index]))
    }

    async fn executor_strategy_select(
        &self,
        candidates: &[Candidate],
    ) -> Result<usize, DispatchError> {
        // The executor owns the configured strategy; reuse it for one-shot
        // selection so counters advance consistently.
        self.executor.strategy().select(candidates).await
    }

    /// Dispatch through the failover executor.
    pub async fn execute_with_failover<T: Send + 'static>(
        &self,
        request: FailoverRequest<T>,
    ) -> Result<FailoverResult<T>, DispatchError> {
        self.executor.execute_with_failover(request).await
    }

    /// Stamp the start of a request; pair with [`Self::record_request_end`].
    pub fn record_request_start(&self) -> RequestTimer {
        RequestTimer {
            started: Instant::now(),
        }
    }

    /// Record a completed request: metrics synchronously, the shared
    /// latency sample from a detached task with its own small budget so a
    /// cancelled caller never loses the bookkeeping. Best-effort; never
    /// fails the request.
    pub fn record_request_end(&self, instance: &Arc<Instance>, tokens: u64, latency: Duration) {
        self.metrics.record_request(instance, tokens, latency);

        let tracker = Arc::clone(&self.latency);
        let model = instance.model().to_string();
        tokio::spawn(async move {
            if let Err(e) = tracker.record_latency(&model, latency).await {
                tracing::debug!(model = %model, error = %e, "latency sample dropped");
            }
        });
    }

    /// Whether admitting the request would exceed the instance's caps.
    /// Query only; selection does not consult it.
    pub fn check_rate_limit(&self, instance: &Instance, additional_tokens: u64) -> bool {
        self.metrics.check_rate_limit(instance, additional_tokens)
    }

    pub async fn get_model_stats(&self, model: &str) -> Option<ModelStats> {
        let instances = self.registry.get_model_instances(model);
        if instances.is_empty() {
            return None;
        }

        let healthy_count = instances.iter().filter(|i| i.is_healthy()).count();
        let total_requests = instances.iter().map(|i| i.total_requests()).sum();
        let total_tokens = instances.iter().map(|i| i.total_tokens()).sum();
        let avg_ema =
            instances.iter().map(|i| i.ema_latency_ms()).sum::<f64>() / instances.len() as f64;
        let percentiles = self.latency.get_percentiles(model).await.ok().flatten();

        Some(ModelStats {
            model: model.to_string(),
            instance_count: instances.len(),
            healthy_count,
            total_requests,
            total_tokens,
            avg_ema_latency_ms: avg_ema,
            latency_percentiles: percentiles,
        })
    }

    /// Caller-visible model names, including route slugs.
    pub fn get_available_models(&self) -> Vec<String> {
        let mut models = self.registry.get_available_models();
        models.extend(self.routes.slugs());
        models.sort();
        models.dedup();
        models
    }

    /// Entity metadata per model; route slugs are excluded here.
    pub fn get_detailed_model_info(&self) -> Vec<ModelInfo> {
        self.registry
            .get_available_models()
            .into_iter()
            .map(|model| {
                let instances = self
                    .registry
                    .get_model_instances(&model)
                    .iter()
                    .map(|i| InstanceInfo {
                        id: i.id().to_string(),
                        provider: i.provider.kind(),
                        provider_model: i.provider_model().to_string(),
                        source: i.config.source,
                        enabled: i.config.enabled,
                        priority: i.priority(),
                        weight: i.weight(),
                        healthy: i.is_healthy(),
                        ema_latency_ms: i.ema_latency_ms(),
                        tags: i.config.tags.clone(),
                    })
                    .collect();
                ModelInfo { model, instances }
            })
            .collect()
    }

    pub fn get_all_metrics(&self) -> Vec<InstanceMetrics> {
        self.metrics.get_all_metrics(&self.registry.get_all_instances())
    }

    /// Start the periodic prober. Idempotent; the previous loop is aborted
    /// when called again.
    pub fn start_health_checker(&self) {
        let checker = self.build_checker();
        let handle = checker.spawn();
        let mut slot = self.checker.lock().expect("checker slot poisoned");
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    /// Run one probe pass inline. The startup path and tests use this.
    pub async fn run_health_probes(&self) {
        self.build_checker().run_probe_pass().await;
    }

    fn build_checker(&self) -> HealthChecker {
        HealthChecker::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.health),
            self.store.clone(),
            self.config.health_check_interval,
            self.config.probe_timeout,
        )
    }

    pub fn health_tracker(&self) -> &Arc<HealthTracker> {
        &self.health
    }
}

impl Drop for ModelManager {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.checker.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ProviderConfig, ProviderKind};
    use crate::registry::test_support::instance_config;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn manager() -> ModelManager {
        ModelManager::new(ManagerConfig::default(), None)
    }

    #[tokio::test]
    async fn best_instance_follows_priority() {
        let mgr = manager();
        mgr.load(vec![
            instance_config("lo", "m", 10),
            instance_config("hi", "m", 90),
        ])
        .unwrap();

        let best = mgr.get_best_instance("m").await.unwrap();
        assert_eq!(best.id(), "hi");
    }

    #[tokio::test]
    async fn unknown_model_vs_unhealthy_model() {
        let mgr = manager();
        mgr.load(vec![instance_config("only", "m", 1)]).unwrap();

        assert!(matches!(
            mgr.get_best_instance("ghost").await.unwrap_err(),
            DispatchError::NotFound { .. }
        ));

        let instance = mgr.registry().get_instance("only").unwrap();
        for _ in 0..3 {
            mgr.health_tracker().record_failure(&instance, "down");
        }
        assert!(matches!(
            mgr.get_best_instance("m").await.unwrap_err(),
            DispatchError::Unavailable { .. }
        ));
    }

    #[tokio::test]
    async fn available_models_include_route_slugs_details_do_not() {
        let mgr = manager();
        mgr.load(vec![instance_config("a1", "alpha", 1)]).unwrap();
        mgr.register_route(RouteConfig {
            slug: "blend".to_string(),
            strategy: strategy::PRIORITY.to_string(),
            models: vec![crate::route::RouteModel {
                name: "alpha".to_string(),
                weight: 1.0,
                priority: 0,
                enabled: true,
            }],
            fallback_models: Vec::new(),
            enabled: true,
        })
        .unwrap();

        assert_eq!(mgr.get_available_models(), vec!["alpha", "blend"]);

        let detailed = mgr.get_detailed_model_info();
        assert_eq!(detailed.len(), 1);
        assert_eq!(detailed[0].model, "alpha");
    }

    #[tokio::test]
    async fn request_end_feeds_metrics_and_latency() {
        let mgr = manager();
        mgr.load(vec![instance_config("i1", "m", 1)]).unwrap();
        let instance = mgr.registry().get_instance("i1").unwrap();

        let timer = mgr.record_request_start();
        mgr.record_request_end(&instance, 42, Duration::from_millis(120));
        assert!(timer.elapsed() < Duration::from_secs(1));

        let stats = mgr.get_model_stats("m").await.unwrap();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.total_tokens, 42);
        assert!(stats.avg_ema_latency_ms > 0.0);

        // The detached latency write lands shortly after.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let avg = mgr.latency.get_average_latency("m").await.unwrap();
        assert_eq!(avg, Some(120.0));
    }

    #[tokio::test]
    async fn probe_success_recovers_an_unhealthy_instance() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"object": "list", "data": []})),
            )
            .mount(&server)
            .await;

        let mgr = manager();
        let mut config = instance_config("recoverable", "m", 1);
        config.provider =
            ProviderConfig::new(ProviderKind::Custom, "").with_base_url(server.uri());
        mgr.load(vec![config]).unwrap();

        let instance = mgr.registry().get_instance("recoverable").unwrap();
        for _ in 0..3 {
            mgr.health_tracker().record_failure(&instance, "transport down");
        }
        assert!(!instance.is_healthy());
        assert!(mgr.get_best_instance("m").await.is_err());

        mgr.run_health_probes().await;

        assert!(instance.is_healthy());
        assert_eq!(instance.consecutive_failures(), 0);
        let best = mgr.get_best_instance("m").await.unwrap();
        assert_eq!(best.id(), "recoverable");
    }

    #[tokio::test]
    async fn probe_failure_keeps_gating() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let mgr = manager();
        let mut config = instance_config("locked-out", "m", 1);
        config.provider =
            ProviderConfig::new(ProviderKind::Custom, "").with_base_url(server.uri());
        mgr.load(vec![config]).unwrap();

        let instance = mgr.registry().get_instance("locked-out").unwrap();
        mgr.run_health_probes().await;
        mgr.run_health_probes().await;
        mgr.run_health_probes().await;

        assert!(!instance.is_healthy());
    }
}
