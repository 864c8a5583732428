//! # Failover Executor
//!
//! Drives a caller-supplied execute closure across instances and fallback
//! models until one attempt succeeds or the chain is exhausted. Two levels
//! of recovery hide upstream failures from callers:
//!
//! 1. **Instance retry** — up to `instance_retry_attempts` instances of the
//!    current model are tried; a failed instance is recorded against the
//!    health tracker and removed from this request's candidate set, so the
//!    same instance is never tried twice within one request.
//! 2. **Model fallback** — when a model's instances are exhausted, the
//!    fallback map names the next model; each model is visited at most once
//!    and the total failover trace is capped.
//!
//! The executor is model-name-agnostic: handlers build the upstream request
//! inside the closure using `instance.provider_model`. Attempts are
//! strictly sequential; a new instance is chosen only after the previous
//! call returned. Caller cancellation is the usual Rust contract — dropping
//! the returned future aborts the in-flight attempt, starts nothing new,
//! and records nothing for the aborted attempt.
//!
//! Requests addressed to a route slug run the route loop instead: member
//! models with healthy instances become candidate proxies, the route's
//! strategy (with its private smooth-WRR counter) picks one, and exhausted
//! members leave the working set. When the set empties, the route's
//! fallback models are tried through the normal executor path.

use crate::error::{DispatchError, ProviderError};
use crate::health::HealthTracker;
use crate::registry::{Instance, ModelRegistry};
use crate::route::{route_model_candidate, Route, RouteRegistry};
use crate::strategy::{self, Candidate, RouteStrategy};
use crate::latency::LatencyTracker;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Hard cap on failover trace entries for one request.
pub const MAX_FAILOVER_ENTRIES: usize = 10;

pub const DEFAULT_INSTANCE_RETRIES: u32 = 2;
pub const DEFAULT_TIMEOUT_MULTIPLE: f64 = 1.5;

/// Failover behavior knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    #[serde(default = "default_true")]
    pub enable_failover: bool,
    #[serde(default = "default_true")]
    pub enable_model_fallback: bool,
    #[serde(default = "default_retries")]
    pub instance_retry_attempts: u32,
    #[serde(default = "default_multiple")]
    pub failover_timeout_multiple: f64,
    /// model name → next model name, resolved lazily as a chain
    #[serde(default)]
    pub fallback_map: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_retries() -> u32 {
    DEFAULT_INSTANCE_RETRIES
}

fn default_multiple() -> f64 {
    DEFAULT_TIMEOUT_MULTIPLE
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enable_failover: true,
            enable_model_fallback: true,
            instance_retry_attempts: DEFAULT_INSTANCE_RETRIES,
            failover_timeout_multiple: DEFAULT_TIMEOUT_MULTIPLE,
            fallback_map: HashMap::new(),
        }
    }
}

pub type ExecuteFn<T> =
    Arc<dyn Fn(Arc<Instance>) -> BoxFuture<'static, Result<T, ProviderError>> + Send + Sync>;
pub type ValidateFn<T> = Arc<dyn Fn(&T) -> Result<(), String> + Send + Sync>;

/// One dispatch request: the target model name plus the closure that
/// performs the upstream call for a chosen instance.
pub struct FailoverRequest<T> {
    pub model: String,
    pub execute: ExecuteFn<T>,
    pub validate: Option<ValidateFn<T>>,
    pub streaming: bool,
}

impl<T> Clone for FailoverRequest<T> {
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone(),
            execute: Arc::clone(&self.execute),
            validate: self.validate.as_ref().map(Arc::clone),
            streaming: self.streaming,
        }
    }
}

impl<T: Send + 'static> FailoverRequest<T> {
    pub fn new<F, Fut>(model: impl Into<String>, execute: F) -> Self
    where
        F: Fn(Arc<Instance>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T, ProviderError>> + Send + 'static,
    {
        Self {
            model: model.into(),
            execute: Arc::new(move |instance| Box::pin(execute(instance))),
            validate: None,
            streaming: false,
        }
    }

    /// Rejections from the validator are treated like transport failures.
    pub fn with_validator<V>(mut self, validate: V) -> Self
    where
        V: Fn(&T) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(validate));
        self
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    fn for_model(&self, model: &str) -> Self {
        let mut clone = self.clone();
        clone.model = model.to_string();
        clone
    }
}

/// Outcome of a successful dispatch.
#[derive(Debug)]
pub struct FailoverResult<T> {
    /// The instance that produced the response
    pub instance: Arc<Instance>,
    pub response: T,
    /// Number of execute invocations across the whole request
    pub attempts: u32,
    /// Ordered `instance:<id>(err)` / `model:<name>(...)` entries
    pub failover_trace: Vec<String>,
    /// Latency of the winning attempt
    pub latency: Duration,
}

/// The executor. Holds shared references to the tables it selects from and
/// the trackers it records into; per-request state lives on the stack.
pub struct FailoverExecutor {
    registry: Arc<ModelRegistry>,
    routes: Arc<RouteRegistry>,
    health: Arc<HealthTracker>,
    strategy: Arc<dyn RouteStrategy>,
    latency: Option<Arc<LatencyTracker>>,
    config: FailoverConfig,
}

impl FailoverExecutor {
    pub fn new(
        registry: Arc<ModelRegistry>,
        routes: Arc<RouteRegistry>,
        health: Arc<HealthTracker>,
        strategy: Arc<dyn RouteStrategy>,
        latency: Option<Arc<LatencyTracker>>,
        config: FailoverConfig,
    ) -> Self {
        Self {
            registry,
            routes,
            health,
            strategy,
            latency,
            config,
        }
    }

    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    /// The configured selection strategy; shared with one-shot selection so
    /// round-robin counters advance consistently.
    pub fn strategy(&self) -> &Arc<dyn RouteStrategy> {
        &self.strategy
    }

    /// Dispatch a request, masking instance failures and walking the
    /// fallback chain. Returns the first success or a terminal error
    /// carrying the full failover trace.
    pub async fn execute_with_failover<T: Send + 'static>(
        &self,
        request: FailoverRequest<T>,
    ) -> Result<FailoverResult<T>, DispatchError> {
        // A route slug shadows a model of the same name.
        if let Some(route) = self.routes.resolve(&request.model) {
            return self.execute_route(route, request).await;
        }

        if self.registry.get_model_instances(&request.model).is_empty()
            && !self.config.fallback_map.contains_key(&request.model)
        {
            return Err(DispatchError::NotFound {
                model: request.model.clone(),
            });
        }

        if !self.config.enable_failover {
            return self.execute_single(request).await;
        }

        let mut trace = Vec::new();
        let mut attempts = 0u32;
        let mut visited = HashSet::new();
        let mut current = request.model.clone();

        loop {
            visited.insert(current.clone());

            if let Some(success) = self
                .try_model_instances(&current, &request, &mut trace, &mut attempts)
                .await?
            {
                return Ok(finish(success, attempts, trace));
            }

            push_trace(&mut trace, format!("model:{current}(all instances failed)"))?;

            if !self.config.enable_model_fallback {
                return Err(DispatchError::unavailable(
                    format!("all instances failed for model: {current}"),
                    trace,
                ));
            }

            match self.config.fallback_map.get(&current) {
                Some(next) if !visited.contains(next) => {
                    tracing::debug!(from = %current, to = %next, "falling back to next model");
                    current = next.clone();
                }
                Some(next) => {
                    return Err(DispatchError::unavailable(
                        format!("fallback loop detected at model: {next}"),
                        trace,
                    ));
                }
                None => {
                    return Err(DispatchError::unavailable(
                        format!("all instances and fallbacks failed for model: {}", request.model),
                        trace,
                    ));
                }
            }
        }
    }

    /// Failover disabled: one selection, one attempt, direct outcome.
    async fn execute_single<T: Send + 'static>(
        &self,
        request: FailoverRequest<T>,
    ) -> Result<FailoverResult<T>, DispatchError> {
        let healthy = self.registry.get_healthy_instances(&request.model);
        if healthy.is_empty() {
            return Err(DispatchError::unavailable(
                format!("no healthy instances for model: {}", request.model),
                Vec::new(),
            ));
        }

        let candidates: Vec<Candidate> = healthy.iter().map(|i| Candidate::from_instance(i)).collect();
        let index = self.strategy.select(&candidates).await?;
        let instance = Arc::clone(&healthy[index]);

        let started = Instant::now();
        match self.attempt(&instance, &request).await {
            Ok(response) => {
                self.health.record_success(&instance);
                Ok(FailoverResult {
                    instance,
                    response,
                    attempts: 1,
                    failover_trace: Vec::new(),
                    latency: started.elapsed(),
                })
            }
            Err(e) => {
                self.health.record_failure(&instance, &e.to_string());
                Err(match e {
                    ProviderError::Timeout => DispatchError::DeadlineExceeded,
                    other => DispatchError::Upstream(other),
                })
            }
        }
    }

    /// Try up to `instance_retry_attempts` instances of one model. A failed
    /// instance is dropped from the working list so retries cover new
    /// ground. `Ok(None)` means the model is exhausted.
    async fn try_model_instances<T: Send + 'static>(
        &self,
        model: &str,
        request: &FailoverRequest<T>,
        trace: &mut Vec<String>,
        attempts: &mut u32,
    ) -> Result<Option<Success<T>>, DispatchError> {
        let mut healthy = self.registry.get_healthy_instances(model);
        let retries = self.config.instance_retry_attempts.max(1);

        for _ in 0..retries {
            if healthy.is_empty() {
                break;
            }
            let candidates: Vec<Candidate> =
                healthy.iter().map(|i| Candidate::from_instance(i)).collect();
            let index = self.strategy.select(&candidates).await?;
            let instance = healthy.remove(index);
            *attempts += 1;

            let started = Instant::now();
            match self.attempt(&instance, request).await {
                Ok(response) => {
                    self.health.record_success(&instance);
                    return Ok(Some(Success {
                        instance,
                        response,
                        latency: started.elapsed(),
                    }));
                }
                Err(e) => {
                    let message = e.to_string();
                    self.health.record_failure(&instance, &message);
                    tracing::debug!(
                        instance = instance.id(),
                        model,
                        error = %message,
                        "attempt failed, dropping instance for this request"
                    );
                    push_trace(trace, format!("instance:{}({message})", instance.id()))?;
                }
            }
        }

        Ok(None)
    }

    /// One bounded attempt against one instance; validator rejections count
    /// as failures.
    async fn attempt<T: Send + 'static>(
        &self,
        instance: &Arc<Instance>,
        request: &FailoverRequest<T>,
    ) -> Result<T, ProviderError> {
        let budget = instance
            .config
            .timeout
            .mul_f64(self.config.failover_timeout_multiple.max(0.1));

        let response =
            match tokio::time::timeout(budget, (request.execute)(Arc::clone(instance))).await {
                Ok(result) => result?,
                Err(_) => return Err(ProviderError::Timeout),
            };

        if let Some(validate) = &request.validate {
            if let Err(reason) = validate(&response) {
                return Err(ProviderError::Api {
                    status: 502,
                    message: format!("response rejected: {reason}"),
                });
            }
        }
        Ok(response)
    }

    /// Route loop: select among member models, exhaust, then walk the
    /// route's fallbacks through the normal executor path.
    async fn execute_route<T: Send + 'static>(
        &self,
        route: Arc<Route>,
        request: FailoverRequest<T>,
    ) -> Result<FailoverResult<T>, DispatchError> {
        let mut working = route.enabled_models();
        let mut trace = Vec::new();
        let mut attempts = 0u32;

        while !working.is_empty() {
            let available: Vec<(usize, Candidate)> = working
                .iter()
                .enumerate()
                .filter_map(|(i, m)| route_model_candidate(m, &self.registry).map(|c| (i, c)))
                .collect();
            if available.is_empty() {
                break;
            }
            let candidates: Vec<Candidate> =
                available.iter().map(|(_, c)| c.clone()).collect();

            let picked = if route.strategy == strategy::WEIGHTED_ROUND_ROBIN {
                let weights: Vec<f64> = candidates.iter().map(|c| c.weight).collect();
                strategy::smooth_weighted_pick(route.next_turn(), &weights)
            } else {
                let route_strategy =
                    strategy::from_name_or_default(&route.strategy, self.latency.clone());
                route_strategy.select(&candidates).await?
            };

            let (working_index, candidate) = &available[picked];
            let model_name = candidate.model.clone();

            if let Some(success) = self
                .try_model_instances(&model_name, &request, &mut trace, &mut attempts)
                .await?
            {
                return Ok(finish(success, attempts, trace));
            }

            push_trace(&mut trace, format!("model:{model_name}(all instances failed)"))?;
            working.remove(*working_index);
        }

        for fallback in &route.fallback_models {
            if fallback == &route.slug {
                continue;
            }
            let fallback_request = request.for_model(fallback);
            match Box::pin(self.execute_with_failover(fallback_request)).await {
                Ok(mut result) => {
                    result.attempts += attempts;
                    let mut merged = trace;
                    merged.extend(result.failover_trace);
                    result.failover_trace = merged;
                    return Ok(result);
                }
                Err(e) => {
                    tracing::debug!(route = %route.slug, fallback = %fallback, error = %e, "route fallback failed");
                }
            }
        }

        Err(DispatchError::unavailable(
            format!("route exhausted: {}", route.slug),
            trace,
        ))
    }
}

struct Success<T> {
    instance: Arc<Instance>,
    response: T,
    latency: Duration,
}

fn finish<T>(success: Success<T>, attempts: u32, trace: Vec<String>) -> FailoverResult<T> {
    FailoverResult {
        instance: success.instance,
        response: success.response,
        attempts,
        failover_trace: trace,
        latency: success.latency,
    }
}

fn push_trace(trace: &mut Vec<String>, entry: String) -> Result<(), DispatchError> {
    if trace.len() >= MAX_FAILOVER_ENTRIES {
        return Err(DispatchError::unavailable(
            "too many failover attempts",
            std::mem::take(trace),
        ));
    }
    trace.push(entry);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsCollector;
    use crate::registry::test_support::instance_config;
    use crate::route::{RouteConfig, RouteModel};
    use crate::strategy::PriorityStrategy;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Fixture {
        registry: Arc<ModelRegistry>,
        routes: Arc<RouteRegistry>,
        health: Arc<HealthTracker>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: Arc::new(ModelRegistry::new()),
                routes: Arc::new(RouteRegistry::new()),
                health: Arc::new(HealthTracker::new()),
            }
        }

        fn executor(&self, config: FailoverConfig) -> FailoverExecutor {
            FailoverExecutor::new(
                Arc::clone(&self.registry),
                Arc::clone(&self.routes),
                Arc::clone(&self.health),
                Arc::new(PriorityStrategy),
                None,
                config,
            )
        }
    }

    /// Closure that fails for the listed instance ids and succeeds elsewhere.
    fn scripted(failing: &[&str]) -> impl Fn(Arc<Instance>) -> futures::future::Ready<Result<String, ProviderError>> + Send + Sync + 'static
    {
        let failing: Vec<String> = failing.iter().map(|s| s.to_string()).collect();
        move |instance: Arc<Instance>| {
            if failing.contains(&instance.id().to_string()) {
                futures::future::ready(Err(ProviderError::Unavailable {
                    message: "connection refused".to_string(),
                }))
            } else {
                futures::future::ready(Ok("Success!".to_string()))
            }
        }
    }

    #[tokio::test]
    async fn transparent_instance_failover() {
        let fixture = Fixture::new();
        fixture.registry.add_instance(instance_config("i1", "m", 100)).unwrap();
        fixture.registry.add_instance(instance_config("i2", "m", 90)).unwrap();
        fixture.registry.add_instance(instance_config("i3", "m", 80)).unwrap();

        let executor = fixture.executor(FailoverConfig {
            instance_retry_attempts: 3,
            ..Default::default()
        });

        let result = executor
            .execute_with_failover(FailoverRequest::new("m", scripted(&["i1", "i2"])))
            .await
            .unwrap();

        assert_eq!(result.instance.id(), "i3");
        assert_eq!(result.response, "Success!");
        assert_eq!(result.attempts, 3);
        let instance_entries = result
            .failover_trace
            .iter()
            .filter(|e| e.starts_with("instance:"))
            .count();
        assert_eq!(instance_entries, 2);
    }

    #[tokio::test]
    async fn model_fallback_masks_total_instance_failure() {
        let fixture = Fixture::new();
        fixture.registry.add_instance(instance_config("p1", "primary", 10)).unwrap();
        fixture.registry.add_instance(instance_config("p2", "primary", 5)).unwrap();
        fixture.registry.add_instance(instance_config("f1", "fallback-model", 1)).unwrap();

        let executor = fixture.executor(FailoverConfig {
            fallback_map: HashMap::from([(
                "primary".to_string(),
                "fallback-model".to_string(),
            )]),
            ..Default::default()
        });

        let result = executor
            .execute_with_failover(FailoverRequest::new("primary", scripted(&["p1", "p2"])))
            .await
            .unwrap();

        assert_eq!(result.instance.id(), "f1");
        assert!(result
            .failover_trace
            .contains(&"model:primary(all instances failed)".to_string()));
    }

    #[tokio::test]
    async fn disabled_failover_returns_the_error_without_retries() {
        let fixture = Fixture::new();
        fixture.registry.add_instance(instance_config("only", "m", 1)).unwrap();

        let executor = fixture.executor(FailoverConfig {
            enable_failover: false,
            ..Default::default()
        });

        let err = executor
            .execute_with_failover(FailoverRequest::new("m", scripted(&["only"])))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Upstream(_)));
        let instance = fixture.registry.get_instance("only").unwrap();
        assert_eq!(instance.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn unknown_model_is_not_found() {
        let fixture = Fixture::new();
        let executor = fixture.executor(FailoverConfig::default());
        let err = executor
            .execute_with_failover(FailoverRequest::new("ghost", scripted(&[])))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotFound { .. }));
    }

    #[tokio::test]
    async fn route_smooth_wrr_splits_seventy_thirty() {
        let fixture = Fixture::new();
        fixture.registry.add_instance(instance_config("a1", "model-a", 1)).unwrap();
        fixture.registry.add_instance(instance_config("b1", "model-b", 1)).unwrap();
        fixture
            .routes
            .register(
                RouteConfig {
                    slug: "mix".to_string(),
                    strategy: strategy::WEIGHTED_ROUND_ROBIN.to_string(),
                    models: vec![
                        RouteModel {
                            name: "model-a".to_string(),
                            weight: 70.0,
                            priority: 0,
                            enabled: true,
                        },
                        RouteModel {
                            name: "model-b".to_string(),
                            weight: 30.0,
                            priority: 0,
                            enabled: true,
                        },
                    ],
                    fallback_models: Vec::new(),
                    enabled: true,
                },
                &fixture.registry,
            )
            .unwrap();

        let executor = fixture.executor(FailoverConfig::default());

        let mut picks = Vec::new();
        for _ in 0..10 {
            let result = executor
                .execute_with_failover(FailoverRequest::new("mix", scripted(&[])))
                .await
                .unwrap();
            picks.push(result.instance.model().to_string());
        }

        let a_count = picks.iter().filter(|m| *m == "model-a").count();
        assert_eq!(a_count, 7, "picks: {picks:?}");
        // Interleaved, not batched.
        assert_ne!(
            picks,
            vec!["model-a"; 7]
                .into_iter()
                .chain(vec!["model-b"; 3])
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn route_falls_back_after_member_exhaustion() {
        let fixture = Fixture::new();
        fixture.registry.add_instance(instance_config("a1", "member", 1)).unwrap();
        fixture.registry.add_instance(instance_config("r1", "rescue", 1)).unwrap();
        fixture
            .routes
            .register(
                RouteConfig {
                    slug: "guarded".to_string(),
                    strategy: strategy::PRIORITY.to_string(),
                    models: vec![RouteModel {
                        name: "member".to_string(),
                        weight: 1.0,
                        priority: 0,
                        enabled: true,
                    }],
                    fallback_models: vec!["rescue".to_string()],
                    enabled: true,
                },
                &fixture.registry,
            )
            .unwrap();

        let executor = fixture.executor(FailoverConfig::default());
        let result = executor
            .execute_with_failover(FailoverRequest::new("guarded", scripted(&["a1"])))
            .await
            .unwrap();

        assert_eq!(result.instance.id(), "r1");
        assert!(result
            .failover_trace
            .iter()
            .any(|e| e.starts_with("model:member")));
    }

    #[tokio::test]
    async fn no_instance_is_tried_twice_in_one_request() {
        let fixture = Fixture::new();
        for (id, priority) in [("x1", 30), ("x2", 20), ("x3", 10)] {
            fixture.registry.add_instance(instance_config(id, "m", priority)).unwrap();
        }

        let calls = Arc::new(dashmap::DashMap::<String, AtomicU32>::new());
        let calls_ref = Arc::clone(&calls);
        let request = FailoverRequest::new("m", move |instance: Arc<Instance>| {
            calls_ref
                .entry(instance.id().to_string())
                .or_default()
                .fetch_add(1, Ordering::Relaxed);
            futures::future::ready(Err::<String, _>(ProviderError::Unavailable {
                message: "down".to_string(),
            }))
        });

        let executor = fixture.executor(FailoverConfig {
            instance_retry_attempts: 5,
            enable_model_fallback: false,
            ..Default::default()
        });
        let err = executor.execute_with_failover(request).await.unwrap_err();
        assert!(matches!(err, DispatchError::Unavailable { .. }));

        for entry in calls.iter() {
            assert_eq!(entry.value().load(Ordering::Relaxed), 1, "instance {} retried", entry.key());
        }
        assert_eq!(calls.len(), 3);
    }

    #[tokio::test]
    async fn trace_is_capped_under_adversarial_chains() {
        let fixture = Fixture::new();
        let mut fallback_map = HashMap::new();
        for hop in 0..8 {
            let model = format!("chain-{hop}");
            fixture
                .registry
                .add_instance(instance_config(&format!("c{hop}-1", ), &model, 2))
                .unwrap();
            fixture
                .registry
                .add_instance(instance_config(&format!("c{hop}-2"), &model, 1))
                .unwrap();
            fallback_map.insert(model, format!("chain-{}", hop + 1));
        }

        let executor = fixture.executor(FailoverConfig {
            fallback_map,
            instance_retry_attempts: 2,
            ..Default::default()
        });

        let request = FailoverRequest::new("chain-0", |_: Arc<Instance>| {
            futures::future::ready(Err::<String, _>(ProviderError::Unavailable {
                message: "down".to_string(),
            }))
        });

        let err = executor.execute_with_failover(request).await.unwrap_err();
        match err {
            DispatchError::Unavailable { message, trace } => {
                assert!(message.contains("too many failover attempts"));
                assert!(trace.len() <= MAX_FAILOVER_ENTRIES);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn fallback_loops_terminate() {
        let fixture = Fixture::new();
        fixture.registry.add_instance(instance_config("a1", "a", 1)).unwrap();
        fixture.registry.add_instance(instance_config("b1", "b", 1)).unwrap();

        let executor = fixture.executor(FailoverConfig {
            fallback_map: HashMap::from([
                ("a".to_string(), "b".to_string()),
                ("b".to_string(), "a".to_string()),
            ]),
            ..Default::default()
        });

        let err = executor
            .execute_with_failover(FailoverRequest::new("a", scripted(&["a1", "b1"])))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn validator_rejection_is_treated_like_failure() {
        let fixture = Fixture::new();
        fixture.registry.add_instance(instance_config("good", "m", 10)).unwrap();
        fixture.registry.add_instance(instance_config("empty", "m", 20)).unwrap();

        // Higher-priority instance answers with an empty payload; the
        // validator pushes the request to the next one.
        let request = FailoverRequest::new("m", |instance: Arc<Instance>| {
            let body = if instance.id() == "empty" { "" } else { "ok" };
            futures::future::ready(Ok::<_, ProviderError>(body.to_string()))
        })
        .with_validator(|body: &String| {
            if body.is_empty() {
                Err("empty response".to_string())
            } else {
                Ok(())
            }
        });

        let executor = fixture.executor(FailoverConfig::default());
        let result = executor.execute_with_failover(request).await.unwrap();
        assert_eq!(result.instance.id(), "good");
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test]
    async fn dropping_the_future_cancels_without_recording_failure() {
        let fixture = Fixture::new();
        fixture.registry.add_instance(instance_config("slow", "m", 1)).unwrap();

        let executor = fixture.executor(FailoverConfig::default());
        let request = FailoverRequest::new("m", |_: Arc<Instance>| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, ProviderError>("late".to_string())
        });

        let started = Instant::now();
        let outcome =
            tokio::time::timeout(Duration::from_millis(100), executor.execute_with_failover(request))
                .await;
        assert!(outcome.is_err(), "caller timeout should fire first");
        assert!(started.elapsed() < Duration::from_secs(1));

        // The aborted attempt records nothing: no upstream failure charged.
        let instance = fixture.registry.get_instance("slow").unwrap();
        assert_eq!(instance.consecutive_failures(), 0);
        assert!(instance.is_healthy());
    }

    #[tokio::test]
    async fn per_attempt_timeout_is_instance_timeout_times_multiple() {
        let fixture = Fixture::new();
        let mut config = instance_config("slow", "m", 1);
        config.timeout = Duration::from_millis(40);
        fixture.registry.add_instance(config).unwrap();

        let executor = fixture.executor(FailoverConfig {
            failover_timeout_multiple: 1.5,
            enable_model_fallback: false,
            ..Default::default()
        });

        let request = FailoverRequest::new("m", |_: Arc<Instance>| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, ProviderError>("late".to_string())
        });

        let started = Instant::now();
        let err = executor.execute_with_failover(request).await.unwrap_err();
        // 40ms * 1.5 = 60ms budget, one retry pass; well under a second.
        assert!(started.elapsed() < Duration::from_secs(1));
        match err {
            DispatchError::Unavailable { trace, .. } => {
                assert!(trace.iter().any(|e| e.contains("timed out")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn metrics_are_not_written_by_the_executor() {
        // Guards the split: the executor records health, the manager records
        // metrics. A successful dispatch leaves request counters untouched.
        let fixture = Fixture::new();
        fixture.registry.add_instance(instance_config("i1", "m", 1)).unwrap();
        let executor = fixture.executor(FailoverConfig::default());

        executor
            .execute_with_failover(FailoverRequest::new("m", scripted(&[])))
            .await
            .unwrap();

        let instance = fixture.registry.get_instance("i1").unwrap();
        let snapshot = MetricsCollector::new().snapshot(&instance);
        assert_eq!(snapshot.total_requests, 0);
    }
}
