//! # Model Registry
//!
//! Owns the three tables the dispatch core selects from:
//!
//! - instance id → [`Instance`]
//! - logical model name → bucket of instances, sorted by descending
//!   priority (ties keep registration order)
//! - provider cache key → shared adapter
//!
//! All tables sit behind one read-write lock; reads dominate and run
//! concurrently. Per-instance mutable state (health flag, counters, EMA
//! latency) lives in lock-free atomics on the instance itself, so recording
//! outcomes never touches the registry lock.
//!
//! Every list the registry hands out is a copy; callers never see internal
//! slices.

use crate::error::DispatchError;
use crate::providers::{create_provider, Provider, ProviderConfig, ProviderKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::common::duration_serde;

/// Where an instance definition came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstanceSource {
    #[default]
    System,
    User,
}

/// Configuration for a single upstream endpoint serving one logical model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Unique instance identifier
    pub id: String,
    /// Logical, caller-visible model name
    pub model: String,
    /// Upstream endpoint this instance dispatches to
    pub provider: ProviderConfig,
    /// Model identifier the upstream expects
    pub provider_model: String,
    #[serde(default)]
    pub source: InstanceSource,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Higher is preferred
    #[serde(default)]
    pub priority: i32,
    /// Route-level weight; the instance-level selector does not consult it
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Per-request budget before the failover multiplier is applied
    #[serde(with = "duration_serde", default = "default_instance_timeout")]
    pub timeout: Duration,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Requests-per-minute cap, consulted by the rate-limit query only
    #[serde(default)]
    pub requests_per_minute: Option<u64>,
    /// Tokens-per-minute cap, consulted by the rate-limit query only
    #[serde(default)]
    pub tokens_per_minute: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

fn default_weight() -> f64 {
    1.0
}

fn default_instance_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Lock-free mutable state attached to each instance.
///
/// The healthy flag and failure counter change only through the health
/// tracker; the metric counters only through the metrics collector.
#[derive(Debug)]
pub struct InstanceState {
    pub(crate) healthy: AtomicBool,
    pub(crate) consecutive_failures: AtomicU32,
    pub(crate) last_error: RwLock<Option<String>>,
    pub(crate) last_success_ms: AtomicI64,
    /// f64 bit pattern; EMA of request latency in milliseconds
    pub(crate) ema_latency_bits: AtomicU64,
    pub(crate) total_requests: AtomicU64,
    pub(crate) total_tokens: AtomicU64,
    pub(crate) minute_requests: AtomicU64,
    pub(crate) minute_tokens: AtomicU64,
    pub(crate) minute_start_ms: AtomicI64,
}

impl Default for InstanceState {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            last_error: RwLock::new(None),
            last_success_ms: AtomicI64::new(0),
            ema_latency_bits: AtomicU64::new(0f64.to_bits()),
            total_requests: AtomicU64::new(0),
            total_tokens: AtomicU64::new(0),
            minute_requests: AtomicU64::new(0),
            minute_tokens: AtomicU64::new(0),
            minute_start_ms: AtomicI64::new(0),
        }
    }
}

/// One configured upstream endpoint plus its shared adapter and runtime
/// state. Cheap to clone behind `Arc`; the failover executor receives these
/// fresh from the registry on every attempt.
pub struct Instance {
    pub config: InstanceConfig,
    pub provider: Arc<dyn Provider>,
    pub state: InstanceState,
}

impl Instance {
    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn provider_model(&self) -> &str {
        &self.config.provider_model
    }

    pub fn priority(&self) -> i32 {
        self.config.priority
    }

    pub fn weight(&self) -> f64 {
        self.config.weight
    }

    pub fn is_healthy(&self) -> bool {
        self.state.healthy.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn ema_latency_ms(&self) -> f64 {
        f64::from_bits(self.state.ema_latency_bits.load(Ordering::Acquire))
    }

    pub fn total_requests(&self) -> u64 {
        self.state.total_requests.load(Ordering::Relaxed)
    }

    pub fn total_tokens(&self) -> u64 {
        self.state.total_tokens.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.last_error.read().ok().and_then(|g| g.clone())
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.config.id)
            .field("model", &self.config.model)
            .field("priority", &self.config.priority)
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

#[derive(Default)]
struct RegistryInner {
    instances: HashMap<String, Arc<Instance>>,
    buckets: HashMap<String, Vec<Arc<Instance>>>,
    providers: HashMap<ProviderKey, Arc<dyn Provider>>,
}

/// Registry of instances, model buckets, and shared provider adapters.
#[derive(Default)]
pub struct ModelRegistry {
    inner: RwLock<RegistryInner>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the registry contents with the given configuration entries.
    ///
    /// Provider adapters already cached from a previous load are reused
    /// when the cache key matches.
    pub fn load(&self, configs: Vec<InstanceConfig>) -> Result<(), DispatchError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let providers = std::mem::take(&mut inner.providers);
        *inner = RegistryInner {
            providers,
            ..Default::default()
        };

        for config in configs {
            Self::insert_locked(&mut inner, config)?;
        }
        Ok(())
    }

    /// Register one instance. Fails with `Conflict` when the id exists.
    pub fn add_instance(&self, config: InstanceConfig) -> Result<(), DispatchError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        Self::insert_locked(&mut inner, config)
    }

    fn insert_locked(inner: &mut RegistryInner, config: InstanceConfig) -> Result<(), DispatchError> {
        if inner.instances.contains_key(&config.id) {
            return Err(DispatchError::Conflict {
                message: format!("instance already exists: {}", config.id),
            });
        }

        let key = config.provider.cache_key();
        let provider: Arc<dyn Provider> = match inner.providers.get(&key) {
            Some(existing) => Arc::clone(existing),
            None => {
                let created = create_provider(&config.provider)?;
                inner.providers.insert(key, Arc::clone(&created));
                created
            }
        };

        let instance = Arc::new(Instance {
            config,
            provider,
            state: InstanceState::default(),
        });

        inner
            .instances
            .insert(instance.id().to_string(), Arc::clone(&instance));

        let bucket = inner
            .buckets
            .entry(instance.model().to_string())
            .or_default();
        bucket.push(Arc::clone(&instance));
        // Stable sort keeps registration order within equal priorities.
        bucket.sort_by(|a, b| b.priority().cmp(&a.priority()));

        tracing::debug!(
            instance = instance.id(),
            model = instance.model(),
            priority = instance.priority(),
            "registered instance"
        );
        Ok(())
    }

    /// Remove an instance; the model bucket is deleted with its last member.
    pub fn remove_instance(&self, id: &str) -> Result<(), DispatchError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let instance = inner
            .instances
            .remove(id)
            .ok_or_else(|| DispatchError::NotFound {
                model: id.to_string(),
            })?;

        let model = instance.model().to_string();
        if let Some(bucket) = inner.buckets.get_mut(&model) {
            bucket.retain(|i| i.id() != id);
            if bucket.is_empty() {
                inner.buckets.remove(&model);
            }
        }
        tracing::debug!(instance = id, model = %model, "removed instance");
        Ok(())
    }

    /// Replace an instance's configuration (remove-then-add).
    pub fn update_instance(&self, id: &str, config: InstanceConfig) -> Result<(), DispatchError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let existing = inner
            .instances
            .remove(id)
            .ok_or_else(|| DispatchError::NotFound {
                model: id.to_string(),
            })?;
        let model = existing.model().to_string();
        if let Some(bucket) = inner.buckets.get_mut(&model) {
            bucket.retain(|i| i.id() != id);
            if bucket.is_empty() {
                inner.buckets.remove(&model);
            }
        }
        Self::insert_locked(&mut inner, config)
    }

    pub fn get_instance(&self, id: &str) -> Option<Arc<Instance>> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .instances
            .get(id)
            .cloned()
    }

    /// All instances serving the model, sorted by descending priority.
    /// Returns a copy.
    pub fn get_model_instances(&self, model: &str) -> Vec<Arc<Instance>> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .buckets
            .get(model)
            .cloned()
            .unwrap_or_default()
    }

    /// Healthy, enabled instances for the model.
    pub fn get_healthy_instances(&self, model: &str) -> Vec<Arc<Instance>> {
        self.get_model_instances(model)
            .into_iter()
            .filter(|i| i.config.enabled && i.is_healthy())
            .collect()
    }

    pub fn get_available_models(&self) -> Vec<String> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let mut models: Vec<String> = inner.buckets.keys().cloned().collect();
        models.sort();
        models
    }

    pub fn get_all_instances(&self) -> Vec<Arc<Instance>> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .instances
            .values()
            .cloned()
            .collect()
    }
}
