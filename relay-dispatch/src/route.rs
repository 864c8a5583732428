//! # Route Registry
//!
//! Named model groups addressed by slug. A route carries its own strategy
//! name, an ordered list of member models with weights and priorities, a
//! fallback model list, and its own smooth-WRR counter — separate from any
//! model-level counter.
//!
//! Routes reference models by name, never by pointer into the model
//! registry; members are materialized as candidate proxies at selection
//! time, with latency populated from the aggregated metrics of the real
//! instances behind each model.

use crate::error::DispatchError;
use crate::registry::ModelRegistry;
use crate::strategy::Candidate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// One member model of a route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteModel {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_weight() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

/// Route definition as configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub slug: String,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    pub models: Vec<RouteModel>,
    #[serde(default)]
    pub fallback_models: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_strategy() -> String {
    crate::strategy::PRIORITY.to_string()
}

/// A registered route with its private round-robin counter.
#[derive(Debug)]
pub struct Route {
    pub slug: String,
    pub strategy: String,
    pub models: Vec<RouteModel>,
    pub fallback_models: Vec<String>,
    pub enabled: bool,
    counter: AtomicU64,
}

impl Route {
    pub fn new(config: RouteConfig) -> Self {
        Self {
            slug: config.slug,
            strategy: config.strategy,
            models: config.models,
            fallback_models: config.fallback_models,
            enabled: config.enabled,
            counter: AtomicU64::new(0),
        }
    }

    /// Advance and return the smooth-WRR counter (first turn is 1).
    pub fn next_turn(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn enabled_models(&self) -> Vec<RouteModel> {
        self.models.iter().filter(|m| m.enabled).cloned().collect()
    }
}

/// Build the candidate proxy for one route member, or `None` when the model
/// currently has no healthy instance. The proxy's latency is the mean EMA
/// of the healthy instances behind the model.
pub fn route_model_candidate(model: &RouteModel, registry: &ModelRegistry) -> Option<Candidate> {
    let healthy = registry.get_healthy_instances(&model.name);
    if healthy.is_empty() {
        return None;
    }
    let ema = healthy.iter().map(|i| i.ema_latency_ms()).sum::<f64>() / healthy.len() as f64;
    Some(Candidate {
        id: model.name.clone(),
        model: model.name.clone(),
        priority: model.priority,
        weight: model.weight,
        ema_latency_ms: ema,
    })
}

/// Slug-addressed route table.
#[derive(Default)]
pub struct RouteRegistry {
    routes: RwLock<HashMap<String, Arc<Route>>>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route. A slug conflicts only when it matches an existing
    /// non-route model; re-registering a slug replaces the previous route.
    pub fn register(
        &self,
        config: RouteConfig,
        models: &ModelRegistry,
    ) -> Result<(), DispatchError> {
        if !models.get_model_instances(&config.slug).is_empty() {
            return Err(DispatchError::invalid(format!(
                "route slug collides with registered model: {}",
                config.slug
            )));
        }
        if config.models.is_empty() {
            return Err(DispatchError::invalid(format!(
                "route has no member models: {}",
                config.slug
            )));
        }

        let slug = config.slug.clone();
        let route = Arc::new(Route::new(config));
        self.routes
            .write()
            .expect("route table lock poisoned")
            .insert(slug.clone(), route);
        tracing::debug!(slug = %slug, "registered route");
        Ok(())
    }

    pub fn unregister(&self, slug: &str) -> Result<(), DispatchError> {
        self.routes
            .write()
            .expect("route table lock poisoned")
            .remove(slug)
            .map(|_| ())
            .ok_or_else(|| DispatchError::NotFound {
                model: slug.to_string(),
            })
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<Route>> {
        self.routes
            .read()
            .expect("route table lock poisoned")
            .get(name)
            .filter(|r| r.enabled)
            .cloned()
    }

    pub fn get_all(&self) -> Vec<Arc<Route>> {
        self.routes
            .read()
            .expect("route table lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn slugs(&self) -> Vec<String> {
        let mut slugs: Vec<String> = self
            .routes
            .read()
            .expect("route table lock poisoned")
            .keys()
            .cloned()
            .collect();
        slugs.sort();
        slugs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support::instance_config;

    fn route_config(slug: &str, members: &[(&str, f64)]) -> RouteConfig {
        RouteConfig {
            slug: slug.to_string(),
            strategy: crate::strategy::WEIGHTED_ROUND_ROBIN.to_string(),
            models: members
                .iter()
                .map(|(name, weight)| RouteModel {
                    name: name.to_string(),
                    weight: *weight,
                    priority: 0,
                    enabled: true,
                })
                .collect(),
            fallback_models: Vec::new(),
            enabled: true,
        }
    }

    #[test]
    fn slug_colliding_with_model_is_rejected() {
        let models = ModelRegistry::new();
        models.add_instance(instance_config("i1", "gpt-4o", 1)).unwrap();

        let routes = RouteRegistry::new();
        let err = routes
            .register(route_config("gpt-4o", &[("a", 1.0)]), &models)
            .unwrap_err();
        assert!(matches!(err, DispatchError::Invalid { .. }));
    }

    #[test]
    fn register_resolve_unregister() {
        let models = ModelRegistry::new();
        let routes = RouteRegistry::new();

        routes
            .register(route_config("mix", &[("a", 70.0), ("b", 30.0)]), &models)
            .unwrap();
        let route = routes.resolve("mix").unwrap();
        assert_eq!(route.models.len(), 2);
        assert_eq!(route.next_turn(), 1);
        assert_eq!(route.next_turn(), 2);

        routes.unregister("mix").unwrap();
        assert!(routes.resolve("mix").is_none());
        assert!(routes.unregister("mix").is_err());
    }

    #[test]
    fn disabled_routes_do_not_resolve() {
        let models = ModelRegistry::new();
        let routes = RouteRegistry::new();
        let mut config = route_config("dark", &[("a", 1.0)]);
        config.enabled = false;
        routes.register(config, &models).unwrap();
        assert!(routes.resolve("dark").is_none());
    }

    #[test]
    fn proxy_requires_a_healthy_instance() {
        let models = ModelRegistry::new();
        let member = RouteModel {
            name: "alpha".to_string(),
            weight: 2.0,
            priority: 5,
            enabled: true,
        };
        assert!(route_model_candidate(&member, &models).is_none());

        models.add_instance(instance_config("a1", "alpha", 1)).unwrap();
        let candidate = route_model_candidate(&member, &models).unwrap();
        assert_eq!(candidate.id, "alpha");
        assert_eq!(candidate.weight, 2.0);
        assert_eq!(candidate.priority, 5);
    }
}
