//! # Routing Strategies
//!
//! A strategy picks one candidate from a healthy-filtered list supplied by
//! the caller. Strategies are pure with respect to the caller; any state
//! they keep (round-robin counters) is their own.
//!
//! - **priority** — `candidates[0]`; relies on the registry presenting
//!   buckets sorted by descending priority.
//! - **random** — uniform over the index range.
//! - **least-latency** — per-candidate shared-store lookup under a short
//!   budget, with the instance EMA as fallback; minimum wins.
//! - **weighted-round-robin** — at instance level a per-model counter mod
//!   candidate count (weights accepted but not honored at this level); at
//!   route level the nginx-style smooth interleave in
//!   [`smooth_weighted_pick`], driven by the route's own counter.
//!
//! Unknown names fail construction with `Invalid`; the configuration path
//! uses [`from_name_or_default`], which downgrades to priority with a
//! warning so a typo cannot take the gateway down. A missing latency store
//! likewise downgrades least-latency rather than failing selection.

use crate::error::DispatchError;
use crate::latency::LatencyTracker;
use crate::registry::Instance;
use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const PRIORITY: &str = "priority";
pub const RANDOM: &str = "random";
pub const LEAST_LATENCY: &str = "least-latency";
pub const WEIGHTED_ROUND_ROBIN: &str = "weighted-round-robin";

/// The candidate contract strategies select over. Built fresh per attempt
/// from registry instances, or from route-model proxies at route level.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Instance id, or the model name for route-level proxies
    pub id: String,
    /// Logical model name; keys the shared latency lookup and the
    /// instance-level round-robin counter
    pub model: String,
    pub priority: i32,
    pub weight: f64,
    /// In-memory EMA fallback for the least-latency path
    pub ema_latency_ms: f64,
}

impl Candidate {
    pub fn from_instance(instance: &Instance) -> Self {
        Self {
            id: instance.id().to_string(),
            model: instance.model().to_string(),
            priority: instance.priority(),
            weight: instance.weight(),
            ema_latency_ms: instance.ema_latency_ms(),
        }
    }
}

/// Contract for instance selection.
#[async_trait::async_trait]
pub trait RouteStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick one candidate index. Fails only on an empty list.
    async fn select(&self, candidates: &[Candidate]) -> Result<usize, DispatchError>;
}

fn ensure_non_empty(candidates: &[Candidate]) -> Result<(), DispatchError> {
    if candidates.is_empty() {
        Err(DispatchError::unavailable("no candidates available", Vec::new()))
    } else {
        Ok(())
    }
}

/// Always the highest-priority candidate.
#[derive(Debug, Default)]
pub struct PriorityStrategy;

#[async_trait::async_trait]
impl RouteStrategy for PriorityStrategy {
    fn name(&self) -> &'static str {
        PRIORITY
    }

    async fn select(&self, candidates: &[Candidate]) -> Result<usize, DispatchError> {
        ensure_non_empty(candidates)?;
        Ok(0)
    }
}

/// Uniform random selection.
#[derive(Debug, Default)]
pub struct RandomStrategy;

#[async_trait::async_trait]
impl RouteStrategy for RandomStrategy {
    fn name(&self) -> &'static str {
        RANDOM
    }

    async fn select(&self, candidates: &[Candidate]) -> Result<usize, DispatchError> {
        ensure_non_empty(candidates)?;
        Ok(rand::thread_rng().gen_range(0..candidates.len()))
    }
}

/// Per-model monotonic counter, selection is `counter mod n`.
///
/// Weights are accepted on the candidates but not honored at this level.
#[derive(Debug, Default)]
pub struct WeightedRoundRobinStrategy {
    counters: DashMap<String, AtomicU64>,
}

#[async_trait::async_trait]
impl RouteStrategy for WeightedRoundRobinStrategy {
    fn name(&self) -> &'static str {
        WEIGHTED_ROUND_ROBIN
    }

    async fn select(&self, candidates: &[Candidate]) -> Result<usize, DispatchError> {
        ensure_non_empty(candidates)?;
        let key = candidates[0].model.clone();
        let counter = self.counters.entry(key).or_default();
        let turn = counter.fetch_add(1, Ordering::Relaxed);
        Ok((turn % candidates.len() as u64) as usize)
    }
}

/// Minimum observed latency; shared samples first, instance EMA fallback.
pub struct LeastLatencyStrategy {
    tracker: Arc<LatencyTracker>,
}

impl LeastLatencyStrategy {
    pub fn new(tracker: Arc<LatencyTracker>) -> Self {
        Self { tracker }
    }
}

#[async_trait::async_trait]
impl RouteStrategy for LeastLatencyStrategy {
    fn name(&self) -> &'static str {
        LEAST_LATENCY
    }

    async fn select(&self, candidates: &[Candidate]) -> Result<usize, DispatchError> {
        ensure_non_empty(candidates)?;

        let mut best_index = 0;
        let mut best_latency = f64::MAX;
        for (index, candidate) in candidates.iter().enumerate() {
            // Bounded lookup; every failure path degrades to the EMA so a
            // slow or absent store never fails the request.
            let observed = match self.tracker.get_average_latency(&candidate.model).await {
                Ok(Some(avg)) => avg,
                Ok(None) => candidate.ema_latency_ms,
                Err(e) => {
                    tracing::debug!(model = %candidate.model, error = %e, "latency lookup failed, using EMA");
                    candidate.ema_latency_ms
                }
            };
            if observed < best_latency {
                best_latency = observed;
                best_index = index;
            }
        }
        Ok(best_index)
    }
}

/// Nginx-style smooth weighted interleave for route-level selection.
///
/// With total weight `T = Σ wᵢ` and the route's counter value `c`,
/// candidate `i` is due iff `floor(c·wᵢ/T) > floor((c-1)·wᵢ/T)`; the first
/// due candidate in stable order wins. Counter values where no candidate is
/// due (or degenerate weights) fall back to `c mod n`. Weights ≤ 0 are
/// clamped to 1.
pub fn smooth_weighted_pick(counter_value: u64, weights: &[f64]) -> usize {
    if weights.is_empty() {
        return 0;
    }
    let clamped: Vec<f64> = weights.iter().map(|w| if *w <= 0.0 { 1.0 } else { *w }).collect();
    let total: f64 = clamped.iter().sum();
    if !total.is_finite() || total <= 0.0 {
        return (counter_value % weights.len() as u64) as usize;
    }

    let c = counter_value as f64;
    for (index, weight) in clamped.iter().enumerate() {
        if (c * weight / total).floor() > ((c - 1.0) * weight / total).floor() {
            return index;
        }
    }
    (counter_value % weights.len() as u64) as usize
}

/// Strict construction: unknown names are a configuration error.
pub fn from_name(
    name: &str,
    latency: Option<Arc<LatencyTracker>>,
) -> Result<Arc<dyn RouteStrategy>, DispatchError> {
    match name {
        PRIORITY => Ok(Arc::new(PriorityStrategy)),
        RANDOM => Ok(Arc::new(RandomStrategy)),
        WEIGHTED_ROUND_ROBIN => Ok(Arc::new(WeightedRoundRobinStrategy::default())),
        LEAST_LATENCY => match latency {
            Some(tracker) => Ok(Arc::new(LeastLatencyStrategy::new(tracker))),
            None => {
                tracing::warn!("least-latency requested without a latency tracker, downgrading to priority");
                Ok(Arc::new(PriorityStrategy))
            }
        },
        other => Err(DispatchError::invalid(format!("unknown routing strategy: {other}"))),
    }
}

/// Configuration-path construction: unknown names downgrade to priority
/// with a warning instead of refusing to start.
pub fn from_name_or_default(
    name: &str,
    latency: Option<Arc<LatencyTracker>>,
) -> Arc<dyn RouteStrategy> {
    match from_name(name, latency) {
        Ok(strategy) => strategy,
        Err(_) => {
            tracing::warn!(strategy = name, "unknown routing strategy, downgrading to priority");
            Arc::new(PriorityStrategy)
        }
    }
}
