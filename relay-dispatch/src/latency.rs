//! # Distributed Latency Tracker
//!
//! Per-model sliding-window latency samples, shared across gateway
//! replicas through the KV store when one is configured and kept in
//! process memory otherwise. Two trimming rules apply on every write:
//! entries older than the window are dropped, and the retained count is
//! capped.
//!
//! Every lookup runs under a short budget; the least-latency strategy
//! falls back to the per-instance in-memory EMA when a lookup times out or
//! the store errors. The key is per model name, not per instance — in a
//! fleet of identically named instances the shared path cannot
//! differentiate them, and callers needing per-instance resolution rely on
//! the EMA.

use crate::store::SharedStore;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_SAMPLES: usize = 1000;

/// Budget for one shared-store lookup on the selection path.
pub const LOOKUP_BUDGET: Duration = Duration::from_millis(50);
/// Budget for the post-request background write.
pub const WRITE_BUDGET: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum LatencyError {
    #[error("shared store error: {0}")]
    Store(#[from] redis::RedisError),
    #[error("lookup deadline exceeded")]
    DeadlineExceeded,
}

/// p50/p95/p99 over the current window.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct LatencyPercentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

enum Backend {
    Shared(SharedStore),
    Memory(DashMap<String, VecDeque<(i64, f64)>>),
}

/// Sliding-window latency samples keyed by model name.
pub struct LatencyTracker {
    backend: Backend,
    window: Duration,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn shared(store: SharedStore, window: Duration, max_samples: usize) -> Self {
        Self {
            backend: Backend::Shared(store),
            window,
            max_samples,
        }
    }

    pub fn in_memory(window: Duration, max_samples: usize) -> Self {
        Self {
            backend: Backend::Memory(DashMap::new()),
            window,
            max_samples,
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.backend, Backend::Shared(_))
    }

    /// Record one sample, trimming by window and count.
    pub async fn record_latency(
        &self,
        model: &str,
        latency: Duration,
    ) -> Result<(), LatencyError> {
        let now_ms = Utc::now().timestamp_millis();
        let latency_ms = latency.as_millis() as f64;

        match &self.backend {
            Backend::Shared(store) => {
                let write = store.record_latency_sample(
                    model,
                    now_ms,
                    latency_ms,
                    self.window,
                    self.max_samples,
                );
                match tokio::time::timeout(WRITE_BUDGET, write).await {
                    Ok(result) => result.map_err(LatencyError::Store),
                    Err(_) => Err(LatencyError::DeadlineExceeded),
                }
            }
            Backend::Memory(samples) => {
                let mut entry = samples.entry(model.to_string()).or_default();
                entry.push_back((now_ms, latency_ms));
                let horizon = now_ms - self.window.as_millis() as i64;
                while entry.front().is_some_and(|(ts, _)| *ts < horizon) {
                    entry.pop_front();
                }
                while entry.len() > self.max_samples {
                    entry.pop_front();
                }
                Ok(())
            }
        }
    }

    /// Mean latency over the window; `None` when no samples exist.
    pub async fn get_average_latency(&self, model: &str) -> Result<Option<f64>, LatencyError> {
        let samples = self.window_samples(model).await?;
        if samples.is_empty() {
            return Ok(None);
        }
        Ok(Some(samples.iter().sum::<f64>() / samples.len() as f64))
    }

    pub async fn get_percentiles(
        &self,
        model: &str,
    ) -> Result<Option<LatencyPercentiles>, LatencyError> {
        let mut samples = self.window_samples(model).await?;
        if samples.is_empty() {
            return Ok(None);
        }
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Ok(Some(LatencyPercentiles {
            p50: percentile(&samples, 0.50),
            p95: percentile(&samples, 0.95),
            p99: percentile(&samples, 0.99),
        }))
    }

    async fn window_samples(&self, model: &str) -> Result<Vec<f64>, LatencyError> {
        let now_ms = Utc::now().timestamp_millis();
        match &self.backend {
            Backend::Shared(store) => {
                let read = store.latency_samples(model, now_ms, self.window);
                match tokio::time::timeout(LOOKUP_BUDGET, read).await {
                    Ok(result) => result.map_err(LatencyError::Store),
                    Err(_) => Err(LatencyError::DeadlineExceeded),
                }
            }
            Backend::Memory(samples) => {
                let horizon = now_ms - self.window.as_millis() as i64;
                Ok(samples
                    .get(model)
                    .map(|entry| {
                        entry
                            .iter()
                            .filter(|(ts, _)| *ts >= horizon)
                            .map(|(_, v)| *v)
                            .collect()
                    })
                    .unwrap_or_default())
            }
        }
    }
}

fn percentile(sorted: &[f64], q: f64) -> f64 {
    let rank = ((sorted.len() as f64) * q).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}
