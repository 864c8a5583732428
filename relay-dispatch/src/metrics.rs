//! # Metrics Collection
//!
//! Per-instance counters and the latency EMA, all kept on instance atomics
//! so recording never takes a lock. A one-minute fixed window tracks
//! request and token throughput; the rate-limit check is a query only —
//! the selection path does not consult it.

use crate::registry::Instance;
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// EMA smoothing: `ema' = 0.9·ema + 0.1·sample`.
const EMA_KEEP: f64 = 0.9;
const EMA_SAMPLE: f64 = 0.1;

const MINUTE_MS: i64 = 60_000;

/// Records request outcomes onto instance state.
#[derive(Debug, Default)]
pub struct MetricsCollector;

/// Point-in-time snapshot of one instance's counters.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceMetrics {
    pub instance_id: String,
    pub model: String,
    pub healthy: bool,
    pub ema_latency_ms: f64,
    pub total_requests: u64,
    pub total_tokens: u64,
    pub minute_requests: u64,
    pub minute_tokens: u64,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Update counters and the EMA for one completed request.
    pub fn record_request(&self, instance: &Instance, tokens: u64, latency: Duration) {
        let state = &instance.state;
        let sample_ms = latency.as_millis() as f64;

        state.total_requests.fetch_add(1, Ordering::Relaxed);
        state.total_tokens.fetch_add(tokens, Ordering::Relaxed);

        // Lock-free EMA update; a lost race skews one sample, which the
        // smoothing absorbs.
        let mut current = state.ema_latency_bits.load(Ordering::Acquire);
        loop {
            let ema = f64::from_bits(current);
            let next = if ema == 0.0 {
                sample_ms
            } else {
                EMA_KEEP * ema + EMA_SAMPLE * sample_ms
            };
            match state.ema_latency_bits.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        self.roll_minute_window(instance, 1, tokens);
    }

    fn roll_minute_window(&self, instance: &Instance, requests: u64, tokens: u64) {
        let state = &instance.state;
        let now_ms = Utc::now().timestamp_millis();
        let window_start = state.minute_start_ms.load(Ordering::Acquire);

        if now_ms - window_start >= MINUTE_MS {
            // Crossing the boundary resets the window to the current sample.
            state.minute_start_ms.store(now_ms, Ordering::Release);
            state.minute_requests.store(requests, Ordering::Release);
            state.minute_tokens.store(tokens, Ordering::Release);
        } else {
            state.minute_requests.fetch_add(requests, Ordering::Relaxed);
            state.minute_tokens.fetch_add(tokens, Ordering::Relaxed);
        }
    }

    /// Whether admitting `additional_tokens` would exceed the instance's
    /// configured per-minute caps. Exposed as a query; the selector does
    /// not call it.
    pub fn check_rate_limit(&self, instance: &Instance, additional_tokens: u64) -> bool {
        let state = &instance.state;
        let now_ms = Utc::now().timestamp_millis();
        let in_window = now_ms - state.minute_start_ms.load(Ordering::Acquire) < MINUTE_MS;
        let (requests, tokens) = if in_window {
            (
                state.minute_requests.load(Ordering::Acquire),
                state.minute_tokens.load(Ordering::Acquire),
            )
        } else {
            (0, 0)
        };

        if let Some(rpm) = instance.config.requests_per_minute {
            if requests + 1 > rpm {
                return true;
            }
        }
        if let Some(tpm) = instance.config.tokens_per_minute {
            if tokens + additional_tokens > tpm {
                return true;
            }
        }
        false
    }

    pub fn snapshot(&self, instance: &Instance) -> InstanceMetrics {
        InstanceMetrics {
            instance_id: instance.id().to_string(),
            model: instance.model().to_string(),
            healthy: instance.is_healthy(),
            ema_latency_ms: instance.ema_latency_ms(),
            total_requests: instance.total_requests(),
            total_tokens: instance.total_tokens(),
            minute_requests: instance.state.minute_requests.load(Ordering::Acquire),
            minute_tokens: instance.state.minute_tokens.load(Ordering::Acquire),
            consecutive_failures: instance.consecutive_failures(),
            last_error: instance.last_error(),
        }
    }

    pub fn get_all_metrics(&self, instances: &[Arc<Instance>]) -> Vec<InstanceMetrics> {
        instances.iter().map(|i| self.snapshot(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::create_provider;
    use crate::registry::test_support::instance_config;
    use crate::registry::InstanceState;

    fn instance_with_caps(rpm: Option<u64>, tpm: Option<u64>) -> Instance {
        let mut config = instance_config("i1", "m", 1);
        config.requests_per_minute = rpm;
        config.tokens_per_minute = tpm;
        let provider = create_provider(&config.provider).unwrap();
        Instance {
            config,
            provider,
            state: InstanceState::default(),
        }
    }

    #[test]
    fn ema_uses_point_nine_smoothing() {
        let collector = MetricsCollector::new();
        let inst = instance_with_caps(None, None);

        collector.record_request(&inst, 10, Duration::from_millis(100));
        assert!((inst.ema_latency_ms() - 100.0).abs() < f64::EPSILON);

        collector.record_request(&inst, 10, Duration::from_millis(200));
        // 0.9 * 100 + 0.1 * 200
        assert!((inst.ema_latency_ms() - 110.0).abs() < 1e-9);

        assert_eq!(inst.total_requests(), 2);
        assert_eq!(inst.total_tokens(), 20);
    }

    #[test]
    fn rate_limit_query_honors_caps() {
        let collector = MetricsCollector::new();
        let inst = instance_with_caps(Some(2), Some(100));

        assert!(!collector.check_rate_limit(&inst, 10));
        collector.record_request(&inst, 40, Duration::from_millis(10));
        collector.record_request(&inst, 40, Duration::from_millis(10));

        // Third request in the window exceeds the rpm cap.
        assert!(collector.check_rate_limit(&inst, 0));
        // Token cap also trips: 80 recorded + 30 requested > 100.
        assert!(collector.check_rate_limit(&inst, 30));
    }

    #[test]
    fn uncapped_instances_never_trip() {
        let collector = MetricsCollector::new();
        let inst = instance_with_caps(None, None);
        for _ in 0..100 {
            collector.record_request(&inst, 1000, Duration::from_millis(5));
        }
        assert!(!collector.check_rate_limit(&inst, u64::MAX / 2));
    }
}
