//! # Health Tracking
//!
//! Two cooperating pieces:
//!
//! - [`HealthTracker`] — records request and probe outcomes on an
//!   instance's atomic state. Three consecutive failures flip the healthy
//!   flag off; any recorded success flips it back on and zeroes the
//!   counter. This is the only code that writes the flag.
//! - [`HealthChecker`] — the periodic prober. Every interval it probes all
//!   registered instances concurrently with a short per-probe timeout, and
//!   mirrors each outcome into the shared store when one is configured so
//!   sibling replicas can observe it. One immediate pass runs at startup
//!   before the first tick.
//!
//! Probe errors never surface to callers; they only mutate the healthy
//! flag and the shared record.

use crate::providers::ProviderKind;
use crate::registry::{Instance, ModelRegistry};
use crate::store::SharedStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Consecutive failures before an instance is gated out of selection.
pub const FAILURE_THRESHOLD: u32 = 3;

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Records success and failure outcomes on instance state.
#[derive(Debug, Default)]
pub struct HealthTracker;

impl HealthTracker {
    pub fn new() -> Self {
        Self
    }

    /// A successful request or probe: healthy again, counter cleared.
    pub fn record_success(&self, instance: &Instance) {
        instance.state.consecutive_failures.store(0, Ordering::Release);
        instance.state.healthy.store(true, Ordering::Release);
        instance
            .state
            .last_success_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    /// A failed request or probe; the third in a row gates the instance.
    pub fn record_failure(&self, instance: &Instance, error: &str) {
        let failures = instance
            .state
            .consecutive_failures
            .fetch_add(1, Ordering::AcqRel)
            + 1;
        if let Ok(mut last_error) = instance.state.last_error.write() {
            *last_error = Some(error.to_string());
        }
        if failures >= FAILURE_THRESHOLD {
            let was_healthy = instance.state.healthy.swap(false, Ordering::AcqRel);
            if was_healthy {
                tracing::warn!(
                    instance = instance.id(),
                    model = instance.model(),
                    failures,
                    "instance marked unhealthy"
                );
            }
        }
    }

    pub fn is_healthy(&self, instance: &Instance) -> bool {
        instance.is_healthy()
    }
}

/// Probe outcome shared with sibling replicas via the KV store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    pub instance_id: String,
    pub model: String,
    pub provider: ProviderKind,
    pub healthy: bool,
    pub latency_ms: u64,
    pub checked_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Periodic active prober over all registered instances.
pub struct HealthChecker {
    registry: Arc<ModelRegistry>,
    tracker: Arc<HealthTracker>,
    store: Option<SharedStore>,
    interval: Duration,
    probe_timeout: Duration,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<ModelRegistry>,
        tracker: Arc<HealthTracker>,
        store: Option<SharedStore>,
        interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            tracker,
            store,
            interval,
            probe_timeout,
        }
    }

    /// Run the probe loop until the handle is dropped or aborted. The first
    /// interval tick fires immediately, giving the startup pass.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.run_probe_pass().await;
            }
        })
    }

    /// Probe every registered instance concurrently.
    pub async fn run_probe_pass(&self) {
        let instances = self.registry.get_all_instances();
        if instances.is_empty() {
            return;
        }
        tracing::debug!(count = instances.len(), "running health probe pass");

        let probes = instances
            .into_iter()
            .map(|instance| self.probe_instance(instance));
        futures::future::join_all(probes).await;
    }

    async fn probe_instance(&self, instance: Arc<Instance>) {
        let started = std::time::Instant::now();
        let outcome =
            tokio::time::timeout(self.probe_timeout, instance.provider.health_check()).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let error = match outcome {
            Ok(Ok(())) => {
                self.tracker.record_success(&instance);
                None
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                self.tracker.record_failure(&instance, &message);
                Some(message)
            }
            Err(_) => {
                let message = "health probe timed out".to_string();
                self.tracker.record_failure(&instance, &message);
                Some(message)
            }
        };

        if let Some(store) = &self.store {
            let record = HealthRecord {
                instance_id: instance.id().to_string(),
                model: instance.model().to_string(),
                provider: instance.provider.kind(),
                healthy: instance.is_healthy(),
                latency_ms,
                checked_at: Utc::now(),
                error,
            };
            // TTL of two intervals keeps records alive across one missed pass.
            if let Err(e) = store.put_health_record(&record, self.interval * 2).await {
                tracing::warn!(instance = instance.id(), error = %e, "failed to publish health record");
            }
        }
    }
}
