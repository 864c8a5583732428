//! # Configuration
//!
//! TOML-based configuration for the gateway: server binding, the dispatch
//! core's routing and failover knobs, the optional shared store, and the
//! instance and route definitions the registry loads at startup.
//!
//! `${VAR}` references in secret fields (provider API keys, the store URL)
//! are expanded from the process environment at load time.
//!
//! ## Example
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8080
//! timeout = "60s"
//!
//! [routing]
//! routing_strategy = "least-latency"
//! enable_failover = true
//! instance_retry_attempts = 2
//! failover_timeout_multiple = 1.5
//! health_check_interval = "30s"
//! latency_window = "5m"
//! max_samples = 1000
//!
//! [routing.fallback_map]
//! "gpt-4o" = "claude-sonnet"
//!
//! [store]
//! url = "${RELAY_REDIS_URL}"
//!
//! [[instances]]
//! id = "openai-gpt4o-a"
//! model = "gpt-4o"
//! provider_model = "gpt-4o"
//! priority = 100
//! timeout = "30s"
//!
//! [instances.provider]
//! kind = "openai"
//! api_key = "${OPENAI_API_KEY}"
//!
//! [[routes]]
//! slug = "balanced"
//! strategy = "weighted-round-robin"
//! fallback_models = ["gpt-4o"]
//!
//! [[routes.models]]
//! name = "gpt-4o"
//! weight = 70
//!
//! [[routes.models]]
//! name = "claude-sonnet"
//! weight = 30
//! ```

use relay_dispatch::common::{duration_serde, expand_env};
use relay_dispatch::manager::ManagerConfig;
use relay_dispatch::registry::InstanceConfig;
use relay_dispatch::route::RouteConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub routing: ManagerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Whole-request timeout applied by the HTTP layer
    #[serde(with = "duration_serde", default = "default_server_timeout")]
    pub timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout: default_server_timeout(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_server_timeout() -> Duration {
    Duration::from_secs(120)
}

/// Shared KV store; absent URL means in-memory only.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub url: Option<String>,
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.expand_secrets();
        config.validate()?;
        Ok(config)
    }

    /// `${VAR}` expansion on secret-bearing fields.
    fn expand_secrets(&mut self) {
        for instance in &mut self.instances {
            instance.provider.api_key = expand_env(&instance.provider.api_key);
        }
        if let Some(url) = &self.store.url {
            self.store.url = Some(expand_env(url));
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server.port must be set");
        }

        let mut ids = HashSet::new();
        let mut models = HashSet::new();
        for instance in &self.instances {
            if instance.id.is_empty() {
                anyhow::bail!("instance id must not be empty");
            }
            if !ids.insert(&instance.id) {
                anyhow::bail!("duplicate instance id: {}", instance.id);
            }
            models.insert(instance.model.as_str());
        }

        let mut slugs = HashSet::new();
        for route in &self.routes {
            if models.contains(route.slug.as_str()) {
                anyhow::bail!("route slug collides with configured model: {}", route.slug);
            }
            if !slugs.insert(route.slug.as_str()) {
                anyhow::bail!("duplicate route slug: {}", route.slug);
            }
            if route.models.is_empty() {
                anyhow::bail!("route has no member models: {}", route.slug);
            }
        }

        Ok(())
    }
}
