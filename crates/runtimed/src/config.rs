//! Daemon configuration

use anyhow::{Context, Result};
use runtime_lib::models::AgentCategory;
use runtime_lib::runtime::RuntimeConfig;
use serde::Deserialize;
use std::time::Duration;

/// Environment variable naming an optional configuration file
pub const CONFIG_PATH_VAR: &str = "RUNTIMED_CONFIG";

/// Daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Node name attached to structured logs
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Sandbox health check interval in seconds
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// Metrics sampling interval in seconds
    #[serde(default = "default_metrics_sample_interval")]
    pub metrics_sample_interval_secs: u64,

    /// Abort in-flight executions when they time out
    #[serde(default)]
    pub cancel_on_timeout: bool,

    /// Agents registered at startup
    #[serde(default)]
    pub agents: Vec<DeclaredAgent>,
}

/// One agent declared in configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DeclaredAgent {
    pub id: String,
    pub category: AgentCategory,
    /// Start the agent right after registration
    #[serde(default)]
    pub autostart: bool,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "local".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_metrics_sample_interval() -> u64 {
    5
}

impl DaemonConfig {
    /// Load configuration from the optional config file and the environment
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Ok(path) = std::env::var(CONFIG_PATH_VAR) {
            builder = builder.add_source(config::File::with_name(&path));
        }

        let config = builder
            .add_source(config::Environment::with_prefix("RUNTIMED").try_parsing(true))
            .build()
            .context("failed to read daemon configuration")?;

        Self::from_config(config)
    }

    fn from_config(config: config::Config) -> Result<Self> {
        config
            .try_deserialize()
            .context("invalid daemon configuration")
    }

    /// Runtime settings derived from the daemon configuration
    pub fn runtime_config(&self) -> RuntimeConfig {
        let mut runtime = RuntimeConfig {
            node_name: self.node_name.clone(),
            health_check_interval: Duration::from_secs(self.health_check_interval_secs.max(1)),
            ..RuntimeConfig::default()
        };
        runtime.metrics.sample_interval =
            Duration::from_secs(self.metrics_sample_interval_secs.max(1));
        runtime.sandbox.cancel_on_timeout = self.cancel_on_timeout;
        runtime
    }
}
