//! Agent contract
//!
//! An agent is a pluggable unit of work. The runtime treats it as opaque
//! beyond this trait: it never interprets execution payloads and only reads
//! the agent's identity and self-reported usage.

mod echo;

pub use echo::EchoAgent;

use crate::lifecycle::AgentStatus;
use crate::models::{AgentCategory, AgentIdentity};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Usage figures an agent reports about itself
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub memory_used_mb: f64,
    pub cpu_used_percent: f64,
    pub network_requests: u64,
}

/// Notifications an agent publishes on its own stream
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Error { message: String },
    ConfigChanged { config: Value },
}

/// A unit of work that can run inside a sandbox
#[async_trait]
pub trait Agent: Send + Sync {
    fn identity(&self) -> &AgentIdentity;

    fn id(&self) -> &str {
        &self.identity().id
    }

    fn name(&self) -> &str {
        &self.identity().name
    }

    fn version(&self) -> &str {
        &self.identity().version
    }

    fn category(&self) -> AgentCategory {
        self.identity().category
    }

    fn description(&self) -> &str {
        &self.identity().description
    }

    /// Prepare the agent; `config` is the sandbox initialization payload
    async fn initialize(&self, config: Value) -> anyhow::Result<()>;

    async fn execute(&self, input: Value) -> anyhow::Result<Value>;

    async fn cleanup(&self) -> anyhow::Result<()>;

    fn status(&self) -> AgentStatus;

    fn metrics(&self) -> AgentMetrics;

    async fn health_check(&self) -> bool;

    fn last_error(&self) -> Option<String>;

    /// Event stream re-surfaced by the runtime, if the agent publishes one
    fn subscribe(&self) -> Option<broadcast::Receiver<AgentEvent>> {
        None
    }
}
