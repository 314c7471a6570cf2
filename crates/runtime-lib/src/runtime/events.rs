use crate::models::{ExecutionMetrics, ResourceAllocation, ResourceUsage};
use serde::Serialize;
use serde_json::Value;

/// Notifications published by the runtime manager
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    AgentRegistered {
        agent_id: String,
    },
    AgentUnregistered {
        agent_id: String,
    },
    AgentStarted {
        agent_id: String,
        allocation: ResourceAllocation,
    },
    AgentStopped {
        agent_id: String,
        duration_ms: Option<u64>,
    },
    AgentExecuted {
        agent_id: String,
        duration_ms: u64,
    },
    /// A failed start or execution, or an error the agent reported itself
    AgentError {
        agent_id: String,
        message: String,
    },
    AgentConfigChanged {
        agent_id: String,
        config: Value,
    },
    ResourceLimitExceeded {
        agent_id: String,
        usage: ResourceUsage,
    },
    HealthCheckCompleted {
        results: Vec<HealthCheckEntry>,
    },
    ShutdownCompleted(ShutdownReport),
}

/// Health of one running sandbox as seen by a health check
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckEntry {
    pub agent_id: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<ResourceUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ExecutionMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthCheckEntry {
    pub(crate) fn failed(agent_id: &str, error: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            healthy: false,
            resource_usage: None,
            metrics: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownFailure {
    pub agent_id: String,
    pub error: String,
}

/// Per-agent outcome of a runtime shutdown
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    pub stopped: Vec<String>,
    pub failed: Vec<ShutdownFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeStats {
    pub total_agents: usize,
    pub running_agents: usize,
    pub healthy_agents: usize,
    pub unhealthy_agents: usize,
    pub total_memory_usage_mb: f64,
    pub average_cpu_usage_percent: f64,
    pub uptime_ms: u64,
}
