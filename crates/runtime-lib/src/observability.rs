//! Observability infrastructure for the agent runtime
//!
//! Provides:
//! - Prometheus metrics (agent counts, execution latency, errors, limit breaches)
//! - Structured JSON logging with tracing

use crate::models::{ResourceAllocation, ResourceUsage};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for execution latency (in seconds)
const EXECUTION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<RuntimeMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct RuntimeMetricsInner {
    agents_registered: IntGauge,
    agents_running: IntGauge,
    executions: IntCounter,
    execution_errors: IntCounter,
    execution_timeouts: IntCounter,
    execution_latency_seconds: Histogram,
    resource_limit_exceeded: IntCounter,
    health_check_failures: IntCounter,
    lifecycle_transitions: IntCounterVec,
}

impl RuntimeMetricsInner {
    fn new() -> Self {
        Self {
            agents_registered: register_int_gauge!(
                "agent_runtime_agents_registered",
                "Number of agents currently registered"
            )
            .expect("Failed to register agents_registered"),

            agents_running: register_int_gauge!(
                "agent_runtime_agents_running",
                "Number of agents with a running sandbox"
            )
            .expect("Failed to register agents_running"),

            executions: register_int_counter!(
                "agent_runtime_executions_total",
                "Total number of agent executions requested"
            )
            .expect("Failed to register executions"),

            execution_errors: register_int_counter!(
                "agent_runtime_execution_errors_total",
                "Total number of failed agent executions"
            )
            .expect("Failed to register execution_errors"),

            execution_timeouts: register_int_counter!(
                "agent_runtime_execution_timeouts_total",
                "Total number of agent executions that hit their deadline"
            )
            .expect("Failed to register execution_timeouts"),

            execution_latency_seconds: register_histogram!(
                "agent_runtime_execution_latency_seconds",
                "Time spent waiting on agent executions",
                EXECUTION_BUCKETS.to_vec()
            )
            .expect("Failed to register execution_latency_seconds"),

            resource_limit_exceeded: register_int_counter!(
                "agent_runtime_resource_limit_exceeded_total",
                "Total number of hard resource ceiling breaches"
            )
            .expect("Failed to register resource_limit_exceeded"),

            health_check_failures: register_int_counter!(
                "agent_runtime_health_check_failures_total",
                "Total number of unhealthy sandbox verdicts"
            )
            .expect("Failed to register health_check_failures"),

            lifecycle_transitions: register_int_counter_vec!(
                "agent_runtime_lifecycle_transitions_total",
                "Lifecycle status transitions by target status",
                &["to_status"]
            )
            .expect("Failed to register lifecycle_transitions"),
        }
    }
}

/// Runtime metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct RuntimeMetrics {
    _private: (),
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(RuntimeMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &RuntimeMetricsInner {
        GLOBAL_METRICS.get_or_init(RuntimeMetricsInner::new)
    }

    pub fn set_agents_registered(&self, count: i64) {
        self.inner().agents_registered.set(count);
    }

    pub fn set_agents_running(&self, count: i64) {
        self.inner().agents_running.set(count);
    }

    pub fn inc_executions(&self) {
        self.inner().executions.inc();
    }

    pub fn inc_execution_errors(&self) {
        self.inner().execution_errors.inc();
    }

    pub fn inc_execution_timeouts(&self) {
        self.inner().execution_timeouts.inc();
    }

    pub fn observe_execution_latency(&self, duration_secs: f64) {
        self.inner().execution_latency_seconds.observe(duration_secs);
    }

    pub fn inc_resource_limit_exceeded(&self) {
        self.inner().resource_limit_exceeded.inc();
    }

    pub fn inc_health_check_failures(&self) {
        self.inner().health_check_failures.inc();
    }

    pub fn inc_lifecycle_transition(&self, to_status: &str) {
        self.inner()
            .lifecycle_transitions
            .with_label_values(&[to_status])
            .inc();
    }
}

/// Structured logger for runtime events
///
/// Provides consistent JSON-formatted logging for sandbox starts, limit
/// breaches, health-check rounds and other significant events.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    /// Log a sandbox start
    pub fn log_agent_started(&self, agent_id: &str, allocation: &ResourceAllocation) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_id = %agent_id,
            memory_mb = allocation.memory_mb,
            cpu_cores = allocation.cpu_cores,
            timeout_seconds = allocation.timeout_seconds,
            storage_mb = allocation.storage_mb,
            "Agent sandbox started"
        );
    }

    /// Log a sandbox stop
    pub fn log_agent_stopped(&self, agent_id: &str, duration_ms: Option<u64>) {
        info!(
            event = "agent_stopped",
            node = %self.node_name,
            agent_id = %agent_id,
            duration_ms = ?duration_ms,
            "Agent sandbox stopped"
        );
    }

    /// Log a hard resource ceiling breach
    pub fn log_resource_limit_exceeded(&self, agent_id: &str, usage: &ResourceUsage) {
        warn!(
            event = "resource_limit_exceeded",
            node = %self.node_name,
            agent_id = %agent_id,
            memory_used_mb = usage.memory_used,
            memory_limit_mb = usage.memory_limit,
            memory_usage_percent = usage.memory_usage_percent,
            cpu_usage_percent = usage.cpu_usage_percent,
            "Agent exceeded its resource ceiling"
        );
    }

    /// Log the outcome of a health-check round
    pub fn log_health_check(&self, checked: usize, unhealthy: usize) {
        if unhealthy > 0 {
            warn!(
                event = "health_check",
                node = %self.node_name,
                checked = checked,
                unhealthy = unhealthy,
                "Health check found unhealthy sandboxes"
            );
        } else {
            info!(
                event = "health_check",
                node = %self.node_name,
                checked = checked,
                "Health check complete"
            );
        }
    }

    /// Log runtime startup
    pub fn log_startup(&self, version: &str, agents: usize) {
        info!(
            event = "runtime_started",
            node = %self.node_name,
            runtime_version = %version,
            agents = agents,
            "Agent runtime started"
        );
    }

    /// Log runtime shutdown
    pub fn log_shutdown(&self, reason: &str, stopped: usize, failed: usize) {
        info!(
            event = "runtime_shutdown",
            node = %self.node_name,
            reason = %reason,
            stopped = stopped,
            failed = failed,
            "Agent runtime shutting down"
        );
    }
}
