//! Component health for the runtime daemon
//!
//! `HealthRegistry` folds the runtime, lifecycle and metrics event streams
//! into one verdict per component. The daemon serves the result on its
//! liveness and readiness endpoints.

use crate::lifecycle::{AgentStatus, LifecycleEvent};
use crate::metrics::{MetricsEvent, SystemSummary};
use crate::runtime::{HealthCheckEntry, RuntimeEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Parts of the runtime that report health
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Runtime,
    Lifecycle,
    Metrics,
    Sandboxes,
}

impl Component {
    pub const ALL: [Component; 4] = [
        Component::Runtime,
        Component::Lifecycle,
        Component::Metrics,
        Component::Sandboxes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Runtime => "runtime",
            Component::Lifecycle => "lifecycle",
            Component::Metrics => "metrics",
            Component::Sandboxes => "sandboxes",
        }
    }
}

/// Ordered from best to worst, so the overall status is the maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ComponentHealth {
    fn with(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            updated_at: Utc::now(),
        }
    }

    pub fn healthy() -> Self {
        Self::with(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<Component, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug)]
struct HealthState {
    components: BTreeMap<Component, ComponentHealth>,
    agents_in_error: BTreeSet<String>,
    ready: bool,
}

/// Shared, cloneable view of component health
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    state: Arc<RwLock<HealthState>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    /// Every component starts healthy; the registry starts not ready
    pub fn new() -> Self {
        let components = Component::ALL
            .iter()
            .map(|c| (*c, ComponentHealth::healthy()))
            .collect();

        Self {
            state: Arc::new(RwLock::new(HealthState {
                components,
                agents_in_error: BTreeSet::new(),
                ready: false,
            })),
        }
    }

    pub async fn update(&self, component: Component, health: ComponentHealth) {
        self.state.write().await.components.insert(component, health);
    }

    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.ready = ready;
    }

    /// Healthy when every sandbox passed, degraded when some failed,
    /// unhealthy when all of them failed
    pub async fn record_sandbox_round(&self, results: &[HealthCheckEntry]) {
        let failing: Vec<&str> = results
            .iter()
            .filter(|r| !r.healthy)
            .map(|r| r.agent_id.as_str())
            .collect();

        let health = if failing.is_empty() {
            ComponentHealth::healthy()
        } else if failing.len() == results.len() {
            ComponentHealth::unhealthy(format!("all {} sandboxes unhealthy", results.len()))
        } else {
            ComponentHealth::degraded(format!(
                "{} of {} sandboxes unhealthy: {}",
                failing.len(),
                results.len(),
                failing.join(", ")
            ))
        };
        self.update(Component::Sandboxes, health).await;
    }

    pub async fn record_runtime_event(&self, event: &RuntimeEvent) {
        match event {
            RuntimeEvent::HealthCheckCompleted { results } => {
                self.record_sandbox_round(results).await;
            }
            RuntimeEvent::ShutdownCompleted(report) => {
                let message = if report.failed.is_empty() {
                    format!("runtime shut down, {} agents stopped", report.stopped.len())
                } else {
                    format!(
                        "runtime shut down, {} agents stopped, {} failed to stop",
                        report.stopped.len(),
                        report.failed.len()
                    )
                };
                self.update(Component::Runtime, ComponentHealth::unhealthy(message))
                    .await;
            }
            RuntimeEvent::AgentError { agent_id, message } => {
                debug!(agent_id = %agent_id, error = %message, "Agent error reported");
            }
            _ => {}
        }
    }

    /// Degraded while any agent sits in ERROR, unhealthy once shut down
    pub async fn record_lifecycle_event(&self, event: &LifecycleEvent) {
        let mut state = self.state.write().await;

        let changed = match event {
            LifecycleEvent::StatusChanged {
                agent_id,
                transition,
            } => {
                if transition.to == AgentStatus::Error {
                    state.agents_in_error.insert(agent_id.clone())
                } else {
                    state.agents_in_error.remove(agent_id)
                }
            }
            LifecycleEvent::Unregistered { agent_id } => state.agents_in_error.remove(agent_id),
            LifecycleEvent::Shutdown => {
                state.agents_in_error.clear();
                state.components.insert(
                    Component::Lifecycle,
                    ComponentHealth::unhealthy("lifecycle manager shut down"),
                );
                return;
            }
            LifecycleEvent::Registered { .. } => false,
        };

        if changed {
            let health = if state.agents_in_error.is_empty() {
                ComponentHealth::healthy()
            } else {
                let ids: Vec<&str> = state.agents_in_error.iter().map(String::as_str).collect();
                ComponentHealth::degraded(format!("agents in error state: {}", ids.join(", ")))
            };
            state.components.insert(Component::Lifecycle, health);
        }
    }

    pub async fn record_metrics_summary(&self, summary: &SystemSummary) {
        let health = if summary.has_high_error_rate() {
            ComponentHealth::degraded(format!(
                "error rate {:.1}% across {} executions",
                summary.overall_error_rate * 100.0,
                summary.total_executions
            ))
        } else {
            ComponentHealth::healthy()
        };
        self.update(Component::Metrics, health).await;
    }

    pub async fn record_metrics_event(&self, event: &MetricsEvent) {
        if let MetricsEvent::SystemSummary(summary) = event {
            self.record_metrics_summary(summary).await;
        }
    }

    /// Fold event streams into component health until the runtime shuts down
    pub async fn watch(
        self,
        mut runtime: broadcast::Receiver<RuntimeEvent>,
        mut lifecycle: broadcast::Receiver<LifecycleEvent>,
        mut metrics: broadcast::Receiver<MetricsEvent>,
    ) {
        let mut shut_down = false;

        loop {
            tokio::select! {
                event = runtime.recv() => match event {
                    Ok(event) => {
                        self.record_runtime_event(&event).await;
                        if matches!(event, RuntimeEvent::ShutdownCompleted(_)) {
                            shut_down = true;
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => lagged("runtime", skipped),
                    Err(RecvError::Closed) => break,
                },
                event = lifecycle.recv() => match event {
                    Ok(event) => self.record_lifecycle_event(&event).await,
                    Err(RecvError::Lagged(skipped)) => lagged("lifecycle", skipped),
                    Err(RecvError::Closed) => break,
                },
                event = metrics.recv() => match event {
                    Ok(event) => self.record_metrics_event(&event).await,
                    Err(RecvError::Lagged(skipped)) => lagged("metrics", skipped),
                    Err(RecvError::Closed) => break,
                },
            }
        }

        // Lifecycle and metrics shut down before the runtime reports
        if shut_down {
            while let Ok(event) = lifecycle.try_recv() {
                self.record_lifecycle_event(&event).await;
            }
            while let Ok(event) = metrics.try_recv() {
                self.record_metrics_event(&event).await;
            }
        }

        debug!("Health tracking stopped");
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.state.read().await.components.clone();
        let status = components
            .values()
            .map(|h| h.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);

        HealthResponse { status, components }
    }

    /// Ready once marked ready and while no component is unhealthy
    pub async fn readiness(&self) -> ReadinessResponse {
        let state = self.state.read().await;

        if !state.ready {
            return ReadinessResponse {
                ready: false,
                reason: Some("runtime not yet initialized".to_string()),
            };
        }

        let failed: Vec<&str> = state
            .components
            .iter()
            .filter(|(_, h)| h.status == ComponentStatus::Unhealthy)
            .map(|(c, _)| c.as_str())
            .collect();

        if failed.is_empty() {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        } else {
            ReadinessResponse {
                ready: false,
                reason: Some(format!("unhealthy: {}", failed.join(", "))),
            }
        }
    }
}

fn lagged(source: &str, skipped: u64) {
    warn!(source, skipped, "Health tracking lagged behind events");
}
