//! Reference agent that echoes its input

use super::{Agent, AgentEvent, AgentMetrics};
use crate::lifecycle::AgentStatus;
use crate::models::{AgentCategory, AgentIdentity};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

/// Echoes every input back, optionally after a delay.
///
/// An input object carrying a `"fail"` string is rejected with that message,
/// which makes the agent usable for exercising error paths end to end.
pub struct EchoAgent {
    identity: AgentIdentity,
    delay: Duration,
    usage: AgentMetrics,
    status: Mutex<AgentStatus>,
    last_error: Mutex<Option<String>>,
    executions: AtomicU64,
    events: broadcast::Sender<AgentEvent>,
}

impl EchoAgent {
    pub fn new(id: impl Into<String>, category: AgentCategory) -> Self {
        let id = id.into();
        let (events, _) = broadcast::channel(16);
        Self {
            identity: AgentIdentity {
                name: format!("echo-{}", id),
                id,
                category,
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: "Echoes its input".to_string(),
            },
            delay: Duration::ZERO,
            usage: AgentMetrics::default(),
            status: Mutex::new(AgentStatus::Inactive),
            last_error: Mutex::new(None),
            executions: AtomicU64::new(0),
            events,
        }
    }

    /// Wait this long before answering each execution
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Usage the agent reports about itself
    pub fn with_usage(mut self, memory_used_mb: f64, cpu_used_percent: f64) -> Self {
        self.usage.memory_used_mb = memory_used_mb;
        self.usage.cpu_used_percent = cpu_used_percent;
        self
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Agent for EchoAgent {
    fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    async fn initialize(&self, config: Value) -> anyhow::Result<()> {
        *self.status.lock() = AgentStatus::Active;
        let _ = self.events.send(AgentEvent::ConfigChanged { config });
        Ok(())
    }

    async fn execute(&self, input: Value) -> anyhow::Result<Value> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.executions.fetch_add(1, Ordering::Relaxed);

        if let Some(message) = input.get("fail").and_then(Value::as_str) {
            *self.last_error.lock() = Some(message.to_string());
            let _ = self.events.send(AgentEvent::Error {
                message: message.to_string(),
            });
            anyhow::bail!("{}", message);
        }

        Ok(json!({ "agent_id": self.identity.id, "echo": input }))
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        *self.status.lock() = AgentStatus::Inactive;
        Ok(())
    }

    fn status(&self) -> AgentStatus {
        *self.status.lock()
    }

    fn metrics(&self) -> AgentMetrics {
        AgentMetrics {
            network_requests: self.executions(),
            ..self.usage
        }
    }

    async fn health_check(&self) -> bool {
        self.last_error.lock().is_none()
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<AgentEvent>> {
        Some(self.events.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_round_trip() {
        let agent = EchoAgent::new("e1", AgentCategory::Work);
        let output = agent.execute(json!({"x": 1})).await.unwrap();

        assert_eq!(output["echo"], json!({"x": 1}));
        assert_eq!(output["agent_id"], "e1");
        assert_eq!(agent.executions(), 1);
        assert_eq!(agent.metrics().network_requests, 1);
    }

    #[tokio::test]
    async fn test_echo_failure_is_reported() {
        let agent = EchoAgent::new("e1", AgentCategory::Work);
        let mut events = agent.subscribe().unwrap();

        let err = agent.execute(json!({"fail": "boom"})).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(agent.last_error().as_deref(), Some("boom"));
        assert!(!agent.health_check().await);

        match events.recv().await.unwrap() {
            AgentEvent::Error { message } => assert_eq!(message, "boom"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_initialize_and_cleanup_track_status() {
        let agent = EchoAgent::new("e1", AgentCategory::Validation).with_usage(64.0, 10.0);
        assert_eq!(agent.status(), AgentStatus::Inactive);

        agent.initialize(json!({})).await.unwrap();
        assert_eq!(agent.status(), AgentStatus::Active);
        assert_eq!(agent.metrics().memory_used_mb, 64.0);

        agent.cleanup().await.unwrap();
        assert_eq!(agent.status(), AgentStatus::Inactive);
    }
}
