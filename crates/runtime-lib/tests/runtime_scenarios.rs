//! End-to-end runtime scenarios
//!
//! Drives the public `RuntimeManager` API the way an embedding service would:
//! register, start, execute, stop and shut down agents, then inspect the
//! lifecycle, metrics and event streams.

use async_trait::async_trait;
use runtime_lib::agent::{Agent, AgentMetrics, EchoAgent};
use runtime_lib::lifecycle::AgentStatus;
use runtime_lib::metrics::{MetricsReport, Trend};
use runtime_lib::models::{AgentCategory, AgentIdentity, ExecutionMetrics, ResourceAllocation};
use runtime_lib::runtime::{RuntimeConfig, RuntimeEvent, RuntimeManager};
use runtime_lib::RuntimeError;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_test::assert_ok;

/// Reports usage normally until told to fail, then panics while reporting
struct FragileAgent {
    identity: AgentIdentity,
    broken: AtomicBool,
}

impl FragileAgent {
    fn new(id: &str) -> Self {
        Self {
            identity: AgentIdentity {
                id: id.to_string(),
                name: id.to_string(),
                category: AgentCategory::Work,
                version: "0.0.0".to_string(),
                description: "breaks on demand".to_string(),
            },
            broken: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Agent for FragileAgent {
    fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    async fn initialize(&self, _config: Value) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute(&self, input: Value) -> anyhow::Result<Value> {
        Ok(input)
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn status(&self) -> AgentStatus {
        AgentStatus::Active
    }

    fn metrics(&self) -> AgentMetrics {
        if self.broken.load(Ordering::SeqCst) {
            panic!("status retrieval failed");
        }
        AgentMetrics {
            memory_used_mb: 32.0,
            cpu_used_percent: 5.0,
            network_requests: 0,
        }
    }

    async fn health_check(&self) -> bool {
        !self.broken.load(Ordering::SeqCst)
    }

    fn last_error(&self) -> Option<String> {
        None
    }
}

fn test_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.sandbox.init_timeout = Duration::from_secs(1);
    config.sandbox.stop_timeout = Duration::from_millis(500);
    config.sandbox.sample_interval = Duration::from_millis(20);
    config.sandbox.probe_timeout = Duration::from_millis(500);
    config
}

fn work_allocation(timeout_seconds: f64) -> ResourceAllocation {
    ResourceAllocation::new(256.0, 0.5, timeout_seconds, 100.0)
}

async fn wait_for<F>(events: &mut broadcast::Receiver<RuntimeEvent>, mut matches: F) -> RuntimeEvent
where
    F: FnMut(&RuntimeEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => break event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("expected event was not published")
}

#[tokio::test]
async fn test_register_start_execute_stop() {
    let runtime = RuntimeManager::new(test_config());
    let lifecycle = runtime.lifecycle().clone();

    runtime
        .register_agent(Arc::new(EchoAgent::new("a1", AgentCategory::Work)))
        .unwrap();
    assert_eq!(lifecycle.status("a1"), Some(AgentStatus::Inactive));

    runtime
        .start_agent("a1", Some(ResourceAllocation::new(256.0, 0.5, 300.0, 100.0)))
        .await
        .unwrap();
    assert_eq!(lifecycle.status("a1"), Some(AgentStatus::Running));
    assert!(runtime.is_running("a1"));
    assert!(runtime.metrics_collector().is_collecting("a1"));

    let output = runtime.execute_agent("a1", json!({"x": 1})).await.unwrap();
    assert_eq!(output["echo"], json!({"x": 1}));
    assert_eq!(lifecycle.status("a1"), Some(AgentStatus::Active));

    runtime.stop_agent("a1").await.unwrap();
    assert_eq!(lifecycle.status("a1"), Some(AgentStatus::Inactive));
    assert!(!runtime.is_running("a1"));
    assert!(runtime.agent_metrics("a1").is_none());

    // Every recorded transition follows the table
    for transition in lifecycle.transitions("a1").unwrap() {
        assert!(transition.from.can_transition_to(transition.to));
    }

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_start_unregistered_agent() {
    let runtime = RuntimeManager::new(test_config());

    let err = runtime.start_agent("missing", None).await.unwrap_err();

    assert_eq!(err, RuntimeError::AgentNotRegistered("missing".into()));
    assert!(runtime.running_agents().is_empty());
    assert!(!runtime.lifecycle().is_registered("missing"));
}

#[tokio::test]
async fn test_shutdown_stops_everything_once() {
    let runtime = RuntimeManager::new(test_config());
    let mut events = runtime.subscribe();

    for id in ["a1", "a2", "a3"] {
        runtime
            .register_agent(Arc::new(EchoAgent::new(id, AgentCategory::Work)))
            .unwrap();
        runtime.start_agent(id, Some(work_allocation(30.0))).await.unwrap();
    }
    assert_eq!(runtime.running_agents().len(), 3);

    let report = runtime.shutdown().await.expect("first shutdown reports");
    assert_eq!(report.stopped, vec!["a1", "a2", "a3"]);
    assert!(report.failed.is_empty());
    assert!(runtime.running_agents().is_empty());

    assert!(runtime.shutdown().await.is_none());

    let mut completed = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, RuntimeEvent::ShutdownCompleted(_)) {
            completed += 1;
        }
    }
    assert_eq!(completed, 1);
}

#[tokio::test]
async fn test_rising_memory_reports_increasing_trend() {
    let runtime = RuntimeManager::new(test_config());
    runtime
        .register_agent(Arc::new(EchoAgent::new("a1", AgentCategory::Work)))
        .unwrap();
    runtime.start_agent("a1", Some(work_allocation(30.0))).await.unwrap();

    let collector = runtime.metrics_collector();
    for i in 0..20 {
        let mut metrics = ExecutionMetrics::new(chrono::Utc::now());
        metrics.memory_used_mb = 100.0 + 10.0 * i as f64;
        collector.record_metrics("a1", metrics);
    }

    match collector.generate_report(Some("a1")) {
        Some(MetricsReport::Agent(report)) => {
            assert_eq!(report.trend.memory_trend, Trend::Increasing);
            assert!(report.summary.total_executions >= 20);
        }
        other => panic!("unexpected report: {:?}", other),
    }

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_repeated_errors_are_flagged() {
    let runtime = RuntimeManager::new(test_config());
    runtime
        .register_agent(Arc::new(EchoAgent::new("a1", AgentCategory::Work)))
        .unwrap();
    runtime.start_agent("a1", Some(work_allocation(30.0))).await.unwrap();

    for attempt in 0..5 {
        let err = runtime
            .execute_agent("a1", json!({"fail": format!("attempt {}", attempt)}))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ExecutionFailed { .. }));
        assert_eq!(runtime.lifecycle().status("a1"), Some(AgentStatus::Error));
    }

    let report = runtime.lifecycle().agent_report("a1").unwrap();
    assert_eq!(report.error_count, 5);
    assert!(report
        .recommendations
        .iter()
        .any(|r| r.contains("High error count")));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_health_check_isolates_broken_sandbox() {
    let runtime = RuntimeManager::new(test_config());
    let mut events = runtime.subscribe();
    let fragile = Arc::new(FragileAgent::new("fragile"));

    runtime.register_agent(fragile.clone()).unwrap();
    runtime
        .register_agent(Arc::new(EchoAgent::new("steady", AgentCategory::Work)))
        .unwrap();
    // 240 of 256 MB is above the soft threshold but below the hard one
    runtime
        .register_agent(Arc::new(
            EchoAgent::new("hot", AgentCategory::Work).with_usage(240.0, 10.0),
        ))
        .unwrap();
    for id in ["fragile", "steady", "hot"] {
        runtime.start_agent(id, Some(work_allocation(30.0))).await.unwrap();
    }

    fragile.broken.store(true, Ordering::SeqCst);
    wait_for(&mut events, |e| {
        matches!(e, RuntimeEvent::AgentError { agent_id, .. } if agent_id == "fragile")
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let results = runtime.perform_health_check().await;
    assert_eq!(results.len(), 3);

    let fragile = &results[0];
    assert_eq!(fragile.agent_id, "fragile");
    assert!(!fragile.healthy);
    assert!(fragile.error.is_some());

    let hot = &results[1];
    assert_eq!(hot.agent_id, "hot");
    assert!(!hot.healthy);
    assert!(hot.error.is_none());
    assert_eq!(hot.resource_usage.as_ref().unwrap().memory_usage_percent, 93.75);

    let steady = &results[2];
    assert_eq!(steady.agent_id, "steady");
    assert!(steady.healthy);

    // The stop of a dead worker still completes
    assert_ok!(runtime.stop_agent("fragile").await);
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_execution_timeout_boundary() {
    let runtime = RuntimeManager::new(test_config());
    runtime
        .register_agent(Arc::new(
            EchoAgent::new("slow", AgentCategory::Work).with_delay(Duration::from_secs(30)),
        ))
        .unwrap();
    runtime.start_agent("slow", Some(work_allocation(1.0))).await.unwrap();

    let started = Instant::now();
    let err = runtime.execute_agent("slow", json!({})).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.is_timeout());
    assert!(elapsed >= Duration::from_millis(950), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1500), "returned after {:?}", elapsed);
    assert_eq!(runtime.agent_metrics("slow").unwrap().error_count, 1);
    assert_eq!(runtime.lifecycle().status("slow"), Some(AgentStatus::Error));
    assert!(runtime.is_running("slow"));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_resource_limit_is_surfaced() {
    let runtime = RuntimeManager::new(test_config());
    let mut events = runtime.subscribe();
    runtime
        .register_agent(Arc::new(
            EchoAgent::new("greedy", AgentCategory::Work).with_usage(250.0, 10.0),
        ))
        .unwrap();
    runtime.start_agent("greedy", Some(work_allocation(30.0))).await.unwrap();

    let event = wait_for(&mut events, |e| {
        matches!(e, RuntimeEvent::ResourceLimitExceeded { .. })
    })
    .await;

    match event {
        RuntimeEvent::ResourceLimitExceeded { agent_id, usage } => {
            assert_eq!(agent_id, "greedy");
            assert!(usage.memory_usage_percent > 95.0);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_unrepresentable_timeout_is_rejected_at_start() {
    let runtime = RuntimeManager::new(test_config());
    runtime
        .register_agent(Arc::new(EchoAgent::new("a1", AgentCategory::Work)))
        .unwrap();

    let err = runtime
        .start_agent("a1", Some(work_allocation(1e20)))
        .await
        .unwrap_err();

    assert!(matches!(err, RuntimeError::InvalidAllocation(_)));
    assert!(!runtime.is_running("a1"));
    assert_eq!(runtime.lifecycle().status("a1"), Some(AgentStatus::Error));

    let err = runtime.execute_agent("a1", json!({"x": 1})).await.unwrap_err();
    assert_eq!(err, RuntimeError::AgentNotRunning("a1".into()));

    runtime.shutdown().await;
}
