//! Runtime manager
//!
//! The single entry point for callers. It owns the registry of agents and the
//! map of running sandboxes, and keeps the lifecycle manager and metrics
//! collector in step with both. A background task checks sandbox health on a
//! fixed interval until [`RuntimeManager::shutdown`].
//!
//! Start, stop and unregister of one agent are serialized by that agent's
//! operation lock; executions only hold it long enough to look up the
//! sandbox and record the status change.

mod config;
mod events;

pub use config::RuntimeConfig;
pub use events::{HealthCheckEntry, RuntimeEvent, RuntimeStats, ShutdownFailure, ShutdownReport};

use crate::agent::{Agent, AgentEvent};
use crate::error::{Result, RuntimeError};
use crate::lifecycle::{AgentStatus, LifecycleManager};
use crate::metrics::MetricsCollector;
use crate::models::{ExecutionMetrics, ResourceAllocation, ResourceUsage};
use crate::observability::{RuntimeMetrics, StructuredLogger};
use crate::sandbox::{Sandbox, SandboxEvent};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, OwnedRwLockWriteGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

struct RegisteredAgent {
    agent: Arc<dyn Agent>,
    op_lock: Arc<RwLock<()>>,
    /// Re-surfaces the agent's own event stream
    forwarder: Option<JoinHandle<()>>,
}

struct SandboxSlot {
    sandbox: Arc<Sandbox>,
    forwarder: JoinHandle<()>,
}

pub struct RuntimeManager {
    config: RuntimeConfig,
    agents: DashMap<String, RegisteredAgent>,
    sandboxes: DashMap<String, SandboxSlot>,
    lifecycle: Arc<LifecycleManager>,
    collector: Arc<MetricsCollector>,
    events: broadcast::Sender<RuntimeEvent>,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: AtomicBool,
    started_at: Instant,
    metrics: RuntimeMetrics,
    logger: StructuredLogger,
}

impl RuntimeManager {
    /// Create the runtime and start its health check loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let manager = Arc::new(Self {
            lifecycle: Arc::new(LifecycleManager::new(config.lifecycle.clone())),
            collector: MetricsCollector::new(config.metrics.clone()),
            logger: StructuredLogger::new(config.node_name.clone()),
            config,
            agents: DashMap::new(),
            sandboxes: DashMap::new(),
            events,
            shutdown_tx,
            shutting_down: AtomicBool::new(false),
            started_at: Instant::now(),
            metrics: RuntimeMetrics::new(),
        });

        tokio::spawn(health_check_loop(
            Arc::downgrade(&manager),
            manager.config.health_check_interval,
            shutdown_rx,
        ));

        info!(
            health_check_interval_secs = manager.config.health_check_interval.as_secs(),
            "Runtime manager started"
        );
        manager
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn metrics_collector(&self) -> &Arc<MetricsCollector> {
        &self.collector
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(RuntimeError::ShuttingDown);
        }
        Ok(())
    }

    fn emit(&self, event: RuntimeEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    /// Register an agent and start tracking its lifecycle in INACTIVE
    pub fn register_agent(&self, agent: Arc<dyn Agent>) -> Result<()> {
        self.ensure_open()?;
        let agent_id = agent.id().to_string();

        match self.agents.entry(agent_id.clone()) {
            Entry::Occupied(_) => return Err(RuntimeError::AgentAlreadyRegistered(agent_id)),
            Entry::Vacant(slot) => {
                self.lifecycle.register_agent(&agent_id)?;
                let forwarder = agent.subscribe().map(|agent_events| {
                    tokio::spawn(forward_agent_events(
                        agent_id.clone(),
                        agent_events,
                        self.events.clone(),
                    ))
                });
                slot.insert(RegisteredAgent {
                    agent: agent.clone(),
                    op_lock: Arc::new(RwLock::new(())),
                    forwarder,
                });
            }
        }

        self.metrics.set_agents_registered(self.agents.len() as i64);
        info!(
            agent_id = %agent_id,
            name = %agent.name(),
            category = %agent.category(),
            "Agent registered"
        );
        self.emit(RuntimeEvent::AgentRegistered { agent_id });

        Ok(())
    }

    /// Remove an agent, stopping its sandbox first if it has one.
    ///
    /// A sandbox that fails to stop is logged; the agent is removed anyway.
    pub async fn unregister_agent(&self, agent_id: &str) -> Result<()> {
        self.ensure_open()?;
        let (_, _guard) = self.lock_agent(agent_id).await?;

        let Some((_, registered)) = self.agents.remove(agent_id) else {
            return Err(RuntimeError::AgentNotRegistered(agent_id.to_string()));
        };

        if let Some((_, Err(e))) = self.teardown_sandbox(agent_id).await {
            warn!(
                agent_id = %agent_id,
                error = %e,
                "Sandbox did not stop cleanly during unregistration, removing agent anyway"
            );
        }
        self.collector.remove_agent(agent_id);
        if let Err(e) = self.lifecycle.unregister_agent(agent_id) {
            warn!(agent_id = %agent_id, error = %e, "Lifecycle record missing during unregistration");
        }
        if let Some(forwarder) = registered.forwarder {
            forwarder.abort();
        }

        self.metrics.set_agents_registered(self.agents.len() as i64);
        info!(agent_id = %agent_id, "Agent unregistered");
        self.emit(RuntimeEvent::AgentUnregistered {
            agent_id: agent_id.to_string(),
        });

        Ok(())
    }

    /// Start the agent in a fresh sandbox.
    ///
    /// Without an explicit `allocation` the category default (or its
    /// configured override) is used. On failure the lifecycle moves to ERROR
    /// and nothing is left running.
    pub async fn start_agent(
        &self,
        agent_id: &str,
        allocation: Option<ResourceAllocation>,
    ) -> Result<()> {
        self.ensure_open()?;
        let (agent, _guard) = self.lock_agent(agent_id).await?;

        if self.sandboxes.contains_key(agent_id) {
            return Err(RuntimeError::AgentAlreadyRunning(agent_id.to_string()));
        }

        let allocation = allocation.unwrap_or_else(|| self.config.allocation_for(agent.category()));

        if let Err(e) = self.launch(agent_id, agent, allocation).await {
            error!(agent_id = %agent_id, error = %e, "Failed to start agent");
            self.record_status(agent_id, AgentStatus::Error, &e.to_string());
            self.emit(RuntimeEvent::AgentError {
                agent_id: agent_id.to_string(),
                message: e.to_string(),
            });
            return Err(e);
        }

        self.logger.log_agent_started(agent_id, &allocation);
        self.emit(RuntimeEvent::AgentStarted {
            agent_id: agent_id.to_string(),
            allocation,
        });

        Ok(())
    }

    async fn launch(
        &self,
        agent_id: &str,
        agent: Arc<dyn Agent>,
        allocation: ResourceAllocation,
    ) -> Result<()> {
        let sandbox = Arc::new(Sandbox::new(agent, allocation, self.config.sandbox.clone())?);
        let sandbox_events = sandbox.subscribe();
        sandbox.start().await?;

        let forwarder = tokio::spawn(forward_sandbox_events(
            sandbox_events,
            self.events.clone(),
            self.metrics.clone(),
            self.logger.clone(),
        ));
        self.sandboxes.insert(
            agent_id.to_string(),
            SandboxSlot {
                sandbox: sandbox.clone(),
                forwarder,
            },
        );
        self.collector.start_collecting(agent_id, sandbox);
        self.metrics.set_agents_running(self.sandboxes.len() as i64);

        if let Err(e) = self
            .lifecycle
            .advance_to(agent_id, AgentStatus::Running, Some("sandbox started"))
        {
            let _ = self.teardown_sandbox(agent_id).await;
            return Err(e);
        }

        Ok(())
    }

    /// Stop the agent's sandbox and return it to INACTIVE.
    ///
    /// A worker that does not acknowledge in time is abandoned; bookkeeping
    /// still completes before `WorkerUnavailable` is returned.
    pub async fn stop_agent(&self, agent_id: &str) -> Result<()> {
        self.ensure_open()?;
        let (_, _guard) = self.lock_agent(agent_id).await?;

        let Some((duration_ms, outcome)) = self.teardown_sandbox(agent_id).await else {
            return Err(RuntimeError::AgentNotRunning(agent_id.to_string()));
        };

        self.record_status(agent_id, AgentStatus::Inactive, "stopped");
        self.logger.log_agent_stopped(agent_id, duration_ms);
        self.emit(RuntimeEvent::AgentStopped {
            agent_id: agent_id.to_string(),
            duration_ms,
        });

        if let Err(e) = &outcome {
            warn!(agent_id = %agent_id, error = %e, "Sandbox worker abandoned during stop");
        }
        outcome
    }

    /// Run `input` through the agent's sandbox.
    ///
    /// The lifecycle is RUNNING for the duration of the call, then ACTIVE on
    /// success or ERROR on failure. If the agent is stopped while the call
    /// is in flight the outcome no longer touches its lifecycle.
    pub async fn execute_agent(&self, agent_id: &str, input: Value) -> Result<Value> {
        self.ensure_open()?;
        let (_, op_lock) = self.registered(agent_id)?;

        let sandbox = {
            let _guard = op_lock.read().await;
            let sandbox = self
                .sandbox(agent_id)
                .ok_or_else(|| RuntimeError::AgentNotRunning(agent_id.to_string()))?;
            self.lifecycle
                .advance_to(agent_id, AgentStatus::Running, Some("execution started"))?;
            sandbox
        };

        self.metrics.inc_executions();
        let started = Instant::now();
        let outcome = sandbox.execute(input).await;
        let elapsed = started.elapsed();
        self.metrics.observe_execution_latency(elapsed.as_secs_f64());

        let _guard = op_lock.read().await;
        let still_current = self
            .sandbox(agent_id)
            .is_some_and(|current| Arc::ptr_eq(&current, &sandbox));

        match outcome {
            Ok(output) => {
                if still_current {
                    self.record_status(agent_id, AgentStatus::Active, "execution completed");
                }
                self.emit(RuntimeEvent::AgentExecuted {
                    agent_id: agent_id.to_string(),
                    duration_ms: elapsed.as_millis() as u64,
                });
                Ok(output)
            }
            Err(e) => {
                self.metrics.inc_execution_errors();
                if e.is_timeout() {
                    self.metrics.inc_execution_timeouts();
                }
                if still_current {
                    self.record_status(agent_id, AgentStatus::Error, &e.to_string());
                }
                self.emit(RuntimeEvent::AgentError {
                    agent_id: agent_id.to_string(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Counts and usage totals across registered agents and running sandboxes
    pub fn runtime_stats(&self) -> RuntimeStats {
        let sandboxes = self.sandbox_list();
        let running = sandboxes.len();
        let healthy = sandboxes.iter().filter(|(_, s)| s.is_healthy()).count();

        let snapshots: Vec<ExecutionMetrics> = sandboxes.iter().map(|(_, s)| s.metrics()).collect();
        let total_memory = snapshots.iter().map(|m| m.memory_used_mb).sum::<f64>();
        let total_cpu = snapshots.iter().map(|m| m.cpu_used_percent).sum::<f64>();

        RuntimeStats {
            total_agents: self.agents.len(),
            running_agents: running,
            healthy_agents: healthy,
            unhealthy_agents: running - healthy,
            total_memory_usage_mb: total_memory,
            average_cpu_usage_percent: if running > 0 {
                total_cpu / running as f64
            } else {
                0.0
            },
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
        }
    }

    /// Probe every running sandbox concurrently.
    ///
    /// One sandbox failing its probe, or panicking while being probed, only
    /// marks that entry unhealthy.
    pub async fn perform_health_check(&self) -> Vec<HealthCheckEntry> {
        let sandboxes = self.sandbox_list();

        let checks = sandboxes.iter().map(|(agent_id, sandbox)| async move {
            match AssertUnwindSafe(sandbox.probe()).catch_unwind().await {
                Ok(Ok(health)) => HealthCheckEntry {
                    agent_id: agent_id.clone(),
                    healthy: health.healthy,
                    resource_usage: Some(health.resource_usage),
                    metrics: Some(health.metrics),
                    error: None,
                },
                Ok(Err(e)) => HealthCheckEntry::failed(agent_id, e.to_string()),
                Err(_) => HealthCheckEntry::failed(agent_id, "health check panicked"),
            }
        });

        let mut results = join_all(checks).await;
        results.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

        let unhealthy = results.iter().filter(|r| !r.healthy).count();
        for _ in 0..unhealthy {
            self.metrics.inc_health_check_failures();
        }
        self.logger.log_health_check(results.len(), unhealthy);
        self.emit(RuntimeEvent::HealthCheckCompleted {
            results: results.clone(),
        });

        results
    }

    /// Stop every sandbox and shut down the owned components.
    ///
    /// Returns `None` when the runtime was already shut down.
    pub async fn shutdown(&self) -> Option<ShutdownReport> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("Runtime already shut down");
            return None;
        }

        info!(running = self.sandboxes.len(), "Shutting down runtime");
        if self.shutdown_tx.send(()).is_err() {
            debug!("Health check loop already stopped");
        }

        let agents: Vec<(String, Arc<RwLock<()>>)> = self
            .agents
            .iter()
            .map(|a| (a.key().clone(), a.op_lock.clone()))
            .collect();

        let stops = agents.into_iter().map(|(agent_id, op_lock)| async move {
            let _guard = op_lock.write().await;
            let outcome = self.teardown_sandbox(&agent_id).await;
            (agent_id, outcome)
        });

        let mut report = ShutdownReport::default();
        for (agent_id, outcome) in join_all(stops).await {
            match outcome {
                None => {}
                Some((_, Ok(()))) => report.stopped.push(agent_id),
                Some((_, Err(e))) => {
                    warn!(agent_id = %agent_id, error = %e, "Sandbox did not stop cleanly");
                    report.failed.push(ShutdownFailure {
                        agent_id,
                        error: e.to_string(),
                    });
                }
            }
        }
        report.stopped.sort();
        report.failed.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

        self.collector.shutdown();
        self.lifecycle.shutdown();

        for registered in self.agents.iter() {
            if let Some(forwarder) = &registered.forwarder {
                forwarder.abort();
            }
        }
        self.agents.clear();
        self.metrics.set_agents_registered(0);
        self.metrics.set_agents_running(0);

        self.logger
            .log_shutdown("requested", report.stopped.len(), report.failed.len());
        self.emit(RuntimeEvent::ShutdownCompleted(report.clone()));

        Some(report)
    }

    pub fn is_running(&self, agent_id: &str) -> bool {
        self.sandboxes.contains_key(agent_id)
    }

    pub fn running_agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self.sandboxes.iter().map(|s| s.key().clone()).collect();
        agents.sort();
        agents
    }

    pub fn registered_agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self.agents.iter().map(|a| a.key().clone()).collect();
        agents.sort();
        agents
    }

    pub fn agent(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(agent_id).map(|a| a.agent.clone())
    }

    /// Live metrics of a running agent
    pub fn agent_metrics(&self, agent_id: &str) -> Option<ExecutionMetrics> {
        self.sandbox(agent_id).map(|s| s.metrics())
    }

    pub fn agent_resource_usage(&self, agent_id: &str) -> Option<ResourceUsage> {
        self.sandbox(agent_id).map(|s| s.resource_usage())
    }

    fn registered(&self, agent_id: &str) -> Result<(Arc<dyn Agent>, Arc<RwLock<()>>)> {
        self.agents
            .get(agent_id)
            .map(|a| (a.agent.clone(), a.op_lock.clone()))
            .ok_or_else(|| RuntimeError::AgentNotRegistered(agent_id.to_string()))
    }

    /// Take the agent's operation lock, then confirm the runtime is still
    /// open and the agent still registered
    async fn lock_agent(
        &self,
        agent_id: &str,
    ) -> Result<(Arc<dyn Agent>, OwnedRwLockWriteGuard<()>)> {
        let (agent, op_lock) = self.registered(agent_id)?;
        let guard = op_lock.write_owned().await;

        self.ensure_open()?;
        if !self.agents.contains_key(agent_id) {
            return Err(RuntimeError::AgentNotRegistered(agent_id.to_string()));
        }
        Ok((agent, guard))
    }

    fn sandbox(&self, agent_id: &str) -> Option<Arc<Sandbox>> {
        self.sandboxes.get(agent_id).map(|s| s.sandbox.clone())
    }

    /// Running sandboxes, cloned out so no map guard outlives the call
    fn sandbox_list(&self) -> Vec<(String, Arc<Sandbox>)> {
        self.sandboxes
            .iter()
            .map(|s| (s.key().clone(), s.sandbox.clone()))
            .collect()
    }

    /// Remove and stop the agent's sandbox; `None` when it had none
    async fn teardown_sandbox(&self, agent_id: &str) -> Option<(Option<u64>, Result<()>)> {
        let (_, slot) = self.sandboxes.remove(agent_id)?;
        self.metrics.set_agents_running(self.sandboxes.len() as i64);
        self.collector.stop_collecting(agent_id);

        let outcome = slot.sandbox.stop().await;
        slot.forwarder.abort();

        Some((slot.sandbox.metrics().duration_ms, outcome))
    }

    fn record_status(&self, agent_id: &str, status: AgentStatus, reason: &str) {
        if let Err(e) = self.lifecycle.advance_to(agent_id, status, Some(reason)) {
            warn!(
                agent_id = %agent_id,
                status = %status,
                error = %e,
                "Failed to record lifecycle status"
            );
        }
    }
}

async fn health_check_loop(
    manager: Weak<RuntimeManager>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.perform_health_check().await;
            }
            _ = shutdown.recv() => {
                info!("Health check loop received shutdown signal");
                break;
            }
        }
    }
}

async fn forward_agent_events(
    agent_id: String,
    mut agent_events: broadcast::Receiver<AgentEvent>,
    events: broadcast::Sender<RuntimeEvent>,
) {
    loop {
        let event = match agent_events.recv().await {
            Ok(AgentEvent::Error { message }) => RuntimeEvent::AgentError {
                agent_id: agent_id.clone(),
                message,
            },
            Ok(AgentEvent::ConfigChanged { config }) => RuntimeEvent::AgentConfigChanged {
                agent_id: agent_id.clone(),
                config,
            },
            Err(RecvError::Lagged(skipped)) => {
                warn!(agent_id = %agent_id, skipped, "Agent event forwarder lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let _ = events.send(event);
    }
}

async fn forward_sandbox_events(
    mut sandbox_events: broadcast::Receiver<SandboxEvent>,
    events: broadcast::Sender<RuntimeEvent>,
    metrics: RuntimeMetrics,
    logger: StructuredLogger,
) {
    loop {
        match sandbox_events.recv().await {
            Ok(SandboxEvent::ResourceLimitExceeded { agent_id, usage }) => {
                metrics.inc_resource_limit_exceeded();
                logger.log_resource_limit_exceeded(&agent_id, &usage);
                let _ = events.send(RuntimeEvent::ResourceLimitExceeded { agent_id, usage });
            }
            Ok(SandboxEvent::WorkerExited { agent_id }) => {
                let _ = events.send(RuntimeEvent::AgentError {
                    agent_id,
                    message: "sandbox worker exited unexpectedly".to_string(),
                });
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Sandbox event forwarder lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
