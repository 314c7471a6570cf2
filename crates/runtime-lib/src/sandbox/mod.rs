//! Sandboxed execution of a single agent
//!
//! A [`Sandbox`] pairs one agent with its resource allocation and runs the
//! agent's code on an isolated worker. Everything that crosses the boundary is
//! an explicit request with a bounded wait:
//!
//! - `start` waits for the worker to acknowledge initialization
//! - `execute` waits at most the allocation's `timeout_seconds`
//! - `stop` waits at most `stop_timeout` before abandoning the worker
//!
//! The worker samples the agent's self-reported usage on a fixed interval.
//! Samples above the hard ceiling are published as
//! [`SandboxEvent::ResourceLimitExceeded`]; the softer threshold only feeds
//! [`Sandbox::is_healthy`].

mod worker;

use crate::agent::Agent;
use crate::error::{Result, RuntimeError};
use crate::metrics::MetricsSource;
use crate::models::{ExecutionMetrics, ResourceAllocation, ResourceUsage};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use worker::{WorkerHandle, WorkerReport, WorkerRequest};

/// Usage samples buffered between the worker and the host monitor
const REPORT_BUFFER: usize = 16;

/// Error share above which a sandbox is reported unhealthy
const MAX_ERROR_RATE: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Time allowed for the agent to acknowledge initialization
    pub init_timeout: Duration,
    /// Time allowed for the worker to acknowledge shutdown
    pub stop_timeout: Duration,
    /// How often the worker samples the agent's usage
    pub sample_interval: Duration,
    /// Abort the in-flight execution when its deadline expires
    pub cancel_on_timeout: bool,
    /// Usage percentage above which the sandbox is unhealthy
    pub soft_limit_percent: f64,
    /// Usage percentage above which a limit event is published
    pub hard_limit_percent: f64,
    /// Time allowed for the worker to answer a liveness probe
    pub probe_timeout: Duration,
    pub event_capacity: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(5),
            sample_interval: Duration::from_secs(1),
            cancel_on_timeout: false,
            soft_limit_percent: 90.0,
            hard_limit_percent: 95.0,
            probe_timeout: Duration::from_secs(2),
            event_capacity: 64,
        }
    }
}

/// Notifications published by a sandbox
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxEvent {
    Started {
        agent_id: String,
    },
    Stopped {
        agent_id: String,
        duration_ms: Option<u64>,
    },
    ResourceLimitExceeded {
        agent_id: String,
        usage: ResourceUsage,
    },
    /// The worker thread ended while the sandbox was still running
    WorkerExited {
        agent_id: String,
    },
}

/// Point-in-time health of a running sandbox
#[derive(Debug, Clone, Serialize)]
pub struct SandboxHealth {
    pub healthy: bool,
    pub resource_usage: ResourceUsage,
    pub metrics: ExecutionMetrics,
}

/// One agent running behind an isolation boundary
pub struct Sandbox {
    agent_id: String,
    agent: Arc<dyn Agent>,
    allocation: ResourceAllocation,
    config: SandboxConfig,
    metrics: Arc<RwLock<ExecutionMetrics>>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<WorkerHandle>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    /// Serializes start and stop
    transition: tokio::sync::Mutex<()>,
    next_request: AtomicU64,
    events: broadcast::Sender<SandboxEvent>,
}

impl Sandbox {
    pub fn new(
        agent: Arc<dyn Agent>,
        allocation: ResourceAllocation,
        config: SandboxConfig,
    ) -> Result<Self> {
        allocation.validate()?;
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        Ok(Self {
            agent_id: agent.id().to_string(),
            agent,
            allocation,
            config,
            metrics: Arc::new(RwLock::new(ExecutionMetrics::new(Utc::now()))),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            monitor: Mutex::new(None),
            transition: tokio::sync::Mutex::new(()),
            next_request: AtomicU64::new(1),
            events,
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn allocation(&self) -> &ResourceAllocation {
        &self.allocation
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SandboxEvent> {
        self.events.subscribe()
    }

    /// Spawn the worker and wait for the agent to initialize
    pub async fn start(&self) -> Result<()> {
        let _guard = self.transition.lock().await;
        if self.is_running() {
            return Err(RuntimeError::SandboxAlreadyRunning(self.agent_id.clone()));
        }

        let (report_tx, report_rx) = mpsc::channel(REPORT_BUFFER);
        let worker = WorkerHandle::spawn(
            &self.agent_id,
            self.agent.clone(),
            self.config.sample_interval,
            report_tx,
        )
        .map_err(|e| RuntimeError::InitFailed {
            agent_id: self.agent_id.clone(),
            message: format!("failed to spawn worker thread: {}", e),
        })?;

        *self.metrics.write() = ExecutionMetrics::new(Utc::now());

        if let Err(e) = self.initialize(&worker).await {
            warn!(agent_id = %self.agent_id, error = %e, "Sandbox initialization failed");
            worker.shutdown(self.config.stop_timeout).await;
            return Err(e);
        }

        self.running.store(true, Ordering::SeqCst);
        let monitor = tokio::spawn(monitor_usage(
            self.agent_id.clone(),
            self.allocation,
            self.config.hard_limit_percent,
            self.metrics.clone(),
            self.running.clone(),
            self.events.clone(),
            report_rx,
        ));
        *self.monitor.lock() = Some(monitor);
        *self.worker.lock() = Some(worker);

        info!(
            agent_id = %self.agent_id,
            memory_mb = self.allocation.memory_mb,
            timeout_seconds = self.allocation.timeout_seconds,
            "Sandbox started"
        );
        let _ = self.events.send(SandboxEvent::Started {
            agent_id: self.agent_id.clone(),
        });

        Ok(())
    }

    async fn initialize(&self, worker: &WorkerHandle) -> Result<()> {
        let payload = json!({
            "agent_id": self.agent_id,
            "allocation": self.allocation,
        });
        let (reply, outcome) = oneshot::channel();
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);

        let init_failed = |message: String| RuntimeError::InitFailed {
            agent_id: self.agent_id.clone(),
            message,
        };

        if !worker.send(WorkerRequest::Initialize {
            id,
            config: payload,
            reply,
        }) {
            return Err(init_failed("worker exited before initialization".into()));
        }

        match tokio::time::timeout(self.config.init_timeout, outcome).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(message))) => Err(init_failed(message)),
            Ok(Err(_)) => Err(init_failed("worker exited during initialization".into())),
            Err(_) => Err(RuntimeError::InitTimeout {
                agent_id: self.agent_id.clone(),
                timeout_secs: self.config.init_timeout.as_secs_f64(),
            }),
        }
    }

    /// Tear down the worker and finalize metrics; no-op when not running.
    ///
    /// Fails with `WorkerUnavailable` when the worker did not acknowledge
    /// shutdown in time. The sandbox is stopped either way.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.transition.lock().await;
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }

        let worker = self.worker.lock().take();
        let acknowledged = match worker {
            Some(worker) => worker.shutdown(self.config.stop_timeout).await,
            None => true,
        };

        let duration_ms = {
            let mut metrics = self.metrics.write();
            metrics.finalize(Utc::now());
            metrics.duration_ms
        };

        info!(agent_id = %self.agent_id, duration_ms = ?duration_ms, "Sandbox stopped");
        let _ = self.events.send(SandboxEvent::Stopped {
            agent_id: self.agent_id.clone(),
            duration_ms,
        });

        if acknowledged {
            Ok(())
        } else {
            Err(RuntimeError::WorkerUnavailable(self.agent_id.clone()))
        }
    }

    /// Send `input` to the agent and wait for its result.
    ///
    /// The wait is bounded by the allocation's timeout. An expired deadline
    /// leaves the sandbox running; the in-flight work keeps going unless
    /// `cancel_on_timeout` is set.
    pub async fn execute(&self, input: Value) -> Result<Value> {
        let requests = self.requests()?;
        let deadline = self.allocation.timeout()?;

        self.metrics.write().network_requests += 1;
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (reply, outcome) = oneshot::channel();

        if requests
            .send(WorkerRequest::Execute { id, input, reply })
            .is_err()
        {
            self.record_error();
            return Err(RuntimeError::WorkerUnavailable(self.agent_id.clone()));
        }

        match tokio::time::timeout(deadline, outcome).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => {
                self.record_error();
                Err(RuntimeError::ExecutionFailed {
                    agent_id: self.agent_id.clone(),
                    message,
                })
            }
            Ok(Err(_)) => {
                self.record_error();
                Err(RuntimeError::WorkerUnavailable(self.agent_id.clone()))
            }
            Err(_) => {
                self.record_error();
                if self.config.cancel_on_timeout {
                    let _ = requests.send(WorkerRequest::Cancel { id });
                }
                warn!(
                    agent_id = %self.agent_id,
                    timeout_seconds = self.allocation.timeout_seconds,
                    cancelled = self.config.cancel_on_timeout,
                    "Execution timed out"
                );
                Err(RuntimeError::ExecutionTimeout {
                    agent_id: self.agent_id.clone(),
                    timeout_secs: self.allocation.timeout_seconds,
                })
            }
        }
    }

    fn requests(&self) -> Result<mpsc::UnboundedSender<WorkerRequest>> {
        self.worker
            .lock()
            .as_ref()
            .filter(|_| self.is_running())
            .map(|worker| worker.sender())
            .ok_or_else(|| RuntimeError::SandboxNotRunning(self.agent_id.clone()))
    }

    fn record_error(&self) {
        self.metrics.write().error_count += 1;
    }

    pub fn metrics(&self) -> ExecutionMetrics {
        self.metrics.read().clone()
    }

    /// Usage against the allocation; uptime stops at `end_time` once stopped
    pub fn resource_usage(&self) -> ResourceUsage {
        let metrics = self.metrics();
        let now = metrics.end_time.unwrap_or_else(Utc::now);
        ResourceUsage::compute(&metrics, &self.allocation, now)
    }

    fn worker_alive(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map(|worker| !worker.is_finished())
            .unwrap_or(false)
    }

    pub fn is_healthy(&self) -> bool {
        self.is_running() && self.worker_alive() && self.verdict(&self.metrics())
    }

    fn verdict(&self, metrics: &ExecutionMetrics) -> bool {
        let usage = ResourceUsage::compute(metrics, &self.allocation, Utc::now());
        if usage.exceeds(self.config.soft_limit_percent) {
            return false;
        }

        let error_rate = metrics.error_count as f64 / metrics.network_requests.max(1) as f64;
        error_rate <= MAX_ERROR_RATE
    }

    /// Health read that fails when the sandbox cannot report
    pub fn health_snapshot(&self) -> Result<SandboxHealth> {
        if !self.is_running() {
            return Err(RuntimeError::SandboxNotRunning(self.agent_id.clone()));
        }
        if !self.worker_alive() {
            return Err(RuntimeError::WorkerUnavailable(self.agent_id.clone()));
        }

        let metrics = self.metrics();
        Ok(SandboxHealth {
            healthy: self.verdict(&metrics),
            resource_usage: ResourceUsage::compute(&metrics, &self.allocation, Utc::now()),
            metrics,
        })
    }

    /// Health snapshot confirmed by a round trip to the worker.
    ///
    /// The agent's own `health_check` verdict is folded into `healthy`.
    /// Fails with `WorkerUnavailable` when the worker is gone or does not
    /// answer within `probe_timeout`.
    pub async fn probe(&self) -> Result<SandboxHealth> {
        let snapshot = self.health_snapshot()?;
        let requests = self.requests()?;
        let (reply, pong) = oneshot::channel();

        if requests.send(WorkerRequest::Ping { reply }).is_err() {
            return Err(RuntimeError::WorkerUnavailable(self.agent_id.clone()));
        }

        match tokio::time::timeout(self.config.probe_timeout, pong).await {
            Ok(Ok(agent_healthy)) => Ok(SandboxHealth {
                healthy: snapshot.healthy && agent_healthy,
                ..snapshot
            }),
            _ => Err(RuntimeError::WorkerUnavailable(self.agent_id.clone())),
        }
    }
}

impl MetricsSource for Sandbox {
    fn metrics(&self) -> ExecutionMetrics {
        Sandbox::metrics(self)
    }

    fn resource_usage(&self) -> ResourceUsage {
        Sandbox::resource_usage(self)
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.get_mut().take() {
            monitor.abort();
        }
        // Dropping the worker handle closes its request channel, which ends the thread
        if self.worker.get_mut().take().is_some() {
            debug!(agent_id = %self.agent_id, "Dropped sandbox with a live worker");
        }
    }
}

/// Fold worker usage reports into the live metrics
async fn monitor_usage(
    agent_id: String,
    allocation: ResourceAllocation,
    hard_limit_percent: f64,
    metrics: Arc<RwLock<ExecutionMetrics>>,
    running: Arc<AtomicBool>,
    events: broadcast::Sender<SandboxEvent>,
    mut reports: mpsc::Receiver<WorkerReport>,
) {
    while let Some(report) = reports.recv().await {
        match report {
            WorkerReport::Usage(usage) => {
                let snapshot = {
                    let mut metrics = metrics.write();
                    metrics.memory_used_mb = usage.memory_used_mb;
                    metrics.cpu_used_percent = usage.cpu_used_percent;
                    metrics.clone()
                };

                let usage = ResourceUsage::compute(&snapshot, &allocation, Utc::now());
                if usage.exceeds(hard_limit_percent) {
                    warn!(
                        agent_id = %agent_id,
                        memory_usage_percent = usage.memory_usage_percent,
                        cpu_usage_percent = usage.cpu_usage_percent,
                        "Resource limit exceeded"
                    );
                    let _ = events.send(SandboxEvent::ResourceLimitExceeded {
                        agent_id: agent_id.clone(),
                        usage,
                    });
                }
            }
        }
    }

    if running.load(Ordering::SeqCst) {
        warn!(agent_id = %agent_id, "Sandbox worker exited unexpectedly");
        let _ = events.send(SandboxEvent::WorkerExited { agent_id });
    }
}
