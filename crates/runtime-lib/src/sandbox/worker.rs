//! Sandbox worker thread
//!
//! Each worker owns one agent handle on a dedicated OS thread driving its own
//! single-threaded runtime. The host reaches it only through [`WorkerRequest`]
//! messages and reads usage back through [`WorkerReport`]s.

use crate::agent::{Agent, AgentMetrics};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

/// Task id of health checks; request ids start at 1
const HEALTH_CHECK_TASK: u64 = 0;

/// Outcome sent back across the boundary; errors are plain messages
pub(crate) type Reply<T> = oneshot::Sender<std::result::Result<T, String>>;

pub(crate) enum WorkerRequest {
    Initialize {
        id: u64,
        config: Value,
        reply: Reply<()>,
    },
    Execute {
        id: u64,
        input: Value,
        reply: Reply<Value>,
    },
    /// Abort an in-flight request; unknown ids are ignored
    Cancel { id: u64 },
    /// Answered with the agent's own health verdict; a panic counts as unhealthy
    Ping { reply: oneshot::Sender<bool> },
    /// Abort all in-flight work, run cleanup, then exit
    Shutdown { reply: oneshot::Sender<()> },
}

pub(crate) enum WorkerReport {
    Usage(AgentMetrics),
}

/// Host-side handle to a running worker thread
pub(crate) struct WorkerHandle {
    requests: mpsc::UnboundedSender<WorkerRequest>,
    thread: thread::JoinHandle<()>,
}

impl WorkerHandle {
    pub fn spawn(
        agent_id: &str,
        agent: Arc<dyn Agent>,
        sample_interval: Duration,
        reports: mpsc::Sender<WorkerReport>,
    ) -> std::io::Result<Self> {
        let (requests, inbox) = mpsc::unbounded_channel();
        let name = format!("sandbox-{}", agent_id);
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(name, agent, inbox, reports, sample_interval))?;

        Ok(Self { requests, thread })
    }

    /// Queue a request; false when the worker is gone
    pub fn send(&self, request: WorkerRequest) -> bool {
        self.requests.send(request).is_ok()
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<WorkerRequest> {
        self.requests.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Ask the worker to exit and wait at most `timeout` for the acknowledgement.
    ///
    /// Returns false when the worker did not answer in time; the thread is
    /// abandoned in that case.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        let (reply, ack) = oneshot::channel();
        if !self.send(WorkerRequest::Shutdown { reply }) {
            // Worker already exited
            return true;
        }

        match tokio::time::timeout(timeout, ack).await {
            Ok(_) => true,
            Err(_) => {
                warn!(
                    worker = ?self.thread.thread().name(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Sandbox worker did not acknowledge shutdown, abandoning thread"
                );
                false
            }
        }
    }
}

fn run(
    name: String,
    agent: Arc<dyn Agent>,
    inbox: mpsc::UnboundedReceiver<WorkerRequest>,
    reports: mpsc::Sender<WorkerReport>,
    sample_interval: Duration,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(worker = %name, error = %e, "Failed to build sandbox runtime");
            return;
        }
    };

    runtime.block_on(serve(agent, inbox, reports, sample_interval));
    debug!(worker = %name, "Sandbox worker exited");
}

async fn serve(
    agent: Arc<dyn Agent>,
    mut inbox: mpsc::UnboundedReceiver<WorkerRequest>,
    reports: mpsc::Sender<WorkerReport>,
    sample_interval: Duration,
) {
    let mut tasks: JoinSet<u64> = JoinSet::new();
    let mut in_flight: HashMap<u64, AbortHandle> = HashMap::new();
    let mut ticker = tokio::time::interval(sample_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            request = inbox.recv() => {
                let Some(request) = request else {
                    // Host dropped its handle
                    break;
                };

                match request {
                    WorkerRequest::Initialize { id, config, reply } => {
                        let agent = agent.clone();
                        let handle = tasks.spawn(async move {
                            let outcome = guarded(agent.initialize(config)).await;
                            let _ = reply.send(outcome);
                            id
                        });
                        in_flight.insert(id, handle);
                    }
                    WorkerRequest::Execute { id, input, reply } => {
                        let agent = agent.clone();
                        let handle = tasks.spawn(async move {
                            let outcome = guarded(agent.execute(input)).await;
                            let _ = reply.send(outcome);
                            id
                        });
                        in_flight.insert(id, handle);
                    }
                    WorkerRequest::Cancel { id } => {
                        if let Some(handle) = in_flight.remove(&id) {
                            handle.abort();
                            debug!(request_id = id, "Cancelled in-flight request");
                        }
                    }
                    WorkerRequest::Ping { reply } => {
                        let agent = agent.clone();
                        tasks.spawn(async move {
                            let healthy = AssertUnwindSafe(agent.health_check())
                                .catch_unwind()
                                .await
                                .unwrap_or(false);
                            let _ = reply.send(healthy);
                            HEALTH_CHECK_TASK
                        });
                    }
                    WorkerRequest::Shutdown { reply } => {
                        tasks.shutdown().await;
                        in_flight.clear();
                        if let Err(e) = guarded(agent.cleanup()).await {
                            warn!(agent_id = %agent.id(), error = %e, "Agent cleanup failed");
                        }
                        let _ = reply.send(());
                        break;
                    }
                }
            }
            Some(finished) = tasks.join_next(), if !tasks.is_empty() => {
                if let Ok(id) = finished {
                    in_flight.remove(&id);
                }
            }
            _ = ticker.tick() => {
                // Not guarded: an agent that panics while reporting usage takes the
                // worker down with it, which the host observes as a dead worker.
                let usage = agent.metrics();
                let _ = reports.try_send(WorkerReport::Usage(usage));
            }
        }
    }

    tasks.shutdown().await;
}

/// Run an agent future, turning errors and panics into messages
async fn guarded<T, F>(future: F) -> std::result::Result<T, String>
where
    F: std::future::Future<Output = anyhow::Result<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => Err(panic_message(payload)),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let detail = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    format!("agent panicked: {}", detail)
}
