//! runtimed - agent runtime daemon
//!
//! Hosts the agents declared in configuration inside isolated sandboxes and
//! exposes health, readiness and Prometheus metrics over HTTP.

use anyhow::Result;
use runtime_lib::{
    agent::EchoAgent,
    health::{Component, ComponentHealth, HealthRegistry},
    observability::{RuntimeMetrics, StructuredLogger},
    runtime::RuntimeManager,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const RUNTIME_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting runtimed");

    // Load configuration
    let config = config::DaemonConfig::load()?;
    info!(
        node_name = %config.node_name,
        agents = config.agents.len(),
        "Daemon configured"
    );

    let health_registry = HealthRegistry::new();
    let metrics = RuntimeMetrics::new();
    let logger = StructuredLogger::new(&config.node_name);

    let runtime = RuntimeManager::new(config.runtime_config());
    let health_handle = tokio::spawn(health_registry.clone().watch(
        runtime.subscribe(),
        runtime.lifecycle().subscribe(),
        runtime.metrics_collector().subscribe(),
    ));

    for declared in &config.agents {
        runtime.register_agent(Arc::new(EchoAgent::new(&declared.id, declared.category)))?;

        if declared.autostart {
            if let Err(e) = runtime.start_agent(&declared.id, None).await {
                error!(agent_id = %declared.id, error = %e, "Failed to start agent");
                health_registry
                    .update(
                        Component::Runtime,
                        ComponentHealth::degraded(format!("agent {} failed to start", declared.id)),
                    )
                    .await;
            }
        }
    }
    logger.log_startup(RUNTIME_VERSION, config.agents.len());

    // Create shared application state
    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));

    // Mark the daemon ready once configured agents are in place
    health_registry.set_ready(true).await;

    // Start health and metrics server
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("SIGINT received, shutting down");
    health_registry.set_ready(false).await;

    if let Some(report) = runtime.shutdown().await {
        for failure in &report.failed {
            warn!(agent_id = %failure.agent_id, error = %failure.error, "Agent did not stop cleanly");
        }
    }

    api_handle.abort();
    health_handle.abort();

    Ok(())
}
