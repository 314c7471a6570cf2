//! Agent runtime library
//!
//! This crate provides the core functionality for:
//! - Running pluggable agents behind an isolated sandbox worker
//! - Lifecycle status tracking with hooks and reports
//! - Per-agent metrics history, trends and leak analysis
//! - Health checks and observability

pub mod agent;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod metrics;
pub mod models;
pub mod observability;
pub mod runtime;
pub mod sandbox;

pub use agent::{Agent, AgentEvent, AgentMetrics, EchoAgent};
pub use error::{Result, RuntimeError};
pub use health::{
    Component, ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse,
    ReadinessResponse,
};
pub use lifecycle::{AgentStatus, LifecycleConfig, LifecycleEvent, LifecycleManager};
pub use metrics::{CollectorConfig, MetricsCollector, MetricsEvent, MetricsReport};
pub use models::*;
pub use observability::{RuntimeMetrics, StructuredLogger};
pub use runtime::{
    HealthCheckEntry, RuntimeConfig, RuntimeEvent, RuntimeManager, RuntimeStats, ShutdownReport,
};
pub use sandbox::{Sandbox, SandboxConfig, SandboxEvent, SandboxHealth};
