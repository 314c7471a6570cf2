//! Core data models for the agent runtime

use crate::error::{Result, RuntimeError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Closed set of agent categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentCategory {
    DataCollection,
    ContentGeneration,
    Publishing,
    Validation,
    Work,
}

impl AgentCategory {
    pub const ALL: [AgentCategory; 5] = [
        AgentCategory::DataCollection,
        AgentCategory::ContentGeneration,
        AgentCategory::Publishing,
        AgentCategory::Validation,
        AgentCategory::Work,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentCategory::DataCollection => "data_collection",
            AgentCategory::ContentGeneration => "content_generation",
            AgentCategory::Publishing => "publishing",
            AgentCategory::Validation => "validation",
            AgentCategory::Work => "work",
        }
    }
}

impl fmt::Display for AgentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable identity of a registered agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub id: String,
    pub name: String,
    pub category: AgentCategory,
    pub version: String,
    pub description: String,
}

/// Declared resource limits for one agent run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub memory_mb: f64,
    pub cpu_cores: f64,
    pub timeout_seconds: f64,
    pub storage_mb: f64,
}

impl ResourceAllocation {
    pub fn new(memory_mb: f64, cpu_cores: f64, timeout_seconds: f64, storage_mb: f64) -> Self {
        Self {
            memory_mb,
            cpu_cores,
            timeout_seconds,
            storage_mb,
        }
    }

    /// Built-in default allocation for a category
    pub fn for_category(category: AgentCategory) -> Self {
        match category {
            AgentCategory::ContentGeneration => Self::new(1024.0, 2.0, 600.0, 500.0),
            AgentCategory::DataCollection => Self::new(512.0, 1.0, 300.0, 1024.0),
            AgentCategory::Publishing => Self::new(256.0, 0.5, 120.0, 100.0),
            AgentCategory::Validation => Self::new(256.0, 0.5, 60.0, 50.0),
            AgentCategory::Work => Self::new(256.0, 0.5, 300.0, 100.0),
        }
    }

    /// All four limits must be finite and positive
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("memory_mb", self.memory_mb),
            ("cpu_cores", self.cpu_cores),
            ("timeout_seconds", self.timeout_seconds),
            ("storage_mb", self.storage_mb),
        ];

        for (name, value) in fields {
            if !value.is_finite() || value <= 0.0 {
                return Err(RuntimeError::InvalidAllocation(format!(
                    "{} must be finite and positive, got {}",
                    name, value
                )));
            }
        }

        self.timeout().map(|_| ())
    }

    /// Execution deadline derived from `timeout_seconds`
    pub fn timeout(&self) -> Result<Duration> {
        Duration::try_from_secs_f64(self.timeout_seconds).map_err(|_| {
            RuntimeError::InvalidAllocation(format!(
                "timeout_seconds is not a representable duration, got {}",
                self.timeout_seconds
            ))
        })
    }

    /// CPU ceiling in percentage space (one core = 100)
    pub fn cpu_limit_percent(&self) -> f64 {
        self.cpu_cores * 100.0
    }
}

/// Live execution metrics of one sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub memory_used_mb: f64,
    pub cpu_used_percent: f64,
    pub network_requests: u64,
    pub error_count: u64,
}

impl ExecutionMetrics {
    pub fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            start_time,
            end_time: None,
            duration_ms: None,
            memory_used_mb: 0.0,
            cpu_used_percent: 0.0,
            network_requests: 0,
            error_count: 0,
        }
    }

    /// Stamp end time and duration
    pub fn finalize(&mut self, end_time: DateTime<Utc>) {
        self.end_time = Some(end_time);
        self.duration_ms = Some(millis_between(self.start_time, end_time));
    }
}

/// Derived, read-only view of resource consumption against the allocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_used: f64,
    pub memory_limit: f64,
    pub memory_usage_percent: f64,
    pub cpu_used: f64,
    pub cpu_limit: f64,
    pub cpu_usage_percent: f64,
    pub uptime_ms: u64,
}

impl ResourceUsage {
    pub fn compute(
        metrics: &ExecutionMetrics,
        allocation: &ResourceAllocation,
        now: DateTime<Utc>,
    ) -> Self {
        let memory_limit = allocation.memory_mb;
        let cpu_limit = allocation.cpu_limit_percent();

        Self {
            memory_used: metrics.memory_used_mb,
            memory_limit,
            memory_usage_percent: metrics.memory_used_mb / memory_limit * 100.0,
            cpu_used: metrics.cpu_used_percent,
            cpu_limit,
            cpu_usage_percent: metrics.cpu_used_percent / cpu_limit * 100.0,
            uptime_ms: millis_between(metrics.start_time, now),
        }
    }

    /// Whether memory or cpu usage is strictly above `percent`
    pub fn exceeds(&self, percent: f64) -> bool {
        self.memory_usage_percent > percent || self.cpu_usage_percent > percent
    }
}

/// Non-negative milliseconds from `from` to `to`
pub fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    u64::try_from((to - from).num_milliseconds()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_defaults_are_valid() {
        for category in AgentCategory::ALL {
            assert!(ResourceAllocation::for_category(category).validate().is_ok());
        }

        let generation = ResourceAllocation::for_category(AgentCategory::ContentGeneration);
        let validation = ResourceAllocation::for_category(AgentCategory::Validation);
        assert!(generation.memory_mb > validation.memory_mb);
        assert!(generation.timeout_seconds > validation.timeout_seconds);
    }

    #[test]
    fn test_allocation_validation() {
        let valid = ResourceAllocation::new(256.0, 0.5, 300.0, 100.0);
        assert!(valid.validate().is_ok());

        let zero_memory = ResourceAllocation {
            memory_mb: 0.0,
            ..valid
        };
        assert!(matches!(
            zero_memory.validate(),
            Err(RuntimeError::InvalidAllocation(_))
        ));

        let infinite_cpu = ResourceAllocation {
            cpu_cores: f64::INFINITY,
            ..valid
        };
        assert!(infinite_cpu.validate().is_err());

        let nan_timeout = ResourceAllocation {
            timeout_seconds: f64::NAN,
            ..valid
        };
        assert!(nan_timeout.validate().is_err());

        let huge_timeout = ResourceAllocation {
            timeout_seconds: 1e20,
            ..valid
        };
        assert!(matches!(
            huge_timeout.validate(),
            Err(RuntimeError::InvalidAllocation(_))
        ));
        assert!(huge_timeout.timeout().is_err());
        assert_eq!(valid.timeout().unwrap(), Duration::from_secs(300));
    }

    #[test]
    fn test_resource_usage_invariants() {
        let start = Utc::now();
        let mut metrics = ExecutionMetrics::new(start);
        metrics.memory_used_mb = 128.0;
        metrics.cpu_used_percent = 25.0;

        let allocation = ResourceAllocation::new(256.0, 0.5, 300.0, 100.0);
        let usage =
            ResourceUsage::compute(&metrics, &allocation, start + chrono::Duration::seconds(2));

        assert_eq!(usage.cpu_limit, 50.0);
        assert_eq!(usage.memory_usage_percent, usage.memory_used / usage.memory_limit * 100.0);
        assert_eq!(usage.memory_usage_percent, 50.0);
        assert_eq!(usage.cpu_usage_percent, 50.0);
        assert_eq!(usage.uptime_ms, 2000);
        assert!(!usage.exceeds(90.0));
    }

    #[test]
    fn test_finalize_sets_duration() {
        let start = Utc::now();
        let mut metrics = ExecutionMetrics::new(start);
        metrics.finalize(start + chrono::Duration::milliseconds(1500));

        assert_eq!(metrics.duration_ms, Some(1500));
        assert!(metrics.end_time.is_some());
    }
}
