use crate::lifecycle::LifecycleConfig;
use crate::metrics::CollectorConfig;
use crate::models::{AgentCategory, ResourceAllocation};
use crate::sandbox::SandboxConfig;
use std::collections::HashMap;
use std::time::Duration;

/// Configuration for the runtime manager and the components it owns
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Interval between background health checks
    pub health_check_interval: Duration,
    /// Buffer size of the runtime event channel
    pub event_capacity: usize,
    /// Per-category allocations used instead of the built-in defaults
    pub allocation_overrides: HashMap<AgentCategory, ResourceAllocation>,
    /// Node name attached to structured log lines
    pub node_name: String,
    pub sandbox: SandboxConfig,
    pub metrics: CollectorConfig,
    pub lifecycle: LifecycleConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            event_capacity: 256,
            allocation_overrides: HashMap::new(),
            node_name: "local".to_string(),
            sandbox: SandboxConfig::default(),
            metrics: CollectorConfig::default(),
            lifecycle: LifecycleConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Allocation for agents of `category` started without an explicit one
    pub fn allocation_for(&self, category: AgentCategory) -> ResourceAllocation {
        self.allocation_overrides
            .get(&category)
            .copied()
            .unwrap_or_else(|| ResourceAllocation::for_category(category))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_defaults_and_overrides() {
        let mut config = RuntimeConfig::default();
        assert_eq!(
            config.allocation_for(AgentCategory::ContentGeneration).memory_mb,
            1024.0
        );

        config.allocation_overrides.insert(
            AgentCategory::Validation,
            ResourceAllocation::new(128.0, 0.25, 5.0, 10.0),
        );
        let validation = config.allocation_for(AgentCategory::Validation);
        assert_eq!(validation.memory_mb, 128.0);
        assert_eq!(validation.timeout_seconds, 5.0);
        // Other categories keep their defaults
        assert_eq!(config.allocation_for(AgentCategory::Work).timeout_seconds, 300.0);
    }
}
