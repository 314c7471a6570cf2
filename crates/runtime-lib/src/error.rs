//! Error types for the agent runtime
//!
//! Every message is safe to relay to an API client: it names the agent and
//! the failed operation, never internal state.

use crate::lifecycle::AgentStatus;

/// Result alias used across the runtime
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors surfaced by runtime operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeError {
    #[error("agent {0} is already registered")]
    AgentAlreadyRegistered(String),

    #[error("agent {0} is not registered")]
    AgentNotRegistered(String),

    #[error("agent {0} is already running")]
    AgentAlreadyRunning(String),

    #[error("agent {0} is not running")]
    AgentNotRunning(String),

    #[error("invalid status transition for agent {agent_id}: {from} -> {to}")]
    InvalidTransition {
        agent_id: String,
        from: AgentStatus,
        to: AgentStatus,
    },

    #[error("sandbox for agent {0} is already running")]
    SandboxAlreadyRunning(String),

    #[error("sandbox for agent {0} is not running")]
    SandboxNotRunning(String),

    #[error("sandbox for agent {agent_id} did not become ready within {timeout_secs}s")]
    InitTimeout { agent_id: String, timeout_secs: f64 },

    #[error("sandbox for agent {agent_id} failed to initialize: {message}")]
    InitFailed { agent_id: String, message: String },

    #[error("execution of agent {agent_id} timed out after {timeout_secs}s")]
    ExecutionTimeout { agent_id: String, timeout_secs: f64 },

    #[error("execution of agent {agent_id} failed: {message}")]
    ExecutionFailed { agent_id: String, message: String },

    #[error("sandbox worker for agent {0} is unavailable")]
    WorkerUnavailable(String),

    #[error("invalid resource allocation: {0}")]
    InvalidAllocation(String),

    #[error("runtime is shutting down")]
    ShuttingDown,
}

impl RuntimeError {
    /// True for errors an API layer should report as "not found"
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RuntimeError::AgentNotRegistered(_) | RuntimeError::AgentNotRunning(_)
        )
    }

    /// True for errors caused by the caller's request conflicting with current state
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            RuntimeError::AgentAlreadyRegistered(_)
                | RuntimeError::AgentAlreadyRunning(_)
                | RuntimeError::SandboxAlreadyRunning(_)
                | RuntimeError::InvalidTransition { .. }
                | RuntimeError::InvalidAllocation(_)
        )
    }

    /// True for timeouts at the isolation boundary
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RuntimeError::InitTimeout { .. } | RuntimeError::ExecutionTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(RuntimeError::AgentNotRegistered("a".into()).is_not_found());
        assert!(RuntimeError::AgentAlreadyRegistered("a".into()).is_conflict());
        assert!(!RuntimeError::ShuttingDown.is_conflict());

        let timeout = RuntimeError::ExecutionTimeout {
            agent_id: "a".into(),
            timeout_secs: 1.0,
        };
        assert!(timeout.is_timeout());
        assert_eq!(timeout.to_string(), "execution of agent a timed out after 1s");
    }

    #[test]
    fn test_transition_message() {
        let err = RuntimeError::InvalidTransition {
            agent_id: "a1".into(),
            from: AgentStatus::Inactive,
            to: AgentStatus::Running,
        };
        assert_eq!(
            err.to_string(),
            "invalid status transition for agent a1: inactive -> running"
        );
    }
}
