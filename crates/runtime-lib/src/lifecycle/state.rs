//! Agent status state machine and per-agent lifecycle records

use crate::error::{Result, RuntimeError};
use crate::models::millis_between;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;

/// Lifecycle status of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Inactive,
    Active,
    Running,
    Paused,
    Error,
}

impl AgentStatus {
    pub const ALL: [AgentStatus; 5] = [
        AgentStatus::Inactive,
        AgentStatus::Active,
        AgentStatus::Running,
        AgentStatus::Paused,
        AgentStatus::Error,
    ];

    /// Statuses reachable from `self` in one step
    pub fn allowed_transitions(&self) -> &'static [AgentStatus] {
        use AgentStatus::*;
        match self {
            Inactive => &[Active, Error],
            Active => &[Running, Paused, Inactive, Error],
            Running => &[Active, Paused, Error],
            Paused => &[Active, Running, Inactive, Error],
            Error => &[Inactive, Active],
        }
    }

    pub fn can_transition_to(&self, to: AgentStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Inactive => "inactive",
            AgentStatus::Active => "active",
            AgentStatus::Running => "running",
            AgentStatus::Paused => "paused",
            AgentStatus::Error => "error",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One applied status change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusTransition {
    pub from: AgentStatus,
    pub to: AgentStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Entry of the status history log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusHistoryEntry {
    pub status: AgentStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Lifecycle bookkeeping for one agent
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleState {
    pub agent_id: String,
    pub current_status: AgentStatus,
    pub previous_status: Option<AgentStatus>,
    pub status_history: VecDeque<StatusHistoryEntry>,
    pub registered_at: DateTime<Utc>,
    pub last_status_change: DateTime<Utc>,
    pub total_status_changes: u64,
    /// Wall-clock time since registration
    pub uptime_ms: u64,
    pub error_count: u64,
    pub restart_count: u64,
}

/// Capacity of the two per-agent logs
#[derive(Debug, Clone, Copy)]
pub(crate) struct LogLimits {
    pub max_history: usize,
    pub max_transitions: usize,
}

/// Mutable record kept behind the per-agent lock
#[derive(Debug)]
pub(crate) struct AgentRecord {
    pub state: LifecycleState,
    pub transitions: VecDeque<StatusTransition>,
}

impl AgentRecord {
    pub fn new(agent_id: &str, now: DateTime<Utc>) -> Self {
        let mut status_history = VecDeque::new();
        status_history.push_back(StatusHistoryEntry {
            status: AgentStatus::Inactive,
            timestamp: now,
            reason: Some("registered".to_string()),
        });

        Self {
            state: LifecycleState {
                agent_id: agent_id.to_string(),
                current_status: AgentStatus::Inactive,
                previous_status: None,
                status_history,
                registered_at: now,
                last_status_change: now,
                total_status_changes: 0,
                uptime_ms: 0,
                error_count: 0,
                restart_count: 0,
            },
            transitions: VecDeque::new(),
        }
    }

    /// Apply one transition if the table allows it
    pub fn apply(
        &mut self,
        to: AgentStatus,
        reason: Option<String>,
        metadata: Option<Value>,
        now: DateTime<Utc>,
        limits: LogLimits,
    ) -> Result<StatusTransition> {
        let from = self.state.current_status;
        if !from.can_transition_to(to) {
            return Err(RuntimeError::InvalidTransition {
                agent_id: self.state.agent_id.clone(),
                from,
                to,
            });
        }

        let transition = StatusTransition {
            from,
            to,
            timestamp: now,
            reason: reason.clone(),
            metadata,
        };

        push_bounded(&mut self.transitions, transition.clone(), limits.max_transitions);
        push_bounded(
            &mut self.state.status_history,
            StatusHistoryEntry {
                status: to,
                timestamp: now,
                reason,
            },
            limits.max_history,
        );

        let state = &mut self.state;
        state.previous_status = Some(from);
        state.current_status = to;
        state.last_status_change = now;
        state.total_status_changes += 1;
        state.uptime_ms = millis_between(state.registered_at, now);

        if to == AgentStatus::Error {
            state.error_count += 1;
        }
        if from == AgentStatus::Inactive && to == AgentStatus::Active {
            state.restart_count += 1;
        }

        Ok(transition)
    }

    /// Snapshot with uptime refreshed to `now`
    pub fn snapshot(&self, now: DateTime<Utc>) -> LifecycleState {
        let mut state = self.state.clone();
        state.uptime_ms = millis_between(state.registered_at, now);
        state
    }
}

fn push_bounded<T>(log: &mut VecDeque<T>, item: T, capacity: usize) {
    log.push_back(item);
    while log.len() > capacity {
        log.pop_front();
    }
}
