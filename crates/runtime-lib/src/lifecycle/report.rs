//! Lifecycle reports and recommendations

use super::state::{AgentStatus, LifecycleState, StatusTransition};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Error count above which an agent is flagged
const HIGH_ERROR_COUNT: u64 = 5;

/// Restart count above which an agent is flagged
const FREQUENT_RESTARTS: u64 = 3;

/// Transitions into ERROR within the last hour above which an agent is flagged
const RECENT_ERROR_TRANSITIONS: usize = 2;

/// Number of transitions included in a report
const RECENT_TRANSITIONS_SHOWN: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct AgentLifecycleReport {
    pub agent_id: String,
    pub current_status: AgentStatus,
    pub previous_status: Option<AgentStatus>,
    pub uptime_ms: u64,
    pub total_status_changes: u64,
    pub error_count: u64,
    pub restart_count: u64,
    pub last_status_change: DateTime<Utc>,
    pub recent_transitions: Vec<StatusTransition>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemLifecycleReport {
    pub generated_at: DateTime<Utc>,
    pub total_agents: usize,
    pub status_distribution: BTreeMap<AgentStatus, usize>,
    pub total_errors: u64,
    pub total_restarts: u64,
    pub agents: Vec<AgentLifecycleReport>,
    pub recommendations: Vec<String>,
}

impl AgentLifecycleReport {
    pub(crate) fn build(
        state: LifecycleState,
        transitions: &[StatusTransition],
        now: DateTime<Utc>,
    ) -> Self {
        let recommendations = agent_recommendations(&state, transitions, now);
        let skip = transitions.len().saturating_sub(RECENT_TRANSITIONS_SHOWN);

        Self {
            agent_id: state.agent_id,
            current_status: state.current_status,
            previous_status: state.previous_status,
            uptime_ms: state.uptime_ms,
            total_status_changes: state.total_status_changes,
            error_count: state.error_count,
            restart_count: state.restart_count,
            last_status_change: state.last_status_change,
            recent_transitions: transitions[skip..].to_vec(),
            recommendations,
        }
    }
}

impl SystemLifecycleReport {
    pub(crate) fn build(mut agents: Vec<AgentLifecycleReport>, now: DateTime<Utc>) -> Self {
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

        let mut status_distribution: BTreeMap<AgentStatus, usize> =
            AgentStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for agent in &agents {
            *status_distribution.entry(agent.current_status).or_insert(0) += 1;
        }

        let total_errors = agents.iter().map(|a| a.error_count).sum();
        let total_restarts = agents.iter().map(|a| a.restart_count).sum();

        let mut recommendations = Vec::new();
        let in_error = status_distribution
            .get(&AgentStatus::Error)
            .copied()
            .unwrap_or(0);
        if in_error > 0 {
            recommendations.push(format!(
                "{} agent(s) currently in error state; review their recent transitions",
                in_error
            ));
        }
        let flagged = agents
            .iter()
            .filter(|a| !a.recommendations.is_empty())
            .count();
        if !agents.is_empty() && flagged * 2 > agents.len() {
            recommendations.push(format!(
                "Most agents ({} of {}) have open recommendations; check shared dependencies",
                flagged,
                agents.len()
            ));
        }

        Self {
            generated_at: now,
            total_agents: agents.len(),
            status_distribution,
            total_errors,
            total_restarts,
            agents,
            recommendations,
        }
    }
}

fn agent_recommendations(
    state: &LifecycleState,
    transitions: &[StatusTransition],
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut recommendations = Vec::new();

    if state.error_count > HIGH_ERROR_COUNT {
        recommendations.push(format!(
            "High error count ({}); investigate recurring failures",
            state.error_count
        ));
    }

    if state.restart_count > FREQUENT_RESTARTS {
        recommendations.push(format!(
            "Frequent restarts ({}); check agent stability",
            state.restart_count
        ));
    }

    if state.current_status == AgentStatus::Error {
        recommendations
            .push("Agent is currently in error state; manual intervention may be required".into());
    }

    let hour_ago = now - Duration::hours(1);
    let recent_errors = transitions
        .iter()
        .filter(|t| t.to == AgentStatus::Error && t.timestamp >= hour_ago)
        .count();
    if recent_errors > RECENT_ERROR_TRANSITIONS {
        recommendations.push(format!(
            "High error count in the last hour ({} error transitions); agent may be unstable",
            recent_errors
        ));
    }

    recommendations
}
