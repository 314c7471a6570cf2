//! Agent lifecycle tracking
//!
//! Keeps one status record per registered agent, independent of whether the
//! agent currently has a sandbox. Records change only through the transition
//! table in [`AgentStatus::allowed_transitions`]; each agent's record sits
//! behind its own lock so updates for one agent apply strictly in call order
//! and never contend with other agents.

mod hooks;
mod report;
mod state;

pub use hooks::{HookContext, HookEvent, HookId, LifecycleHook};
pub use report::{AgentLifecycleReport, SystemLifecycleReport};
pub use state::{AgentStatus, LifecycleState, StatusHistoryEntry, StatusTransition};

use crate::error::{Result, RuntimeError};
use crate::observability::RuntimeMetrics;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hooks::HookRegistry;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use state::{AgentRecord, LogLimits};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Configuration for lifecycle tracking
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Entries kept in each agent's status history
    pub max_history: usize,
    /// Entries kept in each agent's transition log
    pub max_transitions: usize,
    /// Buffer size of the lifecycle event channel
    pub event_capacity: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_history: 100,
            max_transitions: 50,
            event_capacity: 256,
        }
    }
}

/// Notifications published by the lifecycle manager
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Registered {
        agent_id: String,
    },
    StatusChanged {
        agent_id: String,
        transition: StatusTransition,
    },
    Unregistered {
        agent_id: String,
    },
    Shutdown,
}

/// Tracks lifecycle status for every registered agent
pub struct LifecycleManager {
    config: LifecycleConfig,
    records: DashMap<String, Arc<Mutex<AgentRecord>>>,
    hooks: HookRegistry,
    events: broadcast::Sender<LifecycleEvent>,
    metrics: RuntimeMetrics,
}

impl LifecycleManager {
    pub fn new(config: LifecycleConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            records: DashMap::new(),
            hooks: HookRegistry::default(),
            events,
            metrics: RuntimeMetrics::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Start tracking an agent in INACTIVE
    pub fn register_agent(&self, agent_id: &str) -> Result<LifecycleState> {
        let now = Utc::now();
        let state = match self.records.entry(agent_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(RuntimeError::AgentAlreadyRegistered(agent_id.to_string()))
            }
            Entry::Vacant(slot) => {
                let record = AgentRecord::new(agent_id, now);
                let state = record.snapshot(now);
                slot.insert(Arc::new(Mutex::new(record)));
                state
            }
        };

        info!(agent_id = %agent_id, "Agent registered for lifecycle tracking");
        self.hooks.fire(HookContext {
            agent_id: agent_id.to_string(),
            event: HookEvent::Registered,
            transition: None,
            timestamp: now,
        });
        let _ = self.events.send(LifecycleEvent::Registered {
            agent_id: agent_id.to_string(),
        });

        Ok(state)
    }

    /// Stop tracking an agent and drop its hooks
    pub fn unregister_agent(&self, agent_id: &str) -> Result<()> {
        if self.records.remove(agent_id).is_none() {
            return Err(RuntimeError::AgentNotRegistered(agent_id.to_string()));
        }

        self.hooks.fire(HookContext {
            agent_id: agent_id.to_string(),
            event: HookEvent::Unregistered,
            transition: None,
            timestamp: Utc::now(),
        });
        self.hooks.remove_agent(agent_id);

        info!(agent_id = %agent_id, "Agent removed from lifecycle tracking");
        let _ = self.events.send(LifecycleEvent::Unregistered {
            agent_id: agent_id.to_string(),
        });

        Ok(())
    }

    /// Apply one transition; fails if the table does not allow it
    pub fn update_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        reason: Option<&str>,
        metadata: Option<Value>,
    ) -> Result<StatusTransition> {
        let record = self.record(agent_id)?;
        let mut record = record.lock();
        self.apply_locked(&mut record, status, reason, metadata)
    }

    /// Move an agent to `status`, bridging through ACTIVE when the direct
    /// transition is not in the table.
    ///
    /// Returns the transitions applied; empty when the agent is already in
    /// `status`. Both legs of a bridge are applied under the same lock.
    pub fn advance_to(
        &self,
        agent_id: &str,
        status: AgentStatus,
        reason: Option<&str>,
    ) -> Result<Vec<StatusTransition>> {
        let record = self.record(agent_id)?;
        let mut record = record.lock();
        let current = record.state.current_status;

        if current == status {
            return Ok(Vec::new());
        }

        if current.can_transition_to(status) {
            let transition = self.apply_locked(&mut record, status, reason, None)?;
            return Ok(vec![transition]);
        }

        if current.can_transition_to(AgentStatus::Active)
            && AgentStatus::Active.can_transition_to(status)
        {
            let first = self.apply_locked(&mut record, AgentStatus::Active, reason, None)?;
            let second = self.apply_locked(&mut record, status, reason, None)?;
            return Ok(vec![first, second]);
        }

        Err(RuntimeError::InvalidTransition {
            agent_id: agent_id.to_string(),
            from: current,
            to: status,
        })
    }

    fn apply_locked(
        &self,
        record: &mut AgentRecord,
        status: AgentStatus,
        reason: Option<&str>,
        metadata: Option<Value>,
    ) -> Result<StatusTransition> {
        let transition = record.apply(
            status,
            reason.map(str::to_string),
            metadata,
            Utc::now(),
            self.limits(),
        )?;
        let agent_id = record.state.agent_id.clone();

        debug!(
            agent_id = %agent_id,
            from = %transition.from,
            to = %transition.to,
            reason = ?transition.reason,
            "Agent status changed"
        );
        self.metrics.inc_lifecycle_transition(transition.to.as_str());

        self.hooks.fire(HookContext {
            agent_id: agent_id.clone(),
            event: HookEvent::StatusChanged,
            transition: Some(transition.clone()),
            timestamp: transition.timestamp,
        });
        let _ = self.events.send(LifecycleEvent::StatusChanged {
            agent_id,
            transition: transition.clone(),
        });

        Ok(transition)
    }

    fn record(&self, agent_id: &str) -> Result<Arc<Mutex<AgentRecord>>> {
        self.records
            .get(agent_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| RuntimeError::AgentNotRegistered(agent_id.to_string()))
    }

    fn limits(&self) -> LogLimits {
        LogLimits {
            max_history: self.config.max_history,
            max_transitions: self.config.max_transitions,
        }
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.records.contains_key(agent_id)
    }

    pub fn status(&self, agent_id: &str) -> Option<AgentStatus> {
        let record = self.record(agent_id).ok()?;
        let status = record.lock().state.current_status;
        Some(status)
    }

    /// Snapshot of an agent's record with uptime refreshed
    pub fn state(&self, agent_id: &str) -> Option<LifecycleState> {
        let record = self.record(agent_id).ok()?;
        let snapshot = record.lock().snapshot(Utc::now());
        Some(snapshot)
    }

    pub fn history(&self, agent_id: &str) -> Option<Vec<StatusHistoryEntry>> {
        let record = self.record(agent_id).ok()?;
        let history = record.lock().state.status_history.iter().cloned().collect();
        Some(history)
    }

    pub fn transitions(&self, agent_id: &str) -> Option<Vec<StatusTransition>> {
        let record = self.record(agent_id).ok()?;
        let transitions = record.lock().transitions.iter().cloned().collect();
        Some(transitions)
    }

    pub fn registered_agents(&self) -> Vec<String> {
        self.records.iter().map(|r| r.key().clone()).collect()
    }

    pub fn agents_by_status(&self, status: AgentStatus) -> Vec<String> {
        self.all_records()
            .into_iter()
            .filter(|(_, record)| record.lock().state.current_status == status)
            .map(|(id, _)| id)
            .collect()
    }

    /// Clones of every record handle, taken without holding map guards
    fn all_records(&self) -> Vec<(String, Arc<Mutex<AgentRecord>>)> {
        self.records
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect()
    }

    pub fn register_hook(
        &self,
        agent_id: &str,
        event: HookEvent,
        hook: Arc<dyn LifecycleHook>,
    ) -> HookId {
        let id = self.hooks.register(agent_id, event, hook);
        debug!(
            agent_id = %agent_id,
            event = ?event,
            hooks = self.hooks.count(agent_id),
            "Lifecycle hook registered"
        );
        id
    }

    pub fn unregister_hook(&self, agent_id: &str, id: HookId) -> bool {
        self.hooks.unregister(agent_id, id)
    }

    /// Number of hooks attached to an agent across all events
    pub fn hook_count(&self, agent_id: &str) -> usize {
        self.hooks.count(agent_id)
    }

    pub fn agent_report(&self, agent_id: &str) -> Result<AgentLifecycleReport> {
        let record = self.record(agent_id)?;
        let now = Utc::now();
        let (state, transitions) = {
            let record = record.lock();
            let transitions: Vec<_> = record.transitions.iter().cloned().collect();
            (record.snapshot(now), transitions)
        };
        Ok(AgentLifecycleReport::build(state, &transitions, now))
    }

    pub fn system_report(&self) -> SystemLifecycleReport {
        let now = Utc::now();
        let agents = self
            .all_records()
            .into_iter()
            .map(|(_, record)| {
                let record = record.lock();
                let transitions: Vec<_> = record.transitions.iter().cloned().collect();
                AgentLifecycleReport::build(record.snapshot(now), &transitions, now)
            })
            .collect();
        SystemLifecycleReport::build(agents, now)
    }

    /// Fire shutdown hooks, then drop every record and hook
    pub fn shutdown(&self) {
        let now = Utc::now();
        let agents = self.registered_agents();
        for agent_id in &agents {
            self.hooks.fire(HookContext {
                agent_id: agent_id.clone(),
                event: HookEvent::Shutdown,
                transition: None,
                timestamp: now,
            });
        }

        self.hooks.clear();
        self.records.clear();
        if self.events.send(LifecycleEvent::Shutdown).is_err() {
            debug!("No lifecycle subscribers at shutdown");
        }

        info!(agents = agents.len(), "Lifecycle manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn manager() -> LifecycleManager {
        LifecycleManager::new(LifecycleConfig::default())
    }

    #[test]
    fn test_register_starts_inactive() {
        let lifecycle = manager();
        let state = lifecycle.register_agent("a1").unwrap();

        assert_eq!(state.current_status, AgentStatus::Inactive);
        assert_eq!(state.previous_status, None);
        assert_eq!(state.status_history.len(), 1);
        assert_eq!(lifecycle.status("a1"), Some(AgentStatus::Inactive));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let lifecycle = manager();
        lifecycle.register_agent("a1").unwrap();

        assert_eq!(
            lifecycle.register_agent("a1").unwrap_err(),
            RuntimeError::AgentAlreadyRegistered("a1".into())
        );
    }

    #[test]
    fn test_update_status_enforces_table() {
        let lifecycle = manager();
        lifecycle.register_agent("a1").unwrap();

        let err = lifecycle
            .update_status("a1", AgentStatus::Running, None, None)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidTransition { .. }));

        let transition = lifecycle
            .update_status("a1", AgentStatus::Active, Some("start"), None)
            .unwrap();
        assert_eq!(transition.from, AgentStatus::Inactive);
        assert_eq!(transition.reason.as_deref(), Some("start"));

        let state = lifecycle.state("a1").unwrap();
        assert_eq!(state.restart_count, 1);
        assert_eq!(state.total_status_changes, 1);
    }

    #[test]
    fn test_unknown_agent() {
        let lifecycle = manager();
        assert!(lifecycle
            .update_status("ghost", AgentStatus::Active, None, None)
            .unwrap_err()
            .is_not_found());
        assert!(lifecycle.unregister_agent("ghost").is_err());
        assert!(lifecycle.state("ghost").is_none());
    }

    #[test]
    fn test_advance_to_bridges_through_active() {
        let lifecycle = manager();
        lifecycle.register_agent("a1").unwrap();

        let applied = lifecycle
            .advance_to("a1", AgentStatus::Running, Some("sandbox started"))
            .unwrap();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[0].to, AgentStatus::Active);
        assert_eq!(applied[1].to, AgentStatus::Running);

        assert!(lifecycle
            .advance_to("a1", AgentStatus::Running, None)
            .unwrap()
            .is_empty());

        let applied = lifecycle
            .advance_to("a1", AgentStatus::Inactive, Some("stopped"))
            .unwrap();
        assert_eq!(applied.len(), 2);
        assert_eq!(lifecycle.status("a1"), Some(AgentStatus::Inactive));

        for t in lifecycle.transitions("a1").unwrap() {
            assert!(t.from.can_transition_to(t.to));
        }
    }

    #[test]
    fn test_agents_by_status() {
        let lifecycle = manager();
        lifecycle.register_agent("a1").unwrap();
        lifecycle.register_agent("a2").unwrap();
        lifecycle
            .update_status("a2", AgentStatus::Error, Some("crashed"), None)
            .unwrap();

        assert_eq!(lifecycle.agents_by_status(AgentStatus::Error), vec!["a2"]);
        assert_eq!(lifecycle.agents_by_status(AgentStatus::Inactive), vec!["a1"]);
    }

    #[tokio::test]
    async fn test_events_and_hooks_fire_on_status_change() {
        let lifecycle = manager();
        let mut events = lifecycle.subscribe();
        lifecycle.register_agent("a1").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let hook: Arc<dyn LifecycleHook> = Arc::new(move |ctx: HookContext| {
            let counter = counter.clone();
            async move {
                assert!(ctx.transition.is_some());
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
        });
        lifecycle.register_hook("a1", HookEvent::StatusChanged, hook);

        lifecycle
            .update_status("a1", AgentStatus::Active, None, None)
            .unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            LifecycleEvent::Registered { .. }
        ));
        match events.recv().await.unwrap() {
            LifecycleEvent::StatusChanged { agent_id, transition } => {
                assert_eq!(agent_id, "a1");
                assert_eq!(transition.to, AgentStatus::Active);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_hook_does_not_block_transition() {
        let lifecycle = manager();
        lifecycle.register_agent("a1").unwrap();
        let hook: Arc<dyn LifecycleHook> = Arc::new(|_ctx: HookContext| async {
            Err::<(), anyhow::Error>(anyhow::anyhow!("observer exploded"))
        });
        lifecycle.register_hook("a1", HookEvent::StatusChanged, hook);

        assert!(lifecycle
            .update_status("a1", AgentStatus::Active, None, None)
            .is_ok());
        assert_eq!(lifecycle.status("a1"), Some(AgentStatus::Active));
    }

    #[test]
    fn test_hook_registration_is_counted() {
        let lifecycle = manager();
        lifecycle.register_agent("a1").unwrap();
        let hook: Arc<dyn LifecycleHook> =
            Arc::new(|_ctx: HookContext| async { Ok::<(), anyhow::Error>(()) });

        let changed = lifecycle.register_hook("a1", HookEvent::StatusChanged, hook.clone());
        lifecycle.register_hook("a1", HookEvent::Shutdown, hook);
        assert_eq!(lifecycle.hook_count("a1"), 2);
        assert_eq!(lifecycle.hook_count("a2"), 0);

        assert!(lifecycle.unregister_hook("a1", changed));
        assert!(!lifecycle.unregister_hook("a1", changed));
        assert_eq!(lifecycle.hook_count("a1"), 1);

        lifecycle.unregister_agent("a1").unwrap();
        assert_eq!(lifecycle.hook_count("a1"), 0);
    }

    #[test]
    fn test_error_transitions_produce_recommendation() {
        let lifecycle = manager();
        lifecycle.register_agent("a1").unwrap();
        lifecycle
            .advance_to("a1", AgentStatus::Running, None)
            .unwrap();

        for _ in 0..5 {
            lifecycle
                .update_status("a1", AgentStatus::Error, Some("failure"), None)
                .unwrap();
            lifecycle
                .advance_to("a1", AgentStatus::Running, None)
                .unwrap();
        }

        let report = lifecycle.agent_report("a1").unwrap();
        assert_eq!(report.error_count, 5);
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("High error count")));
    }

    #[test]
    fn test_shutdown_clears_records() {
        let lifecycle = manager();
        lifecycle.register_agent("a1").unwrap();
        lifecycle.shutdown();

        assert!(!lifecycle.is_registered("a1"));
        assert_eq!(lifecycle.system_report().total_agents, 0);
    }
}
