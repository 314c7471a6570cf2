//! Lifecycle hooks
//!
//! Hooks observe lifecycle events; they never take part in the transition.
//! Each hook runs on its own task, and its errors and panics are logged.

use super::state::StatusTransition;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Lifecycle event a hook can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    Registered,
    Unregistered,
    StatusChanged,
    Shutdown,
}

/// Payload handed to a hook
#[derive(Debug, Clone, Serialize)]
pub struct HookContext {
    pub agent_id: String,
    pub event: HookEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transition: Option<StatusTransition>,
    pub timestamp: DateTime<Utc>,
}

/// Observer of lifecycle events
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    async fn on_event(&self, ctx: HookContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> LifecycleHook for F
where
    F: Fn(HookContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn on_event(&self, ctx: HookContext) -> anyhow::Result<()> {
        (self)(ctx).await
    }
}

/// Handle returned by hook registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct HookId(u64);

struct HookEntry {
    id: HookId,
    event: HookEvent,
    hook: Arc<dyn LifecycleHook>,
}

/// Hooks keyed by agent id
#[derive(Default)]
pub(crate) struct HookRegistry {
    hooks: DashMap<String, Vec<HookEntry>>,
    next_id: AtomicU64,
}

impl HookRegistry {
    pub fn register(
        &self,
        agent_id: &str,
        event: HookEvent,
        hook: Arc<dyn LifecycleHook>,
    ) -> HookId {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.hooks
            .entry(agent_id.to_string())
            .or_default()
            .push(HookEntry { id, event, hook });
        id
    }

    pub fn unregister(&self, agent_id: &str, id: HookId) -> bool {
        let Some(mut entries) = self.hooks.get_mut(agent_id) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        before != entries.len()
    }

    pub fn remove_agent(&self, agent_id: &str) {
        self.hooks.remove(agent_id);
    }

    pub fn clear(&self) {
        self.hooks.clear();
    }

    pub fn count(&self, agent_id: &str) -> usize {
        self.hooks.get(agent_id).map(|e| e.len()).unwrap_or(0)
    }

    /// Spawn every hook registered for `ctx.event` on `ctx.agent_id`
    pub fn fire(&self, ctx: HookContext) {
        let matching: Vec<Arc<dyn LifecycleHook>> = match self.hooks.get(&ctx.agent_id) {
            Some(entries) => entries
                .iter()
                .filter(|entry| entry.event == ctx.event)
                .map(|entry| entry.hook.clone())
                .collect(),
            None => return,
        };

        if matching.is_empty() {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(agent_id = %ctx.agent_id, event = ?ctx.event, "No async runtime, skipping hooks");
            return;
        };

        debug!(
            agent_id = %ctx.agent_id,
            event = ?ctx.event,
            hooks = matching.len(),
            "Firing lifecycle hooks"
        );

        for hook in matching {
            let ctx = ctx.clone();
            handle.spawn(async move {
                let agent_id = ctx.agent_id.clone();
                let event = ctx.event;
                match AssertUnwindSafe(hook.on_event(ctx)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(agent_id = %agent_id, event = ?event, error = %e, "Lifecycle hook failed");
                    }
                    Err(_) => {
                        warn!(agent_id = %agent_id, event = ?event, "Lifecycle hook panicked");
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn context(agent_id: &str, event: HookEvent) -> HookContext {
        HookContext {
            agent_id: agent_id.to_string(),
            event,
            transition: None,
            timestamp: Utc::now(),
        }
    }

    fn counting_hook(calls: Arc<AtomicUsize>) -> Arc<dyn LifecycleHook> {
        Arc::new(move |_ctx: HookContext| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
        })
    }

    #[tokio::test]
    async fn test_fire_only_matching_event() {
        let registry = HookRegistry::default();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.register("a1", HookEvent::StatusChanged, counting_hook(calls.clone()));

        registry.fire(context("a1", HookEvent::Registered));
        registry.fire(context("a1", HookEvent::StatusChanged));
        registry.fire(context("a2", HookEvent::StatusChanged));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_and_panicking_hooks_are_contained() {
        let registry = HookRegistry::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let failing: Arc<dyn LifecycleHook> = Arc::new(|_ctx: HookContext| async {
            Err::<(), anyhow::Error>(anyhow::anyhow!("hook failed"))
        });
        let panicking: Arc<dyn LifecycleHook> = Arc::new(|_ctx: HookContext| async {
            if true {
                panic!("hook panicked");
            }
            Ok::<(), anyhow::Error>(())
        });

        registry.register("a1", HookEvent::StatusChanged, failing);
        registry.register("a1", HookEvent::StatusChanged, panicking);
        registry.register("a1", HookEvent::StatusChanged, counting_hook(calls.clone()));

        registry.fire(context("a1", HookEvent::StatusChanged));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister_hook() {
        let registry = HookRegistry::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let id = registry.register("a1", HookEvent::Shutdown, counting_hook(calls));
        assert_eq!(registry.count("a1"), 1);

        assert!(registry.unregister("a1", id));
        assert!(!registry.unregister("a1", id));
        assert_eq!(registry.count("a1"), 0);
    }
}
