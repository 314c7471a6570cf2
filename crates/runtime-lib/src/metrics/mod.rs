//! Per-agent metrics collection
//!
//! The collector keeps a bounded sample history per agent, samples running
//! sources on a fixed interval, recomputes a rollup on every append, and
//! publishes a periodic system summary.

mod history;
mod report;
mod trend;

pub use history::{AggregatedMetrics, MetricsHistory, MetricsSample};
pub use report::{
    AgentMetricsReport, MetricsReport, PerformanceSummary, SystemMetricsReport, SystemSummary,
};
pub use trend::{LeakAnalysis, LeakDetector, MetricsTrend, ProjectedExhaustion, Trend};

use crate::models::{ExecutionMetrics, ResourceUsage};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Anything the collector can sample
pub trait MetricsSource: Send + Sync {
    fn metrics(&self) -> ExecutionMetrics;

    fn resource_usage(&self) -> ResourceUsage;
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Interval between samples of a running source
    pub sample_interval: Duration,
    /// Samples kept per agent
    pub max_samples: usize,
    /// Interval between system summaries
    pub aggregation_interval: Duration,
    pub event_capacity: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
            max_samples: 1000,
            aggregation_interval: Duration::from_secs(60),
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricsEvent {
    Recorded {
        agent_id: String,
        sample: MetricsSample,
        aggregated: AggregatedMetrics,
    },
    SystemSummary(SystemSummary),
}

pub struct MetricsCollector {
    config: CollectorConfig,
    histories: DashMap<String, Arc<Mutex<MetricsHistory>>>,
    samplers: DashMap<String, JoinHandle<()>>,
    aggregation: Mutex<Option<JoinHandle<()>>>,
    leak_detector: LeakDetector,
    events: broadcast::Sender<MetricsEvent>,
    shut_down: AtomicBool,
}

impl MetricsCollector {
    /// Create the collector and start its aggregation timer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: CollectorConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let collector = Arc::new(Self {
            config,
            histories: DashMap::new(),
            samplers: DashMap::new(),
            aggregation: Mutex::new(None),
            leak_detector: LeakDetector::default(),
            events,
            shut_down: AtomicBool::new(false),
        });

        let handle = tokio::spawn(aggregation_loop(
            Arc::downgrade(&collector),
            collector.config.aggregation_interval,
        ));
        *collector.aggregation.lock() = Some(handle);

        collector
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetricsEvent> {
        self.events.subscribe()
    }

    /// Start sampling `source` with a fresh history; no-op if already collecting
    pub fn start_collecting(self: &Arc<Self>, agent_id: &str, source: Arc<dyn MetricsSource>) {
        if self.shut_down.load(Ordering::SeqCst) {
            warn!(agent_id = %agent_id, "Metrics collector is shut down, not collecting");
            return;
        }

        let dashmap::mapref::entry::Entry::Vacant(slot) = self.samplers.entry(agent_id.to_string())
        else {
            warn!(agent_id = %agent_id, "Already collecting metrics");
            return;
        };

        self.histories.insert(
            agent_id.to_string(),
            Arc::new(Mutex::new(MetricsHistory::new(agent_id, Utc::now()))),
        );

        let handle = tokio::spawn(sample_loop(
            Arc::downgrade(self),
            agent_id.to_string(),
            source,
            self.config.sample_interval,
        ));
        slot.insert(handle);

        debug!(
            agent_id = %agent_id,
            interval_ms = self.config.sample_interval.as_millis() as u64,
            "Started metrics collection"
        );
    }

    /// Cancel sampling; the history is kept
    pub fn stop_collecting(&self, agent_id: &str) -> bool {
        match self.samplers.remove(agent_id) {
            Some((_, handle)) => {
                handle.abort();
                debug!(agent_id = %agent_id, "Stopped metrics collection");
                true
            }
            None => false,
        }
    }

    /// Append a sample; no-op when collection was never started for the agent
    pub fn record_metrics(&self, agent_id: &str, metrics: ExecutionMetrics) {
        self.record_sample(agent_id, metrics, None);
    }

    pub fn record_sample(
        &self,
        agent_id: &str,
        metrics: ExecutionMetrics,
        resource_usage: Option<ResourceUsage>,
    ) {
        let Some(history) = self.histories.get(agent_id).map(|h| h.value().clone()) else {
            warn!(agent_id = %agent_id, "No metrics history, dropping sample");
            return;
        };

        let now = Utc::now();
        let sample = MetricsSample {
            timestamp: now,
            metrics,
            resource_usage,
        };

        let mut history = history.lock();
        history.push(sample.clone(), self.config.max_samples, now);
        // Sent under the lock so subscribers see samples in append order
        let _ = self.events.send(MetricsEvent::Recorded {
            agent_id: agent_id.to_string(),
            sample,
            aggregated: history.aggregated.clone(),
        });
    }

    pub fn clear_history(&self, agent_id: &str) -> bool {
        self.histories.remove(agent_id).is_some()
    }

    /// Stop sampling and drop the history
    pub fn remove_agent(&self, agent_id: &str) {
        self.stop_collecting(agent_id);
        self.clear_history(agent_id);
    }

    pub fn is_collecting(&self, agent_id: &str) -> bool {
        self.samplers.contains_key(agent_id)
    }

    pub fn tracked_agents(&self) -> Vec<String> {
        self.histories.iter().map(|h| h.key().clone()).collect()
    }

    /// Newest `limit` samples for an agent, oldest first
    pub fn history(&self, agent_id: &str, limit: Option<usize>) -> Option<Vec<MetricsSample>> {
        let history = self.histories.get(agent_id).map(|h| h.value().clone())?;
        let samples = history.lock().recent(limit);
        Some(samples)
    }

    /// Rollup with uptime refreshed
    pub fn aggregated(&self, agent_id: &str) -> Option<AggregatedMetrics> {
        let history = self.histories.get(agent_id).map(|h| h.value().clone())?;
        let aggregated = history.lock().aggregated_at(Utc::now());
        Some(aggregated)
    }

    /// Cloned histories, taken without holding map guards
    fn snapshots(&self) -> Vec<MetricsHistory> {
        let handles: Vec<_> = self.histories.iter().map(|h| h.value().clone()).collect();
        handles.iter().map(|h| h.lock().clone()).collect()
    }

    pub fn system_summary(&self) -> SystemSummary {
        let now = Utc::now();
        let mut histories = self.snapshots();
        for history in &mut histories {
            history.aggregated = history.aggregated_at(now);
        }
        SystemSummary::build(&histories, self.samplers.len(), now)
    }

    /// Report for one agent, or for the whole system when `agent_id` is `None`.
    ///
    /// Returns `None` for an agent without history.
    pub fn generate_report(&self, agent_id: Option<&str>) -> Option<MetricsReport> {
        let now = Utc::now();

        match agent_id {
            Some(agent_id) => {
                let history = self.histories.get(agent_id).map(|h| h.value().clone())?;
                let history = history.lock().clone();
                Some(MetricsReport::Agent(AgentMetricsReport::build(
                    &history,
                    &self.leak_detector,
                    now,
                )))
            }
            None => {
                let histories = self.snapshots();
                let agents = histories
                    .iter()
                    .map(|h| AgentMetricsReport::build(h, &self.leak_detector, now))
                    .collect();
                let summary = self.system_summary();
                Some(MetricsReport::System(SystemMetricsReport::build(
                    summary, agents, now,
                )))
            }
        }
    }

    /// Cancel every sampling task and the aggregation timer
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let agents: Vec<String> = self.samplers.iter().map(|s| s.key().clone()).collect();
        for agent_id in &agents {
            self.stop_collecting(agent_id);
        }
        if let Some(handle) = self.aggregation.lock().take() {
            handle.abort();
        }

        info!(stopped_samplers = agents.len(), "Metrics collector shut down");
    }
}

async fn sample_loop(
    collector: Weak<MetricsCollector>,
    agent_id: String,
    source: Arc<dyn MetricsSource>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(collector) = collector.upgrade() else {
            break;
        };
        collector.record_sample(&agent_id, source.metrics(), Some(source.resource_usage()));
    }
}

async fn aggregation_loop(collector: Weak<MetricsCollector>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(collector) = collector.upgrade() else {
            break;
        };

        let summary = collector.system_summary();
        info!(
            agents = summary.total_agents,
            executions = summary.total_executions,
            error_rate = summary.overall_error_rate,
            average_memory_mb = summary.average_memory_mb,
            average_cpu_percent = summary.average_cpu_percent,
            "Metrics summary"
        );
        let _ = collector.events.send(MetricsEvent::SystemSummary(summary));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource {
        memory_used_mb: f64,
    }

    impl MetricsSource for FixedSource {
        fn metrics(&self) -> ExecutionMetrics {
            let mut metrics = ExecutionMetrics::new(Utc::now());
            metrics.memory_used_mb = self.memory_used_mb;
            metrics.cpu_used_percent = 12.0;
            metrics
        }

        fn resource_usage(&self) -> ResourceUsage {
            let allocation = crate::models::ResourceAllocation::new(256.0, 0.5, 60.0, 50.0);
            ResourceUsage::compute(&self.metrics(), &allocation, Utc::now())
        }
    }

    fn metrics_with_memory(memory_used_mb: f64) -> ExecutionMetrics {
        let mut metrics = ExecutionMetrics::new(Utc::now());
        metrics.memory_used_mb = memory_used_mb;
        metrics
    }

    fn fast_config() -> CollectorConfig {
        CollectorConfig {
            sample_interval: Duration::from_millis(20),
            aggregation_interval: Duration::from_millis(50),
            ..CollectorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_record_without_history_is_noop() {
        let collector = MetricsCollector::new(CollectorConfig::default());
        collector.record_metrics("ghost", metrics_with_memory(10.0));

        assert!(collector.history("ghost", None).is_none());
        assert!(collector.tracked_agents().is_empty());
    }

    #[tokio::test]
    async fn test_sampling_feeds_history() {
        let collector = MetricsCollector::new(fast_config());
        let mut events = collector.subscribe();
        collector.start_collecting("a1", Arc::new(FixedSource { memory_used_mb: 64.0 }));
        assert!(collector.is_collecting("a1"));

        let recorded = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(MetricsEvent::Recorded {
                    agent_id,
                    sample,
                    aggregated,
                }) = events.recv().await
                {
                    break (agent_id, sample, aggregated);
                }
            }
        })
        .await
        .expect("no sample recorded");

        assert_eq!(recorded.0, "a1");
        assert_eq!(recorded.1.metrics.memory_used_mb, 64.0);
        assert_eq!(recorded.1.resource_usage.as_ref().unwrap().memory_usage_percent, 25.0);
        assert!(recorded.2.total_executions >= 1);

        assert!(collector.stop_collecting("a1"));
        assert!(!collector.is_collecting("a1"));
        let kept = collector.history("a1", None).unwrap().len();
        assert!(kept >= 1);

        // No more samples after stopping
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(collector.history("a1", None).unwrap().len(), kept);

        collector.remove_agent("a1");
        assert!(collector.history("a1", None).is_none());
    }

    #[tokio::test]
    async fn test_double_start_keeps_history() {
        let collector = MetricsCollector::new(CollectorConfig::default());
        let source = Arc::new(FixedSource { memory_used_mb: 1.0 });
        collector.start_collecting("a1", source.clone());
        collector.record_metrics("a1", metrics_with_memory(5.0));

        collector.start_collecting("a1", source);
        assert_eq!(collector.history("a1", None).unwrap().len(), 1);
        collector.shutdown();
    }

    #[tokio::test]
    async fn test_linear_memory_growth_trend() {
        let collector = MetricsCollector::new(CollectorConfig::default());
        collector.start_collecting("a1", Arc::new(FixedSource { memory_used_mb: 0.0 }));
        collector.stop_collecting("a1");

        for i in 0..20 {
            collector.record_metrics("a1", metrics_with_memory(100.0 + 10.0 * i as f64));
        }

        match collector.generate_report(Some("a1")) {
            Some(MetricsReport::Agent(report)) => {
                assert_eq!(report.trend.memory_trend, Trend::Increasing);
                assert_eq!(report.trend.samples_analyzed, 20);
                assert_eq!(report.summary.total_executions, 20);
            }
            other => panic!("unexpected report: {:?}", other),
        }
        collector.shutdown();
    }

    #[tokio::test]
    async fn test_history_limit_and_window() {
        let config = CollectorConfig {
            max_samples: 5,
            ..CollectorConfig::default()
        };
        let collector = MetricsCollector::new(config);
        collector.start_collecting("a1", Arc::new(FixedSource { memory_used_mb: 0.0 }));

        for i in 0..8 {
            collector.record_metrics("a1", metrics_with_memory(i as f64));
        }

        assert_eq!(collector.history("a1", None).unwrap().len(), 5);
        let last_two = collector.history("a1", Some(2)).unwrap();
        assert_eq!(last_two[0].metrics.memory_used_mb, 6.0);
        assert_eq!(last_two[1].metrics.memory_used_mb, 7.0);
        assert_eq!(collector.aggregated("a1").unwrap().total_executions, 5);
        collector.shutdown();
    }

    #[tokio::test]
    async fn test_system_report_and_summary_event() {
        let collector = MetricsCollector::new(fast_config());
        let mut events = collector.subscribe();
        collector.start_collecting("a1", Arc::new(FixedSource { memory_used_mb: 0.0 }));
        collector.stop_collecting("a1");
        collector.record_metrics("a1", metrics_with_memory(500.0));

        let summary = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(MetricsEvent::SystemSummary(summary)) = events.recv().await {
                    break summary;
                }
            }
        })
        .await
        .expect("no summary published");
        assert_eq!(summary.total_agents, 1);

        match collector.generate_report(None) {
            Some(MetricsReport::System(report)) => {
                assert_eq!(report.agents.len(), 1);
                assert!(report
                    .recommendations
                    .iter()
                    .any(|r| r.starts_with("High average memory usage")));
            }
            other => panic!("unexpected report: {:?}", other),
        }
        assert!(collector.generate_report(Some("ghost")).is_none());
        collector.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_sampling() {
        let collector = MetricsCollector::new(fast_config());
        collector.start_collecting("a1", Arc::new(FixedSource { memory_used_mb: 1.0 }));
        collector.start_collecting("a2", Arc::new(FixedSource { memory_used_mb: 1.0 }));

        collector.shutdown();
        collector.shutdown();

        assert!(!collector.is_collecting("a1"));
        assert!(!collector.is_collecting("a2"));
        let before = collector.history("a1", None).unwrap().len();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(collector.history("a1", None).unwrap().len(), before);
    }
}
