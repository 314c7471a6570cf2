//! Metrics summaries and reports

use super::history::{AggregatedMetrics, MetricsHistory};
use super::trend::{LeakAnalysis, LeakDetector, MetricsTrend};
use chrono::{DateTime, Utc};
use serde::Serialize;

const HIGH_AVERAGE_MEMORY_MB: f64 = 400.0;
const HIGH_AVERAGE_CPU_PERCENT: f64 = 80.0;
const HIGH_ERROR_RATE: f64 = 0.10;
const SLOW_EXECUTION_MS: f64 = 30_000.0;

/// Totals across every tracked agent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemSummary {
    pub generated_at: DateTime<Utc>,
    pub total_agents: usize,
    pub collecting_agents: usize,
    pub total_executions: u64,
    pub failed_executions: u64,
    pub total_errors: u64,
    pub total_network_requests: u64,
    pub overall_error_rate: f64,
    /// Mean of per-agent averages over agents with samples
    pub average_memory_mb: f64,
    pub average_cpu_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub average_memory_mb: f64,
    pub peak_memory_mb: f64,
    pub average_cpu_percent: f64,
    pub peak_cpu_percent: f64,
    pub average_execution_time_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentMetricsReport {
    pub agent_id: String,
    pub generated_at: DateTime<Utc>,
    pub summary: AggregatedMetrics,
    pub error_rate: f64,
    pub performance: PerformanceSummary,
    pub trend: MetricsTrend,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_leak: Option<LeakAnalysis>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemMetricsReport {
    pub generated_at: DateTime<Utc>,
    pub summary: SystemSummary,
    pub performance: PerformanceSummary,
    pub agents: Vec<AgentMetricsReport>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum MetricsReport {
    Agent(AgentMetricsReport),
    System(SystemMetricsReport),
}

impl SystemSummary {
    /// More than one in ten executions failed
    pub fn has_high_error_rate(&self) -> bool {
        self.overall_error_rate > HIGH_ERROR_RATE
    }

    pub(crate) fn build(
        histories: &[MetricsHistory],
        collecting_agents: usize,
        now: DateTime<Utc>,
    ) -> Self {
        let rollups: Vec<_> = histories.iter().map(|h| &h.aggregated).collect();

        let total_executions = rollups.iter().map(|r| r.total_executions).sum::<u64>();
        let failed_executions = rollups.iter().map(|r| r.failed_executions).sum::<u64>();
        let sampled: Vec<_> = rollups
            .iter()
            .filter(|r| r.total_executions > 0)
            .collect();

        Self {
            generated_at: now,
            total_agents: histories.len(),
            collecting_agents,
            total_executions,
            failed_executions,
            total_errors: rollups.iter().map(|r| r.total_errors).sum(),
            total_network_requests: rollups.iter().map(|r| r.total_network_requests).sum(),
            overall_error_rate: ratio(failed_executions, total_executions),
            average_memory_mb: mean(sampled.iter().map(|r| r.average_memory_mb)),
            average_cpu_percent: mean(sampled.iter().map(|r| r.average_cpu_percent)),
        }
    }
}

impl AgentMetricsReport {
    pub(crate) fn build(
        history: &MetricsHistory,
        detector: &LeakDetector,
        now: DateTime<Utc>,
    ) -> Self {
        let summary = history.aggregated_at(now);
        let error_rate = summary.error_rate();
        let trend = MetricsTrend::from_series(&history.memory_series(), &history.cpu_series());

        let timed_memory: Vec<_> = history
            .samples
            .iter()
            .map(|s| (s.timestamp, s.metrics.memory_used_mb))
            .collect();
        let memory_limit = history
            .samples
            .back()
            .and_then(|s| s.resource_usage.as_ref())
            .map(|u| u.memory_limit);
        let memory_leak = detector.detect(&timed_memory, memory_limit);

        let performance = PerformanceSummary {
            average_memory_mb: summary.average_memory_mb,
            peak_memory_mb: summary.peak_memory_mb,
            average_cpu_percent: summary.average_cpu_percent,
            peak_cpu_percent: summary.peak_cpu_percent,
            average_execution_time_ms: summary.average_execution_time_ms,
        };

        let mut recommendations = recommendations(&performance, error_rate);
        if let Some(leak) = &memory_leak {
            recommendations.push(format!(
                "Possible memory leak: memory growing at {:.1} MB/hour",
                leak.leak_rate_mb_per_hour
            ));
        }

        Self {
            agent_id: history.agent_id.clone(),
            generated_at: now,
            summary,
            error_rate,
            performance,
            trend,
            memory_leak,
            recommendations,
        }
    }
}

impl SystemMetricsReport {
    pub(crate) fn build(
        summary: SystemSummary,
        mut agents: Vec<AgentMetricsReport>,
        now: DateTime<Utc>,
    ) -> Self {
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

        let sampled: Vec<_> = agents
            .iter()
            .filter(|a| a.summary.total_executions > 0)
            .map(|a| &a.performance)
            .collect();
        let timed: Vec<_> = sampled
            .iter()
            .filter(|p| p.average_execution_time_ms > 0.0)
            .collect();

        let performance = PerformanceSummary {
            average_memory_mb: summary.average_memory_mb,
            peak_memory_mb: sampled.iter().map(|p| p.peak_memory_mb).fold(0.0, f64::max),
            average_cpu_percent: summary.average_cpu_percent,
            peak_cpu_percent: sampled.iter().map(|p| p.peak_cpu_percent).fold(0.0, f64::max),
            average_execution_time_ms: mean(timed.iter().map(|p| p.average_execution_time_ms)),
        };

        let mut recommendations = recommendations(&performance, summary.overall_error_rate);
        let leaking = agents.iter().filter(|a| a.memory_leak.is_some()).count();
        if leaking > 0 {
            recommendations.push(format!(
                "{} agent(s) show steady memory growth; review their memory leak analysis",
                leaking
            ));
        }

        Self {
            generated_at: now,
            summary,
            performance,
            agents,
            recommendations,
        }
    }
}

fn recommendations(performance: &PerformanceSummary, error_rate: f64) -> Vec<String> {
    let mut recommendations = Vec::new();

    if performance.average_memory_mb > HIGH_AVERAGE_MEMORY_MB {
        recommendations.push(format!(
            "High average memory usage ({:.1} MB); consider raising the memory allocation or reducing footprint",
            performance.average_memory_mb
        ));
    }

    if performance.average_cpu_percent > HIGH_AVERAGE_CPU_PERCENT {
        recommendations.push(format!(
            "High average CPU usage ({:.1}%); consider allocating more CPU cores",
            performance.average_cpu_percent
        ));
    }

    if error_rate > HIGH_ERROR_RATE {
        recommendations.push(format!(
            "High error rate ({:.1}%); investigate failing executions",
            error_rate * 100.0
        ));
    }

    if performance.average_execution_time_ms > SLOW_EXECUTION_MS {
        recommendations.push(format!(
            "Slow average execution time ({:.1}s); consider optimizing the agent or raising its timeout",
            performance.average_execution_time_ms / 1000.0
        ));
    }

    recommendations
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::history::MetricsSample;
    use crate::metrics::trend::Trend;
    use crate::models::ExecutionMetrics;

    fn history_with(agent_id: &str, points: &[(f64, f64, u64)]) -> MetricsHistory {
        let start = Utc::now();
        let mut history = MetricsHistory::new(agent_id, start);
        for (memory, cpu, errors) in points {
            let mut metrics = ExecutionMetrics::new(start);
            metrics.memory_used_mb = *memory;
            metrics.cpu_used_percent = *cpu;
            metrics.error_count = *errors;
            history.push(
                MetricsSample {
                    timestamp: start,
                    metrics,
                    resource_usage: None,
                },
                1000,
                start,
            );
        }
        history
    }

    #[test]
    fn test_quiet_agent_has_no_recommendations() {
        let history = history_with("a1", &[(64.0, 5.0, 0); 5]);
        let report = AgentMetricsReport::build(&history, &LeakDetector::default(), Utc::now());

        assert!(report.recommendations.is_empty());
        assert_eq!(report.trend.memory_trend, Trend::Stable);
        assert!(report.memory_leak.is_none());
    }

    #[test]
    fn test_threshold_recommendations() {
        let history = history_with("a1", &[(512.0, 90.0, 1), (512.0, 90.0, 0)]);
        let report = AgentMetricsReport::build(&history, &LeakDetector::default(), Utc::now());

        assert_eq!(report.error_rate, 0.5);
        let text = report.recommendations.join("\n");
        assert!(text.contains("High average memory usage (512.0 MB)"));
        assert!(text.contains("High average CPU usage (90.0%)"));
        assert!(text.contains("High error rate (50.0%)"));
        assert!(!text.contains("Slow average execution time"));
    }

    #[test]
    fn test_system_summary_totals() {
        let busy = history_with("busy", &[(100.0, 10.0, 0), (300.0, 30.0, 2)]);
        let idle = history_with("idle", &[]);
        let summary = SystemSummary::build(&[busy, idle], 1, Utc::now());

        assert_eq!(summary.total_agents, 2);
        assert_eq!(summary.collecting_agents, 1);
        assert_eq!(summary.total_executions, 2);
        assert_eq!(summary.total_errors, 2);
        assert_eq!(summary.overall_error_rate, 0.5);
        // Idle agents do not drag the averages down
        assert_eq!(summary.average_memory_mb, 200.0);
        assert_eq!(summary.average_cpu_percent, 20.0);
    }

    #[test]
    fn test_system_report_sorted_and_peaks() {
        let a = history_with("b", &[(100.0, 10.0, 0)]);
        let b = history_with("a", &[(450.0, 60.0, 0)]);
        let now = Utc::now();
        let detector = LeakDetector::default();

        let summary = SystemSummary::build(&[a.clone(), b.clone()], 2, now);
        let agents = vec![
            AgentMetricsReport::build(&a, &detector, now),
            AgentMetricsReport::build(&b, &detector, now),
        ];
        let report = SystemMetricsReport::build(summary, agents, now);

        assert_eq!(report.agents[0].agent_id, "a");
        assert_eq!(report.performance.peak_memory_mb, 450.0);
        assert_eq!(report.performance.peak_cpu_percent, 60.0);
        assert_eq!(report.performance.average_memory_mb, 275.0);
        assert!(report.recommendations.is_empty());
    }
}
