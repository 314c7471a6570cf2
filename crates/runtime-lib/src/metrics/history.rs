//! Bounded per-agent sample history and its rollup

use crate::models::{millis_between, ExecutionMetrics, ResourceUsage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// One timestamped reading of an agent's metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSample {
    pub timestamp: DateTime<Utc>,
    pub metrics: ExecutionMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<ResourceUsage>,
}

/// Rollup recomputed from the retained window on every append
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregatedMetrics {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub total_errors: u64,
    pub total_network_requests: u64,
    /// Mean over samples that carry a duration; 0 when none do
    pub average_execution_time_ms: f64,
    pub average_memory_mb: f64,
    pub average_cpu_percent: f64,
    pub peak_memory_mb: f64,
    pub peak_cpu_percent: f64,
    pub uptime_ms: u64,
}

impl AggregatedMetrics {
    /// Share of samples that recorded at least one error
    pub fn error_rate(&self) -> f64 {
        if self.total_executions == 0 {
            return 0.0;
        }
        self.failed_executions as f64 / self.total_executions as f64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsHistory {
    pub agent_id: String,
    pub start_time: DateTime<Utc>,
    pub samples: VecDeque<MetricsSample>,
    pub aggregated: AggregatedMetrics,
}

impl MetricsHistory {
    pub fn new(agent_id: &str, start_time: DateTime<Utc>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            start_time,
            samples: VecDeque::new(),
            aggregated: AggregatedMetrics::default(),
        }
    }

    /// Append a sample, keep the newest `max_samples`, and recompute the rollup
    pub(crate) fn push(&mut self, sample: MetricsSample, max_samples: usize, now: DateTime<Utc>) {
        self.samples.push_back(sample);
        while self.samples.len() > max_samples {
            self.samples.pop_front();
        }
        self.aggregated = aggregate(&self.samples, self.start_time, now);
    }

    /// Newest `limit` samples, oldest first
    pub fn recent(&self, limit: Option<usize>) -> Vec<MetricsSample> {
        let limit = limit.unwrap_or(self.samples.len());
        let skip = self.samples.len().saturating_sub(limit);
        self.samples.iter().skip(skip).cloned().collect()
    }

    pub fn memory_series(&self) -> Vec<f64> {
        self.samples
            .iter()
            .map(|s| s.metrics.memory_used_mb)
            .collect()
    }

    pub fn cpu_series(&self) -> Vec<f64> {
        self.samples
            .iter()
            .map(|s| s.metrics.cpu_used_percent)
            .collect()
    }

    /// Rollup with uptime refreshed to `now`
    pub fn aggregated_at(&self, now: DateTime<Utc>) -> AggregatedMetrics {
        AggregatedMetrics {
            uptime_ms: millis_between(self.start_time, now),
            ..self.aggregated.clone()
        }
    }
}

fn aggregate(
    samples: &VecDeque<MetricsSample>,
    start_time: DateTime<Utc>,
    now: DateTime<Utc>,
) -> AggregatedMetrics {
    let uptime_ms = millis_between(start_time, now);
    if samples.is_empty() {
        return AggregatedMetrics {
            uptime_ms,
            ..AggregatedMetrics::default()
        };
    }

    let count = samples.len() as f64;
    let mut rollup = AggregatedMetrics {
        total_executions: samples.len() as u64,
        uptime_ms,
        ..AggregatedMetrics::default()
    };

    let mut memory_sum = 0.0;
    let mut cpu_sum = 0.0;
    let mut duration_sum = 0u64;
    let mut with_duration = 0u64;

    for sample in samples {
        let m = &sample.metrics;
        rollup.total_errors += m.error_count;
        rollup.total_network_requests += m.network_requests;
        if m.error_count == 0 {
            rollup.successful_executions += 1;
        }
        if let Some(duration) = m.duration_ms {
            duration_sum += duration;
            with_duration += 1;
        }

        memory_sum += m.memory_used_mb;
        cpu_sum += m.cpu_used_percent;
        rollup.peak_memory_mb = rollup.peak_memory_mb.max(m.memory_used_mb);
        rollup.peak_cpu_percent = rollup.peak_cpu_percent.max(m.cpu_used_percent);
    }

    rollup.failed_executions = rollup.total_executions - rollup.successful_executions;
    rollup.average_memory_mb = memory_sum / count;
    rollup.average_cpu_percent = cpu_sum / count;
    if with_duration > 0 {
        rollup.average_execution_time_ms = duration_sum as f64 / with_duration as f64;
    }

    rollup
}
