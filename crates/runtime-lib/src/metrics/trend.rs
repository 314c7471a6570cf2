//! Trend heuristics over a metrics window
//!
//! Two analyses:
//! - Windowed trend: the mean of the newest samples against the window before it
//! - Leak detection: linear regression slope plus monotonicity on memory samples

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::time::Duration;

/// Samples in each of the two compared windows
pub const TREND_WINDOW: usize = 10;

/// Relative change beyond which a series counts as moving
const TREND_THRESHOLD: f64 = 0.10;

/// Minimum samples required for leak detection
const MIN_SAMPLES_FOR_DETECTION: usize = 10;

/// Fraction of steps that must not decrease for a leak
const MONOTONICITY_THRESHOLD: f64 = 0.95;

/// Projections further out than a year are not stamped with a date
const MAX_PROJECTION_SECS: f64 = 365.0 * 24.0 * 3600.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsTrend {
    pub memory_trend: Trend,
    pub cpu_trend: Trend,
    pub samples_analyzed: usize,
}

impl MetricsTrend {
    pub fn from_series(memory: &[f64], cpu: &[f64]) -> Self {
        Self {
            memory_trend: series_trend(memory),
            cpu_trend: series_trend(cpu),
            samples_analyzed: memory.len().min(2 * TREND_WINDOW),
        }
    }
}

/// Compare the newest [`TREND_WINDOW`] values with the ones just before them
pub fn series_trend(values: &[f64]) -> Trend {
    if values.len() <= TREND_WINDOW {
        return Trend::Stable;
    }

    let split = values.len() - TREND_WINDOW;
    let recent = mean(&values[split..]);
    let older = mean(&values[split.saturating_sub(TREND_WINDOW)..split]);

    if older == 0.0 {
        return if recent > 0.0 {
            Trend::Increasing
        } else {
            Trend::Stable
        };
    }

    let change = (recent - older) / older;
    if change > TREND_THRESHOLD {
        Trend::Increasing
    } else if change < -TREND_THRESHOLD {
        Trend::Decreasing
    } else {
        Trend::Stable
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Detects steady memory growth via linear regression on memory samples
pub struct LeakDetector {
    /// Only samples this close to the newest one are analyzed
    pub window_size: Duration,
    /// Minimum slope (MB/sec) to consider a leak
    pub slope_threshold: f64,
}

impl LeakDetector {
    pub fn new(window_size: Duration, slope_threshold: f64) -> Self {
        Self {
            window_size,
            slope_threshold,
        }
    }

    /// Detect a leak from `(timestamp, memory_mb)` samples sorted by time.
    ///
    /// `memory_limit_mb` enables projecting when the allocation runs out.
    pub fn detect(
        &self,
        samples: &[(DateTime<Utc>, f64)],
        memory_limit_mb: Option<f64>,
    ) -> Option<LeakAnalysis> {
        if samples.len() < MIN_SAMPLES_FOR_DETECTION {
            return None;
        }

        let window = self.filter_window(samples);
        if window.len() < MIN_SAMPLES_FOR_DETECTION {
            return None;
        }

        let slope = linear_regression_slope(&window);
        if slope <= self.slope_threshold {
            return None;
        }

        let monotonicity = monotonicity(&window);
        if monotonicity < MONOTONICITY_THRESHOLD {
            return None;
        }

        let r_squared = r_squared(&window, slope);
        let (latest, current_mb) = samples[samples.len() - 1];

        Some(LeakAnalysis {
            slope_mb_per_sec: slope,
            leak_rate_mb_per_hour: slope * 3600.0,
            projected_exhaustion: memory_limit_mb
                .map(|limit| project_exhaustion(latest, current_mb, limit, slope)),
            confidence: r_squared * monotonicity,
            current_memory_mb: current_mb,
            samples_analyzed: window.len(),
        })
    }

    fn filter_window(&self, samples: &[(DateTime<Utc>, f64)]) -> Vec<(f64, f64)> {
        let Some((latest, _)) = samples.last() else {
            return Vec::new();
        };
        let window = ChronoDuration::from_std(self.window_size)
            .unwrap_or_else(|_| ChronoDuration::hours(1));
        let window_start = *latest - window;

        let in_window: Vec<_> = samples
            .iter()
            .filter(|(ts, _)| *ts >= window_start)
            .collect();
        let Some((t0, _)) = in_window.first() else {
            return Vec::new();
        };

        // Seconds since the first sample keeps the regression well conditioned
        in_window
            .iter()
            .map(|(ts, mb)| ((*ts - *t0).num_milliseconds() as f64 / 1000.0, *mb))
            .collect()
    }
}

impl Default for LeakDetector {
    fn default() -> Self {
        Self {
            window_size: Duration::from_secs(3600),
            slope_threshold: 0.001,
        }
    }
}

fn linear_regression_slope(samples: &[(f64, f64)]) -> f64 {
    let n = samples.len() as f64;
    if n < 2.0 {
        return 0.0;
    }

    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    let mut sum_xy = 0.0;
    let mut sum_xx = 0.0;

    for (x, y) in samples {
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_xx += x * x;
    }

    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator.abs() < f64::EPSILON {
        return 0.0;
    }

    (n * sum_xy - sum_x * sum_y) / denominator
}

/// Coefficient of determination for the fitted line
fn r_squared(samples: &[(f64, f64)], slope: f64) -> f64 {
    let n = samples.len() as f64;
    if n < 2.0 {
        return 0.0;
    }

    let mean_x = samples.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = samples.iter().map(|(_, y)| y).sum::<f64>() / n;
    let intercept = mean_y - slope * mean_x;

    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    for (x, y) in samples {
        ss_res += (y - (slope * x + intercept)).powi(2);
        ss_tot += (y - mean_y).powi(2);
    }

    if ss_tot.abs() < f64::EPSILON {
        return 0.0;
    }

    1.0 - ss_res / ss_tot
}

fn monotonicity(samples: &[(f64, f64)]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }

    let non_decreasing = samples.windows(2).filter(|w| w[1].1 >= w[0].1).count();
    non_decreasing as f64 / (samples.len() - 1) as f64
}

fn project_exhaustion(
    latest: DateTime<Utc>,
    current_mb: f64,
    limit_mb: f64,
    slope: f64,
) -> ProjectedExhaustion {
    let seconds_remaining = ((limit_mb - current_mb) / slope).max(0.0);
    let at = if seconds_remaining < MAX_PROJECTION_SECS {
        ChronoDuration::from_std(Duration::from_secs_f64(seconds_remaining))
            .ok()
            .and_then(|remaining| latest.checked_add_signed(remaining))
    } else {
        None
    };

    ProjectedExhaustion {
        limit_mb,
        seconds_remaining,
        at,
    }
}

/// When the memory allocation would run out at the current slope
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectedExhaustion {
    pub limit_mb: f64,
    pub seconds_remaining: f64,
    /// Absent when the projection is too far out to be meaningful
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeakAnalysis {
    pub slope_mb_per_sec: f64,
    pub leak_rate_mb_per_hour: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projected_exhaustion: Option<ProjectedExhaustion>,
    /// R² times monotonicity, 0.0 to 1.0
    pub confidence: f64,
    pub current_memory_mb: f64,
    pub samples_analyzed: usize,
}
