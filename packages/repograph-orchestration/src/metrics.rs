use crate::job::JobStatus;
use crate::throttle::ThrottleSnapshot;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Whole milliseconds, saturating at `u64::MAX`
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// One finished job, as seen by the metrics window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobSample {
    pub status: JobStatus,
    pub duration: Duration,
    /// Time spent waiting for the job's throttle token
    pub token_wait: Duration,
}

/// Nearest-rank percentiles in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
    pub max: u64,
}

impl Percentiles {
    pub fn from_millis(mut values: Vec<u64>) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        values.sort_unstable();
        Self {
            p50: nearest_rank(&values, 50),
            p90: nearest_rank(&values, 90),
            p99: nearest_rank(&values, 99),
            max: values[values.len() - 1],
        }
    }
}

/// `values` must be sorted and non-empty
fn nearest_rank(values: &[u64], percentile: usize) -> u64 {
    let rank = (percentile * values.len()).div_ceil(100).max(1);
    values[rank.min(values.len()) - 1]
}

/// Aggregate over the recent-job window
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetricsSummary {
    pub samples: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub duration_ms: Percentiles,
    pub token_wait_ms: Percentiles,
}

/// Resource status surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub available_tokens: usize,
    pub max_tokens: usize,
    pub recent_jobs: JobMetricsSummary,
}

impl ResourceStatus {
    pub fn new(snapshot: ThrottleSnapshot, recent_jobs: JobMetricsSummary) -> Self {
        Self {
            available_tokens: snapshot.available,
            max_tokens: snapshot.max,
            recent_jobs,
        }
    }
}

/// Bounded window of recent job samples
#[derive(Debug)]
pub struct JobMetrics {
    window: usize,
    samples: Mutex<VecDeque<JobSample>>,
}

impl JobMetrics {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: Mutex::new(VecDeque::with_capacity(window)),
        }
    }

    pub fn record(&self, sample: JobSample) {
        let mut samples = self.samples.lock();
        if samples.len() == self.window {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    pub fn summary(&self) -> JobMetricsSummary {
        let samples = self.samples.lock();
        let count = |status: JobStatus| samples.iter().filter(|s| s.status == status).count();
        JobMetricsSummary {
            samples: samples.len(),
            completed: count(JobStatus::Completed),
            failed: count(JobStatus::Failed),
            cancelled: count(JobStatus::Cancelled),
            duration_ms: Percentiles::from_millis(
                samples.iter().map(|s| millis(s.duration)).collect(),
            ),
            token_wait_ms: Percentiles::from_millis(
                samples.iter().map(|s| millis(s.token_wait)).collect(),
            ),
        }
    }
}
