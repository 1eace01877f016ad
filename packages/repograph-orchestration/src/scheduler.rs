//! Scheduler front door
//!
//! Holds delayed submissions in a min-heap keyed by due instant and releases them to the
//! orchestrator's admission channel from a single timer-driven loop. Due instants are
//! tokio [`Instant`]s, so paused-clock tests drive the scheduler deterministically.

use crate::job::{JobId, JobRequest};
use crate::metrics::millis;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// When a submission should run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    /// Absolute time; takes precedence over `countdown`
    pub eta: Option<DateTime<Utc>>,
    /// Delay from submission
    pub countdown: Option<Duration>,
}

impl Schedule {
    pub fn at(eta: DateTime<Utc>) -> Self {
        Self {
            eta: Some(eta),
            countdown: None,
        }
    }

    pub fn after(countdown: Duration) -> Self {
        Self {
            eta: None,
            countdown: Some(countdown),
        }
    }

    pub fn after_secs(seconds: u64) -> Self {
        Self::after(Duration::from_secs(seconds))
    }

    /// Neither field set: admit immediately
    pub fn is_immediate(&self) -> bool {
        self.eta.is_none() && self.countdown.is_none()
    }

    /// Wall-clock due time for a submission made at `now`
    pub fn due_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.resolve(now).1
    }

    /// Delay from now and the resulting wall-clock due time
    fn resolve(&self, now: DateTime<Utc>) -> (Duration, DateTime<Utc>) {
        match (self.eta, self.countdown) {
            (Some(eta), _) => ((eta - now).to_std().unwrap_or(Duration::ZERO), eta),
            (None, Some(countdown)) => {
                let due = chrono::Duration::from_std(countdown)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                (countdown, due)
            }
            (None, None) => (Duration::ZERO, now),
        }
    }
}

/// Cap for delays past what `Instant` can represent (about 30 years)
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE)
}

/// A submission waiting for its due time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub job_id: JobId,
    pub request: JobRequest,
    pub due_at: DateTime<Utc>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug)]
struct HeapEntry {
    deadline: Instant,
    seq: u64,
    entry: ScheduleEntry,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Timer-driven front door in front of the orchestrator
#[derive(Debug)]
pub struct Scheduler {
    heap: Mutex<BinaryHeap<Reverse<HeapEntry>>>,
    notify: Notify,
    seq: AtomicU64,
    admit: mpsc::UnboundedSender<ScheduleEntry>,
}

impl Scheduler {
    /// Create the scheduler and the receiving end of its admission channel
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ScheduleEntry>) {
        let (admit, rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            admit,
        });
        (scheduler, rx)
    }

    /// Queue a submission; returns its wall-clock due time
    pub fn schedule(&self, job_id: JobId, request: JobRequest, schedule: Schedule) -> DateTime<Utc> {
        let now = Utc::now();
        let (delay, due_at) = schedule.resolve(now);
        let entry = HeapEntry {
            deadline: deadline_after(delay),
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            entry: ScheduleEntry {
                job_id,
                request,
                due_at,
                submitted_at: now,
            },
        };

        self.heap.lock().push(Reverse(entry));
        debug!(job_id = %job_id, due_at = %due_at, delay_ms = millis(delay), "Job scheduled");
        self.notify.notify_one();
        due_at
    }

    /// Hand a submission straight to admission, bypassing the heap.
    ///
    /// False once the admission side is gone.
    pub fn release(&self, job_id: JobId, request: JobRequest) -> bool {
        let now = Utc::now();
        self.admit
            .send(ScheduleEntry {
                job_id,
                request,
                due_at: now,
                submitted_at: now,
            })
            .is_ok()
    }

    /// Remove a not-yet-due entry; false when it was not queued
    pub fn cancel(&self, job_id: JobId) -> bool {
        let removed = {
            let mut heap = self.heap.lock();
            let before = heap.len();
            heap.retain(|Reverse(e)| e.entry.job_id != job_id);
            heap.len() < before
        };
        if removed {
            debug!(job_id = %job_id, "Scheduled job removed");
            self.notify.notify_one();
        }
        removed
    }

    /// Queued entries, earliest first
    pub fn pending(&self) -> Vec<ScheduleEntry> {
        let heap = self.heap.lock();
        let mut entries: Vec<&HeapEntry> = heap.iter().map(|Reverse(e)| e).collect();
        entries.sort();
        entries.into_iter().map(|e| e.entry.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.heap.lock().peek().map(|Reverse(e)| e.deadline)
    }

    /// Pop every due entry; stops early if the orchestrator is gone
    fn admit_due(&self) -> bool {
        let now = Instant::now();
        loop {
            let entry = {
                let mut heap = self.heap.lock();
                let due = matches!(heap.peek(), Some(Reverse(e)) if e.deadline <= now);
                if due {
                    heap.pop().map(|Reverse(e)| e.entry)
                } else {
                    None
                }
            };
            let Some(entry) = entry else { return true };
            info!(job_id = %entry.job_id, "Scheduled job due; admitting");
            if self.admit.send(entry).is_err() {
                return false;
            }
        }
    }

    /// Timer loop: sleep until the earliest deadline or until the heap changes
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let next = self.next_deadline();
            let sleep = async move {
                match next {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.notify.notified() => continue,
                _ = sleep => {
                    if !self.admit_due() {
                        break;
                    }
                }
            }
        }
        debug!(pending = self.len(), "Scheduler loop stopped");
    }
}
