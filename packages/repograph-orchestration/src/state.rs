//! Job/step state table
//!
//! Every job record lives here from submission until it is purged. Mutations go through
//! [`JobStateMachine`] under the map's per-entry lock, and are announced to observers as
//! [`JobEvent`]s.

use crate::error::{OrchestratorError, Result};
use crate::job::{Job, JobId, JobStateMachine, JobStatus, JobStatusReport, StepStatus};
use crate::pipeline::StepProgress;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 1024;

/// Lifecycle notifications for external observers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    JobAdmitted {
        job_id: JobId,
    },
    StepStarted {
        job_id: JobId,
        step: String,
        attempt: u32,
    },
    StepRetrying {
        job_id: JobId,
        step: String,
        retry_count: u32,
        delay_ms: u64,
        error: String,
    },
    StepFinished {
        job_id: JobId,
        step: String,
        status: StepStatus,
    },
    JobFinished {
        job_id: JobId,
        status: JobStatus,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::JobAdmitted { job_id }
            | JobEvent::StepStarted { job_id, .. }
            | JobEvent::StepRetrying { job_id, .. }
            | JobEvent::StepFinished { job_id, .. }
            | JobEvent::JobFinished { job_id, .. } => *job_id,
        }
    }
}

/// Which request interrupted a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Interrupt {
    /// Current step cancelled, later steps skipped
    Stop,
    /// Current step cancelled, later steps cancelled
    Cancel,
}

/// Cooperative cancellation handle of one job
#[derive(Debug, Default)]
pub struct JobControl {
    token: CancellationToken,
    interrupt: Mutex<Option<Interrupt>>,
}

impl JobControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `interrupt` and trigger the job token.
    ///
    /// A cancel upgrades an earlier stop; a later stop never downgrades a cancel.
    pub fn request(&self, interrupt: Interrupt) {
        {
            let mut current = self.interrupt.lock();
            *current = Some(current.map_or(interrupt, |c| c.max(interrupt)));
        }
        self.token.cancel();
    }

    pub fn interrupt(&self) -> Option<Interrupt> {
        *self.interrupt.lock()
    }

    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Token for one attempt; fires with the job token, or on its own for timeouts
    pub fn attempt_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

/// Shared job/step state
#[derive(Debug)]
pub struct JobTable {
    jobs: DashMap<JobId, Job>,
    controls: DashMap<JobId, Arc<JobControl>>,
    events: broadcast::Sender<JobEvent>,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTable {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            jobs: DashMap::new(),
            controls: DashMap::new(),
            events,
        }
    }

    pub fn insert(&self, job: Job) -> Arc<JobControl> {
        let control = Arc::new(JobControl::new());
        self.controls.insert(job.id, control.clone());
        self.jobs.insert(job.id, job);
        control
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.jobs.contains_key(&job_id)
    }

    pub fn get(&self, job_id: JobId) -> Result<Job> {
        self.jobs
            .get(&job_id)
            .map(|job| job.clone())
            .ok_or(OrchestratorError::JobNotFound(job_id))
    }

    pub fn status(&self, job_id: JobId) -> Result<JobStatus> {
        self.jobs
            .get(&job_id)
            .map(|job| job.status)
            .ok_or(OrchestratorError::JobNotFound(job_id))
    }

    pub fn report(&self, job_id: JobId) -> Result<JobStatusReport> {
        self.jobs
            .get(&job_id)
            .map(|job| JobStatusReport::from(&*job))
            .ok_or(OrchestratorError::JobNotFound(job_id))
    }

    /// Reports of every retained job, oldest first
    pub fn list(&self) -> Vec<JobStatusReport> {
        let mut reports: Vec<_> = self
            .jobs
            .iter()
            .map(|entry| JobStatusReport::from(entry.value()))
            .collect();
        reports.sort_by_key(|r| (r.created_at, r.job_id));
        reports
    }

    pub fn control(&self, job_id: JobId) -> Result<Arc<JobControl>> {
        self.controls
            .get(&job_id)
            .map(|c| c.clone())
            .ok_or(OrchestratorError::JobNotFound(job_id))
    }

    /// Apply a transition under the entry lock
    pub fn update<R>(
        &self,
        job_id: JobId,
        f: impl FnOnce(&mut JobStateMachine<'_>) -> Result<R>,
    ) -> Result<R> {
        let mut job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(OrchestratorError::JobNotFound(job_id))?;
        let mut sm = JobStateMachine::new(&mut *job);
        f(&mut sm)
    }

    pub fn step_progress(&self, job_id: JobId, index: usize) -> Result<StepProgress> {
        let job = self
            .jobs
            .get(&job_id)
            .ok_or(OrchestratorError::JobNotFound(job_id))?;
        let step = job
            .steps
            .get(index)
            .ok_or_else(|| OrchestratorError::StageNotFound(format!("step #{}", index)))?;
        Ok(StepProgress {
            state: step.status,
            progress_percent: step.progress_percent,
            message: step.message.clone(),
        })
    }

    /// Remove a terminal job
    pub fn purge(&self, job_id: JobId) -> Result<Job> {
        let status = self.status(job_id)?;
        if !status.is_terminal() {
            return Err(OrchestratorError::InvalidStateTransition {
                from: status.as_str().to_string(),
                to: "purged".to_string(),
            });
        }
        self.controls.remove(&job_id);
        self.jobs
            .remove(&job_id)
            .map(|(_, job)| job)
            .ok_or(OrchestratorError::JobNotFound(job_id))
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn publish(&self, event: JobEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }
}
