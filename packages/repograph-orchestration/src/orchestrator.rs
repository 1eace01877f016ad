//! Pipeline orchestrator
//!
//! Owns the job table, the scheduler front door and the shared resource throttle. Each
//! admitted job holds one throttle token and runs its steps sequentially in configured
//! order; retries, step timeouts and stop/cancel requests are resolved here, stages only
//! ever see a [`StageContext`].

use crate::config::{AcquirePolicy, PipelineConfig, StepPolicy, Validatable};
use crate::error::{ErrorRecord, OrchestratorError, Result};
use crate::job::{
    Job, JobId, JobOptions, JobRequest, JobStateMachine, JobStatus, JobStatusReport, RunMode,
    StepStatus,
};
use crate::metrics::{millis, JobMetrics, JobSample, ResourceStatus};
use crate::pipeline::{Stage, StageContext, StageOutcome, StepHandle};
use crate::registry::{StageEnv, StageRegistry};
use crate::scheduler::{Schedule, ScheduleEntry, Scheduler};
use crate::state::{Interrupt, JobControl, JobEvent, JobTable};
use crate::throttle::{ResourceThrottle, ResourceToken};
use chrono::Utc;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CANCEL_REASON: &str = "cancelled by request";
const STOP_REASON: &str = "stopped by request";

/// How one step ended, before it is written to the state table
#[derive(Debug)]
enum StepResult {
    Completed(StageOutcome),
    /// Optional step gave up; the pipeline continues
    Skipped(ErrorRecord),
    Failed(ErrorRecord),
    /// Stop or cancel observed
    Interrupted,
}

/// Pipeline orchestrator
pub struct PipelineOrchestrator {
    config: PipelineConfig,
    policies: Vec<StepPolicy>,
    stages: HashMap<String, Arc<dyn Stage>>,
    table: Arc<JobTable>,
    throttle: ResourceThrottle,
    /// Admission limit in front of the throttle, so node tasks always find spare tokens
    job_slots: Arc<Semaphore>,
    scheduler: Arc<Scheduler>,
    metrics: JobMetrics,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("stages", &self.config.stage_names())
            .field("jobs", &self.table.len())
            .field("throttle", &self.throttle.snapshot())
            .finish()
    }
}

impl PipelineOrchestrator {
    /// Validate `config`, build every configured stage and start the scheduler and
    /// admission loops.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: PipelineConfig, registry: &StageRegistry) -> Result<Arc<Self>> {
        config.validate()?;
        let throttle = ResourceThrottle::from_config(&config.throttle);
        let stages = registry
            .instantiate(&StageEnv {
                config: &config,
                throttle: &throttle,
            })?
            .into_iter()
            .map(|stage| (stage.name().to_string(), stage))
            .collect();

        let (scheduler, admissions) = Scheduler::new();
        let shutdown = CancellationToken::new();
        let orchestrator = Arc::new(Self {
            policies: config.step_policies(),
            stages,
            table: Arc::new(JobTable::new()),
            job_slots: Arc::new(Semaphore::new(config.throttle.max_concurrent_jobs)),
            throttle,
            scheduler: scheduler.clone(),
            metrics: JobMetrics::new(config.metrics.window),
            shutdown: shutdown.clone(),
            config,
        });

        tokio::spawn(scheduler.run(shutdown.clone()));
        tokio::spawn(admission_loop(
            Arc::downgrade(&orchestrator),
            admissions,
            shutdown,
        ));

        info!(
            stages = ?orchestrator.config.stage_names(),
            max_tokens = orchestrator.throttle.max(),
            max_concurrent_jobs = orchestrator.config.throttle.max_concurrent_jobs,
            "Pipeline orchestrator started"
        );
        Ok(orchestrator)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The throttle shared by jobs and the DAG executor
    pub fn throttle(&self) -> &ResourceThrottle {
        &self.throttle
    }

    /// Submit a full-pipeline job.
    ///
    /// Returns once the job is recorded; it runs when admitted (immediately, or when
    /// `schedule` comes due).
    pub fn submit(
        &self,
        repository_ref: &str,
        options: JobOptions,
        schedule: Option<Schedule>,
    ) -> Result<JobId> {
        let request = JobRequest::new(repository_ref, options);
        self.create_job(request, self.policies.clone(), schedule)
    }

    /// Submit a job running only `steps`, in configured order, through each stage's
    /// incremental path
    pub fn update_only(
        &self,
        repository_ref: &str,
        options: JobOptions,
        steps: &[&str],
    ) -> Result<JobId> {
        if steps.is_empty() {
            return Err(OrchestratorError::fatal(
                "update_only needs at least one step",
            ));
        }
        if let Some(unknown) = steps.iter().find(|s| !self.stages.contains_key(**s)) {
            return Err(OrchestratorError::StageNotFound(unknown.to_string()));
        }
        let policies = self
            .policies
            .iter()
            .filter(|p| steps.contains(&p.name.as_str()))
            .cloned()
            .collect();
        self.create_job(
            JobRequest::update_only(repository_ref, options),
            policies,
            None,
        )
    }

    pub fn status(&self, job_id: JobId) -> Result<JobStatusReport> {
        self.table.report(job_id)
    }

    /// Every retained job, oldest first
    pub fn list_jobs(&self) -> Vec<JobStatusReport> {
        self.table.list()
    }

    /// Submissions still waiting for their due time
    pub fn scheduled(&self) -> Vec<ScheduleEntry> {
        self.scheduler.pending()
    }

    /// Stop the job's current step; later steps are skipped.
    ///
    /// No-op on a finished job. On a job that has not started a step yet, the stop
    /// applies when its first step would start.
    pub fn stop(&self, job_id: JobId) -> Result<()> {
        let control = self.table.control(job_id)?;
        let status = self.table.status(job_id)?;
        if status.is_terminal() {
            debug!(job_id = %job_id, status = %status, "Stop ignored; job already finished");
            return Ok(());
        }
        control.request(Interrupt::Stop);
        info!(job_id = %job_id, status = %status, "Stop requested");
        Ok(())
    }

    /// Cancel the job: the current step and every pending step end up cancelled.
    ///
    /// No-op on a finished job.
    pub fn cancel(&self, job_id: JobId) -> Result<()> {
        let control = self.table.control(job_id)?;
        let status = self.table.status(job_id)?;
        if status.is_terminal() {
            debug!(job_id = %job_id, status = %status, "Cancel ignored; job already finished");
            return Ok(());
        }
        control.request(Interrupt::Cancel);

        let unscheduled = self.scheduler.cancel(job_id);
        if !unscheduled && status == JobStatus::Running {
            info!(job_id = %job_id, "Cancel requested");
            return Ok(());
        }
        match self
            .table
            .update(job_id, |sm| sm.cancel_before_run(CANCEL_REASON))
        {
            Ok(()) => {
                self.table.publish(JobEvent::JobFinished {
                    job_id,
                    status: JobStatus::Cancelled,
                });
                info!(job_id = %job_id, "Job cancelled before running");
            }
            // Admitted in the meantime; the run loop applies the cancel
            Err(OrchestratorError::InvalidStateTransition { .. }) => {
                debug!(job_id = %job_id, "Cancel handed to running job");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Drop a finished job from the state table
    pub fn purge(&self, job_id: JobId) -> Result<()> {
        self.table.purge(job_id)?;
        debug!(job_id = %job_id, "Job purged");
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.table.subscribe()
    }

    pub fn resource_status(&self) -> ResourceStatus {
        ResourceStatus::new(self.throttle.snapshot(), self.metrics.summary())
    }

    /// Resolve once the job reaches a terminal status
    pub async fn wait_for(&self, job_id: JobId) -> Result<JobStatusReport> {
        let mut events = self.table.subscribe();
        loop {
            let report = self.table.report(job_id)?;
            if report.status.is_terminal() {
                return Ok(report);
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Ok(report),
            }
        }
    }

    /// Stop admitting work, cancel every unfinished job and wait for running ones to
    /// wind down
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let active: Vec<JobId> = self
            .table
            .list()
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.job_id)
            .collect();
        self.shutdown.cancel();

        for job_id in &active {
            if let Err(e) = self.cancel(*job_id) {
                warn!(job_id = %job_id, error = %e, "Cancel during shutdown failed");
            }
        }
        // Waiters outside any job get `Cancelled` too
        self.throttle.close();
        for job_id in &active {
            if let Err(e) = self.wait_for(*job_id).await {
                debug!(job_id = %job_id, error = %e, "Job vanished during shutdown");
            }
        }
        info!(cancelled = active.len(), "Pipeline orchestrator shut down");
    }

    fn create_job(
        &self,
        request: JobRequest,
        policies: Vec<StepPolicy>,
        schedule: Option<Schedule>,
    ) -> Result<JobId> {
        if self.shutdown.is_cancelled() {
            return Err(OrchestratorError::fatal("orchestrator is shut down"));
        }
        validate_repository_ref(&request.repository_ref)?;
        request.options.check_scopes(&self.config.stage_names())?;
        for policy in &policies {
            if let Some(stage) = self.stages.get(&policy.name) {
                stage.validate_options(&request.options.for_stage(&policy.name))?;
            }
        }

        let job = Job::new(&request, &policies);
        let job_id = job.id;
        self.table.insert(job);

        match schedule.filter(|s| !s.is_immediate()) {
            Some(schedule) => {
                self.table
                    .update(job_id, |sm| sm.schedule(schedule.due_at(Utc::now())))?;
                let due_at = self.scheduler.schedule(job_id, request.clone(), schedule);
                info!(
                    job_id = %job_id,
                    repository_ref = %request.repository_ref,
                    due_at = %due_at,
                    "Job scheduled"
                );
            }
            None => {
                if !self.scheduler.release(job_id, request.clone()) {
                    self.table
                        .update(job_id, |sm| sm.cancel_before_run("orchestrator is shut down"))?;
                    return Err(OrchestratorError::fatal("orchestrator is shut down"));
                }
                info!(
                    job_id = %job_id,
                    repository_ref = %request.repository_ref,
                    mode = ?request.mode,
                    steps = policies.len(),
                    "Job submitted"
                );
            }
        }
        Ok(job_id)
    }

    fn launch(self: Arc<Self>, job_id: JobId) {
        tokio::spawn(async move { self.run_job(job_id).await });
    }

    async fn run_job(&self, job_id: JobId) {
        let (job, control) = match (self.table.get(job_id), self.table.control(job_id)) {
            (Ok(job), Ok(control)) => (job, control),
            _ => {
                warn!(job_id = %job_id, "Admitted job no longer exists");
                return;
            }
        };
        if job.status.is_terminal() {
            debug!(job_id = %job_id, status = %job.status, "Job finished before admission");
            return;
        }

        let queued = Instant::now();
        // Retries already charged to the first step while waiting for capacity
        let mut admission_retries = None;
        let reservation = match self.reserve(&control).await {
            Err(e @ OrchestratorError::ResourceExhausted { .. }) => {
                match self.retry_admission(&job, &control, e, queued).await {
                    Some((slot, token, retries)) => {
                        admission_retries = Some(retries);
                        Ok((slot, token))
                    }
                    None => return,
                }
            }
            other => other,
        };
        let token_wait = queued.elapsed();
        let started = Instant::now();

        let (slot, token) = match reservation {
            Ok(reservation) => reservation,
            Err(e) => {
                self.finish_unreserved(job_id, &control, e, started, token_wait);
                return;
            }
        };
        if admission_retries.is_none() {
            if let Err(e) = self.table.update(job_id, |sm| sm.admit()) {
                debug!(job_id = %job_id, error = %e, "Job not admitted");
                return;
            }
            self.table.publish(JobEvent::JobAdmitted { job_id });
        }
        info!(
            job_id = %job_id,
            repository_ref = %job.repository_ref,
            steps = job.steps.len(),
            token_wait_ms = millis(token_wait),
            "Job admitted"
        );

        for (index, step) in job.steps.iter().enumerate() {
            if control.is_interrupted() {
                self.interrupt_step(&job, index, &control);
                break;
            }
            let target = self
                .policies
                .iter()
                .find(|p| p.name == step.name)
                .zip(self.stages.get(&step.name));
            let Some((policy, stage)) = target else {
                let record = OrchestratorError::StageNotFound(step.name.clone()).to_record();
                self.apply(job_id, |sm| {
                    sm.fail_step(index, record)?;
                    sm.skip_remaining(index);
                    Ok(())
                });
                break;
            };

            let resumed = if index == 0 { admission_retries } else { None };
            match self.run_step(&job, index, policy, stage, &control, resumed).await {
                StepResult::Completed(outcome) => {
                    info!(
                        job_id = %job_id,
                        step = %step.name,
                        items = outcome.items_processed,
                        "Step completed"
                    );
                    self.apply(job_id, |sm| sm.complete_step(index, outcome.message));
                    self.step_finished(job_id, &step.name, StepStatus::Completed);
                }
                StepResult::Skipped(record) => {
                    self.apply(job_id, |sm| sm.skip_step(index, Some(record)));
                    self.step_finished(job_id, &step.name, StepStatus::Skipped);
                }
                StepResult::Failed(record) => {
                    self.apply(job_id, |sm| {
                        sm.fail_step(index, record)?;
                        sm.skip_remaining(index);
                        Ok(())
                    });
                    self.step_finished(job_id, &step.name, StepStatus::Failed);
                    break;
                }
                StepResult::Interrupted => {
                    self.interrupt_step(&job, index, &control);
                    break;
                }
            }
        }

        // Tokens go back before observers hear about the finish
        drop(token);
        drop(slot);
        self.finish_job(job_id, started, token_wait);
    }

    /// Job slot, then one throttle token
    async fn reserve(
        &self,
        control: &JobControl,
    ) -> Result<(OwnedSemaphorePermit, ResourceToken)> {
        if control.is_interrupted() {
            return Err(OrchestratorError::Cancelled(
                "interrupted before admission".to_string(),
            ));
        }
        let slot = match self.throttle.policy() {
            AcquirePolicy::FailFast => self.job_slots.clone().try_acquire_owned().map_err(|_| {
                OrchestratorError::ResourceExhausted {
                    requested: 1,
                    available: self.throttle.snapshot().available,
                    max: self.throttle.max(),
                }
            })?,
            AcquirePolicy::Wait => tokio::select! {
                biased;
                _ = control.token().cancelled() => {
                    return Err(OrchestratorError::Cancelled(
                        "interrupted while waiting for a job slot".to_string(),
                    ));
                }
                slot = self.job_slots.clone().acquire_owned() => slot.map_err(|_| {
                    OrchestratorError::Cancelled("job slots closed".to_string())
                })?,
            },
        };
        let token = self.throttle.acquire_cancellable(1, control.token()).await?;
        Ok((slot, token))
    }

    /// Fail-fast admission found no capacity: retry the reservation on the first
    /// step's retry policy.
    ///
    /// The job is admitted with its first step running while it backs off, so the
    /// retries are visible on that step. Returns the reservation with the retries
    /// spent, or `None` once the job has been settled.
    async fn retry_admission(
        &self,
        job: &Job,
        control: &JobControl,
        mut err: OrchestratorError,
        queued: Instant,
    ) -> Option<(OwnedSemaphorePermit, ResourceToken, u32)> {
        let job_id = job.id;
        let first = job
            .steps
            .first()
            .and_then(|step| self.policies.iter().find(|p| p.name == step.name));
        let Some(policy) = first else {
            self.finish_unreserved(job_id, control, err, queued, queued.elapsed());
            return None;
        };
        let name = policy.name.as_str();
        self.apply(job_id, |sm| {
            sm.admit()?;
            sm.start_step(0)
        })?;
        self.table.publish(JobEvent::JobAdmitted { job_id });

        let mut retries = 0u32;
        loop {
            let record = err.to_record();
            let recorded = if err.is_retryable() && retries < policy.retry.max_retries {
                self.apply(job_id, |sm| sm.record_retry(0, record.clone()))
            } else {
                None
            };
            let Some(count) = recorded else {
                error!(
                    job_id = %job_id,
                    step = name,
                    retries,
                    category = %record.category,
                    error = %err,
                    "Job rejected at admission"
                );
                let failed = self.apply(job_id, |sm| {
                    sm.fail_step(0, record)?;
                    sm.skip_remaining(0);
                    Ok(())
                });
                if failed.is_some() {
                    self.step_finished(job_id, name, StepStatus::Failed);
                }
                self.finish_job(job_id, queued, queued.elapsed());
                return None;
            };
            retries = count;

            let delay = policy.retry.delay_for(retries);
            warn!(
                job_id = %job_id,
                step = name,
                retry = retries,
                max_retries = policy.retry.max_retries,
                delay_ms = millis(delay),
                error = %err,
                "No capacity at admission; retrying"
            );
            self.table.publish(JobEvent::StepRetrying {
                job_id,
                step: name.to_string(),
                retry_count: retries,
                delay_ms: millis(delay),
                error: record.message,
            });
            let interrupted = tokio::select! {
                _ = control.token().cancelled() => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if !interrupted {
                match self.reserve(control).await {
                    Ok((slot, token)) => return Some((slot, token, retries)),
                    Err(e) if !control.is_interrupted() => {
                        err = e;
                        continue;
                    }
                    Err(_) => {}
                }
            }
            self.interrupt_step(job, 0, control);
            self.finish_job(job_id, queued, queued.elapsed());
            return None;
        }
    }

    /// Settle a job that never got its reservation
    fn finish_unreserved(
        &self,
        job_id: JobId,
        control: &JobControl,
        err: OrchestratorError,
        started: Instant,
        token_wait: Duration,
    ) {
        match (&err, control.interrupt()) {
            (OrchestratorError::Cancelled(_), Some(Interrupt::Stop)) => {
                if self.apply(job_id, |sm| sm.admit()).is_some() {
                    if let Ok(job) = self.table.get(job_id) {
                        self.interrupt_step(&job, 0, control);
                    }
                    self.finish_job(job_id, started, token_wait);
                }
            }
            (OrchestratorError::Cancelled(_), _) => {
                // Usually already settled by `cancel`
                if self
                    .table
                    .update(job_id, |sm| sm.cancel_before_run(CANCEL_REASON))
                    .is_ok()
                {
                    self.table.publish(JobEvent::JobFinished {
                        job_id,
                        status: JobStatus::Cancelled,
                    });
                }
            }
            _ => {
                warn!(job_id = %job_id, error = %err, "Job rejected at admission");
                let record = err.to_record();
                let first = self.apply(job_id, |sm| {
                    sm.admit()?;
                    sm.fail_step(0, record)?;
                    sm.skip_remaining(0);
                    Ok(sm.job().steps.first().map(|s| s.name.clone()).unwrap_or_default())
                });
                if let Some(first) = first {
                    self.step_finished(job_id, &first, StepStatus::Failed);
                    self.finish_job(job_id, started, token_wait);
                }
            }
        }
    }

    async fn run_step(
        &self,
        job: &Job,
        index: usize,
        policy: &StepPolicy,
        stage: &Arc<dyn Stage>,
        control: &Arc<JobControl>,
        resumed: Option<u32>,
    ) -> StepResult {
        let job_id = job.id;
        let name = policy.name.as_str();
        // A resumed step is already running with retries spent at admission
        let mut retries = match resumed {
            Some(retries) => retries,
            None => {
                if let Err(e) = self.table.update(job_id, |sm| sm.start_step(index)) {
                    return StepResult::Failed(e.to_record());
                }
                0
            }
        };
        let options = job.options.for_stage(name);

        loop {
            let attempt = retries + 1;
            self.table.publish(JobEvent::StepStarted {
                job_id,
                step: name.to_string(),
                attempt,
            });
            info!(job_id = %job_id, step = name, attempt, "Step started");

            let token = control.attempt_token();
            let ctx = StageContext {
                repository_ref: job.repository_ref.clone(),
                options: options.clone(),
                concurrency: policy.concurrency,
                handle: StepHandle::new(
                    self.table.clone(),
                    control.clone(),
                    job_id,
                    index,
                    name,
                    token.clone(),
                ),
            };

            let err = match self.run_attempt(stage, ctx, job.mode, policy, &token).await {
                Ok(outcome) => return StepResult::Completed(outcome),
                Err(e) => e,
            };
            if control.is_interrupted() {
                debug!(job_id = %job_id, step = name, error = %err, "Step interrupted");
                return StepResult::Interrupted;
            }

            let record = err.to_record();
            if err.is_retryable() && retries < policy.retry.max_retries {
                retries = match self
                    .table
                    .update(job_id, |sm| sm.record_retry(index, record.clone()))
                {
                    Ok(count) => count,
                    Err(e) => {
                        error!(job_id = %job_id, step = name, error = %e, "Retry not recorded");
                        return StepResult::Failed(record);
                    }
                };
                let delay = policy.retry.delay_for(retries);
                warn!(
                    job_id = %job_id,
                    step = name,
                    retry = retries,
                    max_retries = policy.retry.max_retries,
                    delay_ms = millis(delay),
                    error = %err,
                    "Step failed; retrying"
                );
                self.table.publish(JobEvent::StepRetrying {
                    job_id,
                    step: name.to_string(),
                    retry_count: retries,
                    delay_ms: millis(delay),
                    error: record.message,
                });
                tokio::select! {
                    _ = control.token().cancelled() => return StepResult::Interrupted,
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }

            if policy.optional {
                warn!(job_id = %job_id, step = name, error = %err, "Optional step failed; skipping");
                return StepResult::Skipped(record);
            }
            error!(
                job_id = %job_id,
                step = name,
                retries,
                category = %record.category,
                error = %err,
                "Step failed"
            );
            return StepResult::Failed(record);
        }
    }

    /// One invocation of the stage, bounded by the step timeout.
    ///
    /// On timeout the attempt token fires and the stage gets `timeout_grace` to return
    /// before the attempt is abandoned.
    async fn run_attempt(
        &self,
        stage: &Arc<dyn Stage>,
        ctx: StageContext,
        mode: RunMode,
        policy: &StepPolicy,
        token: &CancellationToken,
    ) -> Result<StageOutcome> {
        let name = policy.name.as_str();
        let work = match mode {
            RunMode::Full => stage.run(ctx),
            RunMode::UpdateOnly => stage.ingestion_update(ctx),
        };
        let mut work = std::pin::pin!(AssertUnwindSafe(work).catch_unwind().map(|outcome| {
            outcome.unwrap_or_else(|_| {
                Err(OrchestratorError::fatal(format!("stage '{}' panicked", name)))
            })
        }));

        let Some(limit) = policy.timeout else {
            return work.await;
        };
        match tokio::time::timeout(limit, work.as_mut()).await {
            Ok(result) => result,
            Err(_) => {
                token.cancel();
                if tokio::time::timeout(policy.timeout_grace, work.as_mut())
                    .await
                    .is_err()
                {
                    warn!(
                        step = name,
                        grace_ms = millis(policy.timeout_grace),
                        "Stage ignored cancellation; attempt abandoned"
                    );
                }
                Err(OrchestratorError::Timeout(format!(
                    "step '{}' exceeded {:?}",
                    name, limit
                )))
            }
        }
    }

    /// Mark step `index` interrupted, then settle the rest per the interrupt kind
    fn interrupt_step(&self, job: &Job, index: usize, control: &JobControl) {
        let interrupt = control.interrupt().unwrap_or(Interrupt::Cancel);
        let reason = match interrupt {
            Interrupt::Stop => STOP_REASON,
            Interrupt::Cancel => CANCEL_REASON,
        };
        let applied = self.apply(job.id, |sm| {
            sm.cancel_step(index, reason)?;
            match interrupt {
                Interrupt::Stop => sm.skip_remaining(index),
                Interrupt::Cancel => sm.cancel_pending(reason),
            };
            Ok(())
        });
        if applied.is_some() {
            if let Some(step) = job.steps.get(index) {
                self.step_finished(job.id, &step.name, StepStatus::Cancelled);
            }
            info!(job_id = %job.id, step = index, interrupt = ?interrupt, "Job interrupted");
        }
    }

    fn finish_job(&self, job_id: JobId, started: Instant, token_wait: Duration) {
        let Some(status) = self.apply(job_id, |sm| sm.finish()) else {
            return;
        };
        let duration = started.elapsed();
        self.metrics.record(JobSample {
            status,
            duration,
            token_wait,
        });
        self.table.publish(JobEvent::JobFinished { job_id, status });

        let duration_ms = millis(duration);
        match status {
            JobStatus::Failed => {
                let last_error = self
                    .table
                    .get(job_id)
                    .ok()
                    .and_then(|job| job.last_error)
                    .map(|e| e.message)
                    .unwrap_or_default();
                warn!(job_id = %job_id, duration_ms, error = %last_error, "Job failed");
            }
            _ => info!(job_id = %job_id, status = %status, duration_ms, "Job finished"),
        }
    }

    fn step_finished(&self, job_id: JobId, step: &str, status: StepStatus) {
        self.table.publish(JobEvent::StepFinished {
            job_id,
            step: step.to_string(),
            status,
        });
    }

    /// Apply a transition owned by the run loop; a rejection is logged, not propagated
    fn apply<R>(
        &self,
        job_id: JobId,
        f: impl FnOnce(&mut JobStateMachine<'_>) -> Result<R>,
    ) -> Option<R> {
        match self.table.update(job_id, f) {
            Ok(value) => Some(value),
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Job state transition rejected");
                None
            }
        }
    }
}

/// Hand every released submission to its own job task
async fn admission_loop(
    orchestrator: Weak<PipelineOrchestrator>,
    mut admissions: mpsc::UnboundedReceiver<ScheduleEntry>,
    shutdown: CancellationToken,
) {
    loop {
        let entry = tokio::select! {
            _ = shutdown.cancelled() => break,
            entry = admissions.recv() => match entry {
                Some(entry) => entry,
                None => break,
            },
        };
        let Some(orchestrator) = orchestrator.upgrade() else {
            break;
        };
        debug!(job_id = %entry.job_id, "Launching job");
        orchestrator.launch(entry.job_id);
    }
    debug!("Admission loop stopped");
}

fn validate_repository_ref(repository_ref: &str) -> Result<()> {
    if repository_ref.trim().is_empty() {
        return Err(OrchestratorError::fatal(
            "repository reference must not be empty",
        ));
    }
    if repository_ref.contains('\0') || repository_ref.trim() != repository_ref {
        return Err(OrchestratorError::fatal(format!(
            "invalid repository reference {:?}",
            repository_ref
        )));
    }
    Ok(())
}
