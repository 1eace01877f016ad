use crate::config::StepPolicy;
use crate::error::{ErrorCategory, ErrorRecord, OrchestratorError, Result};
use crate::pipeline::StageOptions;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

pub type JobId = Uuid;

/// Overall job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-step status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Full pipeline run, or a subset invoked through `Stage::ingestion_update`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Full,
    UpdateOnly,
}

/// Option map attached to a job.
///
/// Keys of the form `stage.key` are scoped to one stage; keys without a dot are visible
/// to every stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobOptions(BTreeMap<String, Value>);

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Every stage-scoped key must name one of `stages`
    pub fn check_scopes(&self, stages: &[String]) -> Result<()> {
        for key in self.0.keys() {
            if key.trim().is_empty() {
                return Err(OrchestratorError::invalid_options("option keys must not be empty"));
            }
            if let Some((scope, rest)) = key.split_once('.') {
                if rest.is_empty() {
                    return Err(OrchestratorError::invalid_options(format!(
                        "option '{}' has no key after the stage prefix",
                        key
                    )));
                }
                if !stages.iter().any(|s| s == scope) {
                    return Err(OrchestratorError::invalid_options(format!(
                        "option '{}' is scoped to '{}', which is not a configured stage",
                        key, scope
                    )));
                }
            }
        }
        Ok(())
    }

    /// Options visible to `stage`: unscoped keys, then its own scoped keys (which win)
    pub fn for_stage(&self, stage: &str) -> StageOptions {
        let mut values = BTreeMap::new();
        for (key, value) in &self.0 {
            if !key.contains('.') {
                values.insert(key.clone(), value.clone());
            }
        }
        let prefix = format!("{}.", stage);
        for (key, value) in &self.0 {
            if let Some(local) = key.strip_prefix(&prefix) {
                values.insert(local.to_string(), value.clone());
            }
        }
        StageOptions::from_map(values)
    }
}

impl FromIterator<(String, Value)> for JobOptions {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Submission payload, as held by the scheduler until due
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub repository_ref: String,
    pub options: JobOptions,
    pub mode: RunMode,
}

impl JobRequest {
    pub fn new(repository_ref: impl Into<String>, options: JobOptions) -> Self {
        Self {
            repository_ref: repository_ref.into(),
            options,
            mode: RunMode::Full,
        }
    }

    pub fn update_only(repository_ref: impl Into<String>, options: JobOptions) -> Self {
        Self {
            repository_ref: repository_ref.into(),
            options,
            mode: RunMode::UpdateOnly,
        }
    }
}

/// One stage's execution record within a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub ordinal: usize,
    pub status: StepStatus,
    pub progress_percent: u8,
    pub message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub optional: bool,
    pub last_error: Option<ErrorRecord>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn from_policy(policy: &StepPolicy) -> Self {
        Self {
            name: policy.name.clone(),
            ordinal: policy.ordinal,
            status: StepStatus::Pending,
            progress_percent: 0,
            message: None,
            retry_count: 0,
            max_retries: policy.retry.max_retries,
            optional: policy.optional,
            last_error: None,
            started_at: None,
            completed_at: None,
        }
    }

    fn finish(&mut self, status: StepStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }
}

/// One ingestion run against one repository reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub repository_ref: String,
    pub options: JobOptions,
    pub mode: RunMode,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub steps: Vec<Step>,
    pub last_error: Option<ErrorRecord>,
}

impl Job {
    /// Create a pending job with one step per policy, in the given order
    pub fn new(request: &JobRequest, policies: &[StepPolicy]) -> Self {
        Self {
            id: Uuid::new_v4(),
            repository_ref: request.repository_ref.clone(),
            options: request.options.clone(),
            mode: request.mode,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            scheduled_for: None,
            started_at: None,
            completed_at: None,
            steps: policies.iter().map(Step::from_policy).collect(),
            last_error: None,
        }
    }

    /// Status as a function of step statuses.
    ///
    /// Before any step has moved, the pre-run status (pending/scheduled) is kept.
    pub fn derive_status(&self) -> JobStatus {
        let steps = &self.steps;
        if steps.iter().any(|s| s.status == StepStatus::Failed) {
            return JobStatus::Failed;
        }
        if steps.iter().any(|s| s.status == StepStatus::Cancelled) {
            return JobStatus::Cancelled;
        }
        if !steps.is_empty()
            && steps
                .iter()
                .all(|s| matches!(s.status, StepStatus::Completed | StepStatus::Skipped))
        {
            return JobStatus::Completed;
        }
        match self.status {
            JobStatus::Pending | JobStatus::Scheduled
                if steps.iter().all(|s| s.status == StepStatus::Pending) =>
            {
                self.status
            }
            _ => JobStatus::Running,
        }
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn count_steps(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }
}

/// Job state machine for transitions
pub struct JobStateMachine<'a> {
    job: &'a mut Job,
}

impl<'a> JobStateMachine<'a> {
    pub fn new(job: &'a mut Job) -> Self {
        Self { job }
    }

    pub fn job(&self) -> &Job {
        self.job
    }

    /// Transition: PENDING → SCHEDULED
    pub fn schedule(&mut self, due_at: DateTime<Utc>) -> Result<()> {
        match self.job.status {
            JobStatus::Pending => {
                self.job.status = JobStatus::Scheduled;
                self.job.scheduled_for = Some(due_at);
                Ok(())
            }
            from => Err(invalid(from.as_str(), "scheduled")),
        }
    }

    /// Transition: PENDING | SCHEDULED → RUNNING
    pub fn admit(&mut self) -> Result<()> {
        match self.job.status {
            JobStatus::Pending | JobStatus::Scheduled => {
                self.job.status = JobStatus::Running;
                self.job.started_at = Some(Utc::now());
                Ok(())
            }
            from => Err(invalid(from.as_str(), "running")),
        }
    }

    /// Transition (step): PENDING → RUNNING
    pub fn start_step(&mut self, index: usize) -> Result<()> {
        if self.job.status != JobStatus::Running {
            return Err(invalid(self.job.status.as_str(), "step running"));
        }
        let step = self.step_mut(index)?;
        match step.status {
            StepStatus::Pending => {
                step.status = StepStatus::Running;
                step.started_at = Some(Utc::now());
                step.progress_percent = 0;
                step.message = None;
                Ok(())
            }
            from => Err(invalid(from.as_str(), "running")),
        }
    }

    /// Transition (step): RUNNING → RUNNING (retry).
    ///
    /// Returns the new retry count; refuses to exceed `max_retries`.
    pub fn record_retry(&mut self, index: usize, error: ErrorRecord) -> Result<u32> {
        let step = self.step_mut(index)?;
        if step.status != StepStatus::Running {
            return Err(invalid(step.status.as_str(), "running (retry)"));
        }
        if step.retry_count >= step.max_retries {
            return Err(OrchestratorError::InvalidStateTransition {
                from: format!("running (retry {}/{})", step.retry_count, step.max_retries),
                to: "running (retry)".to_string(),
            });
        }
        step.retry_count += 1;
        step.message = Some(format!(
            "retrying ({}/{}): {}",
            step.retry_count, step.max_retries, error.message
        ));
        step.last_error = Some(error);
        Ok(step.retry_count)
    }

    pub fn report_progress(&mut self, index: usize, percent: u8, message: Option<String>) -> Result<()> {
        let step = self.step_mut(index)?;
        if step.status != StepStatus::Running {
            return Err(invalid(step.status.as_str(), "progress"));
        }
        step.progress_percent = percent.min(100);
        if message.is_some() {
            step.message = message;
        }
        Ok(())
    }

    /// Transition (step): RUNNING → COMPLETED
    pub fn complete_step(&mut self, index: usize, message: Option<String>) -> Result<()> {
        let step = self.step_mut(index)?;
        match step.status {
            StepStatus::Running => {
                step.progress_percent = 100;
                step.message = message;
                step.finish(StepStatus::Completed);
                Ok(())
            }
            from => Err(invalid(from.as_str(), "completed")),
        }
    }

    /// Transition (step): PENDING | RUNNING → FAILED
    pub fn fail_step(&mut self, index: usize, error: ErrorRecord) -> Result<()> {
        let step = self.step_mut(index)?;
        match step.status {
            StepStatus::Pending | StepStatus::Running => {
                step.message = Some(error.message.clone());
                step.last_error = Some(error.clone());
                step.finish(StepStatus::Failed);
                self.job.last_error = Some(error);
                Ok(())
            }
            from => Err(invalid(from.as_str(), "failed")),
        }
    }

    /// Transition (step): PENDING | RUNNING → SKIPPED
    pub fn skip_step(&mut self, index: usize, error: Option<ErrorRecord>) -> Result<()> {
        let step = self.step_mut(index)?;
        match step.status {
            StepStatus::Pending | StepStatus::Running => {
                if let Some(error) = error {
                    step.message = Some(format!("skipped: {}", error.message));
                    step.last_error = Some(error);
                }
                step.finish(StepStatus::Skipped);
                Ok(())
            }
            from => Err(invalid(from.as_str(), "skipped")),
        }
    }

    /// Transition (step): PENDING | RUNNING → CANCELLED
    pub fn cancel_step(&mut self, index: usize, reason: &str) -> Result<()> {
        let step = self.step_mut(index)?;
        match step.status {
            StepStatus::Pending | StepStatus::Running => {
                step.message = Some(reason.to_string());
                step.finish(StepStatus::Cancelled);
                Ok(())
            }
            from => Err(invalid(from.as_str(), "cancelled")),
        }
    }

    /// Every pending step after `index` becomes skipped
    pub fn skip_remaining(&mut self, index: usize) -> usize {
        let mut skipped = 0;
        for step in self.job.steps.iter_mut().skip(index + 1) {
            if step.status == StepStatus::Pending {
                step.finish(StepStatus::Skipped);
                skipped += 1;
            }
        }
        skipped
    }

    /// Every pending step becomes cancelled
    pub fn cancel_pending(&mut self, reason: &str) -> usize {
        let mut cancelled = 0;
        for step in self.job.steps.iter_mut() {
            if step.status == StepStatus::Pending {
                step.message = Some(reason.to_string());
                step.finish(StepStatus::Cancelled);
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Transition: PENDING | SCHEDULED → CANCELLED, without ever running
    pub fn cancel_before_run(&mut self, reason: &str) -> Result<()> {
        match self.job.status {
            JobStatus::Pending | JobStatus::Scheduled => {
                self.cancel_pending(reason);
                self.job.status = JobStatus::Cancelled;
                self.job.completed_at = Some(Utc::now());
                self.job.last_error = Some(ErrorRecord::new(ErrorCategory::Cancelled, reason));
                Ok(())
            }
            from => Err(invalid(from.as_str(), "cancelled")),
        }
    }

    /// Transition: RUNNING → derived terminal status
    pub fn finish(&mut self) -> Result<JobStatus> {
        if self.job.status != JobStatus::Running {
            return Err(invalid(self.job.status.as_str(), "terminal"));
        }
        let status = self.job.derive_status();
        if !status.is_terminal() {
            return Err(invalid(self.job.status.as_str(), status.as_str()));
        }
        self.job.status = status;
        self.job.completed_at = Some(Utc::now());
        if status == JobStatus::Cancelled && self.job.last_error.is_none() {
            self.job.last_error = Some(ErrorRecord::new(
                ErrorCategory::Cancelled,
                "cancelled by request",
            ));
        }
        Ok(status)
    }

    fn step_mut(&mut self, index: usize) -> Result<&mut Step> {
        let job_id = self.job.id;
        self.job
            .steps
            .get_mut(index)
            .ok_or_else(|| OrchestratorError::StageNotFound(format!("step #{} of job {}", index, job_id)))
    }
}

fn invalid(from: &str, to: &str) -> OrchestratorError {
    OrchestratorError::InvalidStateTransition {
        from: from.to_string(),
        to: to.to_string(),
    }
}

/// Per-step entry of the status surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub name: String,
    pub status: StepStatus,
    pub progress_percent: u8,
    pub message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<ErrorRecord>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Job status surface exposed to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub job_id: JobId,
    pub repository_ref: String,
    pub mode: RunMode,
    pub status: JobStatus,
    pub eta: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<ErrorRecord>,
    pub steps: Vec<StepReport>,
}

impl JobStatusReport {
    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.name == name)
    }
}

impl From<&Job> for JobStatusReport {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            repository_ref: job.repository_ref.clone(),
            mode: job.mode,
            status: job.status,
            eta: job.scheduled_for,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            last_error: job.last_error.clone(),
            steps: job
                .steps
                .iter()
                .map(|s| StepReport {
                    name: s.name.clone(),
                    status: s.status,
                    progress_percent: s.progress_percent,
                    message: s.message.clone(),
                    retry_count: s.retry_count,
                    max_retries: s.max_retries,
                    last_error: s.last_error.clone(),
                    started_at: s.started_at,
                    completed_at: s.completed_at,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PipelineConfig, StageSettings};

    fn job_with(stages: &[(&str, u32)]) -> Job {
        let config = PipelineConfig::with_stages(
            stages
                .iter()
                .map(|(name, retries)| StageSettings::new(*name).max_retries(*retries))
                .collect(),
        );
        Job::new(
            &JobRequest::new("repo-1", JobOptions::new()),
            &config.step_policies(),
        )
    }

    fn transient(msg: &str) -> ErrorRecord {
        ErrorRecord::new(ErrorCategory::Transient, msg)
    }

    #[test]
    fn test_new_job_has_steps_in_order() {
        let job = job_with(&[("a", 0), ("b", 2), ("c", 3)]);
        let names: Vec<_> = job.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(job.steps[1].max_retries, 2);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.derive_status(), JobStatus::Pending);
    }

    #[test]
    fn test_job_state_transition_to_completed() {
        let mut job = job_with(&[("a", 0), ("b", 0)]);
        let mut sm = JobStateMachine::new(&mut job);

        sm.admit().unwrap();
        sm.start_step(0).unwrap();
        sm.complete_step(0, None).unwrap();
        assert_eq!(sm.job().derive_status(), JobStatus::Running);
        sm.start_step(1).unwrap();
        sm.complete_step(1, Some("done".into())).unwrap();

        assert_eq!(sm.finish().unwrap(), JobStatus::Completed);
        assert!(job.completed_at.is_some());
        assert_eq!(job.steps[1].progress_percent, 100);
    }

    #[test]
    fn test_scheduled_job_keeps_status_until_admitted() {
        let mut job = job_with(&[("a", 0)]);
        let mut sm = JobStateMachine::new(&mut job);
        sm.schedule(Utc::now()).unwrap();
        assert_eq!(sm.job().derive_status(), JobStatus::Scheduled);
        assert!(sm.schedule(Utc::now()).is_err());

        sm.admit().unwrap();
        assert_eq!(sm.job().derive_status(), JobStatus::Running);
    }

    #[test]
    fn test_retry_budget_enforced() {
        let mut job = job_with(&[("b", 2)]);
        let mut sm = JobStateMachine::new(&mut job);
        sm.admit().unwrap();
        sm.start_step(0).unwrap();

        assert_eq!(sm.record_retry(0, transient("busy")).unwrap(), 1);
        assert_eq!(sm.record_retry(0, transient("busy")).unwrap(), 2);
        assert!(sm.record_retry(0, transient("busy")).is_err());
        assert_eq!(sm.job().steps[0].status, StepStatus::Running);
        assert_eq!(sm.job().steps[0].retry_count, 2);
    }

    #[test]
    fn test_failed_step_fails_job() {
        let mut job = job_with(&[("a", 0), ("b", 0)]);
        let mut sm = JobStateMachine::new(&mut job);
        sm.admit().unwrap();
        sm.start_step(0).unwrap();
        sm.fail_step(0, ErrorRecord::new(ErrorCategory::Fatal, "bad ref"))
            .unwrap();
        assert_eq!(sm.skip_remaining(0), 1);

        assert_eq!(sm.finish().unwrap(), JobStatus::Failed);
        assert_eq!(job.last_error.as_ref().unwrap().category, ErrorCategory::Fatal);
        assert_eq!(job.steps[1].status, StepStatus::Skipped);
    }

    #[test]
    fn test_skipped_optional_step_still_completes_job() {
        let mut job = job_with(&[("a", 0), ("b", 0)]);
        let mut sm = JobStateMachine::new(&mut job);
        sm.admit().unwrap();
        sm.start_step(0).unwrap();
        sm.skip_step(0, Some(transient("flaky"))).unwrap();
        sm.start_step(1).unwrap();
        sm.complete_step(1, None).unwrap();

        assert_eq!(sm.finish().unwrap(), JobStatus::Completed);
        assert!(job.steps[0].last_error.is_some());
    }

    #[test]
    fn test_cancel_before_run_cancels_every_step() {
        let mut job = job_with(&[("a", 0), ("b", 0), ("c", 0)]);
        let mut sm = JobStateMachine::new(&mut job);
        sm.cancel_before_run("cancelled by request").unwrap();

        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.count_steps(StepStatus::Cancelled), 3);
        assert_eq!(job.count_steps(StepStatus::Skipped), 0);
    }

    #[test]
    fn test_cannot_finish_while_step_pending() {
        let mut job = job_with(&[("a", 0)]);
        let mut sm = JobStateMachine::new(&mut job);
        sm.admit().unwrap();
        assert!(sm.finish().is_err());
    }

    #[test]
    fn test_cannot_complete_step_twice() {
        let mut job = job_with(&[("a", 0)]);
        let mut sm = JobStateMachine::new(&mut job);
        sm.admit().unwrap();
        sm.start_step(0).unwrap();
        sm.complete_step(0, None).unwrap();
        assert!(matches!(
            sm.complete_step(0, None),
            Err(OrchestratorError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_options_scoping() {
        let options = JobOptions::new()
            .with("branch", "main")
            .with("summarization.model", "small")
            .with("summarization.branch", "dev")
            .with("filesystem.max_depth", 4);

        let stages = vec!["filesystem".to_string(), "summarization".to_string()];
        assert!(options.check_scopes(&stages).is_ok());

        let summarization = options.for_stage("summarization");
        assert_eq!(summarization.get_str("model"), Some("small"));
        assert_eq!(summarization.get_str("branch"), Some("dev"));
        assert!(summarization.get("max_depth").is_none());

        let filesystem = options.for_stage("filesystem");
        assert_eq!(filesystem.get_str("branch"), Some("main"));
        assert_eq!(filesystem.get_u64("max_depth"), Some(4));
    }

    #[test]
    fn test_options_unknown_scope_rejected() {
        let options = JobOptions::new().with("syntax.depth", 2);
        let err = options
            .check_scopes(&["filesystem".to_string()])
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Fatal);
    }

    #[test]
    fn test_status_report_serializes() {
        let job = job_with(&[("a", 1)]);
        let report = JobStatusReport::from(&job);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["steps"][0]["max_retries"], 1);
    }
}
