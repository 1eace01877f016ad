use crate::config::{PipelineConfig, StageSettings};
use crate::error::Result;
use crate::job::{Job, JobId, JobOptions, JobRequest, StepStatus};
use crate::state::{Interrupt, JobControl, JobTable};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Options visible to one stage (scope prefix already stripped)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageOptions {
    values: BTreeMap<String, Value>,
}

impl StageOptions {
    pub fn from_map(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.get(key).and_then(Value::as_bool)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.values.get(key).and_then(Value::as_u64)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// What a stage reports on success
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub message: Option<String>,
    pub items_processed: usize,
}

impl StageOutcome {
    pub fn new(items_processed: usize) -> Self {
        Self {
            message: None,
            items_processed,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Step state as seen through a [`StepHandle`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepProgress {
    pub state: StepStatus,
    pub progress_percent: u8,
    pub message: Option<String>,
}

/// A running step's link back to the orchestrator
#[derive(Debug, Clone)]
pub struct StepHandle {
    table: Arc<JobTable>,
    control: Arc<JobControl>,
    job_id: JobId,
    step_index: usize,
    step_name: String,
    attempt: CancellationToken,
}

impl StepHandle {
    pub fn new(
        table: Arc<JobTable>,
        control: Arc<JobControl>,
        job_id: JobId,
        step_index: usize,
        step_name: impl Into<String>,
        attempt: CancellationToken,
    ) -> Self {
        Self {
            table,
            control,
            job_id,
            step_index,
            step_name: step_name.into(),
            attempt,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    pub fn status(&self) -> Result<StepProgress> {
        self.table.step_progress(self.job_id, self.step_index)
    }

    /// Stop this step; later steps of the job are skipped
    pub fn stop(&self) {
        self.control.request(Interrupt::Stop);
    }

    /// Cancel the whole job this step belongs to
    pub fn cancel(&self) {
        self.control.request(Interrupt::Cancel);
    }

    /// True once stop, cancel or the step timeout fired
    pub fn is_cancelled(&self) -> bool {
        self.attempt.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.attempt.cancelled().await
    }

    /// Token observed by work the stage fans out (e.g. DAG node tasks)
    pub fn token(&self) -> CancellationToken {
        self.attempt.clone()
    }

    /// Write progress straight into the state table.
    ///
    /// Ignored once the step has left `running`.
    pub fn report_progress(&self, percent: u8, message: Option<String>) {
        let result = self.table.update(self.job_id, |sm| {
            sm.report_progress(self.step_index, percent, message)
        });
        if let Err(e) = result {
            tracing::debug!(
                job_id = %self.job_id,
                step = %self.step_name,
                error = %e,
                "Progress report dropped"
            );
        }
    }
}

/// Inputs of one stage invocation; identical across retries of the same step
#[derive(Debug, Clone)]
pub struct StageContext {
    pub repository_ref: String,
    pub options: StageOptions,
    /// Stage-level concurrency override from the pipeline configuration
    pub concurrency: Option<usize>,
    pub handle: StepHandle,
}

impl StageContext {
    /// Context backed by a private one-step job, for driving a stage outside an
    /// orchestrator
    pub fn standalone(
        repository_ref: impl Into<String>,
        stage_name: &str,
        options: StageOptions,
    ) -> Result<Self> {
        let repository_ref = repository_ref.into();
        let policies =
            PipelineConfig::with_stages(vec![StageSettings::new(stage_name)]).step_policies();
        let job = Job::new(&JobRequest::new(repository_ref.clone(), JobOptions::new()), &policies);
        let job_id = job.id;

        let table = Arc::new(JobTable::new());
        let control = table.insert(job);
        table.update(job_id, |sm| {
            sm.admit()?;
            sm.start_step(0)
        })?;
        let attempt = control.attempt_token();
        Ok(Self {
            repository_ref,
            options,
            concurrency: None,
            handle: StepHandle::new(table, control, job_id, 0, stage_name, attempt),
        })
    }
}

/// Stage plugin contract (pluggable stages)
#[async_trait]
pub trait Stage: Send + Sync {
    /// Registered stage name
    fn name(&self) -> &str;

    /// Reject options this stage cannot honour, before the job is created
    fn validate_options(&self, _options: &StageOptions) -> Result<()> {
        Ok(())
    }

    /// Run the stage against the repository.
    ///
    /// Must be safe to re-invoke with the same context: writes are upserts.
    async fn run(&self, ctx: StageContext) -> Result<StageOutcome>;

    /// Incremental mode, used by `update_only`
    async fn ingestion_update(&self, ctx: StageContext) -> Result<StageOutcome> {
        self.run(ctx).await
    }
}
