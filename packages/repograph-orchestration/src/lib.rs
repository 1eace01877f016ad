/*
 * Repograph Orchestration - ingestion pipeline orchestrator
 *
 * Turns a repository reference into knowledge-graph content by running an
 * ordered list of pluggable stages per job.
 *
 * Architecture:
 * - Job/Step state table (DashMap) with an explicit state machine
 * - Scheduler front door (delayed admission by eta/countdown)
 * - Resource throttle shared by jobs and DAG node tasks
 * - Dependency-DAG executor for leaf-to-root summarization
 * - Stages: filesystem walk, summarization (pluggable via StageRegistry)
 */

// Public modules
pub mod config;
pub mod dag;
pub mod error;
pub mod job;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod scheduler;
pub mod stages;
pub mod state;
pub mod throttle;

// Re-exports
pub use config::{
    AcquirePolicy, BackoffStrategy, ConfigError, PipelineConfig, RetryPolicy, StageSettings,
    StepPolicy,
};
pub use dag::{
    DagExecutor, DagExecutorConfig, DagNode, DagRunReport, DependencyDag, NodeKind, NodeOutcome,
    NodeStatus, NodeTask,
};
pub use error::{ErrorCategory, ErrorRecord, OrchestratorError, Result};
pub use job::{
    Job, JobId, JobOptions, JobRequest, JobStateMachine, JobStatus, JobStatusReport, RunMode,
    StepReport, StepStatus,
};
pub use logging::init_tracing;
pub use metrics::{JobMetricsSummary, Percentiles, ResourceStatus};
pub use orchestrator::PipelineOrchestrator;
pub use pipeline::{Stage, StageContext, StageOptions, StageOutcome, StepHandle, StepProgress};
pub use registry::{StageEnv, StageRegistry};
pub use scheduler::{Schedule, ScheduleEntry, Scheduler};
pub use stages::{
    register_builtin, ContentExtractor, FileContentExtractor, FilesystemStage,
    SummarizationStage, TextGenerator, FILESYSTEM_STAGE, SUMMARIZATION_STAGE,
};
pub use state::{Interrupt, JobEvent};
pub use throttle::{ResourceThrottle, ResourceToken, ThrottleSnapshot};
