//! Pipeline configuration
//!
//! A versioned YAML schema (`version: 1`) describing the ordered stage list, global
//! retry defaults, throttle sizing, summarization executor limits, metrics window and
//! logging.
//!
//! # Examples
//!
//! ```rust,ignore
//! use repograph_orchestration::config::PipelineConfig;
//!
//! // Defaults: filesystem walk, then summarization
//! let config = PipelineConfig::default();
//!
//! // From a file, with REPOGRAPH_MAX_TOKENS / REPOGRAPH_LOG applied
//! std::env::set_var("REPOGRAPH_CONFIG", "pipeline.yaml");
//! let config = PipelineConfig::load()?;
//! ```
//!
//! ```yaml
//! version: 1
//! stages:
//!   - name: filesystem
//!     max_retries: 0
//!   - name: summarization
//!     max_retries: 2
//!     back_off_seconds: 1.0
//!     timeout_seconds: 600
//! defaults:
//!   max_retries: 3
//!   back_off_seconds: 5.0
//! throttle:
//!   max_tokens: 16
//!   max_concurrent_jobs: 4
//!   policy: wait
//! ```

pub mod error;
pub mod pipeline_config;
pub mod validation;

// Re-exports
pub use error::{ConfigError, ConfigResult};
pub use pipeline_config::{
    AcquirePolicy, BackoffStrategy, LoggingConfig, MetricsConfig, PipelineConfig, RetryDefaults,
    RetryPolicy, StageSettings, StepPolicy, SummarizationConfig, ThrottleConfig,
    CONFIG_PATH_ENV, LOG_LEVEL_ENV, MAX_TOKENS_ENV, SUPPORTED_VERSIONS,
};
pub use validation::{Validatable, ValidatableCollection};
