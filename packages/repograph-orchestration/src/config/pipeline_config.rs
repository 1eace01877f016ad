//! Pipeline configuration
//!
//! One explicit struct handed to the orchestrator at startup. Per-stage entries override
//! the global retry defaults; everything else has a default so a minimal file only lists
//! stage names.

use super::error::{ConfigError, ConfigResult};
use super::validation::{check_range, check_seconds, Validatable, ValidatableCollection};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Schema versions this build can read
pub const SUPPORTED_VERSIONS: &[u32] = &[1];

/// Path of the configuration file
pub const CONFIG_PATH_ENV: &str = "REPOGRAPH_CONFIG";
/// Overrides `throttle.max_tokens`
pub const MAX_TOKENS_ENV: &str = "REPOGRAPH_MAX_TOKENS";
/// Overrides `logging.level`
pub const LOG_LEVEL_ENV: &str = "REPOGRAPH_LOG";

const MAX_RETRIES_LIMIT: u32 = 100;
const MAX_SECONDS: f64 = 86_400.0;

/// One configured stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageSettings {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub back_off_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,
    /// A failed optional stage is recorded as skipped and the pipeline continues
    #[serde(default)]
    pub optional: bool,
}

impl StageSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: None,
            max_retries: None,
            back_off_seconds: None,
            timeout_seconds: None,
            optional: false,
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn back_off_seconds(mut self, seconds: f64) -> Self {
        self.back_off_seconds = Some(seconds);
        self
    }

    pub fn timeout_seconds(mut self, seconds: f64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }
}

impl Validatable for StageSettings {
    fn validate(&self) -> ConfigResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "stage name must not be empty".to_string(),
            ));
        }
        if let Some(concurrency) = self.concurrency {
            check_range(
                &format!("stages.{}.concurrency", self.name),
                concurrency,
                1,
                4096,
                "Concurrency must allow at least one task",
            )?;
        }
        if let Some(max_retries) = self.max_retries {
            check_range(
                &format!("stages.{}.max_retries", self.name),
                max_retries,
                0,
                MAX_RETRIES_LIMIT,
                "Use 0 to disable retries",
            )?;
        }
        if let Some(back_off) = self.back_off_seconds {
            check_seconds(
                &format!("stages.{}.back_off_seconds", self.name),
                back_off,
                0.0,
                MAX_SECONDS,
            )?;
        }
        if let Some(timeout) = self.timeout_seconds {
            check_seconds(
                &format!("stages.{}.timeout_seconds", self.name),
                timeout,
                0.001,
                MAX_SECONDS,
            )?;
        }
        Ok(())
    }
}

/// How the delay between attempts grows
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum BackoffStrategy {
    /// Same delay before every retry
    #[default]
    Fixed,
    /// `back_off * multiplier^(retry - 1)`, capped at `max_seconds`
    Exponential {
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        #[serde(default = "default_max_back_off")]
        max_seconds: f64,
    },
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_back_off() -> f64 {
    300.0
}

/// Global retry defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryDefaults {
    pub max_retries: u32,
    pub back_off_seconds: f64,
    pub back_off_strategy: BackoffStrategy,
    /// How long a timed-out step may take to honour its cancellation
    pub timeout_grace_seconds: f64,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            max_retries: 3,
            back_off_seconds: 5.0,
            back_off_strategy: BackoffStrategy::Fixed,
            timeout_grace_seconds: 5.0,
        }
    }
}

impl Validatable for RetryDefaults {
    fn validate(&self) -> ConfigResult<()> {
        check_range(
            "defaults.max_retries",
            self.max_retries,
            0,
            MAX_RETRIES_LIMIT,
            "Use 0 to disable retries",
        )?;
        check_seconds("defaults.back_off_seconds", self.back_off_seconds, 0.0, MAX_SECONDS)?;
        check_seconds(
            "defaults.timeout_grace_seconds",
            self.timeout_grace_seconds,
            0.0,
            MAX_SECONDS,
        )?;
        if let BackoffStrategy::Exponential {
            multiplier,
            max_seconds,
        } = self.back_off_strategy
        {
            check_seconds("defaults.back_off_strategy.multiplier", multiplier, 1.0, 100.0)?;
            check_seconds(
                "defaults.back_off_strategy.max_seconds",
                max_seconds,
                0.0,
                MAX_SECONDS,
            )?;
        }
        Ok(())
    }
}

/// What `acquire` does when the throttle is saturated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AcquirePolicy {
    /// Suspend until capacity frees up
    #[default]
    Wait,
    /// Fail immediately with `ResourceExhausted`
    FailFast,
}

/// Resource throttle sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThrottleConfig {
    /// Tokens shared by running jobs and running DAG node tasks
    pub max_tokens: usize,
    /// Jobs admitted concurrently; must leave tokens for node tasks
    pub max_concurrent_jobs: usize,
    pub policy: AcquirePolicy,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        let max_tokens = num_cpus::get().max(2) * 2;
        Self {
            max_tokens,
            max_concurrent_jobs: (max_tokens / 4).max(1),
            policy: AcquirePolicy::Wait,
        }
    }
}

impl Validatable for ThrottleConfig {
    fn validate(&self) -> ConfigResult<()> {
        check_range(
            "throttle.max_tokens",
            self.max_tokens,
            2,
            4096,
            "Jobs and DAG tasks share the pool, so at least 2 tokens are needed",
        )?;
        check_range(
            "throttle.max_concurrent_jobs",
            self.max_concurrent_jobs,
            1,
            self.max_tokens - 1,
            "Each running job holds one token; at least one must stay free for node tasks",
        )
    }
}

/// Summarization stage / DAG executor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SummarizationConfig {
    pub concurrency_limit: usize,
    pub node_timeout_seconds: f64,
    pub node_max_retries: u32,
    pub node_back_off_seconds: f64,
    /// Upper bound on extracted content per node
    pub max_content_bytes: usize,
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: (num_cpus::get() * 3 / 4).max(1), // 75% of cores
            node_timeout_seconds: 120.0,
            node_max_retries: 2,
            node_back_off_seconds: 1.0,
            max_content_bytes: 16 * 1024,
        }
    }
}

impl Validatable for SummarizationConfig {
    fn validate(&self) -> ConfigResult<()> {
        check_range(
            "summarization.concurrency_limit",
            self.concurrency_limit,
            1,
            4096,
            "At least one node must be able to run",
        )?;
        check_seconds(
            "summarization.node_timeout_seconds",
            self.node_timeout_seconds,
            0.001,
            MAX_SECONDS,
        )?;
        check_range(
            "summarization.node_max_retries",
            self.node_max_retries,
            0,
            MAX_RETRIES_LIMIT,
            "Use 0 to disable retries",
        )?;
        check_seconds(
            "summarization.node_back_off_seconds",
            self.node_back_off_seconds,
            0.0,
            MAX_SECONDS,
        )?;
        check_range(
            "summarization.max_content_bytes",
            self.max_content_bytes,
            64,
            16 * 1024 * 1024,
            "Content budget per node",
        )
    }
}

/// Recent-job metrics window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    pub window: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { window: 100 }
    }
}

impl Validatable for MetricsConfig {
    fn validate(&self) -> ConfigResult<()> {
        check_range(
            "metrics.window",
            self.window,
            1,
            100_000,
            "Window must hold at least one sample",
        )
    }
}

/// Tracing subscriber settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `repograph_orchestration=debug`
    pub level: String,
    pub ansi: bool,
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
            with_target: false,
        }
    }
}

impl Validatable for LoggingConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.level.trim().is_empty() {
            return Err(ConfigError::Validation(
                "logging.level must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resolved per-step retry policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub back_off: Duration,
    pub strategy: BackoffStrategy,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, back_off: Duration) -> Self {
        Self {
            max_retries,
            back_off,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::Fixed => self.back_off,
            BackoffStrategy::Exponential {
                multiplier,
                max_seconds,
            } => {
                let exponent = retry.saturating_sub(1).min(64) as i32;
                let secs = self.back_off.as_secs_f64() * multiplier.powi(exponent);
                Duration::from_secs_f64(secs.min(max_seconds).max(0.0))
            }
        }
    }
}

/// Everything the orchestrator needs to run one step
#[derive(Debug, Clone, PartialEq)]
pub struct StepPolicy {
    pub name: String,
    pub ordinal: usize,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
    pub timeout_grace: Duration,
    pub concurrency: Option<usize>,
    pub optional: bool,
}

/// Root configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub version: u32,
    /// Stages in execution order
    pub stages: Vec<StageSettings>,
    #[serde(default)]
    pub defaults: RetryDefaults,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub summarization: SummarizationConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for PipelineConfig {
    /// Filesystem walk followed by summarization
    fn default() -> Self {
        Self::with_stages(vec![
            StageSettings::new("filesystem"),
            StageSettings::new("summarization"),
        ])
    }
}

impl PipelineConfig {
    pub fn with_stages(stages: Vec<StageSettings>) -> Self {
        Self {
            version: 1,
            stages,
            defaults: RetryDefaults::default(),
            throttle: ThrottleConfig::default(),
            summarization: SummarizationConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load from `$REPOGRAPH_CONFIG` if set, otherwise the default pipeline;
    /// environment overrides are applied either way
    pub fn load() -> ConfigResult<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_yaml(&path)?,
            _ => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(path: &str) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let raw: serde_yaml::Value = serde_yaml::from_str(content)?;

        // Version check before schema parsing so old files get a precise error
        let version = raw
            .get("version")
            .ok_or(ConfigError::MissingVersion)?
            .as_u64()
            .ok_or_else(|| ConfigError::Validation("'version' must be an integer".to_string()))?;
        let version = u32::try_from(version).unwrap_or(u32::MAX);
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(ConfigError::UnsupportedVersion {
                found: version,
                supported: SUPPORTED_VERSIONS.to_vec(),
            });
        }

        let config: PipelineConfig = serde_yaml::from_value(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        serde_yaml::to_string(self).map_err(ConfigError::Yaml)
    }

    /// Apply `REPOGRAPH_MAX_TOKENS` / `REPOGRAPH_LOG`
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        if let Ok(value) = std::env::var(MAX_TOKENS_ENV) {
            let tokens = value.trim().parse::<usize>().map_err(|e| ConfigError::Env {
                var: MAX_TOKENS_ENV.to_string(),
                value: value.clone(),
                reason: e.to_string(),
            })?;
            self.throttle.max_tokens = tokens;
            if self.throttle.max_concurrent_jobs >= tokens {
                self.throttle.max_concurrent_jobs = (tokens / 4).max(1);
            }
        }
        if let Ok(level) = std::env::var(LOG_LEVEL_ENV) {
            if !level.trim().is_empty() {
                self.logging.level = level;
            }
        }
        Ok(())
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name.clone()).collect()
    }

    pub fn stage(&self, name: &str) -> Option<&StageSettings> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Resolve the policy of every configured stage, in order
    pub fn step_policies(&self) -> Vec<StepPolicy> {
        self.stages
            .iter()
            .enumerate()
            .map(|(ordinal, stage)| self.resolve(ordinal, stage))
            .collect()
    }

    fn resolve(&self, ordinal: usize, stage: &StageSettings) -> StepPolicy {
        let back_off = stage
            .back_off_seconds
            .unwrap_or(self.defaults.back_off_seconds);
        StepPolicy {
            name: stage.name.clone(),
            ordinal,
            retry: RetryPolicy {
                max_retries: stage.max_retries.unwrap_or(self.defaults.max_retries),
                back_off: Duration::from_secs_f64(back_off),
                strategy: self.defaults.back_off_strategy,
            },
            timeout: stage.timeout_seconds.map(Duration::from_secs_f64),
            timeout_grace: Duration::from_secs_f64(self.defaults.timeout_grace_seconds),
            concurrency: stage.concurrency,
            optional: stage.optional,
        }
    }

    /// Check that every configured stage has an implementation
    pub fn validate_against(&self, registered: &[String]) -> ConfigResult<()> {
        for stage in &self.stages {
            if !registered.contains(&stage.name) {
                return Err(ConfigError::unknown_stage_with_suggestion(
                    stage.name.clone(),
                    registered,
                ));
            }
        }
        Ok(())
    }
}

impl Validatable for PipelineConfig {
    fn validate(&self) -> ConfigResult<()> {
        if !SUPPORTED_VERSIONS.contains(&self.version) {
            return Err(ConfigError::UnsupportedVersion {
                found: self.version,
                supported: SUPPORTED_VERSIONS.to_vec(),
            });
        }
        if self.stages.is_empty() {
            return Err(ConfigError::EmptyPipeline);
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(ConfigError::DuplicateStage(stage.name.clone()));
            }
        }

        self.stages.validate_all()?;
        self.defaults.validate()?;
        self.throttle.validate()?;
        self.summarization.validate()?;
        self.metrics.validate()?;
        self.logging.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pipeline_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stage_names(), vec!["filesystem", "summarization"]);
    }

    #[test]
    fn test_step_policy_resolution() {
        let mut config = PipelineConfig::with_stages(vec![
            StageSettings::new("a").max_retries(0),
            StageSettings::new("b").max_retries(2).back_off_seconds(1.0),
            StageSettings::new("c"),
        ]);
        config.defaults.max_retries = 4;
        config.defaults.back_off_seconds = 3.0;

        let policies = config.step_policies();
        assert_eq!(policies.len(), 3);
        assert_eq!(policies[0].retry.max_retries, 0);
        assert_eq!(policies[1].retry.max_retries, 2);
        assert_eq!(policies[1].retry.back_off, Duration::from_secs(1));
        assert_eq!(policies[2].retry.max_retries, 4);
        assert_eq!(policies[2].retry.back_off, Duration::from_secs(3));
        assert_eq!(policies[2].ordinal, 2);
    }

    #[test]
    fn test_fixed_back_off_is_flat() {
        let policy = RetryPolicy::new(5, Duration::from_secs(2));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(2));
    }

    #[test]
    fn test_exponential_back_off_is_capped() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1)).with_strategy(
            BackoffStrategy::Exponential {
                multiplier: 2.0,
                max_seconds: 5.0,
            },
        );
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let config = PipelineConfig::with_stages(vec![
            StageSettings::new("filesystem"),
            StageSettings::new("filesystem"),
        ]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateStage(name)) if name == "filesystem"
        ));
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let config = PipelineConfig::with_stages(vec![]);
        assert!(matches!(config.validate(), Err(ConfigError::EmptyPipeline)));
    }

    #[test]
    fn test_throttle_must_leave_room_for_tasks() {
        let mut config = PipelineConfig::default();
        config.throttle.max_tokens = 4;
        config.throttle.max_concurrent_jobs = 4;
        assert!(matches!(config.validate(), Err(ConfigError::Range { .. })));

        config.throttle.max_concurrent_jobs = 3;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_against_registry() {
        let config = PipelineConfig::default();
        let registered = vec!["filesystem".to_string(), "summarisation".to_string()];

        let err = config.validate_against(&registered).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("summarization"));
        assert!(msg.contains("Did you mean 'summarisation'?"));
    }

    #[test]
    fn test_negative_back_off_rejected() {
        let config =
            PipelineConfig::with_stages(vec![StageSettings::new("a").back_off_seconds(-1.0)]);
        assert!(config.validate().is_err());
    }
}
