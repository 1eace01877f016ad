/// Pipeline configuration files
///
/// YAML on disk: loading, round trip, schema errors and registry validation.
mod common;

use common::ScriptedStage;
use repograph_orchestration::config::{AcquirePolicy, ConfigError, Validatable};
use repograph_orchestration::{
    BackoffStrategy, OrchestratorError, PipelineConfig, PipelineOrchestrator, StageRegistry,
};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

const PIPELINE_YAML: &str = r#"
version: 1
stages:
  - name: filesystem
    max_retries: 0
  - name: summarization
    max_retries: 2
    back_off_seconds: 1.5
    timeout_seconds: 600
    optional: true
defaults:
  max_retries: 4
  back_off_seconds: 2.0
  back_off_strategy:
    kind: exponential
    multiplier: 3.0
throttle:
  max_tokens: 12
  max_concurrent_jobs: 3
  policy: fail_fast
summarization:
  concurrency_limit: 6
"#;

fn write_yaml(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_load_pipeline_from_file() {
    let file = write_yaml(PIPELINE_YAML);
    let config = PipelineConfig::from_yaml(file.path().to_str().unwrap()).unwrap();

    assert_eq!(config.stage_names(), vec!["filesystem", "summarization"]);
    assert_eq!(config.throttle.max_tokens, 12);
    assert_eq!(config.throttle.policy, AcquirePolicy::FailFast);
    assert_eq!(config.summarization.concurrency_limit, 6);
    // Unlisted sections keep their defaults
    assert_eq!(config.metrics, Default::default());

    let policies = config.step_policies();
    assert_eq!(policies[0].retry.max_retries, 0);
    assert_eq!(policies[0].retry.back_off, Duration::from_secs(2));
    assert_eq!(policies[1].retry.max_retries, 2);
    assert_eq!(policies[1].timeout, Some(Duration::from_secs(600)));
    assert!(policies[1].optional);
    assert_eq!(
        policies[1].retry.strategy,
        BackoffStrategy::Exponential {
            multiplier: 3.0,
            max_seconds: 300.0
        }
    );
    // 1.5s then 4.5s
    assert_eq!(policies[1].retry.delay_for(2), Duration::from_secs_f64(4.5));
}

#[test]
fn test_yaml_round_trip_preserves_config() {
    let file = write_yaml(PIPELINE_YAML);
    let config = PipelineConfig::from_yaml(file.path().to_str().unwrap()).unwrap();

    let rendered = config.to_yaml().unwrap();
    let reloaded = PipelineConfig::from_yaml_str(&rendered).unwrap();
    assert_eq!(reloaded, config);
}

#[test]
fn test_schema_errors() {
    let missing_version = "stages:\n  - name: filesystem\n";
    assert!(matches!(
        PipelineConfig::from_yaml_str(missing_version),
        Err(ConfigError::MissingVersion)
    ));

    let future = "version: 9\nstages:\n  - name: filesystem\n";
    assert!(matches!(
        PipelineConfig::from_yaml_str(future),
        Err(ConfigError::UnsupportedVersion { found: 9, .. })
    ));

    let typo = "version: 1\nstages:\n  - name: filesystem\n    max_retrys: 2\n";
    assert!(matches!(
        PipelineConfig::from_yaml_str(typo),
        Err(ConfigError::Yaml(_))
    ));

    let starved = "version: 1\nstages:\n  - name: filesystem\nthrottle:\n  max_tokens: 4\n  max_concurrent_jobs: 4\n";
    assert!(matches!(
        PipelineConfig::from_yaml_str(starved),
        Err(ConfigError::Range { .. })
    ));

    assert!(matches!(
        PipelineConfig::from_yaml("/no/such/pipeline.yaml"),
        Err(ConfigError::Io(_))
    ));
}

#[test]
fn test_default_config_validates() {
    let config = PipelineConfig::default();
    assert!(config.validate().is_ok());
    assert!(config.throttle.max_concurrent_jobs < config.throttle.max_tokens);
}

#[tokio::test]
async fn test_start_rejects_unregistered_stage() {
    let mut registry = StageRegistry::new();
    registry.register_stage(ScriptedStage::ok("filesystem"));

    let file = write_yaml(PIPELINE_YAML);
    let config = PipelineConfig::from_yaml(file.path().to_str().unwrap()).unwrap();

    match PipelineOrchestrator::start(config, &registry) {
        Err(OrchestratorError::Config(ConfigError::UnknownStage { name, suggestion })) => {
            assert_eq!(name, "summarization");
            assert!(suggestion.contains("filesystem"));
        }
        other => panic!("expected unknown stage, got {:?}", other.map(|_| ())),
    }
}
