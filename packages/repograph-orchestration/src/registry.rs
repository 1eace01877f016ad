//! Stage registry
//!
//! Startup-time table of stage name to constructor. The orchestrator instantiates every
//! configured stage once, when it starts; a configured name with no registration is a
//! configuration error.

use crate::config::{ConfigError, PipelineConfig};
use crate::error::{OrchestratorError, Result};
use crate::pipeline::Stage;
use crate::throttle::ResourceThrottle;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// What a factory gets to build its stage with
#[derive(Debug, Clone, Copy)]
pub struct StageEnv<'a> {
    pub config: &'a PipelineConfig,
    /// The orchestrator's throttle; stages that fan out draw per-task tokens from it
    pub throttle: &'a ResourceThrottle,
}

/// Builds one stage instance
pub type StageFactory = Arc<dyn Fn(&StageEnv<'_>) -> Result<Arc<dyn Stage>> + Send + Sync>;

/// Registry of stage constructors
#[derive(Clone, Default)]
pub struct StageRegistry {
    factories: BTreeMap<String, StageFactory>,
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("stages", &self.names())
            .finish()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under `name`; a later registration replaces an earlier one
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&StageEnv<'_>) -> Result<Arc<dyn Stage>> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.insert(name.clone(), Arc::new(factory)).is_some() {
            debug!(stage = %name, "Replaced stage registration");
        } else {
            debug!(stage = %name, "Registered stage");
        }
        self
    }

    /// Register an already-built stage under its own name
    pub fn register_stage(&mut self, stage: Arc<dyn Stage>) -> &mut Self {
        let name = stage.name().to_string();
        self.register(name, move |_| Ok(stage.clone()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Build the stage registered as `name`
    pub fn build(&self, name: &str, env: &StageEnv<'_>) -> Result<Arc<dyn Stage>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            OrchestratorError::Config(ConfigError::unknown_stage_with_suggestion(
                name,
                &self.names(),
            ))
        })?;
        let stage = factory(env)?;
        if stage.name() != name {
            return Err(OrchestratorError::fatal(format!(
                "stage registered as '{}' reports name '{}'",
                name,
                stage.name()
            )));
        }
        Ok(stage)
    }

    /// Build every configured stage, in configured order
    pub fn instantiate(&self, env: &StageEnv<'_>) -> Result<Vec<Arc<dyn Stage>>> {
        let config = env.config;
        config.validate_against(&self.names())?;
        let stages = config
            .stages
            .iter()
            .map(|s| self.build(&s.name, env))
            .collect::<Result<Vec<_>>>()?;
        info!(
            stages = ?config.stage_names(),
            "Instantiated pipeline stages"
        );
        Ok(stages)
    }
}
