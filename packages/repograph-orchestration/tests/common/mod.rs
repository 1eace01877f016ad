//! Shared fixtures for orchestration integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use repograph_orchestration::{
    OrchestratorError, PipelineConfig, PipelineOrchestrator, Result, Stage, StageContext,
    StageOutcome, StageRegistry, StageSettings, TextGenerator,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What one invocation of a [`ScriptedStage`] does
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Attempt {
    Succeed,
    Transient,
    Fatal,
    /// Park until the step token fires
    Block,
    Sleep(Duration),
}

/// Stage that plays back a script, one entry per invocation, then succeeds
pub struct ScriptedStage {
    name: String,
    script: Mutex<VecDeque<Attempt>>,
    calls: AtomicU32,
    started: Mutex<Vec<tokio::time::Instant>>,
}

impl ScriptedStage {
    pub fn new(name: &str, script: impl IntoIterator<Item = Attempt>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(script.into_iter().collect()),
            calls: AtomicU32::new(0),
            started: Mutex::new(Vec::new()),
        })
    }

    pub fn ok(name: &str) -> Arc<Self> {
        Self::new(name, [])
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> Vec<tokio::time::Instant> {
        self.started.lock().clone()
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: StageContext) -> Result<StageOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.lock().push(tokio::time::Instant::now());
        let attempt = self.script.lock().pop_front().unwrap_or(Attempt::Succeed);
        match attempt {
            Attempt::Succeed => Ok(StageOutcome::new(1)),
            Attempt::Transient => Err(OrchestratorError::transient("backend busy")),
            Attempt::Fatal => Err(OrchestratorError::fatal("invalid input")),
            Attempt::Block => {
                ctx.handle.cancelled().await;
                Err(OrchestratorError::Cancelled("step token fired".into()))
            }
            Attempt::Sleep(d) => {
                tokio::time::sleep(d).await;
                Ok(StageOutcome::new(1))
            }
        }
    }
}

/// Start an orchestrator over `stages`, configured by `settings` in order
pub fn orchestrator(
    stages: &[Arc<ScriptedStage>],
    settings: Vec<StageSettings>,
) -> Arc<PipelineOrchestrator> {
    let mut registry = StageRegistry::new();
    for stage in stages {
        registry.register_stage(stage.clone());
    }
    let mut config = PipelineConfig::with_stages(settings);
    config.throttle.max_tokens = 8;
    config.throttle.max_concurrent_jobs = 4;
    PipelineOrchestrator::start(config, &registry).expect("orchestrator starts")
}

/// Deterministic generator: `summary of <label> <id>`
#[derive(Default)]
pub struct EchoGenerator {
    calls: AtomicU32,
}

impl EchoGenerator {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextGenerator for EchoGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let header = prompt.lines().nth(2).unwrap_or_default();
        Ok(format!("summary of {}", header))
    }
}
