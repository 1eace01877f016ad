//! Summarization stage
//!
//! Builds the containment DAG from the graph store (a parent depends on every child it
//! `CONTAINS`), then summarizes leaf-to-root through the [`DagExecutor`]: each node's
//! prompt carries the summaries of its children. Results are written back as
//! `summary:<node_id>` nodes linked by `DESCRIBES`.
//!
//! In incremental mode a node whose stored `source_hash` matches the hash of its freshly
//! extracted content reuses the stored summary, so re-running an update against an
//! unchanged store calls the generator zero times and writes nothing.

use crate::config::SummarizationConfig;
use crate::dag::{
    DagExecutor, DagExecutorConfig, DagNode, DagRunReport, DependencyDag, NodeKind, NodeStatus,
    NodeTask,
};
use crate::error::{ErrorCategory, OrchestratorError, Result};
use crate::pipeline::{Stage, StageContext, StageOptions, StageOutcome, StepHandle};
use crate::throttle::ResourceThrottle;
use async_trait::async_trait;
use repograph_store::{labels, relationships, GraphStore, Properties, QueryPattern};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub const SUMMARIZATION_STAGE: &str = "summarization";

/// Natural-language generation backend
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Errors are classified like any other: `Transient` is retried by the node task
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Produces the text a node is summarized from
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    /// `child_summaries` maps child node id to its finished summary
    async fn extract(&self, node: &DagNode, child_summaries: &BTreeMap<String, String>)
        -> Result<String>;
}

/// Reads file bodies from disk (`abs_path` property); aggregates use child summaries
#[derive(Debug, Clone)]
pub struct FileContentExtractor {
    max_bytes: usize,
}

impl FileContentExtractor {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes: max_bytes.max(1),
        }
    }

    fn truncate(&self, bytes: &[u8]) -> String {
        let end = bytes.len().min(self.max_bytes);
        let text = String::from_utf8_lossy(&bytes[..end]).into_owned();
        if bytes.len() > self.max_bytes {
            format!("{}\n[truncated after {} bytes]", text, self.max_bytes)
        } else {
            text
        }
    }
}

impl Default for FileContentExtractor {
    fn default() -> Self {
        Self::new(SummarizationConfig::default().max_content_bytes)
    }
}

#[async_trait]
impl ContentExtractor for FileContentExtractor {
    async fn extract(
        &self,
        node: &DagNode,
        child_summaries: &BTreeMap<String, String>,
    ) -> Result<String> {
        let mut content = String::new();
        match node.kind {
            NodeKind::File => {
                if let Some(path) = node.properties.get("abs_path").and_then(|v| v.as_str()) {
                    let bytes = tokio::fs::read(path).await?;
                    content.push_str(&self.truncate(&bytes));
                }
            }
            NodeKind::Symbol => {
                for key in ["name", "signature", "body"] {
                    if let Some(value) = node.properties.get(key).and_then(|v| v.as_str()) {
                        let _ = writeln!(content, "{}: {}", key, value);
                    }
                }
            }
            NodeKind::Directory | NodeKind::Repository => {
                if let Some(name) = node.properties.get("name").and_then(|v| v.as_str()) {
                    let _ = writeln!(content, "name: {}", name);
                }
            }
        }
        // BTreeMap order keeps the content, and so its hash, stable
        for (child, summary) in child_summaries {
            let _ = writeln!(content, "- {}: {}", child, summary);
        }
        Ok(content)
    }
}

/// Summarization over the containment DAG
pub struct SummarizationStage {
    store: Arc<dyn GraphStore>,
    generator: Arc<dyn TextGenerator>,
    extractor: Arc<dyn ContentExtractor>,
    executor: DagExecutor,
}

impl SummarizationStage {
    pub fn new(
        store: Arc<dyn GraphStore>,
        generator: Arc<dyn TextGenerator>,
        extractor: Arc<dyn ContentExtractor>,
        throttle: ResourceThrottle,
        config: &SummarizationConfig,
    ) -> Self {
        Self {
            store,
            generator,
            extractor,
            executor: DagExecutor::new(throttle, DagExecutorConfig::from(config)),
        }
    }

    /// Read the containment graph into a DAG; summary nodes are never part of it
    pub async fn build_dag(&self) -> Result<DependencyDag> {
        let mut nodes: BTreeMap<String, DagNode> = BTreeMap::new();
        for kind in [
            NodeKind::Repository,
            NodeKind::Directory,
            NodeKind::File,
            NodeKind::Symbol,
        ] {
            let rows = self
                .store
                .query(&QueryPattern::NodesByLabel(kind.label().to_string()))
                .await?;
            for row in rows {
                let Some(id) = row.get_str("id") else { continue };
                nodes
                    .entry(id.to_string())
                    .or_insert_with(|| DagNode::new(id, kind).with_properties(row.properties()));
            }
        }

        let contains = self
            .store
            .query(&QueryPattern::RelationshipsByType(
                relationships::CONTAINS.to_string(),
            ))
            .await?;
        let mut edges = 0usize;
        for row in contains {
            let (Some(parent), Some(child)) = (row.get_str("from"), row.get_str("to")) else {
                continue;
            };
            if !nodes.contains_key(child) {
                continue;
            }
            if let Some(node) = nodes.get_mut(parent) {
                node.dependencies.insert(child.to_string());
                edges += 1;
            }
        }
        debug!(nodes = nodes.len(), edges, "SummarizationStage: DAG built");

        DependencyDag::new(nodes.into_values().collect())
    }

    async fn summarize(&self, ctx: StageContext, incremental: bool) -> Result<StageOutcome> {
        let start = Instant::now();
        let dag = self.build_dag().await?;
        if dag.is_empty() {
            return Ok(StageOutcome::new(0).with_message("nothing to summarize"));
        }

        let limit = ctx
            .options
            .get_u64("concurrency_limit")
            .map(|l| l as usize)
            .or(ctx.concurrency)
            .unwrap_or(self.executor.config().concurrency_limit);
        let executor = self.executor.clone().with_concurrency_limit(limit);
        info!(
            repository_ref = %ctx.repository_ref,
            nodes = dag.len(),
            waves = dag.levels().len(),
            concurrency_limit = limit,
            incremental,
            "SummarizationStage: starting"
        );
        debug!("SummarizationStage plan:\n{}", dag.execution_plan());

        let task = Arc::new(SummaryNodeTask {
            store: self.store.clone(),
            generator: self.generator.clone(),
            extractor: self.extractor.clone(),
            incremental,
            handle: ctx.handle.clone(),
            total: dag.len(),
            finished: AtomicUsize::new(0),
            generated: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
        });
        let report = executor.run(&dag, task.clone(), ctx.handle.token()).await;

        if ctx.handle.is_cancelled() {
            return Err(OrchestratorError::Cancelled(format!(
                "summarization interrupted with {} of {} nodes done",
                report.count(NodeStatus::Done),
                dag.len()
            )));
        }
        check_repositories(&dag, &report)?;

        let done = report.count(NodeStatus::Done);
        let failed = report.count(NodeStatus::Failed);
        let skipped = report.count(NodeStatus::Skipped);
        let generated = task.generated.load(Ordering::Relaxed);
        let reused = task.reused.load(Ordering::Relaxed);
        let mut message = format!(
            "summarized {}/{} nodes ({} generated, {} reused) in {}ms",
            done,
            dag.len(),
            generated,
            reused,
            start.elapsed().as_millis()
        );
        if failed + skipped > 0 {
            let _ = write!(message, "; partial: {} failed, {} skipped", failed, skipped);
            warn!(
                failed = ?report.ids_with(NodeStatus::Failed),
                skipped,
                "SummarizationStage: partial success"
            );
        }
        info!(max_concurrency = report.max_concurrency, "SummarizationStage: {}", message);
        Ok(StageOutcome::new(done).with_message(message))
    }
}

/// A repository node that did not finish fails the whole step
fn check_repositories(dag: &DependencyDag, report: &DagRunReport) -> Result<()> {
    for node in dag.nodes().iter().filter(|n| n.kind == NodeKind::Repository) {
        let Some(outcome) = report.outcome(&node.id) else {
            continue;
        };
        if outcome.status == NodeStatus::Done {
            continue;
        }
        let fatal = report
            .outcomes
            .values()
            .filter(|o| o.status == NodeStatus::Failed)
            .filter_map(|o| o.error.as_ref())
            .any(|e| !e.category.is_retryable() && e.category != ErrorCategory::Cancelled);
        let message = format!(
            "repository node '{}' {}: {}",
            node.id,
            outcome.status.as_str(),
            outcome
                .error
                .as_ref()
                .map_or("no summary produced", |e| e.message.as_str())
        );
        return Err(if fatal {
            OrchestratorError::Fatal(message)
        } else {
            OrchestratorError::Transient(message)
        });
    }
    Ok(())
}

#[async_trait]
impl Stage for SummarizationStage {
    fn name(&self) -> &str {
        SUMMARIZATION_STAGE
    }

    fn validate_options(&self, options: &StageOptions) -> Result<()> {
        if let Some(value) = options.get("concurrency_limit") {
            if value.as_u64().map_or(true, |l| l == 0) {
                return Err(OrchestratorError::invalid_options(
                    "summarization.concurrency_limit must be a positive integer",
                ));
            }
        }
        Ok(())
    }

    async fn run(&self, ctx: StageContext) -> Result<StageOutcome> {
        self.summarize(ctx, false).await
    }

    async fn ingestion_update(&self, ctx: StageContext) -> Result<StageOutcome> {
        self.summarize(ctx, true).await
    }
}

fn summary_id(node_id: &str) -> String {
    format!("summary:{}", node_id)
}

fn source_hash(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

fn build_prompt(node: &DagNode, content: &str) -> String {
    let instruction = match node.kind {
        NodeKind::Symbol => "Summarize what this symbol does in one or two sentences.",
        NodeKind::File => "Summarize the purpose of this file in a short paragraph.",
        NodeKind::Directory => {
            "Summarize the responsibilities of this directory from the summaries of its contents."
        }
        NodeKind::Repository => {
            "Summarize what this repository is for and how it is organised, from the summaries of its top-level contents."
        }
    };
    format!(
        "{}\n\n{} {}\n\n{}",
        instruction,
        node.kind.label(),
        node.id,
        content
    )
}

/// Per-node work: extract → prompt → generate → upsert
struct SummaryNodeTask {
    store: Arc<dyn GraphStore>,
    generator: Arc<dyn TextGenerator>,
    extractor: Arc<dyn ContentExtractor>,
    incremental: bool,
    handle: StepHandle,
    total: usize,
    finished: AtomicUsize,
    generated: AtomicUsize,
    reused: AtomicUsize,
}

impl SummaryNodeTask {
    async fn stored_summary(&self, id: &str, hash: &str) -> Result<Option<String>> {
        let rows = self
            .store
            .query(&QueryPattern::NodeById(id.to_string()))
            .await?;
        Ok(rows
            .into_iter()
            .next()
            .filter(|row| row.property_str("source_hash") == Some(hash))
            .and_then(|row| row.property_str("text").map(str::to_string)))
    }

    fn node_finished(&self) {
        let finished = self.finished.fetch_add(1, Ordering::Relaxed) + 1;
        let percent = (finished * 100 / self.total.max(1)).min(99) as u8;
        self.handle.report_progress(
            percent,
            Some(format!("{}/{} nodes summarized", finished, self.total)),
        );
    }
}

#[async_trait]
impl NodeTask for SummaryNodeTask {
    async fn execute(&self, node: &DagNode, inputs: &BTreeMap<String, String>) -> Result<String> {
        let content = self.extractor.extract(node, inputs).await?;
        let hash = source_hash(&content);
        let id = summary_id(&node.id);

        if self.incremental {
            if let Some(text) = self.stored_summary(&id, &hash).await? {
                debug!(node_id = %node.id, "Summary unchanged; reusing");
                self.reused.fetch_add(1, Ordering::Relaxed);
                self.node_finished();
                return Ok(text);
            }
        }

        let text = self.generator.generate(&build_prompt(node, &content)).await?;
        self.generated.fetch_add(1, Ordering::Relaxed);

        let mut props = Properties::new();
        props.insert("text".into(), json!(text));
        props.insert("source_hash".into(), json!(hash));
        props.insert("node_id".into(), json!(node.id));
        props.insert("kind".into(), json!(node.kind.as_str()));
        self.store
            .upsert_node(&id, &[labels::SUMMARY], props)
            .await?;
        self.store
            .upsert_relationship(&id, &node.id, relationships::DESCRIBES, Properties::new())
            .await?;

        self.node_finished();
        Ok(text)
    }
}

/// Node ids whose `Summary` is present in the store
pub async fn summarized_ids(store: &dyn GraphStore) -> Result<HashSet<String>> {
    let rows = store
        .query(&QueryPattern::NodesByLabel(labels::SUMMARY.to_string()))
        .await?;
    Ok(rows
        .iter()
        .filter_map(|row| row.property_str("node_id").map(str::to_string))
        .collect())
}
