use crate::config::SummarizationConfig;
use crate::error::{ErrorCategory, ErrorRecord, OrchestratorError, Result};
use crate::throttle::{ResourceThrottle, ResourceToken};
use async_trait::async_trait;
use futures::FutureExt;
use repograph_store::{labels, Properties};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a DAG node summarizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Symbol,
    File,
    Directory,
    Repository,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Symbol => "symbol",
            NodeKind::File => "file",
            NodeKind::Directory => "directory",
            NodeKind::Repository => "repository",
        }
    }

    /// Graph store label of this kind
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Symbol => labels::SYMBOL,
            NodeKind::File => labels::FILE,
            NodeKind::Directory => labels::DIRECTORY,
            NodeKind::Repository => labels::REPOSITORY,
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            labels::SYMBOL => Some(NodeKind::Symbol),
            labels::FILE => Some(NodeKind::File),
            labels::DIRECTORY => Some(NodeKind::Directory),
            labels::REPOSITORY => Some(NodeKind::Repository),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Runtime status of a DAG node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Done,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Ready => "ready",
            NodeStatus::Running => "running",
            NodeStatus::Done => "done",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
            NodeStatus::Cancelled => "cancelled",
        }
    }
}

/// One unit of summarization work
#[derive(Debug, Clone, PartialEq)]
pub struct DagNode {
    /// Merge key of the summarized node in the graph store
    pub id: String,
    pub kind: NodeKind,
    /// Nodes that must be done first
    pub dependencies: BTreeSet<String>,
    /// Properties of the summarized node, as read from the store
    pub properties: Properties,
}

impl DagNode {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            dependencies: BTreeSet::new(),
            properties: Properties::new(),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }
}

/// Acyclic dependency graph, stored as an arena with integer indices
#[derive(Debug, Clone)]
pub struct DependencyDag {
    nodes: Vec<DagNode>,
    index: HashMap<String, usize>,
    /// `dependencies[i]`: nodes `i` waits for
    dependencies: Vec<Vec<usize>>,
    /// `dependents[i]`: nodes waiting for `i`
    dependents: Vec<Vec<usize>>,
    /// Wave grouping (nodes whose dependencies are all in earlier waves)
    levels: Vec<Vec<usize>>,
}

impl DependencyDag {
    /// Build and validate the graph; duplicates, unknown dependencies and cycles are rejected
    pub fn new(nodes: Vec<DagNode>) -> Result<Self> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(OrchestratorError::fatal(format!(
                    "duplicate DAG node '{}'",
                    node.id
                )));
            }
        }

        let mut dependencies = vec![Vec::new(); nodes.len()];
        let mut dependents = vec![Vec::new(); nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            for dep in &node.dependencies {
                let &d = index.get(dep).ok_or_else(|| {
                    OrchestratorError::MissingDependency(format!(
                        "node '{}' depends on unknown node '{}'",
                        node.id, dep
                    ))
                })?;
                dependencies[i].push(d);
                dependents[d].push(i);
            }
        }

        let levels = Self::topological_levels(&nodes, &dependencies, &dependents)?;

        Ok(Self {
            nodes,
            index,
            dependencies,
            dependents,
            levels,
        })
    }

    /// Kahn's algorithm, one wave at a time
    fn topological_levels(
        nodes: &[DagNode],
        dependencies: &[Vec<usize>],
        dependents: &[Vec<usize>],
    ) -> Result<Vec<Vec<usize>>> {
        let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
        let mut wave: Vec<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut levels = Vec::new();
        let mut processed = 0;

        while !wave.is_empty() {
            processed += wave.len();
            let mut next = Vec::new();
            for &i in &wave {
                for &dependent in &dependents[i] {
                    in_degree[dependent] -= 1;
                    if in_degree[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }
            levels.push(wave);
            wave = next;
        }

        if processed < nodes.len() {
            let mut remaining: Vec<String> = (0..nodes.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| nodes[i].id.clone())
                .collect();
            remaining.sort();
            return Err(OrchestratorError::DagCycleDetected(remaining));
        }

        Ok(levels)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&DagNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn nodes(&self) -> &[DagNode] {
        &self.nodes
    }

    /// Nodes that depend on nothing (the leaves of the containment tree)
    pub fn roots(&self) -> Vec<&DagNode> {
        self.levels
            .first()
            .map(|wave| wave.iter().map(|&i| &self.nodes[i]).collect())
            .unwrap_or_default()
    }

    pub fn levels(&self) -> Vec<Vec<&str>> {
        self.levels
            .iter()
            .map(|wave| wave.iter().map(|&i| self.nodes[i].id.as_str()).collect())
            .collect()
    }

    /// Get execution plan as string (for logging)
    pub fn execution_plan(&self) -> String {
        self.levels()
            .iter()
            .enumerate()
            .map(|(i, wave)| {
                if wave.len() > 1 {
                    format!("Wave {}: {} (parallel)", i + 1, wave.join(" ∥ "))
                } else {
                    format!("Wave {}: {}", i + 1, wave[0])
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Work performed for one node once all its dependencies are done
#[async_trait]
pub trait NodeTask: Send + Sync {
    /// `inputs` maps each dependency id to the summary it produced
    async fn execute(&self, node: &DagNode, inputs: &BTreeMap<String, String>) -> Result<String>;
}

/// Limits applied by the executor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DagExecutorConfig {
    pub concurrency_limit: usize,
    pub node_timeout: Duration,
    pub node_max_retries: u32,
    pub node_back_off: Duration,
}

impl From<&SummarizationConfig> for DagExecutorConfig {
    fn from(config: &SummarizationConfig) -> Self {
        Self {
            concurrency_limit: config.concurrency_limit,
            node_timeout: Duration::from_secs_f64(config.node_timeout_seconds),
            node_max_retries: config.node_max_retries,
            node_back_off: Duration::from_secs_f64(config.node_back_off_seconds),
        }
    }
}

impl Default for DagExecutorConfig {
    fn default() -> Self {
        Self::from(&SummarizationConfig::default())
    }
}

/// Final state of one node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeOutcome {
    pub status: NodeStatus,
    pub summary: Option<String>,
    pub error: Option<ErrorRecord>,
    pub attempts: u32,
}

/// Per-node results of one run
#[derive(Debug, Clone, Default, Serialize)]
pub struct DagRunReport {
    pub outcomes: HashMap<String, NodeOutcome>,
    /// Highest number of node tasks observed running at once
    pub max_concurrency: usize,
    /// Done nodes, in the order they finished
    pub completion_order: Vec<String>,
}

impl DagRunReport {
    pub fn outcome(&self, id: &str) -> Option<&NodeOutcome> {
        self.outcomes.get(id)
    }

    pub fn status(&self, id: &str) -> Option<NodeStatus> {
        self.outcomes.get(id).map(|o| o.status)
    }

    pub fn summary(&self, id: &str) -> Option<&str> {
        self.outcomes.get(id).and_then(|o| o.summary.as_deref())
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.outcomes.values().filter(|o| o.status == status).count()
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.values().all(|o| o.status == NodeStatus::Done)
    }

    /// Ids with the given status, sorted
    pub fn ids_with(&self, status: NodeStatus) -> Vec<&str> {
        let mut ids: Vec<_> = self
            .outcomes
            .iter()
            .filter(|(_, o)| o.status == status)
            .map(|(id, _)| id.as_str())
            .collect();
        ids.sort();
        ids
    }
}

/// Result of one dispatched node task
struct NodeRun {
    index: usize,
    result: Result<String>,
    attempts: u32,
}

/// Wave-based topological executor with bounded concurrency
#[derive(Debug, Clone)]
pub struct DagExecutor {
    throttle: ResourceThrottle,
    config: DagExecutorConfig,
}

impl DagExecutor {
    pub fn new(throttle: ResourceThrottle, config: DagExecutorConfig) -> Self {
        Self { throttle, config }
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.config.concurrency_limit = limit.max(1);
        self
    }

    pub fn config(&self) -> &DagExecutorConfig {
        &self.config
    }

    /// Run every node whose dependencies are done, up to `concurrency_limit` at once.
    ///
    /// A failed node skips everything that transitively depends on it; unrelated
    /// branches continue. Once `cancel` fires nothing new is dispatched and the
    /// undispatched nodes are reported as cancelled.
    pub async fn run(
        &self,
        dag: &DependencyDag,
        task: Arc<dyn NodeTask>,
        cancel: CancellationToken,
    ) -> DagRunReport {
        let n = dag.len();
        let limit = self.config.concurrency_limit.max(1);

        let mut in_degree: Vec<usize> = dag.dependencies.iter().map(Vec::len).collect();
        let mut status = vec![NodeStatus::Pending; n];
        let mut summaries: Vec<Option<String>> = vec![None; n];
        let mut errors: Vec<Option<ErrorRecord>> = vec![None; n];
        let mut attempts = vec![0u32; n];

        let mut ready: VecDeque<usize> = VecDeque::new();
        for i in 0..n {
            if in_degree[i] == 0 {
                status[i] = NodeStatus::Ready;
                ready.push_back(i);
            }
        }

        let mut running: JoinSet<NodeRun> = JoinSet::new();
        let mut active = 0usize;
        let mut max_active = 0usize;
        let mut completion_order = Vec::new();

        debug!(nodes = n, limit, plan = %dag.execution_plan(), "Starting DAG run");

        loop {
            // Dispatch while there is room
            while active < limit && !cancel.is_cancelled() {
                let Some(i) = ready.pop_front() else { break };

                let token = match self.throttle.acquire_cancellable(1, &cancel).await {
                    Ok(token) => token,
                    Err(OrchestratorError::Cancelled(_)) => {
                        ready.push_front(i);
                        break;
                    }
                    Err(_) if active > 0 => {
                        // Saturated (fail-fast); retry once one of ours finishes
                        ready.push_front(i);
                        break;
                    }
                    Err(e) => {
                        warn!(node_id = %dag.nodes[i].id, error = %e, "No resource token for node");
                        status[i] = NodeStatus::Failed;
                        errors[i] = Some(e.to_record());
                        skip_dependents(dag, i, &mut status, &mut errors);
                        continue;
                    }
                };

                status[i] = NodeStatus::Running;
                active += 1;
                max_active = max_active.max(active);

                let node = dag.nodes[i].clone();
                let inputs: BTreeMap<String, String> = dag.dependencies[i]
                    .iter()
                    .filter_map(|&d| summaries[d].clone().map(|s| (dag.nodes[d].id.clone(), s)))
                    .collect();
                debug!(node_id = %node.id, kind = %node.kind, active, "Dispatching node");

                running.spawn(run_node(
                    i,
                    node,
                    inputs,
                    task.clone(),
                    self.config,
                    cancel.clone(),
                    token,
                ));
            }

            if active == 0 {
                break;
            }

            let run = match running.join_next().await {
                Some(Ok(run)) => run,
                Some(Err(e)) => {
                    // Panics are caught inside run_node, so only runtime shutdown lands here
                    warn!(error = %e, "Node task aborted; abandoning DAG run");
                    for i in 0..n {
                        if status[i] == NodeStatus::Running {
                            status[i] = NodeStatus::Cancelled;
                            errors[i] = Some(ErrorRecord::new(
                                ErrorCategory::Cancelled,
                                "node task aborted",
                            ));
                        }
                    }
                    break;
                }
                None => break,
            };
            active -= 1;

            let i = run.index;
            attempts[i] = run.attempts;
            match run.result {
                Ok(summary) => {
                    status[i] = NodeStatus::Done;
                    summaries[i] = Some(summary);
                    completion_order.push(dag.nodes[i].id.clone());
                    for &dependent in &dag.dependents[i] {
                        in_degree[dependent] -= 1;
                        if in_degree[dependent] == 0 && status[dependent] == NodeStatus::Pending {
                            status[dependent] = NodeStatus::Ready;
                            ready.push_back(dependent);
                        }
                    }
                }
                Err(e) if e.category() == ErrorCategory::Cancelled => {
                    status[i] = NodeStatus::Cancelled;
                    errors[i] = Some(e.to_record());
                }
                Err(e) => {
                    warn!(
                        node_id = %dag.nodes[i].id,
                        attempts = run.attempts,
                        error = %e,
                        "Node failed; skipping its dependents"
                    );
                    status[i] = NodeStatus::Failed;
                    errors[i] = Some(e.to_record());
                    skip_dependents(dag, i, &mut status, &mut errors);
                }
            }
        }

        // Whatever was never dispatched
        for i in 0..n {
            if matches!(status[i], NodeStatus::Pending | NodeStatus::Ready) {
                if cancel.is_cancelled() {
                    status[i] = NodeStatus::Cancelled;
                    errors[i] = Some(ErrorRecord::new(
                        ErrorCategory::Cancelled,
                        "cancelled before dispatch",
                    ));
                } else {
                    status[i] = NodeStatus::Skipped;
                }
            }
        }

        let outcomes: HashMap<String, NodeOutcome> = dag
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| {
                (
                    node.id.clone(),
                    NodeOutcome {
                        status: status[i],
                        summary: summaries[i].take(),
                        error: errors[i].take(),
                        attempts: attempts[i],
                    },
                )
            })
            .collect();

        let report = DagRunReport {
            outcomes,
            max_concurrency: max_active,
            completion_order,
        };
        info!(
            nodes = n,
            done = report.count(NodeStatus::Done),
            failed = report.count(NodeStatus::Failed),
            skipped = report.count(NodeStatus::Skipped),
            cancelled = report.count(NodeStatus::Cancelled),
            max_concurrency = report.max_concurrency,
            "DAG run finished"
        );
        report
    }
}

/// Mark every transitive dependent of `failed` as skipped.
///
/// Skipped nodes carry the upstream node's id and error category.
fn skip_dependents(
    dag: &DependencyDag,
    failed: usize,
    status: &mut [NodeStatus],
    errors: &mut [Option<ErrorRecord>],
) {
    let category = errors[failed]
        .as_ref()
        .map_or(ErrorCategory::Fatal, |e| e.category);
    let reason = format!("skipped: upstream node '{}' failed", dag.nodes[failed].id);
    let mut queue: VecDeque<usize> = dag.dependents[failed].iter().copied().collect();
    while let Some(i) = queue.pop_front() {
        if matches!(status[i], NodeStatus::Pending | NodeStatus::Ready) {
            status[i] = NodeStatus::Skipped;
            errors[i] = Some(ErrorRecord::new(category, reason.clone()));
            queue.extend(dag.dependents[i].iter().copied());
        }
    }
}

/// One node task: local retries for transient errors, each attempt bounded by the timeout
async fn run_node(
    index: usize,
    node: DagNode,
    inputs: BTreeMap<String, String>,
    task: Arc<dyn NodeTask>,
    config: DagExecutorConfig,
    cancel: CancellationToken,
    _token: ResourceToken,
) -> NodeRun {
    let mut attempts = 0u32;
    loop {
        if cancel.is_cancelled() {
            return NodeRun {
                index,
                result: Err(OrchestratorError::Cancelled(format!(
                    "node '{}' cancelled before start",
                    node.id
                ))),
                attempts,
            };
        }
        attempts += 1;

        let attempt = AssertUnwindSafe(task.execute(&node, &inputs)).catch_unwind();
        let result = match tokio::time::timeout(config.node_timeout, attempt).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OrchestratorError::fatal(format!(
                "node task for '{}' panicked",
                node.id
            ))),
            Err(_) => Err(OrchestratorError::Timeout(format!(
                "node '{}' exceeded {:?}",
                node.id, config.node_timeout
            ))),
        };

        match result {
            Ok(summary) => {
                return NodeRun {
                    index,
                    result: Ok(summary),
                    attempts,
                }
            }
            Err(e) if e.is_retryable() && attempts <= config.node_max_retries => {
                debug!(
                    node_id = %node.id,
                    attempt = attempts,
                    error = %e,
                    "Retrying node after back-off"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return NodeRun {
                            index,
                            result: Err(OrchestratorError::Cancelled(format!(
                                "node '{}' cancelled during back-off",
                                node.id
                            ))),
                            attempts,
                        };
                    }
                    _ = tokio::time::sleep(config.node_back_off) => {}
                }
            }
            Err(e) => {
                return NodeRun {
                    index,
                    result: Err(e),
                    attempts,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AcquirePolicy;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tree() -> Vec<DagNode> {
        vec![
            DagNode::new("root", NodeKind::Repository).depends_on(["dir1", "dir2"]),
            DagNode::new("dir1", NodeKind::Directory).depends_on(["fileA", "fileB"]),
            DagNode::new("dir2", NodeKind::Directory).depends_on(["fileC"]),
            DagNode::new("fileA", NodeKind::File),
            DagNode::new("fileB", NodeKind::File),
            DagNode::new("fileC", NodeKind::File),
        ]
    }

    fn executor(limit: usize) -> DagExecutor {
        DagExecutor::new(
            ResourceThrottle::new(16, AcquirePolicy::Wait),
            DagExecutorConfig {
                concurrency_limit: limit,
                node_timeout: Duration::from_secs(5),
                node_max_retries: 0,
                node_back_off: Duration::from_millis(10),
            },
        )
    }

    /// Joins dependency summaries; fails the listed ids
    struct Concat {
        fail: Vec<&'static str>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl NodeTask for Concat {
        async fn execute(&self, node: &DagNode, inputs: &BTreeMap<String, String>) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.iter().any(|id| *id == node.id) {
                return Err(OrchestratorError::fatal(format!("{} broke", node.id)));
            }
            let children: Vec<_> = inputs.values().cloned().collect();
            Ok(format!("{}[{}]", node.id, children.join(",")))
        }
    }

    #[test]
    fn test_levels_and_plan() {
        let dag = DependencyDag::new(tree()).unwrap();
        let mut levels = dag.levels();
        for wave in &mut levels {
            wave.sort();
        }
        assert_eq!(
            levels,
            vec![
                vec!["fileA", "fileB", "fileC"],
                vec!["dir1", "dir2"],
                vec!["root"]
            ]
        );
        assert_eq!(dag.roots().len(), 3);
        assert!(dag.execution_plan().contains("Wave 3: root"));
    }

    #[test]
    fn test_cycle_rejected() {
        let nodes = vec![
            DagNode::new("a", NodeKind::Directory).depends_on(["b"]),
            DagNode::new("b", NodeKind::Directory).depends_on(["a"]),
            DagNode::new("c", NodeKind::File),
        ];
        match DependencyDag::new(nodes) {
            Err(OrchestratorError::DagCycleDetected(ids)) => assert_eq!(ids, vec!["a", "b"]),
            other => panic!("expected cycle, got {:?}", other.map(|d| d.len())),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let nodes = vec![DagNode::new("a", NodeKind::File).depends_on(["a"])];
        assert!(matches!(
            DependencyDag::new(nodes),
            Err(OrchestratorError::DagCycleDetected(_))
        ));
    }

    #[test]
    fn test_missing_dependency_rejected() {
        let nodes = vec![DagNode::new("a", NodeKind::Directory).depends_on(["ghost"])];
        assert!(matches!(
            DependencyDag::new(nodes),
            Err(OrchestratorError::MissingDependency(_))
        ));
    }

    #[test]
    fn test_duplicate_rejected() {
        let nodes = vec![
            DagNode::new("a", NodeKind::File),
            DagNode::new("a", NodeKind::File),
        ];
        assert!(DependencyDag::new(nodes).is_err());
    }

    #[tokio::test]
    async fn test_summaries_flow_leaf_to_root() {
        let dag = DependencyDag::new(tree()).unwrap();
        let task = Arc::new(Concat {
            fail: vec![],
            calls: AtomicUsize::new(0),
        });

        let report = executor(2)
            .run(&dag, task.clone(), CancellationToken::new())
            .await;

        assert!(report.is_success());
        assert_eq!(task.calls.load(Ordering::SeqCst), 6);
        assert_eq!(report.summary("dir2"), Some("dir2[fileC[]]"));
        assert_eq!(
            report.summary("root"),
            Some("root[dir1[fileA[],fileB[]],dir2[fileC[]]]")
        );
        assert_eq!(report.completion_order.last().map(String::as_str), Some("root"));
        assert!(report.max_concurrency <= 2);
    }

    #[tokio::test]
    async fn test_failure_skips_only_dependents() {
        let dag = DependencyDag::new(tree()).unwrap();
        let task = Arc::new(Concat {
            fail: vec!["fileA"],
            calls: AtomicUsize::new(0),
        });

        let report = executor(3).run(&dag, task, CancellationToken::new()).await;

        assert_eq!(report.status("fileA"), Some(NodeStatus::Failed));
        assert_eq!(report.status("dir1"), Some(NodeStatus::Skipped));
        assert_eq!(report.status("root"), Some(NodeStatus::Skipped));
        assert_eq!(report.status("fileB"), Some(NodeStatus::Done));
        assert_eq!(report.status("dir2"), Some(NodeStatus::Done));
        assert_eq!(report.ids_with(NodeStatus::Skipped), vec!["dir1", "root"]);
    }

    #[tokio::test]
    async fn test_cancelled_run_dispatches_nothing() {
        let dag = DependencyDag::new(tree()).unwrap();
        let task = Arc::new(Concat {
            fail: vec![],
            calls: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = executor(2).run(&dag, task.clone(), cancel).await;

        assert_eq!(task.calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.count(NodeStatus::Cancelled), 6);
    }

    /// Fails transiently a fixed number of times per node
    struct Flaky {
        failures: usize,
        seen: Mutex<HashMap<String, usize>>,
    }

    #[async_trait]
    impl NodeTask for Flaky {
        async fn execute(&self, node: &DagNode, _inputs: &BTreeMap<String, String>) -> Result<String> {
            let mut seen = self.seen.lock();
            let count = seen.entry(node.id.clone()).or_insert(0);
            *count += 1;
            if *count <= self.failures {
                return Err(OrchestratorError::transient("rate limited"));
            }
            Ok(node.id.clone())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_node_errors_retried_locally() {
        let dag = DependencyDag::new(vec![DagNode::new("f", NodeKind::File)]).unwrap();
        let mut exec = executor(1);
        exec.config.node_max_retries = 2;

        let report = exec
            .run(
                &dag,
                Arc::new(Flaky {
                    failures: 2,
                    seen: Mutex::new(HashMap::new()),
                }),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(report.status("f"), Some(NodeStatus::Done));
        assert_eq!(report.outcome("f").unwrap().attempts, 3);

        let report = exec
            .run(
                &dag,
                Arc::new(Flaky {
                    failures: 3,
                    seen: Mutex::new(HashMap::new()),
                }),
                CancellationToken::new(),
            )
            .await;
        let outcome = report.outcome("f").unwrap();
        assert_eq!(outcome.status, NodeStatus::Failed);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(
            outcome.error.as_ref().map(|e| e.category),
            Some(ErrorCategory::Transient)
        );
    }

    #[tokio::test]
    async fn test_skipped_dependent_names_upstream() {
        let dag = DependencyDag::new(vec![
            DagNode::new("root", NodeKind::Repository).depends_on(["dir"]),
            DagNode::new("dir", NodeKind::Directory).depends_on(["f"]),
            DagNode::new("f", NodeKind::File),
        ])
        .unwrap();
        let task = Arc::new(Flaky {
            failures: 1,
            seen: Mutex::new(HashMap::new()),
        });

        let report = executor(1).run(&dag, task, CancellationToken::new()).await;

        assert_eq!(report.status("f"), Some(NodeStatus::Failed));
        for id in ["dir", "root"] {
            let outcome = report.outcome(id).unwrap();
            assert_eq!(outcome.status, NodeStatus::Skipped);
            let error = outcome.error.as_ref().unwrap();
            assert_eq!(error.category, ErrorCategory::Transient);
            assert!(error.message.contains("'f'"), "{}", error.message);
        }
    }

    struct Sleepy;

    #[async_trait]
    impl NodeTask for Sleepy {
        async fn execute(&self, node: &DagNode, _inputs: &BTreeMap<String, String>) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(node.id.clone())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_timeout_is_transient_failure() {
        let dag = DependencyDag::new(vec![DagNode::new("slow", NodeKind::File)]).unwrap();
        let report = executor(1)
            .run(&dag, Arc::new(Sleepy), CancellationToken::new())
            .await;

        let outcome = report.outcome("slow").unwrap();
        assert_eq!(outcome.status, NodeStatus::Failed);
        assert_eq!(
            outcome.error.as_ref().map(|e| e.category),
            Some(ErrorCategory::Transient)
        );
    }

    #[tokio::test]
    async fn test_tokens_returned_after_run() {
        let throttle = ResourceThrottle::new(4, AcquirePolicy::Wait);
        let exec = DagExecutor::new(throttle.clone(), DagExecutorConfig::default());
        let dag = DependencyDag::new(tree()).unwrap();

        exec.run(
            &dag,
            Arc::new(Concat {
                fail: vec![],
                calls: AtomicUsize::new(0),
            }),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(throttle.snapshot().available, 4);
    }

    #[tokio::test]
    async fn test_empty_dag() {
        let dag = DependencyDag::new(vec![]).unwrap();
        let report = executor(2).run(&dag, Arc::new(Sleepy), CancellationToken::new()).await;
        assert!(report.outcomes.is_empty());
        assert!(report.is_success());
    }
}
