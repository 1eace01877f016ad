//! Benchmark for the dependency-DAG executor
//!
//! Measures:
//! - Wide trees (many files per directory) at several concurrency limits
//! - Deep chains (scheduling overhead with no parallelism)
//! - Graph construction and wave planning

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use repograph_orchestration::{
    AcquirePolicy, DagExecutor, DagExecutorConfig, DagNode, DependencyDag, NodeKind, NodeTask,
    ResourceThrottle, Result,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Concatenates child summary lengths; yields once so tasks interleave
struct Trivial;

#[async_trait]
impl NodeTask for Trivial {
    async fn execute(&self, node: &DagNode, inputs: &BTreeMap<String, String>) -> Result<String> {
        tokio::task::yield_now().await;
        let total: usize = inputs.values().map(String::len).sum();
        Ok(format!("{}:{}", node.id, total % 97))
    }
}

/// Repository → `dirs` directories → `files_per_dir` files each
fn wide_tree(dirs: usize, files_per_dir: usize) -> Vec<DagNode> {
    let mut nodes = Vec::with_capacity(1 + dirs * (files_per_dir + 1));
    let dir_ids: Vec<String> = (0..dirs).map(|d| format!("dir{}", d)).collect();
    nodes.push(DagNode::new("repo", NodeKind::Repository).depends_on(dir_ids.clone()));
    for (d, dir_id) in dir_ids.iter().enumerate() {
        let files: Vec<String> = (0..files_per_dir).map(|f| format!("file{}_{}", d, f)).collect();
        for file in &files {
            nodes.push(DagNode::new(file.clone(), NodeKind::File));
        }
        nodes.push(DagNode::new(dir_id.clone(), NodeKind::Directory).depends_on(files));
    }
    nodes
}

/// n0 ← n1 ← … ← n(len-1)
fn chain(len: usize) -> Vec<DagNode> {
    (0..len)
        .map(|i| {
            let node = DagNode::new(format!("n{}", i), NodeKind::Directory);
            if i == 0 {
                node
            } else {
                node.depends_on([format!("n{}", i - 1)])
            }
        })
        .collect()
}

fn executor(limit: usize) -> DagExecutor {
    DagExecutor::new(
        ResourceThrottle::new(limit.max(2) * 2, AcquirePolicy::Wait),
        DagExecutorConfig {
            concurrency_limit: limit,
            node_timeout: Duration::from_secs(60),
            node_max_retries: 0,
            node_back_off: Duration::from_millis(1),
        },
    )
}

/// Benchmark a 20 x 50 tree at several limits
fn bench_wide_tree(c: &mut Criterion) {
    let mut group = c.benchmark_group("wide_tree");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dag = DependencyDag::new(wide_tree(20, 50)).unwrap();
    let task: Arc<dyn NodeTask> = Arc::new(Trivial);

    for limit in [1usize, 4, 16, 64].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(limit), limit, |b, &limit| {
            let exec = executor(limit);
            b.to_async(&rt).iter(|| async {
                let report = exec
                    .run(&dag, task.clone(), CancellationToken::new())
                    .await;
                black_box(report.completion_order.len())
            });
        });
    }

    group.finish();
}

/// Benchmark a pure chain: every node waits on the previous one
fn bench_deep_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("deep_chain");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let task: Arc<dyn NodeTask> = Arc::new(Trivial);

    for len in [100usize, 1000].iter() {
        let dag = DependencyDag::new(chain(*len)).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(len), len, |b, _| {
            let exec = executor(8);
            b.to_async(&rt).iter(|| async {
                let report = exec
                    .run(&dag, task.clone(), CancellationToken::new())
                    .await;
                black_box(report.max_concurrency)
            });
        });
    }

    group.finish();
}

/// Benchmark validation and Kahn wave planning alone
fn bench_dag_construction(c: &mut Criterion) {
    let mut group = c.benchmark_group("dag_construction");

    for dirs in [10usize, 100].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(dirs), dirs, |b, &dirs| {
            b.iter(|| {
                let dag = DependencyDag::new(wide_tree(dirs, 20)).unwrap();
                black_box(dag.levels().len())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_wide_tree, bench_deep_chain, bench_dag_construction);
criterion_main!(benches);
