//! DAG Runner scheduling throughput benchmark.
//!
//! Measures wall-clock for running a wide, shallow DAG of independent
//! no-op stages, and a narrow, deep chain, using Criterion.

use adventure_core::bus::EventBus;
use adventure_core::dag::{Budget, DagConfig, DagRunner, HandlerContext, RetryPolicy, Stage, StageHandler};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tokio::sync::Mutex;

fn stage(id: &str, depends_on: Vec<&str>) -> Stage {
    Stage {
        id: id.to_string(),
        stage_type: "noop".to_string(),
        depends_on: depends_on.into_iter().map(String::from).collect(),
        retry: RetryPolicy::default(),
        budget: Budget::default(),
        payload: serde_json::Value::Null,
        optional: false,
    }
}

fn noop_handler() -> Arc<dyn StageHandler> {
    Arc::new(|_ctx: HandlerContext| async move { Ok(serde_json::Value::Null) })
}

fn wide_dag(width: usize) -> DagConfig {
    DagConfig {
        id: "bench-wide".to_string(),
        description: None,
        stages: (0..width).map(|i| stage(&format!("s{i}"), vec![])).collect(),
    }
}

fn chain_dag(depth: usize) -> DagConfig {
    let stages = (0..depth)
        .map(|i| {
            let deps = if i == 0 { vec![] } else { vec![format!("s{}", i - 1)] };
            Stage {
                id: format!("s{i}"),
                stage_type: "noop".to_string(),
                depends_on: deps,
                retry: RetryPolicy::default(),
                budget: Budget::default(),
                payload: serde_json::Value::Null,
                optional: false,
            }
        })
        .collect();
    DagConfig { id: "bench-chain".to_string(), description: None, stages }
}

fn run_dag(rt: &tokio::runtime::Runtime, dag: DagConfig) {
    rt.block_on(async {
        let bus = Arc::new(Mutex::new(EventBus::default()));
        let mut runner = DagRunner::new(dag.clone(), bus).unwrap();
        for stage in &dag.stages {
            runner.register_stage_handler(stage.id.clone(), noop_handler());
        }
        black_box(runner.start(serde_json::json!({})).await.unwrap());
    });
}

fn bench_wide(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("dag_wide");
    for &width in &[1usize, 16, 64, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, &width| {
            b.iter(|| run_dag(&rt, wide_dag(width)));
        });
    }
    group.finish();
}

fn bench_chain(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("dag_chain");
    for &depth in &[1usize, 8, 32, 128] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter(|| run_dag(&rt, chain_dag(depth)));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_wide, bench_chain);
criterion_main!(benches);
