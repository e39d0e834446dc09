use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use flowplane::dag::DependencyGraph;
use uuid::Uuid;

/// Linear chain flow0 -> flow1 -> ...: maximum depth for the cycle check
fn build_linear_chain(count: usize) -> (DependencyGraph, Vec<Uuid>) {
    let mut graph = DependencyGraph::new();
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let id = Uuid::new_v4();
        let deps: Vec<Uuid> = ids.last().copied().into_iter().collect();
        graph
            .register(id, &format!("flow{i}"), &deps)
            .expect("chain is acyclic");
        ids.push(id);
    }
    (graph, ids)
}

/// Layers of 4 parallel flows, each layer fanning into one join flow
fn build_diamond(layers: usize) -> DependencyGraph {
    let mut graph = DependencyGraph::new();
    let mut join = Uuid::new_v4();
    graph.register(join, "root", &[]).expect("root");
    for layer in 0..layers {
        let mut branches = Vec::with_capacity(4);
        for branch in 0..4 {
            let id = Uuid::new_v4();
            graph
                .register(id, &format!("l{layer}b{branch}"), &[join])
                .expect("branch");
            branches.push(id);
        }
        join = Uuid::new_v4();
        graph
            .register(join, &format!("join{layer}"), &branches)
            .expect("join");
    }
    graph
}

fn bench_register_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("register_linear_chain");
    for size in [10, 100, 500] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| black_box(build_linear_chain(size)));
        });
    }
    group.finish();
}

fn bench_topological_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("topological_order");
    for layers in [10, 50, 100] {
        let graph = build_diamond(layers);
        group.bench_with_input(BenchmarkId::new("diamond", layers), &graph, |b, graph| {
            b.iter(|| black_box(graph.topological_order().expect("acyclic")));
        });
    }
    group.finish();
}

fn bench_completion_cascade(c: &mut Criterion) {
    c.bench_function("mark_completed_chain_500", |b| {
        b.iter_batched(
            || build_linear_chain(500),
            |(mut graph, ids)| {
                for id in ids {
                    black_box(graph.mark_completed(id));
                }
            },
            criterion::BatchSize::LargeInput,
        );
    });
}

fn bench_rejected_cycle(c: &mut Criterion) {
    c.bench_function("add_dependency_cycle_500", |b| {
        b.iter_batched(
            || build_linear_chain(500),
            |(mut graph, ids)| {
                let first = ids[0];
                let last = ids[ids.len() - 1];
                black_box(graph.add_dependency(first, last).is_err())
            },
            criterion::BatchSize::LargeInput,
        );
    });
}

criterion_group!(
    benches,
    bench_register_chain,
    bench_topological_order,
    bench_completion_cascade,
    bench_rejected_cycle
);
criterion_main!(benches);
