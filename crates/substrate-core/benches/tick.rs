//! Tick throughput: propagation staging and a full engine tick over random
//! graphs of increasing size.
//!
//! Run with: `cargo bench -p substrate-core`

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use substrate_core::{
    EdgeSpec, EngineConfig, EngineInstance, EntityId, Graph, NodeId, NodeSpec, Propagator,
    ProposalOutcome,
};

const V: EntityId = EntityId(1);

fn random_graph(size: usize, degree: usize, rng: &mut SmallRng) -> (Graph, Vec<NodeId>) {
    let mut graph = Graph::new();
    let ids: Vec<NodeId> = (0..size)
        .map(|i| {
            graph
                .upsert_node(NodeSpec::new(format!("n{i}")), 0, 0)
                .expect("node")
        })
        .collect();
    for &source in &ids {
        for _ in 0..degree {
            let target = ids[rng.random_range(0..size)];
            graph
                .upsert_edge(EdgeSpec::new(source, target, rng.random_range(0.1..0.9)), 0, 0)
                .expect("edge");
        }
    }
    (graph, ids)
}

fn bench_stage(c: &mut Criterion) {
    let mut group = c.benchmark_group("propagation_stage");
    let propagator = Propagator::default();

    for size in [100usize, 1_000, 10_000] {
        let mut rng = SmallRng::seed_from_u64(7);
        let (mut graph, ids) = random_graph(size, 4, &mut rng);
        for &id in ids.iter().step_by(10) {
            propagator.inject(&mut graph, V, id, 0.8).expect("inject");
        }
        group.bench_with_input(BenchmarkId::from_parameter(size), &graph, |b, graph| {
            b.iter(|| {
                black_box(
                    propagator
                        .stage(graph, &[V], 0.5, |_, _| false)
                        .expect("stage"),
                )
            });
        });
    }
    group.finish();
}

fn bench_engine_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_tick");

    for size in [100usize, 1_000] {
        let mut rng = SmallRng::seed_from_u64(11);
        let mut engine = EngineInstance::new("bench", EngineConfig::default());
        let ids: Vec<NodeId> = (0..size)
            .map(|i| {
                engine
                    .upsert_node(NodeSpec::new(format!("n{i}")), None, 0)
                    .expect("node")
            })
            .collect();
        for &source in &ids {
            for _ in 0..4 {
                let target = ids[rng.random_range(0..size)];
                engine
                    .upsert_edge(EdgeSpec::new(source, target, 0.5), None, 0)
                    .expect("edge");
            }
        }
        let Ok(ProposalOutcome::Created(entity)) = engine.propose_entity("bench", &ids[..20], 0)
        else {
            panic!("proposal");
        };
        for &id in &ids[..20] {
            engine
                .inject_energy(entity, id, 0.9, "bench", 0)
                .expect("inject");
        }

        let mut now = 0;
        group.bench_function(BenchmarkId::from_parameter(size), |b| {
            b.iter(|| {
                now = engine.schedule(now).due_at;
                black_box(engine.run_tick(now).expect("tick"))
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_stage, bench_engine_tick);
criterion_main!(benches);
