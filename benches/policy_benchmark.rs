use chrono::{Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use flowplane::ledger::{AgentSnapshot, LedgerSnapshot};
use flowplane::policy::{PolicyKind, ScheduleCandidate, SystemSnapshot};
use std::collections::BTreeSet;
use uuid::Uuid;

fn ready_set(count: usize) -> Vec<ScheduleCandidate> {
    let now = Utc::now();
    let classes = ["default", "gpu", "io", "gpu,io"];
    (0..count)
        .map(|i| ScheduleCandidate {
            flow_id: Uuid::new_v4(),
            priority: (i * 7 % 10) as i32,
            submitted_at: now - Duration::milliseconds(i as i64),
            seq: i as u64,
            deadline: (i % 3 == 0).then(|| now + Duration::seconds((i % 120) as i64 + 1)),
            resource_requirements: (i % 4) as u32 + 1,
            agent_class: classes[i % classes.len()].to_string(),
        })
        .collect()
}

fn snapshot() -> SystemSnapshot {
    let agents = vec![
        AgentSnapshot {
            id: "cpu-1".into(),
            capabilities: BTreeSet::new(),
            capacity: 8,
            current_load: 3,
        },
        AgentSnapshot {
            id: "gpu-1".into(),
            capabilities: BTreeSet::from(["gpu".to_string()]),
            capacity: 2,
            current_load: 1,
        },
    ];
    SystemSnapshot {
        now: Utc::now(),
        ledger: LedgerSnapshot {
            total_capacity: 10,
            reserved: 4,
            agents,
        },
        dispatched: 2,
        max_concurrent: 8,
    }
}

fn bench_policies(c: &mut Criterion) {
    let system = snapshot();
    let kinds = [
        PolicyKind::Fifo,
        PolicyKind::Priority,
        PolicyKind::ResourceAware,
        PolicyKind::LoadBalanced,
        PolicyKind::DeadlineAware,
    ];

    for size in [10, 100, 1_000] {
        let ready = ready_set(size);
        let mut group = c.benchmark_group(format!("policy_order_{size}"));
        for kind in kinds {
            let policy = kind.build();
            group.bench_with_input(BenchmarkId::from_parameter(kind), &ready, |b, ready| {
                b.iter(|| black_box(policy.order(ready, &system)));
            });
        }
        group.finish();
    }
}

criterion_group!(benches, bench_policies);
criterion_main!(benches);
