//! Benchmark for security group rule derivation and the reconcile hash
//!
//! Both run on every reconcile of every LoadBalancer.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use smart_lb_operator::controlplane::hash::{machine_spec, machine_spec_hash, reconcile_hash};
use smart_lb_operator::controlplane::rules::desired_rules;
use smart_lb_operator::LoadBalancer;

fn load_balancer(ports: usize, source_ranges: usize) -> LoadBalancer {
    let ports: Vec<_> = (0..ports)
        .map(|i| json!({"name": format!("p{}", i), "protocol": "TCP", "port": 8000 + i, "nodePort": 30000 + i}))
        .collect();
    let ranges: Vec<_> = (0..source_ranges)
        .map(|i| {
            if i % 2 == 0 {
                format!("10.{}.0.0/16", i % 256)
            } else {
                format!("fd00:{:x}::/64", i)
            }
        })
        .collect();

    serde_json::from_value(json!({
        "apiVersion": "network.billyronks.io/v1",
        "kind": "LoadBalancer",
        "metadata": {"name": "bench", "namespace": "default"},
        "spec": {
            "replicas": 2,
            "ports": ports,
            "debugSettings": {"enabled": true},
            "infrastructure": {
                "networkID": "net-1",
                "floatingNetID": "ext-net",
                "authSecretRef": {"name": "cloud-credentials"}
            },
            "options": {"loadBalancerSourceRanges": ranges}
        },
        "status": {"securityGroupID": "sg-1", "portID": "port-1"}
    }))
    .expect("benchmark fixture")
}

fn bench_desired_rules(c: &mut Criterion) {
    let mut group = c.benchmark_group("desired_rules");

    for (ports, ranges) in [(1, 0), (8, 4), (32, 16)] {
        let lb = load_balancer(ports, ranges);
        group.throughput(Throughput::Elements(ports as u64));
        group.bench_with_input(
            BenchmarkId::new("ports_x_ranges", format!("{}x{}", ports, ranges)),
            &lb,
            |b, lb| b.iter(|| desired_rules(black_box(lb), "sg-1")),
        );
    }

    group.finish();
}

fn bench_hashes(c: &mut Criterion) {
    let mut group = c.benchmark_group("hashes");
    let lb = load_balancer(8, 4);

    group.bench_function("reconcile_hash", |b| {
        b.iter(|| reconcile_hash(black_box(&lb)));
    });

    group.bench_function("machine_spec_hash", |b| {
        b.iter(|| machine_spec_hash(&machine_spec(black_box(&lb))));
    });

    group.finish();
}

criterion_group!(benches, bench_desired_rules, bench_hashes);
criterion_main!(benches);
