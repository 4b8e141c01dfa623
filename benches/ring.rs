use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ferrule::ring::HashRing;
use smol_str::SmolStr;

fn bench_ring_lookup(c: &mut Criterion) {
    let ring = HashRing::ketama();
    let nodes: Vec<SmolStr> = (0..50).map(|i| SmolStr::new(format!("node{i}"))).collect();
    let spots: Vec<u32> = vec![1; 50];
    ring.init(&nodes, &spots);

    let mut group = c.benchmark_group("ring");
    group.bench_function("get_node_1k_keys", |b| {
        b.iter(|| {
            for i in 0..1000 {
                let key = format!("key-{i}");
                black_box(ring.get_node(key.as_bytes()));
            }
        });
    });
    group.finish();
}

fn bench_ring_init(c: &mut Criterion) {
    let nodes: Vec<SmolStr> = (0..200).map(|i| SmolStr::new(format!("node{i}"))).collect();
    let spots: Vec<u32> = vec![1; 200];

    let mut group = c.benchmark_group("ring");
    group.bench_function("init_200_nodes", |b| {
        let ring = HashRing::ketama();
        b.iter(|| {
            ring.init(&nodes, &spots);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_ring_lookup, bench_ring_init);
criterion_main!(benches);
