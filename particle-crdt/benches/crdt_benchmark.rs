use criterion::{black_box, criterion_group, criterion_main, Criterion};
use particle_crdt::{CountOp, CrdtCount, CrdtModel, CrdtSet, FieldValue, SetOp, VersionMap};

fn populated_set(actor: &str, n: i64) -> CrdtSet<FieldValue> {
    let mut set = CrdtSet::new();
    let mut clock = VersionMap::new();
    for i in 0..n {
        clock.increment(actor);
        set.apply_operation(&SetOp::Add { actor: actor.into(), clock: clock.clone(), added: FieldValue::Number(i) })
            .unwrap();
    }
    set
}

fn bench_count_apply(c: &mut Criterion) {
    c.bench_function("count_apply_1k", |b| {
        b.iter(|| {
            let mut count = CrdtCount::new();
            for v in 0..1000 {
                count.apply_operation(black_box(&CountOp::increment("me", v))).unwrap();
            }
            black_box(count.consumer_view());
        })
    });
}

fn bench_set_merge(c: &mut Criterion) {
    let left = populated_set("me", 500);
    let right = populated_set("them", 500);

    c.bench_function("set_merge_500x500", |b| {
        b.iter(|| {
            let mut merged = left.clone();
            black_box(merged.merge(black_box(right.data())));
        })
    });
}

fn bench_set_encode(c: &mut Criterion) {
    let set = populated_set("me", 500);
    let data = set.data();

    c.bench_function("set_encode_500", |b| {
        b.iter(|| {
            black_box(bincode::serde::encode_to_vec(black_box(&data), bincode::config::standard()).unwrap());
        })
    });
}

criterion_group!(benches, bench_count_apply, bench_set_merge, bench_set_encode);
criterion_main!(benches);
