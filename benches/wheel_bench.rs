use criterion::{black_box, criterion_group, criterion_main, Criterion};
use evloop::wheel::TimerWheel;

fn insert_and_drain(n: u64) {
    let mut wheel = TimerWheel::new();
    for i in 0..n {
        black_box(wheel.insert(i, i % 1000));
    }
    let due = wheel.pop_due(u64::MAX);
    black_box(due);
}

fn bench_wheel(c: &mut Criterion) {
    let mut group = c.benchmark_group("timer_wheel");
    for &n in &[100u64, 1_000, 10_000] {
        group.bench_function(format!("insert_and_drain/{n}"), |b| {
            b.iter(|| insert_and_drain(n));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_wheel);
criterion_main!(benches);
