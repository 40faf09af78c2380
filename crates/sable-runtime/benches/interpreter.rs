//! Interpreter throughput benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sable_runtime::{Options, Sable};

fn bench_fib(c: &mut Criterion) {
    let source = "fun f(n) { if n < 2 { return n } return f(n-1) + f(n-2) }\nprint f(15)";

    c.bench_function("fib_15_optimized", |b| {
        b.iter(|| {
            let mut sable = Sable::with_options(Options::default());
            let _ = sable.capture_output();
            black_box(sable.eval("bench.sbl", source)).unwrap();
        })
    });

    c.bench_function("fib_15_unoptimized", |b| {
        b.iter(|| {
            let mut sable = Sable::with_options(Options {
                optimize: false,
                ..Options::default()
            });
            let _ = sable.capture_output();
            black_box(sable.eval("bench.sbl", source)).unwrap();
        })
    });
}

fn bench_tail_recursion(c: &mut Criterion) {
    let source = "fun cd(n) { if n == 0 { return 0 } return cd(n-1) }\nprint cd(50000)";

    c.bench_function("countdown_50k_tailcall", |b| {
        b.iter(|| {
            let mut sable = Sable::with_options(Options::default());
            let _ = sable.capture_output();
            black_box(sable.eval("bench.sbl", source)).unwrap();
        })
    });
}

criterion_group!(benches, bench_fib, bench_tail_recursion);
criterion_main!(benches);
