use criterion::{Criterion, black_box, criterion_group, criterion_main};

use scooch::{Context, default_callbacks};

/// Allocate a mixed batch, free every other handle, then refill through the
/// holes.  The refill pressure is what drives the compactor.
fn alloc_free_churn(c: &mut Criterion) {
    c.bench_function("alloc_free_churn", |b| {
        let mut buf = vec![0u8; 64 * 1024];
        b.iter(|| {
            let mut ctx = Context::new(&mut buf);
            let mut handles = Vec::with_capacity(64);
            for i in 0..64usize {
                let h = ctx
                    .try_alloc_ex(128 + (i % 7) * 32, "churn", default_callbacks())
                    .unwrap();
                handles.push(h);
            }
            for h in handles.iter().step_by(2) {
                ctx.free(*h);
            }
            for _ in 0..16 {
                let h = ctx.try_alloc(256).unwrap();
                black_box(ctx.get_data(h));
            }
        });
    });
}

fn handle_lookup(c: &mut Criterion) {
    c.bench_function("get_data", |b| {
        let mut buf = vec![0u8; 16 * 1024];
        let mut ctx = Context::new(&mut buf);
        let handles: Vec<_> = (0..32).map(|_| ctx.try_alloc(64).unwrap()).collect();
        b.iter(|| {
            for &h in &handles {
                black_box(ctx.get_data(h));
            }
        });
    });
}

criterion_group!(benches, alloc_free_churn, handle_lookup);
criterion_main!(benches);
