use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use overlap_server::BufferPool;
use std::{
    hint::black_box,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

const BUFFER_SIZE: usize = 64 * 1024; // 64 KB

fn bench_acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool");
    for capacity in [2, 16, 256] {
        let pool = BufferPool::new(capacity, BUFFER_SIZE);
        group.bench_with_input(
            BenchmarkId::new("acquire_release", capacity),
            &pool,
            |b, pool| {
                b.iter(|| {
                    let buffer = pool.acquire(Duration::from_secs(1)).unwrap();
                    pool.release(black_box(buffer));
                });
            },
        );
    }
    group.finish();
}

fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool");
    for threads in [2, 4, 8] {
        group.bench_function(BenchmarkId::new("contended", threads), |b| {
            b.iter_custom(|iters| {
                // Fewer buffers than threads, so acquires regularly wait
                let pool = Arc::new(BufferPool::new(threads / 2, BUFFER_SIZE));
                let start = Instant::now();
                let workers = (0..threads)
                    .map(|_| {
                        let pool = pool.clone();
                        thread::spawn(move || {
                            for _ in 0..iters {
                                let mut buffer = pool.acquire(Duration::from_secs(10)).unwrap();
                                buffer.prepare_for_write();
                                buffer.write(black_box(&[0xAB; 64]));
                                pool.release(buffer);
                            }
                        })
                    })
                    .collect::<Vec<_>>();
                for worker in workers {
                    worker.join().unwrap();
                }
                start.elapsed()
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_acquire_release, bench_contended);
criterion_main!(benches);
