use benchkit::alloc::CountingAllocator;
use benchkit::timer::bench;
use benchkit::{Driver, InternalBenchmark, B};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static ALLOCATOR: CountingAllocator = CountingAllocator;

fn random_vec(len: usize, seed: u64) -> Vec<u64> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

fn sort(b: &B) {
    for size in [100usize, 10_000] {
        b.run(&format!("size={}", size), move |b| {
            let input = random_vec(size, 42);
            b.set_bytes((size * std::mem::size_of::<u64>()) as i64);
            b.reset_timer();
            for _ in 0..b.n() {
                b.stop_timer();
                let mut data = input.clone();
                b.start_timer();
                data.sort_unstable();
            }
        });
    }
}

fn map_insert(b: &B) {
    b.report_allocs();
    b.iter(|| {
        let mut map = HashMap::with_capacity(16);
        for i in 0..16u32 {
            map.insert(i, i * 2);
        }
        map
    });
}

fn shared_counter(b: &B) {
    let counter = AtomicU64::new(0);
    b.run_parallel(|pb| {
        while pb.next() {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    });
}

fn temp_file_write(b: &B) {
    let dir = b.temp_dir();
    let payload = vec![0xA5u8; 4096];
    b.set_bytes(payload.len() as i64);
    b.reset_timer();
    for i in 0..b.n() {
        let path = dir.join(format!("chunk-{}", i % 8));
        if let Err(e) = fs::write(&path, &payload) {
            b.fatalf(format_args!("write {}: {}", path.display(), e));
        }
    }
}

fn jittery_op(b: &B) {
    // Steady-state latency of a jittery operation, measured adaptively.
    b.stop_timer();
    let mut rng = SmallRng::from_entropy();
    let measured = bench(10, || {
        let spins = rng.gen_range(900..1100u32);
        std::hint::black_box((0..spins).fold(0u32, |acc, x| acc.wrapping_add(x)));
        Ok::<(), std::io::Error>(())
    });
    match measured {
        Ok(m) => b.report_metric(m.speed.as_nanos() as f64, "adaptive-ns/op"),
        Err(e) => match e.estimate().copied() {
            Some(estimate) => b.report_metric(estimate.speed.as_nanos() as f64, "adaptive-ns/op"),
            None => b.fatal(e),
        },
    }
    b.start_timer();

    for _ in 0..b.n() {
        std::hint::black_box((0..1000u32).fold(0u32, |acc, x| acc.wrapping_add(x)));
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("benchkit=warn")),
        )
        .init();

    let benchmarks = vec![
        InternalBenchmark::new("BenchmarkSort", sort),
        InternalBenchmark::new("BenchmarkMapInsert", map_insert),
        InternalBenchmark::new("BenchmarkSharedCounter", shared_counter),
        InternalBenchmark::new("BenchmarkTempFileWrite", temp_file_write),
        InternalBenchmark::new("BenchmarkJitteryOp", jittery_op),
    ];
    Driver::main_with(benchmarks, env!("CARGO_PKG_NAME"))
}
