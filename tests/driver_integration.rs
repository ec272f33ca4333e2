use benchkit::config::BenchTime;
use benchkit::report::action_log::{read_events, Action};
use benchkit::report::{ResultsStorage, SharedBuffer};
use benchkit::{Config, Driver, InternalBenchmark};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

fn quick(config: Config) -> Config {
    config.with_benchtime(BenchTime::Count(3)).with_cpu_list(vec![1])
}

fn spin(name: &str) -> InternalBenchmark {
    InternalBenchmark::new(name, |b| {
        b.iter(|| (0..64u32).sum::<u32>());
    })
}

fn run(config: Config, benchmarks: Vec<InternalBenchmark>) -> (i32, String) {
    let buffer = SharedBuffer::default();
    let mut driver = Driver::new(config, benchmarks).with_output(buffer.clone());
    let code = driver.run();
    (code, buffer.contents())
}

#[test]
fn test_failfast_stops_after_first_failure() {
    let later = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&later);
    let benchmarks = vec![
        InternalBenchmark::new("BenchmarkFirst", |b| b.error("first failed")),
        InternalBenchmark::new("BenchmarkSecond", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }),
    ];
    let (code, out) = run(quick(Config::new()).with_failfast(true).with_count(3), benchmarks);
    assert_eq!(code, 1);
    assert_eq!(later.load(Ordering::SeqCst), 0, "{out}");
    assert_eq!(out.matches("--- FAIL: BenchmarkFirst").count(), 1, "{out}");
    assert!(out.ends_with("FAIL\n"));
}

#[test]
fn test_without_failfast_every_round_runs() {
    let later = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&later);
    let benchmarks = vec![
        InternalBenchmark::new("BenchmarkFirst", |b| b.error("first failed")),
        InternalBenchmark::new("BenchmarkSecond", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }),
    ];
    let (code, _) = run(quick(Config::new()).with_count(2), benchmarks);
    assert_eq!(code, 1);
    // One sizing run plus one measured run per round.
    assert_eq!(later.load(Ordering::SeqCst), 4);
}

#[test]
fn test_sub_benchmark_pattern_levels() {
    let benchmarks = vec![InternalBenchmark::new("BenchmarkCodec", |b| {
        for codec in ["json", "toml"] {
            b.run(codec, |b| b.iter(|| codec.len()));
        }
    })];
    let (code, out) = run(quick(Config::new()).with_bench("Codec/toml"), benchmarks);
    assert_eq!(code, 0);
    assert!(out.contains("BenchmarkCodec/toml"), "{out}");
    assert!(!out.contains("BenchmarkCodec/json"), "{out}");
}

#[test]
fn test_verbose_bench_output() {
    let benchmarks = vec![InternalBenchmark::new("BenchmarkChatty", |b| {
        b.log("hello from the body");
        b.iter(|| 1u8);
    })];
    let (code, out) = run(quick(Config::new()).with_verbose(true), benchmarks);
    assert_eq!(code, 0);
    assert!(out.starts_with("goos: "), "{out}");
    assert!(out.contains("\nBenchmarkChatty\n"), "{out}");
    assert!(out.contains(": hello from the body\n"), "{out}");
    assert!(out.ends_with("PASS\n"), "{out}");
}

#[test]
fn test_skipped_benchmark_passes() {
    let benchmarks = vec![InternalBenchmark::new("BenchmarkNotHere", |b| {
        b.skip("needs hardware");
    })];
    let (code, out) = run(quick(Config::new()).with_verbose(true), benchmarks);
    assert_eq!(code, 0);
    assert!(out.contains("--- SKIP: BenchmarkNotHere\n"), "{out}");
}

#[test]
fn test_action_log_created_then_appended() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("events.jsonl");
    let mut config = quick(Config::new());
    config.test_log_file = Some(log.clone());

    let buffer = SharedBuffer::default();
    let mut driver = Driver::new(config, vec![spin("BenchmarkLogged")]).with_output(buffer);
    assert_eq!(driver.run(), 0);
    let first = read_events(&log).unwrap();
    assert!(first.iter().any(|e| e.action == Action::Run && e.name == "BenchmarkLogged"));
    assert!(first.iter().any(|e| e.action == Action::Bench));
    assert!(first.iter().any(|e| e.action == Action::Pass));

    assert_eq!(driver.run(), 0);
    let both = read_events(&log).unwrap();
    assert_eq!(both.len(), first.len() * 2);
}

#[test]
fn test_action_log_in_missing_directory_exits_two() {
    let dir = TempDir::new().unwrap();
    let mut config = quick(Config::new());
    config.test_log_file = Some(dir.path().join("missing").join("events.jsonl"));
    let (code, _) = run(config, vec![spin("BenchmarkA")]);
    assert_eq!(code, 2);
}

#[test]
fn test_profiles_written_into_output_dir() {
    let dir = TempDir::new().unwrap();
    let mut config = quick(Config::new());
    config.output_dir = Some(dir.path().to_path_buf());
    config.cpu_profile = Some("cpu.out".into());
    config.mem_profile = Some("mem.out".into());
    config.trace = Some("trace.out".into());

    let (code, _) = run(config, vec![spin("BenchmarkA")]);
    assert_eq!(code, 0);
    assert!(dir.path().join("cpu.out").is_file());
    assert!(dir.path().join("mem.out").is_file());
    // Tracing cannot start; that is only a warning.
    assert!(!dir.path().join("trace.out").exists());
}

#[test]
fn test_unwritable_profile_exits_two_after_reporting() {
    let dir = TempDir::new().unwrap();
    let mut config = quick(Config::new());
    config.cpu_profile = Some(dir.path().join("no-such-dir").join("cpu.out"));
    let (code, out) = run(config, vec![spin("BenchmarkA")]);
    assert_eq!(code, 2);
    assert!(out.ends_with("PASS\n"), "{out}");
}

#[test]
fn test_coverprofile_unsupported() {
    let mut config = quick(Config::new());
    config.cover_profile = Some("cover.out".into());
    let (code, _) = run(config, vec![spin("BenchmarkA")]);
    assert_eq!(code, 2);
}

#[test]
fn test_invalid_bench_pattern_exits_one() {
    let (code, _) = run(quick(Config::new()).with_bench("a/("), vec![spin("BenchmarkA")]);
    assert_eq!(code, 1);
}

#[test]
fn test_results_exported_as_json() {
    let dir = TempDir::new().unwrap();
    let mut config = quick(Config::new());
    config.json_output = Some(dir.path().join("results.json"));
    let benchmarks = vec![spin("BenchmarkA"), spin("BenchmarkB")];
    let (code, _) = run(config, benchmarks);
    assert_eq!(code, 0);

    let saved = ResultsStorage::new(dir.path().join("results.json")).load().unwrap();
    let names: Vec<&str> = saved.results.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["BenchmarkA", "BenchmarkB"]);
    assert!(saved.results.iter().all(|r| r.result.n == 3));
}

#[test]
fn test_from_args_round_trip() {
    let config = Config::from_args([
        "benchkit",
        "--bench",
        "Sort",
        "--benchtime",
        "5x",
        "--cpu",
        "1,2",
        "--benchmem",
    ])
    .unwrap();
    assert_eq!(config.bench, "Sort");
    assert_eq!(config.benchtime, BenchTime::Count(5));
    assert_eq!(config.cpu_list, vec![1, 2]);
    assert!(config.benchmem);
}
