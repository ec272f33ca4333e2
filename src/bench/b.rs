//! The benchmark unit
//!
//! A `B` is a unit whose body is run repeatedly: once with `n == 1` to see
//! whether it has sub-benchmarks, then with a growing iteration count until
//! the configured benchmark time is reached. The body times itself between
//! `start_timer` and `stop_timer` (both implicit around each run).

use crate::alloc::{self, AllocStats};
use crate::config::BenchTime;
use crate::models::result::{benchmark_name, BenchmarkResult};
use crate::report::action_log::Action;
use crate::report::chatty::ChattyPrinter;
use crate::report::export::NamedResult;
use crate::unit::group::{set_holds_slot, yield_slot};
use crate::unit::{frames, Frame, RunContext, Unit, TB};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::panic::{self, Location};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Largest iteration count a duration-based run grows to
pub const MAX_N: u64 = 1_000_000_000;

/// Lines of benchmark output kept before truncating
const MAX_OUTPUT_LINES: usize = 10;

/// A registered benchmark body
pub type BenchFn = dyn Fn(&B) + Send + Sync;

/// Settings shared by every benchmark of a run
#[derive(Debug)]
pub struct BenchSettings {
    pub(crate) benchtime: BenchTime,
    pub(crate) benchmem: bool,
    pub(crate) short: bool,
    pub(crate) import_path: String,
    max_len: AtomicUsize,
    ext_len: usize,
    labels: Once,
    results: Mutex<Vec<NamedResult>>,
}

impl Default for BenchSettings {
    fn default() -> Self {
        Self::new(BenchTime::default(), false, false, String::new())
    }
}

impl BenchSettings {
    pub fn new(benchtime: BenchTime, benchmem: bool, short: bool, import_path: String) -> Self {
        Self {
            benchtime,
            benchmem,
            short,
            import_path,
            max_len: AtomicUsize::new(0),
            ext_len: 0,
            labels: Once::new(),
            results: Mutex::new(Vec::new()),
        }
    }

    /// Pad result names to fit `names` run with the largest of `cpu_list`
    pub fn with_names<'a>(
        mut self,
        names: impl IntoIterator<Item = &'a str>,
        cpu_list: &[usize],
    ) -> Self {
        let max_procs = cpu_list.iter().copied().max().unwrap_or(1);
        self.ext_len = benchmark_name("", max_procs).len();
        let ext_len = self.ext_len;
        let longest = names
            .into_iter()
            .map(|name| benchmark_name(name, max_procs).len() + ext_len + 1)
            .max()
            .unwrap_or(0);
        self.max_len = AtomicUsize::new(longest);
        self
    }

    pub fn max_len(&self) -> usize {
        self.max_len.load(Ordering::Relaxed)
    }

    fn extend_max_len(&self, name_len: usize) {
        let needed = name_len + self.ext_len + 1;
        let _ = self
            .max_len
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                (needed > current).then_some(needed + 8)
            });
    }

    fn print_labels(&self, printer: &ChattyPrinter) {
        self.labels.call_once(|| {
            let mut labels = format!(
                "goos: {}\ngoarch: {}\n",
                std::env::consts::OS,
                std::env::consts::ARCH
            );
            if !self.import_path.is_empty() {
                labels.push_str(&format!("pkg: {}\n", self.import_path));
            }
            printer.write_raw(&labels);
        });
    }

    fn push_result(&self, result: NamedResult) {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(result);
    }

    /// Results of every benchmark processed so far
    pub fn take_results(&self) -> Vec<NamedResult> {
        std::mem::take(&mut *self.results.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[derive(Debug, Default)]
struct Timing {
    n: u64,
    timer_on: bool,
    start: Option<Instant>,
    duration: Duration,
    start_allocs: AllocStats,
    net_allocs: AllocStats,
    bytes: i64,
    show_alloc: bool,
    extra: BTreeMap<String, f64>,
    previous_n: u64,
    previous_duration: Duration,
}

#[derive(Debug, Default)]
struct Outcome {
    result: BenchmarkResult,
    missing_bytes: bool,
}

/// Handle passed to benchmark bodies
pub struct B {
    unit: Unit,
    settings: Arc<BenchSettings>,
    procs: usize,
    timing: Mutex<Timing>,
    has_sub: AtomicBool,
    parallelism: AtomicUsize,
    outcome: Mutex<Outcome>,
}

impl fmt::Debug for B {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("B")
            .field("name", &self.unit.name())
            .field("procs", &self.procs)
            .finish_non_exhaustive()
    }
}

impl Deref for B {
    type Target = Unit;

    fn deref(&self) -> &Unit {
        &self.unit
    }
}

impl B {
    pub(crate) fn new(unit: Unit, settings: Arc<BenchSettings>, procs: usize) -> Self {
        Self {
            unit,
            settings,
            procs: procs.max(1),
            timing: Mutex::new(Timing::default()),
            has_sub: AtomicBool::new(false),
            parallelism: AtomicUsize::new(1),
            outcome: Mutex::new(Outcome::default()),
        }
    }

    fn timing(&self) -> MutexGuard<'_, Timing> {
        self.timing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outcome(&self) -> MutexGuard<'_, Outcome> {
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of iterations the body must run
    pub fn n(&self) -> u64 {
        self.timing().n
    }

    /// Worker count this run was started with
    pub fn procs(&self) -> usize {
        self.procs
    }

    /// Whether long-running benchmarks were asked to shorten their run
    pub fn short(&self) -> bool {
        self.settings.short
    }

    /// Start timing. Called automatically before the body runs.
    pub fn start_timer(&self) {
        let mut t = self.timing();
        if !t.timer_on {
            t.start_allocs = alloc::snapshot();
            t.start = Some(Instant::now());
            t.timer_on = true;
        }
    }

    /// Stop timing, e.g. around expensive setup that should not be measured
    pub fn stop_timer(&self) {
        let mut t = self.timing();
        if t.timer_on {
            if let Some(start) = t.start {
                t.duration += start.elapsed();
            }
            let delta = alloc::snapshot().since(&t.start_allocs);
            t.net_allocs.count += delta.count;
            t.net_allocs.bytes += delta.bytes;
            t.timer_on = false;
        }
    }

    /// Zero the elapsed time, allocation counters and custom metrics
    pub fn reset_timer(&self) {
        let mut t = self.timing();
        if t.timer_on {
            t.start_allocs = alloc::snapshot();
            t.start = Some(Instant::now());
        }
        t.duration = Duration::ZERO;
        t.net_allocs = AllocStats::default();
        t.extra.clear();
    }

    /// Record the number of bytes processed in one iteration
    pub fn set_bytes(&self, n: i64) {
        self.timing().bytes = n;
    }

    /// Report allocation metrics for this benchmark even without `--benchmem`
    pub fn report_allocs(&self) {
        self.timing().show_alloc = true;
    }

    /// Add a custom metric reported alongside the built-in ones. A metric
    /// named after a built-in one replaces it.
    #[track_caller]
    pub fn report_metric(&self, n: f64, unit: &str) {
        if unit.is_empty() || unit.chars().any(char::is_whitespace) {
            self.unit
                .errorf(format_args!("report_metric: invalid metric unit {:?}", unit));
            return;
        }
        self.timing().extra.insert(unit.to_string(), n);
    }

    /// Measured time so far in the current run
    pub fn elapsed(&self) -> Duration {
        let t = self.timing();
        match (t.timer_on, t.start) {
            (true, Some(start)) => t.duration + start.elapsed(),
            _ => t.duration,
        }
    }

    /// Run `f` `n()` times, keeping its result observable
    pub fn iter<T>(&self, mut f: impl FnMut() -> T) {
        for _ in 0..self.n() {
            std::hint::black_box(f());
        }
    }

    /// Multiply the worker count of `run_parallel` by `p`
    pub fn set_parallelism(&self, p: usize) {
        if p > 0 {
            self.parallelism.store(p, Ordering::Relaxed);
        }
    }

    /// Result of the last completed run, or the aggregate of the
    /// sub-benchmarks
    pub fn result(&self) -> BenchmarkResult {
        self.outcome().result.clone()
    }

    /// Run the body once with `n` iterations, then its cleanup chain
    pub(crate) fn run_n(&self, n: u64, body: &(dyn Fn(&B) + Sync)) {
        self.timing().n = n;
        self.parallelism.store(1, Ordering::Relaxed);
        self.reset_timer();
        self.start_timer();
        self.unit.run_guarded(|| body(self));
        self.stop_timer();
        {
            let mut t = self.timing();
            t.previous_n = n;
            t.previous_duration = t.duration;
        }
        self.unit.finish_cleanup();
    }

    /// Probe run with `n == 1`. Returns true if the benchmark should go on
    /// to be measured.
    fn run1(&self, body: &(dyn Fn(&B) + Sync)) -> bool {
        self.settings.extend_max_len(self.name().len());
        self.run_n(1, body);

        let context = self.context();
        if self.failed() {
            let output = self.take_output();
            context
                .printer()
                .write_raw(&format!("--- FAIL: {}\n{}", self.name(), output));
            return false;
        }
        let finished = self.finished();
        if self.has_sub.load(Ordering::SeqCst) || finished {
            let tag = if self.skipped() { "SKIP" } else { "BENCH" };
            let output = self.take_output();
            if context.chatty() && (!output.is_empty() || finished) {
                context.printer().write_raw(&format!(
                    "--- {}: {}\n{}",
                    tag,
                    self.name(),
                    trim_output(&output)
                ));
            }
            return false;
        }
        true
    }

    /// Grow `n` until the run reaches the benchmark time, then record the
    /// result
    fn launch(&self, body: &(dyn Fn(&B) + Sync)) {
        match self.settings.benchtime {
            BenchTime::Count(n) => {
                // run1 already did a single iteration.
                if n > 1 {
                    self.run_n(n, body);
                }
            }
            BenchTime::Duration(goal) => {
                let mut n = 1;
                while !self.failed() && n < MAX_N {
                    let (prev_iters, prev_duration) = {
                        let t = self.timing();
                        (t.n, t.duration)
                    };
                    if prev_duration >= goal {
                        break;
                    }
                    let last = n;
                    n = predict_n(goal.as_nanos(), prev_iters, prev_duration.as_nanos(), last);
                    self.run_n(n, body);
                }
            }
        }

        let t = self.timing();
        self.outcome().result = BenchmarkResult {
            n: t.n,
            t: t.duration,
            bytes: t.bytes,
            mem_allocs: t.net_allocs.count,
            mem_bytes: t.net_allocs.bytes,
            extra: t.extra.clone(),
        };
    }

    /// Measure and print one result line
    fn process(&self, body: &(dyn Fn(&B) + Sync)) {
        self.launch(body);

        let context = self.context();
        let printer = context.printer();
        let bench_name = benchmark_name(self.name(), self.procs);
        if self.failed() {
            let output = self.take_output();
            printer.write_raw(&format!("--- FAIL: {}\n{}", bench_name, output));
            return;
        }

        self.settings.print_labels(printer);
        let result = self.result();
        let mut line = format!(
            "{:<width$}\t{}",
            bench_name,
            result,
            width = self.settings.max_len()
        );
        if self.settings.benchmem || self.timing().show_alloc {
            line.push('\t');
            line.push_str(&result.mem_string());
        }
        line.push('\n');
        self.unit.record_action(Action::Bench, &line);

        let output = self.take_output();
        if !output.is_empty() {
            line.push_str(&format!(
                "--- BENCH: {}\n{}",
                bench_name,
                trim_output(&output)
            ));
        }
        printer.write_raw(&line);

        self.settings.push_result(NamedResult {
            name: self.name().to_string(),
            procs: self.procs,
            result,
        });
    }

    /// Fold a sub-benchmark result into this one, as if the sub-benchmarks
    /// had run in sequence inside a single benchmark
    fn add(&self, other: &BenchmarkResult) {
        let mut outcome = self.outcome();
        let Outcome {
            result,
            missing_bytes,
        } = &mut *outcome;
        result.n = 1;
        result.t += Duration::from_nanos(other.ns_per_op().max(0) as u64);
        if other.bytes == 0 {
            // Summed bytes only mean something if every sub-benchmark set them.
            *missing_bytes = true;
            result.bytes = 0;
        }
        if !*missing_bytes {
            result.bytes += other.bytes;
        }
        result.mem_allocs += other.allocs_per_op().max(0) as u64;
        result.mem_bytes += other.alloced_bytes_per_op().max(0) as u64;
    }

    /// Run `body` as a sub-benchmark named `name`. Returns false if it
    /// failed. This benchmark is no longer measured itself.
    #[track_caller]
    pub fn run<F>(&self, name: &str, body: F) -> bool
    where
        F: Fn(&B) + Sync,
    {
        let creator = frames::capture(Location::caller());
        match self.start_sub(name, creator) {
            Some(sub) => self.finish_sub(sub, &body),
            None => true,
        }
    }

    fn start_sub(&self, name: &str, creator: Vec<Frame>) -> Option<B> {
        self.has_sub.store(true, Ordering::SeqCst);
        let parent_name = (self.level() > 0).then(|| self.name());
        let (full_name, matched, partial) =
            self.context().matcher().full_name(parent_name, name);
        if !matched {
            return None;
        }

        let sub = B::new(
            self.unit.spawn_child(full_name, true, creator),
            Arc::clone(&self.settings),
            self.procs,
        );
        if partial {
            // Only some of its sub-benchmarks match, so it is not measured itself.
            sub.has_sub.store(true, Ordering::SeqCst);
        }
        let context = self.context();
        if context.chatty() {
            self.settings.print_labels(context.printer());
            context.printer().write_raw(&format!("{}\n", sub.name()));
        }
        Some(sub)
    }

    fn finish_sub(&self, sub: B, body: &(dyn Fn(&B) + Sync)) -> bool {
        if sub.run1(body) {
            sub.process(body);
        }
        self.add(&sub.result());
        let action = if sub.failed() {
            Action::Fail
        } else if sub.skipped() {
            Action::Skip
        } else {
            Action::Pass
        };
        sub.mark_done();
        sub.unit.record_action(action, "");
        !sub.failed()
    }

    /// Run the sub-benchmarks started through `f` concurrently, bounded by
    /// the parallel limit. Returns false if this benchmark has failed.
    pub fn group<'env, F>(&'env self, f: F) -> bool
    where
        F: for<'scope> FnOnce(&BenchGroup<'scope, 'env>),
    {
        yield_slot(&self.unit, || {
            thread::scope(|scope| {
                f(&BenchGroup {
                    parent: self,
                    scope,
                })
            })
        });
        !self.failed()
    }

    /// Run `body` on `parallelism * procs` worker threads sharing `n()`
    /// iterations between them through `PB::next`
    pub fn run_parallel<F>(&self, body: F)
    where
        F: Fn(&mut PB<'_>) + Sync,
    {
        let (bn, previous_n, previous_duration) = {
            let t = self.timing();
            (t.n, t.previous_n, t.previous_duration)
        };
        if bn == 0 {
            return;
        }

        // Each worker claims about 100µs worth of iterations at a time, and
        // no more than 1e4 at once.
        let mut grain = 0u64;
        if previous_n > 0 && !previous_duration.is_zero() {
            let per = 100_000u128 * u128::from(previous_n) / previous_duration.as_nanos();
            grain = u64::try_from(per).unwrap_or(u64::MAX);
        }
        let grain = grain.clamp(1, 10_000);

        let counter = AtomicU64::new(0);
        let workers = self.parallelism.load(Ordering::Relaxed) * self.procs;
        let mut first_panic = None;
        thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    let (counter, body) = (&counter, &body);
                    scope.spawn(move || {
                        let mut pb = PB {
                            global: counter,
                            grain,
                            cache: 0,
                            limit: bn,
                        };
                        body(&mut pb);
                    })
                })
                .collect();
            for handle in handles {
                if let Err(payload) = handle.join() {
                    first_panic.get_or_insert(payload);
                }
            }
        });
        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }

        if counter.load(Ordering::SeqCst) <= bn && !self.failed() {
            self.unit
                .fatal("run_parallel: body exited without pb.next() == false");
        }
    }
}

impl TB for B {
    fn name(&self) -> &str {
        self.unit.name()
    }
    fn fail(&self) {
        self.unit.fail()
    }
    fn fail_now(&self) -> ! {
        self.unit.fail_now()
    }
    fn failed(&self) -> bool {
        self.unit.failed()
    }
    fn log(&self, message: &str) {
        self.unit.log(message)
    }
    fn error(&self, message: &str) {
        self.unit.error(message)
    }
    fn fatal(&self, message: &str) -> ! {
        self.unit.fatal(message)
    }
    fn skip(&self, message: &str) -> ! {
        self.unit.skip(message)
    }
    fn skip_now(&self) -> ! {
        self.unit.skip_now()
    }
    fn skipped(&self) -> bool {
        self.unit.skipped()
    }
    fn helper(&self) {
        self.unit.helper()
    }
    fn cleanup(&self, action: Box<dyn FnOnce() + Send + 'static>) {
        self.unit.cleanup(action)
    }
    fn temp_dir(&self) -> PathBuf {
        self.unit.temp_dir()
    }
}

/// Handle for starting concurrent sub-benchmarks inside `B::group`
pub struct BenchGroup<'scope, 'env: 'scope> {
    parent: &'env B,
    scope: &'scope thread::Scope<'scope, 'env>,
}

impl<'scope, 'env> BenchGroup<'scope, 'env> {
    /// Start `body` as a sub-benchmark named `name` on its own thread
    #[track_caller]
    pub fn run<F>(&self, name: &str, body: F)
    where
        F: Fn(&B) + Send + Sync + 'scope,
    {
        let creator = frames::capture(Location::caller());
        let Some(sub) = self.parent.start_sub(name, creator) else {
            return;
        };
        let parent = self.parent;
        self.scope.spawn(move || {
            let context: Arc<RunContext> = Arc::clone(sub.context());
            let _slot = context.acquire();
            set_holds_slot(true);
            parent.finish_sub(sub, &body);
            set_holds_slot(false);
        });
    }
}

/// Iteration source for one `run_parallel` worker
#[derive(Debug)]
pub struct PB<'a> {
    global: &'a AtomicU64,
    grain: u64,
    cache: u64,
    limit: u64,
}

impl PB<'_> {
    /// Whether there are more iterations to run
    pub fn next(&mut self) -> bool {
        if self.cache == 0 {
            let claimed = self.global.fetch_add(self.grain, Ordering::SeqCst) + self.grain;
            if claimed <= self.limit {
                self.cache = self.grain;
            } else if claimed < self.limit + self.grain {
                self.cache = self.limit + self.grain - claimed;
            } else {
                return false;
            }
        }
        self.cache -= 1;
        true
    }
}

/// Iteration count for the next run, aiming at `goal_ns` from the previous
/// run's rate
pub(crate) fn predict_n(goal_ns: u128, prev_iters: u64, prev_ns: u128, last: u64) -> u64 {
    let prev_ns = prev_ns.max(1);
    let mut n = goal_ns * u128::from(prev_iters) / prev_ns;
    n += n / 5;
    n = n.min(100 * u128::from(last));
    n = n.max(u128::from(last) + 1);
    n.min(u128::from(MAX_N)) as u64
}

/// Cut output after `MAX_OUTPUT_LINES` lines; a benchmark body runs many
/// times and may repeat its output on every run
pub(crate) fn trim_output(output: &str) -> String {
    let mut newlines = 0;
    for (i, byte) in output.bytes().enumerate() {
        if byte == b'\n' {
            newlines += 1;
            if newlines >= MAX_OUTPUT_LINES {
                return format!("{}\n\t... [output truncated]\n", &output[..i]);
            }
        }
    }
    output.to_string()
}

/// Benchmark `body` outside the driver and return its result. Nothing is
/// printed.
pub fn benchmark<F>(body: F) -> BenchmarkResult
where
    F: Fn(&B) + Sync,
{
    let printer = Arc::new(ChattyPrinter::new(std::io::sink()));
    let context = Arc::new(RunContext::new(printer, false, 1));
    let procs = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let b = B::new(
        Unit::bench_root(context, ""),
        Arc::new(BenchSettings::default()),
        procs,
    );
    if b.run1(&body) {
        b.launch(&body);
    }
    b.mark_done();
    b.result()
}
