//! Benchmark driver
//!
//! Process-level orchestration: list mode, profile and action-log setup,
//! running every matched benchmark once per configured worker count and
//! repeat, teardown, and the final exit code.

use super::b::{BenchFn, BenchSettings, B};
use super::matcher::{MatchString, Matcher, RegexMatcher};
use crate::config::{Config, Flags, ProfileRequest};
use crate::profile::{ProcessProfiler, Profiler};
use crate::report::action_log::ActionLog;
use crate::report::chatty::ChattyPrinter;
use crate::report::export::{NamedResult, ResultsFile, ResultsStorage};
use crate::unit::{RunContext, Unit};
use crate::{BenchkitError, Result, EXIT_FAILED, EXIT_PASSED, EXIT_SETUP_FAILURE};
use clap::Parser;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::process;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

/// A benchmark registered with the driver
pub struct InternalBenchmark {
    pub name: String,
    pub f: Box<BenchFn>,
}

impl InternalBenchmark {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&B) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

impl fmt::Debug for InternalBenchmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalBenchmark")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Capabilities the driver consumes
pub struct Deps {
    pub matcher: Arc<dyn MatchString>,
    pub profiler: Box<dyn Profiler>,
    /// Package the benchmarks belong to, printed in the header
    pub import_path: String,
}

impl Default for Deps {
    fn default() -> Self {
        Self {
            matcher: Arc::new(RegexMatcher::new()),
            profiler: Box::new(ProcessProfiler::new()),
            import_path: String::new(),
        }
    }
}

/// Runs a set of benchmarks under one configuration
pub struct Driver {
    config: Config,
    deps: Deps,
    benchmarks: Vec<InternalBenchmark>,
    printer: Arc<ChattyPrinter>,
    num_run: u32,
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("config", &self.config)
            .field("benchmarks", &self.benchmarks)
            .field("num_run", &self.num_run)
            .finish_non_exhaustive()
    }
}

/// Aborts the process if not dropped before the deadline
struct Alarm {
    _stop: mpsc::Sender<()>,
}

impl Alarm {
    fn start(timeout: Duration) -> Self {
        let (stop, stopped) = mpsc::channel::<()>();
        thread::spawn(move || {
            if let Err(mpsc::RecvTimeoutError::Timeout) = stopped.recv_timeout(timeout) {
                eprintln!(
                    "panic: benchmarks timed out after {}",
                    humantime::format_duration(timeout)
                );
                process::exit(EXIT_SETUP_FAILURE);
            }
        });
        Self { _stop: stop }
    }
}

impl Driver {
    pub fn new(config: Config, benchmarks: Vec<InternalBenchmark>) -> Self {
        Self {
            config,
            deps: Deps::default(),
            benchmarks,
            printer: Arc::new(ChattyPrinter::stdout()),
            num_run: 0,
        }
    }

    /// Replace the matching and profiling capabilities
    pub fn with_deps(mut self, deps: Deps) -> Self {
        self.deps = deps;
        self
    }

    /// Write report output to `w` instead of standard output
    pub fn with_output<W: Write + Send + 'static>(mut self, w: W) -> Self {
        self.printer = Arc::new(ChattyPrinter::new(w));
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run everything and return the process exit code: 0 if every
    /// benchmark passed, 1 if any failed, 2 on a setup or teardown failure
    pub fn run(&mut self) -> i32 {
        self.num_run += 1;

        if let Err(e) = self.config.validate() {
            eprintln!("benchkit: {}", e);
            return e.exit_code();
        }
        if let Some(pattern) = self.config.list.clone() {
            return self.list(&pattern);
        }
        if self.config.cover_profile.is_some() {
            eprintln!("benchkit: cannot use --coverprofile because coverage support is not enabled");
            return EXIT_SETUP_FAILURE;
        }
        let matcher = match Matcher::new(&self.config.bench, "--bench", Arc::clone(&self.deps.matcher)) {
            Ok(matcher) => Arc::new(matcher),
            Err(e) => {
                eprintln!("benchkit: {}", e);
                return EXIT_FAILED;
            }
        };

        let (profiles, action_log) = match self.before() {
            Ok(started) => started,
            Err(e) => {
                eprintln!("benchkit: {}", e);
                return e.exit_code();
            }
        };
        let alarm = self.config.timeout.map(Alarm::start);

        let (ok, results) = self.run_benchmarks(matcher, action_log.clone());
        drop(alarm);

        let code = if ok {
            self.printer.write_raw("PASS\n");
            EXIT_PASSED
        } else {
            self.printer.write_raw("FAIL\n");
            EXIT_FAILED
        };

        if let Err(e) = self.after(&profiles, action_log, results) {
            eprintln!("benchkit: {}", e);
            return e.exit_code();
        }
        code
    }

    fn list(&self, pattern: &str) -> i32 {
        if let Err(e) = self.deps.matcher.match_string(pattern, "non-empty") {
            eprintln!("benchkit: invalid regexp in --list ({:?}): {}", pattern, e);
            return EXIT_FAILED;
        }
        for bm in &self.benchmarks {
            if self.deps.matcher.match_string(pattern, &bm.name).unwrap_or(false) {
                self.printer.write_raw(&format!("{}\n", bm.name));
            }
        }
        EXIT_PASSED
    }

    /// Start the requested profiles and open the action log
    fn before(&mut self) -> Result<(Vec<ProfileRequest>, Option<Arc<ActionLog>>)> {
        let mut started = Vec::new();
        for request in self.config.profiles() {
            self.deps.profiler.set_rate(request.kind, request.rate);
            match self.deps.profiler.start(request.kind) {
                Ok(()) => started.push(request),
                Err(e) => tracing::warn!(kind = %request.kind, error = %e, "can't start profile"),
            }
        }

        let action_log = match &self.config.test_log_file {
            // The first run of the process creates the log, later runs append.
            Some(path) => Some(Arc::new(ActionLog::open(path, self.num_run > 1)?)),
            None => None,
        };
        Ok((started, action_log))
    }

    /// Write profiles, close the action log and save results
    fn after(
        &mut self,
        profiles: &[ProfileRequest],
        action_log: Option<Arc<ActionLog>>,
        results: Vec<NamedResult>,
    ) -> Result<()> {
        for request in profiles {
            self.deps.profiler.stop(request.kind)?;
            let mut file = File::create(&request.path).map_err(|e| {
                BenchkitError::ResourceError(format!(
                    "can't create {} profile {}: {}",
                    request.kind,
                    request.path.display(),
                    e
                ))
            })?;
            self.deps
                .profiler
                .write_to(request.kind, &mut file)
                .map_err(|e| {
                    BenchkitError::ResourceError(format!(
                        "can't write {} profile {}: {}",
                        request.kind,
                        request.path.display(),
                        e
                    ))
                })?;
            tracing::debug!(kind = %request.kind, path = %request.path.display(), "profile written");
        }

        if let Some(log) = action_log {
            log.close()?;
        }

        if let Some(path) = &self.config.json_output {
            let storage = ResultsStorage::new(self.config.to_output_dir(path));
            storage.save(&ResultsFile::new(self.deps.import_path.clone(), results))?;
        }
        Ok(())
    }

    fn run_benchmarks(
        &self,
        matcher: Arc<Matcher>,
        action_log: Option<Arc<ActionLog>>,
    ) -> (bool, Vec<NamedResult>) {
        // An empty pattern selects no benchmarks.
        let selected: Vec<&InternalBenchmark> = if self.config.bench.is_empty() {
            Vec::new()
        } else {
            self.benchmarks
                .iter()
                .filter(|bm| matcher.matches_top_level(&bm.name))
                .collect()
        };
        if selected.is_empty() {
            eprintln!("benchkit: warning: no benchmarks to run");
            return (true, Vec::new());
        }

        let settings = Arc::new(
            BenchSettings::new(
                self.config.benchtime,
                self.config.benchmem,
                self.config.short,
                self.deps.import_path.clone(),
            )
            .with_names(selected.iter().map(|bm| bm.name.as_str()), &self.config.cpu_list),
        );

        let failfast = self.config.failfast;
        let mut ok = true;
        'rounds: for &procs in &self.config.cpu_list {
            for round in 0..self.config.count {
                tracing::debug!(procs, round, "benchmark round");
                matcher.reset();
                let mut context = RunContext::new(
                    Arc::clone(&self.printer),
                    self.config.verbose,
                    self.config.parallel,
                )
                .with_matcher(Arc::clone(&matcher));
                if let Some(log) = &action_log {
                    context = context.with_action_log(Arc::clone(log));
                }

                let main = B::new(
                    Unit::bench_root(Arc::new(context), "Main"),
                    Arc::clone(&settings),
                    procs,
                );
                main.run_n(1, &|b: &B| {
                    for bm in &selected {
                        if failfast && b.failed() {
                            break;
                        }
                        b.run(&bm.name, |b| (bm.f)(b));
                    }
                });
                main.mark_done();

                if main.failed() {
                    ok = false;
                    if failfast {
                        break 'rounds;
                    }
                }
            }
        }
        (ok, settings.take_results())
    }

    /// Parse the command line, run `benchmarks` and exit with the result
    pub fn main_with(benchmarks: Vec<InternalBenchmark>, import_path: &str) -> ! {
        let config = match Config::from_flags(Flags::parse()) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("benchkit: {}", e);
                process::exit(e.exit_code());
            }
        };
        let deps = Deps {
            import_path: import_path.to_string(),
            ..Deps::default()
        };
        let code = Driver::new(config, benchmarks).with_deps(deps).run();
        process::exit(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BenchTime;
    use crate::report::SharedBuffer;

    fn driver(config: Config, benchmarks: Vec<InternalBenchmark>) -> (Driver, SharedBuffer) {
        let buffer = SharedBuffer::default();
        let config = config.with_benchtime(BenchTime::Count(2)).with_cpu_list(vec![1]);
        (Driver::new(config, benchmarks).with_output(buffer.clone()), buffer)
    }

    fn noop(name: &str) -> InternalBenchmark {
        InternalBenchmark::new(name, |b| b.iter(|| 1 + 1))
    }

    #[test]
    fn test_all_pass_exits_zero() {
        let (mut d, out) = driver(Config::new(), vec![noop("BenchmarkA"), noop("BenchmarkB")]);
        assert_eq!(d.run(), 0);
        let out = out.contents();
        assert!(out.ends_with("PASS\n"), "{out}");
        assert!(out.contains("BenchmarkA"), "{out}");
    }

    #[test]
    fn test_failure_exits_one() {
        let bad = InternalBenchmark::new("BenchmarkBad", |b| b.error("nope"));
        let (mut d, out) = driver(Config::new(), vec![bad]);
        assert_eq!(d.run(), 1);
        assert!(out.contents().ends_with("FAIL\n"));
    }

    #[test]
    fn test_list_mode() {
        let (mut d, out) = driver(
            Config::new().with_list("^BenchmarkS"),
            vec![noop("BenchmarkSort"), noop("BenchmarkHash")],
        );
        assert_eq!(d.run(), 0);
        assert_eq!(out.contents(), "BenchmarkSort\n");

        let (mut d, _) = driver(Config::new().with_list("("), vec![noop("BenchmarkSort")]);
        assert_eq!(d.run(), 1);
    }

    #[test]
    fn test_zero_parallel_exits_two() {
        let (mut d, _) = driver(Config::new().with_parallel(0), vec![noop("BenchmarkA")]);
        assert_eq!(d.run(), 2);
    }

    #[test]
    fn test_pattern_filters_top_level() {
        let (mut d, out) = driver(
            Config::new().with_bench("Hash"),
            vec![noop("BenchmarkSort"), noop("BenchmarkHash")],
        );
        assert_eq!(d.run(), 0);
        let out = out.contents();
        assert!(out.contains("BenchmarkHash"));
        assert!(!out.contains("BenchmarkSort"));
    }

    #[test]
    fn test_cpu_list_suffixes_names() {
        let buffer = SharedBuffer::default();
        let config = Config::new()
            .with_benchtime(BenchTime::Count(1))
            .with_cpu_list(vec![1, 2]);
        let mut d = Driver::new(config, vec![noop("BenchmarkA")]).with_output(buffer.clone());
        assert_eq!(d.run(), 0);
        let out = buffer.contents();
        assert!(out.lines().any(|l| l.starts_with("BenchmarkA ")), "{out}");
        assert!(out.lines().any(|l| l.starts_with("BenchmarkA-2 ")), "{out}");
    }
}
