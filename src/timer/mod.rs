//! Adaptive-precision timer
//!
//! Measures the steady-state latency of an operation without a fixed
//! iteration budget: the operation is repeated until the running average
//! per call changes by no more than the requested percentage on two
//! consecutive iterations, or until the iteration cap is reached.

use crate::util::units::format_millis;
use crate::{BenchkitError, OperationError, Result};
use std::fmt;
use std::future::Future;
use std::io::Write;
use std::time::{Duration, Instant};

/// Iterations run unconditionally before the first reference average
pub const WARMUP_ITERATIONS: usize = 5;

/// Hard cap on the number of iterations of one measurement
pub const ITERATION_LIMIT: usize = 100;

/// Result of a converged measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    /// Number of times the operation was invoked
    pub n: usize,
    /// Average duration of one invocation
    pub speed: Duration,
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} iterations {:.6} sec/ops", self.n, self.speed.as_secs_f64())
    }
}

/// Outcome of recording one iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Continue,
    Converged(Measurement),
    LimitExceeded(Measurement),
}

/// Transient state of one convergence loop
#[derive(Debug)]
pub(crate) struct AdaptiveMeasurement {
    precision: u64,
    at_least: usize,
    limit: usize,
    n: usize,
    avg: Duration,
    within_last: bool,
}

impl AdaptiveMeasurement {
    pub(crate) fn new(precision: u32, at_least: usize) -> Self {
        Self {
            precision: u64::from(precision),
            at_least,
            limit: ITERATION_LIMIT.max(at_least),
            n: 0,
            avg: Duration::ZERO,
            within_last: false,
        }
    }

    /// Iteration about to be run, one-based
    pub(crate) fn next_iteration(&self) -> usize {
        self.n + 1
    }

    /// Record the completion of one more iteration, `elapsed` being the total
    /// time since the measurement started. Returns the new running average
    /// alongside the step outcome.
    pub(crate) fn record(&mut self, elapsed: Duration) -> (Duration, Step) {
        self.n += 1;
        let new_avg = average(elapsed, self.n);

        if self.n < WARMUP_ITERATIONS {
            return (new_avg, Step::Continue);
        }
        if self.n == WARMUP_ITERATIONS {
            self.avg = new_avg;
            return (new_avg, Step::Continue);
        }

        let delta = percent_change(self.avg, new_avg);
        self.avg = new_avg;
        if delta <= self.precision {
            if self.within_last && self.n >= self.at_least {
                return (
                    new_avg,
                    Step::Converged(Measurement {
                        n: self.n,
                        speed: new_avg,
                    }),
                );
            }
            self.within_last = true;
        } else {
            self.within_last = false;
        }

        if self.n >= self.limit {
            return (
                new_avg,
                Step::LimitExceeded(Measurement {
                    n: self.n,
                    speed: self.avg,
                }),
            );
        }
        (new_avg, Step::Continue)
    }
}

fn average(elapsed: Duration, n: usize) -> Duration {
    let nanos = elapsed.as_nanos() / n as u128;
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Integer percentage change from `reference` to `current`.
///
/// A zero reference against a zero value is no change; any non-zero value
/// against a zero reference is maximally divergent.
pub(crate) fn percent_change(reference: Duration, current: Duration) -> u64 {
    let reference = reference.as_nanos();
    let current = current.as_nanos();
    if reference == 0 {
        return if current == 0 { 0 } else { u64::MAX };
    }
    let diff = reference.abs_diff(current);
    u64::try_from(diff * 100 / reference).unwrap_or(u64::MAX)
}

/// Configurable adaptive timer
///
/// ```
/// use benchkit::Timer;
///
/// let m = Timer::new(50)
///     .run(|| -> Result<(), std::io::Error> { Ok(()) })
///     .or_else(|e| e.estimate().copied().ok_or(e))
///     .unwrap();
/// assert!(m.n >= 6);
/// ```
pub struct Timer {
    precision: u32,
    at_least: usize,
    verbose: Option<Box<dyn Write + Send>>,
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("precision", &self.precision)
            .field("at_least", &self.at_least)
            .field("verbose", &self.verbose.is_some())
            .finish()
    }
}

impl Timer {
    /// Create a timer converging within `precision` percent
    pub fn new(precision: u32) -> Self {
        Self {
            precision,
            at_least: 0,
            verbose: None,
        }
    }

    /// Never report convergence before `n` iterations; raises the iteration
    /// cap to `n` when it is larger
    pub fn at_least(mut self, n: usize) -> Self {
        self.at_least = n;
        self
    }

    /// Emit the running average after every iteration to `sink`
    pub fn verbose<W: Write + Send + 'static>(mut self, sink: W) -> Self {
        self.verbose = Some(Box::new(sink));
        self
    }

    /// Measure a synchronous operation
    pub fn run<F, E>(&mut self, mut operation: F) -> Result<Measurement>
    where
        F: FnMut() -> std::result::Result<(), E>,
        E: Into<OperationError>,
    {
        let mut state = AdaptiveMeasurement::new(self.precision, self.at_least);
        let start = Instant::now();
        loop {
            let iteration = state.next_iteration();
            operation().map_err(|e| operation_failure(iteration, e))?;
            if let Some(m) = self.step(&mut state, start.elapsed())? {
                return Ok(m);
            }
        }
    }

    /// Measure an asynchronous operation on the current runtime
    pub async fn run_async<F, Fut, E>(&mut self, mut operation: F) -> Result<Measurement>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: Into<OperationError>,
    {
        let mut state = AdaptiveMeasurement::new(self.precision, self.at_least);
        let start = tokio::time::Instant::now();
        loop {
            let iteration = state.next_iteration();
            operation()
                .await
                .map_err(|e| operation_failure(iteration, e))?;
            if let Some(m) = self.step(&mut state, start.elapsed())? {
                return Ok(m);
            }
        }
    }

    fn step(
        &mut self,
        state: &mut AdaptiveMeasurement,
        elapsed: Duration,
    ) -> Result<Option<Measurement>> {
        let (running_avg, step) = state.record(elapsed);
        if let Some(sink) = self.verbose.as_mut() {
            // The side channel must not influence the measurement outcome.
            let _ = writeln!(
                sink,
                "iteration {}: {} ms/op",
                state.n,
                format_millis(running_avg)
            );
        }
        match step {
            Step::Continue => Ok(None),
            Step::Converged(m) => {
                tracing::debug!(n = m.n, speed = ?m.speed, "measurement converged");
                Ok(Some(m))
            }
            Step::LimitExceeded(estimate) => {
                Err(BenchkitError::ConvergenceLimitExceeded { estimate })
            }
        }
    }
}

fn operation_failure<E: Into<OperationError>>(iteration: usize, err: E) -> BenchkitError {
    BenchkitError::OperationFailure {
        iteration,
        source: err.into(),
    }
}

/// Measure `operation` until its average latency is stable within `precision` percent
pub fn bench<F, E>(precision: u32, operation: F) -> Result<Measurement>
where
    F: FnMut() -> std::result::Result<(), E>,
    E: Into<OperationError>,
{
    Timer::new(precision).run(operation)
}
