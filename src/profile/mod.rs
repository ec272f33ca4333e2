//! Profiling capability
//!
//! The driver starts every requested profile before the first benchmark and
//! writes each one to its file once all benchmarks have finished. The
//! built-in [`ProcessProfiler`] records process-level statistics: allocation
//! totals from the counting allocator and CPU time from `getrusage`.

use crate::alloc::{self, AllocStats};
use crate::{BenchkitError, Result};
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::time::{Duration, Instant};

/// Kinds of profile the driver can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfileKind {
    Allocs,
    Block,
    Mutex,
    Cpu,
    Trace,
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProfileKind::Allocs => "allocs",
            ProfileKind::Block => "block",
            ProfileKind::Mutex => "mutex",
            ProfileKind::Cpu => "cpu",
            ProfileKind::Trace => "trace",
        };
        f.write_str(name)
    }
}

/// A source of profiles
pub trait Profiler: Send {
    /// Sampling rate for `kind`, applied before it starts
    fn set_rate(&mut self, _kind: ProfileKind, _rate: i64) {}

    /// Begin recording `kind`
    fn start(&mut self, kind: ProfileKind) -> Result<()>;

    /// Stop recording `kind`
    fn stop(&mut self, kind: ProfileKind) -> Result<()>;

    /// Write the recorded `kind` profile
    fn write_to(&mut self, kind: ProfileKind, w: &mut dyn Write) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    wall: Instant,
    user: Duration,
    system: Duration,
    allocs: AllocStats,
}

impl Snapshot {
    fn now() -> Self {
        let (user, system) = platform::cpu_times();
        Self {
            wall: Instant::now(),
            user,
            system,
            allocs: alloc::snapshot(),
        }
    }
}

#[derive(Debug)]
struct Session {
    start: Snapshot,
    end: Option<Snapshot>,
}

/// Profiler reporting process-wide statistics over the profiled interval
#[derive(Debug, Default)]
pub struct ProcessProfiler {
    rates: HashMap<ProfileKind, i64>,
    sessions: HashMap<ProfileKind, Session>,
}

impl ProcessProfiler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Profiler for ProcessProfiler {
    fn set_rate(&mut self, kind: ProfileKind, rate: i64) {
        self.rates.insert(kind, rate);
    }

    fn start(&mut self, kind: ProfileKind) -> Result<()> {
        if kind == ProfileKind::Trace {
            return Err(BenchkitError::ResourceError(
                "execution tracing is not supported by the process profiler".to_string(),
            ));
        }
        if self.sessions.contains_key(&kind) {
            return Err(BenchkitError::ResourceError(format!(
                "{} profile already started",
                kind
            )));
        }
        tracing::debug!(%kind, "profile started");
        self.sessions.insert(
            kind,
            Session {
                start: Snapshot::now(),
                end: None,
            },
        );
        Ok(())
    }

    fn stop(&mut self, kind: ProfileKind) -> Result<()> {
        let session = self.sessions.get_mut(&kind).ok_or_else(|| {
            BenchkitError::ResourceError(format!("{} profile was not started", kind))
        })?;
        if session.end.is_none() {
            session.end = Some(Snapshot::now());
        }
        Ok(())
    }

    fn write_to(&mut self, kind: ProfileKind, w: &mut dyn Write) -> Result<()> {
        let session = self.sessions.get(&kind).ok_or_else(|| {
            BenchkitError::ResourceError(format!("{} profile was not started", kind))
        })?;
        let start = session.start;
        let end = session.end.unwrap_or_else(Snapshot::now);
        let rate = self.rates.get(&kind).copied().unwrap_or(0);

        writeln!(w, "# benchkit {} profile", kind)?;
        writeln!(w, "# rate: {}", rate)?;
        writeln!(
            w,
            "wall: {:.6}s",
            end.wall.duration_since(start.wall).as_secs_f64()
        )?;
        match kind {
            ProfileKind::Allocs => {
                let delta = end.allocs.since(&start.allocs);
                writeln!(w, "counting: {}", alloc::is_active())?;
                writeln!(w, "allocations: {}", delta.count)?;
                writeln!(w, "bytes: {}", delta.bytes)?;
            }
            ProfileKind::Cpu => {
                writeln!(
                    w,
                    "user: {:.6}s",
                    end.user.saturating_sub(start.user).as_secs_f64()
                )?;
                writeln!(
                    w,
                    "system: {:.6}s",
                    end.system.saturating_sub(start.system).as_secs_f64()
                )?;
            }
            ProfileKind::Block | ProfileKind::Mutex | ProfileKind::Trace => {
                writeln!(w, "samples: 0")?;
            }
        }
        w.flush()?;
        Ok(())
    }
}

#[cfg(unix)]
mod platform {
    use std::mem::MaybeUninit;
    use std::time::Duration;

    /// User and system CPU time consumed by this process
    pub fn cpu_times() -> (Duration, Duration) {
        let mut usage = MaybeUninit::<libc::rusage>::zeroed();
        // SAFETY: getrusage only writes into the provided struct.
        let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
        if rc != 0 {
            return (Duration::ZERO, Duration::ZERO);
        }
        // SAFETY: zero-initialized and filled in by a successful getrusage.
        let usage = unsafe { usage.assume_init() };
        (timeval(usage.ru_utime), timeval(usage.ru_stime))
    }

    fn timeval(tv: libc::timeval) -> Duration {
        Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
    }
}

#[cfg(not(unix))]
mod platform {
    use std::time::Duration;

    pub fn cpu_times() -> (Duration, Duration) {
        (Duration::ZERO, Duration::ZERO)
    }
}
