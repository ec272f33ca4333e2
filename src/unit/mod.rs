//! Unit lifecycle state
//!
//! A unit is one test or benchmark invocation. Each unit owns a record in a
//! shared arena holding its pass/fail/skip flags, buffered output, helper
//! set, cleanup chain and temporary-directory allocator, all behind a single
//! per-unit lock. Units link to their parent by arena index.
//!
//! `fail_now` and `skip_now` end the running body early by unwinding with a
//! private payload that only the unit runner catches; the cleanup chain
//! still runs afterwards.

pub mod arena;
pub mod cleanup;
pub mod context;
pub mod frames;
pub mod group;
mod tempdir;

pub use arena::{Arena, UnitId};
pub use cleanup::{PanicHandling, PanicPayload};
pub use context::RunContext;
pub use frames::{Frame, FrameId};
pub use group::Group;

use crate::report::action_log::Action;
use crate::BenchkitError;
use cleanup::CleanupStack;
use frames::Attribution;
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe, Location};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Unwind payload of `fail_now`/`skip_now`
pub(crate) struct Goexit;

/// How a unit body ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exit {
    Returned,
    Abrupt,
    Panicked,
}

/// Cooperative cancellation handle for work spawned from a unit body.
///
/// Fires when the unit exits abruptly or completes.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the token fires
    pub async fn cancelled(&mut self) {
        // A closed channel means the unit is gone, which also counts.
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Mutable part of a unit record, guarded by the unit lock
#[derive(Debug, Default)]
pub(crate) struct UnitState {
    pub(crate) output: Vec<u8>,
    pub(crate) ran: bool,
    pub(crate) failed: bool,
    pub(crate) skipped: bool,
    pub(crate) done: bool,
    pub(crate) finished: bool,
    pub(crate) duration: Duration,
    helpers: HashSet<FrameId>,
    cleanups: CleanupStack,
    cleanup_site: Vec<Frame>,
    temp_base: Option<tempfile::TempDir>,
    temp_seq: u32,
}

/// Arena entry for one unit
pub struct UnitRecord {
    id: UnitId,
    name: String,
    level: usize,
    parent: Option<UnitId>,
    bench: bool,
    creator: Vec<Frame>,
    context: Arc<RunContext>,
    state: RwLock<UnitState>,
    started: Instant,
    cancel: watch::Sender<bool>,
}

impl fmt::Debug for UnitRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("level", &self.level)
            .field("parent", &self.parent)
            .field("bench", &self.bench)
            .finish_non_exhaustive()
    }
}

/// Handle to a running test or benchmark unit
#[derive(Clone)]
pub struct Unit {
    arena: Arc<Arena>,
    record: Arc<UnitRecord>,
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Unit").field(&self.record.name).finish()
    }
}

/// The interface common to every kind of unit
pub trait TB {
    fn name(&self) -> &str;
    fn fail(&self);
    fn fail_now(&self) -> !;
    fn failed(&self) -> bool;
    #[track_caller]
    fn log(&self, message: &str);
    #[track_caller]
    fn error(&self, message: &str);
    #[track_caller]
    fn fatal(&self, message: &str) -> !;
    #[track_caller]
    fn skip(&self, message: &str) -> !;
    fn skip_now(&self) -> !;
    fn skipped(&self) -> bool;
    fn helper(&self);
    #[track_caller]
    fn cleanup(&self, action: Box<dyn FnOnce() + Send + 'static>);
    #[track_caller]
    fn temp_dir(&self) -> PathBuf;
}

impl Unit {
    /// Create the root of a unit tree. The root itself is level 0; units it
    /// starts are top-level units.
    pub fn root(context: Arc<RunContext>, name: impl Into<String>) -> Self {
        Self::create(Arc::new(Arena::new()), context, name.into(), 0, None, false, Vec::new())
    }

    /// Root of a benchmark tree
    pub(crate) fn bench_root(context: Arc<RunContext>, name: impl Into<String>) -> Self {
        Self::create(Arc::new(Arena::new()), context, name.into(), 0, None, true, Vec::new())
    }

    fn create(
        arena: Arc<Arena>,
        context: Arc<RunContext>,
        name: String,
        level: usize,
        parent: Option<UnitId>,
        bench: bool,
        creator: Vec<Frame>,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        let record = arena.insert(|id| UnitRecord {
            id,
            name,
            level,
            parent,
            bench,
            creator,
            context,
            state: RwLock::new(UnitState::default()),
            started: Instant::now(),
            cancel,
        });
        tracing::debug!(unit = %record.name, level, "unit created");
        Unit { arena, record }
    }

    /// Start a sub-unit record under this one
    pub(crate) fn spawn_child(&self, name: String, bench: bool, creator: Vec<Frame>) -> Unit {
        self.write().ran = true;
        let child = Self::create(
            Arc::clone(&self.arena),
            Arc::clone(&self.record.context),
            name,
            self.record.level + 1,
            Some(self.record.id),
            bench,
            creator,
        );
        child.write().ran = true;
        child.record_action(Action::Run, "");
        child
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    /// Nesting depth: 0 for the root, 1 for top-level units
    pub fn level(&self) -> usize {
        self.record.level
    }

    pub fn is_bench(&self) -> bool {
        self.record.bench
    }

    pub fn id(&self) -> UnitId {
        self.record.id
    }

    pub fn context(&self) -> &Arc<RunContext> {
        &self.record.context
    }

    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    /// The parent unit, finished or not
    pub fn parent(&self) -> Option<Unit> {
        let id = self.record.parent?;
        self.arena.get(id).map(|record| Unit {
            arena: Arc::clone(&self.arena),
            record,
        })
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, UnitState> {
        self.record.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, UnitState> {
        self.record.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn failed(&self) -> bool {
        self.read().failed
    }

    pub fn skipped(&self) -> bool {
        self.read().skipped
    }

    /// Whether the body (or a sub-unit) was executed
    pub fn ran(&self) -> bool {
        self.read().ran
    }

    /// Whether the body ended through `fail_now`/`skip_now` or returned normally
    pub fn finished(&self) -> bool {
        self.read().finished
    }

    pub fn done(&self) -> bool {
        self.read().done
    }

    /// Buffered output so far
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.read().output).into_owned()
    }

    /// Time from creation to completion, or to now while still running
    pub fn duration(&self) -> Duration {
        let state = self.read();
        if state.done {
            state.duration
        } else {
            self.record.started.elapsed()
        }
    }

    pub(crate) fn append_output(&self, text: &str) {
        self.write().output.extend_from_slice(text.as_bytes());
    }

    pub(crate) fn take_output(&self) -> String {
        let bytes = std::mem::take(&mut self.write().output);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Mark this unit and every ancestor as failed
    pub fn fail(&self) {
        let mut state = self.write();
        if state.done {
            drop(state);
            violation(format!("fail called after {} has completed", self.name()));
        }
        state.failed = true;
        drop(state);
        if let Some(parent) = self.parent() {
            parent.fail();
        }
    }

    /// Mark the unit failed and stop running its body
    pub fn fail_now(&self) -> ! {
        self.fail();
        self.exit_abruptly()
    }

    /// Mark the unit skipped and stop running its body. An earlier failure
    /// still stands.
    pub fn skip_now(&self) -> ! {
        {
            let mut state = self.write();
            if state.done {
                drop(state);
                violation(format!("skip called after {} has completed", self.name()));
            }
            state.skipped = true;
        }
        self.exit_abruptly()
    }

    fn exit_abruptly(&self) -> ! {
        self.write().finished = true;
        self.record.cancel.send_replace(true);
        panic::resume_unwind(Box::new(Goexit))
    }

    /// Record a line of output
    #[track_caller]
    pub fn log(&self, message: impl fmt::Display) {
        self.log_at(&message.to_string(), Location::caller());
    }

    /// Record formatted output
    #[track_caller]
    pub fn logf(&self, args: fmt::Arguments<'_>) {
        self.log_at(&fmt::format(args), Location::caller());
    }

    /// `log` followed by `fail`
    #[track_caller]
    pub fn error(&self, message: impl fmt::Display) {
        self.log_at(&message.to_string(), Location::caller());
        self.fail();
    }

    #[track_caller]
    pub fn errorf(&self, args: fmt::Arguments<'_>) {
        self.log_at(&fmt::format(args), Location::caller());
        self.fail();
    }

    /// `log` followed by `fail_now`
    #[track_caller]
    pub fn fatal(&self, message: impl fmt::Display) -> ! {
        self.log_at(&message.to_string(), Location::caller());
        self.fail_now()
    }

    #[track_caller]
    pub fn fatalf(&self, args: fmt::Arguments<'_>) -> ! {
        self.log_at(&fmt::format(args), Location::caller());
        self.fail_now()
    }

    /// `log` followed by `skip_now`
    #[track_caller]
    pub fn skip(&self, message: impl fmt::Display) -> ! {
        self.log_at(&message.to_string(), Location::caller());
        self.skip_now()
    }

    #[track_caller]
    pub fn skipf(&self, args: fmt::Arguments<'_>) -> ! {
        self.log_at(&fmt::format(args), Location::caller());
        self.skip_now()
    }

    fn log_at(&self, message: &str, origin: &'static Location<'static>) {
        let frames = frames::capture(origin);
        let mut state = self.write();

        if state.done {
            let mut ancestor = self.parent();
            while let Some(parent) = ancestor {
                let mut parent_state = parent.write();
                if !parent_state.done {
                    let line = parent.decorate(&parent_state, &frames, message);
                    parent_state.output.extend_from_slice(line.as_bytes());
                    return;
                }
                drop(parent_state);
                ancestor = parent.parent();
            }
            drop(state);
            violation(format!(
                "log called after {} has completed: {}",
                self.name(),
                message
            ));
        }

        let line = self.decorate(&state, &frames, message);
        let context = self.context();
        if context.chatty() {
            drop(state);
            if self.record.bench {
                context.printer().write_raw(&line);
            } else {
                context.printer().printf(self.name(), format_args!("{}", line));
            }
            self.record_action(Action::Output, &line);
            return;
        }
        state.output.extend_from_slice(line.as_bytes());
    }

    fn decorate(&self, state: &UnitState, frames: &[Frame], message: &str) -> String {
        let attribution = Attributed { unit: self, state };
        let frame = frames::frame_skip(&attribution, frames);
        frames::decorate(&frame, message)
    }

    /// Exclude the innermost frame from call-site attribution, so that
    /// diagnostics raised inside it are reported at the call that entered it.
    ///
    /// The innermost frame is the unit body, the running cleanup action, or
    /// a call made through [`Unit::frame`]. A `#[track_caller]` helper needs
    /// no marking: its diagnostics already carry its caller's location.
    pub fn helper(&self) {
        if let Some(id) = frames::current() {
            self.write().helpers.insert(id);
        }
    }

    /// Run `f` in a new frame entered at the caller's location, e.g.
    /// `u.frame(|| check_sorted(u, &data))`. A helper that calls `helper()`
    /// has its diagnostics attributed to that call.
    #[track_caller]
    pub fn frame<R>(&self, f: impl FnOnce() -> R) -> R {
        let _frame = frames::enter(FrameId::fresh());
        f()
    }

    /// Register `action` to run after the unit and its sub-units complete.
    /// Actions run last-registered-first.
    #[track_caller]
    pub fn cleanup<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let site = frames::capture(Location::caller());
        self.write().cleanups.register(action, site);
    }

    pub(crate) fn pop_cleanup(&self) -> Option<cleanup::Cleanup> {
        self.write().cleanups.pop()
    }

    pub(crate) fn set_cleanup_site(&self, site: Vec<Frame>) {
        self.write().cleanup_site = site;
    }

    /// Run the cleanup chain now
    pub fn run_cleanup(&self, handling: PanicHandling) -> Option<PanicPayload> {
        cleanup::run(self, handling)
    }

    /// Handle that fires when this unit exits abruptly or completes
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken {
            rx: self.record.cancel.subscribe(),
        }
    }

    /// Run `body` inside the unit-runner boundary, then the cleanup chain.
    ///
    /// Abrupt exits stop here. Any other panic, from the body or from a
    /// cleanup action, fails the unit and is recorded in its output.
    pub(crate) fn run_body(&self, body: impl FnOnce()) -> Exit {
        let exit = self.run_guarded(body);
        self.finish_cleanup();
        exit
    }

    /// Run `body` inside the unit-runner boundary without running cleanups
    pub(crate) fn run_guarded(&self, body: impl FnOnce()) -> Exit {
        let _runner = frames::enter(FrameId::RUNNER);
        let _body = frames::enter(FrameId::fresh());
        match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(()) => Exit::Returned,
            Err(payload) if payload.is::<Goexit>() => Exit::Abrupt,
            Err(payload) => {
                self.record_panic(payload.as_ref());
                Exit::Panicked
            }
        }
    }

    /// Run the cleanup chain, recording a panic from it as a failure
    pub(crate) fn finish_cleanup(&self) {
        if let Some(payload) = cleanup::run(self, PanicHandling::Recover) {
            self.record_panic(payload.as_ref());
        }
    }

    fn record_panic(&self, payload: &(dyn Any + Send)) {
        let message = panic_message(payload);
        tracing::debug!(unit = %self.name(), %message, "unit panicked");
        {
            let mut state = self.write();
            state.failed = true;
            state
                .output
                .extend_from_slice(format!("    panic: {}\n", message).as_bytes());
        }
        if let Some(parent) = self.parent() {
            parent.fail();
        }
    }

    /// Mark the unit complete and fire its cancel token
    pub(crate) fn mark_done(&self) {
        {
            let mut state = self.write();
            state.done = true;
            state.duration = self.record.started.elapsed();
        }
        self.record.cancel.send_replace(true);
        tracing::debug!(unit = %self.name(), "unit done");
    }

    pub(crate) fn record_action(&self, action: Action, output: &str) {
        let elapsed = match action {
            Action::Run | Action::Output => None,
            _ => Some(self.duration()),
        };
        self.context().record(action, self.name(), elapsed, output);
    }

    /// Run `body` as a sequential sub-unit named `name`. Returns false if
    /// the sub-unit failed; names filtered out by the run pattern count as
    /// passed.
    #[track_caller]
    pub fn run<F>(&self, name: &str, body: F) -> bool
    where
        F: FnOnce(&Unit),
    {
        let creator = frames::capture(Location::caller());
        let parent_name = (self.level() > 0).then(|| self.name());
        let (full_name, matched, _) = self.context().matcher().full_name(parent_name, name);
        if !matched {
            return true;
        }

        let child = self.spawn_child(full_name, false, creator);
        let context = Arc::clone(self.context());
        if context.chatty() {
            context
                .printer()
                .updatef(child.name(), format_args!("=== RUN   {}\n", child.name()));
        }

        if child.run_body(|| body(&child)) == Exit::Returned {
            child.write().finished = true;
        }
        child.mark_done();
        child.report();
        !child.failed()
    }

    /// Report a finished sequential sub-unit
    fn report(&self) {
        let (failed, skipped) = {
            let state = self.read();
            (state.failed, state.skipped)
        };
        let context = self.context();
        let (tag, action) = if failed {
            ("FAIL", Action::Fail)
        } else if skipped {
            ("SKIP", Action::Skip)
        } else {
            ("PASS", Action::Pass)
        };
        self.record_action(action, "");

        if !failed && !context.chatty() {
            return;
        }
        let output = self.take_output();
        let text = format!(
            "--- {}: {} ({})\n{}",
            tag,
            self.name(),
            crate::util::format_seconds(self.duration()),
            output
        );
        match self.parent() {
            Some(parent) if parent.level() > 0 && !context.chatty() => {
                parent.append_output(&indent(&text));
            }
            _ => context.printer().updatef(self.name(), format_args!("{}", text)),
        }
    }
}

impl TB for Unit {
    fn name(&self) -> &str {
        Unit::name(self)
    }
    fn fail(&self) {
        Unit::fail(self)
    }
    fn fail_now(&self) -> ! {
        Unit::fail_now(self)
    }
    fn failed(&self) -> bool {
        Unit::failed(self)
    }
    fn log(&self, message: &str) {
        Unit::log(self, message)
    }
    fn error(&self, message: &str) {
        Unit::error(self, message)
    }
    fn fatal(&self, message: &str) -> ! {
        Unit::fatal(self, message)
    }
    fn skip(&self, message: &str) -> ! {
        Unit::skip(self, message)
    }
    fn skip_now(&self) -> ! {
        Unit::skip_now(self)
    }
    fn skipped(&self) -> bool {
        Unit::skipped(self)
    }
    fn helper(&self) {
        Unit::helper(self)
    }
    fn cleanup(&self, action: Box<dyn FnOnce() + Send + 'static>) {
        Unit::cleanup(self, action)
    }
    fn temp_dir(&self) -> PathBuf {
        Unit::temp_dir(self)
    }
}

struct Attributed<'a> {
    unit: &'a Unit,
    state: &'a UnitState,
}

impl Attribution for Attributed<'_> {
    fn is_helper(&self, function: FrameId) -> bool {
        self.state.helpers.contains(&function)
    }

    fn level(&self) -> usize {
        self.unit.record.level
    }

    fn cleanup_site(&self) -> &[Frame] {
        &self.state.cleanup_site
    }

    fn continue_in_parent(&self) -> Option<Frame> {
        let parent = self.unit.parent()?;
        let parent_state = parent.read();
        let attribution = Attributed {
            unit: &parent,
            state: &parent_state,
        };
        Some(frames::frame_skip(&attribution, &self.unit.record.creator))
    }
}

fn violation(message: String) -> ! {
    panic::panic_any(BenchkitError::StateViolation(message))
}

/// Text carried by a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(err) = payload.downcast_ref::<BenchkitError>() {
        err.to_string()
    } else {
        "non-string panic payload".to_string()
    }
}

fn indent(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    for line in text.lines() {
        out.push_str("    ");
        out.push_str(line);
        out.push('\n');
    }
    out
}
