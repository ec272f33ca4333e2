//! State shared by every unit of one run

use crate::bench::matcher::Matcher;
use crate::report::action_log::{Action, ActionLog};
use crate::report::chatty::ChattyPrinter;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Reporter, name matcher, action log and parallelism limit shared across a run
#[derive(Debug)]
pub struct RunContext {
    printer: Arc<ChattyPrinter>,
    chatty: bool,
    matcher: Arc<Matcher>,
    action_log: Option<Arc<ActionLog>>,
    limiter: Limiter,
}

impl RunContext {
    /// Create a context writing through `printer`, streaming unit output
    /// immediately when `chatty` is set and running at most `max_parallel`
    /// parallel units at once
    pub fn new(printer: Arc<ChattyPrinter>, chatty: bool, max_parallel: usize) -> Self {
        Self {
            printer,
            chatty,
            matcher: Arc::new(Matcher::all()),
            action_log: None,
            limiter: Limiter::new(max_parallel),
        }
    }

    /// Filter sub-units through `matcher`
    pub fn with_matcher(mut self, matcher: Arc<Matcher>) -> Self {
        self.matcher = matcher;
        self
    }

    /// Record unit actions to `log`
    pub fn with_action_log(mut self, log: Arc<ActionLog>) -> Self {
        self.action_log = Some(log);
        self
    }

    pub fn printer(&self) -> &ChattyPrinter {
        &self.printer
    }

    pub fn chatty(&self) -> bool {
        self.chatty
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    pub fn max_parallel(&self) -> usize {
        self.limiter.max
    }

    pub(crate) fn record(&self, action: Action, name: &str, elapsed: Option<Duration>, output: &str) {
        if let Some(log) = &self.action_log {
            log.event(action, name, elapsed, output);
        }
    }

    /// Wait for a parallel slot
    pub(crate) fn acquire(&self) -> Slot<'_> {
        self.limiter.acquire();
        Slot {
            limiter: &self.limiter,
        }
    }

    pub(crate) fn limiter(&self) -> &Limiter {
        &self.limiter
    }
}

#[derive(Debug, Default)]
struct Slots {
    running: usize,
}

/// Counting limit on concurrently running parallel units
#[derive(Debug)]
pub(crate) struct Limiter {
    max: usize,
    slots: Mutex<Slots>,
    freed: Condvar,
}

impl Limiter {
    fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            slots: Mutex::new(Slots::default()),
            freed: Condvar::new(),
        }
    }

    pub(crate) fn acquire(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        while slots.running >= self.max {
            slots = self.freed.wait(slots).unwrap_or_else(PoisonError::into_inner);
        }
        slots.running += 1;
    }

    pub(crate) fn release(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.running = slots.running.saturating_sub(1);
        drop(slots);
        self.freed.notify_one();
    }

    #[cfg(test)]
    fn running(&self) -> usize {
        self.slots.lock().unwrap().running
    }
}

/// A held parallel slot, released on drop
#[derive(Debug)]
pub(crate) struct Slot<'a> {
    limiter: &'a Limiter,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        self.limiter.release();
    }
}
