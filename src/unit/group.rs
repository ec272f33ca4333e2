//! Parallel sub-unit groups
//!
//! Sub-units started from a group run on scoped threads and are all joined
//! before `group` returns, so the parent never completes while a child is
//! still running. At most `max_parallel` of them hold a run slot at once.

use super::{frames, Exit, Unit};
use std::cell::Cell;
use std::panic::Location;
use std::sync::Arc;
use std::thread;

thread_local! {
    static HOLDS_SLOT: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread runs a unit that holds a parallel slot
pub(crate) fn holds_slot() -> bool {
    HOLDS_SLOT.with(Cell::get)
}

pub(crate) fn set_holds_slot(held: bool) {
    HOLDS_SLOT.with(|h| h.set(held));
}

/// Run `wait` with the current thread's slot lent back to the limiter
pub(crate) fn yield_slot<T>(unit: &Unit, wait: impl FnOnce() -> T) -> T {
    let held = holds_slot();
    if held {
        unit.context().limiter().release();
    }
    let out = wait();
    if held {
        unit.context().limiter().acquire();
    }
    out
}

/// Handle for starting parallel sub-units inside `Unit::group`
pub struct Group<'scope, 'env: 'scope> {
    parent: &'env Unit,
    scope: &'scope thread::Scope<'scope, 'env>,
}

impl<'scope, 'env> Group<'scope, 'env> {
    /// Start `body` as a parallel sub-unit named `name`
    #[track_caller]
    pub fn run<F>(&self, name: &str, body: F)
    where
        F: FnOnce(&Unit) + Send + 'scope,
    {
        let creator = frames::capture(Location::caller());
        let parent_name = (self.parent.level() > 0).then(|| self.parent.name());
        let (full_name, matched, _) = self
            .parent
            .context()
            .matcher()
            .full_name(parent_name, name);
        if !matched {
            return;
        }

        let child = self.parent.spawn_child(full_name, false, creator);
        let context = Arc::clone(child.context());
        if context.chatty() {
            context
                .printer()
                .updatef(child.name(), format_args!("=== RUN   {}\n", child.name()));
        }

        self.scope.spawn(move || {
            let _slot = context.acquire();
            set_holds_slot(true);
            if context.chatty() {
                context
                    .printer()
                    .updatef(child.name(), format_args!("=== CONT  {}\n", child.name()));
            }
            if child.run_body(|| body(&child)) == Exit::Returned {
                child.write().finished = true;
            }
            set_holds_slot(false);
            child.mark_done();
            child.report();
        });
    }
}

impl Unit {
    /// Run the sub-units started through `f` in parallel and wait for all of
    /// them. Returns false if this unit has failed.
    pub fn group<'env, F>(&'env self, f: F) -> bool
    where
        F: for<'scope> FnOnce(&Group<'scope, 'env>),
    {
        yield_slot(self, || {
            thread::scope(|scope| {
                f(&Group {
                    parent: self,
                    scope,
                })
            })
        });
        !self.failed()
    }
}
