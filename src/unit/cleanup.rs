//! Cleanup chains
//!
//! Actions registered on a unit run last-added-first once the unit body (and
//! every sub-unit) has returned, whether it passed, failed or was skipped.

use super::frames::{self, Frame, FrameId};
use super::{Goexit, Unit};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};

/// Panic payload escaping a cleanup action
pub type PanicPayload = Box<dyn Any + Send + 'static>;

/// What to do with a panic raised by a cleanup action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanicHandling {
    /// Resume unwinding once the whole chain has run
    Normal,
    /// Hand the payload back to the caller
    Recover,
}

type Action = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct Cleanup {
    // Only ever locked when the action is taken; keeps the unit state Sync.
    action: Mutex<Action>,
    site: Vec<Frame>,
}

impl fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cleanup").field("site", &self.site).finish()
    }
}

/// LIFO chain of deferred actions
#[derive(Debug, Default)]
pub(crate) struct CleanupStack {
    entries: Vec<Cleanup>,
}

impl CleanupStack {
    pub(crate) fn register<F>(&mut self, action: F, site: Vec<Frame>)
    where
        F: FnOnce() + Send + 'static,
    {
        self.entries.push(Cleanup {
            action: Mutex::new(Box::new(action)),
            site,
        });
    }

    /// Detach the next action to run
    pub(crate) fn pop(&mut self) -> Option<Cleanup> {
        self.entries.pop()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Run `unit`'s cleanup chain to completion.
///
/// Actions are detached one at a time under the unit lock, so the chain runs
/// at most once even when several callers race, and actions registered by a
/// running cleanup still run. A panic in one action does not stop the rest.
pub(crate) fn run(unit: &Unit, handling: PanicHandling) -> Option<PanicPayload> {
    let mut first_panic: Option<PanicPayload> = None;

    while let Some(Cleanup { action, site }) = unit.pop_cleanup() {
        let action = action.into_inner().unwrap_or_else(PoisonError::into_inner);
        unit.set_cleanup_site(site);
        let outcome = {
            let _cleanup = frames::enter(FrameId::CLEANUP);
            let _action = frames::enter(FrameId::fresh());
            panic::catch_unwind(AssertUnwindSafe(action))
        };
        unit.set_cleanup_site(Vec::new());

        match outcome {
            Ok(()) => {}
            Err(payload) if payload.is::<Goexit>() => {}
            Err(payload) => {
                if first_panic.is_none() {
                    first_panic = Some(payload);
                }
            }
        }
    }

    match (handling, first_panic) {
        (PanicHandling::Normal, Some(payload)) => panic::resume_unwind(payload),
        (_, payload) => payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_pops_most_recent_first() {
        let mut stack = CleanupStack::default();
        stack.register(|| {}, vec![Frame::UNKNOWN]);
        stack.register(|| {}, Vec::new());
        assert_eq!(stack.len(), 2);
        assert!(stack.pop().unwrap().site.is_empty());
        assert_eq!(stack.pop().unwrap().site, vec![Frame::UNKNOWN]);
        assert!(stack.pop().is_none());
    }
}
