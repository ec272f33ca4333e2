//! Call-site attribution for unit diagnostics
//!
//! Every diagnostic entry point is `#[track_caller]`, so the originating
//! location arrives explicitly. The surrounding frames come from a per-thread
//! shadow stack: the unit runner pushes a runner frame and a body frame,
//! `Unit::frame` runs a call inside a frame of its own, and cleanup
//! execution pushes a cleanup frame. `frame_skip` walks that sequence the
//! way a native stack walk would, skipping frames registered as helpers.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of a function frame on the shadow stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(u64);

impl FrameId {
    /// The unit runner entry point
    pub const RUNNER: FrameId = FrameId(1);
    /// Cleanup execution
    pub const CLEANUP: FrameId = FrameId(2);

    pub(crate) fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(16);
        FrameId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// One attributed call site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Function the call site belongs to, if known
    pub function: Option<FrameId>,
    /// Source file of the call site
    pub file: Option<&'static str>,
    /// Source line, zero when unknown
    pub line: u32,
}

impl Frame {
    pub const UNKNOWN: Frame = Frame {
        function: None,
        file: None,
        line: 0,
    };

    pub(crate) fn at(function: Option<FrameId>, location: &'static Location<'static>) -> Self {
        Frame {
            function,
            file: Some(location.file()),
            line: location.line(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Scope {
    id: FrameId,
    entered_at: &'static Location<'static>,
}

thread_local! {
    static STACK: RefCell<Vec<Scope>> = const { RefCell::new(Vec::new()) };
}

/// Pops its shadow frame (and anything pushed above it) when dropped
#[derive(Debug)]
#[must_use = "the frame is popped as soon as the guard is dropped"]
pub struct FrameGuard {
    depth: usize,
    id: FrameId,
    // Shadow frames belong to the thread that pushed them.
    _not_send: PhantomData<*const ()>,
}

impl FrameGuard {
    /// Identity of the pushed frame
    pub fn id(&self) -> FrameId {
        self.id
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        STACK.with(|stack| stack.borrow_mut().truncate(self.depth));
    }
}

/// Push a frame for `id`, entered from the caller's location
#[track_caller]
pub(crate) fn enter(id: FrameId) -> FrameGuard {
    let entered_at = Location::caller();
    let depth = STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        stack.push(Scope { id, entered_at });
        stack.len() - 1
    });
    FrameGuard {
        depth,
        id,
        _not_send: PhantomData,
    }
}

/// Identity of the innermost frame on this thread
pub(crate) fn current() -> Option<FrameId> {
    STACK.with(|stack| stack.borrow().last().map(|scope| scope.id))
}

/// Snapshot of this thread's frames, innermost first, starting at `origin`
pub(crate) fn capture(origin: &'static Location<'static>) -> Vec<Frame> {
    STACK.with(|stack| {
        let stack = stack.borrow();
        let mut frames = Vec::with_capacity(stack.len() + 1);
        frames.push(Frame::at(stack.last().map(|s| s.id), origin));
        for i in (1..stack.len()).rev() {
            frames.push(Frame::at(Some(stack[i - 1].id), stack[i].entered_at));
        }
        frames
    })
}

/// What the frame walk needs to know about the unit it attributes for
pub(crate) trait Attribution {
    fn is_helper(&self, function: FrameId) -> bool;
    fn level(&self) -> usize;
    /// Frames captured where the currently running cleanup was registered
    fn cleanup_site(&self) -> &[Frame];
    /// Continue the walk in the parent unit from the frames captured when
    /// this unit was created, holding the parent's lock for the duration
    fn continue_in_parent(&self) -> Option<Frame>;
}

/// Find the first frame not inside a helper function.
///
/// Reaching the runner means every frame of the unit body was a helper: a
/// top-level unit reports the body frame itself, a nested one continues in
/// its parent at the point where the parent created it.
pub(crate) fn frame_skip<'a>(ctx: &'a dyn Attribution, frames: &'a [Frame]) -> Frame {
    let mut current: &[Frame] = frames;
    let mut idx = 0;
    let mut first: Option<Frame> = None;
    let mut prev: Option<Frame> = None;
    let mut in_cleanup_site = false;

    while let Some(frame) = current.get(idx).copied() {
        idx += 1;
        if frame.function == Some(FrameId::CLEANUP) && !in_cleanup_site {
            current = ctx.cleanup_site();
            idx = 0;
            in_cleanup_site = true;
            prev = Some(frame);
            continue;
        }
        if first.is_none() {
            first = Some(frame);
        }
        if frame.function == Some(FrameId::RUNNER) {
            if ctx.level() > 1 {
                if let Some(found) = ctx.continue_in_parent() {
                    return found;
                }
            }
            return prev.unwrap_or(frame);
        }
        match frame.function {
            Some(id) if ctx.is_helper(id) => {}
            _ => return frame,
        }
        prev = Some(frame);
    }
    first.unwrap_or(Frame::UNKNOWN)
}

/// Prefix `message` with the call site and indent continuation lines
pub(crate) fn decorate(frame: &Frame, message: &str) -> String {
    let file = match frame.file {
        Some(path) => path.rsplit(['/', '\\']).next().unwrap_or(path),
        None => "???",
    };
    let line = if frame.line == 0 { 1 } else { frame.line };

    let mut lines: Vec<&str> = message.split('\n').collect();
    if lines.len() > 1 && lines.last() == Some(&"") {
        lines.pop();
    }

    let mut out = format!("    {}:{}: ", file, line);
    for (i, text) in lines.iter().enumerate() {
        if i > 0 {
            out.push_str("\n        ");
        }
        out.push_str(text);
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct FakeUnit {
        helpers: HashSet<FrameId>,
        level: usize,
        cleanup: Vec<Frame>,
        parent: Option<(Box<FakeUnit>, Vec<Frame>)>,
    }

    impl Attribution for FakeUnit {
        fn is_helper(&self, function: FrameId) -> bool {
            self.helpers.contains(&function)
        }
        fn level(&self) -> usize {
            self.level
        }
        fn cleanup_site(&self) -> &[Frame] {
            &self.cleanup
        }
        fn continue_in_parent(&self) -> Option<Frame> {
            self.parent
                .as_ref()
                .map(|(parent, creator)| frame_skip(parent.as_ref(), creator))
        }
    }

    fn frame(id: FrameId, line: u32) -> Frame {
        Frame {
            function: Some(id),
            file: Some("src/bench_sort.rs"),
            line,
        }
    }

    fn unit(level: usize, helpers: &[FrameId]) -> FakeUnit {
        FakeUnit {
            helpers: helpers.iter().copied().collect(),
            level,
            cleanup: Vec::new(),
            parent: None,
        }
    }

    #[test]
    fn test_first_non_helper_frame_wins() {
        let body = FrameId::fresh();
        let helper = FrameId::fresh();
        let frames = [frame(helper, 30), frame(body, 12), frame(FrameId::RUNNER, 1)];
        assert_eq!(frame_skip(&unit(1, &[helper]), &frames).line, 12);
        assert_eq!(frame_skip(&unit(1, &[]), &frames).line, 30);
    }

    #[test]
    fn test_top_level_helper_body_stops_before_runner() {
        let body = FrameId::fresh();
        let frames = [frame(body, 12), frame(FrameId::RUNNER, 1)];
        assert_eq!(frame_skip(&unit(1, &[body]), &frames), frame(body, 12));
    }

    #[test]
    fn test_nested_helper_body_continues_in_parent() {
        let parent_body = FrameId::fresh();
        let child_body = FrameId::fresh();
        let creator = vec![frame(parent_body, 44), frame(FrameId::RUNNER, 1)];
        let mut child = unit(2, &[child_body]);
        child.parent = Some((Box::new(unit(1, &[])), creator));

        let frames = [frame(child_body, 50), frame(FrameId::RUNNER, 2)];
        assert_eq!(frame_skip(&child, &frames).line, 44);
    }

    #[test]
    fn test_parent_helpers_apply_after_handoff() {
        let grand_body = FrameId::fresh();
        let parent_body = FrameId::fresh();
        let child_body = FrameId::fresh();

        let mut parent = unit(2, &[parent_body]);
        parent.parent = Some((
            Box::new(unit(1, &[])),
            vec![frame(grand_body, 7), frame(FrameId::RUNNER, 1)],
        ));
        let mut child = unit(3, &[child_body]);
        child.parent = Some((
            Box::new(parent),
            vec![frame(parent_body, 20), frame(FrameId::RUNNER, 1)],
        ));

        let frames = [frame(child_body, 50), frame(FrameId::RUNNER, 2)];
        assert_eq!(frame_skip(&child, &frames).line, 7);
    }

    #[test]
    fn test_cleanup_frame_switches_to_registration_site() {
        let body = FrameId::fresh();
        let action = FrameId::fresh();
        let mut u = unit(1, &[action]);
        u.cleanup = vec![frame(body, 99), frame(FrameId::RUNNER, 1)];
        let frames = [frame(action, 5), frame(FrameId::CLEANUP, 3), frame(FrameId::RUNNER, 1)];
        assert_eq!(frame_skip(&u, &frames).line, 99);
    }

    #[test]
    fn test_empty_frames_are_unknown() {
        assert_eq!(frame_skip(&unit(1, &[]), &[]), Frame::UNKNOWN);
    }

    #[test]
    fn test_decorate_formats() {
        let f = frame(FrameId::RUNNER, 12);
        assert_eq!(decorate(&f, "hello"), "    bench_sort.rs:12: hello\n");
        assert_eq!(
            decorate(&f, "one\ntwo\n"),
            "    bench_sort.rs:12: one\n        two\n"
        );
        assert_eq!(decorate(&Frame::UNKNOWN, "x"), "    ???:1: x\n");
        let windows = Frame {
            function: None,
            file: Some("C:\\src\\lib.rs"),
            line: 3,
        };
        assert_eq!(decorate(&windows, "x"), "    lib.rs:3: x\n");
    }

    #[test]
    fn test_capture_reflects_shadow_stack() {
        let outer = enter(FrameId::fresh());
        let inner = enter(FrameId::fresh());
        let frames = capture(Location::caller());
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].function, Some(inner.id()));
        assert_eq!(frames[1].function, Some(outer.id()));
        assert_eq!(current(), Some(inner.id()));
        drop(inner);
        assert_eq!(current(), Some(outer.id()));
        drop(outer);
        assert_eq!(current(), None);
    }
}
