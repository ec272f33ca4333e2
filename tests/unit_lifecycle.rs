use benchkit::report::{ChattyPrinter, SharedBuffer};
use benchkit::unit::{PanicHandling, RunContext};
use benchkit::{BenchkitError, Unit};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn root(chatty: bool) -> (Unit, SharedBuffer) {
    let buffer = SharedBuffer::default();
    let printer = Arc::new(ChattyPrinter::new(buffer.clone()));
    let context = Arc::new(RunContext::new(printer, chatty, 4));
    (Unit::root(context, "Main"), buffer)
}

/// Fails `u` when `n` is odd and returns the line of that report.
fn check_even(u: &Unit, n: u32, mark_helper: bool) -> u32 {
    if mark_helper {
        u.helper();
    }
    if n % 2 != 0 {
        u.errorf(format_args!("{} is odd", n));
    }
    line!() - 2
}

#[test]
fn test_marked_helper_attributed_to_calling_line() {
    let (root, buffer) = root(false);
    let mut call_line = 0;
    let mut report_line = 0;
    root.run("Helper", |u| {
        call_line = line!() + 1;
        report_line = u.frame(|| check_even(u, 3, true));
    });
    let out = buffer.contents();
    assert!(
        out.contains(&format!("    unit_lifecycle.rs:{}: 3 is odd\n", call_line)),
        "{out}"
    );
    assert!(
        !out.contains(&format!("unit_lifecycle.rs:{}:", report_line)),
        "{out}"
    );
}

#[test]
fn test_unmarked_helper_reports_its_own_line() {
    let (root, buffer) = root(false);
    let mut call_line = 0;
    let mut report_line = 0;
    root.run("Plain", |u| {
        call_line = line!() + 1;
        report_line = u.frame(|| check_even(u, 3, false));
    });
    let out = buffer.contents();
    assert!(
        out.contains(&format!("    unit_lifecycle.rs:{}: 3 is odd\n", report_line)),
        "{out}"
    );
    assert!(
        !out.contains(&format!("unit_lifecycle.rs:{}:", call_line)),
        "{out}"
    );
}

#[test]
fn test_helper_body_attributed_to_parent_call_site() {
    let (root, buffer) = root(false);
    let mut line = 0;
    root.run("Outer", |outer| {
        line = line!() + 1;
        outer.run("inner", |inner| {
            inner.helper();
            inner.error("from a helper body");
        });
    });
    let out = buffer.contents();
    assert!(out.contains("--- FAIL: Outer"), "{out}");
    assert!(out.contains("--- FAIL: Outer/inner"), "{out}");
    assert!(
        out.contains(&format!("unit_lifecycle.rs:{}: from a helper body", line)),
        "{out}"
    );
}

#[test]
fn test_cleanup_failure_attributed_to_registration() {
    let (root, buffer) = root(false);
    let mut line = 0;
    root.run("Cleanup", |u| {
        let v = u.clone();
        line = line!() + 1;
        u.cleanup(move || v.error("teardown failed"));
    });
    let out = buffer.contents();
    assert!(
        out.contains(&format!("unit_lifecycle.rs:{}: teardown failed", line)),
        "{out}"
    );
}

#[test]
fn test_temp_dirs_numbered_under_one_base_and_removed() {
    let (root, _) = root(false);
    let dirs = Arc::new(Mutex::new(Vec::<PathBuf>::new()));
    let seen = Arc::clone(&dirs);
    let ok = root.run("Temp/dirs:x", move |u| {
        let a = u.temp_dir();
        let b = u.temp_dir();
        assert!(a.is_dir() && b.is_dir());
        assert_eq!(a.parent(), b.parent());
        assert!(a.ends_with("001"));
        assert!(b.ends_with("002"));
        let base = a.parent().unwrap().file_name().unwrap().to_string_lossy().into_owned();
        assert!(base.starts_with("Temp_dirs_x"), "{base}");
        seen.lock().unwrap().extend([a, b]);
    });
    assert!(ok);
    for dir in dirs.lock().unwrap().iter() {
        assert!(!dir.exists());
        assert!(!dir.parent().unwrap().exists());
    }
}

#[test]
fn test_cleanup_runs_after_skip() {
    let (root, _) = root(false);
    let ran = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&ran);
    let mut child = None;
    let ok = root.run("Skipped", |u| {
        child = Some(u.clone());
        let flag = Arc::clone(&flag);
        u.cleanup(move || *flag.lock().unwrap() = true);
        u.skip("not today");
    });
    assert!(ok);
    assert!(*ran.lock().unwrap());
    let child = child.unwrap();
    assert!(child.skipped());
    assert!(!child.failed());
}

#[test]
fn test_run_cleanup_recover_returns_panic() {
    let (root, _) = root(false);
    root.cleanup(|| {});
    root.cleanup(|| panic!("second registered runs first"));
    let payload = root.run_cleanup(PanicHandling::Recover).unwrap();
    assert_eq!(
        payload.downcast_ref::<&str>(),
        Some(&"second registered runs first")
    );
    // The chain is detached once run.
    assert!(root.run_cleanup(PanicHandling::Recover).is_none());
}

#[test]
fn test_failure_is_monotonic_and_propagates() {
    let (root, _) = root(false);
    root.run("Outer", |outer| {
        outer.run("inner", |inner| inner.fail());
        assert!(outer.failed());
        outer.log("still running");
    });
    assert!(root.failed());
}

#[test]
fn test_skip_after_done_is_state_violation() {
    let (root, _) = root(false);
    let mut child = None;
    root.run("Done", |u| child = Some(u.clone()));
    let child = child.unwrap();
    let payload = panic::catch_unwind(AssertUnwindSafe(|| {
        child.skip_now();
    }))
    .unwrap_err();
    assert!(matches!(
        payload.downcast_ref::<BenchkitError>(),
        Some(BenchkitError::StateViolation(_))
    ));
}

#[test]
fn test_chatty_parallel_output_marks_continuations() {
    let (root, buffer) = root(true);
    root.run("Par", |par| {
        par.group(|g| {
            for name in ["a", "b"] {
                g.run(name, |u| {
                    for i in 0..3 {
                        u.logf(format_args!("step {}", i));
                        std::thread::sleep(Duration::from_millis(2));
                    }
                });
            }
        });
    });
    let out = buffer.contents();
    assert!(out.contains("=== RUN   Par/a\n"), "{out}");
    assert!(out.contains("=== RUN   Par/b\n"), "{out}");
    assert!(out.contains("=== CONT  Par/"), "{out}");
    assert!(out.contains("--- PASS: Par/a"), "{out}");
    assert!(out.contains("--- PASS: Par "), "{out}");
}

#[tokio::test]
async fn test_cancel_token_wakes_spawned_task() {
    let (root, _) = root(false);
    let mut token = None;
    root.run("Cancel", |u| token = Some(u.cancel_token()));
    let mut token = token.unwrap();
    tokio::time::timeout(Duration::from_secs(1), token.cancelled())
        .await
        .expect("token should already be cancelled");
}
