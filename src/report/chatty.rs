//! Serialized output for concurrently running units
//!
//! All unit output goes through one writer behind one mutex, so lines from
//! different units never interleave and appear in lock-acquisition order.
//! When output switches from one unit to another, a `=== CONT  <name>` marker
//! tells the reader whose output follows.

use std::fmt;
use std::io::Write;
use std::sync::{Mutex, PoisonError};

struct Inner {
    w: Box<dyn Write + Send>,
    last_name: String,
}

/// Line-oriented printer shared by every unit of a run
pub struct ChattyPrinter {
    inner: Mutex<Inner>,
}

impl fmt::Debug for ChattyPrinter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChattyPrinter").finish_non_exhaustive()
    }
}

impl ChattyPrinter {
    pub fn new<W: Write + Send + 'static>(w: W) -> Self {
        Self {
            inner: Mutex::new(Inner {
                w: Box::new(w),
                last_name: String::new(),
            }),
        }
    }

    /// Printer writing to standard output
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    /// Print a status message that already names `unit_name`
    pub fn updatef(&self, unit_name: &str, args: fmt::Arguments<'_>) {
        let mut inner = self.lock();
        inner.last_name.clear();
        inner.last_name.push_str(unit_name);
        emit(&mut inner.w, args);
    }

    /// Print a message produced by `unit_name`, preceded by a continuation
    /// marker if the previous message came from a different unit
    pub fn printf(&self, unit_name: &str, args: fmt::Arguments<'_>) {
        let mut inner = self.lock();
        if inner.last_name.is_empty() {
            inner.last_name.push_str(unit_name);
        } else if inner.last_name != unit_name {
            emit(&mut inner.w, format_args!("=== CONT  {}\n", unit_name));
            inner.last_name.clear();
            inner.last_name.push_str(unit_name);
        }
        emit(&mut inner.w, args);
    }

    /// Print text not attributed to any unit
    pub fn write_raw(&self, text: &str) {
        let mut inner = self.lock();
        emit(&mut inner.w, format_args!("{}", text));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn emit(w: &mut Box<dyn Write + Send>, args: fmt::Arguments<'_>) {
    // Nothing useful can be done if the report stream itself is gone.
    if let Err(err) = w.write_fmt(args).and_then(|_| w.flush()) {
        tracing::warn!(error = %err, "failed to write report output");
    }
}
