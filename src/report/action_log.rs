//! JSON-lines log of unit actions
//!
//! One event per line: when a unit starts, produces streamed output, and
//! when it ends (pass, fail, skip, or a benchmark result).

use crate::{BenchkitError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Kind of unit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Run,
    Output,
    Pass,
    Fail,
    Skip,
    Bench,
}

/// One line of the action log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub time: DateTime<Utc>,
    pub action: Action,
    pub name: String,
    /// Seconds since the unit started, on terminal actions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<f64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
}

/// Open action log file
#[derive(Debug)]
pub struct ActionLog {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl ActionLog {
    /// Create `path`, truncating it, or append to it when `append` is set
    pub fn open(path: impl AsRef<Path>, append: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = if append {
            OpenOptions::new().append(true).create(true).open(&path)
        } else {
            File::create(&path)
        }
        .map_err(|e| {
            BenchkitError::ResourceError(format!("opening action log {}: {}", path.display(), e))
        })?;

        Ok(Self {
            path,
            writer: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. Write failures are logged and otherwise ignored.
    pub fn event(&self, action: Action, name: &str, elapsed: Option<Duration>, output: &str) {
        let event = Event {
            time: Utc::now(),
            action,
            name: name.to_string(),
            elapsed: elapsed.map(|d| d.as_secs_f64()),
            output: output.to_string(),
        };
        if let Err(err) = self.write_event(&event) {
            tracing::warn!(path = %self.path.display(), error = %err, "action log write failed");
        }
    }

    fn write_event(&self, event: &Event) -> Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(w) = writer.as_mut() {
            serde_json::to_writer(&mut *w, event)?;
            w.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Flush and close the log. Later events are dropped.
    pub fn close(&self) -> Result<()> {
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(w) = writer {
            let file = w.into_inner().map_err(|e| {
                BenchkitError::ResourceError(format!("writing {}: {}", self.path.display(), e.error()))
            })?;
            file.sync_all()?;
        }
        Ok(())
    }
}

/// Read every event of an action log file
pub fn read_events(path: impl AsRef<Path>) -> Result<Vec<Event>> {
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(BenchkitError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_events_written_as_json_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("actions.jsonl");
        let log = ActionLog::open(&path, false).unwrap();
        log.event(Action::Run, "BenchmarkA", None, "");
        log.event(Action::Bench, "BenchmarkA", Some(Duration::from_millis(1500)), "result\n");
        log.close().unwrap();

        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, Action::Run);
        assert_eq!(events[0].elapsed, None);
        assert_eq!(events[1].elapsed, Some(1.5));
        assert_eq!(events[1].output, "result\n");

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.lines().next().unwrap().contains("\"action\":\"run\""));
    }

    #[test]
    fn test_append_keeps_previous_events() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("actions.jsonl");
        for _ in 0..2 {
            let log = ActionLog::open(&path, true).unwrap();
            log.event(Action::Pass, "BenchmarkA", Some(Duration::ZERO), "");
            log.close().unwrap();
        }
        assert_eq!(read_events(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_events_after_close_are_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("actions.jsonl");
        let log = ActionLog::open(&path, false).unwrap();
        log.close().unwrap();
        log.event(Action::Fail, "BenchmarkA", None, "");
        assert!(read_events(&path).unwrap().is_empty());
    }

    #[test]
    fn test_open_in_missing_directory_is_resource_error() {
        let dir = TempDir::new().unwrap();
        let err = ActionLog::open(dir.path().join("missing/actions.jsonl"), false).unwrap_err();
        assert!(matches!(err, BenchkitError::ResourceError(_)));
    }
}
