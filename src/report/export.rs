//! Benchmark results export
//!
//! Saves the results of a run as a versioned JSON document and loads it back.

use crate::models::BenchmarkResult;
use crate::{BenchkitError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// One benchmark's result under its full name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedResult {
    pub name: String,
    pub procs: usize,
    #[serde(flatten)]
    pub result: BenchmarkResult,
}

/// Results file structure for JSON persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsFile {
    pub version: u32,
    pub recorded_at: DateTime<Utc>,
    /// Package the benchmarks belong to, if known
    #[serde(default)]
    pub import_path: String,
    pub results: Vec<NamedResult>,
}

impl ResultsFile {
    pub fn new(import_path: impl Into<String>, results: Vec<NamedResult>) -> Self {
        Self {
            version: 1,
            recorded_at: Utc::now(),
            import_path: import_path.into(),
            results,
        }
    }
}

/// Results file at a fixed path
#[derive(Debug)]
pub struct ResultsStorage {
    results_path: PathBuf,
}

impl ResultsStorage {
    pub fn new(results_path: impl Into<PathBuf>) -> Self {
        Self {
            results_path: results_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.results_path
    }

    /// Write `file`, creating parent directories as needed
    pub fn save(&self, file: &ResultsFile) -> Result<()> {
        if let Some(parent) = self.results_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    BenchkitError::ResourceError(format!(
                        "Failed to create results directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let content = serde_json::to_string_pretty(file)?;
        fs::write(&self.results_path, content).map_err(|e| {
            BenchkitError::ResourceError(format!(
                "Failed to write results file {}: {}",
                self.results_path.display(),
                e
            ))
        })
    }

    pub fn load(&self) -> Result<ResultsFile> {
        let content = fs::read_to_string(&self.results_path).map_err(|e| {
            BenchkitError::PersistenceError(format!(
                "Failed to read results file {}: {}",
                self.results_path.display(),
                e
            ))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            BenchkitError::PersistenceError(format!(
                "Failed to parse results file {}: {}",
                self.results_path.display(),
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_save_then_load() {
        let temp = TempDir::new().unwrap();
        let storage = ResultsStorage::new(temp.path().join("out/results.json"));
        let mut result = BenchmarkResult::new(1000, Duration::from_millis(2));
        result.extra.insert("items/op".to_string(), 3.0);
        let file = ResultsFile::new(
            "benchkit/demo",
            vec![NamedResult {
                name: "BenchmarkSort".to_string(),
                procs: 4,
                result,
            }],
        );

        storage.save(&file).unwrap();
        assert_eq!(storage.load().unwrap(), file);
    }

    #[test]
    fn test_load_missing_file_is_persistence_error() {
        let temp = TempDir::new().unwrap();
        let storage = ResultsStorage::new(temp.path().join("none.json"));
        assert!(matches!(
            storage.load().unwrap_err(),
            BenchkitError::PersistenceError(_)
        ));
    }
}
