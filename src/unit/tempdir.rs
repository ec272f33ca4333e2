//! Per-unit temporary directories

use super::{frames, Unit};
use crate::{BenchkitError, Result};
use std::fs;
use std::panic::Location;
use std::path::PathBuf;

impl Unit {
    /// Create a fresh directory for this unit. The first call creates a base
    /// directory that is removed by a cleanup; every call returns a new
    /// numbered directory inside it. Failure fails the unit immediately.
    #[track_caller]
    pub fn temp_dir(&self) -> PathBuf {
        match self.try_temp_dir() {
            Ok(dir) => dir,
            Err(err) => self.fatalf(format_args!("TempDir: {}", err)),
        }
    }

    /// Like `temp_dir`, but returns the error instead of failing the unit
    #[track_caller]
    pub fn try_temp_dir(&self) -> Result<PathBuf> {
        let caller = Location::caller();
        let mut state = self.write();

        let base_path = match &state.temp_base {
            Some(base) => base.path().to_path_buf(),
            None => {
                let base = tempfile::Builder::new()
                    .prefix(&base_pattern(self.name()))
                    .tempdir()
                    .map_err(|e| {
                        BenchkitError::ResourceError(format!("creating base directory: {}", e))
                    })?;
                let path = base.path().to_path_buf();
                state.temp_base = Some(base);

                let unit = self.clone();
                state
                    .cleanups
                    .register(move || unit.remove_temp_base(), frames::capture(caller));
                path
            }
        };

        // The sequence keeps counting across base directories.
        state.temp_seq += 1;
        let dir = base_path.join(format!("{:03}", state.temp_seq));
        drop(state);

        fs::create_dir(&dir).map_err(|e| {
            BenchkitError::ResourceError(format!("creating {}: {}", dir.display(), e))
        })?;
        Ok(dir)
    }

    fn remove_temp_base(&self) {
        self.helper();
        let base = self.write().temp_base.take();
        if let Some(base) = base {
            let path = base.path().to_path_buf();
            if let Err(err) = base.close() {
                self.errorf(format_args!("TempDir RemoveAll cleanup of {}: {}", path.display(), err));
            }
        }
    }
}

/// Directory-name prefix derived from a unit name
fn base_pattern(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_pattern_replaces_separators() {
        assert_eq!(base_pattern("BenchmarkRead/size:4K\\x"), "BenchmarkRead_size_4K_x");
    }
}
