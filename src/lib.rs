//! benchkit - concurrent benchmark harness
//!
//! Runs named benchmark units with per-unit lifecycle state (fail/skip,
//! buffered or streamed output, cleanup chains, temporary directories),
//! aggregates their results into a process exit code, and provides an
//! adaptive-precision timer that measures the steady-state latency of an
//! operation without a caller-supplied iteration count.

use std::fmt;

// Public re-exports
pub mod alloc;
pub mod bench;
pub mod config;
pub mod models;
pub mod profile;
pub mod report;
pub mod timer;
pub mod unit;
pub mod util;

pub use bench::{Driver, InternalBenchmark, B};
pub use config::Config;
pub use models::BenchmarkResult;
pub use timer::{bench, Measurement, Timer};
pub use unit::{Unit, TB};

/// Boxed error produced by a measured operation
pub type OperationError = Box<dyn std::error::Error + Send + Sync>;

// Common error types
#[derive(Debug)]
pub enum BenchkitError {
    /// I/O operation failed
    IoError(std::io::Error),
    /// Configuration validation or parsing error
    ConfigError(String),
    /// The measured operation failed during an adaptive measurement
    OperationFailure {
        /// One-based iteration at which the operation failed
        iteration: usize,
        /// Error returned by the operation
        source: OperationError,
    },
    /// The adaptive measurement did not stabilize within the iteration cap
    ConvergenceLimitExceeded {
        /// Last computed average, a best-effort estimate only
        estimate: Measurement,
    },
    /// Temporary directory or profile file could not be created or written
    ResourceError(String),
    /// A unit was mutated after it completed
    StateViolation(String),
    /// Action log or result serialization error
    PersistenceError(String),
}

impl fmt::Display for BenchkitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BenchkitError::IoError(err) => write!(f, "I/O error: {}", err),
            BenchkitError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            BenchkitError::OperationFailure { iteration, source } => write!(
                f,
                "benchmarked function failed at iteration {}: {}",
                iteration, source
            ),
            BenchkitError::ConvergenceLimitExceeded { estimate } => write!(
                f,
                "exceed the limit: no convergence after {} iterations (last average {:?})",
                estimate.n, estimate.speed
            ),
            BenchkitError::ResourceError(msg) => write!(f, "Resource error: {}", msg),
            BenchkitError::StateViolation(msg) => write!(f, "State violation: {}", msg),
            BenchkitError::PersistenceError(msg) => write!(f, "Persistence error: {}", msg),
        }
    }
}

impl std::error::Error for BenchkitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BenchkitError::IoError(err) => Some(err),
            BenchkitError::OperationFailure { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BenchkitError {
    fn from(err: std::io::Error) -> Self {
        BenchkitError::IoError(err)
    }
}

impl From<serde_json::Error> for BenchkitError {
    fn from(err: serde_json::Error) -> Self {
        BenchkitError::PersistenceError(format!("JSON serialization error: {}", err))
    }
}

impl From<toml::de::Error> for BenchkitError {
    fn from(err: toml::de::Error) -> Self {
        BenchkitError::ConfigError(format!("TOML parsing error: {}", err))
    }
}

impl From<regex::Error> for BenchkitError {
    fn from(err: regex::Error) -> Self {
        BenchkitError::ConfigError(format!("invalid pattern: {}", err))
    }
}

impl BenchkitError {
    /// Process exit code a driver-level failure of this kind maps to
    pub fn exit_code(&self) -> i32 {
        match self {
            BenchkitError::ConfigError(_)
            | BenchkitError::ResourceError(_)
            | BenchkitError::IoError(_)
            | BenchkitError::PersistenceError(_) => EXIT_SETUP_FAILURE,
            BenchkitError::OperationFailure { .. }
            | BenchkitError::ConvergenceLimitExceeded { .. }
            | BenchkitError::StateViolation(_) => EXIT_FAILED,
        }
    }

    /// Best-effort estimate carried by a convergence-limit failure
    pub fn estimate(&self) -> Option<&Measurement> {
        match self {
            BenchkitError::ConvergenceLimitExceeded { estimate } => Some(estimate),
            _ => None,
        }
    }
}

/// Result type alias for benchkit operations
pub type Result<T> = std::result::Result<T, BenchkitError>;

// Common types and constants
pub const APP_NAME: &str = "benchkit";
pub const CONFIG_FILE: &str = "benchkit.toml";
pub const EXIT_PASSED: i32 = 0;
pub const EXIT_FAILED: i32 = 1;
pub const EXIT_SETUP_FAILURE: i32 = 2;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_exit_codes_by_kind() {
        assert_eq!(BenchkitError::ConfigError("x".into()).exit_code(), 2);
        assert_eq!(BenchkitError::ResourceError("x".into()).exit_code(), 2);
        assert_eq!(BenchkitError::StateViolation("x".into()).exit_code(), 1);
    }

    #[test]
    fn test_operation_failure_names_iteration() {
        let err = BenchkitError::OperationFailure {
            iteration: 7,
            source: "disk full".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("iteration 7"));
        assert!(msg.contains("disk full"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_estimate_only_on_convergence_limit() {
        let estimate = Measurement {
            n: 100,
            speed: Duration::from_micros(3),
        };
        let err = BenchkitError::ConvergenceLimitExceeded { estimate };
        assert_eq!(err.estimate(), Some(&estimate));
        assert!(BenchkitError::ResourceError("x".into()).estimate().is_none());
    }
}
