//! Data models module
//!
//! Contains the benchmark result structure and its derived metrics.

pub mod result;

// Re-export commonly used types
pub use result::{benchmark_name, BenchmarkResult};
