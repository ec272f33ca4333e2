//! Benchmark engine module
//!
//! Contains the benchmark unit, name matching and the process-level driver.

pub mod b;
pub mod driver;
pub mod matcher;

// Re-export commonly used types
pub use b::{benchmark, BenchFn, BenchGroup, BenchSettings, B, PB};
pub use driver::{Deps, Driver, InternalBenchmark};
pub use matcher::{MatchString, Matcher, RegexMatcher};
