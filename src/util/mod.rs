//! Utility functions module
//!
//! Contains helper functions for units formatting and duration parsing.

pub mod units;

// Re-export commonly used functions
pub use units::{format_millis, format_seconds, format_time_per_op, parse_duration, pretty_print};
