//! Units formatting and conversion utilities
//!
//! Provides the human-readable renderings used by benchmark result lines:
//! time per operation, metric pretty printing and durations.

use std::time::Duration;

/// Format a nanoseconds-per-operation value, picking the unit by magnitude
///
/// # Examples
/// ```
/// use benchkit::util::units::format_time_per_op;
///
/// assert_eq!(format_time_per_op(17.8), "17.80 ns/op");
/// assert_eq!(format_time_per_op(1_500.0), "1.500 µs/op");
/// assert_eq!(format_time_per_op(2_000_000.0), "2.000 ms/op");
/// ```
pub fn format_time_per_op(ns: f64) -> String {
    let magnitude = ns.abs();
    if magnitude <= 1e3 {
        format!("{:.2} ns/op", ns)
    } else if magnitude <= 1e6 {
        format!("{:.3} µs/op", ns / 1e3)
    } else if magnitude <= 1e9 {
        format!("{:.3} ms/op", ns / 1e6)
    } else {
        format!("{:.3} s/op", ns / 1e9)
    }
}

/// Pretty print a metric value with 10 places before the decimal point
/// and three significant figures for small numbers
///
/// # Examples
/// ```
/// use benchkit::util::units::pretty_print;
///
/// assert_eq!(pretty_print(1234.0, "items/op"), "      1234 items/op");
/// assert_eq!(pretty_print(1.5, "hits/op"), "         1.50 hits/op");
/// ```
pub fn pretty_print(x: f64, unit: &str) -> String {
    let y = x.abs();
    if y == 0.0 || y >= 99.95 {
        format!("{:10.0} {}", x, unit)
    } else if y >= 9.995 {
        format!("{:12.1} {}", x, unit)
    } else if y >= 0.9995 {
        format!("{:13.2} {}", x, unit)
    } else if y >= 0.09995 {
        format!("{:14.3} {}", x, unit)
    } else if y >= 0.009995 {
        format!("{:15.4} {}", x, unit)
    } else if y >= 0.0009995 {
        format!("{:16.5} {}", x, unit)
    } else {
        format!("{:17.6} {}", x, unit)
    }
}

/// Format a duration as seconds with two decimals, as used in unit summaries
///
/// # Examples
/// ```
/// use std::time::Duration;
/// use benchkit::util::units::format_seconds;
///
/// assert_eq!(format_seconds(Duration::from_millis(1500)), "1.50s");
/// ```
pub fn format_seconds(duration: Duration) -> String {
    format!("{:.2}s", duration.as_secs_f64())
}

/// Format a duration as fractional milliseconds
pub fn format_millis(duration: Duration) -> String {
    format!("{:.3}", duration.as_secs_f64() * 1e3)
}

/// Parse a duration string such as "1s", "250ms" or "1m 30s"
///
/// # Examples
/// ```
/// use std::time::Duration;
/// use benchkit::util::units::parse_duration;
///
/// assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
/// assert_eq!(parse_duration("1m 30s").unwrap(), Duration::from_secs(90));
/// ```
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(input).map_err(|e| format!("invalid duration {:?}: {}", input, e))
}
