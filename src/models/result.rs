//! Benchmark result data model
//!
//! Holds the raw counters of one benchmark run and derives the per-operation
//! metrics reported on result lines and in CSV exports.

use crate::util::units::{format_time_per_op, pretty_print};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::time::Duration;

/// Metric keys with a built-in derivation
pub const NS_PER_OP: &str = "ns/op";
pub const MB_PER_SEC: &str = "MB/s";
pub const ALLOCS_PER_OP: &str = "allocs/op";
pub const BYTES_PER_OP: &str = "B/op";

/// Results of a benchmark run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    /// The number of iterations
    pub n: u64,
    /// The total time taken
    #[serde(with = "duration_serde")]
    pub t: Duration,
    /// Bytes processed in one iteration
    pub bytes: i64,
    /// The total number of memory allocations
    pub mem_allocs: u64,
    /// The total number of bytes allocated
    pub mem_bytes: u64,
    /// Additional metrics reported with `B::report_metric`; they override
    /// the built-in metrics of the same name
    pub extra: BTreeMap<String, f64>,
}

impl BenchmarkResult {
    /// Create a result from an iteration count and total elapsed time
    pub fn new(n: u64, t: Duration) -> Self {
        Self {
            n,
            t,
            ..Self::default()
        }
    }

    /// The "ns/op" metric
    pub fn ns_per_op(&self) -> i64 {
        if let Some(v) = self.extra.get(NS_PER_OP) {
            return *v as i64;
        }
        if self.n == 0 {
            return 0;
        }
        (self.t.as_nanos() / u128::from(self.n)) as i64
    }

    /// The "MB/s" metric
    pub fn mb_per_sec(&self) -> f64 {
        if let Some(v) = self.extra.get(MB_PER_SEC) {
            return *v;
        }
        if self.bytes <= 0 || self.t.is_zero() || self.n == 0 {
            return 0.0;
        }
        (self.bytes as f64 * self.n as f64 / 1e6) / self.t.as_secs_f64()
    }

    /// The "allocs/op" metric, `mem_allocs / n`
    pub fn allocs_per_op(&self) -> i64 {
        if let Some(v) = self.extra.get(ALLOCS_PER_OP) {
            return *v as i64;
        }
        if self.n == 0 {
            return 0;
        }
        (self.mem_allocs / self.n) as i64
    }

    /// The "B/op" metric, `mem_bytes / n`
    pub fn alloced_bytes_per_op(&self) -> i64 {
        if let Some(v) = self.extra.get(BYTES_PER_OP) {
            return *v as i64;
        }
        if self.n == 0 {
            return 0;
        }
        (self.mem_bytes / self.n) as i64
    }

    /// Allocation metrics in result-line format
    pub fn mem_string(&self) -> String {
        format!(
            "{:8} B/op\t{:8} allocs/op",
            self.alloced_bytes_per_op(),
            self.allocs_per_op()
        )
    }

    /// One CSV record: name, N, ns/op, bytes/op, allocs/op
    pub fn csv_record(&self, name: &str) -> [String; 5] {
        [
            name.to_string(),
            self.n.to_string(),
            self.ns_per_op().to_string(),
            self.alloced_bytes_per_op().to_string(),
            self.allocs_per_op().to_string(),
        ]
    }

    /// Write the CSV record as one comma-separated line
    pub fn write_csv<W: Write>(&self, w: &mut W, name: &str) -> std::io::Result<()> {
        let fields: Vec<String> = self.csv_record(name).iter().map(|f| csv_escape(f)).collect();
        writeln!(w, "{}", fields.join(","))
    }

    fn float_ns_per_op(&self) -> f64 {
        match self.extra.get(NS_PER_OP) {
            Some(v) => *v,
            None if self.n == 0 => 0.0,
            None => self.t.as_nanos() as f64 / self.n as f64,
        }
    }
}

impl fmt::Display for BenchmarkResult {
    /// Summary of the results, not including the benchmark name or the
    /// allocation metrics (see `mem_string`)
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:8}", self.n)?;

        let ns = self.float_ns_per_op();
        if ns != 0.0 {
            write!(f, "\t{:>15}", format_time_per_op(ns))?;
        }

        let mbs = self.mb_per_sec();
        if mbs != 0.0 {
            write!(f, "\t{:7.2} MB/s", mbs)?;
        }

        // Extra metrics not represented by the standard ones; BTreeMap keeps them sorted.
        for (key, value) in &self.extra {
            if matches!(
                key.as_str(),
                NS_PER_OP | MB_PER_SEC | BYTES_PER_OP | ALLOCS_PER_OP
            ) {
                continue;
            }
            write!(f, "\t{}", pretty_print(*value, key))?;
        }
        Ok(())
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Full benchmark name including the parallelism suffix
pub fn benchmark_name(name: &str, procs: usize) -> String {
    if procs != 1 {
        format!("{}-{}", name, procs)
    } else {
        name.to_string()
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_nanos() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let nanos = u64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(nanos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BenchmarkResult {
        BenchmarkResult {
            n: 100,
            t: Duration::from_millis(100),
            bytes: 0,
            mem_allocs: 500,
            mem_bytes: 2000,
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn test_csv_record_column_order() {
        assert_eq!(
            sample().csv_record("name"),
            ["name", "100", "1000000", "20", "5"]
        );
    }

    #[test]
    fn test_write_csv_escapes_name() {
        let mut out = Vec::new();
        sample().write_csv(&mut out, "a,b").unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "\"a,b\",100,1000000,20,5\n");
    }

    #[test]
    fn test_derived_metrics_zero_when_n_is_zero() {
        let result = BenchmarkResult::new(0, Duration::from_secs(1));
        assert_eq!(result.ns_per_op(), 0);
        assert_eq!(result.allocs_per_op(), 0);
        assert_eq!(result.alloced_bytes_per_op(), 0);
        assert_eq!(result.mb_per_sec(), 0.0);
    }

    #[test]
    fn test_mb_per_sec_zero_bytes() {
        let mut result = sample();
        result.bytes = 0;
        assert_eq!(result.mb_per_sec(), 0.0);
        result.t = Duration::ZERO;
        assert_eq!(result.mb_per_sec(), 0.0);
    }

    #[test]
    fn test_mb_per_sec() {
        let mut result = BenchmarkResult::new(1000, Duration::from_secs(1));
        result.bytes = 1_000;
        assert!((result.mb_per_sec() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_extra_overrides_builtin() {
        let mut result = sample();
        result.extra.insert(NS_PER_OP.to_string(), 42.0);
        result.extra.insert(ALLOCS_PER_OP.to_string(), 7.0);
        assert_eq!(result.ns_per_op(), 42);
        assert_eq!(result.allocs_per_op(), 7);
        assert_eq!(result.alloced_bytes_per_op(), 20);
    }

    #[test]
    fn test_display_picks_unit_and_sorts_extra() {
        let mut result = sample();
        result.extra.insert("zeta/op".to_string(), 2.0);
        result.extra.insert("alpha/op".to_string(), 200.0);
        let line = result.to_string();
        assert!(line.starts_with("     100\t"));
        assert!(line.contains("1.000 ms/op"));
        assert!(!line.contains("MB/s"));
        let alpha = line.find("alpha/op").unwrap();
        let zeta = line.find("zeta/op").unwrap();
        assert!(alpha < zeta);
    }

    #[test]
    fn test_mem_string() {
        assert_eq!(
            sample().mem_string(),
            "      20 B/op\t       5 allocs/op"
        );
    }

    #[test]
    fn test_benchmark_name_suffix() {
        assert_eq!(benchmark_name("BenchmarkSort", 1), "BenchmarkSort");
        assert_eq!(benchmark_name("BenchmarkSort", 8), "BenchmarkSort-8");
    }

    #[test]
    fn test_json_round_trip_keeps_duration_nanos() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert!(json.contains("\"t\":100000000"));
        let back: BenchmarkResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample());
    }
}
