//! Configuration management module
//!
//! Command-line flags are parsed once with clap and layered over optional
//! defaults from a `benchkit.toml` file, then validated into an immutable
//! [`Config`] that is passed explicitly to the driver.

use crate::profile::ProfileKind;
use crate::util::parse_duration;
use crate::{BenchkitError, Result, APP_NAME, CONFIG_FILE};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// How long each benchmark should run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenchTime {
    /// Grow the iteration count until the total run time reaches this
    Duration(Duration),
    /// Run exactly this many iterations
    Count(u64),
}

impl Default for BenchTime {
    fn default() -> Self {
        BenchTime::Duration(Duration::from_secs(1))
    }
}

impl FromStr for BenchTime {
    type Err = BenchkitError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(count) = s.strip_suffix('x') {
            return match count.parse::<u64>() {
                Ok(n) if n > 0 => Ok(BenchTime::Count(n)),
                _ => Err(BenchkitError::ConfigError(format!(
                    "invalid count {:?} for --benchtime",
                    s
                ))),
            };
        }
        match parse_duration(s) {
            Ok(d) if !d.is_zero() => Ok(BenchTime::Duration(d)),
            Ok(_) => Err(BenchkitError::ConfigError(format!(
                "invalid duration {:?} for --benchtime: must be positive",
                s
            ))),
            Err(e) => Err(BenchkitError::ConfigError(format!(
                "invalid duration {:?} for --benchtime: {}",
                s, e
            ))),
        }
    }
}

impl fmt::Display for BenchTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BenchTime::Duration(d) => write!(f, "{}", humantime::format_duration(*d)),
            BenchTime::Count(n) => write!(f, "{}x", n),
        }
    }
}

/// Command-line flags
#[derive(Parser, Debug, Clone, Default)]
#[command(name = APP_NAME)]
#[command(version, about = "Run benchmarks and report per-operation metrics")]
pub struct Flags {
    /// Tell long-running benchmarks to shorten their run time
    #[arg(long)]
    pub short: bool,

    /// Do not start new benchmarks after the first failure
    #[arg(long)]
    pub failfast: bool,

    /// Write profiles to DIR
    #[arg(long, value_name = "DIR")]
    pub outputdir: Option<PathBuf>,

    /// Stream unit output as it is produced
    #[arg(short, long)]
    pub verbose: bool,

    /// Run each benchmark N times
    #[arg(long, value_name = "N")]
    pub count: Option<u32>,

    /// Write a coverage profile to FILE
    #[arg(long, value_name = "FILE")]
    pub coverprofile: Option<PathBuf>,

    /// List benchmarks matching REGEX and exit
    #[arg(long, value_name = "REGEX")]
    pub list: Option<String>,

    /// Run only benchmarks matching REGEX
    #[arg(long, alias = "run", value_name = "REGEX")]
    pub bench: Option<String>,

    /// Run each benchmark for DURATION, or N times with the form Nx
    #[arg(long, value_name = "DURATION")]
    pub benchtime: Option<String>,

    /// Print memory allocation statistics for benchmarks
    #[arg(long)]
    pub benchmem: bool,

    /// Write an allocation profile to FILE
    #[arg(long, value_name = "FILE")]
    pub memprofile: Option<PathBuf>,

    /// Sampling rate recorded in the allocation profile
    #[arg(long, value_name = "RATE")]
    pub memprofilerate: Option<i64>,

    /// Write a CPU profile to FILE
    #[arg(long, value_name = "FILE")]
    pub cpuprofile: Option<PathBuf>,

    /// Write a blocking profile to FILE
    #[arg(long, value_name = "FILE")]
    pub blockprofile: Option<PathBuf>,

    /// Blocking profile rate; negative disables the profile
    #[arg(long, value_name = "RATE", allow_negative_numbers = true)]
    pub blockprofilerate: Option<i64>,

    /// Write a mutex contention profile to FILE
    #[arg(long, value_name = "FILE")]
    pub mutexprofile: Option<PathBuf>,

    /// Mutex profile fraction; negative disables the profile
    #[arg(long, value_name = "N", allow_negative_numbers = true)]
    pub mutexprofilefraction: Option<i64>,

    /// Write an execution trace to FILE
    #[arg(long, value_name = "FILE")]
    pub trace: Option<PathBuf>,

    /// Abort the whole run after DURATION (0 disables)
    #[arg(long, value_name = "DURATION")]
    pub timeout: Option<String>,

    /// Comma-separated list of worker counts to run each benchmark with
    #[arg(long, value_name = "LIST")]
    pub cpu: Option<String>,

    /// Maximum number of sub-benchmarks run in parallel
    #[arg(long, value_name = "N", allow_negative_numbers = true)]
    pub parallel: Option<i64>,

    /// Append unit actions as JSON lines to FILE
    #[arg(long, value_name = "FILE")]
    pub testlogfile: Option<PathBuf>,

    /// Save benchmark results as JSON to FILE
    #[arg(long, value_name = "FILE")]
    pub json: Option<PathBuf>,

    /// Read default settings from FILE instead of benchkit.toml
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

/// Defaults read from `benchkit.toml`. Flags given on the command line win.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub bench: Option<String>,
    pub benchtime: Option<String>,
    pub benchmem: Option<bool>,
    pub count: Option<u32>,
    pub cpu: Option<String>,
    pub parallel: Option<i64>,
    pub failfast: Option<bool>,
    pub short: Option<bool>,
    pub verbose: Option<bool>,
    pub outputdir: Option<PathBuf>,
    pub timeout: Option<String>,
    pub json: Option<PathBuf>,
}

impl FileConfig {
    /// Parse a defaults file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            BenchkitError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        toml::from_str(&content).map_err(|e| {
            BenchkitError::ConfigError(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Locate the defaults file: `benchkit.toml` in the working directory,
    /// then `<config dir>/benchkit/benchkit.toml`
    pub fn discover() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE);
        if local.is_file() {
            return Some(local);
        }
        let user = dirs::config_dir()?.join(APP_NAME).join(CONFIG_FILE);
        user.is_file().then_some(user)
    }
}

/// A requested profile and where to write it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRequest {
    pub kind: ProfileKind,
    pub path: PathBuf,
    pub rate: i64,
}

/// Validated, immutable run configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub short: bool,
    pub failfast: bool,
    pub output_dir: Option<PathBuf>,
    pub verbose: bool,
    pub count: u32,
    pub cover_profile: Option<PathBuf>,
    pub list: Option<String>,
    pub bench: String,
    pub benchtime: BenchTime,
    pub benchmem: bool,
    pub mem_profile: Option<PathBuf>,
    pub mem_profile_rate: i64,
    pub cpu_profile: Option<PathBuf>,
    pub block_profile: Option<PathBuf>,
    pub block_profile_rate: i64,
    pub mutex_profile: Option<PathBuf>,
    pub mutex_profile_fraction: i64,
    pub trace: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub cpu_list: Vec<usize>,
    pub parallel: usize,
    pub test_log_file: Option<PathBuf>,
    pub json_output: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let procs = available_procs();
        Self {
            short: false,
            failfast: false,
            output_dir: None,
            verbose: false,
            count: 1,
            cover_profile: None,
            list: None,
            bench: ".".to_string(),
            benchtime: BenchTime::default(),
            benchmem: false,
            mem_profile: None,
            mem_profile_rate: 0,
            cpu_profile: None,
            block_profile: None,
            block_profile_rate: 1,
            mutex_profile: None,
            mutex_profile_fraction: 1,
            trace: None,
            timeout: None,
            cpu_list: vec![procs],
            parallel: procs,
            test_log_file: None,
            json_output: None,
        }
    }
}

impl Config {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse flags from an argument list (the first item is the program name)
    pub fn from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let flags = Flags::try_parse_from(args)
            .map_err(|e| BenchkitError::ConfigError(e.to_string()))?;
        Self::from_flags(flags)
    }

    /// Layer `flags` over the defaults file and validate
    pub fn from_flags(flags: Flags) -> Result<Self> {
        let file = match flags.config.clone().or_else(FileConfig::discover) {
            Some(path) => {
                tracing::debug!(path = %path.display(), "loading defaults file");
                FileConfig::load(&path)?
            }
            None => FileConfig::default(),
        };
        Self::merge(flags, file)
    }

    /// Combine flags with file defaults; flags win
    pub fn merge(flags: Flags, file: FileConfig) -> Result<Self> {
        let defaults = Self::default();

        let benchtime = match flags.benchtime.or(file.benchtime) {
            Some(s) => s.parse()?,
            None => defaults.benchtime,
        };
        let timeout = match flags.timeout.or(file.timeout) {
            Some(s) => {
                let d = parse_duration(&s).map_err(|e| {
                    BenchkitError::ConfigError(format!("invalid duration {:?} for --timeout: {}", s, e))
                })?;
                (!d.is_zero()).then_some(d)
            }
            None => None,
        };
        let cpu_list = match flags.cpu.or(file.cpu) {
            Some(list) => parse_cpu_list(&list)?,
            None => defaults.cpu_list,
        };
        let parallel = match flags.parallel.or(file.parallel) {
            Some(n) if n < 1 => {
                return Err(BenchkitError::ConfigError(
                    "--parallel can only be given a positive integer".to_string(),
                ))
            }
            Some(n) => n as usize,
            None => defaults.parallel,
        };

        let config = Self {
            short: flags.short || file.short.unwrap_or(false),
            failfast: flags.failfast || file.failfast.unwrap_or(false),
            output_dir: flags.outputdir.or(file.outputdir),
            verbose: flags.verbose || file.verbose.unwrap_or(false),
            count: flags.count.or(file.count).unwrap_or(defaults.count),
            cover_profile: flags.coverprofile,
            list: flags.list,
            bench: flags.bench.or(file.bench).unwrap_or(defaults.bench),
            benchtime,
            benchmem: flags.benchmem || file.benchmem.unwrap_or(false),
            mem_profile: flags.memprofile,
            mem_profile_rate: flags.memprofilerate.unwrap_or(defaults.mem_profile_rate),
            cpu_profile: flags.cpuprofile,
            block_profile: flags.blockprofile,
            block_profile_rate: flags.blockprofilerate.unwrap_or(defaults.block_profile_rate),
            mutex_profile: flags.mutexprofile,
            mutex_profile_fraction: flags
                .mutexprofilefraction
                .unwrap_or(defaults.mutex_profile_fraction),
            trace: flags.trace,
            timeout,
            cpu_list,
            parallel,
            test_log_file: flags.testlogfile,
            json_output: flags.json.or(file.json),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.parallel == 0 {
            return Err(BenchkitError::ConfigError(
                "--parallel can only be given a positive integer".to_string(),
            ));
        }
        if self.cpu_list.is_empty() || self.cpu_list.contains(&0) {
            return Err(BenchkitError::ConfigError(
                "--cpu values must be positive integers".to_string(),
            ));
        }
        if let BenchTime::Count(0) = self.benchtime {
            return Err(BenchkitError::ConfigError(
                "invalid count 0x for --benchtime".to_string(),
            ));
        }
        if let Some(dir) = &self.output_dir {
            if dir.exists() && !dir.is_dir() {
                return Err(BenchkitError::ConfigError(format!(
                    "Output path is not a directory: {}",
                    dir.display()
                )));
            }
        }
        Ok(())
    }

    /// Relocate a relative output path into the output directory
    pub fn to_output_dir(&self, path: &Path) -> PathBuf {
        match &self.output_dir {
            Some(dir) if !path.as_os_str().is_empty() && !path.is_absolute() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Profiles requested by the configuration, with output paths relocated
    pub fn profiles(&self) -> Vec<ProfileRequest> {
        let mut requests = Vec::new();
        let mut push = |kind, path: &Option<PathBuf>, rate| {
            if let Some(path) = path {
                requests.push(ProfileRequest {
                    kind,
                    path: self.to_output_dir(path),
                    rate,
                });
            }
        };
        push(ProfileKind::Cpu, &self.cpu_profile, 0);
        push(ProfileKind::Trace, &self.trace, 0);
        push(ProfileKind::Allocs, &self.mem_profile, self.mem_profile_rate);
        if self.block_profile_rate >= 0 {
            push(ProfileKind::Block, &self.block_profile, self.block_profile_rate);
        }
        if self.mutex_profile_fraction >= 0 {
            push(ProfileKind::Mutex, &self.mutex_profile, self.mutex_profile_fraction);
        }
        requests
    }

    /// Set the run pattern
    pub fn with_bench(mut self, pattern: impl Into<String>) -> Self {
        self.bench = pattern.into();
        self
    }

    /// Set the benchmark time
    pub fn with_benchtime(mut self, benchtime: BenchTime) -> Self {
        self.benchtime = benchtime;
        self
    }

    /// Set the worker counts each benchmark runs with
    pub fn with_cpu_list(mut self, cpu_list: Vec<usize>) -> Self {
        self.cpu_list = cpu_list;
        self
    }

    /// Set the repeat count
    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    /// Set fail-fast mode
    pub fn with_failfast(mut self, failfast: bool) -> Self {
        self.failfast = failfast;
        self
    }

    /// Set verbose (streaming) output
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Set the parallel sub-benchmark limit
    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self
    }

    /// Always report allocation metrics
    pub fn with_benchmem(mut self, benchmem: bool) -> Self {
        self.benchmem = benchmem;
        self
    }

    /// Set list mode
    pub fn with_list(mut self, pattern: impl Into<String>) -> Self {
        self.list = Some(pattern.into());
        self
    }
}

/// Parse a comma-separated list of positive worker counts
pub fn parse_cpu_list(list: &str) -> Result<Vec<usize>> {
    let mut cpus = Vec::new();
    for value in list.split(',') {
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match value.parse::<usize>() {
            Ok(n) if n > 0 => cpus.push(n),
            _ => {
                return Err(BenchkitError::ConfigError(format!(
                    "invalid value {:?} for --cpu",
                    value
                )))
            }
        }
    }
    if cpus.is_empty() {
        cpus.push(available_procs());
    }
    Ok(cpus)
}

fn available_procs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config> {
        let mut argv = vec!["benchkit"];
        argv.extend_from_slice(args);
        let flags = Flags::try_parse_from(argv).unwrap();
        Config::merge(flags, FileConfig::default())
    }

    #[test]
    fn test_benchtime_forms() {
        assert_eq!("100x".parse::<BenchTime>().unwrap(), BenchTime::Count(100));
        assert_eq!(
            "250ms".parse::<BenchTime>().unwrap(),
            BenchTime::Duration(Duration::from_millis(250))
        );
        assert!("0x".parse::<BenchTime>().is_err());
        assert!("-3x".parse::<BenchTime>().is_err());
        assert!("0".parse::<BenchTime>().is_err());
        assert!("soon".parse::<BenchTime>().is_err());
        assert_eq!(BenchTime::Count(5).to_string(), "5x");
        assert_eq!(BenchTime::default().to_string(), "1s");
    }

    #[test]
    fn test_cpu_list() {
        assert_eq!(parse_cpu_list("1, 2,,4").unwrap(), vec![1, 2, 4]);
        assert_eq!(parse_cpu_list("").unwrap(), vec![available_procs()]);
        assert!(parse_cpu_list("1,zero").is_err());
        assert!(parse_cpu_list("0").is_err());
    }

    #[test]
    fn test_flags_override_file() {
        let flags = Flags::try_parse_from(["benchkit", "--bench", "Sort", "--count", "3"]).unwrap();
        let file = FileConfig {
            bench: Some("Hash".to_string()),
            count: Some(7),
            benchmem: Some(true),
            cpu: Some("2".to_string()),
            ..FileConfig::default()
        };
        let config = Config::merge(flags, file).unwrap();
        assert_eq!(config.bench, "Sort");
        assert_eq!(config.count, 3);
        assert!(config.benchmem);
        assert_eq!(config.cpu_list, vec![2]);
    }

    #[test]
    fn test_run_alias_and_verbose_short_flag() {
        let config = parse(&["--run", "Hash", "-v"]).unwrap();
        assert_eq!(config.bench, "Hash");
        assert!(config.verbose);
    }

    #[test]
    fn test_parallel_must_be_positive() {
        let err = parse(&["--parallel", "0"]).unwrap_err();
        assert!(matches!(err, BenchkitError::ConfigError(_)));
        assert_eq!(err.exit_code(), 2);
        assert!(parse(&["--parallel", "-1"]).is_err());
    }

    #[test]
    fn test_timeout_zero_disables() {
        assert_eq!(parse(&["--timeout", "0"]).unwrap().timeout, None);
        assert_eq!(
            parse(&["--timeout", "2m"]).unwrap().timeout,
            Some(Duration::from_secs(120))
        );
    }

    #[test]
    fn test_profiles_relocated_into_output_dir() {
        let config = parse(&[
            "--outputdir",
            "/tmp/prof",
            "--cpuprofile",
            "cpu.out",
            "--memprofile",
            "/abs/mem.out",
            "--blockprofile",
            "block.out",
            "--blockprofilerate",
            "-1",
        ])
        .unwrap();
        let profiles = config.profiles();
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].kind, ProfileKind::Cpu);
        assert_eq!(profiles[0].path, PathBuf::from("/tmp/prof/cpu.out"));
        assert_eq!(profiles[1].kind, ProfileKind::Allocs);
        assert_eq!(profiles[1].path, PathBuf::from("/abs/mem.out"));
    }

    #[test]
    fn test_file_config_toml() {
        let file: FileConfig = toml::from_str(
            r#"
            bench = "Sort/small"
            benchtime = "10x"
            cpu = "1,4"
            parallel = 2
            "#,
        )
        .unwrap();
        let config = Config::merge(Flags::default(), file).unwrap();
        assert_eq!(config.bench, "Sort/small");
        assert_eq!(config.benchtime, BenchTime::Count(10));
        assert_eq!(config.cpu_list, vec![1, 4]);
        assert_eq!(config.parallel, 2);
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        assert!(toml::from_str::<FileConfig>("benchtyme = \"1s\"").is_err());
    }
}
