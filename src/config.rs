//! Configuration types.
//!
//! Every config has sensible defaults and can be overlaid from `TASKCORE_*`
//! environment variables.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::primitives::Flavor;

/// Read `key` through `lookup` and parse it, if present.
fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
    }
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" | "" => Ok(Some(false)),
            other => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected a boolean, got '{other}'"),
            }),
        },
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Single worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker name, used in logs and as the unit name.
    pub name: String,
    pub flavor: Flavor,
    /// Bounded wait on the input queue between stop-flag checks.
    pub poll_interval: Duration,
    /// Input queue capacity (`None` = unbounded).
    pub input_capacity: Option<usize>,
    /// Output queue capacity (`None` = unbounded).
    pub output_capacity: Option<usize>,
    /// Log every task and its value.
    pub trace: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            flavor: Flavor::SharedMemory,
            poll_interval: Duration::from_millis(10),
            input_capacity: None,
            output_capacity: None,
            trace: false,
        }
    }
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_flavor(mut self, flavor: Flavor) -> Self {
        self.flavor = flavor;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_capacity(mut self, input: Option<usize>, output: Option<usize>) -> Self {
        self.input_capacity = input;
        self.output_capacity = output;
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Defaults overlaid with `TASKCORE_FLAVOR`, `TASKCORE_POLL_MS` and
    /// `TASKCORE_TRACE`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay(&env_lookup)
    }

    pub(crate) fn overlay(mut self, lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(flavor) = parse_var::<Flavor>(lookup, "TASKCORE_FLAVOR")? {
            self.flavor = flavor;
        }
        if let Some(ms) = parse_var::<u64>(lookup, "TASKCORE_POLL_MS")? {
            self.poll_interval = Duration::from_millis(ms);
        }
        if let Some(trace) = parse_bool(lookup, "TASKCORE_TRACE")? {
            self.trace = trace;
        }
        Ok(self)
    }
}

/// Elastic pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub name: String,
    pub flavor: Flavor,
    /// Ceiling on concurrently live workers.
    pub max_workers: usize,
    /// Bounded wait per worker when the pool stops.
    pub join_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "pool".to_string(),
            flavor: Flavor::SharedMemory,
            max_workers: 5,
            join_timeout: Duration::from_secs(3),
        }
    }
}

impl PoolConfig {
    pub fn with_flavor(mut self, flavor: Flavor) -> Self {
        self.flavor = flavor;
        self
    }

    /// Set the worker ceiling. Zero would leave queued tasks unserved, so it
    /// is raised to one.
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        if max_workers == 0 {
            tracing::warn!("Pool {} max_workers of 0 raised to 1", self.name);
        }
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
        self.join_timeout = join_timeout;
        self
    }

    /// Defaults overlaid with `TASKCORE_FLAVOR` and `TASKCORE_MAX_WORKERS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay(&env_lookup)
    }

    pub(crate) fn overlay(mut self, lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(flavor) = parse_var::<Flavor>(lookup, "TASKCORE_FLAVOR")? {
            self.flavor = flavor;
        }
        if let Some(max) = parse_var::<usize>(lookup, "TASKCORE_MAX_WORKERS")? {
            if max == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "TASKCORE_MAX_WORKERS".to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
            self.max_workers = max;
        }
        Ok(self)
    }
}

/// Cron-style scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub flavor: Flavor,
    /// Interval between schedule checks.
    pub tick: Duration,
    /// Number of past outcomes kept (0 keeps none).
    pub keep: usize,
    pub trace: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            flavor: Flavor::SharedMemory,
            tick: Duration::from_secs(15),
            keep: 10,
            trace: false,
        }
    }
}

impl SchedulerConfig {
    pub fn with_flavor(mut self, flavor: Flavor) -> Self {
        self.flavor = flavor;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_keep(mut self, keep: usize) -> Self {
        self.keep = keep;
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Defaults overlaid with `TASKCORE_FLAVOR`, `TASKCORE_TICK_SECS`,
    /// `TASKCORE_KEEP` and `TASKCORE_TRACE`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay(&env_lookup)
    }

    pub(crate) fn overlay(mut self, lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(flavor) = parse_var::<Flavor>(lookup, "TASKCORE_FLAVOR")? {
            self.flavor = flavor;
        }
        if let Some(secs) = parse_var::<u64>(lookup, "TASKCORE_TICK_SECS")? {
            if secs == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "TASKCORE_TICK_SECS".to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
            self.tick = Duration::from_secs(secs);
        }
        if let Some(keep) = parse_var::<usize>(lookup, "TASKCORE_KEEP")? {
            self.keep = keep;
        }
        if let Some(trace) = parse_bool(lookup, "TASKCORE_TRACE")? {
            self.trace = trace;
        }
        Ok(self)
    }
}

/// External command configuration.
#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Working directory for commands (if None, uses cwd).
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            working_dir: None,
            timeout: Duration::from_secs(120),
        }
    }
}

impl ShellConfig {
    /// Defaults overlaid with `TASKCORE_SHELL_TIMEOUT_SECS` and
    /// `TASKCORE_SHELL_DIR`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay(&env_lookup)
    }

    pub(crate) fn overlay(mut self, lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(secs) = parse_var::<u64>(lookup, "TASKCORE_SHELL_TIMEOUT_SECS")? {
            self.timeout = Duration::from_secs(secs);
        }
        if let Some(dir) = lookup("TASKCORE_SHELL_DIR").filter(|d| !d.trim().is_empty()) {
            self.working_dir = Some(PathBuf::from(dir));
        }
        Ok(self)
    }
}

/// Read schedule lines from a crontab file, skipping blanks and `#` comments.
pub fn load_crontab(path: &Path) -> Result<Vec<String>, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect())
}
