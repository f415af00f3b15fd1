use std::time::Duration;

use serde::Deserialize;

use crate::{error::ConfigError, store::StoreConfig};

/// Tunables of one worker loop. Passed in at construction; nothing is global.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Explicit identity. A name that survives restarts lets the worker resume
    /// jobs it held when it died.
    pub name: Option<String>,
    /// Prepended to the derived default name. Ignored when `name` is set.
    pub name_prefix: Option<String>,
    pub min_priority: Option<i32>,
    pub max_priority: Option<i32>,
    pub max_attempts: u32,
    /// Lease length and execution deadline.
    #[serde(with = "humantime_serde")]
    pub max_run_time: Duration,
    /// Idle poll interval.
    #[serde(with = "humantime_serde")]
    pub sleep_delay: Duration,
    pub destroy_failed_jobs: bool,
    pub destroy_successful_jobs: bool,
    /// Only meaningful when successful jobs are kept.
    pub clear_successful_errors: bool,
    /// Jobs attempted per wake cycle.
    pub batch_size: usize,
    /// Candidates fetched per attempt.
    pub candidate_limit: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: None,
            name_prefix: None,
            min_priority: None,
            max_priority: None,
            max_attempts: 25,
            max_run_time: Duration::from_secs(4 * 60 * 60),
            sleep_delay: Duration::from_secs(5),
            destroy_failed_jobs: true,
            destroy_successful_jobs: true,
            clear_successful_errors: false,
            batch_size: 100,
            candidate_limit: 5,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let (Some(min), Some(max)) = (self.min_priority, self.max_priority) {
            if min > max {
                return Err(ConfigError::PriorityRange { min, max });
            }
        }
        Ok(())
    }

    /// The explicit name, or `{prefix}host:{hostname} pid:{pid}`.
    pub fn worker_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        let prefix = self.name_prefix.as_deref().unwrap_or_default();
        let pid = std::process::id();
        match hostname() {
            Some(host) => format!("{prefix}host:{host} pid:{pid}"),
            None => format!("{prefix}pid:{pid}"),
        }
    }
}

fn hostname() -> Option<String> {
    gethostname::gethostname()
        .into_string()
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub worker: WorkerConfig,
}

impl Config {
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(source)?;
        config.worker.validate()?;
        Ok(config)
    }
}
