//! Worker process configuration: YAML file, then environment overrides.
//!
//! ```yaml
//! database:
//!   path: /var/lib/spool/queue.db
//! worker:
//!   strategy: priority
//!   poll_interval_secs: 5
//! retry:
//!   base_delay_secs: 30
//! reporter:
//!   url: https://coordinator.internal/api
//!   token: abc123
//! ```
//!
//! Every section and field is optional. Environment variables win over the
//! file: `SPOOL_DATABASE`, `SPOOL_WORKER_ID`, `SPOOL_REPORTER_URL`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::app::PollerConfig;
use crate::domain::WorkerId;
use crate::impls::ReporterConfig;
use crate::queue::{BusyPolicy, ClaimStrategy, RetryPolicy};

pub const ENV_DATABASE: &str = "SPOOL_DATABASE";
pub const ENV_WORKER_ID: &str = "SPOOL_WORKER_ID";
pub const ENV_REPORTER_URL: &str = "SPOOL_REPORTER_URL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpoolConfig {
    pub database: DatabaseConfig,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    /// Absent means local-only mode.
    pub reporter: Option<ReporterSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    /// SQLite's own wait on a locked database, per attempt.
    pub lock_wait_ms: u64,
    pub busy_max_attempts: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let busy = BusyPolicy::default();
        Self {
            path: PathBuf::from("spool.db"),
            lock_wait_ms: busy.lock_wait.as_millis() as u64,
            busy_max_attempts: busy.max_attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Generated (`worker-<ulid>`) when unset.
    pub id: Option<String>,
    pub strategy: ClaimStrategy,
    pub poll_interval_secs: f64,
    pub backoff_multiplier: f64,
    pub max_backoff_secs: f64,
    /// Heartbeats older than this mark a worker dead for the reaper.
    pub stale_after_secs: u64,
    /// Heartbeat period while a handler runs; must stay below
    /// `stale_after_secs`.
    pub heartbeat_interval_secs: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let poller = PollerConfig::default();
        Self {
            id: None,
            strategy: ClaimStrategy::default(),
            poll_interval_secs: poller.poll_interval.as_secs_f64(),
            backoff_multiplier: poller.backoff_multiplier,
            max_backoff_secs: poller.max_backoff.as_secs_f64(),
            stale_after_secs: 300,
            heartbeat_interval_secs: crate::app::DEFAULT_HEARTBEAT_INTERVAL.as_secs_f64(),
        }
    }
}

/// Delay before a failed task is claimable again. The default (zero base
/// delay) requeues immediately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub base_delay_secs: f64,
    pub multiplier: f64,
    pub max_delay_secs: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 0.0,
            multiplier: 2.0,
            max_delay_secs: 600.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReporterSection {
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_reporter_timeout_secs")]
    pub timeout_secs: f64,
}

fn default_reporter_timeout_secs() -> f64 {
    crate::impls::http_reporter::DEFAULT_TIMEOUT.as_secs_f64()
}

fn secs(field: &str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| ConfigError::Invalid(format!("{field} must be a non-negative number of seconds, got {value}")))
}

impl SpoolConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SPOOL_*` overrides from the process environment.
    pub fn with_env(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup` (the environment, in production).
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let present = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(path) = present(ENV_DATABASE) {
            self.database.path = PathBuf::from(path);
        }
        if let Some(id) = present(ENV_WORKER_ID) {
            self.worker.id = Some(id);
        }
        if let Some(url) = present(ENV_REPORTER_URL) {
            match &mut self.reporter {
                Some(section) => section.url = url,
                None => {
                    self.reporter = Some(ReporterSection {
                        url,
                        token: None,
                        timeout_secs: default_reporter_timeout_secs(),
                    })
                }
            }
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.poller_config()?;
        self.retry_policy()?;
        self.reporter_config()?;
        self.heartbeat_interval()?;
        if self.database.busy_max_attempts == 0 {
            return Err(ConfigError::Invalid("database.busy_max_attempts must be at least 1".to_string()));
        }
        if let Some(id) = &self.worker.id
            && id.trim().is_empty()
        {
            return Err(ConfigError::Invalid("worker.id must not be blank".to_string()));
        }
        Ok(())
    }

    pub fn worker_id(&self) -> WorkerId {
        match &self.worker.id {
            Some(id) => WorkerId::new(id.clone()),
            None => WorkerId::generate(),
        }
    }

    pub fn poller_config(&self) -> Result<PollerConfig, ConfigError> {
        let w = &self.worker;
        if !(w.backoff_multiplier.is_finite() && w.backoff_multiplier >= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "worker.backoff_multiplier must be >= 1, got {}",
                w.backoff_multiplier
            )));
        }
        Ok(PollerConfig {
            poll_interval: secs("worker.poll_interval_secs", w.poll_interval_secs)?,
            backoff_multiplier: w.backoff_multiplier,
            max_backoff: secs("worker.max_backoff_secs", w.max_backoff_secs)?,
        })
    }

    pub fn busy_policy(&self) -> BusyPolicy {
        BusyPolicy {
            max_attempts: self.database.busy_max_attempts,
            lock_wait: Duration::from_millis(self.database.lock_wait_ms),
            ..BusyPolicy::default()
        }
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy, ConfigError> {
        let r = &self.retry;
        if !(r.multiplier.is_finite() && r.multiplier >= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "retry.multiplier must be >= 1, got {}",
                r.multiplier
            )));
        }
        Ok(RetryPolicy::exponential(
            secs("retry.base_delay_secs", r.base_delay_secs)?,
            r.multiplier,
            secs("retry.max_delay_secs", r.max_delay_secs)?,
        ))
    }

    pub fn reporter_config(&self) -> Result<Option<ReporterConfig>, ConfigError> {
        let Some(section) = &self.reporter else {
            return Ok(None);
        };
        let mut config = ReporterConfig::new(section.url.clone())
            .with_timeout(secs("reporter.timeout_secs", section.timeout_secs)?);
        if let Some(token) = &section.token {
            config = config.with_token(token.clone());
        }
        Ok(Some(config))
    }

    pub fn heartbeat_interval(&self) -> Result<Duration, ConfigError> {
        let interval = secs("worker.heartbeat_interval_secs", self.worker.heartbeat_interval_secs)?;
        if interval.is_zero() || interval >= self.stale_after() {
            return Err(ConfigError::Invalid(format!(
                "worker.heartbeat_interval_secs must be above 0 and below stale_after_secs ({}), got {}",
                self.worker.stale_after_secs, self.worker.heartbeat_interval_secs
            )));
        }
        Ok(interval)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.worker.stale_after_secs)
    }
}
