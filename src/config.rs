//! Service settings loaded from an optional file and the environment.
//!
//! Sources, lowest priority first:
//! 1. Built-in defaults
//! 2. `config/jobs.{toml,...}` if present
//! 3. Environment variables (`MAX_CONCURRENT_JOBS`, `JOB_TIMEOUT_SECONDS`, ...)

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::InputLayout;
use crate::error::ConfigError;
use crate::manager::ManagerConfig;
use crate::supervisor::SupervisorConfig;

/// Flat service settings, one field per environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Connection string for the durable backend.
    pub redis_url: String,
    pub max_concurrent_jobs: usize,
    pub job_timeout_seconds: u64,
    pub poll_interval_ms: u64,
    /// Lifetime of a job record after its last write.
    pub job_ttl_hours: u64,
    pub upload_dir: PathBuf,
    /// Unset disables the periodic cleanup sweep.
    pub cleanup_interval_minutes: Option<u64>,
    pub retention_days: u32,
    /// Namespace for backend keys.
    pub key_prefix: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".into(),
            max_concurrent_jobs: 3,
            job_timeout_seconds: 3600,
            poll_interval_ms: 1000,
            job_ttl_hours: 24,
            upload_dir: PathBuf::from("./uploads"),
            cleanup_interval_minutes: None,
            retention_days: 7,
            key_prefix: "jobs".into(),
        }
    }
}

impl Settings {
    /// Load and validate settings from `config/jobs` and the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Source`] if a source cannot be read or a value
    /// has the wrong type, and [`ConfigError::Invalid`] if validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/jobs").required(false))
            .add_source(config::Environment::default().try_parsing(true));
        Self::from_config(builder.build()?)
    }

    /// Deserialize and validate settings from an already-built source.
    ///
    /// # Errors
    ///
    /// Same as [`Settings::load`].
    pub fn from_config(source: config::Config) -> Result<Self, ConfigError> {
        let settings: Self = source.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values that would stall or disable the service.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_concurrent_jobs", self.max_concurrent_jobs as u64),
            ("job_timeout_seconds", self.job_timeout_seconds),
            ("poll_interval_ms", self.poll_interval_ms),
            ("job_ttl_hours", self.job_ttl_hours),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be > 0")));
            }
        }
        if self.cleanup_interval_minutes == Some(0) {
            return Err(ConfigError::Invalid(
                "cleanup_interval_minutes must be > 0 when set".into(),
            ));
        }
        if self.key_prefix.is_empty() {
            return Err(ConfigError::Invalid("key_prefix must not be empty".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            ttl: Duration::from_secs(self.job_ttl_hours * 60 * 60),
        }
    }

    #[must_use]
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            max_concurrent_jobs: self.max_concurrent_jobs,
            job_timeout: Duration::from_secs(self.job_timeout_seconds),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            cleanup_interval: self
                .cleanup_interval_minutes
                .map(|minutes| Duration::from_secs(minutes * 60)),
            retention_days: self.retention_days,
        }
    }

    #[must_use]
    pub fn input_layout(&self) -> InputLayout {
        InputLayout::new(&self.upload_dir)
    }
}
