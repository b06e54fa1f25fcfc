//! # Controller Configuration
//!
//! Engine-level settings loaded from environment variables.

use crate::constants::*;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("MAX_CONCURRENT_RECONCILIATIONS must be at least 1")]
    NoWorkers,
    #[error("RECONCILE_TIMEOUT_SECS must be at least 1")]
    NoReconcileTimeout,
    #[error("RETRY_PERIOD_SECS must be at least 1")]
    NoRetryPeriod,
    #[error("RENEW_DEADLINE_SECS ({renew_deadline}s) must be shorter than LEASE_DURATION_SECS ({lease_duration}s)")]
    RenewDeadlineTooLong {
        renew_deadline: u64,
        lease_duration: u64,
    },
    #[error("RETRY_PERIOD_SECS ({retry_period}s) must be shorter than RENEW_DEADLINE_SECS ({renew_deadline}s)")]
    RetryPeriodTooLong {
        retry_period: u64,
        renew_deadline: u64,
    },
    #[error("BACKOFF_START_MS must be > 0 and <= BACKOFF_MAX_MS")]
    InvalidBackoff,
    #[error("LOG_FORMAT must be \"json\" or \"text\", got {0:?}")]
    InvalidLogFormat(String),
}

/// Engine configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Reconcile workers per registered kind
    pub workers: usize,
    /// Exponential backoff starting value (milliseconds)
    pub backoff_start_ms: u64,
    /// Exponential backoff maximum value (milliseconds)
    pub backoff_max_ms: u64,
    /// Failed attempts before a transient error is surfaced on status and dropped
    pub max_retries: u32,
    /// Upper bound on one reconcile invocation (seconds)
    pub reconcile_timeout_secs: u64,
    /// Initial delay before re-establishing a watch after it ends (milliseconds)
    pub watch_restart_delay_ms: u64,
    /// Cap on the watch restart delay (milliseconds)
    pub watch_restart_delay_max_ms: u64,
    /// Re-enqueue every cached object this often (seconds, 0 = disabled)
    pub resync_period_secs: u64,
    /// Grace period for in-flight reconciles on shutdown (seconds)
    pub shutdown_grace_secs: u64,
    pub leader_election_enabled: bool,
    pub lease_name: String,
    pub lease_duration_secs: u64,
    pub renew_deadline_secs: u64,
    pub retry_period_secs: u64,
    /// Identity written into the lease; defaults to `POD_NAME`
    pub identity: String,
    pub metrics_port: u16,
    /// Global log level (ERROR, WARN, INFO, DEBUG, TRACE)
    pub log_level: String,
    /// Log format (json, text)
    pub log_format: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            backoff_start_ms: DEFAULT_BACKOFF_START_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            max_retries: DEFAULT_MAX_RECONCILE_RETRIES,
            reconcile_timeout_secs: DEFAULT_RECONCILE_TIMEOUT_SECS,
            watch_restart_delay_ms: DEFAULT_WATCH_RESTART_DELAY_MS,
            watch_restart_delay_max_ms: DEFAULT_WATCH_RESTART_DELAY_MAX_MS,
            resync_period_secs: DEFAULT_RESYNC_PERIOD_SECS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            leader_election_enabled: true,
            lease_name: DEFAULT_LEASE_NAME.to_string(),
            lease_duration_secs: DEFAULT_LEASE_DURATION_SECS,
            renew_deadline_secs: DEFAULT_RENEW_DEADLINE_SECS,
            retry_period_secs: DEFAULT_RETRY_PERIOD_SECS,
            identity: generated_identity(),
            metrics_port: DEFAULT_METRICS_PORT,
            log_level: "INFO".to_string(),
            log_format: "json".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self {
            workers: env_var_or_default("MAX_CONCURRENT_RECONCILIATIONS", DEFAULT_WORKERS),
            backoff_start_ms: env_var_or_default("BACKOFF_START_MS", DEFAULT_BACKOFF_START_MS),
            backoff_max_ms: env_var_or_default("BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS),
            max_retries: env_var_or_default("MAX_RECONCILE_RETRIES", DEFAULT_MAX_RECONCILE_RETRIES),
            reconcile_timeout_secs: env_var_or_default(
                "RECONCILE_TIMEOUT_SECS",
                DEFAULT_RECONCILE_TIMEOUT_SECS,
            ),
            watch_restart_delay_ms: env_var_or_default(
                "WATCH_RESTART_DELAY_MS",
                DEFAULT_WATCH_RESTART_DELAY_MS,
            ),
            watch_restart_delay_max_ms: env_var_or_default(
                "WATCH_RESTART_DELAY_MAX_MS",
                DEFAULT_WATCH_RESTART_DELAY_MAX_MS,
            ),
            resync_period_secs: env_var_or_default("RESYNC_PERIOD_SECS", DEFAULT_RESYNC_PERIOD_SECS),
            shutdown_grace_secs: env_var_or_default(
                "SHUTDOWN_GRACE_SECS",
                DEFAULT_SHUTDOWN_GRACE_SECS,
            ),
            leader_election_enabled: env_var_or_default_bool("LEADER_ELECTION_ENABLED", true),
            lease_name: env_var_or_default_str("LEASE_NAME", DEFAULT_LEASE_NAME),
            lease_duration_secs: env_var_or_default(
                "LEASE_DURATION_SECS",
                DEFAULT_LEASE_DURATION_SECS,
            ),
            renew_deadline_secs: env_var_or_default(
                "RENEW_DEADLINE_SECS",
                DEFAULT_RENEW_DEADLINE_SECS,
            ),
            retry_period_secs: env_var_or_default("RETRY_PERIOD_SECS", DEFAULT_RETRY_PERIOD_SECS),
            identity: std::env::var("POD_NAME").unwrap_or_else(|_| generated_identity()),
            metrics_port: env_var_or_default("METRICS_PORT", DEFAULT_METRICS_PORT),
            log_level: env_var_or_default_str("LOG_LEVEL", "INFO"),
            log_format: env_var_or_default_str("LOG_FORMAT", "json"),
        }
    }

    /// Check cross-field constraints the election and retry logic rely on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.backoff_start_ms == 0 || self.backoff_start_ms > self.backoff_max_ms {
            return Err(ConfigError::InvalidBackoff);
        }
        if self.reconcile_timeout_secs == 0 {
            return Err(ConfigError::NoReconcileTimeout);
        }
        if self.leader_election_enabled {
            if self.retry_period_secs == 0 {
                return Err(ConfigError::NoRetryPeriod);
            }
            if self.renew_deadline_secs >= self.lease_duration_secs {
                return Err(ConfigError::RenewDeadlineTooLong {
                    renew_deadline: self.renew_deadline_secs,
                    lease_duration: self.lease_duration_secs,
                });
            }
            if self.retry_period_secs >= self.renew_deadline_secs {
                return Err(ConfigError::RetryPeriodTooLong {
                    retry_period: self.retry_period_secs,
                    renew_deadline: self.renew_deadline_secs,
                });
            }
        }
        match self.log_format.to_lowercase().as_str() {
            "json" | "text" => Ok(()),
            _ => Err(ConfigError::InvalidLogFormat(self.log_format.clone())),
        }
    }

    pub fn backoff_start_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_start_ms)
    }

    pub fn backoff_max_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    pub fn watch_restart_delay(&self) -> Duration {
        Duration::from_millis(self.watch_restart_delay_ms)
    }

    pub fn watch_restart_delay_max(&self) -> Duration {
        Duration::from_millis(self.watch_restart_delay_max_ms)
    }

    /// `None` when periodic resync is disabled
    pub fn resync_period(&self) -> Option<Duration> {
        (self.resync_period_secs > 0).then(|| Duration::from_secs(self.resync_period_secs))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn renew_deadline(&self) -> Duration {
        Duration::from_secs(self.renew_deadline_secs)
    }

    pub fn retry_period(&self) -> Duration {
        Duration::from_secs(self.retry_period_secs)
    }
}

/// Random replica identity used when `POD_NAME` is unset
pub fn generated_identity() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("operator-engine-{}", &id[..8])
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as boolean or return default
fn env_var_or_default_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| {
            let v_lower = v.to_lowercase();
            v_lower == "true" || v_lower == "1" || v_lower == "yes" || v_lower == "on"
        })
        .unwrap_or(default)
}

/// Read environment variable as string or return default
fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
