//! # Constants
//!
//! Shared defaults used throughout the engine.
//!
//! These values represent reasonable defaults and can be overridden via
//! environment variables (see [`crate::config::ControllerConfig::from_env`]).

/// Default HTTP server port for metrics and health probes
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default number of reconcile workers per registered kind
pub const DEFAULT_WORKERS: usize = 4;

/// Default per-key retry backoff starting value (milliseconds)
pub const DEFAULT_BACKOFF_START_MS: u64 = 500;

/// Default per-key retry backoff maximum value (milliseconds)
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 60_000;

/// Attempts before a transient failure is surfaced on status instead of retried
pub const DEFAULT_MAX_RECONCILE_RETRIES: u32 = 8;

/// Upper bound on a single reconcile invocation (seconds)
pub const DEFAULT_RECONCILE_TIMEOUT_SECS: u64 = 30;

/// Default delay before re-establishing a dropped watch (milliseconds)
pub const DEFAULT_WATCH_RESTART_DELAY_MS: u64 = 200;

/// Cap on the watch restart delay (milliseconds)
pub const DEFAULT_WATCH_RESTART_DELAY_MAX_MS: u64 = 30_000;

/// Periodic full resync interval; 0 disables it
pub const DEFAULT_RESYNC_PERIOD_SECS: u64 = 0;

/// How long in-flight reconciles may run after shutdown is requested
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;

pub const DEFAULT_LEASE_NAME: &str = "operator-engine-leader";

/// Lease validity after the last renewal
pub const DEFAULT_LEASE_DURATION_SECS: u64 = 15;

/// A leader that has not renewed for this long demotes itself. Must be shorter
/// than the lease duration so demotion happens before anyone else can take over.
pub const DEFAULT_RENEW_DEADLINE_SECS: u64 = 10;

/// Interval between acquire attempts and between renewals
pub const DEFAULT_RETRY_PERIOD_SECS: u64 = 2;

/// Conflict retries inside a single reconcile before giving up to the queue
pub const CONFLICT_RETRY_LIMIT: usize = 3;

/// Field manager name recorded in log lines for engine writes
pub const FIELD_MANAGER: &str = "operator-engine";
