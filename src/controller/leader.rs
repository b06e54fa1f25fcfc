//! # Leader Coordinator
//!
//! Lease-based election so that only one replica reconciles at a time.
//!
//! ## States
//!
//! `Standby -> Acquiring -> Leading -> Renewing -> Leading ...`
//!
//! A failed or late renewal goes `Renewing -> LostLeadership -> Standby`.
//!
//! ## Self-demotion
//!
//! The renew deadline is measured from the moment the last successful renew
//! was *sent*, which is never later than the moment the lock recorded it. The
//! deadline is shorter than the lease duration, so a replica that cannot
//! renew steps down strictly before any other replica can take the lease.
//!
//! Only the worker dequeue loop and the fenced client consult [`LeaderStatus`].
//! Watch ingestors keep running on standby replicas so failover starts from a
//! warm cache.

use crate::config::ControllerConfig;
use crate::observability::metrics;
use crate::store::{LeaseLock, LeaseOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    Standby,
    Acquiring,
    Leading,
    Renewing,
    LostLeadership,
}

impl LeaderState {
    /// Whether work may be dequeued and written in this state
    pub fn is_leading(self) -> bool {
        matches!(self, Self::Leading | Self::Renewing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standby => "Standby",
            Self::Acquiring => "Acquiring",
            Self::Leading => "Leading",
            Self::Renewing => "Renewing",
            Self::LostLeadership => "LostLeadership",
        }
    }
}

/// Shared view of this replica's leadership. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LeaderStatus {
    state: Arc<watch::Sender<LeaderState>>,
}

impl LeaderStatus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(watch::Sender::new(LeaderState::Standby)),
        }
    }

    /// Status for a replica that runs without election
    pub fn always_leader() -> Self {
        Self {
            state: Arc::new(watch::Sender::new(LeaderState::Leading)),
        }
    }

    pub fn state(&self) -> LeaderState {
        *self.state.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.state().is_leading()
    }

    pub fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.state.subscribe()
    }

    pub(crate) fn set(&self, state: LeaderState) -> LeaderState {
        self.state.send_replace(state)
    }

    pub async fn wait_until_leader(&self) {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|state| state.is_leading()).await;
    }

    pub async fn wait_until_lost(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|state| !state.is_leading()).await;
    }
}

impl Default for LeaderStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Election timing
#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    pub lease_name: String,
    pub identity: String,
    pub lease_duration: Duration,
    /// Give up leadership if no renewal succeeded within this window
    pub renew_deadline: Duration,
    /// Pause between acquire attempts and between renewals
    pub retry_period: Duration,
}

impl From<&ControllerConfig> for LeaderElectionConfig {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            lease_name: config.lease_name.clone(),
            identity: config.identity.clone(),
            lease_duration: config.lease_duration(),
            renew_deadline: config.renew_deadline(),
            retry_period: config.retry_period(),
        }
    }
}

pub struct LeaderElector {
    lease: Arc<dyn LeaseLock>,
    config: LeaderElectionConfig,
    status: LeaderStatus,
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("config", &self.config)
            .field("state", &self.status.state())
            .finish_non_exhaustive()
    }
}

impl LeaderElector {
    pub fn new(lease: Arc<dyn LeaseLock>, config: LeaderElectionConfig) -> Self {
        Self {
            lease,
            config,
            status: LeaderStatus::new(),
        }
    }

    pub fn status(&self) -> LeaderStatus {
        self.status.clone()
    }

    /// One acquire or renew call. `Ok(true)` means the lease is ours.
    async fn try_lease(&self, deadline: Instant) -> Result<bool, String> {
        let call = self.lease.try_acquire_or_renew(
            &self.config.lease_name,
            &self.config.identity,
            self.config.lease_duration,
        );
        match tokio::time::timeout_at(deadline, call).await {
            Ok(Ok(LeaseOutcome::Granted(_))) => Ok(true),
            Ok(Ok(LeaseOutcome::Denied { holder })) => {
                debug!(identity = %self.config.identity, holder = %holder, "Lease held by another replica");
                Ok(false)
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("lease call timed out".to_string()),
        }
    }

    fn promote(&self) {
        self.status.set(LeaderState::Leading);
        metrics::set_leader(true);
        metrics::increment_leader_transitions("acquired");
        info!(
            identity = %self.config.identity,
            lease = %self.config.lease_name,
            "Acquired leadership"
        );
    }

    fn demote(&self, reason: &str) {
        self.status.set(LeaderState::LostLeadership);
        metrics::set_leader(false);
        metrics::increment_leader_transitions("lost");
        warn!(identity = %self.config.identity, reason, "Lost leadership, stopping work");
        self.status.set(LeaderState::Standby);
    }

    async fn release(&self) {
        // Stop writing before anyone else can take the lease
        self.status.set(LeaderState::Standby);
        metrics::set_leader(false);
        metrics::increment_leader_transitions("released");
        let release = self
            .lease
            .release(&self.config.lease_name, &self.config.identity);
        match tokio::time::timeout(self.config.retry_period, release).await {
            Ok(Ok(())) => info!(identity = %self.config.identity, "Released leadership"),
            Ok(Err(e)) => warn!(identity = %self.config.identity, error = %e, "Failed to release lease"),
            Err(_) => warn!(identity = %self.config.identity, "Timed out releasing lease"),
        }
    }

    /// Acquire until leading. Returns the send time of the granting call,
    /// or `None` when cancelled.
    async fn acquire(&self, cancel: &CancellationToken) -> Option<Instant> {
        self.status.set(LeaderState::Acquiring);
        loop {
            let sent = Instant::now();
            let result = tokio::select! {
                () = cancel.cancelled() => return None,
                result = self.try_lease(sent + self.config.retry_period) => result,
            };
            match result {
                Ok(true) => return Some(sent),
                Ok(false) => {}
                Err(e) => debug!(identity = %self.config.identity, error = %e, "Acquire attempt failed"),
            }
            tokio::select! {
                () = cancel.cancelled() => return None,
                () = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    /// Renew while leading. Returns `true` if cancelled while still leading.
    async fn hold(&self, cancel: &CancellationToken, mut last_renew: Instant) -> bool {
        loop {
            let deadline = last_renew + self.config.renew_deadline;
            let next = (Instant::now() + self.config.retry_period).min(deadline);
            tokio::select! {
                () = cancel.cancelled() => return true,
                () = tokio::time::sleep_until(next) => {}
            }

            if Instant::now() >= deadline {
                self.demote("renew deadline passed");
                return false;
            }

            self.status.set(LeaderState::Renewing);
            let sent = Instant::now();
            let result = tokio::select! {
                () = cancel.cancelled() => return true,
                result = self.try_lease(deadline) => result,
            };
            match result {
                Ok(true) => {
                    last_renew = sent;
                    self.status.set(LeaderState::Leading);
                }
                Ok(false) => {
                    self.demote("lease taken by another replica");
                    return false;
                }
                Err(e) => {
                    warn!(identity = %self.config.identity, error = %e, "Lease renewal failed");
                    if Instant::now() >= deadline {
                        self.demote("renew deadline passed");
                        return false;
                    }
                    self.status.set(LeaderState::Leading);
                }
            }
        }
    }

    /// Run the election until `cancel` fires; a held lease is released on exit
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            identity = %self.config.identity,
            lease = %self.config.lease_name,
            "Starting leader election"
        );
        while let Some(granted_at) = self.acquire(&cancel).await {
            self.promote();
            if self.hold(&cancel, granted_at).await {
                self.release().await;
                break;
            }
        }
        self.status.set(LeaderState::Standby);
        info!(identity = %self.config.identity, "Leader election stopped");
    }
}
