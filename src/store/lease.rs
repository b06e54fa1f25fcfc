//! # Lease Lock
//!
//! Time-bounded exclusive-holder records used to elect a single active replica.

use super::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Lease state as stored by the lock primitive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    pub holder_identity: String,
    pub acquire_time: DateTime<Utc>,
    pub renew_time: DateTime<Utc>,
    pub lease_duration_seconds: f64,
}

impl LeaseRecord {
    pub fn expires_at(&self) -> DateTime<Utc> {
        let millis = (self.lease_duration_seconds * 1000.0).round() as i64;
        self.renew_time + chrono::Duration::milliseconds(millis)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LeaseOutcome {
    Granted(LeaseRecord),
    /// Someone else holds a live lease
    Denied { holder: String },
}

impl LeaseOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

#[async_trait]
pub trait LeaseLock: Send + Sync + 'static {
    /// Take the lease if it is free or expired, or renew it if `holder` already owns it
    async fn try_acquire_or_renew(
        &self,
        lease_name: &str,
        holder: &str,
        duration: Duration,
    ) -> Result<LeaseOutcome, StoreError>;

    /// Give the lease up early. A no-op if `holder` does not own it.
    async fn release(&self, lease_name: &str, holder: &str) -> Result<(), StoreError>;

    async fn get(&self, lease_name: &str) -> Result<Option<LeaseRecord>, StoreError>;
}

/// Process-local [`LeaseLock`].
///
/// Individual holders can be partitioned away, after which their calls fail
/// with `Unavailable` while other holders keep working.
#[derive(Debug, Default)]
pub struct InMemoryLease {
    records: Mutex<HashMap<String, LeaseRecord>>,
    partitioned: Mutex<HashSet<String>>,
}

impl InMemoryLease {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_partitioned(&self, holder: &str, partitioned: bool) {
        let mut set = self
            .partitioned
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if partitioned {
            set.insert(holder.to_string());
        } else {
            set.remove(holder);
        }
    }

    fn check_reachable(&self, holder: &str) -> Result<(), StoreError> {
        let set = self
            .partitioned
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if set.contains(holder) {
            Err(StoreError::Unavailable(format!(
                "lease store unreachable from {holder}"
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LeaseLock for InMemoryLease {
    async fn try_acquire_or_renew(
        &self,
        lease_name: &str,
        holder: &str,
        duration: Duration,
    ) -> Result<LeaseOutcome, StoreError> {
        self.check_reachable(holder)?;
        let now = Utc::now();
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);

        let record = match records.get(lease_name) {
            Some(current) if current.holder_identity == holder => LeaseRecord {
                renew_time: now,
                lease_duration_seconds: duration.as_secs_f64(),
                ..current.clone()
            },
            Some(current) if !current.is_expired_at(now) => {
                return Ok(LeaseOutcome::Denied {
                    holder: current.holder_identity.clone(),
                });
            }
            _ => LeaseRecord {
                holder_identity: holder.to_string(),
                acquire_time: now,
                renew_time: now,
                lease_duration_seconds: duration.as_secs_f64(),
            },
        };
        records.insert(lease_name.to_string(), record.clone());
        Ok(LeaseOutcome::Granted(record))
    }

    async fn release(&self, lease_name: &str, holder: &str) -> Result<(), StoreError> {
        self.check_reachable(holder)?;
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records
            .get(lease_name)
            .is_some_and(|r| r.holder_identity == holder)
        {
            records.remove(lease_name);
        }
        Ok(())
    }

    async fn get(&self, lease_name: &str) -> Result<Option<LeaseRecord>, StoreError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(lease_name).cloned())
    }
}
