//! # Store
//!
//! Interface to the authoritative object store the engine reconciles against.
//!
//! The store is the single source of truth and the arbiter between concurrent
//! writers: every `update`/`update_status` carries the version token that was
//! read, and a stale token fails with [`StoreError::Conflict`] instead of
//! overwriting someone else's change.
//!
//! - `memory.rs` - In-process implementation with watch fan-out and fault injection
//! - `lease.rs` - Lease lock primitive used for leader election

mod lease;
mod memory;

pub use lease::{InMemoryLease, LeaseLock, LeaseOutcome, LeaseRecord};
pub use memory::{InMemoryStore, MemoryStoreConfig, WriteStats};

use crate::crd::{ObjectKey, Resource};
use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

/// Errors returned by [`Store`] and [`LeaseLock`] operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: ObjectKey },
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: ObjectKey },
    #[error("conflict on {kind} {key}: write carried version {expected}, store is at {current}")]
    Conflict {
        kind: String,
        key: ObjectKey,
        expected: u64,
        current: u64,
    },
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store request timed out: {0}")]
    Timeout(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// Mutation refused because this replica no longer holds leadership
    #[error("write refused: this replica is not the leader")]
    NotLeader,
}

impl StoreError {
    /// Errors worth retrying with backoff.
    ///
    /// `NotFound` and `Conflict` count as transient: both mean the caller acted on
    /// stale state and must re-read before trying again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::Conflict { .. }
                | Self::Unavailable(_)
                | Self::Timeout(_)
                | Self::RateLimited(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

/// A point-in-time listing of one kind
#[derive(Debug, Clone, Default)]
pub struct ObjectList {
    pub items: Vec<Resource>,
    /// Store revision the listing is consistent with. Pass it to [`Store::watch`]
    /// to receive every change made after the list.
    pub resource_version: u64,
}

/// Change notification delivered by [`Store::watch`]
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(Resource),
    Modified(Resource),
    Deleted(Resource),
    /// Events were lost (history compacted or the consumer lagged). The stream
    /// ends after this event and the consumer must relist.
    ResyncRequired,
}

impl WatchEvent {
    pub fn object(&self) -> Option<&Resource> {
        match self {
            Self::Added(obj) | Self::Modified(obj) | Self::Deleted(obj) => Some(obj),
            Self::ResyncRequired => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Modified(_) => "modified",
            Self::Deleted(_) => "deleted",
            Self::ResyncRequired => "resync_required",
        }
    }
}

/// Pulled, unbounded sequence of change events. Ends when the connection drops.
pub type WatchStream = BoxStream<'static, WatchEvent>;

/// Object store with optimistic concurrency and change subscription
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get(&self, kind: &str, key: &ObjectKey) -> Result<Resource, StoreError>;

    async fn list(&self, kind: &str) -> Result<ObjectList, StoreError>;

    /// Subscribe to changes of `kind` made after revision `since`
    async fn watch(&self, kind: &str, since: u64) -> Result<WatchStream, StoreError>;

    async fn create(&self, obj: Resource) -> Result<Resource, StoreError>;

    /// Replace metadata and spec. `obj.metadata.resource_version` must match the store.
    async fn update(&self, obj: Resource) -> Result<Resource, StoreError>;

    /// Replace status only. `obj.metadata.resource_version` must match the store.
    async fn update_status(&self, obj: Resource) -> Result<Resource, StoreError>;

    async fn delete(&self, kind: &str, key: &ObjectKey) -> Result<(), StoreError>;
}
