//! # Fenced Client
//!
//! Store handle given to reconcilers. Reads pass straight through; every
//! mutation first checks that this replica still leads and fails with
//! [`StoreError::NotLeader`] otherwise, so a demoted replica cannot keep
//! writing from a reconcile that was already in flight.

use crate::controller::leader::LeaderStatus;
use crate::crd::{ObjectKey, Resource};
use crate::store::{ObjectList, Store, StoreError};
use std::sync::Arc;

#[derive(Clone)]
pub struct Client {
    store: Arc<dyn Store>,
    leader: LeaderStatus,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("leader", &self.leader.state())
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(store: Arc<dyn Store>, leader: LeaderStatus) -> Self {
        Self { store, leader }
    }

    pub fn leader(&self) -> &LeaderStatus {
        &self.leader
    }

    fn fence(&self) -> Result<(), StoreError> {
        if self.leader.is_leader() {
            Ok(())
        } else {
            Err(StoreError::NotLeader)
        }
    }

    /// Strongly consistent read from the store (not the cache)
    pub async fn get(&self, kind: &str, key: &ObjectKey) -> Result<Resource, StoreError> {
        self.store.get(kind, key).await
    }

    /// Like [`Client::get`] but maps `NotFound` to `None`
    pub async fn get_opt(&self, kind: &str, key: &ObjectKey) -> Result<Option<Resource>, StoreError> {
        match self.store.get(kind, key).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn list(&self, kind: &str) -> Result<ObjectList, StoreError> {
        self.store.list(kind).await
    }

    pub async fn create(&self, obj: Resource) -> Result<Resource, StoreError> {
        self.fence()?;
        self.store.create(obj).await
    }

    pub async fn update(&self, obj: Resource) -> Result<Resource, StoreError> {
        self.fence()?;
        self.store.update(obj).await
    }

    pub async fn update_status(&self, obj: Resource) -> Result<Resource, StoreError> {
        self.fence()?;
        self.store.update_status(obj).await
    }

    pub async fn delete(&self, kind: &str, key: &ObjectKey) -> Result<(), StoreError> {
        self.fence()?;
        self.store.delete(kind, key).await
    }
}
