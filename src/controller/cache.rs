//! # Resource Cache
//!
//! Local read-only mirror of one kind, fed exclusively by the watch ingestor.
//!
//! Reconcilers may read it to find related objects cheaply, but it can lag
//! the store. Anything a write is based on must be read from the store.

use crate::crd::{ObjectKey, Resource};
use crate::store::WatchEvent;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct CacheInner {
    objects: RwLock<HashMap<ObjectKey, Arc<Resource>>>,
    synced: AtomicBool,
    synced_notify: Notify,
}

/// Shared handle; clones see the same contents
#[derive(Debug, Clone, Default)]
pub struct ResourceCache {
    inner: Arc<CacheInner>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ObjectKey, Arc<Resource>>> {
        self.inner
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ObjectKey, Arc<Resource>>> {
        self.inner
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<Resource>> {
        self.read().get(key).cloned()
    }

    /// Cached objects matching `predicate`
    pub fn list<F>(&self, predicate: F) -> Vec<Arc<Resource>>
    where
        F: Fn(&Resource) -> bool,
    {
        self.read()
            .values()
            .filter(|obj| predicate(obj))
            .cloned()
            .collect()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Apply one watch event. Returns `false` for events that carry no object.
    pub fn apply(&self, event: &WatchEvent) -> bool {
        match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                self.write().insert(obj.key(), Arc::new(obj.clone()));
                true
            }
            WatchEvent::Deleted(obj) => {
                self.write().remove(&obj.key());
                true
            }
            WatchEvent::ResyncRequired => false,
        }
    }

    /// Replace the contents with a fresh listing.
    ///
    /// Returns the objects that differ from what was cached: added or changed
    /// (by version token) ones in their new form, vanished ones in their last
    /// cached form. These stand for the events missed while the watch was down.
    pub fn replace(&self, items: Vec<Resource>) -> Vec<Arc<Resource>> {
        let mut objects = self.write();
        let mut changed = Vec::new();
        let mut seen = HashSet::with_capacity(items.len());

        for obj in items {
            let key = obj.key();
            let differs = objects
                .get(&key)
                .is_none_or(|cached| cached.resource_version() != obj.resource_version());
            if differs {
                let obj = Arc::new(obj);
                changed.push(Arc::clone(&obj));
                objects.insert(key.clone(), obj);
            }
            seen.insert(key);
        }

        let gone: Vec<ObjectKey> = objects
            .keys()
            .filter(|key| !seen.contains(*key))
            .cloned()
            .collect();
        for key in gone {
            if let Some(obj) = objects.remove(&key) {
                changed.push(obj);
            }
        }
        changed
    }

    /// Mark the initial listing as loaded
    pub fn mark_synced(&self) {
        self.inner.synced.store(true, Ordering::SeqCst);
        self.inner.synced_notify.notify_waiters();
    }

    pub fn is_synced(&self) -> bool {
        self.inner.synced.load(Ordering::SeqCst)
    }

    /// Resolve once the initial listing has been loaded
    pub async fn wait_synced(&self) {
        loop {
            let notified = self.inner.synced_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_synced() {
                return;
            }
            notified.await;
        }
    }
}
