//! # In-Memory Store
//!
//! Process-local [`Store`] with the same contract a remote API server offers:
//! a global monotonically increasing revision used as the version token,
//! generation bumps on spec changes, bounded per-kind event history for
//! resumable watches, and broadcast fan-out to watchers.
//!
//! Besides being the backing store of the bundled binary it is the fake used
//! by the test-suite, so it exposes fault injection (`fail_next`,
//! `set_available`, `disconnect_watches`), write counters, and a
//! `collect_garbage` sweep standing in for the external garbage collector.

use super::{ObjectList, Store, StoreError, WatchEvent, WatchStream};
use crate::crd::{ObjectKey, Resource};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Tuning for [`InMemoryStore`]
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Events retained per kind for `watch(since)` replay
    pub history_limit: usize,
    /// Per-kind broadcast buffer; a watcher lagging further behind gets `ResyncRequired`
    pub watch_buffer: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            history_limit: 1024,
            watch_buffer: 1024,
        }
    }
}

/// Mutating calls accepted by the store, counted per operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub creates: u64,
    pub updates: u64,
    pub status_updates: u64,
    pub deletes: u64,
}

impl WriteStats {
    pub fn total(&self) -> u64 {
        self.creates + self.updates + self.status_updates + self.deletes
    }
}

type Revisioned = (u64, WatchEvent);

#[derive(Debug, Default)]
struct KindState {
    objects: BTreeMap<ObjectKey, Resource>,
    history: VecDeque<Revisioned>,
    /// Highest revision dropped from `history`
    compacted: u64,
    sender: Option<broadcast::Sender<Revisioned>>,
}

#[derive(Debug)]
struct StoreState {
    kinds: HashMap<String, KindState>,
    revision: u64,
    available: bool,
    faults: VecDeque<StoreError>,
    stats: WriteStats,
}

#[derive(Debug)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
    config: MemoryStoreConfig,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(MemoryStoreConfig::default())
    }
}

impl InMemoryStore {
    pub fn new(config: MemoryStoreConfig) -> Self {
        Self {
            state: Mutex::new(StoreState {
                kinds: HashMap::new(),
                revision: 0,
                available: true,
                faults: VecDeque::new(),
                stats: WriteStats::default(),
            }),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `count` store calls (of any operation) with `error`
    pub fn fail_next(&self, count: usize, error: StoreError) {
        let mut state = self.lock();
        state
            .faults
            .extend(std::iter::repeat(error).take(count));
    }

    /// Simulate a partition: while unavailable every call returns `Unavailable`
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Terminate every open watch stream, as a dropped connection would
    pub fn disconnect_watches(&self) {
        let mut state = self.lock();
        for kind in state.kinds.values_mut() {
            kind.sender = None;
        }
        info!("In-memory store dropped all watch streams");
    }

    pub fn write_stats(&self) -> WriteStats {
        self.lock().stats
    }

    pub fn current_revision(&self) -> u64 {
        self.lock().revision
    }

    /// Insert objects without counting them as engine writes
    pub fn seed(&self, objects: impl IntoIterator<Item = Resource>) -> Result<(), StoreError> {
        let mut state = self.lock();
        for obj in objects {
            self.create_locked(&mut state, obj)?;
        }
        Ok(())
    }

    /// Delete every object whose controller owner no longer exists (same
    /// namespace, same kind, same UID). Returns the number of objects removed.
    pub fn collect_garbage(&self) -> usize {
        let mut state = self.lock();
        let orphans: Vec<(String, ObjectKey)> = state
            .kinds
            .iter()
            .flat_map(|(kind, ks)| {
                ks.objects
                    .values()
                    .map(move |obj| (kind.clone(), obj))
            })
            .filter_map(|(kind, obj)| {
                let owner = obj.metadata.controller_owner()?;
                let owner_key = ObjectKey::new(obj.namespace(), owner.name.clone());
                let alive = state
                    .kinds
                    .get(&owner.kind)
                    .and_then(|ks| ks.objects.get(&owner_key))
                    .is_some_and(|o| o.metadata.uid == owner.uid);
                (!alive).then(|| (kind, obj.key()))
            })
            .collect();

        let removed = orphans.len();
        for (kind, key) in orphans {
            debug!(kind = %kind, key = %key, "Garbage collecting orphaned object");
            self.remove_locked(&mut state, &kind, &key);
        }
        removed
    }

    fn check_faults(state: &mut StoreState) -> Result<(), StoreError> {
        if !state.available {
            return Err(StoreError::Unavailable("store is partitioned".to_string()));
        }
        match state.faults.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next_revision(state: &mut StoreState) -> u64 {
        state.revision += 1;
        state.revision
    }

    fn emit(&self, kind_state: &mut KindState, revision: u64, event: WatchEvent) {
        kind_state.history.push_back((revision, event.clone()));
        while kind_state.history.len() > self.config.history_limit {
            if let Some((dropped, _)) = kind_state.history.pop_front() {
                kind_state.compacted = dropped;
            }
        }
        if let Some(sender) = &kind_state.sender {
            // No receivers is fine
            let _ = sender.send((revision, event));
        }
    }

    fn create_locked(&self, state: &mut StoreState, mut obj: Resource) -> Result<Resource, StoreError> {
        if obj.metadata.name.is_empty() || obj.metadata.namespace.is_empty() {
            return Err(StoreError::Invalid(format!(
                "{} must have a name and namespace",
                obj.kind
            )));
        }
        let key = obj.key();
        if state
            .kinds
            .get(&obj.kind)
            .is_some_and(|ks| ks.objects.contains_key(&key))
        {
            return Err(StoreError::AlreadyExists {
                kind: obj.kind,
                key,
            });
        }

        let revision = Self::next_revision(state);
        obj.metadata.uid = uuid::Uuid::new_v4().to_string();
        obj.metadata.generation = 1;
        obj.metadata.resource_version = revision;
        obj.status = None;

        let kind_state = state.kinds.entry(obj.kind.clone()).or_default();
        kind_state.objects.insert(key, obj.clone());
        self.emit(kind_state, revision, WatchEvent::Added(obj.clone()));
        Ok(obj)
    }

    fn current<'a>(
        state: &'a mut StoreState,
        kind: &str,
        key: &ObjectKey,
    ) -> Result<&'a mut Resource, StoreError> {
        state
            .kinds
            .get_mut(kind)
            .and_then(|ks| ks.objects.get_mut(key))
            .ok_or_else(|| StoreError::NotFound {
                kind: kind.to_string(),
                key: key.clone(),
            })
    }

    fn check_version(existing: &Resource, incoming: &Resource) -> Result<(), StoreError> {
        if existing.metadata.resource_version == incoming.metadata.resource_version {
            Ok(())
        } else {
            Err(StoreError::Conflict {
                kind: incoming.kind.clone(),
                key: incoming.key(),
                expected: incoming.metadata.resource_version,
                current: existing.metadata.resource_version,
            })
        }
    }

    fn remove_locked(&self, state: &mut StoreState, kind: &str, key: &ObjectKey) -> bool {
        let revision = state.revision + 1;
        let Some(kind_state) = state.kinds.get_mut(kind) else {
            return false;
        };
        let Some(mut removed) = kind_state.objects.remove(key) else {
            return false;
        };
        state.revision = revision;
        removed.metadata.resource_version = revision;
        self.emit(kind_state, revision, WatchEvent::Deleted(removed));
        true
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, kind: &str, key: &ObjectKey) -> Result<Resource, StoreError> {
        let mut state = self.lock();
        Self::check_faults(&mut state)?;
        Self::current(&mut state, kind, key).map(|obj| obj.clone())
    }

    async fn list(&self, kind: &str) -> Result<ObjectList, StoreError> {
        let mut state = self.lock();
        Self::check_faults(&mut state)?;
        let items = state
            .kinds
            .get(kind)
            .map(|ks| ks.objects.values().cloned().collect())
            .unwrap_or_default();
        Ok(ObjectList {
            items,
            resource_version: state.revision,
        })
    }

    async fn watch(&self, kind: &str, since: u64) -> Result<WatchStream, StoreError> {
        let mut state = self.lock();
        Self::check_faults(&mut state)?;
        let buffer = self.config.watch_buffer.max(1);
        let kind_state = state.kinds.entry(kind.to_string()).or_default();

        // Replay and subscription happen under the same lock writers hold while
        // emitting, so no event can fall between them or be delivered twice.
        if since < kind_state.compacted {
            return Ok(futures::stream::iter([WatchEvent::ResyncRequired]).boxed());
        }
        let replay: Vec<WatchEvent> = kind_state
            .history
            .iter()
            .filter(|(revision, _)| *revision > since)
            .map(|(_, event)| event.clone())
            .collect();
        let receiver = kind_state
            .sender
            .get_or_insert_with(|| broadcast::channel(buffer).0)
            .subscribe();
        drop(state);

        let live = futures::stream::unfold(Some(receiver), move |receiver| async move {
            let mut receiver = receiver?;
            loop {
                match receiver.recv().await {
                    Ok((revision, event)) if revision > since => {
                        return Some((event, Some(receiver)));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        return Some((WatchEvent::ResyncRequired, None));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(futures::stream::iter(replay).chain(live).boxed())
    }

    async fn create(&self, obj: Resource) -> Result<Resource, StoreError> {
        let mut state = self.lock();
        Self::check_faults(&mut state)?;
        let created = self.create_locked(&mut state, obj)?;
        state.stats.creates += 1;
        Ok(created)
    }

    async fn update(&self, obj: Resource) -> Result<Resource, StoreError> {
        let mut state = self.lock();
        Self::check_faults(&mut state)?;

        let key = obj.key();
        let existing = Self::current(&mut state, &obj.kind, &key)?;
        Self::check_version(existing, &obj)?;
        if existing.spec == obj.spec
            && existing.metadata.labels == obj.metadata.labels
            && existing.metadata.owner_references == obj.metadata.owner_references
        {
            return Ok(existing.clone());
        }

        let spec_changed = existing.spec != obj.spec;
        let mut updated = existing.clone();
        updated.spec = obj.spec;
        updated.metadata.labels = obj.metadata.labels;
        updated.metadata.owner_references = obj.metadata.owner_references;
        if spec_changed {
            updated.metadata.generation += 1;
        }

        let revision = Self::next_revision(&mut state);
        updated.metadata.resource_version = revision;
        state.stats.updates += 1;
        let kind_state = state.kinds.entry(updated.kind.clone()).or_default();
        kind_state.objects.insert(key, updated.clone());
        self.emit(kind_state, revision, WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }

    async fn update_status(&self, obj: Resource) -> Result<Resource, StoreError> {
        let mut state = self.lock();
        Self::check_faults(&mut state)?;

        let key = obj.key();
        let existing = Self::current(&mut state, &obj.kind, &key)?;
        Self::check_version(existing, &obj)?;
        if existing.status == obj.status {
            return Ok(existing.clone());
        }

        let mut updated = existing.clone();
        updated.status = obj.status;
        let revision = Self::next_revision(&mut state);
        updated.metadata.resource_version = revision;
        state.stats.status_updates += 1;
        let kind_state = state.kinds.entry(updated.kind.clone()).or_default();
        kind_state.objects.insert(key, updated.clone());
        self.emit(kind_state, revision, WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, kind: &str, key: &ObjectKey) -> Result<(), StoreError> {
        let mut state = self.lock();
        Self::check_faults(&mut state)?;
        if self.remove_locked(&mut state, kind, key) {
            state.stats.deletes += 1;
            Ok(())
        } else {
            Err(StoreError::NotFound {
                kind: kind.to_string(),
                key: key.clone(),
            })
        }
    }
}
