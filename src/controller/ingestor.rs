//! # Watch Ingestor
//!
//! One long-lived task per watched kind. It keeps the kind's cache current and
//! turns every observed change into a work-queue key.
//!
//! ## Loop
//!
//! 1. List the kind, replace the cache, enqueue everything that differs
//!    (the relist is what recovers events lost while disconnected)
//! 2. Watch from the listing's version and apply events as they arrive
//! 3. When the stream ends or asks for a resync, back off and start over
//!
//! Events for owned kinds are mapped to the key of their controller owner, so
//! deleting or editing a child re-triggers its parent.

use crate::controller::backoff::ExponentialBackoff;
use crate::controller::cache::ResourceCache;
use crate::controller::queue::WorkQueue;
use crate::crd::{ObjectKey, Resource};
use crate::observability::metrics;
use crate::store::{Store, WatchEvent};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How watched objects translate into queue keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueMapping {
    /// The watched kind is the reconciled kind; enqueue its own key
    Primary,
    /// The watched kind is a child; enqueue its controller owner of `owner_kind`
    Owned { owner_kind: String },
}

impl EnqueueMapping {
    /// Queue key for `obj`, or `None` if it is not managed by the owner kind
    pub fn key_for(&self, obj: &Resource) -> Option<ObjectKey> {
        match self {
            Self::Primary => Some(obj.key()),
            Self::Owned { owner_kind } => obj
                .metadata
                .controller_owner()
                .filter(|owner| &owner.kind == owner_kind)
                .map(|owner| ObjectKey::new(obj.namespace(), owner.name.clone())),
        }
    }
}

pub struct WatchIngestor {
    store: Arc<dyn Store>,
    kind: String,
    cache: ResourceCache,
    queue: Arc<WorkQueue>,
    mapping: EnqueueMapping,
    restart_backoff: ExponentialBackoff,
    resync_period: Option<Duration>,
}

impl std::fmt::Debug for WatchIngestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchIngestor")
            .field("kind", &self.kind)
            .field("mapping", &self.mapping)
            .field("resync_period", &self.resync_period)
            .finish_non_exhaustive()
    }
}

impl WatchIngestor {
    pub fn new(
        store: Arc<dyn Store>,
        kind: impl Into<String>,
        cache: ResourceCache,
        queue: Arc<WorkQueue>,
        mapping: EnqueueMapping,
        restart_backoff: ExponentialBackoff,
    ) -> Self {
        Self {
            store,
            kind: kind.into(),
            cache,
            queue,
            mapping,
            restart_backoff,
            resync_period: None,
        }
    }

    /// Re-enqueue every cached object each `period` even without events
    #[must_use]
    pub fn with_resync_period(mut self, period: Option<Duration>) -> Self {
        self.resync_period = period.filter(|p| !p.is_zero());
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    fn enqueue(&self, obj: &Resource) {
        if let Some(key) = self.mapping.key_for(obj) {
            self.queue.add(key);
        }
    }

    /// A primary `Modified` event that leaves generation and metadata alone
    /// (status writes, mostly) carries no new intent.
    fn is_status_only(&self, event: &WatchEvent) -> bool {
        let WatchEvent::Modified(obj) = event else {
            return false;
        };
        self.mapping == EnqueueMapping::Primary
            && self.cache.get(&obj.key()).is_some_and(|previous| {
                previous.metadata.generation == obj.metadata.generation
                    && previous.metadata.labels == obj.metadata.labels
                    && previous.metadata.owner_references == obj.metadata.owner_references
            })
    }

    fn enqueue_all_cached(&self) -> usize {
        let objects = self.cache.list(|_| true);
        for obj in &objects {
            self.enqueue(obj);
        }
        objects.len()
    }

    /// Full relist. Returns the version to resume watching from.
    async fn relist(&self) -> Result<u64, crate::store::StoreError> {
        let listing = self.store.list(&self.kind).await?;
        let changed = self.cache.replace(listing.items);
        metrics::increment_relists(&self.kind);
        debug!(
            kind = %self.kind,
            changed = changed.len(),
            resource_version = listing.resource_version,
            "Relisted"
        );
        for obj in &changed {
            self.enqueue(obj);
        }
        if !self.cache.is_synced() {
            self.cache.mark_synced();
            info!(kind = %self.kind, objects = self.cache.len(), "Cache synced");
        }
        Ok(listing.resource_version)
    }

    /// Run until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        let mut restart = self.restart_backoff.timer();
        let mut resync = self.resync_period.map(|period| {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });

        info!(kind = %self.kind, mapping = ?self.mapping, "Starting watch ingestor");

        'outer: loop {
            let since = tokio::select! {
                () = cancel.cancelled() => break 'outer,
                result = self.relist() => result,
            };

            let stream = match since {
                Ok(since) => tokio::select! {
                    () = cancel.cancelled() => break 'outer,
                    result = self.store.watch(&self.kind, since) => result,
                },
                Err(e) => Err(e),
            };

            if stream.is_ok() {
                restart.reset();
            }
            match stream {
                Ok(mut stream) => loop {
                    let event = tokio::select! {
                        () = cancel.cancelled() => break 'outer,
                        () = next_tick(&mut resync) => {
                            let count = self.enqueue_all_cached();
                            debug!(kind = %self.kind, count, "Periodic resync");
                            continue;
                        }
                        event = stream.next() => event,
                    };

                    match event {
                        Some(WatchEvent::ResyncRequired) => {
                            warn!(kind = %self.kind, "Watch requires resync, relisting");
                            metrics::increment_watch_events(&self.kind, "resync_required");
                            break;
                        }
                        Some(event) => {
                            metrics::increment_watch_events(&self.kind, event.label());
                            let status_only = self.is_status_only(&event);
                            self.cache.apply(&event);
                            if let Some(obj) = event.object().filter(|_| !status_only) {
                                self.enqueue(obj);
                            }
                        }
                        None => {
                            info!(kind = %self.kind, "Watch stream closed, relisting");
                            break;
                        }
                    }
                },
                Err(e) => {
                    warn!(kind = %self.kind, error = %e, "Failed to establish watch");
                }
            }

            metrics::increment_watch_restarts(&self.kind);
            let delay = restart.next_backoff();
            debug!(kind = %self.kind, delay = ?delay, "Restarting watch after delay");
            tokio::select! {
                () = cancel.cancelled() => break 'outer,
                () = tokio::time::sleep(delay) => {}
            }
        }

        info!(kind = %self.kind, "Watch ingestor stopped");
    }
}

async fn next_tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
