//! # Engine
//!
//! Wires the controller parts together for one replica.
//!
//! For every registered kind the engine owns:
//! - one work queue
//! - one primary ingestor plus one ingestor per owned kind, all feeding that queue
//! - one reconcile driver
//!
//! Leadership is shared by every kind of the replica. Ingestors run regardless
//! of leadership; only the drivers wait for it.
//!
//! ## Shutdown
//!
//! 1. Stop dequeuing and shut the queues
//! 2. Wait up to the grace period for in-flight reconciles
//! 3. Stop the ingestors
//! 4. Release the lease

use crate::config::ControllerConfig;
use crate::controller::backoff::ExponentialBackoff;
use crate::controller::cache::ResourceCache;
use crate::controller::client::Client;
use crate::controller::ingestor::{EnqueueMapping, WatchIngestor};
use crate::controller::leader::{LeaderElectionConfig, LeaderElector, LeaderStatus};
use crate::controller::queue::WorkQueue;
use crate::controller::reconciler::{Driver, DriverConfig, ReconcilerRegistry};
use crate::store::{LeaseLock, Store};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Everything that runs for one reconciled kind
struct KindController {
    kind: String,
    queue: Arc<WorkQueue>,
    cache: ResourceCache,
    owned_caches: Vec<ResourceCache>,
    ingestors: Vec<WatchIngestor>,
    driver: Arc<Driver>,
}

pub struct Engine {
    identity: String,
    config: ControllerConfig,
    leader: LeaderStatus,
    elector: Option<LeaderElector>,
    controllers: Vec<KindController>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("identity", &self.identity)
            .field("leader", &self.leader.state())
            .field(
                "kinds",
                &self.controllers.iter().map(|c| c.kind.as_str()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Build an engine for every kind in `registry`.
    ///
    /// `lease` is only consulted when leader election is enabled; without it
    /// the replica leads unconditionally.
    pub fn new(
        store: Arc<dyn Store>,
        lease: Arc<dyn LeaseLock>,
        registry: ReconcilerRegistry,
        config: ControllerConfig,
    ) -> Result<Self> {
        config.validate().context("Invalid controller configuration")?;
        if registry.is_empty() {
            anyhow::bail!("No reconcilers registered");
        }

        let (leader, elector) = if config.leader_election_enabled {
            let elector = LeaderElector::new(lease, LeaderElectionConfig::from(&config));
            (elector.status(), Some(elector))
        } else {
            info!(identity = %config.identity, "Leader election disabled, running as sole leader");
            (LeaderStatus::always_leader(), None)
        };

        let client = Client::new(Arc::clone(&store), leader.clone());
        let retry_backoff =
            ExponentialBackoff::new(config.backoff_start_duration(), config.backoff_max_duration());
        let restart_backoff = ExponentialBackoff::new(
            config.watch_restart_delay(),
            config.watch_restart_delay_max(),
        );

        let mut controllers = Vec::with_capacity(registry.len());
        for reconciler in registry.iter() {
            let kind = reconciler.kind();
            let queue = WorkQueue::new(kind, retry_backoff);
            let cache = ResourceCache::new();

            let mut ingestors = vec![WatchIngestor::new(
                Arc::clone(&store),
                kind,
                cache.clone(),
                Arc::clone(&queue),
                EnqueueMapping::Primary,
                restart_backoff,
            )
            .with_resync_period(config.resync_period())];

            let mut owned_caches = Vec::new();
            for owned in reconciler.owned_kinds() {
                let owned_cache = ResourceCache::new();
                ingestors.push(WatchIngestor::new(
                    Arc::clone(&store),
                    owned,
                    owned_cache.clone(),
                    Arc::clone(&queue),
                    EnqueueMapping::Owned {
                        owner_kind: kind.to_string(),
                    },
                    restart_backoff,
                ));
                owned_caches.push(owned_cache);
            }

            let driver = Arc::new(Driver::new(
                Arc::clone(reconciler),
                Arc::clone(&queue),
                cache.clone(),
                client.clone(),
                DriverConfig::from(&config),
            ));

            controllers.push(KindController {
                kind: kind.to_string(),
                queue,
                cache,
                owned_caches,
                ingestors,
                driver,
            });
        }

        Ok(Self {
            identity: config.identity.clone(),
            config,
            leader,
            elector,
            controllers,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn leader_status(&self) -> LeaderStatus {
        self.leader.clone()
    }

    /// Every cache the engine fills, primary and owned
    pub fn caches(&self) -> Vec<ResourceCache> {
        self.controllers
            .iter()
            .flat_map(|c| std::iter::once(c.cache.clone()).chain(c.owned_caches.iter().cloned()))
            .collect()
    }

    /// Cache of a reconciled kind
    pub fn cache(&self, kind: &str) -> Option<ResourceCache> {
        self.controllers
            .iter()
            .find(|c| c.kind == kind)
            .map(|c| c.cache.clone())
    }

    /// Work queue of a reconciled kind
    pub fn queue(&self, kind: &str) -> Option<Arc<WorkQueue>> {
        self.controllers
            .iter()
            .find(|c| c.kind == kind)
            .map(|c| Arc::clone(&c.queue))
    }

    /// Run until `cancel` fires, then shut down within the grace period
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let span = tracing::info_span!("engine", identity = %self.identity);
        self.run_inner(cancel).instrument(span).await
    }

    async fn run_inner(self, cancel: CancellationToken) -> Result<()> {
        let Self {
            identity,
            config,
            leader,
            elector,
            controllers,
        } = self;
        info!(kinds = controllers.len(), "Starting engine");

        // The lease outlives the workers so writes stay fenced until they finish
        let election_cancel = CancellationToken::new();
        let election = elector.map(|elector| {
            tokio::spawn(elector.run(election_cancel.clone()).in_current_span())
        });

        let ingest_cancel = CancellationToken::new();
        let mut ingestors = JoinSet::new();
        let mut drivers = JoinSet::new();
        let mut queues = Vec::with_capacity(controllers.len());
        let mut primary_caches = Vec::with_capacity(controllers.len());

        for controller in controllers {
            for ingestor in controller.ingestors {
                ingestors.spawn(ingestor.run(ingest_cancel.clone()).in_current_span());
            }
            drivers.spawn(controller.driver.run(cancel.clone()).in_current_span());
            primary_caches.push((controller.cache, Arc::clone(&controller.queue)));
            queues.push(controller.queue);
        }

        let promotions = tokio::spawn(
            enqueue_on_promotion(leader, primary_caches, cancel.clone()).in_current_span(),
        );

        cancel.cancelled().await;
        info!("Shutdown requested, draining reconciles");

        for queue in &queues {
            queue.shutdown();
        }

        let grace = config.shutdown_grace();
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = drivers.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Driver task failed");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(grace = ?grace, "In-flight reconciles outlived the grace period, aborting them");
            drivers.abort_all();
        }

        ingest_cancel.cancel();
        while let Some(joined) = ingestors.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Ingestor task failed");
            }
        }

        if let Err(e) = promotions.await {
            warn!(error = %e, "Promotion task failed");
        }

        election_cancel.cancel();
        if let Some(election) = election {
            election.await.context("Leader election task failed")?;
        }

        info!(identity = %identity, "Engine stopped");
        Ok(())
    }
}

/// Enqueue every cached primary object each time this replica becomes leader
async fn enqueue_on_promotion(
    leader: LeaderStatus,
    targets: Vec<(ResourceCache, Arc<WorkQueue>)>,
    cancel: CancellationToken,
) {
    let mut rx = leader.subscribe();
    let mut was_leading = rx.borrow_and_update().is_leading();

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let leading = rx.borrow_and_update().is_leading();
        if leading && !was_leading {
            for (cache, queue) in &targets {
                let keys = cache.keys();
                debug!(kind = %queue.kind(), count = keys.len(), "Promoted, enqueuing cached objects");
                for key in keys {
                    queue.add(key);
                }
            }
        }
        was_leading = leading;
    }
}
