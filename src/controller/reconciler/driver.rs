//! # Reconciler Driver
//!
//! Worker pool for one reconciled kind.
//!
//! Each worker loops `Idle -> Dequeued -> Running -> {Success | Requeue | Drop}`:
//! wait for leadership, take a key from the queue, look the object up in the
//! cache, run the kind's reconcile (or cleanup if the object is gone) and hand
//! the result to [`decide`]. Errors and panics never escape a worker.
//!
//! Cancellation only stops dequeuing. A reconcile that already started runs to
//! completion (bounded by the reconcile timeout) so it never stops mid-write.

use super::error_policy::{decide, Outcome};
use super::status::report_failure;
use super::types::{Action, Context, Reconcilable, ReconcileError};
use crate::config::ControllerConfig;
use crate::controller::cache::ResourceCache;
use crate::controller::client::Client;
use crate::controller::queue::WorkQueue;
use crate::crd::ObjectKey;
use crate::observability::metrics;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Driver tuning
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub workers: usize,
    pub max_retries: u32,
    pub reconcile_timeout: Duration,
}

impl From<&ControllerConfig> for DriverConfig {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            workers: config.workers,
            max_retries: config.max_retries,
            reconcile_timeout: config.reconcile_timeout(),
        }
    }
}

pub struct Driver {
    reconciler: Arc<dyn Reconcilable>,
    queue: Arc<WorkQueue>,
    cache: ResourceCache,
    client: Client,
    config: DriverConfig,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("kind", &self.reconciler.kind())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Driver {
    pub fn new(
        reconciler: Arc<dyn Reconcilable>,
        queue: Arc<WorkQueue>,
        cache: ResourceCache,
        client: Client,
        config: DriverConfig,
    ) -> Self {
        Self {
            reconciler,
            queue,
            cache,
            client,
            config,
        }
    }

    pub fn kind(&self) -> &str {
        self.reconciler.kind()
    }

    /// Run the reconcile for `ctx.key` with panics caught and time bounded
    async fn invoke(&self, ctx: &Context) -> Result<Action, ReconcileError> {
        let run = async {
            match self.cache.get(&ctx.key) {
                Some(resource) => self.reconciler.reconcile(resource, ctx).await,
                None => {
                    debug!("Object no longer cached, running cleanup");
                    self.reconciler.cleanup(&ctx.key, ctx).await
                }
            }
        };

        match tokio::time::timeout(self.config.reconcile_timeout, AssertUnwindSafe(run).catch_unwind()).await {
            Ok(Ok(result)) => result,
            Ok(Err(payload)) => {
                let message = panic_message(payload.as_ref());
                error!(panic = %message, "Reconcile panicked");
                Err(ReconcileError::Panicked(message))
            }
            Err(_) => Err(ReconcileError::transient(format!(
                "reconcile exceeded {:?}",
                self.config.reconcile_timeout
            ))),
        }
    }

    /// Write a failure onto the object's status. The object may be gone.
    async fn surface_failure(&self, key: &ObjectKey, reason: &str, message: &str) {
        let Some(resource) = self.cache.get(key) else {
            debug!("Object gone, nothing to report failure on");
            return;
        };
        if let Err(e) = report_failure(&self.client, &resource, reason, message).await {
            warn!(error = %e, reason, "Failed to record failure on status");
        }
    }

    /// One full pass over a dequeued key. Always ends with `done`.
    async fn process(&self, key: ObjectKey) {
        let kind = self.kind().to_string();
        let failures = self.queue.num_requeues(&key);
        let ctx = Context {
            client: self.client.clone(),
            cache: self.cache.clone(),
            key: key.clone(),
            attempt: failures.saturating_add(1),
        };

        metrics::increment_reconciliations(&kind);
        let start = Instant::now();
        let result = self.invoke(&ctx).await;
        metrics::observe_reconciliation_duration(&kind, start.elapsed().as_secs_f64());

        let outcome = decide(&result, failures, self.config.max_retries);
        if let Err(e) = &result {
            metrics::increment_reconciliation_errors(&kind, e.class().as_str());
        }

        match (outcome, result) {
            (Outcome::Success { requeue_after }, _) => {
                self.queue.forget(&key);
                if let Some(delay) = requeue_after {
                    debug!(delay = ?delay, "Scheduling recheck");
                    metrics::increment_requeues(&kind, "recheck");
                    self.queue.add_after(key.clone(), delay);
                }
            }
            (Outcome::Retry, Err(e)) => {
                let delay = self.queue.add_rate_limited(key.clone());
                metrics::increment_requeues(&kind, "backoff");
                warn!(
                    error = %e,
                    class = e.class().as_str(),
                    attempt = ctx.attempt,
                    retry_in = ?delay,
                    "Reconcile failed, will retry"
                );
            }
            (Outcome::RetriesExhausted, Err(e)) => {
                error!(
                    error = %e,
                    attempts = ctx.attempt,
                    "Reconcile failed, retries exhausted"
                );
                self.queue.forget(&key);
                let message = format!("giving up after {} attempts: {}", ctx.attempt, e.message());
                self.surface_failure(&key, "RetriesExhausted", &message).await;
            }
            (Outcome::Terminal, Err(e)) => {
                error!(error = %e, reason = e.reason(), "Reconcile failed permanently");
                self.queue.forget(&key);
                self.surface_failure(&key, e.reason(), &e.message()).await;
            }
            (Outcome::Deferred, _) => {
                info!("Write fenced off after losing leadership, deferring key");
                metrics::increment_requeues(&kind, "not_leader");
                self.queue.add(key.clone());
            }
            (_, Ok(_)) => {}
        }

        self.queue.done(&key);
    }

    async fn worker(self: Arc<Self>, id: usize, cancel: CancellationToken) {
        let leader = self.client.leader().clone();
        debug!(kind = %self.kind(), worker = id, "Worker started");

        loop {
            if !leader.is_leader() {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = leader.wait_until_leader() => {}
                }
            }

            let key = tokio::select! {
                () = cancel.cancelled() => break,
                () = leader.wait_until_lost() => continue,
                key = self.queue.get() => key,
            };
            let Some(key) = key else {
                break;
            };

            // Leadership may have flipped while the key was being handed out
            if !leader.is_leader() {
                self.queue.add(key.clone());
                self.queue.done(&key);
                continue;
            }

            let span = tracing::info_span!(
                "reconcile",
                resource.kind = %self.kind(),
                resource.key = %key,
                worker = id
            );
            self.process(key).instrument(span).await;
        }

        debug!(kind = %self.kind(), worker = id, "Worker stopped");
    }

    /// Run the worker pool until `cancel` fires and every in-flight reconcile returns
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let workers = self.config.workers.max(1);
        info!(kind = %self.kind(), workers, "Starting reconcile workers");

        let mut set = JoinSet::new();
        for id in 0..workers {
            set.spawn(Arc::clone(&self).worker(id, cancel.clone()));
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(kind = %self.kind(), error = %e, "Reconcile worker aborted");
            }
        }
        info!(kind = %self.kind(), "Reconcile workers stopped");
    }
}
