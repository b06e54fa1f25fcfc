//! Common test utilities for engine integration tests
//!
//! Provides fast engine configuration, a handle for running engines in the
//! background, and polling helpers for asserting eventual state.

#![allow(dead_code)]

use async_trait::async_trait;
use operator_engine::config::ControllerConfig;
use operator_engine::controller::reconciler::{
    Action, Context, Reconcilable, ReconcileError, ReconcilerRegistry,
};
use operator_engine::crd::{ObjectKey, Resource, APP_SERVICE_KIND, DEPLOYMENT_KIND};
use operator_engine::runtime::Engine;
use operator_engine::store::{InMemoryLease, InMemoryStore, LeaseLock, Store};
use serde_json::json;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const NAMESPACE: &str = "default";

/// Upper bound for every `eventually` poll
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

static TRACING_INIT: Once = Once::new();

/// Install a test subscriber once per test binary; honours `RUST_LOG`
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "operator_engine=warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Configuration with millisecond backoffs and no leader election
pub fn fast_config(identity: &str) -> ControllerConfig {
    ControllerConfig {
        workers: 4,
        backoff_start_ms: 5,
        backoff_max_ms: 50,
        max_retries: 3,
        reconcile_timeout_secs: 5,
        watch_restart_delay_ms: 5,
        watch_restart_delay_max_ms: 50,
        resync_period_secs: 0,
        shutdown_grace_secs: 5,
        leader_election_enabled: false,
        identity: identity.to_string(),
        ..ControllerConfig::default()
    }
}

/// Configuration with leader election on the shortest timings that validate
pub fn elected_config(identity: &str) -> ControllerConfig {
    ControllerConfig {
        leader_election_enabled: true,
        lease_duration_secs: 3,
        renew_deadline_secs: 2,
        retry_period_secs: 1,
        ..fast_config(identity)
    }
}

pub fn registry_with(reconciler: Arc<dyn Reconcilable>) -> ReconcilerRegistry {
    let mut registry = ReconcilerRegistry::new();
    registry.register(reconciler).expect("register reconciler");
    registry
}

pub fn app_service(name: &str, replicas: i64, image: &str) -> Resource {
    Resource::new(
        APP_SERVICE_KIND,
        NAMESPACE,
        name,
        json!({ "replicas": replicas, "image": image }),
    )
}

pub fn key(name: &str) -> ObjectKey {
    ObjectKey::new(NAMESPACE, name)
}

/// An engine running on a background task
pub struct RunningEngine {
    pub identity: String,
    pub engine_cancel: CancellationToken,
    pub handle: JoinHandle<anyhow::Result<()>>,
    pub leader: operator_engine::controller::leader::LeaderStatus,
    pub caches: Vec<operator_engine::controller::cache::ResourceCache>,
    pub primary_cache: Option<operator_engine::controller::cache::ResourceCache>,
    pub queue: Option<Arc<operator_engine::controller::queue::WorkQueue>>,
}

impl RunningEngine {
    pub fn start(
        store: &Arc<InMemoryStore>,
        lease: &Arc<InMemoryLease>,
        registry: ReconcilerRegistry,
        config: ControllerConfig,
        primary_kind: &str,
    ) -> Self {
        init_tracing();
        let engine = Engine::new(
            Arc::clone(store) as Arc<dyn Store>,
            Arc::clone(lease) as Arc<dyn LeaseLock>,
            registry,
            config,
        )
        .expect("build engine");

        let identity = engine.identity().to_string();
        let leader = engine.leader_status();
        let caches = engine.caches();
        let primary_cache = engine.cache(primary_kind);
        let queue = engine.queue(primary_kind);
        let engine_cancel = CancellationToken::new();
        let handle = tokio::spawn(engine.run(engine_cancel.clone()));

        Self {
            identity,
            engine_cancel,
            handle,
            leader,
            caches,
            primary_cache,
            queue,
        }
    }

    /// Wait until the primary queue is drained and no key is in flight
    pub async fn wait_quiet(&self) {
        let Some(queue) = &self.queue else {
            return;
        };
        eventually("queue drained", || async { queue.is_empty() }).await;
        tokio::time::timeout(WAIT_TIMEOUT, queue.wait_idle())
            .await
            .expect("queue never went idle");
    }

    /// Wait until every cache of this engine has completed its initial list
    pub async fn wait_synced(&self) {
        for cache in &self.caches {
            tokio::time::timeout(WAIT_TIMEOUT, cache.wait_synced())
                .await
                .expect("cache sync timed out");
        }
    }

    pub async fn stop(self) {
        self.engine_cancel.cancel();
        tokio::time::timeout(WAIT_TIMEOUT, self.handle)
            .await
            .expect("engine did not stop in time")
            .expect("engine task panicked")
            .expect("engine returned an error");
    }
}

/// Start an `AppService` engine without election
pub fn start_app_engine(store: &Arc<InMemoryStore>, identity: &str) -> RunningEngine {
    RunningEngine::start(
        store,
        &Arc::new(InMemoryLease::new()),
        registry_with(Arc::new(
            operator_engine::controller::appservice::AppServiceReconciler::new(),
        )),
        fast_config(identity),
        APP_SERVICE_KIND,
    )
}

/// Wraps a reconciler and counts how often it ran
pub struct Counting<R> {
    pub inner: R,
    pub reconciles: AtomicUsize,
}

impl<R> Counting<R> {
    pub fn new(inner: R) -> Arc<Self> {
        Arc::new(Self {
            inner,
            reconciles: AtomicUsize::new(0),
        })
    }

    pub fn count(&self) -> usize {
        self.reconciles.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<R: Reconcilable> Reconcilable for Counting<R> {
    fn kind(&self) -> &str {
        self.inner.kind()
    }

    fn owned_kinds(&self) -> Vec<String> {
        self.inner.owned_kinds()
    }

    async fn reconcile(&self, resource: Arc<Resource>, ctx: &Context) -> Result<Action, ReconcileError> {
        self.reconciles.fetch_add(1, Ordering::SeqCst);
        self.inner.reconcile(resource, ctx).await
    }
}

/// Read-modify-write `kind/name`, retrying when the engine wrote in between
pub async fn mutate<F>(store: &InMemoryStore, kind: &str, name: &str, mut f: F) -> Resource
where
    F: FnMut(&mut Resource),
{
    for _ in 0..50 {
        let mut obj = store.get(kind, &key(name)).await.expect("object exists");
        f(&mut obj);
        match store.update(obj).await {
            Ok(updated) => return updated,
            Err(e) if e.is_conflict() => continue,
            Err(e) => panic!("update of {kind} {name} failed: {e}"),
        }
    }
    panic!("update of {kind} {name} kept conflicting");
}

/// Poll `check` until it returns true; panics after [`WAIT_TIMEOUT`]
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Current `spec.replicas` of the `Deployment` named `name`, if it exists
pub async fn deployment_replicas(store: &InMemoryStore, name: &str) -> Option<i64> {
    store
        .get(DEPLOYMENT_KIND, &key(name))
        .await
        .ok()
        .and_then(|d| d.spec["replicas"].as_i64())
}

/// `Ready` condition `(status, reason)` of the `AppService` named `name`
pub async fn ready_condition(store: &InMemoryStore, kind: &str, name: &str) -> Option<(String, String)> {
    let obj = store.get(kind, &key(name)).await.ok()?;
    let condition = obj.status?.condition("Ready")?.clone();
    Some((condition.status, condition.reason.unwrap_or_default()))
}
