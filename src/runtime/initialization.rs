//! # Initialization
//!
//! Process startup: tracing, metrics, the shared store and lease, one engine
//! per replica and the HTTP server.

use crate::config::ControllerConfig;
use crate::controller::appservice::AppServiceReconciler;
use crate::controller::reconciler::ReconcilerRegistry;
use crate::controller::server::{start_server, ServerState};
use crate::crd::Resource;
use crate::observability;
use crate::runtime::engine::Engine;
use crate::store::{InMemoryLease, InMemoryStore, LeaseLock, Store};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// How long to wait for the HTTP listener before giving up
const SERVER_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
const SERVER_STARTUP_POLL: Duration = Duration::from_millis(50);

/// Everything the binary needs to run
pub struct InitializationResult {
    /// Store shared by every replica
    pub store: Arc<InMemoryStore>,
    /// One engine per replica, each with its own identity
    pub engines: Vec<Engine>,
    /// Server state for health checks
    pub server_state: Arc<ServerState>,
    /// HTTP server task, stopped by the shutdown token
    pub server: JoinHandle<()>,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("engines", &self.engines)
            .field("server_ready", &self.server_state.is_ready())
            .finish_non_exhaustive()
    }
}

/// Registry with every kind this binary reconciles
pub fn default_registry() -> Result<ReconcilerRegistry> {
    let mut registry = ReconcilerRegistry::new();
    registry.register(Arc::new(AppServiceReconciler::new()))?;
    Ok(registry)
}

/// Identity of replica `index` out of `replicas`
pub fn replica_identity(base: &str, index: usize, replicas: usize) -> String {
    if replicas <= 1 {
        base.to_string()
    } else {
        format!("{base}-{index}")
    }
}

/// Build `replicas` engines over one store and one lease
pub fn build_engines(
    store: &Arc<InMemoryStore>,
    lease: &Arc<InMemoryLease>,
    config: &ControllerConfig,
    replicas: usize,
) -> Result<Vec<Engine>> {
    (0..replicas.max(1))
        .map(|index| {
            let config = ControllerConfig {
                identity: replica_identity(&config.identity, index, replicas),
                ..config.clone()
            };
            Engine::new(
                Arc::clone(store) as Arc<dyn Store>,
                Arc::clone(lease) as Arc<dyn LeaseLock>,
                default_registry()?,
                config,
            )
            .with_context(|| format!("Failed to build engine for replica {index}"))
        })
        .collect()
}

/// Initialize the process
///
/// This function handles:
/// - Tracing subscriber setup
/// - Metrics registration
/// - Store seeding from manifests
/// - Engine construction for every replica
/// - HTTP server startup
pub async fn initialize(
    config: ControllerConfig,
    manifests: Vec<Resource>,
    replicas: usize,
    shutdown: CancellationToken,
) -> Result<InitializationResult> {
    observability::init_tracing(&config.log_level, &config.log_format)?;
    config.validate().context("Invalid controller configuration")?;

    info!("Starting operator engine v{}", env!("CARGO_PKG_VERSION"));

    observability::metrics::register_metrics().context("Failed to register metrics")?;

    let store = Arc::new(InMemoryStore::default());
    let seeded = manifests.len();
    store.seed(manifests).context("Failed to seed store from manifests")?;
    info!(objects = seeded, "Store seeded");

    let lease = Arc::new(InMemoryLease::new());
    let engines = build_engines(&store, &lease, &config, replicas)?;

    let caches = engines.iter().flat_map(Engine::caches).collect();
    let leaders = engines
        .iter()
        .map(|engine| (engine.identity().to_string(), engine.leader_status()))
        .collect();
    let server_state = Arc::new(ServerState::new(caches, leaders));

    let port = config.metrics_port;
    let state = Arc::clone(&server_state);
    let server = tokio::spawn(async move {
        if let Err(e) = start_server(port, state, shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });
    wait_for_server_ready(port, &server).await?;
    server_state.mark_ready();

    info!(replicas = engines.len(), "Engine initialized, starting replicas...");

    Ok(InitializationResult {
        store,
        engines,
        server_state,
        server,
    })
}

/// Poll until the HTTP listener accepts connections
async fn wait_for_server_ready(port: u16, server: &JoinHandle<()>) -> Result<()> {
    let deadline = tokio::time::Instant::now() + SERVER_STARTUP_TIMEOUT;
    loop {
        if server.is_finished() {
            anyhow::bail!("HTTP server exited during startup");
        }
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            info!(port, "HTTP server is ready");
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("HTTP server did not start within {SERVER_STARTUP_TIMEOUT:?}");
        }
        tokio::time::sleep(SERVER_STARTUP_POLL).await;
    }
}
