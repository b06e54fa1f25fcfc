//! # Operator Engine
//!
//! Runs the reconciliation engine against an in-memory store seeded from YAML
//! manifests.
//!
//! ## Usage
//!
//! ```bash
//! # Run three replicas; one leads, the others stand by with warm caches
//! operator-engine run --manifests appservices.yaml --replicas 3
//!
//! # Print the configuration resolved from the environment
//! operator-engine check-config
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use operator_engine::config::ControllerConfig;
use operator_engine::crd::load_manifests;
use operator_engine::runtime::initialize;
use operator_engine::store::InMemoryStore;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Declarative reconciliation engine
#[derive(Parser)]
#[command(name = "operator-engine", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run engine replicas against a shared in-memory store
    Run {
        /// Multi-document YAML file with the initial objects
        #[arg(short, long, value_name = "FILE")]
        manifests: PathBuf,

        /// Number of replicas competing for the lease
        #[arg(short, long, default_value_t = 1)]
        replicas: usize,

        /// Interval of the garbage collection sweep for orphaned children, in milliseconds
        #[arg(long, default_value_t = 1000)]
        gc_interval_ms: u64,
    },
    /// Validate and print the configuration resolved from the environment
    #[command(name = "check-config")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            manifests,
            replicas,
            gc_interval_ms,
        } => run(manifests, replicas, Duration::from_millis(gc_interval_ms.max(1))).await,
        Commands::CheckConfig => check_config(),
    }
}

fn check_config() -> Result<()> {
    let config = ControllerConfig::from_env();
    config.validate().context("Configuration is invalid")?;
    println!("{config:#?}");
    Ok(())
}

async fn run(manifests: PathBuf, replicas: usize, gc_interval: Duration) -> Result<()> {
    let config = ControllerConfig::from_env();
    let resources = load_manifests(&manifests)?;

    let shutdown = CancellationToken::new();
    // The server outlives the engines so /metrics stays up while they drain
    let server_shutdown = CancellationToken::new();
    let init = initialize(config, resources, replicas, server_shutdown.clone()).await?;

    let mut engines = JoinSet::new();
    for engine in init.engines {
        engines.spawn(engine.run(shutdown.clone()));
    }

    let gc = tokio::spawn(run_garbage_collector(
        Arc::clone(&init.store),
        gc_interval,
        shutdown.clone(),
    ));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("Received shutdown signal (SIGINT/SIGTERM), initiating graceful shutdown...");
        }
        Some(joined) = engines.join_next() => {
            error!(result = ?joined.map(|r| r.map_err(|e| e.to_string())), "Engine stopped unexpectedly, shutting down");
        }
    }

    init.server_state.is_ready.store(false, Ordering::Relaxed);
    shutdown.cancel();

    while let Some(joined) = engines.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Engine shutdown failed"),
            Err(e) => error!(error = %e, "Engine task panicked"),
        }
    }
    gc.await.context("Garbage collector task failed")?;

    server_shutdown.cancel();
    init.server.await.context("HTTP server task failed")?;

    info!("Operator engine stopped");
    Ok(())
}

/// Delete children whose controller owner is gone, until `cancel` fires
async fn run_garbage_collector(store: Arc<InMemoryStore>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                let collected = store.collect_garbage();
                if collected > 0 {
                    info!(collected, "Garbage collected orphaned objects");
                } else {
                    debug!("Garbage collection found nothing to delete");
                }
            }
        }
    }
}
