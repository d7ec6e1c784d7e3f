//! edgeflow scheduler
//!
//! Runs the decision engine of one edge node next to its container pool.
//!
//! ## Architecture
//!
//! - **Decision Engine**: event loop owning statistics and probabilities
//! - **Policy**: executes each decision on the pool or a remote tier
//! - **Local Node**: warm container pool with memory/CPU accounting
//! - **Executor**: execution transport (mock in dev)
//! - **Diagnostics Loop**: periodic dump of the engine state
//! - **Synthetic Workload**: optional request generator for local runs

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use edgeflow_function::{Function, Priority, Request, RequestQoS};
use edgeflow_scheduler::config::Config;
use edgeflow_scheduler::diagnostics::run_diagnostics_loop;
use edgeflow_scheduler::node::{run_expiration_loop, LocalNode, Node};
use edgeflow_scheduler::resources::HostCapacity;
use edgeflow_scheduler::transport::{Executor, MockExecutor};
use edgeflow_scheduler::{DecisionEngine, OffloadPolicy, Policy};
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("invalid configuration")?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        node_id = %config.node_id,
        topology = %config.engine.topology,
        optimizer = %config.engine.optimizer,
        evaluation_interval_secs = config.engine.evaluation_interval.as_secs(),
        container_expiration_secs = config.engine.cold_start_window.as_secs(),
        "Starting edgeflow scheduler"
    );

    let host = HostCapacity::measure();
    let memory_mb = config.pool_memory_mb.unwrap_or(host.available_memory_mb);
    let cpus = config.pool_cpus.unwrap_or(host.cpus);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let executor: Arc<dyn Executor> = Arc::new(MockExecutor::new());
    let local_node = Arc::new(LocalNode::new(memory_mb, cpus, Arc::clone(&executor)));
    let node: Arc<dyn Node> = local_node.clone();

    let (engine, engine_handle) = DecisionEngine::start(
        config.engine.clone(),
        Arc::clone(&node),
        config.engine.optimizer.build(),
    )?;

    let policy = Arc::new(OffloadPolicy::new(
        engine.clone(),
        Arc::clone(&node),
        Arc::clone(&executor),
    ));

    let expiration_handle = tokio::spawn(run_expiration_loop(
        local_node,
        config.engine.cold_start_window,
        shutdown_rx.clone(),
    ));

    let diagnostics_handle = config.diagnostics_interval.map(|interval| {
        tokio::spawn(run_diagnostics_loop(
            engine.clone(),
            Arc::clone(&node),
            interval,
            shutdown_rx.clone(),
        ))
    });

    let workload_handle = (config.synthetic_rps > 0.0).then(|| {
        tokio::spawn(run_synthetic_workload(
            Arc::clone(&policy),
            config.synthetic_rps,
            shutdown_rx.clone(),
        ))
    });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
        }
        result = engine_handle => {
            match result {
                Ok(()) => info!("Decision engine exited"),
                Err(e) => error!(error = %e, "Decision engine task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);
    engine.shutdown();

    info!("Waiting for workers to shut down...");
    let _ = expiration_handle.await;
    if let Some(handle) = diagnostics_handle {
        let _ = handle.await;
    }
    if let Some(handle) = workload_handle {
        let _ = handle.await;
    }

    info!("Scheduler shutdown complete");
    Ok(())
}

/// Generate requests for a few demo functions at `rps` requests per second.
async fn run_synthetic_workload(
    policy: Arc<OffloadPolicy>,
    rps: f64,
    mut shutdown: watch::Receiver<bool>,
) {
    let functions = [
        Arc::new(Function::new("thumbnail", 128, 0.25)),
        Arc::new(Function::new("transcode", 1024, 1.0)),
        Arc::new(Function::new("classify", 512, 0.5)),
    ];
    let classes = [
        RequestQoS::new(Priority::Low, 500.0),
        RequestQoS::new(Priority::HighPerformance, 150.0),
        RequestQoS::new(Priority::HighAvailability, 300.0),
    ];

    info!(rps, "Starting synthetic workload");
    let period = Duration::from_secs_f64(1.0 / rps).max(Duration::from_micros(100));
    let mut timer = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = timer.tick() => {
                let (function, qos, offload) = {
                    let mut rng = rand::rng();
                    (
                        Arc::clone(&functions[rng.random_range(0..functions.len())]),
                        classes[rng.random_range(0..classes.len())],
                        rng.random_bool(0.9),
                    )
                };
                let policy = Arc::clone(&policy);
                tokio::spawn(async move {
                    let mut request = Request::new(function).with_qos(qos).with_offloading(offload);
                    match policy.on_arrival(&mut request).await {
                        Ok(outcome) => debug!(
                            request = %request,
                            outcome = ?outcome,
                            response_time_ms = request.report.response_time_ms,
                            "Synthetic request finished"
                        ),
                        Err(e) => debug!(request = %request, error = %e, "Synthetic request failed"),
                    }
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Synthetic workload shutting down");
                    break;
                }
            }
        }
    }
}
