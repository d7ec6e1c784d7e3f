//! Periodic operator dump of the engine state.
//!
//! Reads only published snapshots, never the loop-owned maps. The output is
//! meant for humans and carries no stability guarantee.

use std::sync::Arc;
use std::time::Duration;

use edgeflow_function::Priority;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::{debug, info};

use crate::engine::{DecisionEngine, DecisionSnapshot, EntrySnapshot};
use crate::node::Node;

/// Entries of a snapshot ordered by function name, then class.
pub fn sorted_entries(snapshot: &DecisionSnapshot) -> Vec<(&str, Priority, &EntrySnapshot)> {
    let mut entries: Vec<_> = snapshot
        .entries
        .iter()
        .flat_map(|(function, classes)| {
            classes
                .iter()
                .map(move |(class, entry)| (function.as_str(), *class, entry))
        })
        .collect();
    entries.sort_by(|a, b| a.0.cmp(b.0).then(a.1.cmp(&b.1)));
    entries
}

fn dump(engine: &DecisionEngine, node: &dyn Node) {
    let snapshot = engine.snapshot();
    let resources = node.resources();

    info!(
        epoch = snapshot.epoch,
        entries = snapshot.entry_count(),
        requests = snapshot.requests_total,
        completions = snapshot.completions_total,
        drops = snapshot.drops_total,
        rejected = engine.rejected_notifications(),
        offload_latency_cloud_ms = snapshot.offload_latency_cloud_ms,
        offload_latency_edge_ms = snapshot.offload_latency_edge_ms,
        available_memory_mb = resources.available_memory_mb,
        available_cpus = resources.available_cpus,
        busy_containers = resources.busy_containers,
        "Engine status"
    );

    for (function, class, entry) in sorted_entries(&snapshot) {
        let p = entry.probabilities;
        info!(
            function,
            class = %class,
            p_local = p.local,
            p_edge = p.edge,
            p_cloud = p.cloud,
            p_drop = p.drop,
            arrival_rate = entry.last_window_rate,
            empty_windows = entry.empty_windows,
            "Entry status"
        );
    }
}

/// Run the diagnostics loop until shutdown.
pub async fn run_diagnostics_loop(
    engine: DecisionEngine,
    node: Arc<dyn Node>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "Starting diagnostics loop");

    let mut timer = time::interval_at(Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = timer.tick() => dump(&engine, node.as_ref()),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Diagnostics loop shutting down");
                    break;
                }
            }
        }
    }
}
