//! Read-only view of the engine state published by the event loop.

use std::collections::HashMap;

use edgeflow_function::{Location, Priority};
use serde::Serialize;

use super::probability::Probabilities;
use super::stats::StatsStore;

/// Published state of one (function, class) entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EntrySnapshot {
    pub probabilities: Probabilities,
    pub arrival_rate: f64,
    pub last_window_rate: f64,
    pub window_arrivals: u64,
    pub empty_windows: u32,
}

/// Published execution statistics of one function at one location.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LocationSnapshot {
    pub invocations: u64,
    pub mean_duration_ms: f64,
    pub cold_starts: u64,
    pub window_completions: u64,
    pub cold_start_probability: f64,
    pub bandwidth_kbps: f64,
}

/// Immutable copy of the decision-relevant engine state.
///
/// A new snapshot is published after every evaluation and every
/// administrative delete; `decide` only ever reads the latest one.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DecisionSnapshot {
    /// Number of evaluations completed when the snapshot was taken.
    pub epoch: u64,

    /// Seed for the per-thread uniform draws of this epoch.
    #[serde(skip)]
    pub draw_seed: u64,

    pub entries: HashMap<String, HashMap<Priority, EntrySnapshot>>,

    /// Locations a function has completed at.
    pub locations: HashMap<String, HashMap<Location, LocationSnapshot>>,

    pub requests_total: u64,
    pub completions_total: u64,
    pub drops_total: u64,

    pub offload_latency_cloud_ms: f64,
    pub offload_latency_edge_ms: f64,
}

impl DecisionSnapshot {
    pub(crate) fn capture(store: &StatsStore) -> HashMap<String, HashMap<Priority, EntrySnapshot>> {
        store
            .functions()
            .map(|f| {
                let classes = f
                    .classes
                    .iter()
                    .map(|(class, entry)| {
                        (
                            *class,
                            EntrySnapshot {
                                probabilities: entry.probabilities,
                                arrival_rate: entry.arrival_rate,
                                last_window_rate: entry.last_window_rate,
                                window_arrivals: entry.window_arrivals,
                                empty_windows: entry.empty_windows,
                            },
                        )
                    })
                    .collect();
                (f.name.clone(), classes)
            })
            .collect()
    }

    pub(crate) fn capture_locations(
        store: &StatsStore,
    ) -> HashMap<String, HashMap<Location, LocationSnapshot>> {
        store
            .functions()
            .map(|f| {
                let locations = Location::ALL
                    .into_iter()
                    .map(|location| (location, f.location(location)))
                    .filter(|(_, stats)| stats.invocations() > 0)
                    .map(|(location, stats)| {
                        (
                            location,
                            LocationSnapshot {
                                invocations: stats.invocations(),
                                mean_duration_ms: stats.duration.mean(),
                                cold_starts: stats.cold_starts,
                                window_completions: stats.window_completions,
                                cold_start_probability: stats.cold_start_probability,
                                bandwidth_kbps: stats.bandwidth.mean(),
                            },
                        )
                    })
                    .collect();
                (f.name.clone(), locations)
            })
            .collect()
    }

    pub fn entry(&self, function: &str, class: Priority) -> Option<&EntrySnapshot> {
        self.entries.get(function)?.get(&class)
    }

    /// Probabilities of an entry, if it is tracked.
    pub fn probabilities(&self, function: &str, class: Priority) -> Option<Probabilities> {
        self.entry(function, class).map(|e| e.probabilities)
    }

    pub fn location(&self, function: &str, location: Location) -> Option<&LocationSnapshot> {
        self.locations.get(function)?.get(&location)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }
}
