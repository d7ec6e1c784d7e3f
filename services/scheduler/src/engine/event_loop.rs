//! Single-writer event loop.
//!
//! [`EngineState`] owns every piece of mutable scheduling state and is only
//! ever touched through [`EngineState::handle`], which is synchronous and
//! deterministic apart from the evaluation reseed. [`EventLoop`] is the
//! async driver: it multiplexes the inboxes, the two timers and the
//! shutdown signal, and publishes a [`DecisionSnapshot`] whenever the
//! decision-relevant state changes.

use std::collections::HashMap;
use std::sync::Arc;

use edgeflow_function::{ExecutionReport, Function, Location, Priority};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use super::probability::{Probabilities, Topology};
use super::snapshot::DecisionSnapshot;
use super::stats::{IncrementalMean, StatsStore};
use crate::config::EngineConfig;
use crate::node::Node;
use crate::solver::{Optimizer, SolveContext};

/// A request of (function, class) was admitted to `decide`.
#[derive(Debug, Clone)]
pub struct ArrivalEvent {
    pub function: Arc<Function>,
    pub class: Priority,
    pub max_response_time_ms: f64,
}

/// Final outcome of a request.
#[derive(Debug, Clone)]
pub enum CompletionEvent {
    Executed {
        function: String,
        class: Priority,
        location: Location,
        report: ExecutionReport,
    },
    Dropped {
        function: String,
        class: Priority,
    },
}

/// Administrative commands.
#[derive(Debug)]
pub enum AdminCommand {
    Delete { function: String, class: Priority },
    Evaluate,
}

/// Everything the state machine reacts to.
#[derive(Debug)]
pub enum EngineEvent {
    Arrival(ArrivalEvent),
    Completion(CompletionEvent),
    Evaluate,
    ResetColdStartWindow,
    Admin(AdminCommand),
}

/// Event-loop-owned scheduling state.
pub struct EngineState {
    config: EngineConfig,
    seed: Probabilities,
    store: StatsStore,
    offload_latency_cloud: IncrementalMean,
    offload_latency_edge: IncrementalMean,
    optimizer: Box<dyn Optimizer>,
    node: Arc<dyn Node>,
    rng: StdRng,
    draw_seed: u64,
    epoch: u64,
    requests_total: u64,
    completions_total: u64,
    drops_total: u64,
}

impl EngineState {
    pub fn new(config: EngineConfig, node: Arc<dyn Node>, optimizer: Box<dyn Optimizer>) -> Self {
        let mut rng = StdRng::from_os_rng();
        let draw_seed = rng.random();
        Self {
            seed: config.starting.to_probabilities(),
            config,
            store: StatsStore::new(),
            offload_latency_cloud: IncrementalMean::default(),
            offload_latency_edge: IncrementalMean::default(),
            optimizer,
            node,
            rng,
            draw_seed,
            epoch: 0,
            requests_total: 0,
            completions_total: 0,
            drops_total: 0,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &StatsStore {
        &self.store
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn drops_total(&self) -> u64 {
        self.drops_total
    }

    pub fn offload_latency_cloud_ms(&self) -> f64 {
        self.offload_latency_cloud.mean()
    }

    pub fn offload_latency_edge_ms(&self) -> f64 {
        self.offload_latency_edge.mean()
    }

    /// Apply one event. Returns true if a new snapshot should be published.
    pub fn handle(&mut self, event: EngineEvent) -> bool {
        match event {
            EngineEvent::Arrival(arrival) => {
                self.on_arrival(arrival);
                false
            }
            EngineEvent::Completion(completion) => {
                self.on_completion(completion);
                false
            }
            EngineEvent::Evaluate | EngineEvent::Admin(AdminCommand::Evaluate) => {
                self.evaluate();
                true
            }
            EngineEvent::ResetColdStartWindow => {
                self.reset_cold_start_window();
                false
            }
            EngineEvent::Admin(AdminCommand::Delete { function, class }) => {
                self.delete(&function, class)
            }
        }
    }

    fn on_arrival(&mut self, arrival: ArrivalEvent) {
        self.requests_total += 1;
        let interval_secs = self.config.evaluation_interval.as_secs_f64();

        let entry = self.store.class_entry(
            &arrival.function,
            arrival.class,
            self.seed,
            arrival.max_response_time_ms,
        );
        entry.window_arrivals += 1;
        entry.arrival_rate = entry.window_arrivals as f64 / interval_secs;
        entry.empty_windows = 0;
        entry.max_response_time_ms = arrival.max_response_time_ms;
    }

    fn on_completion(&mut self, completion: CompletionEvent) {
        match completion {
            CompletionEvent::Dropped { function, class } => {
                self.drops_total += 1;
                debug!(function = %function, class = %class, "Request dropped");
            }
            CompletionEvent::Executed {
                function,
                class,
                location,
                report,
            } => {
                self.completions_total += 1;

                let Some(info) = self.store.function_mut(&function) else {
                    debug!(
                        function = %function,
                        class = %class,
                        "Completion for untracked function ignored"
                    );
                    return;
                };
                info.record(location, &report);

                if report.offload_latency_cloud_ms > 0.0 {
                    self.offload_latency_cloud
                        .push(report.offload_latency_cloud_ms);
                }
                if report.offload_latency_edge_ms > 0.0 {
                    self.offload_latency_edge.push(report.offload_latency_edge_ms);
                }
            }
        }
    }

    /// Run one evaluation cycle.
    pub fn evaluate(&mut self) {
        self.rng = StdRng::from_os_rng();
        self.draw_seed = self.rng.random();
        self.epoch += 1;

        let max_empty = self.config.max_empty_windows;
        let mut expired = Vec::new();
        for info in self.store.functions_mut() {
            for entry in info.classes.values_mut() {
                if entry.window_arrivals == 0 {
                    entry.empty_windows += 1;
                    if entry.empty_windows >= max_empty {
                        expired.push((info.name.clone(), entry.class));
                    }
                }
            }
        }
        for (function, class) in expired {
            if self.store.delete(&function, class) {
                info!(
                    function = %function,
                    class = %class,
                    empty_windows = max_empty,
                    "Deleted idle entry"
                );
            }
        }

        let before: HashMap<(String, Priority), Probabilities> = self
            .store
            .functions()
            .flat_map(|f| {
                f.classes
                    .iter()
                    .map(|(class, entry)| ((f.name.clone(), *class), entry.probabilities))
            })
            .collect();

        let mut ctx = SolveContext {
            topology: self.config.topology,
            evaluation_interval: self.config.evaluation_interval,
            offload_latency_cloud_ms: self.offload_latency_cloud.mean(),
            offload_latency_edge_ms: self.offload_latency_edge.mean(),
            resources: self.node.resources(),
            rng: &mut self.rng,
        };
        self.optimizer.solve(&mut self.store, &mut ctx);

        let topology = self.config.topology;
        let seed = self.seed;
        for info in self.store.functions_mut() {
            for entry in info.classes.values_mut() {
                if !is_admissible(&entry.probabilities, topology) {
                    let restored = before
                        .get(&(info.name.clone(), entry.class))
                        .copied()
                        .unwrap_or(seed);
                    warn!(
                        function = %info.name,
                        class = %entry.class,
                        rejected = %entry.probabilities,
                        restored = %restored,
                        "Optimizer produced an invalid tuple, keeping the previous one"
                    );
                    entry.probabilities = restored;
                }

                entry.last_window_rate = entry.arrival_rate;
                entry.window_arrivals = 0;
                entry.arrival_rate = 0.0;
            }
        }

        debug!(
            epoch = self.epoch,
            optimizer = self.optimizer.name(),
            entries = self.store.entry_count(),
            "Evaluation complete"
        );
    }

    /// Start a fresh cold-start sampling window for every function.
    pub fn reset_cold_start_window(&mut self) {
        for info in self.store.functions_mut() {
            info.reset_cold_start_window();
        }
        debug!(functions = self.store.function_count(), "Cold-start window reset");
    }

    /// Remove a (function, class) entry. Returns true if it existed.
    pub fn delete(&mut self, function: &str, class: Priority) -> bool {
        let removed = self.store.delete(function, class);
        if removed {
            info!(function = %function, class = %class, "Deleted entry");
        }
        removed
    }

    pub fn snapshot(&self) -> DecisionSnapshot {
        DecisionSnapshot {
            epoch: self.epoch,
            draw_seed: self.draw_seed,
            entries: DecisionSnapshot::capture(&self.store),
            locations: DecisionSnapshot::capture_locations(&self.store),
            requests_total: self.requests_total,
            completions_total: self.completions_total,
            drops_total: self.drops_total,
            offload_latency_cloud_ms: self.offload_latency_cloud.mean(),
            offload_latency_edge_ms: self.offload_latency_edge.mean(),
        }
    }
}

fn is_admissible(p: &Probabilities, topology: Topology) -> bool {
    p.is_valid() && (topology.allows_edge() || p.edge == 0.0)
}

/// Async driver of an [`EngineState`].
pub struct EventLoop {
    state: EngineState,
    arrivals: mpsc::Receiver<ArrivalEvent>,
    completions: mpsc::Receiver<CompletionEvent>,
    admin: mpsc::Receiver<AdminCommand>,
    snapshots: watch::Sender<Arc<DecisionSnapshot>>,
}

impl EventLoop {
    pub(super) fn new(
        state: EngineState,
        arrivals: mpsc::Receiver<ArrivalEvent>,
        completions: mpsc::Receiver<CompletionEvent>,
        admin: mpsc::Receiver<AdminCommand>,
        snapshots: watch::Sender<Arc<DecisionSnapshot>>,
    ) -> Self {
        Self {
            state,
            arrivals,
            completions,
            admin,
            snapshots,
        }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// Apply one event and publish if needed.
    pub fn dispatch(&mut self, event: EngineEvent) {
        if self.state.handle(event) {
            self.publish();
        }
    }

    /// Apply every queued message without waiting. Arrivals go first so an
    /// arrival is always seen before the completion of the same request.
    pub fn drain(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(arrival) = self.arrivals.try_recv() {
            self.dispatch(EngineEvent::Arrival(arrival));
            applied += 1;
        }
        while let Ok(completion) = self.completions.try_recv() {
            self.dispatch(EngineEvent::Completion(completion));
            applied += 1;
        }
        while let Ok(command) = self.admin.try_recv() {
            self.dispatch(EngineEvent::Admin(command));
            applied += 1;
        }
        applied
    }

    fn drain_arrivals(&mut self) {
        while let Ok(arrival) = self.arrivals.try_recv() {
            self.dispatch(EngineEvent::Arrival(arrival));
        }
    }

    /// Apply queued arrivals and completions, leaving admin commands queued.
    fn drain_notifications(&mut self) {
        self.drain_arrivals();
        while let Ok(completion) = self.completions.try_recv() {
            self.dispatch(EngineEvent::Completion(completion));
        }
    }

    pub fn publish(&self) {
        self.snapshots.send_replace(Arc::new(self.state.snapshot()));
    }

    /// Run until the shutdown signal fires or every producer is gone.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let evaluation_period = self.state.config().evaluation_interval;
        let cold_start_period = self.state.config().cold_start_window;

        info!(
            evaluation_interval_secs = evaluation_period.as_secs_f64(),
            cold_start_window_secs = cold_start_period.as_secs_f64(),
            topology = %self.state.config().topology,
            "Starting decision engine event loop"
        );

        // interval_at skips the immediate first tick.
        let mut evaluation = time::interval_at(Instant::now() + evaluation_period, evaluation_period);
        let mut cold_start_window =
            time::interval_at(Instant::now() + cold_start_period, cold_start_period);
        evaluation.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        cold_start_window.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        self.publish();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = evaluation.tick() => {
                    self.drain_notifications();
                    self.dispatch(EngineEvent::Evaluate);
                }
                _ = cold_start_window.tick() => self.dispatch(EngineEvent::ResetColdStartWindow),
                Some(arrival) = self.arrivals.recv() => {
                    self.dispatch(EngineEvent::Arrival(arrival));
                }
                Some(completion) = self.completions.recv() => {
                    self.drain_arrivals();
                    self.dispatch(EngineEvent::Completion(completion));
                }
                Some(command) = self.admin.recv() => {
                    self.drain_notifications();
                    self.dispatch(EngineEvent::Admin(command));
                }
            }
        }

        info!(
            epoch = self.state.epoch(),
            drops = self.state.drops_total(),
            "Decision engine event loop stopped"
        );
    }
}
