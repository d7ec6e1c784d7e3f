//! Decision engine.
//!
//! The engine has two halves:
//! - [`DecisionEngine`]: a cheap, cloneable handle used on request paths.
//!   `decide` reads the latest published [`DecisionSnapshot`] and never
//!   blocks; arrival and completion notifications are non-blocking sends.
//! - [`EventLoop`]: the single task that owns and mutates every statistic
//!   and probability.
//!
//! ```text
//!   decide() ──try_send──► arrivals ───┐
//!   completed() ─try_send─► completions ├──► EventLoop ──watch──► DecisionSnapshot
//!   delete() ────send────► admin ───────┘      ▲    ▲                    │
//!                               evaluation timer    cold-start timer     ▼
//!                                                                  decide()
//! ```

mod draw;
mod event_loop;
mod inbox;
pub mod probability;
mod snapshot;
pub mod stats;

use std::sync::Arc;

use edgeflow_function::{Decision, FunctionError, Location, Priority, Request};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, EngineConfig};
use crate::node::Node;
use crate::solver::Optimizer;

pub use event_loop::{AdminCommand, ArrivalEvent, CompletionEvent, EngineEvent, EngineState, EventLoop};
pub use inbox::{inbox, InboxKind, InboxSender};
pub use probability::{feasible_distribution, Probabilities, StartingProbabilities, Topology};
pub use snapshot::{DecisionSnapshot, EntrySnapshot, LocationSnapshot};

/// Decision engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{kind} inbox is full")]
    InboxFull { kind: InboxKind },

    #[error("decision engine is stopped")]
    Stopped,

    #[error(transparent)]
    InvalidLocation(#[from] FunctionError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Handle to a running decision engine.
#[derive(Clone)]
pub struct DecisionEngine {
    topology: Topology,
    seed: Probabilities,
    node: Arc<dyn Node>,
    arrivals: InboxSender<ArrivalEvent>,
    completions: InboxSender<CompletionEvent>,
    admin: InboxSender<AdminCommand>,
    snapshots: watch::Receiver<Arc<DecisionSnapshot>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl DecisionEngine {
    /// Build an engine and its event loop without starting the loop.
    ///
    /// Tests use this to step the loop by hand.
    pub fn build(
        config: EngineConfig,
        node: Arc<dyn Node>,
        optimizer: Box<dyn Optimizer>,
    ) -> Result<(Self, EventLoop), EngineError> {
        config.validate()?;

        let (arrivals, arrivals_rx) = inbox(InboxKind::Arrivals, config.inbox_capacity);
        let (completions, completions_rx) = inbox(InboxKind::Completions, config.inbox_capacity);
        let (admin, admin_rx) = inbox(InboxKind::Admin, config.inbox_capacity);

        let topology = config.topology;
        let seed = config.starting.to_probabilities();
        let state = EngineState::new(config, Arc::clone(&node), optimizer);
        let (snapshots_tx, snapshots) = watch::channel(Arc::new(state.snapshot()));
        let (shutdown, _) = watch::channel(false);

        let engine = Self {
            topology,
            seed,
            node,
            arrivals,
            completions,
            admin,
            snapshots,
            shutdown: Arc::new(shutdown),
        };
        let event_loop = EventLoop::new(state, arrivals_rx, completions_rx, admin_rx, snapshots_tx);

        Ok((engine, event_loop))
    }

    /// Build the engine and spawn its event loop.
    ///
    /// Fails on invalid configuration. Must be called from a tokio runtime.
    pub fn start(
        config: EngineConfig,
        node: Arc<dyn Node>,
        optimizer: Box<dyn Optimizer>,
    ) -> Result<(Self, JoinHandle<()>), EngineError> {
        info!(
            topology = %config.topology,
            optimizer = optimizer.name(),
            starting = %config.starting.to_probabilities(),
            "Starting decision engine"
        );

        let (engine, event_loop) = Self::build(config, node, optimizer)?;
        let handle = tokio::spawn(event_loop.run(engine.shutdown.subscribe()));
        Ok((engine, handle))
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Choose what to do with `request`.
    pub fn decide(&self, request: &Request) -> Decision {
        let draw_seed = self.snapshots.borrow().draw_seed;
        self.decide_with_draw(request, draw::uniform(draw_seed))
    }

    /// [`decide`](Self::decide) with an explicit uniform draw in `[0, 1)`.
    pub fn decide_with_draw(&self, request: &Request, u: f64) -> Decision {
        let function = request.function_name();
        let class = request.class();

        let base = self
            .snapshots
            .borrow()
            .probabilities(function, class)
            .unwrap_or(self.seed);
        let can_execute = self.node.can_execute(&request.function);
        let probabilities =
            feasible_distribution(base, self.topology, request.can_do_offloading, can_execute);
        let decision = probabilities.sample(u);

        debug!(
            request = %request,
            class = %class,
            can_execute,
            can_offload = request.can_do_offloading,
            probabilities = %probabilities,
            u,
            decision = %decision,
            "Scheduling decision"
        );

        let arrival = ArrivalEvent {
            function: Arc::clone(&request.function),
            class,
            max_response_time_ms: request.qos.max_response_time_ms,
        };
        if let Err(e) = self.arrivals.try_send(arrival) {
            warn!(function = %function, error = %e, "Arrival notification lost");
        }

        if decision == Decision::Drop {
            if let Err(e) = self.dropped(request) {
                warn!(function = %function, error = %e, "Drop notification lost");
            }
        }

        decision
    }

    /// Report the completion of a non-dropped request.
    pub fn completed(&self, request: &Request, location: Location) -> Result<(), EngineError> {
        self.completions.try_send(CompletionEvent::Executed {
            function: request.function_name().to_string(),
            class: request.class(),
            location,
            report: request.report.clone(),
        })
    }

    /// Report a completion with a raw location code.
    ///
    /// Codes outside {0 = local, 1 = cloud, 2 = edge} are rejected.
    pub fn completed_at(&self, request: &Request, location: i64) -> Result<(), EngineError> {
        let location = Location::try_from(location).map_err(|e| {
            error!(request = %request, error = %e, "Completion reported with invalid location");
            e
        })?;
        self.completed(request, location)
    }

    /// Report a request that ended without executing.
    pub fn dropped(&self, request: &Request) -> Result<(), EngineError> {
        self.completions.try_send(CompletionEvent::Dropped {
            function: request.function_name().to_string(),
            class: request.class(),
        })
    }

    /// Remove a (function, class) entry.
    pub async fn delete(&self, function: &str, class: Priority) -> Result<(), EngineError> {
        self.admin
            .send(AdminCommand::Delete {
                function: function.to_string(),
                class,
            })
            .await
    }

    /// Run an evaluation now instead of waiting for the timer.
    pub async fn evaluate_now(&self) -> Result<(), EngineError> {
        self.admin.send(AdminCommand::Evaluate).await
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<DecisionSnapshot> {
        Arc::clone(&self.snapshots.borrow())
    }

    /// Receiver notified at every publication.
    pub fn subscribe(&self) -> watch::Receiver<Arc<DecisionSnapshot>> {
        self.snapshots.clone()
    }

    /// Notifications rejected because an inbox was full.
    pub fn rejected_notifications(&self) -> u64 {
        self.arrivals.rejected() + self.completions.rejected() + self.admin.rejected()
    }

    /// Stop the event loop.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}
