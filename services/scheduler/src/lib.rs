//! # edgeflow-scheduler
//!
//! Admission control and placement for a serverless edge node. For every
//! invocation the scheduler decides whether to run the function locally,
//! forward it to a nearby edge node or the cloud, or drop it, and keeps
//! re-tuning those odds from observed latencies and cold starts.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────┐  decide / completed   ┌──────────────────┐
//!   request ────► │ OffloadPolicy│ ─────────────────────► │ DecisionEngine   │
//!                 └──────┬───────┘                        │  (handle)        │
//!                        │                                └────────┬─────────┘
//!            ┌───────────┴────────────┐                    inboxes │  ▲ snapshot
//!            ▼                        ▼                            ▼  │
//!     ┌─────────────┐         ┌──────────────┐             ┌──────────────────┐
//!     │ Node        │         │ Executor     │             │ EventLoop        │
//!     │ (warm pool) │ ──────► │ (transport)  │             │  StatsStore      │
//!     └─────────────┘         └──────────────┘             │  Optimizer       │
//!                                                          └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: decision handle, event loop, statistics, probability model
//! - [`solver`]: probability optimizers
//! - [`policy`]: turns decisions into executions
//! - [`node`]: local container pool and resource accounting
//! - [`transport`]: execution transport interface, retries, mock
//! - [`diagnostics`]: periodic operator dump
//! - [`config`]: environment configuration

pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod node;
pub mod policy;
pub mod resources;
pub mod solver;
pub mod transport;

pub use config::{Config, ConfigError, EngineConfig};
pub use engine::{DecisionEngine, DecisionSnapshot, EngineError, EventLoop};
pub use policy::{OffloadPolicy, Outcome, Policy, PolicyError};
