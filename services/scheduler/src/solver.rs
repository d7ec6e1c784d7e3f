//! Probability optimizers.
//!
//! An optimizer rewrites the probability tuple of every tracked
//! (function, class) entry at each evaluation. The event loop validates
//! whatever comes back, so an optimizer only has to aim for tuples that
//! sum to 1; it must not add or remove entries.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use edgeflow_function::{Decision, Location, Priority};
use rand::rngs::StdRng;
use rand::Rng;

use crate::config::ConfigError;
use crate::engine::probability::{Probabilities, Topology};
use crate::engine::stats::{FunctionInfo, StatsStore};
use crate::node::ResourceSnapshot;

/// Share of traffic kept on a slow local tier so its statistics stay fresh.
pub const EXPLORATION_SHARE: f64 = 0.05;

/// Upper bound on the number of Erlang-B servers.
pub const MAX_SERVERS: u64 = 10_000;

/// Inputs of one evaluation besides the statistics store.
pub struct SolveContext<'a> {
    pub topology: Topology,
    pub evaluation_interval: Duration,
    pub offload_latency_cloud_ms: f64,
    pub offload_latency_edge_ms: f64,
    pub resources: ResourceSnapshot,

    /// Generator reseeded for this evaluation.
    pub rng: &'a mut StdRng,
}

/// Probability optimizer.
pub trait Optimizer: Send {
    fn name(&self) -> &'static str;

    /// Recompute the probabilities of every entry in `store`.
    fn solve(&mut self, store: &mut StatsStore, ctx: &mut SolveContext<'_>);
}

/// Selectable optimizers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    ResponseTime,
    Static,
}

impl OptimizerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizerKind::ResponseTime => "response_time",
            OptimizerKind::Static => "static",
        }
    }

    pub fn build(&self) -> Box<dyn Optimizer> {
        match self {
            OptimizerKind::ResponseTime => Box::new(ResponseTimeOptimizer::default()),
            OptimizerKind::Static => Box::new(StaticOptimizer),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptimizerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "response_time" | "response-time" | "responsetime" => Ok(OptimizerKind::ResponseTime),
            "static" => Ok(OptimizerKind::Static),
            _ => Err(ConfigError::UnknownOptimizer(s.to_string())),
        }
    }
}

// =============================================================================
// Static
// =============================================================================

/// Keeps every tuple as seeded.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticOptimizer;

impl Optimizer for StaticOptimizer {
    fn name(&self) -> &'static str {
        "static"
    }

    fn solve(&mut self, _store: &mut StatsStore, _ctx: &mut SolveContext<'_>) {}
}

// =============================================================================
// Response time
// =============================================================================

/// Erlang-B blocking probability for `servers` servers and `offered_load`
/// Erlangs.
pub fn erlang_b(servers: u64, offered_load: f64) -> f64 {
    if !offered_load.is_finite() || offered_load <= 0.0 {
        return if servers == 0 { 1.0 } else { 0.0 };
    }
    let mut blocking = 1.0;
    for k in 1..=servers {
        blocking = offered_load * blocking / (k as f64 + offered_load * blocking);
    }
    blocking
}

/// Heuristic optimizer steering each class toward tiers that meet its
/// response-time target.
///
/// Expected response time of a tier is its mean duration plus the
/// cold-start probability times the mean init time, plus the smoothed
/// network latency for remote tiers. A tier without observations counts as
/// optimistic (network latency only), so it gets tried. Local capacity is
/// modelled as an Erlang loss system with one server per container that
/// fits in node memory.
#[derive(Debug, Clone, Copy)]
pub struct ResponseTimeOptimizer {
    pub exploration_share: f64,
}

impl Default for ResponseTimeOptimizer {
    fn default() -> Self {
        Self {
            exploration_share: EXPLORATION_SHARE,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TierEstimate {
    decision: Decision,
    response_ms: f64,
}

impl ResponseTimeOptimizer {
    fn local_blocking(info: &FunctionInfo, resources: &ResourceSnapshot) -> f64 {
        let servers = if info.memory_mb > 0 {
            (resources.total_memory_mb.max(0) / info.memory_mb) as u64
        } else {
            MAX_SERVERS
        }
        .min(MAX_SERVERS);

        let local_rate: f64 = info
            .classes
            .values()
            .map(|c| c.arrival_rate * c.probabilities.local)
            .sum();
        let mean_local_s = info.location(Location::Local).duration.mean() / 1000.0;

        erlang_b(servers, local_rate * mean_local_s)
    }

    fn offload_estimates(info: &FunctionInfo, ctx: &SolveContext<'_>) -> Vec<TierEstimate> {
        ctx.topology
            .offload_tiers()
            .iter()
            .map(|decision| {
                let (location, network_ms) = match decision {
                    Decision::OffloadEdge => (Location::Edge, ctx.offload_latency_edge_ms),
                    _ => (Location::Cloud, ctx.offload_latency_cloud_ms),
                };
                let execution_ms = info.location(location).expected_response_ms().unwrap_or(0.0);
                TierEstimate {
                    decision: *decision,
                    response_ms: execution_ms + network_ms,
                }
            })
            .collect()
    }

    /// Fastest tier among `candidates`, ties broken at random.
    fn fastest(candidates: &[TierEstimate], rng: &mut StdRng) -> Option<TierEstimate> {
        let best = candidates
            .iter()
            .map(|t| t.response_ms)
            .fold(f64::INFINITY, f64::min);
        let ties: Vec<&TierEstimate> = candidates
            .iter()
            .filter(|t| t.response_ms <= best)
            .collect();
        match ties.len() {
            0 => None,
            1 => Some(*ties[0]),
            n => Some(*ties[rng.random_range(0..n)]),
        }
    }

    fn class_probabilities(
        &self,
        class: Priority,
        target_ms: f64,
        local_ms: f64,
        blocking: f64,
        tiers: &[TierEstimate],
        rng: &mut StdRng,
    ) -> Probabilities {
        let meeting: Vec<TierEstimate> = tiers
            .iter()
            .copied()
            .filter(|t| t.response_ms <= target_ms)
            .collect();
        let best_meeting = Self::fastest(&meeting, rng);
        let fastest = Self::fastest(tiers, rng);

        let admitted = (1.0 - blocking).clamp(0.0, 1.0);
        let explore = self.exploration_share * admitted;

        let (local, redirect) = if local_ms <= target_ms {
            let redirect = match (best_meeting, class) {
                (Some(t), _) => t.decision,
                (None, Priority::HighPerformance) => Decision::Drop,
                (None, _) => fastest.map_or(Decision::Drop, |t| t.decision),
            };
            (admitted, redirect)
        } else if let Some(t) = best_meeting {
            (explore, t.decision)
        } else if class == Priority::HighPerformance {
            (explore, Decision::Drop)
        } else {
            match fastest {
                Some(t) if t.response_ms < local_ms => (explore, t.decision),
                Some(t) => (admitted, t.decision),
                None => (admitted, Decision::Drop),
            }
        };

        let mut p = Probabilities::certain(Decision::ExecuteLocal);
        p.set(Decision::ExecuteLocal, local);
        p.set(redirect, p.get(redirect) + (1.0 - local));
        p.normalized()
            .unwrap_or(Probabilities::certain(Decision::ExecuteLocal))
    }
}

impl Optimizer for ResponseTimeOptimizer {
    fn name(&self) -> &'static str {
        "response_time"
    }

    fn solve(&mut self, store: &mut StatsStore, ctx: &mut SolveContext<'_>) {
        for info in store.functions_mut() {
            let blocking = Self::local_blocking(info, &ctx.resources);
            let local_ms = info
                .location(Location::Local)
                .expected_response_ms()
                .unwrap_or(0.0);
            let tiers = Self::offload_estimates(info, ctx);

            for entry in info.classes.values_mut() {
                entry.probabilities = self.class_probabilities(
                    entry.class,
                    entry.max_response_time_ms,
                    local_ms,
                    blocking,
                    &tiers,
                    ctx.rng,
                );
            }
        }
    }
}
