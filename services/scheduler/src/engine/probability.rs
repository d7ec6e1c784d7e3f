//! Dispatch probabilities and their feasibility adjustments.
//!
//! A [`Probabilities`] tuple is a distribution over the four [`Decision`]s.
//! Before sampling, the tuple of a (function, class) entry is restricted to
//! the options that are feasible for the request at hand:
//!
//! ```text
//! offloading forbidden   -> {local, drop}   ({drop} if local is infeasible)
//! local infeasible       -> {edge, cloud, drop} ∩ topology
//! otherwise              -> {local, edge, cloud, drop} ∩ topology
//! ```
//!
//! Restriction always renormalizes the original values over the surviving
//! options; when they carry no mass a fixed fallback split is used instead.

use std::fmt;
use std::str::FromStr;

use edgeflow_function::Decision;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Sum tolerance used when validating a tuple.
pub const TOLERANCE: f64 = 1e-6;

/// Order in which the unit interval is partitioned when sampling.
pub const SEGMENT_ORDER: [Decision; 4] = [
    Decision::ExecuteLocal,
    Decision::OffloadEdge,
    Decision::OffloadCloud,
    Decision::Drop,
];

// =============================================================================
// Topology
// =============================================================================

/// Offloading topology of the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Offload to nearby edge nodes and to the cloud.
    EdgeCloud,
    /// Offload to the cloud only.
    CloudOnly,
}

impl Topology {
    /// Whether requests may be sent to an edge node.
    pub fn allows_edge(&self) -> bool {
        matches!(self, Topology::EdgeCloud)
    }

    /// Offload decisions available under this topology, most preferred first.
    pub fn offload_tiers(&self) -> &'static [Decision] {
        match self {
            Topology::EdgeCloud => &[Decision::OffloadEdge, Decision::OffloadCloud],
            Topology::CloudOnly => &[Decision::OffloadCloud],
        }
    }

    /// Split used when local execution is infeasible and the offload options
    /// carry no probability mass.
    pub fn offload_fallback(&self) -> Probabilities {
        match self {
            Topology::EdgeCloud => Probabilities::new(0.0, 0.9, 0.1, 0.0),
            Topology::CloudOnly => Probabilities::new(0.0, 0.0, 1.0, 0.0),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Topology::EdgeCloud => "edgeCloud",
            Topology::CloudOnly => "cloudOnly",
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topology {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "edgecloud" | "edge_cloud" | "edge-cloud" => Ok(Topology::EdgeCloud),
            "cloudonly" | "cloud_only" | "cloud-only" => Ok(Topology::CloudOnly),
            _ => Err(ConfigError::UnknownPolicy(s.to_string())),
        }
    }
}

// =============================================================================
// Starting probabilities
// =============================================================================

/// Probabilities used to seed entries that have not been optimized yet.
///
/// The drop probability is whatever mass the other three leave.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StartingProbabilities {
    pub local: f64,
    pub edge: f64,
    pub cloud: f64,
}

impl Default for StartingProbabilities {
    fn default() -> Self {
        Self {
            local: 1.0,
            edge: 0.0,
            cloud: 0.0,
        }
    }
}

impl StartingProbabilities {
    /// Check that the seeds form a distribution together with the implied drop.
    pub fn validate(&self, topology: Topology) -> Result<(), ConfigError> {
        for (name, value) in [("local", self.local), ("edge", self.edge), ("cloud", self.cloud)] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidProbability {
                    name: name.to_string(),
                    value,
                });
            }
        }

        let sum = self.local + self.edge + self.cloud;
        if sum > 1.0 + TOLERANCE {
            return Err(ConfigError::ProbabilitySumExceeded(sum));
        }

        if !topology.allows_edge() && self.edge > 0.0 {
            return Err(ConfigError::EdgeSeedWithoutEdge(self.edge));
        }

        Ok(())
    }

    /// Full tuple, with drop taking the remaining mass.
    pub fn to_probabilities(&self) -> Probabilities {
        let drop = (1.0 - (self.local + self.edge + self.cloud)).max(0.0);
        Probabilities::new(self.local, self.edge, self.cloud, drop)
    }
}

// =============================================================================
// Probabilities
// =============================================================================

/// Distribution over {execute local, offload edge, offload cloud, drop}.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Probabilities {
    pub local: f64,
    pub edge: f64,
    pub cloud: f64,
    pub drop: f64,
}

impl Probabilities {
    pub const fn new(local: f64, edge: f64, cloud: f64, drop: f64) -> Self {
        Self {
            local,
            edge,
            cloud,
            drop,
        }
    }

    /// All mass on one option.
    pub fn certain(decision: Decision) -> Self {
        let mut p = Self::default();
        p.set(decision, 1.0);
        p
    }

    pub fn get(&self, decision: Decision) -> f64 {
        match decision {
            Decision::ExecuteLocal => self.local,
            Decision::OffloadEdge => self.edge,
            Decision::OffloadCloud => self.cloud,
            Decision::Drop => self.drop,
        }
    }

    pub fn set(&mut self, decision: Decision, value: f64) {
        match decision {
            Decision::ExecuteLocal => self.local = value,
            Decision::OffloadEdge => self.edge = value,
            Decision::OffloadCloud => self.cloud = value,
            Decision::Drop => self.drop = value,
        }
    }

    pub fn sum(&self) -> f64 {
        self.local + self.edge + self.cloud + self.drop
    }

    /// True if every component is finite and non-negative and they sum to 1.
    pub fn is_valid(&self) -> bool {
        SEGMENT_ORDER.iter().all(|d| {
            let v = self.get(*d);
            v.is_finite() && v >= 0.0
        }) && (self.sum() - 1.0).abs() <= TOLERANCE
    }

    /// Scale so the components sum to 1, or `None` if there is no mass.
    pub fn normalized(&self) -> Option<Self> {
        let sum = self.sum();
        if !sum.is_finite() || sum <= 0.0 {
            return None;
        }
        Some(Self::new(
            self.local / sum,
            self.edge / sum,
            self.cloud / sum,
            self.drop / sum,
        ))
    }

    /// Keep only `allowed` options, renormalized over their own sum.
    ///
    /// All values are read from `self` before any is written, so the result
    /// does not depend on the order of the options. If the allowed options
    /// carry no mass, `fallback` is returned.
    pub fn restrict(&self, allowed: &[Decision], fallback: Probabilities) -> Self {
        let mut kept = Self::default();
        for decision in allowed {
            let value = self.get(*decision);
            if value.is_finite() && value > 0.0 {
                kept.set(*decision, value);
            }
        }
        kept.normalized().unwrap_or(fallback)
    }

    /// Pick the option whose segment contains `u`.
    ///
    /// `[0, 1)` is split into contiguous segments in [`SEGMENT_ORDER`]. If
    /// rounding leaves `u` past the last boundary, the last option with
    /// positive probability is chosen.
    pub fn sample(&self, u: f64) -> Decision {
        let mut cumulative = 0.0;
        let mut last_positive = Decision::Drop;
        for decision in SEGMENT_ORDER {
            let value = self.get(decision);
            if value <= 0.0 {
                continue;
            }
            cumulative += value;
            last_positive = decision;
            if u < cumulative {
                return decision;
            }
        }
        last_positive
    }
}

impl fmt::Display for Probabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pL={:.4} pE={:.4} pC={:.4} pD={:.4}",
            self.local, self.edge, self.cloud, self.drop
        )
    }
}

/// Adjust an entry's tuple to what is feasible for one request.
pub fn feasible_distribution(
    base: Probabilities,
    topology: Topology,
    can_offload: bool,
    can_execute_locally: bool,
) -> Probabilities {
    if !can_offload {
        if can_execute_locally {
            return base.restrict(
                &[Decision::ExecuteLocal, Decision::Drop],
                Probabilities::certain(Decision::ExecuteLocal),
            );
        }
        return Probabilities::certain(Decision::Drop);
    }

    let mut allowed = Vec::with_capacity(SEGMENT_ORDER.len());
    if can_execute_locally {
        allowed.push(Decision::ExecuteLocal);
    }
    allowed.extend_from_slice(topology.offload_tiers());
    allowed.push(Decision::Drop);

    let fallback = if can_execute_locally {
        Probabilities::certain(Decision::ExecuteLocal)
    } else {
        topology.offload_fallback()
    };

    base.restrict(&allowed, fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[rstest]
    #[case(0.0, Decision::ExecuteLocal)]
    #[case(0.2999, Decision::ExecuteLocal)]
    #[case(0.3, Decision::OffloadEdge)]
    #[case(0.5, Decision::OffloadCloud)]
    #[case(0.95, Decision::Drop)]
    #[case(0.9999, Decision::Drop)]
    fn test_sample_segments(#[case] u: f64, #[case] expected: Decision) {
        let p = Probabilities::new(0.3, 0.2, 0.4, 0.1);
        assert_eq!(p.sample(u), expected);
    }

    #[test]
    fn test_sample_rounding_never_picks_zero_drop() {
        let p = Probabilities::new(0.3, 0.3, 0.3999999999, 0.0);
        assert_eq!(p.sample(0.99999999999), Decision::OffloadCloud);
    }

    #[test]
    fn test_restrict_uses_original_values() {
        // pD = 0.2, pL = 0.6 -> {local: 0.75, drop: 0.25} regardless of order
        let p = Probabilities::new(0.6, 0.1, 0.1, 0.2);
        let r = p.restrict(
            &[Decision::Drop, Decision::ExecuteLocal],
            Probabilities::certain(Decision::Drop),
        );
        assert_close(r.local, 0.75);
        assert_close(r.drop, 0.25);
        assert_eq!(r.edge, 0.0);
        assert_eq!(r.cloud, 0.0);
    }

    #[test]
    fn test_restrict_degenerate_uses_fallback() {
        let p = Probabilities::certain(Decision::ExecuteLocal);
        let r = p.restrict(
            &[Decision::OffloadEdge, Decision::OffloadCloud, Decision::Drop],
            Topology::EdgeCloud.offload_fallback(),
        );
        assert_eq!(r, Probabilities::new(0.0, 0.9, 0.1, 0.0));
    }

    #[rstest]
    #[case(true, Decision::ExecuteLocal)]
    #[case(false, Decision::Drop)]
    fn test_no_offload_all_zero_assigns_by_feasibility(
        #[case] can_execute: bool,
        #[case] expected: Decision,
    ) {
        let base = Probabilities::new(0.0, 0.5, 0.5, 0.0);
        let p = feasible_distribution(base, Topology::EdgeCloud, false, can_execute);
        assert_eq!(p, Probabilities::certain(expected));
    }

    #[test]
    fn test_cloud_only_local_infeasible_falls_back_to_cloud() {
        let base = Probabilities::certain(Decision::ExecuteLocal);
        let p = feasible_distribution(base, Topology::CloudOnly, true, false);
        assert_eq!(p, Probabilities::certain(Decision::OffloadCloud));
    }

    #[test]
    fn test_cloud_only_removes_edge_mass() {
        let base = Probabilities::new(0.5, 0.25, 0.25, 0.0);
        let p = feasible_distribution(base, Topology::CloudOnly, true, true);
        assert_eq!(p.edge, 0.0);
        assert_close(p.local, 2.0 / 3.0);
        assert_close(p.cloud, 1.0 / 3.0);
    }

    #[test]
    fn test_local_infeasible_renormalizes_offload_options() {
        let base = Probabilities::new(0.5, 0.1, 0.3, 0.1);
        let p = feasible_distribution(base, Topology::EdgeCloud, true, false);
        assert_eq!(p.local, 0.0);
        assert_close(p.edge, 0.2);
        assert_close(p.cloud, 0.6);
        assert_close(p.drop, 0.2);
    }

    #[test]
    fn test_starting_probabilities_validation() {
        let ok = StartingProbabilities::default();
        assert!(ok.validate(Topology::EdgeCloud).is_ok());
        assert_eq!(ok.to_probabilities(), Probabilities::certain(Decision::ExecuteLocal));

        let too_much = StartingProbabilities {
            local: 0.7,
            edge: 0.2,
            cloud: 0.2,
        };
        assert!(matches!(
            too_much.validate(Topology::EdgeCloud),
            Err(ConfigError::ProbabilitySumExceeded(_))
        ));

        let edge_seed = StartingProbabilities {
            local: 0.5,
            edge: 0.5,
            cloud: 0.0,
        };
        assert!(matches!(
            edge_seed.validate(Topology::CloudOnly),
            Err(ConfigError::EdgeSeedWithoutEdge(_))
        ));
    }

    #[test]
    fn test_topology_parse() {
        assert_eq!("edgeCloud".parse::<Topology>().unwrap(), Topology::EdgeCloud);
        assert_eq!("cloud_only".parse::<Topology>().unwrap(), Topology::CloudOnly);
        assert!(matches!(
            "roundRobin".parse::<Topology>(),
            Err(ConfigError::UnknownPolicy(_))
        ));
    }

    fn arb_tuple() -> impl Strategy<Value = Probabilities> {
        (0.0f64..1.0, 0.0f64..1.0, 0.0f64..1.0, 0.0f64..1.0).prop_map(|(l, e, c, d)| {
            Probabilities::new(l, e, c, d)
                .normalized()
                .unwrap_or(Probabilities::certain(Decision::Drop))
        })
    }

    fn arb_topology() -> impl Strategy<Value = Topology> {
        prop_oneof![Just(Topology::EdgeCloud), Just(Topology::CloudOnly)]
    }

    proptest! {
        #[test]
        fn prop_feasible_distribution_is_valid(
            base in arb_tuple(),
            topology in arb_topology(),
            can_offload in any::<bool>(),
            can_execute in any::<bool>(),
        ) {
            let p = feasible_distribution(base, topology, can_offload, can_execute);
            prop_assert!(p.is_valid(), "invalid tuple {p:?}");
            prop_assert!((p.sum() - 1.0).abs() < 1e-9);
        }

        #[test]
        fn prop_forbidden_offload_never_offloads(
            base in arb_tuple(),
            topology in arb_topology(),
            can_execute in any::<bool>(),
            u in 0.0f64..1.0,
        ) {
            let p = feasible_distribution(base, topology, false, can_execute);
            let decision = p.sample(u);
            prop_assert!(decision != Decision::OffloadEdge && decision != Decision::OffloadCloud);
        }

        #[test]
        fn prop_infeasible_local_never_executes_locally(
            base in arb_tuple(),
            topology in arb_topology(),
            can_offload in any::<bool>(),
            u in 0.0f64..1.0,
        ) {
            let p = feasible_distribution(base, topology, can_offload, false);
            prop_assert_ne!(p.sample(u), Decision::ExecuteLocal);
        }

        #[test]
        fn prop_cloud_only_never_picks_edge(
            base in arb_tuple(),
            can_offload in any::<bool>(),
            can_execute in any::<bool>(),
            u in 0.0f64..1.0,
        ) {
            let p = feasible_distribution(base, Topology::CloudOnly, can_offload, can_execute);
            prop_assert_ne!(p.sample(u), Decision::OffloadEdge);
        }

        #[test]
        fn prop_certain_local_always_local(u in 0.0f64..1.0) {
            let p = Probabilities::certain(Decision::ExecuteLocal);
            prop_assert_eq!(p.sample(u), Decision::ExecuteLocal);
        }

        #[test]
        fn prop_certain_drop_always_drops(u in 0.0f64..1.0) {
            let p = Probabilities::certain(Decision::Drop);
            prop_assert_eq!(p.sample(u), Decision::Drop);
        }
    }
}
