//! Integration tests for the decision engine.
//!
//! Most tests build the engine without spawning its loop and step the loop
//! by hand, which keeps them deterministic. The timer tests run the real
//! loop on a paused clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edgeflow_function::{Decision, ExecutionReport, Function, Location, Priority, Request, RequestQoS};
use edgeflow_scheduler::config::EngineConfig;
use edgeflow_scheduler::engine::stats::StatsStore;
use edgeflow_scheduler::engine::{
    EngineEvent, EventLoop, InboxKind, Probabilities, StartingProbabilities, Topology,
};
use edgeflow_scheduler::node::{ColdStart, ContainerHandle, Node, NodeError, ResourceSnapshot};
use edgeflow_scheduler::solver::{Optimizer, SolveContext, StaticOptimizer};
use edgeflow_scheduler::{DecisionEngine, EngineError};
use rstest::rstest;

/// Node whose local feasibility is set by the test.
struct FixedNode {
    feasible: AtomicBool,
}

impl FixedNode {
    fn new(feasible: bool) -> Arc<Self> {
        Arc::new(Self {
            feasible: AtomicBool::new(feasible),
        })
    }
}

#[async_trait]
impl Node for FixedNode {
    fn can_execute(&self, _function: &Function) -> bool {
        self.feasible.load(Ordering::SeqCst)
    }

    fn resources(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            total_memory_mb: 4096,
            available_memory_mb: 4096,
            total_cpus: 4.0,
            available_cpus: 4.0,
            ..ResourceSnapshot::default()
        }
    }

    fn warm_status(&self) -> HashMap<String, usize> {
        HashMap::new()
    }

    fn acquire_warm_container(&self, function: &Function) -> Result<ContainerHandle, NodeError> {
        Err(NodeError::NoWarmContainer(function.name.clone()))
    }

    async fn cold_start(&self, function: &Function) -> Result<ColdStart, NodeError> {
        Err(NodeError::InsufficientResources {
            function: function.name.clone(),
            memory_mb: function.memory_mb,
            cpu: function.cpu_demand,
        })
    }

    fn release_container(&self, _container: ContainerHandle) {}
}

/// Optimizer that writes a fixed tuple into every entry.
struct FixedOptimizer(Probabilities);

impl Optimizer for FixedOptimizer {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn solve(&mut self, store: &mut StatsStore, _ctx: &mut SolveContext<'_>) {
        for info in store.functions_mut() {
            for entry in info.classes.values_mut() {
                entry.probabilities = self.0;
            }
        }
    }
}

fn engine_with(
    config: EngineConfig,
    node: Arc<dyn Node>,
    optimizer: Box<dyn Optimizer>,
) -> (DecisionEngine, EventLoop) {
    DecisionEngine::build(config, node, optimizer).unwrap()
}

fn engine(config: EngineConfig) -> (DecisionEngine, EventLoop) {
    engine_with(config, FixedNode::new(true), Box::new(StaticOptimizer))
}

fn request(class: Priority) -> Request {
    Request::new(Arc::new(Function::new("f", 256, 0.5)))
        .with_qos(RequestQoS::new(class, 200.0))
}

fn cold_report(duration_ms: f64, init_time_ms: f64) -> ExecutionReport {
    ExecutionReport {
        duration_ms,
        init_time_ms,
        is_warm_start: false,
        ..ExecutionReport::default()
    }
}

#[test]
fn test_first_arrival_runs_locally_and_records_cold_start() {
    let (engine, mut event_loop) = engine(EngineConfig::default());

    let mut req = request(Priority::HighPerformance);
    assert_eq!(engine.decide_with_draw(&req, 0.73), Decision::ExecuteLocal);

    req.report = cold_report(120.0, 250.0);
    engine.completed(&req, Location::Local).unwrap();
    event_loop.drain();

    let store = event_loop.state().store();
    let entry = store.class("f", Priority::HighPerformance).unwrap();
    assert_eq!(entry.window_arrivals, 1);

    let local = store.function("f").unwrap().location(Location::Local);
    assert_eq!(local.duration.mean(), 120.0);
    assert_eq!(local.cold_starts, 1);
    assert_eq!(local.init_time.mean(), 250.0);
    assert_eq!(local.cold_start_probability, 1.0);
}

#[test]
fn test_entry_deleted_on_second_empty_cycle() {
    let config = EngineConfig {
        max_empty_windows: 2,
        ..EngineConfig::default()
    };
    let (engine, mut event_loop) = engine(config);

    engine.decide_with_draw(&request(Priority::Low), 0.5);
    event_loop.drain();

    // window with the arrival
    event_loop.dispatch(EngineEvent::Evaluate);
    assert!(engine.snapshot().entry("f", Priority::Low).is_some());

    // first empty window
    event_loop.dispatch(EngineEvent::Evaluate);
    let entry = engine.snapshot().entry("f", Priority::Low).copied().unwrap();
    assert_eq!(entry.empty_windows, 1);

    // second empty window
    event_loop.dispatch(EngineEvent::Evaluate);
    assert!(engine.snapshot().entry("f", Priority::Low).is_none());
    assert!(event_loop.state().store().is_empty());
}

#[test]
fn test_arrival_resets_empty_windows() {
    let config = EngineConfig {
        max_empty_windows: 2,
        ..EngineConfig::default()
    };
    let (engine, mut event_loop) = engine(config);
    let req = request(Priority::Low);

    engine.decide_with_draw(&req, 0.5);
    event_loop.drain();
    event_loop.dispatch(EngineEvent::Evaluate);
    event_loop.dispatch(EngineEvent::Evaluate);

    engine.decide_with_draw(&req, 0.5);
    event_loop.drain();
    let entry = event_loop.state().store().class("f", Priority::Low).unwrap();
    assert_eq!(entry.empty_windows, 0);

    event_loop.dispatch(EngineEvent::Evaluate);
    event_loop.dispatch(EngineEvent::Evaluate);
    assert!(event_loop.state().store().class("f", Priority::Low).is_some());
}

#[test]
fn test_arrival_rate_is_per_second() {
    let (engine, mut event_loop) = engine(EngineConfig::default());
    let req = request(Priority::Low);
    for _ in 0..5 {
        engine.decide_with_draw(&req, 0.1);
    }
    event_loop.drain();

    let entry = event_loop.state().store().class("f", Priority::Low).unwrap();
    assert!((entry.arrival_rate - 0.5).abs() < 1e-12);

    event_loop.dispatch(EngineEvent::Evaluate);
    let published = engine.snapshot().entry("f", Priority::Low).copied().unwrap();
    assert_eq!(published.window_arrivals, 0);
    assert!((published.last_window_rate - 0.5).abs() < 1e-12);
}

#[rstest]
#[case(0.0)]
#[case(0.25)]
#[case(0.999_999)]
fn test_certain_drop_sends_one_drop_notification(#[case] u: f64) {
    let config = EngineConfig {
        starting: StartingProbabilities {
            local: 0.0,
            edge: 0.0,
            cloud: 0.0,
        },
        ..EngineConfig::default()
    };
    let (engine, mut event_loop) = engine(config);

    assert_eq!(engine.decide_with_draw(&request(Priority::Low), u), Decision::Drop);
    event_loop.drain();
    event_loop.dispatch(EngineEvent::Evaluate);

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.drops_total, 1);
    assert_eq!(snapshot.requests_total, 1);
    assert_eq!(snapshot.completions_total, 0);
}

#[test]
fn test_forbidden_offload_never_offloads() {
    let config = EngineConfig {
        starting: StartingProbabilities {
            local: 0.2,
            edge: 0.4,
            cloud: 0.3,
        },
        ..EngineConfig::default()
    };
    let (engine, _event_loop) = engine_with(
        EngineConfig {
            inbox_capacity: 4096,
            ..config
        },
        FixedNode::new(true),
        Box::new(StaticOptimizer),
    );
    let req = request(Priority::Low).with_offloading(false);

    let mut seen = Vec::new();
    for i in 0..1000 {
        let u = i as f64 / 1000.0;
        let decision = engine.decide_with_draw(&req, u);
        assert!(!matches!(decision, Decision::OffloadEdge | Decision::OffloadCloud));
        seen.push(decision);
    }
    // local 0.2 / drop 0.1 renormalized: two thirds local
    let local = seen.iter().filter(|d| **d == Decision::ExecuteLocal).count();
    assert_eq!(local, 667);
}

#[test]
fn test_infeasible_local_never_runs_locally() {
    let node = FixedNode::new(false);
    let (engine, _event_loop) = engine_with(
        EngineConfig {
            inbox_capacity: 4096,
            ..EngineConfig::default()
        },
        node.clone(),
        Box::new(StaticOptimizer),
    );
    let req = request(Priority::Low);

    for i in 0..1000 {
        let u = i as f64 / 1000.0;
        assert_ne!(engine.decide_with_draw(&req, u), Decision::ExecuteLocal);
    }

    // all seed mass was local: the fallback split applies
    assert_eq!(engine.decide_with_draw(&req, 0.5), Decision::OffloadEdge);
    assert_eq!(engine.decide_with_draw(&req, 0.95), Decision::OffloadCloud);

    node.feasible.store(true, Ordering::SeqCst);
    assert_eq!(engine.decide_with_draw(&req, 0.95), Decision::ExecuteLocal);
}

#[test]
fn test_cloud_only_infeasible_local_goes_to_cloud() {
    let config = EngineConfig {
        topology: Topology::CloudOnly,
        ..EngineConfig::default()
    };
    let (engine, _event_loop) =
        engine_with(config, FixedNode::new(false), Box::new(StaticOptimizer));

    assert_eq!(
        engine.decide_with_draw(&request(Priority::Low), 0.0),
        Decision::OffloadCloud
    );
}

#[test]
fn test_invalid_location_code_is_rejected() {
    let (engine, mut event_loop) = engine(EngineConfig::default());
    let req = request(Priority::Low);
    engine.decide_with_draw(&req, 0.1);

    let err = engine.completed_at(&req, 7).unwrap_err();
    assert!(matches!(err, EngineError::InvalidLocation(_)));

    engine.completed_at(&req, 2).unwrap();
    event_loop.drain();
    let edge = event_loop.state().store().function("f").unwrap().location(Location::Edge);
    assert_eq!(edge.invocations(), 1);
}

#[test]
fn test_full_inbox_drops_notification_without_blocking() {
    let config = EngineConfig {
        inbox_capacity: 1,
        ..EngineConfig::default()
    };
    let (engine, mut event_loop) = engine(config);
    let req = request(Priority::Low);

    assert_eq!(engine.decide_with_draw(&req, 0.1), Decision::ExecuteLocal);
    assert_eq!(engine.decide_with_draw(&req, 0.1), Decision::ExecuteLocal);
    assert_eq!(engine.rejected_notifications(), 1);

    engine.completed(&req, Location::Local).unwrap();
    let err = engine.completed(&req, Location::Local).unwrap_err();
    assert!(matches!(
        err,
        EngineError::InboxFull {
            kind: InboxKind::Completions
        }
    ));

    assert_eq!(event_loop.drain(), 2);
}

#[test]
fn test_offload_latency_estimates_are_independent() {
    let (engine, mut event_loop) = engine(EngineConfig::default());
    let mut req = request(Priority::Low);
    engine.decide_with_draw(&req, 0.1);

    for latency in [80.0, 120.0] {
        req.report = ExecutionReport {
            duration_ms: 30.0,
            is_warm_start: true,
            offload_latency_cloud_ms: latency,
            ..ExecutionReport::default()
        };
        engine.completed(&req, Location::Cloud).unwrap();
    }
    req.report.offload_latency_cloud_ms = 0.0;
    req.report.offload_latency_edge_ms = 12.0;
    engine.completed(&req, Location::Edge).unwrap();
    event_loop.drain();

    assert_eq!(event_loop.state().offload_latency_cloud_ms(), 100.0);
    assert_eq!(event_loop.state().offload_latency_edge_ms(), 12.0);
}

#[test]
fn test_completion_for_untracked_function_is_ignored() {
    let (engine, mut event_loop) = engine(EngineConfig::default());
    let mut req = request(Priority::Low);
    req.report = cold_report(50.0, 100.0);

    engine.completed(&req, Location::Local).unwrap();
    event_loop.drain();

    assert!(event_loop.state().store().is_empty());
    event_loop.dispatch(EngineEvent::Evaluate);
    assert_eq!(engine.snapshot().completions_total, 1);
}

#[test]
fn test_cold_start_window_reset() {
    let (engine, mut event_loop) = engine(EngineConfig::default());
    let mut req = request(Priority::Low);
    engine.decide_with_draw(&req, 0.1);
    req.report = cold_report(100.0, 300.0);
    engine.completed(&req, Location::Local).unwrap();
    event_loop.drain();

    event_loop.dispatch(EngineEvent::ResetColdStartWindow);

    let local = event_loop.state().store().function("f").unwrap().location(Location::Local);
    assert_eq!(local.cold_starts, 0);
    assert_eq!(local.window_completions, 0);
    assert_eq!(local.cold_start_probability, 1.0);
    assert_eq!(local.invocations(), 1);
}

#[rstest]
#[case::nan(Topology::EdgeCloud, Probabilities::new(f64::NAN, 0.0, 0.0, 1.0))]
#[case::over_one(Topology::EdgeCloud, Probabilities::new(0.5, 0.5, 0.5, 0.5))]
#[case::negative(Topology::EdgeCloud, Probabilities::new(1.5, -0.5, 0.0, 0.0))]
#[case::edge_without_edge(Topology::CloudOnly, Probabilities::new(0.5, 0.5, 0.0, 0.0))]
fn test_invalid_optimizer_output_is_rejected(
    #[case] topology: Topology,
    #[case] output: Probabilities,
) {
    let config = EngineConfig {
        topology,
        ..EngineConfig::default()
    };
    let (engine, mut event_loop) = engine_with(
        config,
        FixedNode::new(true),
        Box::new(FixedOptimizer(output)),
    );

    engine.decide_with_draw(&request(Priority::Low), 0.1);
    event_loop.drain();
    event_loop.dispatch(EngineEvent::Evaluate);

    assert_eq!(
        engine.snapshot().probabilities("f", Priority::Low),
        Some(Probabilities::certain(Decision::ExecuteLocal))
    );
}

#[test]
fn test_optimizer_output_drives_later_decisions() {
    let (engine, mut event_loop) = engine_with(
        EngineConfig::default(),
        FixedNode::new(true),
        Box::new(FixedOptimizer(Probabilities::new(0.0, 0.0, 1.0, 0.0))),
    );
    let req = request(Priority::HighAvailability);

    assert_eq!(engine.decide_with_draw(&req, 0.5), Decision::ExecuteLocal);
    event_loop.drain();
    event_loop.dispatch(EngineEvent::Evaluate);

    assert_eq!(engine.decide_with_draw(&req, 0.5), Decision::OffloadCloud);
    // other classes of the same function keep the seed
    assert_eq!(
        engine.decide_with_draw(&request(Priority::Low), 0.5),
        Decision::ExecuteLocal
    );
}

#[tokio::test]
async fn test_admin_delete_publishes_snapshot() {
    let (engine, mut event_loop) = engine(EngineConfig::default());
    engine.decide_with_draw(&request(Priority::Low), 0.1);
    event_loop.drain();
    event_loop.dispatch(EngineEvent::Evaluate);
    assert_eq!(engine.snapshot().entry_count(), 1);

    engine.delete("f", Priority::Low).await.unwrap();
    event_loop.drain();

    assert_eq!(engine.snapshot().entry_count(), 0);
    assert!(event_loop.state().store().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_evaluation_timer_publishes_snapshots() {
    let (engine, handle) = DecisionEngine::start(
        EngineConfig::default(),
        FixedNode::new(true),
        Box::new(StaticOptimizer),
    )
    .unwrap();
    let mut snapshots = engine.subscribe();

    engine.decide_with_draw(&request(Priority::Low), 0.1);

    while snapshots.borrow_and_update().epoch < 1 {
        snapshots.changed().await.unwrap();
    }

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.epoch, 1);
    assert_eq!(snapshot.requests_total, 1);
    let entry = snapshot.entry("f", Priority::Low).copied().unwrap();
    assert!((entry.last_window_rate - 0.1).abs() < 1e-12);

    engine.shutdown();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cold_start_window_timer_resets_counters() {
    let config = EngineConfig {
        evaluation_interval: Duration::from_secs(10),
        cold_start_window: Duration::from_secs(25),
        max_empty_windows: 5,
        ..EngineConfig::default()
    };
    let (engine, handle) =
        DecisionEngine::start(config, FixedNode::new(true), Box::new(StaticOptimizer)).unwrap();
    let mut snapshots = engine.subscribe();

    let mut req = request(Priority::Low);
    engine.decide_with_draw(&req, 0.1);
    req.report = cold_report(100.0, 300.0);
    engine.completed(&req, Location::Local).unwrap();

    // t=20, before the window closes at t=25
    while snapshots.borrow_and_update().epoch < 2 {
        snapshots.changed().await.unwrap();
    }
    let local = *engine.snapshot().location("f", Location::Local).unwrap();
    assert_eq!(local.cold_starts, 1);
    assert_eq!(local.window_completions, 1);
    assert_eq!(local.cold_start_probability, 1.0);

    // t=30
    while snapshots.borrow_and_update().epoch < 3 {
        snapshots.changed().await.unwrap();
    }
    let local = *engine.snapshot().location("f", Location::Local).unwrap();
    assert_eq!(local.cold_starts, 0);
    assert_eq!(local.window_completions, 0);
    assert_eq!(local.cold_start_probability, 1.0);
    assert_eq!(local.invocations, 1);
    assert!(engine.snapshot().location("f", Location::Edge).is_none());

    engine.shutdown();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_evaluate_now_and_shutdown() {
    let config = EngineConfig {
        evaluation_interval: Duration::from_secs(3600),
        ..EngineConfig::default()
    };
    let (engine, handle) =
        DecisionEngine::start(config, FixedNode::new(true), Box::new(StaticOptimizer)).unwrap();
    let mut snapshots = engine.subscribe();

    engine.evaluate_now().await.unwrap();
    while snapshots.borrow_and_update().epoch < 1 {
        snapshots.changed().await.unwrap();
    }

    engine.shutdown();
    handle.await.unwrap();
    assert!(matches!(engine.evaluate_now().await, Err(EngineError::Stopped)));
}

#[test]
fn test_invalid_config_fails_fast() {
    let config = EngineConfig {
        starting: StartingProbabilities {
            local: 0.5,
            edge: 0.5,
            cloud: 0.0,
        },
        topology: Topology::CloudOnly,
        ..EngineConfig::default()
    };
    let result = DecisionEngine::build(config, FixedNode::new(true), Box::new(StaticOptimizer));
    assert!(matches!(result, Err(EngineError::Config(_))));
}
