//! Action dispatch.
//!
//! A policy turns the engine's [`Decision`] into work: run on a warm
//! container, cold start one, forward to another tier, or drop. It fills
//! the request's [`ExecutionReport`](edgeflow_function::ExecutionReport)
//! and reports the final outcome back to the engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edgeflow_function::{Decision, Function, Location, Request};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::{DecisionEngine, EngineError, Topology};
use crate::node::{ContainerHandle, Node, NodeError};
use crate::transport::{Executor, OffloadTarget, RestoreOutcome, RetryPolicy, TransportError};

/// Policy errors.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// How a request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed(Location),
    Dropped,
}

/// Reply channel of a restore request.
pub type RestoreReply = oneshot::Receiver<Result<RestoreOutcome, TransportError>>;

/// A request to restore a container of `function` from its snapshot.
#[derive(Debug)]
pub struct RestoreRequest {
    pub function: Arc<Function>,
    reply: oneshot::Sender<Result<RestoreOutcome, TransportError>>,
}

impl RestoreRequest {
    pub fn new(function: Arc<Function>) -> (Self, RestoreReply) {
        let (reply, rx) = oneshot::channel();
        (Self { function, reply }, rx)
    }
}

/// Action dispatch interface.
#[async_trait]
pub trait Policy: Send + Sync {
    /// Decide and carry out the decision for `request`.
    async fn on_arrival(&self, request: &mut Request) -> Result<Outcome, PolicyError>;

    /// Report a completion that happened outside `on_arrival`.
    fn on_completion(&self, request: &Request, location: Location) -> Result<(), PolicyError>;

    /// Start a restore; the result arrives on the request's reply channel.
    fn on_restore(&self, restore: RestoreRequest);
}

/// Policy for both offloading topologies.
pub struct OffloadPolicy {
    engine: DecisionEngine,
    node: Arc<dyn Node>,
    executor: Arc<dyn Executor>,
    retry: RetryPolicy,
}

impl OffloadPolicy {
    pub fn new(engine: DecisionEngine, node: Arc<dyn Node>, executor: Arc<dyn Executor>) -> Self {
        Self {
            engine,
            node,
            executor,
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn topology(&self) -> Topology {
        self.engine.topology()
    }

    async fn acquire_container(
        &self,
        function: &Function,
    ) -> Result<(ContainerHandle, Option<Duration>), NodeError> {
        match self.node.acquire_warm_container(function) {
            Ok(container) => Ok((container, None)),
            Err(NodeError::NoWarmContainer(_)) => {
                let cold = self.node.cold_start(function).await?;
                Ok((cold.container, Some(cold.init_time)))
            }
            Err(e) => Err(e),
        }
    }

    async fn execute_local(&self, request: &mut Request, arrived: Instant) -> Result<(), PolicyError> {
        let (container, init_time) = self.acquire_container(&request.function).await?;

        let invocation = request.to_invocation();
        let result = self
            .retry
            .send_with_retries(|| self.executor.execute(&container, &invocation))
            .await;
        self.node.release_container(container);

        let (result, waited) = result?;
        if !result.success {
            return Err(TransportError::Execution(result.result).into());
        }

        // a fresh container is often not listening yet: retry waits count
        // as initialization
        let report = &mut request.report;
        report.result = result.result;
        report.is_warm_start = init_time.is_none();
        report.init_time_ms = init_time.map_or(0.0, |d| (d + waited).as_secs_f64() * 1000.0);
        report.duration_ms = result.duration_ms;
        report.response_time_ms = arrived.elapsed().as_secs_f64() * 1000.0;

        self.engine.completed(request, Location::Local)?;
        Ok(())
    }

    async fn offload(
        &self,
        request: &mut Request,
        target: OffloadTarget,
        arrived: Instant,
    ) -> Result<(), PolicyError> {
        let started = Instant::now();
        let outgoing: &Request = request;
        let (response, waited) = self
            .retry
            .send_with_retries(|| self.executor.offload(target, outgoing))
            .await?;
        if !response.success {
            return Err(TransportError::Execution(response.report.result).into());
        }
        if !waited.is_zero() {
            debug!(
                request = %request,
                target = ?target,
                waited_ms = waited.as_millis() as u64,
                "Offload needed retries"
            );
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let remote = response.report;
        let network_ms = (elapsed_ms - remote.duration_ms - remote.init_time_ms).max(0.0);

        let transferred = request.params_bytes() + remote.result.len();
        let report = &mut request.report;
        report.transferred_bytes = transferred as u64;
        report.result = remote.result;
        report.is_warm_start = remote.is_warm_start;
        report.init_time_ms = remote.init_time_ms;
        report.duration_ms = remote.duration_ms;
        report.response_time_ms = arrived.elapsed().as_secs_f64() * 1000.0;
        match target {
            OffloadTarget::Edge => report.offload_latency_edge_ms = network_ms,
            OffloadTarget::Cloud => report.offload_latency_cloud_ms = network_ms,
        }

        self.engine.completed(request, target.location())?;
        Ok(())
    }

    /// Tier used when a local execution turns out to be impossible.
    fn fallback_target(&self) -> OffloadTarget {
        self.topology()
            .offload_tiers()
            .first()
            .and_then(|d| OffloadTarget::from_decision(*d))
            .unwrap_or(OffloadTarget::Cloud)
    }

    /// Record a failed request as dropped and hand the error back.
    fn fail(&self, request: &Request, error: PolicyError) -> PolicyError {
        warn!(request = %request, error = %error, "Request failed");
        if let Err(e) = self.engine.dropped(request) {
            warn!(request = %request, error = %e, "Drop notification lost");
        }
        error
    }
}

#[async_trait]
impl Policy for OffloadPolicy {
    async fn on_arrival(&self, request: &mut Request) -> Result<Outcome, PolicyError> {
        let arrived = Instant::now();

        let target = match self.engine.decide(request) {
            Decision::Drop => return Ok(Outcome::Dropped),
            Decision::ExecuteLocal => match self.execute_local(request, arrived).await {
                Ok(()) => return Ok(Outcome::Completed(Location::Local)),
                Err(PolicyError::Node(NodeError::InsufficientResources { .. }))
                    if request.can_do_offloading =>
                {
                    let target = self.fallback_target();
                    debug!(request = %request, target = ?target, "Local execution infeasible, offloading");
                    target
                }
                Err(PolicyError::Node(e @ NodeError::InsufficientResources { .. })) => {
                    debug!(request = %request, error = %e, "Local execution infeasible, dropping");
                    self.engine.dropped(request)?;
                    return Ok(Outcome::Dropped);
                }
                Err(e) => return Err(self.fail(request, e)),
            },
            Decision::OffloadEdge => OffloadTarget::Edge,
            Decision::OffloadCloud => OffloadTarget::Cloud,
        };

        match self.offload(request, target, arrived).await {
            Ok(()) => Ok(Outcome::Completed(target.location())),
            Err(e) => Err(self.fail(request, e)),
        }
    }

    fn on_completion(&self, request: &Request, location: Location) -> Result<(), PolicyError> {
        self.engine.completed(request, location)?;
        Ok(())
    }

    fn on_restore(&self, restore: RestoreRequest) {
        let executor = Arc::clone(&self.executor);
        tokio::spawn(async move {
            let RestoreRequest { function, reply } = restore;
            let result = executor.restore(&function).await;
            match &result {
                Ok(outcome) => info!(
                    function = %function.name,
                    container = %outcome.container,
                    restore_ms = outcome.restore_time.as_millis() as u64,
                    "Container restored"
                ),
                Err(e) => warn!(function = %function.name, error = %e, "Restore failed"),
            }
            if reply.send(result).is_err() {
                debug!(function = %function.name, "Restore requester went away");
            }
        });
    }
}
