//! Execution transport interface and mock implementation.
//!
//! The transport abstracts everything that actually runs code:
//! - Creating and destroying containers on this node
//! - Executing an invocation inside a container
//! - Forwarding a request to an edge node or the cloud
//! - Restoring a container from a snapshot
//!
//! Timeouts and connection retries belong here, not to the decision engine.

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use edgeflow_function::{
    Decision, ExecutionReport, Function, InvocationRequest, InvocationResult, Location, Request,
};
use edgeflow_id::ContainerId;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::node::ContainerHandle;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer could not be reached. Retried.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The peer answered with a failure. Not retried.
    #[error("execution failed: {0}")]
    Execution(String),

    #[error("gave up after {attempts} attempts ({waited:?} spent waiting)")]
    RetriesExhausted { attempts: u32, waited: Duration },

    #[error("restore failed: {0}")]
    Restore(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Connection(_))
    }
}

// =============================================================================
// Retry
// =============================================================================

/// Fixed-backoff retry of transient transport failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts in total, the first one included.
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 50,
            backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails permanently or attempts run out.
    ///
    /// Returns the value and the backoff slept between attempts. Time spent
    /// inside `op` is not part of the wait.
    pub async fn send_with_retries<T, F, Fut>(
        &self,
        mut op: F,
    ) -> Result<(T, Duration), TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut waited = Duration::ZERO;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok((value, waited)),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    // failures right after a cold start are expected
                    if attempt > 1 {
                        debug!(
                            attempt,
                            max = self.max_retries,
                            error = %e,
                            "Transport attempt failed, retrying"
                        );
                    }
                    tokio::time::sleep(self.backoff).await;
                    waited += self.backoff;
                }
                Err(e) if e.is_transient() => {
                    warn!(attempts = attempt, error = %e, "Transport retries exhausted");
                    return Err(TransportError::RetriesExhausted {
                        attempts: attempt,
                        waited,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// =============================================================================
// Executor interface
// =============================================================================

/// Remote tier a request can be forwarded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffloadTarget {
    Edge,
    Cloud,
}

impl OffloadTarget {
    pub fn from_decision(decision: Decision) -> Option<Self> {
        match decision {
            Decision::OffloadEdge => Some(OffloadTarget::Edge),
            Decision::OffloadCloud => Some(OffloadTarget::Cloud),
            Decision::ExecuteLocal | Decision::Drop => None,
        }
    }

    pub fn location(&self) -> Location {
        match self {
            OffloadTarget::Edge => Location::Edge,
            OffloadTarget::Cloud => Location::Cloud,
        }
    }
}

/// Answer of a remote node to a forwarded request.
#[derive(Debug, Clone, Default)]
pub struct OffloadResponse {
    pub success: bool,

    /// Execution measurements taken by the remote node.
    pub report: ExecutionReport,
}

/// Result of a snapshot restore.
#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub container: ContainerId,
    pub restore_time: Duration,
}

/// Execution transport interface.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Create a container for `function`, returning its endpoint.
    async fn new_container(
        &self,
        id: &ContainerId,
        function: &Function,
    ) -> Result<String, TransportError>;

    /// Run an invocation inside a container.
    async fn execute(
        &self,
        container: &ContainerHandle,
        invocation: &InvocationRequest,
    ) -> Result<InvocationResult, TransportError>;

    /// Tear a container down.
    async fn destroy(&self, container: &ContainerHandle) -> Result<(), TransportError>;

    /// Forward a request to another tier.
    async fn offload(
        &self,
        target: OffloadTarget,
        request: &Request,
    ) -> Result<OffloadResponse, TransportError>;

    /// Restore a container of `function` from its snapshot.
    async fn restore(&self, function: &Function) -> Result<RestoreOutcome, TransportError>;
}

// =============================================================================
// Mock
// =============================================================================

/// Simulated latencies of the mock transport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MockLatencies {
    pub init: Duration,
    pub execution: Duration,
    pub edge_network: Duration,
    pub cloud_network: Duration,
    pub restore: Duration,
}

impl Default for MockLatencies {
    fn default() -> Self {
        Self {
            init: Duration::from_millis(300),
            execution: Duration::from_millis(40),
            edge_network: Duration::from_millis(15),
            cloud_network: Duration::from_millis(80),
            restore: Duration::from_millis(60),
        }
    }
}

/// Mock transport for testing and development.
pub struct MockExecutor {
    latencies: MockLatencies,

    /// Whether every execution reports failure.
    fail_executions: bool,

    /// Connection failures still to inject.
    pending_connection_failures: AtomicU32,

    containers_created: AtomicU64,
    executions: AtomicU64,
    offloads: AtomicU64,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::with_latencies(MockLatencies::default())
    }

    pub fn with_latencies(latencies: MockLatencies) -> Self {
        Self {
            latencies,
            fail_executions: false,
            pending_connection_failures: AtomicU32::new(0),
            containers_created: AtomicU64::new(0),
            executions: AtomicU64::new(0),
            offloads: AtomicU64::new(0),
        }
    }

    /// A transport whose executions and offloads always fail.
    pub fn failing() -> Self {
        Self {
            fail_executions: true,
            ..Self::new()
        }
    }

    /// Make the next `count` executions or offloads fail to connect.
    pub fn inject_connection_failures(&self, count: u32) {
        self.pending_connection_failures.store(count, Ordering::SeqCst);
    }

    pub fn containers_created(&self) -> u64 {
        self.containers_created.load(Ordering::SeqCst)
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn offloads(&self) -> u64 {
        self.offloads.load(Ordering::SeqCst)
    }

    fn take_connection_failure(&self) -> bool {
        self.pending_connection_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_connection(&self, peer: &str) -> Result<(), TransportError> {
        if self.take_connection_failure() {
            return Err(TransportError::Connection(format!("{peer} refused connection")));
        }
        Ok(())
    }
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn new_container(
        &self,
        id: &ContainerId,
        function: &Function,
    ) -> Result<String, TransportError> {
        info!(
            container = %id,
            function = %function.name,
            memory_mb = function.memory_mb,
            "[MOCK] Creating container"
        );

        tokio::time::sleep(self.latencies.init).await;
        self.containers_created.fetch_add(1, Ordering::SeqCst);

        Ok(format!("mock://{id}"))
    }

    async fn execute(
        &self,
        container: &ContainerHandle,
        invocation: &InvocationRequest,
    ) -> Result<InvocationResult, TransportError> {
        self.check_connection(&container.endpoint)?;

        debug!(
            container = %container.id,
            handler = %invocation.handler,
            "[MOCK] Executing invocation"
        );

        tokio::time::sleep(self.latencies.execution).await;
        self.executions.fetch_add(1, Ordering::SeqCst);

        if self.fail_executions {
            return Err(TransportError::Execution(format!(
                "{} returned an error",
                container.function
            )));
        }

        Ok(InvocationResult {
            success: true,
            result: String::new(),
            duration_ms: self.latencies.execution.as_secs_f64() * 1000.0,
        })
    }

    async fn destroy(&self, container: &ContainerHandle) -> Result<(), TransportError> {
        debug!(container = %container.id, "[MOCK] Destroying container");
        Ok(())
    }

    async fn offload(
        &self,
        target: OffloadTarget,
        request: &Request,
    ) -> Result<OffloadResponse, TransportError> {
        let network = match target {
            OffloadTarget::Edge => self.latencies.edge_network,
            OffloadTarget::Cloud => self.latencies.cloud_network,
        };
        self.check_connection(target.location().as_str())?;

        debug!(request = %request, target = ?target, "[MOCK] Offloading request");

        tokio::time::sleep(network + self.latencies.execution).await;
        self.offloads.fetch_add(1, Ordering::SeqCst);

        if self.fail_executions {
            return Err(TransportError::Execution(format!(
                "{} failed on {}",
                request.function_name(),
                target.location()
            )));
        }

        Ok(OffloadResponse {
            success: true,
            report: ExecutionReport {
                is_warm_start: true,
                duration_ms: self.latencies.execution.as_secs_f64() * 1000.0,
                ..ExecutionReport::default()
            },
        })
    }

    async fn restore(&self, function: &Function) -> Result<RestoreOutcome, TransportError> {
        if self.fail_executions {
            return Err(TransportError::Restore(format!(
                "no snapshot for {}",
                function.name
            )));
        }

        tokio::time::sleep(self.latencies.restore).await;
        self.containers_created.fetch_add(1, Ordering::SeqCst);

        Ok(RestoreOutcome {
            container: ContainerId::new(),
            restore_time: self.latencies.restore,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn handle() -> ContainerHandle {
        ContainerHandle {
            id: ContainerId::new(),
            function: "f".to_string(),
            memory_mb: 128,
            cpu_demand: 0.5,
            endpoint: "mock://test".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_connection_failures() {
        let executor = MockExecutor::new();
        executor.inject_connection_failures(3);
        let container = handle();
        let invocation = InvocationRequest::default();

        let policy = RetryPolicy::default();
        let (result, waited) = policy
            .send_with_retries(|| executor.execute(&container, &invocation))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(executor.executions(), 1);
        // three failed attempts, three backoffs
        assert_eq!(waited, Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_excludes_time_spent_in_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 5,
            backoff: Duration::from_millis(50),
        };

        let (value, waited) = policy
            .send_with_retries(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(TransportError::Connection("refused".to_string())),
                    n => Ok(n),
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 1);
        assert_eq!(waited, Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let executor = MockExecutor::new();
        executor.inject_connection_failures(10);
        let container = handle();
        let invocation = InvocationRequest::default();

        let policy = RetryPolicy {
            max_retries: 3,
            backoff: Duration::from_millis(10),
        };
        let err = policy
            .send_with_retries(|| executor.execute(&container, &invocation))
            .await
            .unwrap_err();

        match err {
            TransportError::RetriesExhausted { attempts, waited } => {
                assert_eq!(attempts, 3);
                assert_eq!(waited, Duration::from_millis(20));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(executor.pending_connection_failures.load(Ordering::SeqCst), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execution_failure_is_not_retried() {
        let executor = MockExecutor::failing();
        let container = handle();
        let invocation = InvocationRequest::default();

        let err = RetryPolicy::default()
            .send_with_retries(|| executor.execute(&container, &invocation))
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Execution(_)));
        assert_eq!(executor.executions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offload_reports_remote_execution() {
        let executor = MockExecutor::new();
        let request = Request::new(Arc::new(Function::new("f", 128, 0.5)));

        let response = executor
            .offload(OffloadTarget::Cloud, &request)
            .await
            .unwrap();

        assert!(response.success);
        assert_eq!(response.report.duration_ms, 40.0);
        assert_eq!(executor.offloads(), 1);
    }

    #[test]
    fn test_offload_target_from_decision() {
        assert_eq!(
            OffloadTarget::from_decision(Decision::OffloadEdge).map(|t| t.location()),
            Some(Location::Edge)
        );
        assert_eq!(OffloadTarget::from_decision(Decision::Drop), None);
    }
}
