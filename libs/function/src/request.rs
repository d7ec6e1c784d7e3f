//! Invocation requests and their execution reports.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use edgeflow_id::RequestId;
use serde::{Deserialize, Serialize};

use crate::types::{Function, Priority, RequestQoS};

/// Outcome measurements of one invocation.
///
/// Offload latencies of zero mean "not measured".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Arrival timestamp, used for latency computation.
    pub arrival: Option<DateTime<Utc>>,

    /// Function output.
    #[serde(default)]
    pub result: String,

    /// End-to-end response time.
    pub response_time_ms: f64,

    /// Whether a warm container served the request.
    pub is_warm_start: bool,

    /// Time spent creating the execution environment (cold start only).
    pub init_time_ms: f64,

    /// Execution time of the function body.
    pub duration_ms: f64,

    /// Network overhead observed when offloading to the cloud.
    pub offload_latency_cloud_ms: f64,

    /// Network overhead observed when offloading to an edge node.
    pub offload_latency_edge_ms: f64,

    /// CPU time consumed.
    #[serde(default)]
    pub cpu_time_ms: f64,

    /// Bytes exchanged with a remote node, zero for local runs.
    #[serde(default)]
    pub transferred_bytes: u64,
}

/// A single function invocation.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub function: Arc<Function>,
    pub params: HashMap<String, String>,
    pub arrival: DateTime<Utc>,
    pub qos: RequestQoS,
    pub report: ExecutionReport,

    /// Whether the scheduler may run this request on another node.
    pub can_do_offloading: bool,
}

impl Request {
    /// Create a request arriving now with the default QoS.
    pub fn new(function: Arc<Function>) -> Self {
        let arrival = Utc::now();
        Self {
            id: RequestId::new(),
            function,
            params: HashMap::new(),
            arrival,
            qos: RequestQoS::default(),
            report: ExecutionReport {
                arrival: Some(arrival),
                ..ExecutionReport::default()
            },
            can_do_offloading: true,
        }
    }

    /// Set the QoS requirements.
    #[must_use]
    pub fn with_qos(mut self, qos: RequestQoS) -> Self {
        self.qos = qos;
        self
    }

    /// Set whether the request may be offloaded.
    #[must_use]
    pub fn with_offloading(mut self, allowed: bool) -> Self {
        self.can_do_offloading = allowed;
        self
    }

    /// Set the invocation parameters.
    #[must_use]
    pub fn with_params(mut self, params: HashMap<String, String>) -> Self {
        self.params = params;
        self
    }

    /// Function name.
    pub fn function_name(&self) -> &str {
        &self.function.name
    }

    /// QoS class.
    pub fn class(&self) -> Priority {
        self.qos.class
    }

    /// Size of the parameter data sent with the request.
    pub fn params_bytes(&self) -> usize {
        self.params.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    /// Build the payload sent to the execution transport.
    pub fn to_invocation(&self) -> InvocationRequest {
        InvocationRequest {
            params: self.params.clone(),
            handler: self.function.handler.clone(),
            return_output: false,
        }
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.function.name, self.id)
    }
}

/// Payload sent to an executor running inside a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub params: HashMap<String, String>,
    pub handler: String,
    pub return_output: bool,
}

/// Payload returned by an executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvocationResult {
    pub success: bool,
    pub result: String,

    /// Execution time measured inside the container.
    pub duration_ms: f64,
}
