//! Function metadata, QoS classes and scheduling outcomes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::FunctionError;

/// Default maximum response time attached to a request without an explicit
/// target, in milliseconds.
pub const DEFAULT_MAX_RESPONSE_TIME_MS: f64 = 200.0;

// =============================================================================
// Function
// =============================================================================

/// Registry metadata of a deployable function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    /// Unique function name.
    pub name: String,

    /// Memory reserved by one container of this function.
    pub memory_mb: i64,

    /// CPU demand of one container (1.0 = one core).
    pub cpu_demand: f64,

    /// Runtime image identifier (e.g. `python310`).
    #[serde(default)]
    pub runtime: String,

    /// Entry point inside the runtime.
    #[serde(default)]
    pub handler: String,
}

impl Function {
    /// Create a function with the given resource demand.
    pub fn new(name: impl Into<String>, memory_mb: i64, cpu_demand: f64) -> Self {
        Self {
            name: name.into(),
            memory_mb,
            cpu_demand,
            runtime: String::new(),
            handler: String::new(),
        }
    }
}

// =============================================================================
// QoS
// =============================================================================

/// QoS tier of a request.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Low,
    HighPerformance,
    HighAvailability,
}

impl Priority {
    /// All classes, in code order.
    pub const ALL: [Priority; 3] = [
        Priority::Low,
        Priority::HighPerformance,
        Priority::HighAvailability,
    ];

    /// Stable name used in logs and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::HighPerformance => "high_performance",
            Priority::HighAvailability => "high_availability",
        }
    }

    /// Integer code used by older clients.
    pub fn code(&self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::HighPerformance => 1,
            Priority::HighAvailability => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = FunctionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" | "0" => Ok(Priority::Low),
            "high_performance" | "highperformance" | "1" => Ok(Priority::HighPerformance),
            "high_availability" | "highavailability" | "2" => Ok(Priority::HighAvailability),
            _ => Err(FunctionError::UnknownClass(s.to_string())),
        }
    }
}

/// QoS requirements attached to a request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RequestQoS {
    /// QoS tier.
    pub class: Priority,

    /// Maximum acceptable response time.
    pub max_response_time_ms: f64,
}

impl RequestQoS {
    pub fn new(class: Priority, max_response_time_ms: f64) -> Self {
        Self {
            class,
            max_response_time_ms,
        }
    }
}

impl Default for RequestQoS {
    fn default() -> Self {
        Self::new(Priority::Low, DEFAULT_MAX_RESPONSE_TIME_MS)
    }
}

// =============================================================================
// Locations and Decisions
// =============================================================================

/// Where a request was executed.
///
/// The discriminants double as indices into per-location statistics arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    Local = 0,
    Cloud = 1,
    Edge = 2,
}

impl Location {
    /// Number of distinct locations.
    pub const COUNT: usize = 3;

    /// All locations in index order.
    pub const ALL: [Location; 3] = [Location::Local, Location::Cloud, Location::Edge];

    /// Index into per-location arrays.
    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Location::Local => "local",
            Location::Cloud => "cloud",
            Location::Edge => "edge",
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<i64> for Location {
    type Error = FunctionError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Location::Local),
            1 => Ok(Location::Cloud),
            2 => Ok(Location::Edge),
            other => Err(FunctionError::InvalidLocation(other)),
        }
    }
}

impl TryFrom<u8> for Location {
    type Error = FunctionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Location::try_from(i64::from(value))
    }
}

/// Verdict of the decision engine for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    ExecuteLocal,
    OffloadEdge,
    OffloadCloud,
    Drop,
}

impl Decision {
    /// Location the request will run at, or `None` for a drop.
    pub fn location(&self) -> Option<Location> {
        match self {
            Decision::ExecuteLocal => Some(Location::Local),
            Decision::OffloadEdge => Some(Location::Edge),
            Decision::OffloadCloud => Some(Location::Cloud),
            Decision::Drop => None,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Decision::ExecuteLocal => "execute_local",
            Decision::OffloadEdge => "offload_edge",
            Decision::OffloadCloud => "offload_cloud",
            Decision::Drop => "drop",
        })
    }
}
