//! Configuration for the scheduler.
//!
//! Every setting is read from an `EDGEFLOW_*` environment variable with a
//! default. Values that are present but malformed are errors: a typo in the
//! policy name must stop the process, not silently pick another topology.

use std::str::FromStr;
use std::time::Duration;

use edgeflow_id::NodeId;
use thiserror::Error;

use crate::engine::probability::{StartingProbabilities, Topology};
use crate::solver::OptimizerKind;

/// Configuration errors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("unknown scheduling policy '{0}' (expected edgeCloud or cloudOnly)")]
    UnknownPolicy(String),

    #[error("unknown optimizer '{0}' (expected response_time or static)")]
    UnknownOptimizer(String),

    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error("starting probability {name} must be within [0, 1], got {value}")]
    InvalidProbability { name: String, value: f64 },

    #[error("starting probabilities sum to {0}, above 1")]
    ProbabilitySumExceeded(f64),

    #[error("starting edge probability {0} is not allowed with the cloudOnly policy")]
    EdgeSeedWithoutEdge(f64),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Decision engine settings.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Period of the evaluation timer.
    pub evaluation_interval: Duration,

    /// Period of the cold-start window timer (container expiration).
    pub cold_start_window: Duration,

    /// Offloading topology.
    pub topology: Topology,

    /// Seeds for entries that were never optimized.
    pub starting: StartingProbabilities,

    /// Consecutive empty evaluation windows before an entry is deleted.
    pub max_empty_windows: u32,

    /// Capacity of each bounded inbox.
    pub inbox_capacity: usize,

    /// Probability optimizer run at every evaluation.
    pub optimizer: OptimizerKind,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            evaluation_interval: Duration::from_secs(10),
            cold_start_window: Duration::from_secs(600),
            topology: Topology::EdgeCloud,
            starting: StartingProbabilities::default(),
            max_empty_windows: 3,
            inbox_capacity: 1024,
            optimizer: OptimizerKind::ResponseTime,
        }
    }
}

impl EngineConfig {
    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.evaluation_interval.is_zero() {
            return Err(ConfigError::Zero("evaluation interval"));
        }
        if self.cold_start_window.is_zero() {
            return Err(ConfigError::Zero("container expiration"));
        }
        if self.max_empty_windows == 0 {
            return Err(ConfigError::Zero("max empty windows"));
        }
        if self.inbox_capacity == 0 {
            return Err(ConfigError::Zero("inbox capacity"));
        }
        self.starting.validate(self.topology)
    }
}

/// Scheduler process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identity of this node.
    pub node_id: NodeId,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub engine: EngineConfig,

    /// Period of the diagnostics dump; `None` disables it.
    pub diagnostics_interval: Option<Duration>,

    /// Memory available to the container pool; measured when unset.
    pub pool_memory_mb: Option<i64>,

    /// CPUs available to the container pool; measured when unset.
    pub pool_cpus: Option<f64>,

    /// Requests per second of the built-in synthetic workload (0 = off).
    pub synthetic_rps: f64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let node_id = match env.get("EDGEFLOW_NODE_ID") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "EDGEFLOW_NODE_ID".to_string(),
                value: raw,
            })?,
            None => NodeId::new(),
        };

        let log_level = env
            .get("EDGEFLOW_LOG_LEVEL")
            .unwrap_or_else(|| "info".to_string());

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            evaluation_interval: Duration::from_secs(
                env.parse("EDGEFLOW_SOLVER_EVALUATION_INTERVAL", 10u64)?,
            ),
            cold_start_window: Duration::from_secs(
                env.parse("EDGEFLOW_CONTAINER_EXPIRATION", 600u64)?,
            ),
            topology: env.parse_named("EDGEFLOW_SCHEDULER_POLICY", defaults.topology)?,
            starting: StartingProbabilities {
                local: env.parse("EDGEFLOW_STARTING_LOCAL_PROB", defaults.starting.local)?,
                edge: env.parse("EDGEFLOW_STARTING_EDGE_PROB", defaults.starting.edge)?,
                cloud: env.parse("EDGEFLOW_STARTING_CLOUD_PROB", defaults.starting.cloud)?,
            },
            max_empty_windows: env.parse("EDGEFLOW_MAX_EMPTY_WINDOWS", defaults.max_empty_windows)?,
            inbox_capacity: env.parse("EDGEFLOW_INBOX_CAPACITY", defaults.inbox_capacity)?,
            optimizer: env.parse_named("EDGEFLOW_OPTIMIZER", defaults.optimizer)?,
        };
        engine.validate()?;

        let diagnostics_secs: u64 = env.parse("EDGEFLOW_DIAGNOSTICS_INTERVAL", 10)?;
        let diagnostics_interval = (diagnostics_secs > 0).then(|| Duration::from_secs(diagnostics_secs));

        let pool_memory_mb = env.parse_optional("EDGEFLOW_POOL_MEMORY_MB")?;
        let pool_cpus = env.parse_optional("EDGEFLOW_POOL_CPUS")?;
        let synthetic_rps: f64 = env.parse("EDGEFLOW_SYNTHETIC_RPS", 0.0)?;
        if !synthetic_rps.is_finite() || synthetic_rps < 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "EDGEFLOW_SYNTHETIC_RPS".to_string(),
                value: synthetic_rps.to_string(),
            });
        }

        Ok(Self {
            node_id,
            log_level,
            engine,
            diagnostics_interval,
            pool_memory_mb,
            pool_cpus,
            synthetic_rps,
        })
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        Ok(self.parse_optional(key)?.unwrap_or(default))
    }

    /// Like `parse`, for values whose parser reports its own `ConfigError`.
    fn parse_named<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr<Err = ConfigError>,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse(),
        }
    }

    fn parse_optional<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse().map(Some).map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
        }
    }
}
