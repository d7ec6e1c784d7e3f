//! Per-function and per-(function, class) running statistics.
//!
//! The store is owned by the event loop; nothing outside the loop holds a
//! reference to it. Readers get a [`DecisionSnapshot`](super::DecisionSnapshot)
//! instead.

use std::collections::HashMap;

use edgeflow_function::{ExecutionReport, Function, Location, Priority};

use super::probability::Probabilities;

// =============================================================================
// Online estimators
// =============================================================================

/// Welford's online mean and variance.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample variance; zero until two values have been seen.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }
}

/// Incremental mean without variance.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IncrementalMean {
    count: u64,
    mean: f64,
}

impl IncrementalMean {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        self.mean += (value - self.mean) / self.count as f64;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }
}

// =============================================================================
// Per-location statistics
// =============================================================================

/// Statistics of one function at one execution location.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationStats {
    /// Execution durations of every completion (ms).
    pub duration: RunningStats,

    /// Init times of cold starts (ms).
    pub init_time: IncrementalMean,

    /// Cold starts in the current cold-start window.
    pub cold_starts: u64,

    /// Completions in the current cold-start window.
    pub window_completions: u64,

    /// `cold_starts / window_completions`, 1 until evidence arrives.
    pub cold_start_probability: f64,

    /// Transfer rate of offloads to this location (kB/s).
    pub bandwidth: IncrementalMean,
}

impl Default for LocationStats {
    fn default() -> Self {
        Self {
            duration: RunningStats::default(),
            init_time: IncrementalMean::default(),
            cold_starts: 0,
            window_completions: 0,
            cold_start_probability: 1.0,
            bandwidth: IncrementalMean::default(),
        }
    }
}

impl LocationStats {
    /// Total invocations observed at this location.
    pub fn invocations(&self) -> u64 {
        self.duration.count()
    }

    fn record(&mut self, report: &ExecutionReport) {
        self.duration.push(report.duration_ms);
        self.window_completions += 1;

        if !report.is_warm_start {
            self.init_time.push(report.init_time_ms);
            self.cold_starts += 1;
        }

        self.cold_start_probability = self.cold_starts as f64 / self.window_completions as f64;

        // bytes per ms is kB/s
        let network_ms = report.offload_latency_cloud_ms + report.offload_latency_edge_ms;
        if report.transferred_bytes > 0 && network_ms > 0.0 {
            self.bandwidth.push(report.transferred_bytes as f64 / network_ms);
        }
    }

    /// Expected response time at this location excluding network overhead,
    /// or `None` before the first completion.
    pub fn expected_response_ms(&self) -> Option<f64> {
        if self.invocations() == 0 {
            return None;
        }
        Some(self.duration.mean() + self.cold_start_probability * self.init_time.mean())
    }
}

// =============================================================================
// Entries
// =============================================================================

/// Dispatch state of one (function, class) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassFunctionInfo {
    pub class: Priority,
    pub probabilities: Probabilities,

    /// Arrivals in the current evaluation window.
    pub window_arrivals: u64,

    /// Arrivals per second over the current evaluation window.
    pub arrival_rate: f64,

    /// Arrival rate of the last completed evaluation window.
    pub last_window_rate: f64,

    /// Consecutive evaluation windows without arrivals.
    pub empty_windows: u32,

    /// Response-time target of the most recent arrival.
    pub max_response_time_ms: f64,
}

impl ClassFunctionInfo {
    pub fn new(class: Priority, probabilities: Probabilities, max_response_time_ms: f64) -> Self {
        Self {
            class,
            probabilities,
            window_arrivals: 0,
            arrival_rate: 0.0,
            last_window_rate: 0.0,
            empty_windows: 0,
            max_response_time_ms,
        }
    }
}

/// Statistics of one function across all locations and classes.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionInfo {
    pub name: String,
    pub memory_mb: i64,
    pub cpu_demand: f64,
    pub locations: [LocationStats; Location::COUNT],
    pub classes: HashMap<Priority, ClassFunctionInfo>,
}

impl FunctionInfo {
    pub fn new(function: &Function) -> Self {
        Self {
            name: function.name.clone(),
            memory_mb: function.memory_mb,
            cpu_demand: function.cpu_demand,
            locations: Default::default(),
            classes: HashMap::new(),
        }
    }

    pub fn location(&self, location: Location) -> &LocationStats {
        &self.locations[location.index()]
    }

    /// Record a completed execution at `location`.
    pub fn record(&mut self, location: Location, report: &ExecutionReport) {
        self.locations[location.index()].record(report);
    }

    /// Start a new cold-start sampling window.
    pub fn reset_cold_start_window(&mut self) {
        for stats in &mut self.locations {
            stats.cold_starts = 0;
            stats.window_completions = 0;
        }
    }

    /// Total arrival rate over every class.
    pub fn arrival_rate(&self) -> f64 {
        self.classes.values().map(|c| c.arrival_rate).sum()
    }
}

// =============================================================================
// Store
// =============================================================================

/// Every tracked function, keyed by name.
#[derive(Debug, Default)]
pub struct StatsStore {
    functions: HashMap<String, FunctionInfo>,
}

impl StatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function(&self, name: &str) -> Option<&FunctionInfo> {
        self.functions.get(name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut FunctionInfo> {
        self.functions.get_mut(name)
    }

    pub fn class(&self, name: &str, class: Priority) -> Option<&ClassFunctionInfo> {
        self.functions.get(name)?.classes.get(&class)
    }

    /// Get or lazily create the entry of a (function, class) pair.
    pub fn class_entry(
        &mut self,
        function: &Function,
        class: Priority,
        seed: Probabilities,
        max_response_time_ms: f64,
    ) -> &mut ClassFunctionInfo {
        let info = self
            .functions
            .entry(function.name.clone())
            .or_insert_with(|| FunctionInfo::new(function));
        info.classes
            .entry(class)
            .or_insert_with(|| ClassFunctionInfo::new(class, seed, max_response_time_ms))
    }

    /// Remove a (function, class) entry; the function goes with its last class.
    ///
    /// Returns true if the entry existed.
    pub fn delete(&mut self, function: &str, class: Priority) -> bool {
        let Some(info) = self.functions.get_mut(function) else {
            return false;
        };

        let removed = info.classes.remove(&class).is_some();
        if info.classes.is_empty() {
            self.functions.remove(function);
        }
        removed
    }

    pub fn functions(&self) -> impl Iterator<Item = &FunctionInfo> {
        self.functions.values()
    }

    pub fn functions_mut(&mut self) -> impl Iterator<Item = &mut FunctionInfo> {
        self.functions.values_mut()
    }

    /// Every (function, class) key currently tracked.
    pub fn keys(&self) -> Vec<(String, Priority)> {
        self.functions
            .values()
            .flat_map(|f| f.classes.keys().map(|c| (f.name.clone(), *c)))
            .collect()
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub fn entry_count(&self) -> usize {
        self.functions.values().map(|f| f.classes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
