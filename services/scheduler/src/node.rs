//! Local node: warm container pool and resource accounting.
//!
//! Memory is held by a container for its whole lifetime, idle or busy. CPU
//! is held only while the container is executing. Idle containers of other
//! functions are evicted, least recently used first, when a cold start
//! needs their memory.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use edgeflow_function::Function;
use edgeflow_id::ContainerId;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::transport::{Executor, TransportError};

/// Node errors.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("no warm container for {0}")]
    NoWarmContainer(String),

    #[error("insufficient resources for {function} ({memory_mb} MB, {cpu} CPU)")]
    InsufficientResources {
        function: String,
        memory_mb: i64,
        cpu: f64,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A container owned by the caller while it executes.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerHandle {
    pub id: ContainerId,
    pub function: String,
    pub memory_mb: i64,
    pub cpu_demand: f64,
    pub endpoint: String,
}

/// A freshly created container and the time it took.
#[derive(Debug, Clone)]
pub struct ColdStart {
    pub container: ContainerHandle,
    pub init_time: Duration,
}

/// Live resource counters of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub total_memory_mb: i64,
    pub available_memory_mb: i64,
    pub total_cpus: f64,
    pub available_cpus: f64,
    pub idle_containers: usize,
    pub busy_containers: usize,
}

/// Node collaborator interface.
#[async_trait]
pub trait Node: Send + Sync {
    /// Whether `function` could start executing here right now.
    fn can_execute(&self, function: &Function) -> bool;

    fn resources(&self) -> ResourceSnapshot;

    /// Idle warm containers per function.
    fn warm_status(&self) -> HashMap<String, usize>;

    /// Take an idle warm container of `function`.
    fn acquire_warm_container(&self, function: &Function) -> Result<ContainerHandle, NodeError>;

    /// Reserve resources and create a new container of `function`.
    async fn cold_start(&self, function: &Function) -> Result<ColdStart, NodeError>;

    /// Return a container to the warm pool after execution.
    fn release_container(&self, container: ContainerHandle);
}

// =============================================================================
// In-memory implementation
// =============================================================================

#[derive(Debug)]
struct IdleContainer {
    handle: ContainerHandle,
    since: Instant,
}

#[derive(Debug)]
struct Pool {
    total_memory_mb: i64,
    free_memory_mb: i64,
    total_cpus: f64,
    free_cpus: f64,
    idle: HashMap<String, VecDeque<IdleContainer>>,
    busy: usize,
}

impl Pool {
    fn idle_count(&self) -> usize {
        self.idle.values().map(VecDeque::len).sum()
    }

    fn has_idle(&self, function: &str) -> bool {
        self.idle.get(function).is_some_and(|q| !q.is_empty())
    }

    /// Memory that evicting every idle container of other functions frees.
    fn reclaimable_mb(&self, except: &str) -> i64 {
        self.idle
            .iter()
            .filter(|(name, _)| name.as_str() != except)
            .flat_map(|(_, q)| q.iter())
            .map(|c| c.handle.memory_mb)
            .sum()
    }

    /// Evict least recently used idle containers of other functions until
    /// `needed_mb` is free.
    fn evict_for(&mut self, needed_mb: i64, except: &str) -> Vec<ContainerHandle> {
        let mut victims = Vec::new();
        while self.free_memory_mb < needed_mb {
            let oldest = self
                .idle
                .iter()
                .filter(|(name, q)| name.as_str() != except && !q.is_empty())
                .filter_map(|(name, q)| q.front().map(|c| (name.clone(), c.since)))
                .min_by_key(|(_, since)| *since);

            let Some((name, _)) = oldest else {
                break;
            };
            let Some(victim) = self.idle.get_mut(&name).and_then(VecDeque::pop_front) else {
                break;
            };
            self.free_memory_mb += victim.handle.memory_mb;
            victims.push(victim.handle);
        }
        self.idle.retain(|_, q| !q.is_empty());
        victims
    }
}

/// In-memory node with memory and CPU accounting.
pub struct LocalNode {
    pool: Mutex<Pool>,
    executor: Arc<dyn Executor>,
}

impl LocalNode {
    pub fn new(memory_mb: i64, cpus: f64, executor: Arc<dyn Executor>) -> Self {
        info!(memory_mb, cpus, "Local container pool ready");
        Self {
            pool: Mutex::new(Pool {
                total_memory_mb: memory_mb,
                free_memory_mb: memory_mb,
                total_cpus: cpus,
                free_cpus: cpus,
                idle: HashMap::new(),
                busy: 0,
            }),
            executor,
        }
    }

    fn pool(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Destroy idle containers unused for at least `max_idle`.
    pub async fn expire_idle(&self, max_idle: Duration) -> usize {
        let expired: Vec<ContainerHandle> = {
            let mut pool = self.pool();
            let now = Instant::now();
            let mut expired = Vec::new();
            for queue in pool.idle.values_mut() {
                while queue
                    .front()
                    .is_some_and(|c| now.duration_since(c.since) >= max_idle)
                {
                    if let Some(c) = queue.pop_front() {
                        expired.push(c.handle);
                    }
                }
            }
            pool.idle.retain(|_, q| !q.is_empty());
            pool.free_memory_mb += expired.iter().map(|c| c.memory_mb).sum::<i64>();
            expired
        };

        let count = expired.len();
        self.destroy_all(expired).await;
        if count > 0 {
            debug!(count, "Expired idle containers");
        }
        count
    }

    async fn destroy_all(&self, containers: Vec<ContainerHandle>) {
        for container in containers {
            if let Err(e) = self.executor.destroy(&container).await {
                warn!(container = %container.id, error = %e, "Failed to destroy container");
            }
        }
    }
}

#[async_trait]
impl Node for LocalNode {
    fn can_execute(&self, function: &Function) -> bool {
        let pool = self.pool();
        if pool.free_cpus < function.cpu_demand {
            return false;
        }
        pool.has_idle(&function.name)
            || pool.free_memory_mb + pool.reclaimable_mb(&function.name) >= function.memory_mb
    }

    fn resources(&self) -> ResourceSnapshot {
        let pool = self.pool();
        ResourceSnapshot {
            total_memory_mb: pool.total_memory_mb,
            available_memory_mb: pool.free_memory_mb,
            total_cpus: pool.total_cpus,
            available_cpus: pool.free_cpus,
            idle_containers: pool.idle_count(),
            busy_containers: pool.busy,
        }
    }

    fn warm_status(&self) -> HashMap<String, usize> {
        self.pool()
            .idle
            .iter()
            .map(|(name, q)| (name.clone(), q.len()))
            .collect()
    }

    fn acquire_warm_container(&self, function: &Function) -> Result<ContainerHandle, NodeError> {
        let mut pool = self.pool();
        if pool.free_cpus < function.cpu_demand {
            return Err(NodeError::InsufficientResources {
                function: function.name.clone(),
                memory_mb: 0,
                cpu: function.cpu_demand,
            });
        }

        let container = pool
            .idle
            .get_mut(&function.name)
            .and_then(VecDeque::pop_back)
            .ok_or_else(|| NodeError::NoWarmContainer(function.name.clone()))?;

        pool.free_cpus -= function.cpu_demand;
        pool.busy += 1;
        Ok(container.handle)
    }

    async fn cold_start(&self, function: &Function) -> Result<ColdStart, NodeError> {
        let victims = {
            let mut pool = self.pool();
            let insufficient = pool.free_cpus < function.cpu_demand
                || pool.free_memory_mb + pool.reclaimable_mb(&function.name) < function.memory_mb;
            if insufficient {
                return Err(NodeError::InsufficientResources {
                    function: function.name.clone(),
                    memory_mb: function.memory_mb,
                    cpu: function.cpu_demand,
                });
            }

            let victims = pool.evict_for(function.memory_mb, &function.name);
            pool.free_memory_mb -= function.memory_mb;
            pool.free_cpus -= function.cpu_demand;
            pool.busy += 1;
            victims
        };
        self.destroy_all(victims).await;

        let id = ContainerId::new();
        let started = Instant::now();
        match self.executor.new_container(&id, function).await {
            Ok(endpoint) => Ok(ColdStart {
                container: ContainerHandle {
                    id,
                    function: function.name.clone(),
                    memory_mb: function.memory_mb,
                    cpu_demand: function.cpu_demand,
                    endpoint,
                },
                init_time: started.elapsed(),
            }),
            Err(e) => {
                let mut pool = self.pool();
                pool.free_memory_mb += function.memory_mb;
                pool.free_cpus += function.cpu_demand;
                pool.busy = pool.busy.saturating_sub(1);
                Err(e.into())
            }
        }
    }

    fn release_container(&self, container: ContainerHandle) {
        let mut pool = self.pool();
        pool.free_cpus = (pool.free_cpus + container.cpu_demand).min(pool.total_cpus);
        pool.busy = pool.busy.saturating_sub(1);
        pool.idle
            .entry(container.function.clone())
            .or_default()
            .push_back(IdleContainer {
                handle: container,
                since: Instant::now(),
            });
    }
}

/// Destroy containers idle longer than `max_idle`, checking every
/// `max_idle / 4`, until shutdown.
pub async fn run_expiration_loop(
    node: Arc<LocalNode>,
    max_idle: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let period = (max_idle / 4).max(Duration::from_secs(1));
    let mut timer = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = timer.tick() => {
                node.expire_idle(max_idle).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Container expiration loop shutting down");
                    break;
                }
            }
        }
    }
}
