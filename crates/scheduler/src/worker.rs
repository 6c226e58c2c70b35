// SPDX-License-Identifier: Apache-2.0

//! Worker entities and the registry that owns them.
//!
//! The registry tracks address and name uniqueness, host groupings and
//! liveness. Task-facing bookkeeping (`has_what`, `processing`) lives on
//! [`WorkerState`] but is mutated through the scheduler so that the
//! `who_has`/`has_what` relation stays bidirectional.

use crate::error::Error;
use crate::memory::MemoryState;
use crate::task::TaskId;
use gridflow_config::{Address, MemoryMeasure};
use indexmap::IndexSet;
use slotmap::{SlotMap, new_key_type};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

new_key_type! {
    /// Unique arena key for a worker.
    pub struct WorkerId;
}

/// Occupancy residuals smaller than this are float drift and snap to zero.
pub(crate) const OCCUPANCY_EPSILON: f64 = 1e-2;

/// The per-worker lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerStatus {
    /// Registered but not yet ready for work.
    Init,
    /// Accepting and executing tasks.
    Running,
    /// Alive but refusing new tasks (e.g. under memory pressure).
    Paused,
    /// Being drained by `retire_workers`; heartbeats still accepted.
    ClosingGracefully,
    /// Told to shut down.
    Closing,
    /// Gone for good.
    Closed,
    /// Terminated abnormally.
    Failed,
}

impl WorkerStatus {
    /// Whether the placement engine may assign new tasks to a worker in
    /// this status.
    #[must_use]
    pub const fn accepts_tasks(self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Init => "init",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::ClosingGracefully => "closing_gracefully",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// One worker node, identified by its canonical address.
#[derive(Debug)]
pub struct WorkerState {
    /// Canonical address (`proto://host:port`).
    pub address: Address,
    /// Alias, unique among live workers.
    pub name: String,
    /// Lifecycle status.
    pub status: WorkerStatus,
    /// Parallelism of the worker's thread pool.
    pub nthreads: usize,
    /// Total capacity per abstract resource.
    pub resources: HashMap<String, f64>,
    /// Currently reserved capacity per abstract resource.
    pub used_resources: HashMap<String, f64>,
    /// Tasks assigned to the worker, with their estimated cost in seconds.
    pub processing: HashMap<TaskId, f64>,
    /// Tasks that seceded from the thread pool; their cost no longer counts
    /// towards occupancy.
    pub long_running: HashSet<TaskId>,
    /// Results held by the worker, in insertion order (rebalance donates
    /// the least recently inserted keys first).
    pub has_what: IndexSet<TaskId>,
    /// Estimated seconds of pending work, including expected transfers.
    pub occupancy: f64,
    /// Total bytes of the results in `has_what`.
    pub nbytes: u64,
    /// Memory ceiling the worker was started with; 0 when unlimited.
    pub memory_limit: u64,
    /// Memory snapshot from the most recent heartbeat.
    pub memory: MemoryState,
    /// When the last heartbeat arrived.
    pub last_seen: Instant,
    /// Opaque software-version fingerprint, for mismatch diagnostics.
    pub versions: serde_json::Value,
}

impl WorkerState {
    /// The host portion of the canonical address.
    #[must_use]
    pub fn host(&self) -> &str {
        host_of(&self.address)
    }

    /// The worker's memory according to the configured rebalance measure.
    #[must_use]
    pub fn memory_measure(&self, measure: MemoryMeasure) -> u64 {
        match measure {
            MemoryMeasure::Process => self.memory.process(),
            MemoryMeasure::Optimistic => self.memory.optimistic(),
            MemoryMeasure::Managed => self.memory.managed(),
            MemoryMeasure::ManagedInMemory => self.memory.managed_in_memory(),
        }
    }

    /// Adds a task to `processing`, charging its estimated cost.
    pub(crate) fn start_processing(&mut self, task: TaskId, cost: f64) {
        let _ = self.processing.insert(task, cost);
        self.occupancy += cost;
    }

    /// Removes a task from `processing`, refunding its estimated cost.
    /// Returns the cost that was charged, if the task was present.
    pub(crate) fn stop_processing(&mut self, task: TaskId) -> Option<f64> {
        let cost = self.processing.remove(&task)?;
        let _ = self.long_running.remove(&task);
        self.occupancy -= cost;
        if self.processing.is_empty() && self.occupancy.abs() < OCCUPANCY_EPSILON {
            self.occupancy = 0.0;
        }
        Some(cost)
    }

    /// Re-prices an already assigned task (e.g. after the first duration
    /// observation for its prefix). Returns the delta applied to occupancy.
    pub(crate) fn reprice_processing(&mut self, task: TaskId, cost: f64) -> f64 {
        match self.processing.get_mut(&task) {
            Some(current) => {
                let delta = cost - *current;
                *current = cost;
                self.occupancy += delta;
                delta
            }
            None => 0.0,
        }
    }
}

/// The outcome of a `remove_worker` call.
#[derive(Debug)]
pub enum RemoveWorkerResult {
    /// The worker was present and has been removed; its final state is
    /// returned for the caller to reroute tasks and replicas.
    Removed(Box<WorkerState>),
    /// The address was not (or no longer) registered.
    AlreadyRemoved,
}

/// Parameters announced by a registering worker.
#[derive(Debug, Clone)]
pub struct WorkerRegistration {
    /// Canonical address of the worker.
    pub address: Address,
    /// Requested alias; defaults to the address when absent.
    pub name: Option<String>,
    /// Parallelism.
    pub nthreads: usize,
    /// Total capacity per abstract resource.
    pub resources: HashMap<String, f64>,
    /// Memory ceiling, 0 when unlimited.
    pub memory_limit: u64,
    /// Opaque software-version fingerprint.
    pub versions: serde_json::Value,
}

/// Owner of all [`WorkerState`] entities.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: SlotMap<WorkerId, WorkerState>,
    by_address: HashMap<Address, WorkerId>,
    aliases: HashMap<String, WorkerId>,
    hosts: HashMap<String, HashSet<WorkerId>>,
    running: HashSet<WorkerId>,
    total_nthreads: usize,
}

impl WorkerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether no worker is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Combined thread count of all live workers.
    #[must_use]
    pub const fn total_nthreads(&self) -> usize {
        self.total_nthreads
    }

    /// Immutable access to a worker. Panics if the id is stale, which is a
    /// scheduler bug.
    #[must_use]
    pub fn worker(&self, id: WorkerId) -> &WorkerState {
        &self.workers[id]
    }

    /// Mutable access to a worker. Panics if the id is stale, which is a
    /// scheduler bug.
    pub fn worker_mut(&mut self, id: WorkerId) -> &mut WorkerState {
        &mut self.workers[id]
    }

    /// Fallible lookup by id.
    #[must_use]
    pub fn get(&self, id: WorkerId) -> Option<&WorkerState> {
        self.workers.get(id)
    }

    /// Resolves a canonical address to a worker id.
    #[must_use]
    pub fn id_of(&self, address: &str) -> Option<WorkerId> {
        self.by_address.get(address).copied()
    }

    /// Iterates over all live workers.
    pub fn iter(&self) -> impl Iterator<Item = (WorkerId, &WorkerState)> {
        self.workers.iter()
    }

    /// Iterates over the ids of workers in the running status.
    pub fn running(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.running.iter().copied()
    }

    /// Whether any worker is in the running status.
    #[must_use]
    pub fn has_running(&self) -> bool {
        !self.running.is_empty()
    }

    /// Workers registered on the given host.
    #[must_use]
    pub fn host_workers(&self, host: &str) -> Option<&HashSet<WorkerId>> {
        self.hosts.get(host)
    }

    /// Registers a worker. Fails with [`Error::NameCollision`] when the
    /// requested alias is taken by another live worker; in that case the
    /// registry is left untouched.
    pub fn add_worker(
        &mut self,
        registration: WorkerRegistration,
        now: Instant,
    ) -> Result<WorkerId, Error> {
        let WorkerRegistration {
            address,
            name,
            nthreads,
            resources,
            memory_limit,
            versions,
        } = registration;
        let name = name.unwrap_or_else(|| address.clone());

        if let Some(existing) = self.aliases.get(&name) {
            if self.workers[*existing].address != address {
                return Err(Error::NameCollision {
                    name,
                    held_by: self.workers[*existing].address.clone(),
                });
            }
        }
        if self.by_address.contains_key(&address) {
            // A re-registration of the same address supersedes the old
            // entry; the stale state is dropped.
            let _ = self.remove_worker(&address);
        }

        let state = WorkerState {
            address: address.clone(),
            name: name.clone(),
            status: WorkerStatus::Running,
            nthreads,
            resources,
            used_resources: HashMap::new(),
            processing: HashMap::new(),
            long_running: HashSet::new(),
            has_what: IndexSet::new(),
            occupancy: 0.0,
            nbytes: 0,
            memory_limit,
            memory: MemoryState::default(),
            last_seen: now,
            versions,
        };
        let host = host_of(&address).to_owned();
        let id = self.workers.insert(state);
        let _ = self.by_address.insert(address, id);
        let _ = self.aliases.insert(name, id);
        let _ = self.hosts.entry(host).or_default().insert(id);
        let _ = self.running.insert(id);
        self.total_nthreads += nthreads;
        tracing::info!(worker = %self.workers[id].address, "register worker");
        Ok(id)
    }

    /// Removes a worker by canonical address. Idempotent: a second call for
    /// the same address reports [`RemoveWorkerResult::AlreadyRemoved`] and
    /// changes nothing.
    pub fn remove_worker(&mut self, address: &str) -> RemoveWorkerResult {
        let Some(id) = self.by_address.get(address).copied() else {
            return RemoveWorkerResult::AlreadyRemoved;
        };
        let state = self.workers.remove(id).expect("indexed by address");
        let _ = self.by_address.remove(address);
        let _ = self.aliases.remove(&state.name);
        let _ = self.running.remove(&id);
        self.total_nthreads -= state.nthreads;
        let host = state.host().to_owned();
        if let Some(members) = self.hosts.get_mut(&host) {
            let _ = members.remove(&id);
            if members.is_empty() {
                let _ = self.hosts.remove(&host);
            }
        }
        tracing::info!(worker = %state.address, "remove worker");
        RemoveWorkerResult::Removed(Box::new(state))
    }

    /// Moves a worker to a new status, keeping the running set in step.
    /// Returns the previous status.
    pub fn set_status(&mut self, id: WorkerId, status: WorkerStatus) -> WorkerStatus {
        let old = {
            let ws = &mut self.workers[id];
            let old = ws.status;
            ws.status = status;
            old
        };
        if status == WorkerStatus::Running {
            let _ = self.running.insert(id);
        } else {
            let _ = self.running.remove(&id);
        }
        old
    }

    /// Resolves an alias name, a `host:port` pair, or a canonical address
    /// to the canonical form. Purely syntactic aside from the alias table;
    /// no name resolution is attempted.
    #[must_use]
    pub fn coerce_address(&self, input: &str) -> Address {
        if let Some(id) = self.aliases.get(input) {
            return self.workers[*id].address.clone();
        }
        if input.contains("://") {
            return input.to_owned();
        }
        format!("tcp://{input}")
    }

    /// Resolves any accepted address form to a live worker id.
    #[must_use]
    pub fn resolve(&self, input: &str) -> Option<WorkerId> {
        if let Some(id) = self.aliases.get(input) {
            return Some(*id);
        }
        self.by_address.get(&self.coerce_address(input)).copied()
    }

    /// Addresses of workers whose last heartbeat is older than `ttl`.
    #[must_use]
    pub fn stale_workers(&self, now: Instant, ttl: Duration) -> Vec<Address> {
        self.workers
            .values()
            .filter(|ws| now.duration_since(ws.last_seen) >= ttl)
            .map(|ws| ws.address.clone())
            .collect()
    }
}

/// Extracts the host portion from `proto://host:port`, `host:port` or a
/// bare host.
#[must_use]
pub fn host_of(address: &str) -> &str {
    let rest = address
        .split_once("://")
        .map_or(address, |(_, rest)| rest);
    // IPv6 literals keep their brackets: `[::1]:8000` -> `[::1]`.
    if let Some(end) = rest.rfind(']') {
        return &rest[..=end];
    }
    rest.rsplit_once(':').map_or(rest, |(host, _)| host)
}
