// SPDX-License-Identifier: Apache-2.0

//! Task entities: per-task state, name-class statistics (prefixes) and
//! layer aggregates (groups).
//!
//! `TaskState` instances are owned by the [`crate::graph::TaskGraph`];
//! everything else holds [`TaskId`] keys into its arena. All relation sets
//! (`dependencies`/`dependents`, `who_has`) are non-owning key sets kept
//! consistent in both directions by the store that introduces the edge.

use crate::worker::WorkerId;
use bytes::Bytes;
use slotmap::new_key_type;
use std::collections::{HashMap, HashSet};
use std::fmt;

new_key_type! {
    /// Unique arena key for a task.
    pub struct TaskId;
}

new_key_type! {
    /// Unique arena key for a task prefix.
    pub struct PrefixId;
}

new_key_type! {
    /// Unique arena key for a task group.
    pub struct GroupId;
}

/// Opaque identifier string for a task, chosen by the client.
pub type TaskKey = String;

/// The per-task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskRunState {
    /// Known but not actively being computed or held anywhere.
    Released,
    /// At least one dependency is not in memory yet.
    Waiting,
    /// Ready to run, but no worker satisfies the task's restrictions.
    NoWorker,
    /// Assigned to a worker and (presumably) being computed.
    Processing,
    /// The result is held by at least one worker.
    Memory,
    /// Computation failed and no retries remain.
    Erred,
    /// About to be removed from the scheduler entirely.
    Forgotten,
}

impl TaskRunState {
    /// All states, in histogram order.
    pub const ALL: [Self; 7] = [
        Self::Released,
        Self::Waiting,
        Self::NoWorker,
        Self::Processing,
        Self::Memory,
        Self::Erred,
        Self::Forgotten,
    ];

    /// The wire/log name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Released => "released",
            Self::Waiting => "waiting",
            Self::NoWorker => "no-worker",
            Self::Processing => "processing",
            Self::Memory => "memory",
            Self::Erred => "erred",
            Self::Forgotten => "forgotten",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Released => 0,
            Self::Waiting => 1,
            Self::NoWorker => 2,
            Self::Processing => 3,
            Self::Memory => 4,
            Self::Erred => 5,
            Self::Forgotten => 6,
        }
    }
}

impl fmt::Display for TaskRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Total order used for scheduling tie-breaks. Smaller sorts earlier and
/// runs first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority {
    /// Client-assigned priority, negated so that higher user priority sorts
    /// earlier.
    pub user: i64,
    /// Submission generation: later graph updates sort after earlier ones.
    pub generation: u64,
    /// Topological position within the submitted graph.
    pub order: i64,
}

/// Failure details recorded when a task errs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskErredInfo {
    /// The rendered exception.
    pub exception: String,
    /// The rendered traceback, if the worker provided one.
    pub traceback: Option<String>,
}

/// One task: an opaque callable plus dependency keys, identified by `key`.
#[derive(Debug)]
pub struct TaskState {
    /// The client-chosen identifier.
    pub key: TaskKey,
    /// Opaque serialized callable and arguments. Absent for scattered data,
    /// which therefore cannot be recomputed.
    pub run_spec: Option<Bytes>,
    /// Tasks this one reads.
    pub dependencies: HashSet<TaskId>,
    /// Reverse edges, maintained by the store.
    pub dependents: HashSet<TaskId>,
    /// Scheduling tie-break order.
    pub priority: Priority,
    /// Lifecycle state. Mutated only through the transition engine.
    pub state: TaskRunState,
    /// Workers currently holding the result.
    pub who_has: HashSet<WorkerId>,
    /// Clients that asked for this key. Maintained in both directions with
    /// `ClientState::wants_what`.
    pub who_wants: HashSet<String>,
    /// Worker currently executing the task, if any.
    pub processing_on: Option<WorkerId>,
    /// Addresses the task may run on, if restricted.
    pub worker_restrictions: Option<HashSet<String>>,
    /// Hosts the task may run on, if restricted.
    pub host_restrictions: Option<HashSet<String>>,
    /// Abstract resources the task consumes while running.
    pub resource_restrictions: Option<HashMap<String, f64>>,
    /// Allow other workers when the restrictions are unsatisfiable.
    pub loose_restrictions: bool,
    /// Remaining automatic retries on failure.
    pub retries: u32,
    /// How many times this task's execution appears to have killed a worker.
    pub suspicious: u32,
    /// Failure details; set exactly when `state == Erred`.
    pub erred: Option<TaskErredInfo>,
    /// Size of the result once known.
    pub nbytes: Option<u64>,
    /// Type name of the result once known.
    pub type_name: Option<String>,
    /// The group this task belongs to.
    pub group: GroupId,
    /// The prefix this task belongs to.
    pub prefix: PrefixId,
    /// Free-form metadata attached by the client.
    pub annotations: HashMap<String, serde_json::Value>,
}

impl TaskState {
    pub(crate) fn new(key: TaskKey, run_spec: Option<Bytes>, group: GroupId, prefix: PrefixId) -> Self {
        Self {
            key,
            run_spec,
            dependencies: HashSet::new(),
            dependents: HashSet::new(),
            priority: Priority::default(),
            state: TaskRunState::Released,
            who_has: HashSet::new(),
            who_wants: HashSet::new(),
            processing_on: None,
            worker_restrictions: None,
            host_restrictions: None,
            resource_restrictions: None,
            loose_restrictions: false,
            retries: 0,
            suspicious: 0,
            erred: None,
            nbytes: None,
            type_name: None,
            group,
            prefix,
            annotations: HashMap::new(),
        }
    }

    /// Whether this task is scattered data, injected by a client rather
    /// than computed.
    #[must_use]
    pub fn is_scattered(&self) -> bool {
        self.run_spec.is_none()
    }

    /// The bytes of the result, treating unknown sizes as zero.
    #[must_use]
    pub fn nbytes_or_zero(&self) -> u64 {
        self.nbytes.unwrap_or(0)
    }
}

/// Histogram of task states, used by prefixes and groups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts([u64; 7]);

impl StateCounts {
    /// Number of tasks currently in `state`.
    #[must_use]
    pub const fn get(&self, state: TaskRunState) -> u64 {
        self.0[state.index()]
    }

    pub(crate) fn increment(&mut self, state: TaskRunState) {
        self.0[state.index()] += 1;
    }

    pub(crate) fn decrement(&mut self, state: TaskRunState) {
        debug_assert!(self.0[state.index()] > 0, "state histogram underflow");
        self.0[state.index()] -= 1;
    }

    /// Total number of tracked tasks.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }

    /// Tasks that still have work ahead of them: neither in memory nor
    /// terminally erred/forgotten.
    #[must_use]
    pub const fn unfinished(&self) -> u64 {
        self.get(TaskRunState::Released)
            + self.get(TaskRunState::Waiting)
            + self.get(TaskRunState::NoWorker)
            + self.get(TaskRunState::Processing)
    }
}

/// The name-class of a task. Tasks of the same kind (same key text before
/// the first `-` separator) share duration statistics.
#[derive(Debug)]
pub struct TaskPrefix {
    /// The prefix text.
    pub name: String,
    /// State histogram over member tasks.
    pub states: StateCounts,
    /// Exponentially weighted moving average of observed durations, in
    /// seconds. `None` until the first observation.
    pub duration_average: Option<f64>,
    /// Total suspicion accumulated by member tasks.
    pub suspicious: u32,
    /// Total bytes of member results currently known.
    pub nbytes_total: u64,
    /// Groups that contain tasks of this prefix.
    pub groups: HashSet<GroupId>,
}

impl TaskPrefix {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            states: StateCounts::default(),
            duration_average: None,
            suspicious: 0,
            nbytes_total: 0,
            groups: HashSet::new(),
        }
    }
}

/// One layer of a client-submitted graph: all tasks sharing the group name
/// (the key text before the last `-` separator).
///
/// Created lazily on first task insertion and removed when the last member
/// is forgotten.
#[derive(Debug)]
pub struct TaskGroup {
    /// The group (layer) name.
    pub name: String,
    /// Prefix this group belongs to.
    pub prefix: PrefixId,
    /// State histogram over member tasks.
    pub states: StateCounts,
    /// Total bytes of member results currently known.
    pub nbytes_total: u64,
    /// Total observed compute time of member tasks, in seconds.
    pub duration_total: f64,
    /// Groups this group's tasks read from.
    pub dependencies: HashSet<GroupId>,
    /// Per-worker count of member tasks either executing on the worker or
    /// with a replica there. Drives root-task co-scheduling.
    pub occupancy_on: HashMap<WorkerId, usize>,
}

impl TaskGroup {
    pub(crate) fn new(name: String, prefix: PrefixId) -> Self {
        Self {
            name,
            prefix,
            states: StateCounts::default(),
            nbytes_total: 0,
            duration_total: 0.0,
            dependencies: HashSet::new(),
            occupancy_on: HashMap::new(),
        }
    }

    pub(crate) fn add_occupancy(&mut self, worker: WorkerId) {
        *self.occupancy_on.entry(worker).or_insert(0) += 1;
    }

    pub(crate) fn remove_occupancy(&mut self, worker: WorkerId) {
        if let Some(count) = self.occupancy_on.get_mut(&worker) {
            *count -= 1;
            if *count == 0 {
                let _ = self.occupancy_on.remove(&worker);
            }
        }
    }

    /// How many member tasks the given worker currently holds or runs.
    #[must_use]
    pub fn occupancy_of(&self, worker: WorkerId) -> usize {
        self.occupancy_on.get(&worker).copied().unwrap_or(0)
    }
}

/// Derives the prefix name from a task key: everything before the first
/// `-` separator, or the whole key if there is none.
#[must_use]
pub fn key_prefix(key: &str) -> &str {
    key.split('-').next().unwrap_or(key)
}

/// Derives the group (layer) name from a task key: everything before the
/// last `-` separator, or the whole key if there is none.
#[must_use]
pub fn key_group(key: &str) -> &str {
    match key.rfind('-') {
        Some(idx) if idx > 0 => &key[..idx],
        _ => key,
    }
}
