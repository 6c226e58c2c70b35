// SPDX-License-Identifier: Apache-2.0

//! The message surface of the scheduler: stimuli arriving from clients and
//! workers, and the messages the scheduler emits back.
//!
//! Every stimulus that may cause state transitions is tagged with a
//! [`StimulusId`]; all transitions it triggers carry that id in the
//! transition log, which is what makes `story` useful for debugging.

use crate::task::TaskKey;
use bytes::Bytes;
use gridflow_config::Address;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Identifier tying every transition back to the external event that
/// caused it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StimulusId(String);

impl StimulusId {
    /// Creates a fresh id for the named operation.
    #[must_use]
    pub fn new(op: &str) -> Self {
        Self(format!("{op}-{}", uuid::Uuid::new_v4().simple()))
    }

    /// The full id text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StimulusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One task inside an `update-graph` submission.
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    /// The task key.
    pub key: TaskKey,
    /// Opaque serialized callable and arguments; absent for keys that are
    /// only referenced as dependencies.
    pub run_spec: Option<Bytes>,
    /// Keys this task reads.
    pub dependencies: Vec<TaskKey>,
    /// Client-assigned priority; higher runs earlier.
    pub priority: i64,
    /// Automatic retries on failure.
    pub retries: u32,
    /// Addresses the task may run on.
    pub worker_restrictions: Option<Vec<Address>>,
    /// Hosts the task may run on.
    pub host_restrictions: Option<Vec<String>>,
    /// Abstract resources the task consumes while running.
    pub resource_restrictions: Option<HashMap<String, f64>>,
    /// Allow other workers when the restrictions are unsatisfiable.
    pub loose_restrictions: bool,
    /// Free-form metadata (executor name, user tags, ...).
    pub annotations: HashMap<String, serde_json::Value>,
}

/// A client-submitted graph update.
#[derive(Debug, Clone, Default)]
pub struct GraphUpdate {
    /// The submitted tasks, in topological order where known.
    pub tasks: Vec<TaskSpec>,
    /// The keys the client holds futures for.
    pub keys: Vec<TaskKey>,
}

/// Operations a client may ask of the scheduler.
#[derive(Debug)]
pub enum ClientRequest {
    /// Submit or extend a task graph.
    UpdateGraph(GraphUpdate),

    /// Drop the client's interest in the given keys.
    ReleaseKeys {
        /// Keys to release.
        keys: Vec<TaskKey>,
    },

    /// Cancel a key, optionally even while other clients still want it.
    CancelKeys {
        /// Keys to cancel.
        keys: Vec<TaskKey>,
        /// Cancel even when other clients hold futures for the keys.
        force: bool,
    },

    /// Replace the worker restrictions of existing tasks.
    SetRestrictions {
        /// Per-key replacement restriction sets; `None` clears.
        worker: HashMap<TaskKey, Option<Vec<Address>>>,
    },

    /// Place client data directly into cluster memory.
    Scatter {
        /// Key/payload pairs to place.
        data: Vec<(TaskKey, Bytes)>,
        /// Restrict placement to these workers.
        workers: Option<Vec<Address>>,
        /// Replicate every key to every eligible worker.
        broadcast: bool,
        /// Give up after this long.
        timeout: Duration,
    },

    /// Fetch results back to the client.
    Gather {
        /// Keys to collect.
        keys: Vec<TaskKey>,
    },

    /// Forget all tasks and relaunch every worker.
    Restart {
        /// Give up waiting for workers to come back after this long.
        timeout: Duration,
        /// Fail instead of proceeding when not all workers returned.
        wait_for_workers: bool,
    },

    /// Gracefully drain and remove workers.
    RetireWorkers {
        /// Explicit victim addresses.
        workers: Vec<String>,
        /// Victims by alias name.
        names: Vec<String>,
        /// Or: pick this many victims automatically.
        n: Option<usize>,
    },

    /// Even out memory across workers.
    Rebalance {
        /// Restrict the move set to these keys.
        keys: Option<Vec<TaskKey>>,
        /// Restrict the participant set to these workers.
        workers: Option<Vec<String>>,
    },

    /// Run an opaque callable on the scheduler process.
    RunOnScheduler {
        /// The serialized callable.
        payload: Bytes,
    },
}

impl ClientRequest {
    /// The operation name used for `blocked-handlers` matching and
    /// stimulus ids.
    #[must_use]
    pub const fn op(&self) -> &'static str {
        match self {
            Self::UpdateGraph(_) => "update-graph",
            Self::ReleaseKeys { .. } => "release-keys",
            Self::CancelKeys { .. } => "cancel-key",
            Self::SetRestrictions { .. } => "set-restrictions",
            Self::Scatter { .. } => "scatter",
            Self::Gather { .. } => "gather",
            Self::Restart { .. } => "restart",
            Self::RetireWorkers { .. } => "retire-workers",
            Self::Rebalance { .. } => "rebalance",
            Self::RunOnScheduler { .. } => "run-on-scheduler",
        }
    }
}

/// Memory numbers carried by a worker heartbeat.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeartbeatMetrics {
    /// Process RSS.
    pub process: u64,
    /// Unmanaged memory that has been stable for a while.
    pub unmanaged_old: u64,
    /// Data-store bytes held in RAM.
    pub managed_in_memory: u64,
    /// Data-store bytes spilled to disk.
    pub managed_spilled: u64,
}

/// A compute/transfer interval reported with `task-finished`.
#[derive(Debug, Clone)]
pub struct StartStop {
    /// What the interval covers: `compute`, `transfer` or `deserialize`.
    pub action: String,
    /// Interval start, seconds since an arbitrary epoch.
    pub start: f64,
    /// Interval stop, same epoch.
    pub stop: f64,
}

impl StartStop {
    /// The length of the interval in seconds.
    #[must_use]
    pub fn duration(&self) -> f64 {
        (self.stop - self.start).max(0.0)
    }
}

/// Events arriving from workers.
#[derive(Debug)]
pub enum WorkerEvent {
    /// The worker finished computing a task.
    TaskFinished {
        /// Key of the finished task.
        key: TaskKey,
        /// Size of the result.
        nbytes: u64,
        /// Type name of the result.
        type_name: Option<String>,
        /// Timings observed while producing the result.
        startstops: Vec<StartStop>,
    },

    /// The worker failed to compute a task.
    TaskErred {
        /// Key of the failed task.
        key: TaskKey,
        /// Rendered exception.
        exception: String,
        /// Rendered traceback.
        traceback: Option<String>,
    },

    /// A worker that was supposed to hold a key reports it does not.
    MissingData {
        /// The key that could not be found.
        key: TaskKey,
        /// The worker that was expected to hold it.
        errant_worker: Address,
    },

    /// The worker asks for a task to be scheduled somewhere else.
    Reschedule {
        /// Key of the task to move.
        key: TaskKey,
    },

    /// A task seceded from the worker thread pool; stop counting its cost.
    LongRunning {
        /// Key of the long-running task.
        key: TaskKey,
        /// Compute time observed before seceding, in seconds.
        compute_duration: f64,
    },

    /// The worker acquired replicas (e.g. after `acquire-replicas`).
    AddKeys {
        /// The acquired keys.
        keys: Vec<TaskKey>,
    },

    /// The worker dropped replicas of its own accord.
    ReleaseWorkerData {
        /// The dropped keys.
        keys: Vec<TaskKey>,
    },

    /// The worker changed its own lifecycle status (e.g. paused).
    StatusChange {
        /// The announced status, by wire name.
        status: String,
    },

    /// Connection keep-alive; refreshes liveness only.
    KeepAlive,
}

impl WorkerEvent {
    /// The operation name used for stimulus ids.
    #[must_use]
    pub const fn op(&self) -> &'static str {
        match self {
            Self::TaskFinished { .. } => "task-finished",
            Self::TaskErred { .. } => "task-erred",
            Self::MissingData { .. } => "missing-data",
            Self::Reschedule { .. } => "reschedule",
            Self::LongRunning { .. } => "long-running",
            Self::AddKeys { .. } => "add-keys",
            Self::ReleaseWorkerData { .. } => "release-worker-data",
            Self::StatusChange { .. } => "worker-status-change",
            Self::KeepAlive => "keep-alive",
        }
    }
}

/// Messages sent to workers over the ordered, batched stream.
#[derive(Debug, Clone)]
pub enum WorkerMsg {
    /// Run a task.
    ComputeTask {
        /// Key of the task.
        key: TaskKey,
        /// Scheduling priority, for the worker-side ready heap.
        priority: i64,
        /// Estimated duration in seconds.
        duration: f64,
        /// The opaque callable.
        run_spec: Bytes,
        /// Where each dependency can be fetched from.
        who_has: HashMap<TaskKey, Vec<Address>>,
        /// Known sizes of the dependencies.
        nbytes: HashMap<TaskKey, u64>,
        /// Free-form metadata attached by the client.
        annotations: HashMap<String, serde_json::Value>,
        /// The stimulus that caused the assignment.
        stimulus_id: StimulusId,
    },

    /// Drop local state for keys that are no longer needed.
    FreeKeys {
        /// Keys to drop.
        keys: Vec<TaskKey>,
        /// The stimulus that caused the release.
        stimulus_id: StimulusId,
    },

    /// Abort a queued or running compute.
    CancelCompute {
        /// Key of the compute to abort.
        key: TaskKey,
        /// The stimulus that caused the cancellation.
        stimulus_id: StimulusId,
    },

    /// Fetch replicas of the given keys from their holders.
    AcquireReplicas {
        /// Where each key can be fetched from.
        who_has: HashMap<TaskKey, Vec<Address>>,
        /// Known sizes of the keys.
        nbytes: HashMap<TaskKey, u64>,
        /// The stimulus that caused the acquisition.
        stimulus_id: StimulusId,
    },

    /// Drop superfluous replicas of the given keys.
    RemoveReplicas {
        /// Keys whose local replica should go.
        keys: Vec<TaskKey>,
        /// The stimulus that caused the removal.
        stimulus_id: StimulusId,
    },

    /// Replica locations changed; refresh the worker's cached view.
    RefreshWhoHas {
        /// Updated locations per key.
        who_has: HashMap<TaskKey, Vec<Address>>,
    },

    /// Shut down.
    Close,
}

/// Messages sent to clients.
#[derive(Debug, Clone)]
pub enum ClientMsg {
    /// A key the client wants is now in cluster memory.
    KeyInMemory {
        /// The key.
        key: TaskKey,
        /// Type name of the result, when known.
        type_name: Option<String>,
    },

    /// A key the client wants has failed permanently.
    TaskErred {
        /// The key.
        key: TaskKey,
        /// Rendered exception.
        exception: String,
        /// Rendered traceback.
        traceback: Option<String>,
    },

    /// Keys were cancelled on request.
    CancelledKeys {
        /// The cancelled keys.
        keys: Vec<TaskKey>,
    },

    /// The cluster restarted; all futures are void.
    Restart,

    /// The last replica of a non-recomputable key vanished.
    LostData {
        /// The lost key.
        key: TaskKey,
    },
}

/// Reply to a worker heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatReply {
    /// Heartbeat accepted.
    Ok,
    /// The scheduler does not know this worker; it must re-register.
    Missing,
}

/// Reply to a `gather` request.
#[derive(Debug)]
pub enum GatherResponse {
    /// All keys were collected.
    Ok {
        /// The gathered payloads.
        data: HashMap<TaskKey, Bytes>,
    },
    /// Some keys could not be collected from any holder.
    Error {
        /// The keys that failed.
        keys: Vec<TaskKey>,
    },
}

/// Reply to a `rebalance` request.
#[derive(Debug, PartialEq, Eq)]
pub enum RebalanceResponse {
    /// Every planned move succeeded (possibly zero moves).
    Ok,
    /// Some moves failed; the affected keys are listed.
    PartialFail {
        /// Keys whose moves failed.
        keys: Vec<TaskKey>,
    },
}

/// Description of a worker that was retired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetiredWorker {
    /// The worker's alias.
    pub name: String,
    /// The worker's parallelism.
    pub nthreads: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stimulus_ids_carry_the_operation_name() {
        let id = StimulusId::new("task-finished");
        assert!(id.as_str().starts_with("task-finished-"));
        assert_ne!(
            StimulusId::new("task-finished"),
            StimulusId::new("task-finished")
        );
    }

    #[test]
    fn startstop_duration_is_never_negative() {
        let interval = StartStop {
            action: "compute".to_owned(),
            start: 10.0,
            stop: 9.0,
        };
        assert_eq!(interval.duration(), 0.0);
    }
}
