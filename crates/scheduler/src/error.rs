// SPDX-License-Identifier: Apache-2.0

//! Errors for the scheduler core.
//!
//! The variants follow the failure taxonomy of the system: protocol errors
//! are reported back to the caller without mutating state, state-corruption
//! errors poison the scheduler, transient worker errors are absorbed by the
//! recovery path, and task failures are surfaced to clients.

use crate::task::TaskKey;
use gridflow_config::Address;

/// All errors that can occur in the scheduler core.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A registering worker picked a name that is already taken by another
    /// live worker.
    #[error("name taken, {name:?} is held by {held_by}")]
    NameCollision {
        /// The requested worker name.
        name: String,
        /// Address of the live worker already using the name.
        held_by: Address,
    },

    /// A registering worker announced keys in memory that the scheduler
    /// never asked it to hold.
    #[error("worker {address} connected with {count} unexpected key(s) in memory")]
    UnexpectedData {
        /// Address of the rejected worker.
        address: Address,
        /// How many unknown keys the worker announced.
        count: usize,
    },

    /// An address, host or alias could not be resolved to a live worker.
    #[error("unknown worker {address}")]
    UnknownWorker {
        /// The unresolvable input.
        address: String,
    },

    /// An operation referenced a task key the scheduler does not know.
    #[error("unknown task {key}")]
    UnknownTask {
        /// The unknown key.
        key: TaskKey,
    },

    /// A client requested an operation listed in `blocked-handlers`.
    #[error("handler {handler} has been blocked by configuration")]
    BlockedHandler {
        /// The blocked operation name.
        handler: String,
    },

    /// An inbound opaque callable was rejected because deserialization of
    /// arbitrary payloads is disabled.
    #[error("cannot run functions on the scheduler: opaque payloads are disabled")]
    PickleDisabled,

    /// No executor was installed to run opaque callables on the scheduler.
    #[error("cannot run functions on the scheduler: no executor installed")]
    ExecutorUnavailable,

    /// A task/state pair reached the transition engine with no legal handler.
    #[error("impossible transition for {key}: {start} -> {finish}")]
    InvalidTransition {
        /// Key of the offending task.
        key: TaskKey,
        /// State the task was in.
        start: &'static str,
        /// State that was requested.
        finish: &'static str,
    },

    /// The bounded transition counter was exceeded, indicating a runaway
    /// recommendation loop. The batch is aborted and the scheduler enters
    /// the failed status.
    #[error("transition counter exceeded maximum of {max} while processing {key}")]
    TransitionCounterMaxExceeded {
        /// Key of the task being transitioned when the guard tripped.
        key: TaskKey,
        /// The configured maximum.
        max: u64,
    },

    /// The scheduler is in the failed status and no longer accepts stimuli.
    #[error("scheduler state is corrupted; refusing new stimuli")]
    Failed,

    /// A long operation did not complete within its deadline.
    #[error("operation {operation} timed out after {seconds:.3}s")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The deadline, in seconds.
        seconds: f64,
    },

    /// No running worker exists to carry out the requested operation.
    #[error("no running workers available")]
    NoWorkers,

    /// `retire_workers` could not find any live worker to receive the keys
    /// held only by the retiring ones.
    #[error("cannot retire workers: no recipient left for {count} unique key(s)")]
    NoRetireRecipients {
        /// Number of keys that would be lost.
        count: usize,
    },

    /// A restart did not bring back the required number of workers in time.
    #[error("restart timed out: {returned} of {expected} workers returned")]
    RestartTimeout {
        /// Workers that re-registered before the deadline.
        returned: usize,
        /// Workers that were expected back.
        expected: usize,
    },

    /// An invariant check failed.
    #[error("invariant violated: {details}")]
    InvariantViolated {
        /// Description of the first violated invariant.
        details: String,
    },
}
