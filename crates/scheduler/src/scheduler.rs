// SPDX-License-Identifier: Apache-2.0

//! The scheduler aggregate and its single-threaded event loop.
//!
//! One [`Scheduler`] owns every sub-store (tasks, workers, clients,
//! durations, transition log). All mutation happens on the loop; the only
//! suspension points are the point-to-point worker RPCs used by data
//! movement, and those never overlap a transition batch. The loop is
//! `!Send` by design (thread-per-scheduler) and is driven from a
//! `tokio::task::LocalSet`.

use crate::client::ClientRegistry;
use crate::comm::{Outbox, WorkerRpc};
use crate::control::{
    ClientMsg, ClientRequest, GatherResponse, HeartbeatMetrics, HeartbeatReply,
    RebalanceResponse, RetiredWorker, StimulusId, WorkerEvent, WorkerMsg,
};
use crate::error::Error;
use crate::graph::TaskGraph;
use crate::lifecycle::{PendingRestart, SchedulerPlugin};
use crate::occupancy::DurationEstimator;
use crate::task::{TaskKey, TaskRunState};
use crate::transition::TransitionLog;
use crate::worker::{WorkerRegistry, WorkerRegistration};
use bytes::Bytes;
use gridflow_config::{Address, SchedulerConfig};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// Lifecycle status of the scheduler itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerStatus {
    /// Accepting and processing stimuli.
    Running,
    /// Shut down cleanly; no further stimuli are accepted.
    Closed,
    /// State is corrupted (a transition batch failed); no further stimuli
    /// are accepted and the process should exit non-zero.
    Failed,
}

/// The central coordinator of the cluster.
pub struct Scheduler {
    pub(crate) config: SchedulerConfig,
    /// Bandwidth in bytes/sec as a float, for transfer-cost pricing.
    pub(crate) bandwidth: f64,
    pub(crate) graph: TaskGraph,
    pub(crate) workers: WorkerRegistry,
    pub(crate) clients: ClientRegistry,
    pub(crate) durations: DurationEstimator,
    pub(crate) transition_log: TransitionLog,
    /// Tasks in the `no-worker` state, re-tried when capacity appears.
    pub(crate) unrunnable: HashSet<crate::task::TaskId>,
    pub(crate) plugins: IndexMap<String, Box<dyn SchedulerPlugin>>,
    pub(crate) outbox: Outbox,
    pub(crate) rpc: Rc<dyn WorkerRpc>,
    /// Optional executor for `run-on-scheduler` payloads.
    pub(crate) executor: Option<Box<dyn FnMut(Bytes) -> serde_json::Value>>,
    pub(crate) status: SchedulerStatus,
    pub(crate) idle_since: Option<Instant>,
    pub(crate) idle_observed: bool,
    pub(crate) time_started: Instant,
    /// Estimated seconds of assigned work across all workers.
    pub(crate) total_occupancy: f64,
    /// Submission generation counter feeding task priorities.
    pub(crate) generation: u64,
    pub(crate) pending_restart: Option<PendingRestart>,
}

impl Scheduler {
    /// Creates a scheduler with the given configuration and worker RPC
    /// transport.
    #[must_use]
    pub fn new(config: SchedulerConfig, rpc: Rc<dyn WorkerRpc>) -> Self {
        let bandwidth = config.bandwidth_bytes() as f64;
        let durations = DurationEstimator::new(&config);
        let transition_log =
            TransitionLog::new(config.events_log_length, config.transition_counter_max);
        let clients = ClientRegistry::new(config.events_log_length);
        Self {
            bandwidth,
            graph: TaskGraph::new(),
            workers: WorkerRegistry::new(),
            clients,
            durations,
            transition_log,
            unrunnable: HashSet::new(),
            plugins: IndexMap::new(),
            outbox: Outbox::new(),
            rpc,
            executor: None,
            status: SchedulerStatus::Running,
            idle_since: None,
            idle_observed: false,
            time_started: Instant::now(),
            total_occupancy: 0.0,
            generation: 0,
            pending_restart: None,
            config,
        }
    }

    /// Installs the executor used by `run-on-scheduler`.
    pub fn set_executor(&mut self, executor: Box<dyn FnMut(Bytes) -> serde_json::Value>) {
        self.executor = Some(executor);
    }

    /// The scheduler's lifecycle status.
    #[must_use]
    pub const fn status(&self) -> SchedulerStatus {
        self.status
    }

    /// Read access to the task store.
    #[must_use]
    pub const fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Read access to the worker registry.
    #[must_use]
    pub const fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    /// Read access to the client registry.
    #[must_use]
    pub const fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    /// Read access to the transition log.
    #[must_use]
    pub const fn transition_log(&self) -> &TransitionLog {
        &self.transition_log
    }

    /// Estimated seconds of assigned work across all workers.
    #[must_use]
    pub const fn total_occupancy(&self) -> f64 {
        self.total_occupancy
    }

    /// When the scheduler last became idle, if it currently is.
    #[must_use]
    pub const fn idle_since(&self) -> Option<Instant> {
        self.idle_since
    }

    /// When this scheduler was constructed.
    #[must_use]
    pub const fn time_started(&self) -> Instant {
        self.time_started
    }

    /// Cluster memory: the field-wise sum of every live worker's most
    /// recent heartbeat snapshot.
    #[must_use]
    pub fn memory(&self) -> crate::memory::MemoryState {
        crate::memory::MemoryState::sum(self.workers.iter().map(|(_, ws)| &ws.memory))
    }

    /// The estimated duration of the task with the given key, in seconds.
    pub fn task_duration(&mut self, key: &str) -> Option<f64> {
        let task = self.graph.id_of(key)?;
        Some(self.durations.estimate(&self.graph, task))
    }

    pub(crate) fn ensure_accepting(&self) -> Result<(), Error> {
        match self.status {
            SchedulerStatus::Running => Ok(()),
            SchedulerStatus::Closed | SchedulerStatus::Failed => Err(Error::Failed),
        }
    }

    /// Marks the scheduler state as corrupted. From here on every stimulus
    /// is refused and the embedding process should exit non-zero.
    pub(crate) fn poison(&mut self) {
        self.status = SchedulerStatus::Failed;
    }

    /// Sweeps the periodic maintenance work: worker liveness, event-log
    /// retention and idle detection. Returns true when the idle timeout
    /// fired and the scheduler closed.
    pub fn sweep(&mut self, now: Instant) -> Result<bool, Error> {
        self.sweep_worker_ttl(now)?;
        let _ = self.clients.expire_events(now);
        let _ = self.check_idle(now);
        if self.idle_timeout_elapsed(now) {
            let idle_for = self
                .idle_since
                .map_or(Duration::ZERO, |since| now.duration_since(since));
            tracing::info!("scheduler idle for {} ms; closing", idle_for.as_millis());
            self.close();
            return Ok(true);
        }
        Ok(false)
    }

    /// Verifies every quantified invariant of the data model. Used by
    /// tests and debug builds after each stimulus; the first violation is
    /// reported.
    pub fn validate_state(&self) -> Result<(), Error> {
        let fail = |details: String| Err(Error::InvariantViolated { details });

        for (id, ts) in self.graph.iter() {
            match ts.state {
                TaskRunState::Memory => {
                    if ts.who_has.is_empty() {
                        return fail(format!("{} in memory with no replicas", ts.key));
                    }
                    if ts.processing_on.is_some() {
                        return fail(format!("{} in memory while processing", ts.key));
                    }
                }
                TaskRunState::Processing => {
                    let Some(worker) = ts.processing_on else {
                        return fail(format!("{} processing nowhere", ts.key));
                    };
                    let Some(ws) = self.workers.get(worker) else {
                        return fail(format!("{} processing on a dead worker", ts.key));
                    };
                    if !ws.processing.contains_key(&id) {
                        return fail(format!("{} not in its worker's processing set", ts.key));
                    }
                    let holders = self
                        .workers
                        .iter()
                        .filter(|(_, w)| w.processing.contains_key(&id))
                        .count();
                    if holders != 1 {
                        return fail(format!("{} processed by {holders} workers", ts.key));
                    }
                }
                TaskRunState::Waiting => {
                    if ts
                        .dependencies
                        .iter()
                        .all(|dep| self.graph.task(*dep).state == TaskRunState::Memory)
                    {
                        return fail(format!("{} waiting with all deps in memory", ts.key));
                    }
                }
                TaskRunState::NoWorker => {
                    if !self.unrunnable.contains(&id) {
                        return fail(format!("{} in no-worker but not tracked", ts.key));
                    }
                }
                TaskRunState::Erred => {
                    if ts.erred.is_none() {
                        return fail(format!("{} erred without exception", ts.key));
                    }
                    for dep in &ts.dependents {
                        let state = self.graph.task(*dep).state;
                        if !matches!(
                            state,
                            TaskRunState::Erred | TaskRunState::Released | TaskRunState::Forgotten
                        ) {
                            return fail(format!(
                                "{} erred but dependent {} is {state}",
                                ts.key,
                                self.graph.task(*dep).key
                            ));
                        }
                    }
                }
                TaskRunState::Released | TaskRunState::Forgotten => {}
            }

            for worker in &ts.who_has {
                let Some(ws) = self.workers.get(*worker) else {
                    return fail(format!("{} replicated on a dead worker", ts.key));
                };
                if !ws.has_what.contains(&id) {
                    return fail(format!("{} missing from has_what of {}", ts.key, ws.address));
                }
            }
            for dep in &ts.dependencies {
                if !self.graph.task(*dep).dependents.contains(&id) {
                    return fail(format!("{} dependency edge is one-directional", ts.key));
                }
            }
            for dependent in &ts.dependents {
                if !self.graph.task(*dependent).dependencies.contains(&id) {
                    return fail(format!("{} dependent edge is one-directional", ts.key));
                }
            }
        }

        for (id, ws) in self.workers.iter() {
            for task in &ws.has_what {
                if !self.graph.task(*task).who_has.contains(&id) {
                    return fail(format!(
                        "{} lists a task that does not list it back",
                        ws.address
                    ));
                }
            }
            let nbytes: u64 = ws
                .has_what
                .iter()
                .map(|task| self.graph.task(*task).nbytes_or_zero())
                .sum();
            if nbytes != ws.nbytes {
                return fail(format!(
                    "{} byte count drifted: {} tracked vs {} summed",
                    ws.address, ws.nbytes, nbytes
                ));
            }
            let occupancy: f64 = ws.processing.values().sum();
            if (occupancy - ws.occupancy).abs() > 1e-6 {
                return fail(format!(
                    "{} occupancy drifted: {} tracked vs {} summed",
                    ws.address, ws.occupancy, occupancy
                ));
            }
        }
        Ok(())
    }
}

/// A reply to a client operation.
#[derive(Debug)]
pub enum ClientReply {
    /// The operation completed with nothing to return.
    Done,
    /// Scatter: the keys that were placed.
    Scattered(Vec<TaskKey>),
    /// Gather: the collected data or the keys that failed.
    Gathered(GatherResponse),
    /// Rebalance outcome.
    Rebalanced(RebalanceResponse),
    /// Retire: the removed workers.
    Retired(HashMap<Address, RetiredWorker>),
    /// Run-on-scheduler result.
    Ran(serde_json::Value),
    /// Restart: how many workers came back.
    Restarted(usize),
}

/// One externally injected event, with its reply channel where the
/// protocol has one.
pub enum Stimulus {
    /// A client connected.
    ClientConnect {
        /// Client id.
        client: String,
        /// Opaque version fingerprint.
        versions: serde_json::Value,
        /// Stream for reports to this client.
        stream: mpsc::UnboundedSender<ClientMsg>,
    },
    /// A client disconnected.
    ClientDisconnect {
        /// Client id.
        client: String,
    },
    /// A client operation.
    ClientOp {
        /// Client id.
        client: String,
        /// The request.
        request: ClientRequest,
        /// Where to deliver the outcome.
        reply: oneshot::Sender<Result<ClientReply, Error>>,
    },
    /// A worker wants to join.
    WorkerRegister {
        /// Announced parameters.
        registration: WorkerRegistration,
        /// Keys (with sizes) the worker claims to hold.
        keys_in_memory: Vec<(TaskKey, u64)>,
        /// Stream for messages to this worker.
        stream: mpsc::UnboundedSender<WorkerMsg>,
        /// Registration outcome.
        reply: oneshot::Sender<Result<(), Error>>,
    },
    /// A worker connection was lost or it signed off.
    WorkerUnregister {
        /// Canonical address.
        address: Address,
    },
    /// A worker heartbeat.
    WorkerHeartbeat {
        /// Canonical address.
        address: Address,
        /// Memory numbers.
        metrics: HeartbeatMetrics,
        /// Heartbeat outcome (`Missing` asks for re-registration).
        reply: oneshot::Sender<HeartbeatReply>,
    },
    /// An event on a worker's stream.
    WorkerEventMsg {
        /// Canonical address.
        address: Address,
        /// The event.
        event: WorkerEvent,
    },
}

impl Scheduler {
    /// Drives the scheduler from a stimulus channel until it closes, the
    /// channel ends, or the state is poisoned. Periodic sweeps (liveness,
    /// idle detection, event-log retention, restart deadlines) run between
    /// stimuli.
    pub async fn run(mut self, mut stimuli: mpsc::Receiver<Stimulus>) -> Result<(), Error> {
        let mut restart_reply: Option<oneshot::Sender<Result<ClientReply, Error>>> = None;
        let mut sweep = tokio::time::interval(Duration::from_millis(250));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if self.status != SchedulerStatus::Running {
                break;
            }
            tokio::select! {
                biased;
                stimulus = stimuli.recv() => {
                    let Some(stimulus) = stimulus else {
                        self.close();
                        break;
                    };
                    self.dispatch(stimulus, &mut restart_reply).await;
                }
                _ = sweep.tick() => {
                    let now = Instant::now();
                    if self.sweep(now)? {
                        break;
                    }
                }
            }
            if let Some(outcome) = self.poll_restart(Instant::now()) {
                if let Some(reply) = restart_reply.take() {
                    let _ = reply.send(outcome.map(ClientReply::Restarted));
                }
            }
        }

        match self.status {
            SchedulerStatus::Failed => Err(Error::Failed),
            _ => Ok(()),
        }
    }

    async fn dispatch(
        &mut self,
        stimulus: Stimulus,
        restart_reply: &mut Option<oneshot::Sender<Result<ClientReply, Error>>>,
    ) {
        match stimulus {
            Stimulus::ClientConnect {
                client,
                versions,
                stream,
            } => self.add_client(&client, versions, stream),
            Stimulus::ClientDisconnect { client } => {
                if let Err(error) = self.remove_client(&client) {
                    tracing::warn!(client, %error, "client removal failed");
                }
            }
            Stimulus::ClientOp {
                client,
                request,
                reply,
            } => {
                let op = request.op();
                if self.config.blocked_handlers.iter().any(|h| h == op) {
                    let _ = reply.send(Err(Error::BlockedHandler {
                        handler: op.to_owned(),
                    }));
                    return;
                }
                if matches!(request, ClientRequest::Restart { .. }) && restart_reply.is_some() {
                    let _ = reply.send(Err(Error::Timeout {
                        operation: "restart".to_owned(),
                        seconds: 0.0,
                    }));
                    return;
                }
                match request {
                    ClientRequest::Restart {
                        timeout,
                        wait_for_workers,
                    } => match self.begin_restart(timeout, wait_for_workers) {
                        Ok(()) => *restart_reply = Some(reply),
                        Err(error) => {
                            let _ = reply.send(Err(error));
                        }
                    },
                    other => {
                        let outcome = self.client_op(&client, other).await;
                        let _ = reply.send(outcome);
                    }
                }
            }
            Stimulus::WorkerRegister {
                registration,
                keys_in_memory,
                stream,
                reply,
            } => {
                let outcome = self
                    .register_worker(registration, keys_in_memory, stream)
                    .map(|_| ());
                let _ = reply.send(outcome);
            }
            Stimulus::WorkerUnregister { address } => {
                let stimulus_id = StimulusId::new("unregister-worker");
                if let Err(error) = self.remove_worker(&address, &stimulus_id) {
                    tracing::warn!(worker = %address, %error, "worker removal failed");
                }
            }
            Stimulus::WorkerHeartbeat {
                address,
                metrics,
                reply,
            } => {
                let _ = reply.send(self.handle_heartbeat(&address, metrics));
            }
            Stimulus::WorkerEventMsg { address, event } => {
                if let Err(error) = self.handle_worker_event(&address, event) {
                    tracing::warn!(worker = %address, %error, "worker event failed");
                }
            }
        }
    }

    /// Executes one non-restart client operation.
    pub async fn client_op(
        &mut self,
        client: &str,
        request: ClientRequest,
    ) -> Result<ClientReply, Error> {
        match request {
            ClientRequest::UpdateGraph(update) => {
                self.update_graph(client, update)?;
                Ok(ClientReply::Done)
            }
            ClientRequest::ReleaseKeys { keys } => {
                self.release_keys(client, &keys)?;
                Ok(ClientReply::Done)
            }
            ClientRequest::CancelKeys { keys, force } => {
                self.cancel_keys(&keys, force)?;
                Ok(ClientReply::Done)
            }
            ClientRequest::SetRestrictions { worker } => {
                self.set_restrictions(worker)?;
                Ok(ClientReply::Done)
            }
            ClientRequest::Scatter {
                data,
                workers,
                broadcast,
                timeout,
            } => self
                .scatter(client, data, workers, broadcast, timeout)
                .await
                .map(ClientReply::Scattered),
            ClientRequest::Gather { keys } => self.gather(keys).await.map(ClientReply::Gathered),
            ClientRequest::RetireWorkers { workers, names, n } => self
                .retire_workers(workers, names, n)
                .await
                .map(ClientReply::Retired),
            ClientRequest::Rebalance { keys, workers } => self
                .rebalance(keys, workers)
                .await
                .map(ClientReply::Rebalanced),
            ClientRequest::RunOnScheduler { payload } => {
                self.run_on_scheduler(payload).map(ClientReply::Ran)
            }
            ClientRequest::Restart { .. } => unreachable!("restart is handled by the loop"),
        }
    }
}
