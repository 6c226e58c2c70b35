// SPDX-License-Identifier: Apache-2.0

//! The transition engine: per-task lifecycle changes, follow-on
//! recommendations and the transition log.
//!
//! A transition is identified by the pair (current state, requested goal)
//! and dispatched through one exhaustive match; pairs outside the allowed
//! table fail hard. Each handler mutates the stores, enqueues outbound
//! messages into the outbox (never sending inline) and returns an ordered
//! list of follow-on recommendations which the batch driver processes
//! depth-first. A batch either commits entirely or poisons the scheduler;
//! partial state is never observable at stimulus boundaries.

use crate::control::{ClientMsg, StimulusId, WorkerMsg};
use crate::error::Error;
use crate::placement::{decide_worker, transfer_cost};
use crate::scheduler::Scheduler;
use crate::task::{TaskId, TaskKey, TaskRunState};
use crate::worker::WorkerId;
use smallvec::SmallVec;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

/// The state a transition wants to reach, with the payload that state
/// requires.
#[derive(Debug, Clone)]
pub(crate) enum Goal {
    /// Wait for dependencies to arrive in memory.
    Waiting,
    /// Assign to a worker (falls through to `no-worker` when none fits).
    Processing,
    /// A worker holds the result.
    Memory {
        /// The worker that produced or received the result.
        worker: WorkerId,
        /// Size of the result, when reported.
        nbytes: Option<u64>,
        /// Type name of the result, when reported.
        type_name: Option<String>,
    },
    /// The task failed permanently.
    Erred {
        /// Rendered exception.
        exception: String,
        /// Rendered traceback.
        traceback: Option<String>,
    },
    /// Drop any assignment or replicas, keeping the task known.
    Released,
    /// Remove the task from the scheduler entirely.
    Forgotten,
}

impl Goal {
    /// The wire/log name of the requested state.
    #[must_use]
    pub(crate) const fn state_name(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Processing => "processing",
            Self::Memory { .. } => "memory",
            Self::Erred { .. } => "erred",
            Self::Released => "released",
            Self::Forgotten => "forgotten",
        }
    }
}

/// Ordered follow-on recommendations returned by a transition handler.
pub(crate) type Recs = SmallVec<[(TaskId, Goal); 4]>;

/// One committed transition.
#[derive(Debug)]
pub struct TransitionLogEntry {
    /// Key of the transitioned task.
    pub key: TaskKey,
    /// State before.
    pub start: &'static str,
    /// State after.
    pub finish: &'static str,
    /// Keys and goal states of the follow-on recommendations.
    pub recommendations: Vec<(TaskKey, &'static str)>,
    /// The stimulus that caused the batch.
    pub stimulus_id: StimulusId,
    /// When the transition committed.
    pub timestamp: Instant,
}

/// Bounded ring buffer of committed transitions plus the batch counter.
#[derive(Debug)]
pub struct TransitionLog {
    entries: VecDeque<TransitionLogEntry>,
    capacity: usize,
    /// Total number of transitions committed over the scheduler lifetime.
    pub counter: u64,
    /// Abort threshold for runaway batches; `None` disables the guard.
    pub counter_max: Option<u64>,
}

impl TransitionLog {
    /// Creates a log retaining at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize, counter_max: Option<u64>) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
            counter: 0,
            counter_max,
        }
    }

    fn push(&mut self, entry: TransitionLogEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            let _ = self.entries.pop_front();
        }
    }

    /// All retained entries, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &TransitionLogEntry> {
        self.entries.iter()
    }

    /// The subset of the log mentioning any of `keys`, either as the
    /// transitioned task or inside the recommendations.
    #[must_use]
    pub fn story(&self, keys: &[&str]) -> Vec<&TransitionLogEntry> {
        self.entries
            .iter()
            .filter(|entry| {
                keys.iter().any(|key| {
                    entry.key == *key
                        || entry
                            .recommendations
                            .iter()
                            .any(|(rec_key, _)| rec_key == key)
                })
            })
            .collect()
    }
}

impl Scheduler {
    /// Runs a batch of transitions depth-first until no recommendations
    /// remain. On error the scheduler is poisoned: it enters the failed
    /// status and refuses further stimuli.
    pub(crate) fn transitions(&mut self, recs: Recs, stimulus_id: &StimulusId) -> Result<(), Error> {
        let mut stack: Vec<(TaskId, Goal)> = Vec::with_capacity(recs.len());
        stack.extend(recs.into_iter().rev());
        while let Some((task, goal)) = stack.pop() {
            match self.transition(task, goal, stimulus_id) {
                Ok(follow_ons) => {
                    stack.extend(follow_ons.into_iter().rev());
                }
                Err(error) => {
                    tracing::error!(%stimulus_id, %error, "transition batch failed; state is corrupted");
                    self.poison();
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    /// Applies a single transition and returns its follow-on
    /// recommendations.
    fn transition(
        &mut self,
        task: TaskId,
        goal: Goal,
        stimulus_id: &StimulusId,
    ) -> Result<Recs, Error> {
        // The task may have been forgotten earlier in the same batch.
        let Some(ts) = self.graph.get(task) else {
            return Ok(Recs::new());
        };
        let start = ts.state;
        let key = ts.key.clone();
        if start.as_str() == goal.state_name() {
            return Ok(Recs::new());
        }

        self.transition_log.counter += 1;
        if let Some(max) = self.transition_log.counter_max {
            if self.transition_log.counter > max {
                return Err(Error::TransitionCounterMaxExceeded { key, max });
            }
        }

        use TaskRunState as S;
        let recs = match (start, goal) {
            (S::Released, Goal::Waiting) => self.transition_released_waiting(task),
            (S::Released | S::Waiting | S::NoWorker, Goal::Processing) => {
                self.transition_to_processing(task, stimulus_id)
            }
            (S::Released, Goal::Memory { worker, nbytes, type_name }) => {
                Ok(self.finish_in_memory(task, worker, nbytes, type_name))
            }
            (S::Waiting | S::NoWorker, Goal::Released) => self.transition_unscheduled_released(task),
            (S::Waiting | S::NoWorker, Goal::Erred { exception, traceback }) => {
                Ok(self.finish_erred(task, exception, traceback))
            }
            (S::Processing, Goal::Memory { worker, nbytes, type_name }) => {
                self.transition_processing_memory(task, worker, nbytes, type_name)
            }
            (S::Processing, Goal::Erred { exception, traceback }) => {
                self.withdraw_processing(task, stimulus_id);
                Ok(self.finish_erred(task, exception, traceback))
            }
            (S::Processing, Goal::Released) => {
                self.withdraw_processing(task, stimulus_id);
                Ok(self.released_follow_ons(task))
            }
            (S::Processing, Goal::Waiting) => {
                self.withdraw_processing(task, stimulus_id);
                let _ = self.graph.set_state(task, S::Waiting);
                Ok(self.ready_follow_on(task))
            }
            (S::Memory, Goal::Released) => self.transition_memory_released(task, stimulus_id),
            (S::Erred, Goal::Released) => self.transition_erred_released(task),
            (S::Released | S::Erred, Goal::Forgotten) => Ok(self.forget_task(task)),
            (S::Memory, Goal::Forgotten) => {
                let _ = self.transition_memory_released(task, stimulus_id)?;
                Ok(self.forget_task(task))
            }
            (_, goal) => Err(Error::InvalidTransition {
                key: key.clone(),
                start: start.as_str(),
                finish: goal.state_name(),
            }),
        }?;

        // The handler may have routed to a different finish state than the
        // goal (e.g. processing requested, no worker available) or removed
        // the task entirely.
        let finish = self
            .graph
            .get(task)
            .map_or("forgotten", |ts| ts.state.as_str());
        if finish == start.as_str() {
            return Ok(recs);
        }

        let recommendations: Vec<(TaskKey, &'static str)> = recs
            .iter()
            .filter_map(|(rec_task, rec_goal)| {
                self.graph
                    .get(*rec_task)
                    .map(|ts| (ts.key.clone(), rec_goal.state_name()))
            })
            .collect();
        tracing::debug!(%key, start = start.as_str(), finish, %stimulus_id, "transition");
        self.transition_log.push(TransitionLogEntry {
            key: key.clone(),
            start: start.as_str(),
            finish,
            recommendations,
            stimulus_id: stimulus_id.clone(),
            timestamp: Instant::now(),
        });
        for plugin in self.plugins.values_mut() {
            plugin.transition(&key, start.as_str(), finish, stimulus_id);
        }
        Ok(recs)
    }

    fn transition_released_waiting(&mut self, task: TaskId) -> Result<Recs, Error> {
        // A dependency that already failed poisons the task right away.
        let failed_dep = self
            .graph
            .task(task)
            .dependencies
            .iter()
            .find(|dep| self.graph.task(**dep).state == TaskRunState::Erred)
            .copied();
        if let Some(dep) = failed_dep {
            let cause = self
                .graph
                .task(dep)
                .erred
                .clone()
                .map_or_else(|| "dependency failed".to_owned(), |info| info.exception);
            return Ok(self.finish_erred(task, cause, None));
        }

        let _ = self.graph.set_state(task, TaskRunState::Waiting);
        Ok(self.ready_follow_on(task))
    }

    /// If every dependency is in memory, recommend moving on to
    /// processing.
    fn ready_follow_on(&self, task: TaskId) -> Recs {
        let mut recs = Recs::new();
        if self.deps_in_memory(task) {
            recs.push((task, Goal::Processing));
        }
        recs
    }

    fn transition_to_processing(
        &mut self,
        task: TaskId,
        stimulus_id: &StimulusId,
    ) -> Result<Recs, Error> {
        if !self.deps_in_memory(task) {
            // A dependency left memory while the task was parked (e.g. a
            // replica vanished between readiness and placement).
            let _ = self.unrunnable.remove(&task);
            let _ = self.graph.set_state(task, TaskRunState::Waiting);
            return Ok(Recs::new());
        }

        let Some(worker) = decide_worker(&self.graph, &self.workers, self.bandwidth, task) else {
            let _ = self.unrunnable.insert(task);
            let _ = self.graph.set_state(task, TaskRunState::NoWorker);
            return Ok(Recs::new());
        };
        let _ = self.unrunnable.remove(&task);

        let comm = transfer_cost(&self.graph, self.graph.task(task), worker, self.bandwidth);
        let duration = self.durations.estimate(&self.graph, task);
        let cost = duration + comm;

        self.consume_resources(task, worker);
        self.workers.worker_mut(worker).start_processing(task, cost);
        self.total_occupancy += cost;
        self.graph.task_mut(task).processing_on = Some(worker);
        let group = self.graph.task(task).group;
        self.graph.group_mut(group).add_occupancy(worker);
        let _ = self.graph.set_state(task, TaskRunState::Processing);

        let msg = self.compute_task_msg(task, duration, stimulus_id);
        self.outbox.worker(worker, msg);
        Ok(Recs::new())
    }

    fn compute_task_msg(
        &self,
        task: TaskId,
        duration: f64,
        stimulus_id: &StimulusId,
    ) -> WorkerMsg {
        let ts = self.graph.task(task);
        let mut who_has: HashMap<TaskKey, Vec<String>> = HashMap::new();
        let mut nbytes: HashMap<TaskKey, u64> = HashMap::new();
        for dep in &ts.dependencies {
            let dep_ts = self.graph.task(*dep);
            let addresses = dep_ts
                .who_has
                .iter()
                .filter_map(|id| self.workers.get(*id).map(|ws| ws.address.clone()))
                .collect();
            let _ = who_has.insert(dep_ts.key.clone(), addresses);
            let _ = nbytes.insert(dep_ts.key.clone(), dep_ts.nbytes_or_zero());
        }
        WorkerMsg::ComputeTask {
            key: ts.key.clone(),
            priority: ts.priority.order,
            duration,
            run_spec: ts.run_spec.clone().unwrap_or_default(),
            who_has,
            nbytes,
            annotations: ts.annotations.clone(),
            stimulus_id: stimulus_id.clone(),
        }
    }

    fn transition_processing_memory(
        &mut self,
        task: TaskId,
        worker: WorkerId,
        nbytes: Option<u64>,
        type_name: Option<String>,
    ) -> Result<Recs, Error> {
        let assigned = self.graph.task(task).processing_on;
        debug_assert_eq!(assigned, Some(worker), "finish from a foreign worker");

        if let Some(previous) = assigned {
            if self.workers.get(previous).is_some() {
                if let Some(cost) = self.workers.worker_mut(previous).stop_processing(task) {
                    self.total_occupancy = (self.total_occupancy - cost).max(0.0);
                }
                self.release_resources(task, previous);
            }
            let group = self.graph.task(task).group;
            self.graph.group_mut(group).remove_occupancy(previous);
        }
        self.graph.task_mut(task).processing_on = None;
        Ok(self.finish_in_memory(task, worker, nbytes, type_name))
    }

    /// Shared tail of every route into the memory state: record the
    /// replica, notify interested clients, wake up dependents and release
    /// dependencies nobody needs anymore.
    fn finish_in_memory(
        &mut self,
        task: TaskId,
        worker: WorkerId,
        nbytes: Option<u64>,
        type_name: Option<String>,
    ) -> Recs {
        if let Some(size) = nbytes {
            self.graph.set_nbytes(task, size);
        }
        if let Some(name) = type_name {
            self.graph.task_mut(task).type_name = Some(name);
        }
        let _ = self.graph.set_state(task, TaskRunState::Memory);
        let _ = self.unrunnable.remove(&task);
        self.add_replica(task, worker);

        let (key, type_name, who_wants) = {
            let ts = self.graph.task(task);
            (
                ts.key.clone(),
                ts.type_name.clone(),
                ts.who_wants.iter().cloned().collect::<Vec<_>>(),
            )
        };
        for client in who_wants {
            self.outbox.client(
                &client,
                ClientMsg::KeyInMemory {
                    key: key.clone(),
                    type_name: type_name.clone(),
                },
            );
        }

        let mut recs = Recs::new();
        // Deterministic order: dependents sorted by priority, then key.
        let mut dependents: Vec<TaskId> = self.graph.task(task).dependents.iter().copied().collect();
        dependents.sort_by(|a, b| {
            let (ta, tb) = (self.graph.task(*a), self.graph.task(*b));
            ta.priority.cmp(&tb.priority).then(ta.key.cmp(&tb.key))
        });
        for dependent in dependents {
            if self.graph.task(dependent).state == TaskRunState::Waiting
                && self.deps_in_memory(dependent)
            {
                recs.push((dependent, Goal::Processing));
            }
        }
        // Dependencies whose last consumer just finished can be freed.
        let dependencies: Vec<TaskId> = self.graph.task(task).dependencies.iter().copied().collect();
        for dep in dependencies {
            if self.releasable(dep) {
                recs.push((dep, Goal::Released));
            }
        }
        recs
    }

    /// Shared tail of every route into the erred state.
    fn finish_erred(&mut self, task: TaskId, exception: String, traceback: Option<String>) -> Recs {
        let _ = self.unrunnable.remove(&task);
        {
            let ts = self.graph.task_mut(task);
            ts.erred = Some(crate::task::TaskErredInfo {
                exception: exception.clone(),
                traceback: traceback.clone(),
            });
        }
        let _ = self.graph.set_state(task, TaskRunState::Erred);

        let (key, who_wants) = {
            let ts = self.graph.task(task);
            (ts.key.clone(), ts.who_wants.iter().cloned().collect::<Vec<_>>())
        };
        for client in who_wants {
            self.outbox.client(
                &client,
                ClientMsg::TaskErred {
                    key: key.clone(),
                    exception: exception.clone(),
                    traceback: traceback.clone(),
                },
            );
        }

        // Every dependent must end up erred or released.
        let mut recs = Recs::new();
        let mut dependents: Vec<TaskId> = self.graph.task(task).dependents.iter().copied().collect();
        dependents.sort_by(|a, b| self.graph.task(*a).key.cmp(&self.graph.task(*b).key));
        for dependent in dependents {
            match self.graph.task(dependent).state {
                TaskRunState::Erred | TaskRunState::Released | TaskRunState::Forgotten => {}
                _ => recs.push((
                    dependent,
                    Goal::Erred {
                        exception: exception.clone(),
                        traceback: None,
                    },
                )),
            }
        }
        // Dependencies may have lost their last consumer.
        let dependencies: Vec<TaskId> = self.graph.task(task).dependencies.iter().copied().collect();
        for dep in dependencies {
            if self.releasable(dep) {
                recs.push((dep, Goal::Released));
            }
        }
        recs
    }

    /// Pulls a task off the worker currently executing it, refunding cost
    /// and resources and telling the worker to abort.
    fn withdraw_processing(&mut self, task: TaskId, stimulus_id: &StimulusId) {
        let Some(worker) = self.graph.task(task).processing_on else {
            return;
        };
        if self.workers.get(worker).is_some() {
            if let Some(cost) = self.workers.worker_mut(worker).stop_processing(task) {
                self.total_occupancy = (self.total_occupancy - cost).max(0.0);
            }
            self.release_resources(task, worker);
            self.outbox.worker(
                worker,
                WorkerMsg::CancelCompute {
                    key: self.graph.task(task).key.clone(),
                    stimulus_id: stimulus_id.clone(),
                },
            );
        }
        let group = self.graph.task(task).group;
        self.graph.group_mut(group).remove_occupancy(worker);
        self.graph.task_mut(task).processing_on = None;
    }

    /// Processing was withdrawn; decide where the released task goes next.
    fn released_follow_ons(&mut self, task: TaskId) -> Recs {
        let _ = self.graph.set_state(task, TaskRunState::Released);
        let mut recs = Recs::new();
        if self.needed(task) {
            if self.deps_in_memory(task) {
                recs.push((task, Goal::Processing));
            } else {
                recs.push((task, Goal::Waiting));
            }
        } else if self.forgettable(task) {
            recs.push((task, Goal::Forgotten));
        }
        recs
    }

    fn transition_unscheduled_released(&mut self, task: TaskId) -> Result<Recs, Error> {
        let _ = self.unrunnable.remove(&task);
        let _ = self.graph.set_state(task, TaskRunState::Released);
        let mut recs = Recs::new();
        if self.forgettable(task) {
            recs.push((task, Goal::Forgotten));
        }
        Ok(recs)
    }

    fn transition_memory_released(
        &mut self,
        task: TaskId,
        stimulus_id: &StimulusId,
    ) -> Result<Recs, Error> {
        debug_assert!(self.graph.task(task).processing_on.is_none());

        let key = self.graph.task(task).key.clone();
        let replicas: Vec<WorkerId> = self.graph.task(task).who_has.iter().copied().collect();
        for worker in replicas {
            self.remove_replica(task, worker);
            self.outbox.worker(
                worker,
                WorkerMsg::FreeKeys {
                    keys: vec![key.clone()],
                    stimulus_id: stimulus_id.clone(),
                },
            );
        }
        let _ = self.graph.set_state(task, TaskRunState::Released);

        let mut recs = Recs::new();
        if !self.needed(task) {
            if self.forgettable(task) {
                recs.push((task, Goal::Forgotten));
            }
            return Ok(recs);
        }

        // Somebody still needs the result. Recompute when possible,
        // otherwise the data is lost for good.
        if self.graph.task(task).run_spec.is_some() {
            recs.push((task, Goal::Waiting));
            return Ok(recs);
        }

        let who_wants: Vec<String> = self.graph.task(task).who_wants.iter().cloned().collect();
        for client in who_wants {
            self.outbox.client(&client, ClientMsg::LostData { key: key.clone() });
        }
        let exception = format!("KeyLost: scattered data {key} has no replica left");
        let mut dependents: Vec<TaskId> = self.graph.task(task).dependents.iter().copied().collect();
        dependents.sort_by(|a, b| self.graph.task(*a).key.cmp(&self.graph.task(*b).key));
        for dependent in dependents {
            match self.graph.task(dependent).state {
                TaskRunState::Waiting | TaskRunState::Processing | TaskRunState::NoWorker => {
                    recs.push((
                        dependent,
                        Goal::Erred {
                            exception: exception.clone(),
                            traceback: None,
                        },
                    ));
                }
                _ => {}
            }
        }
        Ok(recs)
    }

    fn transition_erred_released(&mut self, task: TaskId) -> Result<Recs, Error> {
        self.graph.task_mut(task).erred = None;
        let _ = self.graph.set_state(task, TaskRunState::Released);
        let mut recs = Recs::new();
        if self.needed(task) {
            recs.push((task, Goal::Waiting));
        } else if self.forgettable(task) {
            recs.push((task, Goal::Forgotten));
        }
        Ok(recs)
    }

    /// Removes the task from the scheduler, recommending release of
    /// dependencies that lost their last reference.
    fn forget_task(&mut self, task: TaskId) -> Recs {
        debug_assert!(self.graph.task(task).who_has.is_empty(), "forget with replicas");

        self.durations.forget_task(&self.graph, task);
        self.clients.forget_task(task);
        let _ = self.unrunnable.remove(&task);

        let dependencies: Vec<TaskId> = self.graph.task(task).dependencies.iter().copied().collect();
        self.graph.forget(task);

        let mut recs = Recs::new();
        for dep in dependencies {
            if self.graph.get(dep).is_some() {
                self.push_release_if_unneeded(dep, &mut recs);
            }
        }
        recs
    }

    // --- shared predicates and bookkeeping -----------------------------

    /// Whether every dependency of `task` is in memory.
    pub(crate) fn deps_in_memory(&self, task: TaskId) -> bool {
        self.graph
            .task(task)
            .dependencies
            .iter()
            .all(|dep| self.graph.task(*dep).state == TaskRunState::Memory)
    }

    /// Whether anything still needs this task: a client future, or a
    /// dependent with work ahead of it.
    pub(crate) fn needed(&self, task: TaskId) -> bool {
        let ts = self.graph.task(task);
        if !ts.who_wants.is_empty() {
            return true;
        }
        ts.dependents.iter().any(|dep| {
            matches!(
                self.graph.task(*dep).state,
                TaskRunState::Waiting | TaskRunState::Processing | TaskRunState::NoWorker
            )
        })
    }

    /// Whether a task in memory can be released: nobody wants it and every
    /// dependent already has what it needs.
    pub(crate) fn releasable(&self, task: TaskId) -> bool {
        let ts = self.graph.task(task);
        ts.state == TaskRunState::Memory
            && ts.who_wants.is_empty()
            && ts.dependents.iter().all(|dep| {
                matches!(
                    self.graph.task(*dep).state,
                    TaskRunState::Memory | TaskRunState::Erred
                )
            })
    }

    /// Whether a released task can be forgotten outright: no replicas, no
    /// interested client, and no dependent that is not itself on the way
    /// out.
    pub(crate) fn forgettable(&self, task: TaskId) -> bool {
        let ts = self.graph.task(task);
        ts.who_has.is_empty() && ts.who_wants.is_empty() && ts.dependents.is_empty()
    }

    /// Records a replica, updating both directions of the relation and the
    /// byte/occupancy accounting. Adding the same replica twice is a no-op
    /// (no double counting).
    pub(crate) fn add_replica(&mut self, task: TaskId, worker: WorkerId) {
        if !self.graph.task_mut(task).who_has.insert(worker) {
            return;
        }
        let nbytes = self.graph.task(task).nbytes_or_zero();
        let ws = self.workers.worker_mut(worker);
        let _ = ws.has_what.insert(task);
        ws.nbytes += nbytes;
        let group = self.graph.task(task).group;
        self.graph.group_mut(group).add_occupancy(worker);
    }

    /// Removes a replica; the inverse of [`Self::add_replica`], equally
    /// idempotent. Safe to call for workers already gone from the
    /// registry.
    pub(crate) fn remove_replica(&mut self, task: TaskId, worker: WorkerId) {
        if !self.graph.task_mut(task).who_has.remove(&worker) {
            return;
        }
        let nbytes = self.graph.task(task).nbytes_or_zero();
        if self.workers.get(worker).is_some() {
            let ws = self.workers.worker_mut(worker);
            let _ = ws.has_what.shift_remove(&task);
            ws.nbytes = ws.nbytes.saturating_sub(nbytes);
        }
        let group = self.graph.task(task).group;
        self.graph.group_mut(group).remove_occupancy(worker);
    }

    fn consume_resources(&mut self, task: TaskId, worker: WorkerId) {
        let Some(needs) = self.graph.task(task).resource_restrictions.clone() else {
            return;
        };
        let ws = self.workers.worker_mut(worker);
        for (name, need) in needs {
            *ws.used_resources.entry(name).or_insert(0.0) += need;
        }
    }

    fn release_resources(&mut self, task: TaskId, worker: WorkerId) {
        let Some(needs) = self.graph.task(task).resource_restrictions.clone() else {
            return;
        };
        let ws = self.workers.worker_mut(worker);
        for (name, need) in needs {
            if let Some(used) = ws.used_resources.get_mut(&name) {
                *used = (*used - need).max(0.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{GraphUpdate, TaskSpec, WorkerEvent};
    use crate::scheduler::SchedulerStatus;
    use crate::testing::TestCluster;
    use bytes::Bytes;
    use gridflow_config::SchedulerConfig;
    use pretty_assertions::assert_eq;

    fn spec(key: &str, deps: &[&str]) -> TaskSpec {
        TaskSpec {
            key: key.to_owned(),
            run_spec: Some(Bytes::from_static(b"f")),
            dependencies: deps.iter().map(|d| (*d).to_owned()).collect(),
            ..TaskSpec::default()
        }
    }

    fn chain_update() -> GraphUpdate {
        GraphUpdate {
            tasks: vec![spec("x-1", &[]), spec("y-1", &["x-1"]), spec("z-1", &["y-1"])],
            keys: vec!["z-1".to_owned()],
        }
    }

    fn cluster_with_one_worker() -> TestCluster {
        let mut cluster = TestCluster::new(SchedulerConfig::default());
        let _ = cluster.add_worker("tcp://10.0.0.1:1", 1).expect("ok");
        cluster
    }

    #[test]
    fn submission_schedules_the_ready_root_only() {
        let mut cluster = cluster_with_one_worker();
        cluster
            .scheduler
            .add_client("c1", serde_json::Value::Null, tokio::sync::mpsc::unbounded_channel().0);
        cluster
            .scheduler
            .update_graph("c1", chain_update())
            .expect("submission succeeds");

        let graph = cluster.scheduler.graph();
        let x = graph.id_of("x-1").expect("exists");
        let y = graph.id_of("y-1").expect("exists");
        let z = graph.id_of("z-1").expect("exists");
        assert_eq!(graph.task(x).state, TaskRunState::Processing);
        assert_eq!(graph.task(y).state, TaskRunState::Waiting);
        assert_eq!(graph.task(z).state, TaskRunState::Waiting);
        assert_eq!(cluster.compute_sent_to("x-1"), Some("tcp://10.0.0.1:1".to_owned()));
        cluster.scheduler.validate_state().expect("invariants hold");
    }

    #[test]
    fn completions_cascade_down_the_chain() {
        let mut cluster = cluster_with_one_worker();
        cluster
            .scheduler
            .add_client("c1", serde_json::Value::Null, tokio::sync::mpsc::unbounded_channel().0);
        cluster
            .scheduler
            .update_graph("c1", chain_update())
            .expect("submission succeeds");

        cluster.finish_task("tcp://10.0.0.1:1", "x-1", 8).expect("ok");
        {
            let graph = cluster.scheduler.graph();
            let x = graph.id_of("x-1").expect("exists");
            let y = graph.id_of("y-1").expect("exists");
            assert_eq!(graph.task(x).state, TaskRunState::Memory);
            assert_eq!(graph.task(y).state, TaskRunState::Processing);
        }
        cluster.finish_task("tcp://10.0.0.1:1", "y-1", 8).expect("ok");
        {
            // x-1 lost its last consumer and nobody holds a future for it:
            // its replicas are freed, and it lingers released only because
            // its dependent is still known.
            let graph = cluster.scheduler.graph();
            let x = graph.id_of("x-1").expect("exists");
            assert_eq!(graph.task(x).state, TaskRunState::Released);
            assert!(graph.task(x).who_has.is_empty());
            let z = graph.id_of("z-1").expect("exists");
            assert_eq!(graph.task(z).state, TaskRunState::Processing);
        }
        cluster.finish_task("tcp://10.0.0.1:1", "z-1", 8).expect("ok");
        let graph = cluster.scheduler.graph();
        let z = graph.id_of("z-1").expect("exists");
        assert_eq!(graph.task(z).state, TaskRunState::Memory);
        cluster.scheduler.validate_state().expect("invariants hold");
    }

    #[test]
    fn failures_cascade_to_dependents_and_clients_are_told() {
        let mut cluster = cluster_with_one_worker();
        let (client_tx, mut client_rx) = tokio::sync::mpsc::unbounded_channel();
        cluster
            .scheduler
            .add_client("c1", serde_json::Value::Null, client_tx);
        cluster
            .scheduler
            .update_graph("c1", chain_update())
            .expect("submission succeeds");

        cluster
            .scheduler
            .handle_worker_event(
                "tcp://10.0.0.1:1",
                WorkerEvent::TaskErred {
                    key: "x-1".to_owned(),
                    exception: "ZeroDivisionError".to_owned(),
                    traceback: None,
                },
            )
            .expect("handled");

        let graph = cluster.scheduler.graph();
        for key in ["x-1", "y-1", "z-1"] {
            let id = graph.id_of(key).expect("exists");
            assert_eq!(graph.task(id).state, TaskRunState::Erred, "{key}");
        }
        // The client wanted z-1 and must hear about the failure.
        let mut saw_erred = false;
        while let Ok(msg) = client_rx.try_recv() {
            if let ClientMsg::TaskErred { key, exception, .. } = msg {
                assert_eq!(key, "z-1");
                assert!(exception.contains("ZeroDivisionError"));
                saw_erred = true;
            }
        }
        assert!(saw_erred);
        cluster.scheduler.validate_state().expect("invariants hold");
    }

    #[test]
    fn retries_consume_before_erring() {
        let mut cluster = cluster_with_one_worker();
        cluster
            .scheduler
            .add_client("c1", serde_json::Value::Null, tokio::sync::mpsc::unbounded_channel().0);
        let mut task_spec = spec("flaky-1", &[]);
        task_spec.retries = 3;
        cluster
            .scheduler
            .update_graph(
                "c1",
                GraphUpdate {
                    tasks: vec![task_spec],
                    keys: vec!["flaky-1".to_owned()],
                },
            )
            .expect("submission succeeds");

        for _ in 0..2 {
            cluster
                .scheduler
                .handle_worker_event(
                    "tcp://10.0.0.1:1",
                    WorkerEvent::TaskErred {
                        key: "flaky-1".to_owned(),
                        exception: "two".to_owned(),
                        traceback: None,
                    },
                )
                .expect("handled");
            let graph = cluster.scheduler.graph();
            let id = graph.id_of("flaky-1").expect("exists");
            assert_eq!(graph.task(id).state, TaskRunState::Processing);
        }
        cluster.finish_task("tcp://10.0.0.1:1", "flaky-1", 8).expect("ok");

        let graph = cluster.scheduler.graph();
        let id = graph.id_of("flaky-1").expect("exists");
        assert_eq!(graph.task(id).state, TaskRunState::Memory);
        assert_eq!(graph.task(id).retries, 1);
    }

    #[test]
    fn exhausted_retries_err_with_the_last_exception() {
        let mut cluster = cluster_with_one_worker();
        cluster
            .scheduler
            .add_client("c1", serde_json::Value::Null, tokio::sync::mpsc::unbounded_channel().0);
        let mut task_spec = spec("flaky-1", &[]);
        task_spec.retries = 1;
        cluster
            .scheduler
            .update_graph(
                "c1",
                GraphUpdate {
                    tasks: vec![task_spec],
                    keys: vec!["flaky-1".to_owned()],
                },
            )
            .expect("submission succeeds");

        for exception in ["one", "two"] {
            cluster
                .scheduler
                .handle_worker_event(
                    "tcp://10.0.0.1:1",
                    WorkerEvent::TaskErred {
                        key: "flaky-1".to_owned(),
                        exception: exception.to_owned(),
                        traceback: None,
                    },
                )
                .expect("handled");
        }
        let graph = cluster.scheduler.graph();
        let id = graph.id_of("flaky-1").expect("exists");
        assert_eq!(graph.task(id).state, TaskRunState::Erred);
        assert_eq!(
            graph.task(id).erred.as_ref().expect("erred info").exception,
            "two"
        );
    }

    #[test]
    fn counter_max_aborts_the_batch_and_poisons_the_scheduler() {
        let config = SchedulerConfig {
            transition_counter_max: Some(1),
            ..SchedulerConfig::default()
        };
        let mut cluster = TestCluster::new(config);
        let _ = cluster.add_worker("tcp://10.0.0.1:1", 1).expect("ok");
        cluster
            .scheduler
            .add_client("c1", serde_json::Value::Null, tokio::sync::mpsc::unbounded_channel().0);

        let err = cluster
            .scheduler
            .update_graph("c1", chain_update())
            .expect_err("the batch must abort");
        assert!(matches!(err, Error::TransitionCounterMaxExceeded { .. }));
        assert_eq!(cluster.scheduler.status(), SchedulerStatus::Failed);
        // The poisoned scheduler refuses further stimuli.
        assert!(matches!(
            cluster.scheduler.update_graph("c1", chain_update()),
            Err(Error::Failed)
        ));
    }

    #[test]
    fn story_returns_only_entries_mentioning_the_keys() {
        let mut cluster = cluster_with_one_worker();
        cluster
            .scheduler
            .add_client("c1", serde_json::Value::Null, tokio::sync::mpsc::unbounded_channel().0);
        cluster
            .scheduler
            .update_graph("c1", chain_update())
            .expect("submission succeeds");
        cluster.finish_task("tcp://10.0.0.1:1", "x-1", 8).expect("ok");

        let log = cluster.scheduler.transition_log();
        let story = log.story(&["x-1"]);
        assert!(!story.is_empty());
        assert!(story.len() < log.entries().count());
        for entry in &story {
            assert!(
                entry.key == "x-1"
                    || entry.recommendations.iter().any(|(key, _)| key == "x-1")
            );
        }
        let wider = log.story(&["x-1", "y-1"]);
        assert!(wider.len() >= story.len());
    }

    #[test]
    fn transition_log_is_bounded() {
        let mut log = TransitionLog::new(2, None);
        for i in 0..5 {
            log.push(TransitionLogEntry {
                key: format!("t-{i}"),
                start: "released",
                finish: "waiting",
                recommendations: Vec::new(),
                stimulus_id: StimulusId::new("test"),
                timestamp: Instant::now(),
            });
        }
        assert_eq!(log.entries().count(), 2);
        assert_eq!(log.entries().next().expect("nonempty").key, "t-3");
    }

    #[test]
    fn releasing_the_only_future_forgets_the_whole_chain() {
        let mut cluster = cluster_with_one_worker();
        cluster
            .scheduler
            .add_client("c1", serde_json::Value::Null, tokio::sync::mpsc::unbounded_channel().0);
        cluster
            .scheduler
            .update_graph("c1", chain_update())
            .expect("submission succeeds");
        cluster.finish_task("tcp://10.0.0.1:1", "x-1", 8).expect("ok");

        cluster
            .scheduler
            .release_keys("c1", &["z-1".to_owned()])
            .expect("released");
        let graph = cluster.scheduler.graph();
        assert!(graph.is_empty(), "all tasks should be forgotten");
        cluster.scheduler.validate_state().expect("invariants hold");
    }
}
