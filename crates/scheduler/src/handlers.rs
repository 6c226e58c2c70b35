// SPDX-License-Identifier: Apache-2.0

//! Ingress stimulus handlers: graph updates and control operations from
//! clients, and the event stream from workers.
//!
//! Every handler follows the same discipline: resolve the entities, mutate
//! the stores, feed recommendations to the transition engine, and flush
//! the outbox once the batch has committed. Worker-event handlers are
//! fully synchronous; only client operations that talk to workers
//! point-to-point (scatter, gather, rebalance, retire, restart) await, and
//! never in the middle of a transition batch.

use crate::control::{
    ClientMsg, GatherResponse, GraphUpdate, HeartbeatMetrics, HeartbeatReply, StartStop,
    StimulusId, WorkerEvent, WorkerMsg,
};
use crate::error::Error;
use crate::memory::MemoryState;
use crate::scheduler::Scheduler;
use crate::task::{Priority, TaskId, TaskKey, TaskRunState};
use crate::transition::{Goal, Recs};
use crate::worker::{RemoveWorkerResult, WorkerId, WorkerRegistration, WorkerStatus};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

impl Scheduler {
    /// Handles one event from a worker's stream. Events from unknown
    /// workers are dropped (the worker is told to re-register through its
    /// next heartbeat).
    pub fn handle_worker_event(&mut self, address: &str, event: WorkerEvent) -> Result<(), Error> {
        self.ensure_accepting()?;
        let Some(worker) = self.workers.id_of(address) else {
            tracing::warn!(worker = address, op = event.op(), "event from unknown worker");
            return Ok(());
        };
        self.workers.worker_mut(worker).last_seen = Instant::now();
        let stimulus_id = StimulusId::new(event.op());

        let result = match event {
            WorkerEvent::TaskFinished {
                key,
                nbytes,
                type_name,
                startstops,
            } => self.worker_task_finished(worker, &key, nbytes, type_name, &startstops, &stimulus_id),
            WorkerEvent::TaskErred {
                key,
                exception,
                traceback,
            } => self.worker_task_erred(worker, &key, exception, traceback, &stimulus_id),
            WorkerEvent::MissingData { key, errant_worker } => {
                self.worker_missing_data(&key, &errant_worker, &stimulus_id)
            }
            WorkerEvent::Reschedule { key } => self.worker_reschedule(&key, &stimulus_id),
            WorkerEvent::LongRunning {
                key,
                compute_duration,
            } => self.worker_long_running(worker, &key, compute_duration),
            WorkerEvent::AddKeys { keys } => self.worker_add_keys(worker, &keys, &stimulus_id),
            WorkerEvent::ReleaseWorkerData { keys } => {
                self.worker_release_data(worker, &keys, &stimulus_id)
            }
            WorkerEvent::StatusChange { status } => {
                self.worker_status_change(worker, &status, &stimulus_id)
            }
            WorkerEvent::KeepAlive => Ok(()),
        };
        self.outbox.flush();
        result
    }

    fn worker_task_finished(
        &mut self,
        worker: WorkerId,
        key: &str,
        nbytes: u64,
        type_name: Option<String>,
        startstops: &[StartStop],
        stimulus_id: &StimulusId,
    ) -> Result<(), Error> {
        let Some(task) = self.graph.id_of(key) else {
            // The task is gone; the worker holds data nobody wants.
            self.outbox.worker(
                worker,
                WorkerMsg::FreeKeys {
                    keys: vec![key.to_owned()],
                    stimulus_id: stimulus_id.clone(),
                },
            );
            return Ok(());
        };

        match self.graph.task(task).state {
            TaskRunState::Processing if self.graph.task(task).processing_on == Some(worker) => {}
            TaskRunState::Memory => {
                // A concurrent completion (e.g. after a reschedule race):
                // just record the extra replica.
                self.add_replica(task, worker);
                return Ok(());
            }
            _ => {
                tracing::debug!(key, worker = %self.workers.worker(worker).address,
                    "stale task-finished ignored");
                return Ok(());
            }
        }

        let compute: f64 = startstops
            .iter()
            .filter(|interval| interval.action == "compute")
            .map(StartStop::duration)
            .sum();
        if compute > 0.0 {
            self.observe_duration(task, compute);
        }

        let mut recs = Recs::new();
        recs.push((
            task,
            Goal::Memory {
                worker,
                nbytes: Some(nbytes),
                type_name,
            },
        ));
        self.transitions(recs, stimulus_id)
    }

    /// Feeds an observed duration into the prefix EWMA and re-prices every
    /// still-assigned task that had been priced by a fallback.
    pub(crate) fn observe_duration(&mut self, task: TaskId, duration: f64) {
        let stale = self.durations.observe(&mut self.graph, task, duration);
        for other in stale {
            let Some(worker) = self.graph.task(other).processing_on else {
                continue;
            };
            let estimate = self.durations.estimate(&self.graph, other);
            if self.workers.get(worker).is_some() {
                let delta = self
                    .workers
                    .worker_mut(worker)
                    .reprice_processing(other, estimate);
                self.total_occupancy = (self.total_occupancy + delta).max(0.0);
            }
        }
    }

    fn worker_task_erred(
        &mut self,
        worker: WorkerId,
        key: &str,
        exception: String,
        traceback: Option<String>,
        stimulus_id: &StimulusId,
    ) -> Result<(), Error> {
        let Some(task) = self.graph.id_of(key) else {
            return Ok(());
        };
        if self.graph.task(task).processing_on != Some(worker) {
            return Ok(());
        }

        let mut recs = Recs::new();
        if self.graph.task(task).retries > 0 {
            self.graph.task_mut(task).retries -= 1;
            // The release path re-routes the task back through waiting or
            // processing, preferably on a different worker.
            recs.push((task, Goal::Released));
        } else {
            recs.push((
                task,
                Goal::Erred {
                    exception,
                    traceback,
                },
            ));
        }
        self.transitions(recs, stimulus_id)
    }

    fn worker_missing_data(
        &mut self,
        key: &str,
        errant_worker: &str,
        stimulus_id: &StimulusId,
    ) -> Result<(), Error> {
        let Some(task) = self.graph.id_of(key) else {
            return Ok(());
        };
        let Some(errant) = self.workers.id_of(errant_worker) else {
            return Ok(());
        };
        self.remove_replica(task, errant);

        let ts = self.graph.task(task);
        if ts.state == TaskRunState::Memory && ts.who_has.is_empty() {
            let mut recs = Recs::new();
            recs.push((task, Goal::Released));
            return self.transitions(recs, stimulus_id);
        }
        Ok(())
    }

    fn worker_reschedule(&mut self, key: &str, stimulus_id: &StimulusId) -> Result<(), Error> {
        let Some(task) = self.graph.id_of(key) else {
            return Ok(());
        };
        if self.graph.task(task).state != TaskRunState::Processing {
            return Ok(());
        }
        let mut recs = Recs::new();
        recs.push((task, Goal::Released));
        self.transitions(recs, stimulus_id)
    }

    fn worker_long_running(
        &mut self,
        worker: WorkerId,
        key: &str,
        compute_duration: f64,
    ) -> Result<(), Error> {
        let Some(task) = self.graph.id_of(key) else {
            return Ok(());
        };
        if self.graph.task(task).processing_on != Some(worker) {
            return Ok(());
        }
        if compute_duration > 0.0 {
            self.observe_duration(task, compute_duration);
        }
        // The task seceded from the thread pool: the slot is free again, so
        // its cost no longer counts towards the worker's occupancy.
        let ws = self.workers.worker_mut(worker);
        let delta = ws.reprice_processing(task, 0.0);
        let _ = ws.long_running.insert(task);
        self.total_occupancy = (self.total_occupancy + delta).max(0.0);
        Ok(())
    }

    fn worker_add_keys(
        &mut self,
        worker: WorkerId,
        keys: &[TaskKey],
        stimulus_id: &StimulusId,
    ) -> Result<(), Error> {
        let mut superfluous = Vec::new();
        for key in keys {
            match self.graph.id_of(key) {
                Some(task) if self.graph.task(task).state == TaskRunState::Memory => {
                    self.add_replica(task, worker);
                }
                _ => superfluous.push(key.clone()),
            }
        }
        if !superfluous.is_empty() {
            self.outbox.worker(
                worker,
                WorkerMsg::RemoveReplicas {
                    keys: superfluous,
                    stimulus_id: stimulus_id.clone(),
                },
            );
        }
        Ok(())
    }

    fn worker_release_data(
        &mut self,
        worker: WorkerId,
        keys: &[TaskKey],
        stimulus_id: &StimulusId,
    ) -> Result<(), Error> {
        let mut recs = Recs::new();
        for key in keys {
            let Some(task) = self.graph.id_of(key) else {
                continue;
            };
            self.remove_replica(task, worker);
            let ts = self.graph.task(task);
            if ts.state == TaskRunState::Memory && ts.who_has.is_empty() {
                recs.push((task, Goal::Released));
            }
        }
        self.transitions(recs, stimulus_id)
    }

    fn worker_status_change(
        &mut self,
        worker: WorkerId,
        status: &str,
        stimulus_id: &StimulusId,
    ) -> Result<(), Error> {
        let status = match status {
            "running" => WorkerStatus::Running,
            "paused" => WorkerStatus::Paused,
            "closing_gracefully" => WorkerStatus::ClosingGracefully,
            "closing" => WorkerStatus::Closing,
            other => {
                tracing::warn!(status = other, "unrecognized worker status ignored");
                return Ok(());
            }
        };
        let old = self.workers.set_status(worker, status);
        tracing::info!(worker = %self.workers.worker(worker).address, %old, new = %status,
            "worker status change");
        if status == WorkerStatus::Running {
            return self.wake_unrunnable(stimulus_id);
        }
        Ok(())
    }

    /// Retries placement for every task parked in `no-worker`.
    pub(crate) fn wake_unrunnable(&mut self, stimulus_id: &StimulusId) -> Result<(), Error> {
        let mut parked: Vec<TaskId> = self.unrunnable.iter().copied().collect();
        parked.sort_by(|a, b| {
            let (ta, tb) = (self.graph.task(*a), self.graph.task(*b));
            ta.priority.cmp(&tb.priority).then(ta.key.cmp(&tb.key))
        });
        let mut recs = Recs::new();
        for task in parked {
            recs.push((task, Goal::Processing));
        }
        self.transitions(recs, stimulus_id)
    }

    /// Registers a worker, wiring up its ordered stream.
    ///
    /// Rejections leave every store untouched: a name collision, or
    /// announced keys the scheduler did not ask the worker to hold
    /// (announced keys for tasks known to be in memory are accepted and
    /// recorded as extra replicas).
    pub fn register_worker(
        &mut self,
        registration: WorkerRegistration,
        keys_in_memory: Vec<(TaskKey, u64)>,
        stream: mpsc::UnboundedSender<WorkerMsg>,
    ) -> Result<WorkerId, Error> {
        self.ensure_accepting()?;
        let address = registration.address.clone();

        let mut replicas: Vec<(TaskId, u64)> = Vec::with_capacity(keys_in_memory.len());
        let mut unexpected = 0usize;
        for (key, nbytes) in &keys_in_memory {
            match self.graph.id_of(key) {
                Some(task) if self.graph.task(task).state == TaskRunState::Memory => {
                    replicas.push((task, *nbytes));
                }
                _ => unexpected += 1,
            }
        }
        if unexpected > 0 {
            tracing::warn!(worker = %address, count = unexpected,
                "worker connected with {unexpected} key(s) in memory the scheduler never asked for");
            return Err(Error::UnexpectedData {
                address,
                count: unexpected,
            });
        }

        let worker = self.workers.add_worker(registration, Instant::now())?;
        self.outbox.connect_worker(worker, stream);
        for (task, _nbytes) in replicas {
            self.add_replica(task, worker);
        }
        self.clients.log_event(
            "all",
            serde_json::json!({ "action": "add-worker", "worker": address }),
        );
        for plugin in self.plugins.values_mut() {
            plugin.add_worker(&address);
        }
        if let Some(restart) = &mut self.pending_restart {
            restart.returned += 1;
        }

        let stimulus_id = StimulusId::new("register-worker");
        self.wake_unrunnable(&stimulus_id)?;
        self.outbox.flush();
        Ok(worker)
    }

    /// Removes a worker, rerouting everything it was doing or holding.
    /// Idempotent: removing an unknown address reports `AlreadyRemoved`.
    pub fn remove_worker(&mut self, address: &str, stimulus_id: &StimulusId) -> Result<RemoveWorkerResult, Error> {
        self.ensure_accepting()?;
        let worker = self.workers.id_of(address);
        let removed = self.workers.remove_worker(address);
        let RemoveWorkerResult::Removed(state) = removed else {
            return Ok(RemoveWorkerResult::AlreadyRemoved);
        };
        let worker = worker.expect("removal succeeded, so the id resolved");
        self.outbox.disconnect_worker(worker);
        // The worker's assigned costs vanish with it.
        self.total_occupancy = (self.total_occupancy - state.occupancy).max(0.0);

        let allowed_failures = self.config.allowed_failures;
        let mut recs = Recs::new();

        let mut processing: Vec<TaskId> = state.processing.keys().copied().collect();
        processing.sort_by(|a, b| self.graph.task(*a).key.cmp(&self.graph.task(*b).key));
        for task in processing {
            {
                let ts = self.graph.task_mut(task);
                ts.suspicious += 1;
            }
            let prefix = self.graph.task(task).prefix;
            self.graph.prefix_mut(prefix).suspicious += 1;
            if self.graph.task(task).suspicious >= allowed_failures {
                let key = self.graph.task(task).key.clone();
                recs.push((
                    task,
                    Goal::Erred {
                        exception: format!(
                            "KilledWorker: task {key} appears to have killed worker {address} \
                             {allowed_failures} time(s)"
                        ),
                        traceback: None,
                    },
                ));
            } else {
                recs.push((task, Goal::Waiting));
            }
        }

        let mut held: Vec<TaskId> = state.has_what.iter().copied().collect();
        held.sort_by(|a, b| self.graph.task(*a).key.cmp(&self.graph.task(*b).key));
        for task in held {
            self.remove_replica(task, worker);
            let ts = self.graph.task(task);
            if ts.state == TaskRunState::Memory && ts.who_has.is_empty() {
                recs.push((task, Goal::Released));
            }
        }

        self.clients.log_event(
            "all",
            serde_json::json!({ "action": "remove-worker", "worker": address }),
        );
        for plugin in self.plugins.values_mut() {
            plugin.remove_worker(address, stimulus_id);
        }
        self.transitions(recs, stimulus_id)?;
        self.outbox.flush();
        Ok(RemoveWorkerResult::Removed(state))
    }

    /// Ingests a heartbeat. Unknown workers are told to re-register.
    pub fn handle_heartbeat(&mut self, address: &str, metrics: HeartbeatMetrics) -> HeartbeatReply {
        let Some(worker) = self.workers.id_of(address) else {
            return HeartbeatReply::Missing;
        };
        let ws = self.workers.worker_mut(worker);
        ws.last_seen = Instant::now();
        ws.memory = MemoryState::new(
            metrics.process,
            metrics.unmanaged_old,
            metrics.managed_in_memory,
            metrics.managed_spilled,
        );
        HeartbeatReply::Ok
    }

    /// Removes every worker that exceeded the liveness TTL.
    pub fn sweep_worker_ttl(&mut self, now: Instant) -> Result<(), Error> {
        let Some(ttl) = self.config.worker_ttl else {
            return Ok(());
        };
        for address in self.workers.stale_workers(now, ttl) {
            tracing::warn!(worker = %address, "no heartbeat within {ttl:?}; removing worker");
            let stimulus_id = StimulusId::new("worker-ttl-timeout");
            let _ = self.remove_worker(&address, &stimulus_id)?;
        }
        Ok(())
    }

    // --- client operations ---------------------------------------------

    /// Registers a client and wires up its report stream.
    pub fn add_client(
        &mut self,
        client: &str,
        versions: serde_json::Value,
        stream: mpsc::UnboundedSender<ClientMsg>,
    ) {
        self.clients.add_client(client, versions, Instant::now());
        self.outbox.connect_client(client, stream);
    }

    /// Disconnects a client, dropping its interest in every key. The
    /// client's event log survives until the cleanup delay expires.
    pub fn remove_client(&mut self, client: &str) -> Result<(), Error> {
        self.ensure_accepting()?;
        let deadline = Instant::now() + self.config.events_cleanup_delay;
        let released = self.clients.remove_client(client, deadline);
        self.outbox.disconnect_client(client);

        let stimulus_id = StimulusId::new("remove-client");
        let mut recs = Recs::new();
        for task in released {
            let _ = self.graph.task_mut(task).who_wants.remove(client);
            self.push_release_if_unneeded(task, &mut recs);
        }
        self.transitions(recs, &stimulus_id)?;
        self.outbox.flush();
        Ok(())
    }

    pub(crate) fn push_release_if_unneeded(&self, task: TaskId, recs: &mut Recs) {
        if self.needed(task) {
            return;
        }
        match self.graph.task(task).state {
            TaskRunState::Memory | TaskRunState::Processing | TaskRunState::Erred => {
                recs.push((task, Goal::Released));
            }
            TaskRunState::Waiting | TaskRunState::NoWorker => {
                recs.push((task, Goal::Released));
            }
            TaskRunState::Released => {
                if self.forgettable(task) {
                    recs.push((task, Goal::Forgotten));
                }
            }
            TaskRunState::Forgotten => {}
        }
    }

    /// Ingests a graph update: materializes the tasks, records the
    /// client's interest and schedules whatever became ready.
    pub fn update_graph(&mut self, client: &str, update: GraphUpdate) -> Result<(), Error> {
        self.ensure_accepting()?;
        let stimulus_id = StimulusId::new("update-graph");
        self.generation += 1;
        let generation = self.generation;

        let mut submitted: Vec<TaskId> = Vec::with_capacity(update.tasks.len());
        for (order, spec) in update.tasks.into_iter().enumerate() {
            let task = self.graph.new_task(&spec.key, spec.run_spec, &spec.dependencies);
            let ts = self.graph.task_mut(task);
            ts.priority = Priority {
                user: -spec.priority,
                generation,
                order: order as i64,
            };
            ts.retries = ts.retries.max(spec.retries);
            if let Some(workers) = spec.worker_restrictions {
                ts.worker_restrictions = Some(workers.into_iter().collect());
            }
            if let Some(hosts) = spec.host_restrictions {
                ts.host_restrictions = Some(hosts.into_iter().collect());
            }
            if let Some(resources) = spec.resource_restrictions {
                ts.resource_restrictions = Some(resources);
            }
            ts.loose_restrictions |= spec.loose_restrictions;
            ts.annotations.extend(spec.annotations);
            submitted.push(task);
        }

        // Cull the parts of the submission nothing reaches, then record
        // the client's interest in the surviving keys.
        let mut roots: HashSet<TaskId> = update
            .keys
            .iter()
            .filter_map(|key| self.graph.id_of(key))
            .collect();
        for (task, ts) in self.graph.iter() {
            if !ts.who_wants.is_empty() || ts.state != TaskRunState::Released {
                let _ = roots.insert(task);
            }
        }
        let _ = self.graph.cull(roots, |_| false);

        for key in &update.keys {
            let Some(task) = self.graph.id_of(key) else {
                continue;
            };
            let _ = self.graph.task_mut(task).who_wants.insert(client.to_owned());
            let _ = self.clients.want(client, task);

            // Keys that are already done get reported right away.
            match self.graph.task(task).state {
                TaskRunState::Memory => {
                    let type_name = self.graph.task(task).type_name.clone();
                    self.outbox.client(
                        client,
                        ClientMsg::KeyInMemory {
                            key: key.clone(),
                            type_name,
                        },
                    );
                }
                TaskRunState::Erred => {
                    if let Some(info) = self.graph.task(task).erred.clone() {
                        self.outbox.client(
                            client,
                            ClientMsg::TaskErred {
                                key: key.clone(),
                                exception: info.exception,
                                traceback: info.traceback,
                            },
                        );
                    }
                }
                _ => {}
            }
        }

        let mut recs = Recs::new();
        for task in submitted {
            if self.graph.get(task).is_none() {
                continue; // culled
            }
            if self.graph.task(task).state == TaskRunState::Released {
                if self.deps_in_memory(task) {
                    recs.push((task, Goal::Processing));
                } else {
                    recs.push((task, Goal::Waiting));
                }
            }
        }
        self.transitions(recs, &stimulus_id)?;
        self.outbox.flush();
        Ok(())
    }

    /// Drops a client's interest in the given keys; unneeded tasks become
    /// releasable immediately.
    pub fn release_keys(&mut self, client: &str, keys: &[TaskKey]) -> Result<(), Error> {
        self.ensure_accepting()?;
        let stimulus_id = StimulusId::new("release-keys");
        let mut recs = Recs::new();
        for key in keys {
            let Some(task) = self.graph.id_of(key) else {
                continue;
            };
            let _ = self.graph.task_mut(task).who_wants.remove(client);
            self.clients.unwant(client, task);
            self.push_release_if_unneeded(task, &mut recs);
        }
        self.transitions(recs, &stimulus_id)?;
        self.outbox.flush();
        Ok(())
    }

    /// Cancels keys. With `force`, every client's interest is dropped;
    /// otherwise only keys nobody else wants are actually released.
    pub fn cancel_keys(&mut self, keys: &[TaskKey], force: bool) -> Result<(), Error> {
        self.ensure_accepting()?;
        let stimulus_id = StimulusId::new("cancel-key");
        let mut cancelled = Vec::new();
        let mut recs = Recs::new();
        for key in keys {
            let Some(task) = self.graph.id_of(key) else {
                continue;
            };
            let holders: Vec<String> = self.graph.task(task).who_wants.iter().cloned().collect();
            if !force && holders.len() > 1 {
                continue;
            }
            for client in holders {
                let _ = self.graph.task_mut(task).who_wants.remove(&client);
                self.clients.unwant(&client, task);
                self.outbox.client(
                    &client,
                    ClientMsg::CancelledKeys {
                        keys: vec![key.clone()],
                    },
                );
            }
            cancelled.push(key.clone());
            self.push_release_if_unneeded(task, &mut recs);
        }
        if !cancelled.is_empty() {
            tracing::info!(?cancelled, "cancelled keys");
        }
        self.transitions(recs, &stimulus_id)?;
        self.outbox.flush();
        Ok(())
    }

    /// Replaces the worker restrictions of existing tasks.
    pub fn set_restrictions(
        &mut self,
        worker: HashMap<TaskKey, Option<Vec<String>>>,
    ) -> Result<(), Error> {
        self.ensure_accepting()?;
        for (key, restriction) in worker {
            let Some(task) = self.graph.id_of(&key) else {
                return Err(Error::UnknownTask { key });
            };
            self.graph.task_mut(task).worker_restrictions =
                restriction.map(|addresses| addresses.into_iter().collect());
        }
        Ok(())
    }

    /// Places client data directly into cluster memory and registers the
    /// client's interest in the created keys.
    pub async fn scatter(
        &mut self,
        client: &str,
        data: Vec<(TaskKey, Bytes)>,
        workers: Option<Vec<String>>,
        broadcast: bool,
        timeout: Duration,
    ) -> Result<Vec<TaskKey>, Error> {
        self.ensure_accepting()?;
        let stimulus_id = StimulusId::new("scatter");

        let targets: Vec<WorkerId> = match &workers {
            Some(addresses) => {
                let mut resolved = Vec::with_capacity(addresses.len());
                for address in addresses {
                    let id = self
                        .workers
                        .resolve(address)
                        .ok_or_else(|| Error::UnknownWorker {
                            address: address.clone(),
                        })?;
                    resolved.push(id);
                }
                resolved
            }
            None => {
                let mut running: Vec<WorkerId> = self.workers.running().collect();
                running.sort_by(|a, b| {
                    self.workers
                        .worker(*a)
                        .address
                        .cmp(&self.workers.worker(*b).address)
                });
                running
            }
        };
        if targets.is_empty() {
            return Err(Error::NoWorkers);
        }

        // Partition the payloads over the targets (or replicate them all
        // when broadcasting).
        let mut shares: HashMap<WorkerId, Vec<(TaskKey, Bytes)>> = HashMap::new();
        for (index, (key, payload)) in data.iter().enumerate() {
            if broadcast {
                for target in &targets {
                    shares
                        .entry(*target)
                        .or_default()
                        .push((key.clone(), payload.clone()));
                }
            } else {
                let target = targets[index % targets.len()];
                shares
                    .entry(target)
                    .or_default()
                    .push((key.clone(), payload.clone()));
            }
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let rpc = self.rpc.clone();
        let mut recs = Recs::new();
        for (target, share) in shares {
            let address = self.workers.worker(target).address.clone();
            let stored = tokio::time::timeout_at(deadline, rpc.scatter(&address, share))
                .await
                .map_err(|_| Error::Timeout {
                    operation: "scatter".to_owned(),
                    seconds: timeout.as_secs_f64(),
                })?
                .map_err(|error| {
                    tracing::warn!(worker = %address, %error, "scatter to worker failed");
                    Error::NoWorkers
                })?;
            for (key, nbytes) in stored {
                let task = self.graph.new_task(&key, None, &[]);
                let _ = self.graph.task_mut(task).who_wants.insert(client.to_owned());
                let _ = self.clients.want(client, task);
                if self.graph.task(task).state == TaskRunState::Released {
                    recs.push((
                        task,
                        Goal::Memory {
                            worker: target,
                            nbytes: Some(nbytes),
                            type_name: None,
                        },
                    ));
                } else {
                    self.add_replica(task, target);
                }
            }
        }
        self.transitions(recs, &stimulus_id)?;
        self.outbox.flush();
        Ok(data.into_iter().map(|(key, _)| key).collect())
    }

    /// Collects result payloads for the client, trying every replica of a
    /// key before giving up on it.
    pub async fn gather(&mut self, keys: Vec<TaskKey>) -> Result<GatherResponse, Error> {
        self.ensure_accepting()?;
        let rpc = self.rpc.clone();
        let mut data = HashMap::new();
        let mut failed = Vec::new();

        for key in keys {
            let holders: Vec<String> = self
                .graph
                .id_of(&key)
                .map(|task| {
                    let mut addresses: Vec<String> = self
                        .graph
                        .task(task)
                        .who_has
                        .iter()
                        .filter_map(|id| self.workers.get(*id).map(|ws| ws.address.clone()))
                        .collect();
                    addresses.sort();
                    addresses
                })
                .unwrap_or_default();
            if holders.is_empty() {
                failed.push(key);
                continue;
            }

            let mut found = false;
            for address in holders {
                match rpc.fetch(&address, vec![key.clone()]).await {
                    Ok(mut payloads) => {
                        if let Some(payload) = payloads.remove(&key) {
                            let _ = data.insert(key.clone(), payload);
                            found = true;
                            break;
                        }
                    }
                    Err(error) => {
                        tracing::warn!(worker = %address, key, %error, "gather from worker failed");
                    }
                }
            }
            if !found {
                failed.push(key);
            }
        }

        if failed.is_empty() {
            Ok(GatherResponse::Ok { data })
        } else {
            Ok(GatherResponse::Error { keys: failed })
        }
    }

    /// Runs an opaque callable on the scheduler process, if both the
    /// pickle gate and an executor allow it.
    pub fn run_on_scheduler(&mut self, payload: Bytes) -> Result<serde_json::Value, Error> {
        self.ensure_accepting()?;
        if !self.config.pickle {
            return Err(Error::PickleDisabled);
        }
        match &mut self.executor {
            Some(executor) => Ok(executor(payload)),
            None => Err(Error::ExecutorUnavailable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{GraphUpdate, TaskSpec};
    use crate::testing::TestCluster;
    use gridflow_config::SchedulerConfig;
    use pretty_assertions::assert_eq;

    const A: &str = "tcp://10.0.0.1:1";
    const B: &str = "tcp://10.0.0.2:1";

    fn many_tasks(n: usize) -> GraphUpdate {
        let tasks: Vec<TaskSpec> = (0..n)
            .map(|i| TaskSpec {
                key: format!("inc-{i}"),
                run_spec: Some(Bytes::from_static(b"f")),
                ..TaskSpec::default()
            })
            .collect();
        let keys = tasks.iter().map(|t| t.key.clone()).collect();
        GraphUpdate { tasks, keys }
    }

    fn connected_client(cluster: &mut TestCluster, id: &str) {
        let (tx, _rx) = mpsc::unbounded_channel();
        cluster.scheduler.add_client(id, serde_json::Value::Null, tx);
    }

    /// Losing a worker mid-compute re-routes everything to the survivor
    /// and errs nothing.
    #[test]
    fn worker_loss_reroutes_all_processing_tasks() {
        let mut cluster = TestCluster::new(SchedulerConfig::default());
        let _ = cluster.add_worker(A, 1).expect("ok");
        let b = cluster.add_worker(B, 1).expect("ok");
        connected_client(&mut cluster, "c1");
        cluster
            .scheduler
            .update_graph("c1", many_tasks(20))
            .expect("submitted");

        let stimulus_id = StimulusId::new("test-remove");
        let removed = cluster
            .scheduler
            .remove_worker(A, &stimulus_id)
            .expect("removal runs");
        assert!(matches!(removed, RemoveWorkerResult::Removed(_)));

        assert_eq!(cluster.scheduler.workers().len(), 1);
        let processing = cluster.scheduler.workers().worker(b).processing.len();
        assert_eq!(processing, 20);
        for (_, ts) in cluster.scheduler.graph().iter() {
            assert_eq!(ts.state, TaskRunState::Processing);
            assert!(ts.suspicious <= 1);
        }
        cluster.scheduler.validate_state().expect("invariants hold");

        // A second removal of the same address is a no-op.
        assert!(matches!(
            cluster.scheduler.remove_worker(A, &stimulus_id).expect("ok"),
            RemoveWorkerResult::AlreadyRemoved
        ));
    }

    /// A task whose workers keep dying is eventually marked erred with a
    /// killed-worker failure.
    #[test]
    fn repeated_worker_deaths_err_the_task() {
        let config = SchedulerConfig {
            allowed_failures: 2,
            ..SchedulerConfig::default()
        };
        let mut cluster = TestCluster::new(config);
        connected_client(&mut cluster, "c1");
        let _ = cluster.add_worker(A, 1).expect("ok");
        cluster
            .scheduler
            .update_graph("c1", many_tasks(1))
            .expect("submitted");

        for round in 0..2 {
            let address = format!("tcp://10.0.1.{round}:1");
            // The task lands on the only running worker, which then dies.
            let victim = cluster
                .scheduler
                .graph()
                .iter()
                .next()
                .and_then(|(_, ts)| ts.processing_on)
                .map(|id| cluster.scheduler.workers().worker(id).address.clone())
                .expect("task is processing somewhere");
            let _ = cluster.add_worker(&address, 1).expect("ok");
            let stimulus_id = StimulusId::new("test-kill");
            let _ = cluster
                .scheduler
                .remove_worker(&victim, &stimulus_id)
                .expect("removal runs");
        }

        let graph = cluster.scheduler.graph();
        let id = graph.id_of("inc-0").expect("exists");
        assert_eq!(graph.task(id).state, TaskRunState::Erred);
        let info = graph.task(id).erred.as_ref().expect("erred info");
        assert!(info.exception.contains("KilledWorker"));
        assert_eq!(graph.task(id).suspicious, 2);
    }

    #[test]
    fn registering_with_unknown_keys_is_rejected() {
        let mut cluster = TestCluster::new(SchedulerConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = cluster
            .scheduler
            .register_worker(
                WorkerRegistration {
                    address: A.to_owned(),
                    name: None,
                    nthreads: 1,
                    resources: HashMap::new(),
                    memory_limit: 0,
                    versions: serde_json::Value::Null,
                },
                vec![("stowaway-1".to_owned(), 100)],
                tx,
            )
            .expect_err("must be rejected");
        assert!(matches!(err, Error::UnexpectedData { count: 1, .. }));
        assert!(cluster.scheduler.workers().is_empty());
    }

    #[test]
    fn registering_with_known_memory_keys_adds_replicas() {
        let mut cluster = TestCluster::new(SchedulerConfig::default());
        let _ = cluster.add_worker(A, 1).expect("ok");
        connected_client(&mut cluster, "c1");
        cluster
            .scheduler
            .update_graph("c1", many_tasks(1))
            .expect("submitted");
        cluster.finish_task(A, "inc-0", 8).expect("ok");

        let (tx, _rx) = mpsc::unbounded_channel();
        let b = cluster
            .scheduler
            .register_worker(
                WorkerRegistration {
                    address: B.to_owned(),
                    name: None,
                    nthreads: 1,
                    resources: HashMap::new(),
                    memory_limit: 0,
                    versions: serde_json::Value::Null,
                },
                vec![("inc-0".to_owned(), 8)],
                tx,
            )
            .expect("accepted");
        let graph = cluster.scheduler.graph();
        let id = graph.id_of("inc-0").expect("exists");
        assert_eq!(graph.task(id).who_has.len(), 2);
        assert!(graph.task(id).who_has.contains(&b));
        cluster.scheduler.validate_state().expect("invariants hold");
    }

    #[test]
    fn heartbeats_from_unknown_workers_ask_for_reregistration() {
        let mut cluster = TestCluster::new(SchedulerConfig::default());
        assert_eq!(
            cluster
                .scheduler
                .handle_heartbeat(A, HeartbeatMetrics::default()),
            HeartbeatReply::Missing
        );
        let _ = cluster.add_worker(A, 1).expect("ok");
        let metrics = HeartbeatMetrics {
            process: 100,
            unmanaged_old: 15,
            managed_in_memory: 68,
            managed_spilled: 12,
        };
        assert_eq!(
            cluster.scheduler.handle_heartbeat(A, metrics),
            HeartbeatReply::Ok
        );
        let id = cluster.scheduler.workers().id_of(A).expect("known");
        assert_eq!(cluster.scheduler.workers().worker(id).memory.managed(), 80);

        // Cluster memory is the field-wise sum across live workers.
        let _ = cluster.add_worker(B, 1).expect("ok");
        let _ = cluster.scheduler.handle_heartbeat(
            B,
            HeartbeatMetrics {
                process: 80,
                unmanaged_old: 10,
                managed_in_memory: 58,
                managed_spilled: 2,
            },
        );
        let total = cluster.scheduler.memory();
        assert_eq!(total.process(), 180);
        assert_eq!(total.managed(), 140);
        assert_eq!(total.unmanaged_old(), 25);
    }

    /// Tasks stuck in `no-worker` get placed once capacity appears.
    #[test]
    fn restricted_tasks_wait_for_their_worker() {
        let mut cluster = TestCluster::new(SchedulerConfig::default());
        let _ = cluster.add_worker(A, 1).expect("ok");
        connected_client(&mut cluster, "c1");
        let update = GraphUpdate {
            tasks: vec![TaskSpec {
                key: "pin-1".to_owned(),
                run_spec: Some(Bytes::from_static(b"f")),
                worker_restrictions: Some(vec![B.to_owned()]),
                ..TaskSpec::default()
            }],
            keys: vec!["pin-1".to_owned()],
        };
        cluster.scheduler.update_graph("c1", update).expect("submitted");

        let id = cluster.scheduler.graph().id_of("pin-1").expect("exists");
        assert_eq!(
            cluster.scheduler.graph().task(id).state,
            TaskRunState::NoWorker
        );
        cluster.scheduler.validate_state().expect("invariants hold");

        let b = cluster.add_worker(B, 1).expect("ok");
        assert_eq!(
            cluster.scheduler.graph().task(id).state,
            TaskRunState::Processing
        );
        assert_eq!(cluster.scheduler.graph().task(id).processing_on, Some(b));
    }

    /// A vanished last replica of a computable task triggers a transparent
    /// recompute.
    #[test]
    fn missing_data_recomputes_from_the_run_spec() {
        let mut cluster = TestCluster::new(SchedulerConfig::default());
        let _ = cluster.add_worker(A, 1).expect("ok");
        connected_client(&mut cluster, "c1");
        cluster
            .scheduler
            .update_graph("c1", many_tasks(1))
            .expect("submitted");
        cluster.finish_task(A, "inc-0", 8).expect("ok");

        cluster
            .scheduler
            .handle_worker_event(
                B,
                WorkerEvent::MissingData {
                    key: "inc-0".to_owned(),
                    errant_worker: A.to_owned(),
                },
            )
            .expect("event from unknown worker is dropped");
        // The event must come from a live worker to count.
        let _ = cluster.add_worker(B, 1).expect("ok");
        cluster
            .scheduler
            .handle_worker_event(
                B,
                WorkerEvent::MissingData {
                    key: "inc-0".to_owned(),
                    errant_worker: A.to_owned(),
                },
            )
            .expect("handled");

        let graph = cluster.scheduler.graph();
        let id = graph.id_of("inc-0").expect("exists");
        assert_eq!(graph.task(id).state, TaskRunState::Processing);
        cluster.scheduler.validate_state().expect("invariants hold");
    }

    #[test]
    fn long_running_tasks_leave_occupancy() {
        let config = SchedulerConfig {
            unknown_task_duration: Duration::from_secs(2),
            ..SchedulerConfig::default()
        };
        let mut cluster = TestCluster::new(config);
        let a = cluster.add_worker(A, 1).expect("ok");
        connected_client(&mut cluster, "c1");
        cluster
            .scheduler
            .update_graph("c1", many_tasks(1))
            .expect("submitted");
        assert!(cluster.scheduler.total_occupancy() > 1.9);

        cluster
            .scheduler
            .handle_worker_event(
                A,
                WorkerEvent::LongRunning {
                    key: "inc-0".to_owned(),
                    compute_duration: 1.0,
                },
            )
            .expect("handled");
        assert!(cluster.scheduler.workers().worker(a).occupancy < 1e-9);
        assert!(cluster.scheduler.total_occupancy() < 1e-9);
    }

    #[tokio::test]
    async fn scatter_then_gather_round_trips() {
        let mut cluster = TestCluster::new(SchedulerConfig::default());
        let _ = cluster.add_worker(A, 1).expect("ok");
        let _ = cluster.add_worker(B, 1).expect("ok");
        connected_client(&mut cluster, "c1");

        let payloads = vec![
            ("x-1".to_owned(), Bytes::from_static(b"one")),
            ("x-2".to_owned(), Bytes::from_static(b"two")),
            ("x-3".to_owned(), Bytes::from_static(b"three")),
        ];
        let keys = cluster
            .scheduler
            .scatter("c1", payloads.clone(), None, false, Duration::from_secs(5))
            .await
            .expect("scattered");
        assert_eq!(keys.len(), 3);
        for key in &keys {
            let id = cluster.scheduler.graph().id_of(key).expect("exists");
            assert_eq!(cluster.scheduler.graph().task(id).state, TaskRunState::Memory);
            assert!(cluster.scheduler.graph().task(id).run_spec.is_none());
        }
        cluster.scheduler.validate_state().expect("invariants hold");

        match cluster
            .scheduler
            .gather(keys)
            .await
            .expect("gather runs")
        {
            GatherResponse::Ok { data } => {
                for (key, payload) in payloads {
                    assert_eq!(data.get(&key), Some(&payload));
                }
            }
            GatherResponse::Error { keys } => panic!("gather failed for {keys:?}"),
        }
    }

    #[tokio::test]
    async fn scatter_with_no_workers_fails() {
        let mut cluster = TestCluster::new(SchedulerConfig::default());
        connected_client(&mut cluster, "c1");
        let err = cluster
            .scheduler
            .scatter(
                "c1",
                vec![("x-1".to_owned(), Bytes::from_static(b"one"))],
                None,
                false,
                Duration::from_millis(50),
            )
            .await
            .expect_err("no workers to scatter to");
        assert!(matches!(err, Error::NoWorkers));
    }

    #[test]
    fn run_on_scheduler_respects_the_pickle_gate() {
        let config = SchedulerConfig {
            pickle: false,
            ..SchedulerConfig::default()
        };
        let mut cluster = TestCluster::new(config);
        let err = cluster
            .scheduler
            .run_on_scheduler(Bytes::from_static(b"payload"))
            .expect_err("pickle disabled");
        assert!(matches!(err, Error::PickleDisabled));

        let mut cluster = TestCluster::new(SchedulerConfig::default());
        cluster
            .scheduler
            .set_executor(Box::new(|payload| {
                serde_json::json!({ "len": payload.len() })
            }));
        let out = cluster
            .scheduler
            .run_on_scheduler(Bytes::from_static(b"payload"))
            .expect("runs");
        assert_eq!(out, serde_json::json!({ "len": 7 }));
    }
}
