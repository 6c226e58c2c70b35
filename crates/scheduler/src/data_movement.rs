// SPDX-License-Identifier: Apache-2.0

//! Data movement across workers: targeted replica transfers, replica
//! deletion, cluster-wide rebalancing and graceful worker retirement.
//!
//! All bulk transfers go through `gather_on_worker`: the recipient pulls
//! each key from the first live holder that can serve it. Replica
//! bookkeeping is only updated after the recipient confirms, so a failed
//! transfer never corrupts `who_has`/`has_what`.

use crate::control::{RebalanceResponse, RetiredWorker, StimulusId, WorkerMsg};
use crate::error::Error;
use crate::scheduler::Scheduler;
use crate::task::{TaskId, TaskKey, TaskRunState};
use crate::transition::{Goal, Recs};
use crate::worker::{RemoveWorkerResult, WorkerId, WorkerState, WorkerStatus};
use gridflow_config::Address;
use std::collections::{HashMap, HashSet};

/// A planned replica move.
#[derive(Debug)]
struct Move {
    task: TaskId,
    key: TaskKey,
    sender: WorkerId,
    recipient: WorkerId,
    nbytes: u64,
}

impl Scheduler {
    /// Instructs `recipient` to pull each key from the first live sender
    /// that can serve it. Returns the keys that could not be delivered; an
    /// unknown or dead recipient fails every key.
    pub async fn gather_on_worker(
        &mut self,
        recipient: &str,
        who_has: HashMap<TaskKey, Vec<Address>>,
    ) -> HashSet<TaskKey> {
        let Some(recipient_id) = self.workers.id_of(recipient) else {
            return who_has.into_keys().collect();
        };
        let rpc = self.rpc.clone();
        let address = self.workers.worker(recipient_id).address.clone();

        let outcome = match rpc.gather(&address, who_has.clone()).await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::warn!(worker = %address, %error, "gather_on_worker failed entirely");
                return who_has.into_keys().collect();
            }
        };

        let failed: HashSet<TaskKey> = outcome.keys_failed.into_iter().collect();
        for key in who_has.into_keys() {
            if failed.contains(&key) {
                continue;
            }
            match self.graph.id_of(&key) {
                Some(task) if self.graph.task(task).state == TaskRunState::Memory => {
                    // Idempotent: a concurrent duplicate delivery does not
                    // double-count nbytes.
                    self.add_replica(task, recipient_id);
                }
                _ => {
                    // The task vanished while the transfer was in flight;
                    // the recipient holds data nobody tracks.
                    let stimulus_id = StimulusId::new("gather-on-worker-stale");
                    self.outbox.worker(
                        recipient_id,
                        WorkerMsg::FreeKeys {
                            keys: vec![key],
                            stimulus_id,
                        },
                    );
                }
            }
        }
        self.outbox.flush();
        failed
    }

    /// Idempotently removes replicas from a worker. Unknown keys are
    /// silently ignored; keys orphaned by the removal run through the
    /// normal release/forget path.
    pub fn delete_worker_data(&mut self, worker: &str, keys: &[TaskKey]) -> Result<(), Error> {
        let Some(worker_id) = self.workers.id_of(worker) else {
            return Err(Error::UnknownWorker {
                address: worker.to_owned(),
            });
        };
        let stimulus_id = StimulusId::new("delete-worker-data");
        self.outbox.worker(
            worker_id,
            WorkerMsg::FreeKeys {
                keys: keys.to_vec(),
                stimulus_id: stimulus_id.clone(),
            },
        );

        let mut recs = Recs::new();
        let mut seen = HashSet::new();
        for key in keys {
            let Some(task) = self.graph.id_of(key) else {
                continue;
            };
            if !seen.insert(task) {
                continue;
            }
            self.remove_replica(task, worker_id);
            let ts = self.graph.task(task);
            if ts.state == TaskRunState::Memory && ts.who_has.is_empty() {
                recs.push((task, Goal::Released));
            }
        }
        self.transitions(recs, &stimulus_id)?;
        self.outbox.flush();
        Ok(())
    }

    /// Ensures each key has at least `n` replicas, copying onto the
    /// emptiest running workers first. Returns the keys that could not be
    /// replicated far enough.
    pub async fn replicate(&mut self, keys: &[TaskKey], n: usize) -> HashSet<TaskKey> {
        let mut failed = HashSet::new();
        for key in keys {
            let Some(task) = self.graph.id_of(key) else {
                let _ = failed.insert(key.clone());
                continue;
            };
            if self.graph.task(task).state != TaskRunState::Memory {
                let _ = failed.insert(key.clone());
                continue;
            }

            loop {
                let ts = self.graph.task(task);
                if ts.who_has.len() >= n {
                    break;
                }
                let holders: Vec<Address> = ts
                    .who_has
                    .iter()
                    .filter_map(|id| self.workers.get(*id).map(|ws| ws.address.clone()))
                    .collect();
                let nbytes = self.graph.task(task).nbytes_or_zero();
                let mut candidates: Vec<WorkerId> = self
                    .workers
                    .running()
                    .filter(|id| !self.graph.task(task).who_has.contains(id))
                    .filter(|id| {
                        // Headroom: never push a worker over its limit.
                        let ws = self.workers.worker(*id);
                        ws.memory_limit == 0
                            || ws.memory.optimistic() + nbytes <= ws.memory_limit
                    })
                    .collect();
                candidates.sort_by(|a, b| {
                    let (wa, wb) = (self.workers.worker(*a), self.workers.worker(*b));
                    wa.nbytes.cmp(&wb.nbytes).then(wa.address.cmp(&wb.address))
                });
                let Some(recipient) = candidates.first().copied() else {
                    let _ = failed.insert(key.clone());
                    break;
                };
                let recipient_address = self.workers.worker(recipient).address.clone();
                let transfer: HashMap<TaskKey, Vec<Address>> =
                    [(key.clone(), holders)].into_iter().collect();
                let before = self.graph.task(task).who_has.len();
                let undelivered = self.gather_on_worker(&recipient_address, transfer).await;
                if !undelivered.is_empty() || self.graph.task(task).who_has.len() <= before {
                    let _ = failed.insert(key.clone());
                    break;
                }
            }
        }
        failed
    }

    /// Evens out memory across workers by moving the least recently
    /// inserted keys from loaded senders to empty recipients.
    pub async fn rebalance(
        &mut self,
        keys: Option<Vec<TaskKey>>,
        workers: Option<Vec<String>>,
    ) -> Result<RebalanceResponse, Error> {
        self.ensure_accepting()?;

        let participants: Vec<WorkerId> = match &workers {
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
            None => self.workers.running().collect(),
        };

        let key_filter: Option<HashSet<TaskId>> = match &keys {
            Some(wanted) => {
                let mut missing = Vec::new();
                let mut resolved = HashSet::new();
                for key in wanted {
                    match self.graph.id_of(key) {
                        Some(task) if self.graph.task(task).state == TaskRunState::Memory => {
                            let _ = resolved.insert(task);
                        }
                        _ => missing.push(key.clone()),
                    }
                }
                if !missing.is_empty() {
                    missing.sort();
                    return Ok(RebalanceResponse::PartialFail { keys: missing });
                }
                Some(resolved)
            }
            None => None,
        };

        let moves = self.plan_rebalance(&participants, key_filter.as_ref());
        if moves.is_empty() {
            return Ok(RebalanceResponse::Ok);
        }
        self.execute_moves(moves).await
    }

    /// Plans rebalance moves against a snapshot of the memory measures.
    fn plan_rebalance(
        &self,
        participants: &[WorkerId],
        key_filter: Option<&HashSet<TaskId>>,
    ) -> Vec<Move> {
        if participants.len() < 2 {
            return Vec::new();
        }
        let config = &self.config.rebalance;

        let fraction = |id: WorkerId, measure: u64| -> f64 {
            let limit = self.workers.worker(id).memory_limit;
            if limit > 0 {
                measure as f64 / limit as f64
            } else if measure > 0 {
                1.0
            } else {
                0.0
            }
        };

        let mut measures: HashMap<WorkerId, u64> = participants
            .iter()
            .map(|id| (*id, self.workers.worker(*id).memory_measure(config.measure)))
            .collect();
        let mean = measures.values().sum::<u64>() as f64 / participants.len() as f64;

        let mut senders: Vec<WorkerId> = participants
            .iter()
            .copied()
            .filter(|id| fraction(*id, measures[id]) > config.sender_min)
            .collect();
        let recipients: Vec<WorkerId> = participants
            .iter()
            .copied()
            .filter(|id| fraction(*id, measures[id]) <= config.recipient_max)
            .filter(|id| !senders.contains(id))
            .collect();
        if senders.is_empty() || recipients.is_empty() {
            return Vec::new();
        }
        // Heaviest senders drain first; emptiest recipients fill first.
        senders.sort_by(|a, b| {
            measures[b]
                .cmp(&measures[a])
                .then(self.workers.worker(*a).address.cmp(&self.workers.worker(*b).address))
        });

        let snapshot_fraction: HashMap<WorkerId, f64> = participants
            .iter()
            .map(|id| (*id, fraction(*id, measures[id])))
            .collect();

        let mut moves = Vec::new();
        for sender in senders {
            let held: Vec<TaskId> = self.workers.worker(sender).has_what.iter().copied().collect();
            // Least recently inserted first.
            for task in held {
                if let Some(filter) = key_filter {
                    if !filter.contains(&task) {
                        continue;
                    }
                }
                let ts = self.graph.task(task);
                if ts.state != TaskRunState::Memory {
                    continue;
                }
                let nbytes = ts.nbytes_or_zero();
                if nbytes == 0 {
                    continue;
                }
                if (measures[&sender] as f64) - (nbytes as f64) < mean {
                    // Donating this key would push the sender below the
                    // cluster mean.
                    continue;
                }

                let recipient = recipients
                    .iter()
                    .copied()
                    .filter(|id| !ts.who_has.contains(id))
                    .filter(|id| {
                        snapshot_fraction[&sender] - snapshot_fraction[id]
                            >= config.sender_recipient_gap
                    })
                    .filter(|id| (measures[id] as f64) + (nbytes as f64) <= mean)
                    .min_by(|a, b| {
                        measures[a].cmp(&measures[b]).then(
                            self.workers
                                .worker(*a)
                                .address
                                .cmp(&self.workers.worker(*b).address),
                        )
                    });
                let Some(recipient) = recipient else {
                    continue;
                };

                moves.push(Move {
                    task,
                    key: ts.key.clone(),
                    sender,
                    recipient,
                    nbytes,
                });
                *measures.get_mut(&sender).expect("participant") -= nbytes;
                *measures.get_mut(&recipient).expect("participant") += nbytes;
            }
        }
        moves
    }

    /// Executes planned moves: pull onto the recipient, then drop the
    /// sender's replica. Any failed move leaves both replicas untouched.
    async fn execute_moves(&mut self, moves: Vec<Move>) -> Result<RebalanceResponse, Error> {
        let mut failed: Vec<TaskKey> = Vec::new();
        for plan in moves {
            if self.graph.get(plan.task).map(|ts| ts.state) != Some(TaskRunState::Memory) {
                failed.push(plan.key);
                continue;
            }
            let Some(sender_address) =
                self.workers.get(plan.sender).map(|ws| ws.address.clone())
            else {
                failed.push(plan.key);
                continue;
            };
            let Some(recipient_address) =
                self.workers.get(plan.recipient).map(|ws| ws.address.clone())
            else {
                failed.push(plan.key);
                continue;
            };

            let transfer: HashMap<TaskKey, Vec<Address>> =
                [(plan.key.clone(), vec![sender_address.clone()])]
                    .into_iter()
                    .collect();
            if !self.gather_on_worker(&recipient_address, transfer).await.is_empty() {
                failed.push(plan.key);
                continue;
            }
            self.delete_worker_data(&sender_address, &[plan.key.clone()])?;
            tracing::debug!(key = %plan.key, from = %sender_address, to = %recipient_address,
                nbytes = plan.nbytes, "rebalanced key");
        }

        if failed.is_empty() {
            Ok(RebalanceResponse::Ok)
        } else {
            failed.sort();
            Ok(RebalanceResponse::PartialFail { keys: failed })
        }
    }

    /// Picks workers that could be closed without interrupting work:
    /// workers with nothing processing, grouped by `key` (groups close
    /// whole), heaviest groups first so they start draining earliest, at
    /// most `n` workers in total.
    #[must_use]
    pub fn workers_to_close(
        &self,
        n: Option<usize>,
        key: Option<&dyn Fn(&WorkerState) -> String>,
    ) -> Vec<Address> {
        let mut groups: HashMap<String, (u64, Vec<WorkerId>)> = HashMap::new();
        for (id, ws) in self.workers.iter() {
            let group_key = key.map_or_else(|| ws.address.clone(), |f| f(ws));
            let entry = groups.entry(group_key).or_insert((0, Vec::new()));
            entry.0 += ws.nbytes;
            entry.1.push(id);
        }

        let mut eligible: Vec<(u64, String, Vec<WorkerId>)> = groups
            .into_iter()
            .filter(|(_, (_, members))| {
                members
                    .iter()
                    .all(|id| self.workers.worker(*id).processing.is_empty())
            })
            .map(|(name, (nbytes, members))| (nbytes, name, members))
            .collect();
        // Heaviest groups first, name as the deterministic tie-break.
        eligible.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let limit = n.unwrap_or(usize::MAX);
        let mut out = Vec::new();
        for (_, _, members) in eligible {
            if out.len() + members.len() > limit {
                continue;
            }
            let mut addresses: Vec<Address> = members
                .iter()
                .map(|id| self.workers.worker(*id).address.clone())
                .collect();
            addresses.sort();
            out.extend(addresses);
            if out.len() == limit {
                break;
            }
        }
        out
    }

    /// Gracefully drains and removes workers.
    ///
    /// Victims are the explicit list, the workers resolved by name, or the
    /// `workers_to_close` pick for `n`. Keys held only by victims are
    /// replicated to a non-victim first; retirement is refused outright
    /// when no recipient exists for them. Victims still processing tasks
    /// stay in `closing_gracefully` and are left for a later call.
    pub async fn retire_workers(
        &mut self,
        workers: Vec<String>,
        names: Vec<String>,
        n: Option<usize>,
    ) -> Result<HashMap<Address, RetiredWorker>, Error> {
        self.ensure_accepting()?;

        let victim_addresses: Vec<Address> = if !workers.is_empty() {
            workers
                .iter()
                .filter_map(|w| self.workers.resolve(w))
                .map(|id| self.workers.worker(id).address.clone())
                .collect()
        } else if !names.is_empty() {
            names
                .iter()
                .filter_map(|name| self.workers.resolve(name))
                .map(|id| self.workers.worker(id).address.clone())
                .collect()
        } else {
            self.workers_to_close(n, None)
        };
        if victim_addresses.is_empty() {
            return Ok(HashMap::new());
        }

        let victims: HashSet<WorkerId> = victim_addresses
            .iter()
            .filter_map(|address| self.workers.id_of(address))
            .collect();
        for id in &victims {
            let _ = self.workers.set_status(*id, WorkerStatus::ClosingGracefully);
        }

        // Keys that would vanish with the victims.
        let mut unique: Vec<TaskId> = self
            .graph
            .iter()
            .filter(|(_, ts)| {
                ts.state == TaskRunState::Memory
                    && !ts.who_has.is_empty()
                    && ts.who_has.iter().all(|holder| victims.contains(holder))
            })
            .map(|(id, _)| id)
            .collect();
        unique.sort_by(|a, b| self.graph.task(*a).key.cmp(&self.graph.task(*b).key));

        if !unique.is_empty() && !self.workers.running().any(|id| !victims.contains(&id)) {
            // Nowhere to put the data: refuse and roll the statuses back.
            for id in &victims {
                let _ = self.workers.set_status(*id, WorkerStatus::Running);
            }
            return Err(Error::NoRetireRecipients {
                count: unique.len(),
            });
        }

        let mut stranded: HashSet<WorkerId> = HashSet::new();
        for task in unique {
            let key = self.graph.task(task).key.clone();
            let holders: Vec<WorkerId> = self.graph.task(task).who_has.iter().copied().collect();
            let keys = [key.clone()];
            if !self.replicate(&keys, holders.len() + 1).await.is_empty() {
                tracing::warn!(key = %key, "failed to evacuate key; keeping its holders alive");
                stranded.extend(holders);
            }
        }

        let stimulus_id = StimulusId::new("retire-workers");
        let mut retired = HashMap::new();
        for address in victim_addresses {
            let Some(id) = self.workers.id_of(&address) else {
                continue;
            };
            if stranded.contains(&id) || !self.workers.worker(id).processing.is_empty() {
                continue;
            }
            let name = self.workers.worker(id).name.clone();
            let nthreads = self.workers.worker(id).nthreads;
            self.outbox.worker(id, WorkerMsg::Close);
            self.outbox.flush();
            match self.remove_worker(&address, &stimulus_id)? {
                RemoveWorkerResult::Removed(_) => {
                    let _ = retired.insert(address, RetiredWorker { name, nthreads });
                }
                RemoveWorkerResult::AlreadyRemoved => {}
            }
        }
        tracing::info!(count = retired.len(), "retired workers");
        Ok(retired)
    }
}
