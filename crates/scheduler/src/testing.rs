// SPDX-License-Identifier: Apache-2.0

//! Test utilities: an in-memory worker transport and scheduler builders.
//!
//! The mock transport keeps a per-worker key/value store so that scatter,
//! gather and rebalance flows can be exercised end to end without any
//! networking. Workers can be "killed" to simulate connection loss.

use crate::comm::{GatherOutcome, RpcError, WorkerRpc};
use crate::control::{StartStop, WorkerEvent, WorkerMsg};
use crate::error::Error;
use crate::scheduler::Scheduler;
use crate::task::TaskKey;
use crate::worker::{WorkerId, WorkerRegistration};
use bytes::Bytes;
use gridflow_config::{Address, SchedulerConfig};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use tokio::sync::mpsc;

/// In-memory stand-in for the worker transport.
#[derive(Debug, Default)]
pub struct MockRpc {
    data: RefCell<HashMap<Address, HashMap<TaskKey, Bytes>>>,
    dead: RefCell<HashSet<Address>>,
}

impl MockRpc {
    /// Creates an empty mock transport.
    #[must_use]
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Marks a worker as unreachable; every call to it fails from now on.
    pub fn kill(&self, address: &str) {
        let _ = self.dead.borrow_mut().insert(address.to_owned());
    }

    /// Seeds a payload into a worker's store.
    pub fn seed(&self, address: &str, key: &str, payload: Bytes) {
        let _ = self
            .data
            .borrow_mut()
            .entry(address.to_owned())
            .or_default()
            .insert(key.to_owned(), payload);
    }

    /// Drops a payload from a worker's store.
    pub fn unseed(&self, address: &str, key: &str) {
        if let Some(store) = self.data.borrow_mut().get_mut(address) {
            let _ = store.remove(key);
        }
    }

    /// The keys currently stored on a worker, sorted.
    #[must_use]
    pub fn keys_of(&self, address: &str) -> Vec<TaskKey> {
        let mut keys: Vec<TaskKey> = self
            .data
            .borrow()
            .get(address)
            .map(|store| store.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Number of keys currently stored on a worker.
    #[must_use]
    pub fn len_of(&self, address: &str) -> usize {
        self.data
            .borrow()
            .get(address)
            .map_or(0, HashMap::len)
    }

    fn check_alive(&self, address: &str) -> Result<(), RpcError> {
        if self.dead.borrow().contains(address) {
            return Err(RpcError::CommClosed {
                address: address.to_owned(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait(?Send)]
impl WorkerRpc for MockRpc {
    async fn gather(
        &self,
        worker: &Address,
        who_has: HashMap<TaskKey, Vec<Address>>,
    ) -> Result<GatherOutcome, RpcError> {
        self.check_alive(worker)?;
        let mut outcome = GatherOutcome::default();
        for (key, senders) in who_has {
            let payload = senders.iter().find_map(|sender| {
                if self.dead.borrow().contains(sender) {
                    return None;
                }
                self.data.borrow().get(sender)?.get(&key).cloned()
            });
            match payload {
                Some(payload) => self.seed(worker, &key, payload),
                None => outcome.keys_failed.push(key),
            }
        }
        Ok(outcome)
    }

    async fn scatter(
        &self,
        worker: &Address,
        data: Vec<(TaskKey, Bytes)>,
    ) -> Result<HashMap<TaskKey, u64>, RpcError> {
        self.check_alive(worker)?;
        let mut stored = HashMap::new();
        for (key, payload) in data {
            let _ = stored.insert(key.clone(), payload.len() as u64);
            self.seed(worker, &key, payload);
        }
        Ok(stored)
    }

    async fn fetch(
        &self,
        worker: &Address,
        keys: Vec<TaskKey>,
    ) -> Result<HashMap<TaskKey, Bytes>, RpcError> {
        self.check_alive(worker)?;
        let store = self.data.borrow();
        let Some(held) = store.get(worker) else {
            return Ok(HashMap::new());
        };
        Ok(keys
            .into_iter()
            .filter_map(|key| held.get(&key).cloned().map(|payload| (key, payload)))
            .collect())
    }
}

/// A scheduler wired to a [`MockRpc`], plus the per-worker streams.
pub struct TestCluster {
    /// The scheduler under test.
    pub scheduler: Scheduler,
    /// The shared mock transport.
    pub rpc: Rc<MockRpc>,
    /// Outbound streams per worker address.
    pub worker_streams: HashMap<Address, mpsc::UnboundedReceiver<WorkerMsg>>,
}

impl TestCluster {
    /// Builds a cluster with the given configuration.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        let rpc = MockRpc::new();
        Self {
            scheduler: Scheduler::new(config, rpc.clone()),
            rpc,
            worker_streams: HashMap::new(),
        }
    }

    /// Registers a worker with the given address and thread count.
    pub fn add_worker(&mut self, address: &str, nthreads: usize) -> Result<WorkerId, Error> {
        self.add_worker_with(address, nthreads, |registration| registration)
    }

    /// Registers a worker after letting the caller adjust the
    /// registration.
    pub fn add_worker_with(
        &mut self,
        address: &str,
        nthreads: usize,
        adjust: impl FnOnce(WorkerRegistration) -> WorkerRegistration,
    ) -> Result<WorkerId, Error> {
        let registration = adjust(WorkerRegistration {
            address: address.to_owned(),
            name: None,
            nthreads,
            resources: HashMap::new(),
            memory_limit: 0,
            versions: serde_json::Value::Null,
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.scheduler.register_worker(registration, Vec::new(), tx)?;
        let _ = self.worker_streams.insert(address.to_owned(), rx);
        Ok(id)
    }

    /// Simulates a worker finishing a task: the payload lands in the mock
    /// store and the completion event is fed to the scheduler.
    pub fn finish_task(&mut self, address: &str, key: &str, nbytes: u64) -> Result<(), Error> {
        self.rpc
            .seed(address, key, Bytes::from(vec![0u8; nbytes as usize]));
        self.scheduler.handle_worker_event(
            address,
            WorkerEvent::TaskFinished {
                key: key.to_owned(),
                nbytes,
                type_name: Some("bytes".to_owned()),
                startstops: vec![StartStop {
                    action: "compute".to_owned(),
                    start: 0.0,
                    stop: 0.01,
                }],
            },
        )
    }

    /// Plays the workers' part for queued stream messages: free-keys and
    /// remove-replicas drop payloads from the mock stores. Returns the
    /// number of messages processed.
    pub fn pump(&mut self) -> usize {
        let addresses: Vec<Address> = self.worker_streams.keys().cloned().collect();
        let mut processed = 0;
        for address in addresses {
            for msg in self.drain_worker(&address) {
                processed += 1;
                match msg {
                    WorkerMsg::FreeKeys { keys, .. } | WorkerMsg::RemoveReplicas { keys, .. } => {
                        for key in keys {
                            self.rpc.unseed(&address, &key);
                        }
                    }
                    _ => {}
                }
            }
        }
        processed
    }

    /// Drains and returns every message currently queued for a worker.
    pub fn drain_worker(&mut self, address: &str) -> Vec<WorkerMsg> {
        let mut out = Vec::new();
        if let Some(stream) = self.worker_streams.get_mut(address) {
            while let Ok(msg) = stream.try_recv() {
                out.push(msg);
            }
        }
        out
    }

    /// The address a compute for `key` was sent to, if any worker received
    /// one since the last drain.
    pub fn compute_sent_to(&mut self, key: &str) -> Option<Address> {
        let addresses: Vec<Address> = self.worker_streams.keys().cloned().collect();
        for address in addresses {
            for msg in self.drain_worker(&address) {
                if let WorkerMsg::ComputeTask { key: sent, .. } = msg {
                    if sent == key {
                        return Some(address);
                    }
                }
            }
        }
        None
    }
}
