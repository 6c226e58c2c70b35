// SPDX-License-Identifier: Apache-2.0

//! Outbound communication: per-worker ordered batched streams, per-client
//! report streams, and the point-to-point RPC seam used by data movement.
//!
//! Transition handlers never await. They enqueue messages into the
//! [`Outbox`], and the scheduler flushes the accumulated batch after the
//! transition batch commits. Delivery is ordered per peer and best-effort:
//! when a peer is disconnected its pending messages are dropped silently,
//! and the scheduler re-derives state when the peer reconnects.

use crate::control::{ClientMsg, WorkerMsg};
use crate::task::TaskKey;
use crate::worker::WorkerId;
use bytes::Bytes;
use gridflow_config::Address;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Errors of the point-to-point RPC seam.
#[derive(thiserror::Error, Debug)]
pub enum RpcError {
    /// The peer is gone; nothing was delivered.
    #[error("connection to {address} is closed")]
    CommClosed {
        /// Address of the unreachable peer.
        address: Address,
    },

    /// The peer answered with a failure.
    #[error("rpc to {address} failed: {details}")]
    Failed {
        /// Address of the failing peer.
        address: Address,
        /// Failure description.
        details: String,
    },
}

/// Result of asking a worker to pull keys from other workers.
#[derive(Debug, Default)]
pub struct GatherOutcome {
    /// Keys the recipient could not obtain from any listed holder.
    pub keys_failed: Vec<TaskKey>,
}

/// Point-to-point calls the scheduler makes to a single worker, outside
/// the batched stream. Implemented by the transport layer; tests use the
/// in-memory mock from the `testing` module.
#[async_trait::async_trait(?Send)]
pub trait WorkerRpc {
    /// Instructs `worker` to fetch each key from one of the listed
    /// holders. Holders are tried in order.
    async fn gather(
        &self,
        worker: &Address,
        who_has: HashMap<TaskKey, Vec<Address>>,
    ) -> Result<GatherOutcome, RpcError>;

    /// Places client-provided payloads directly into `worker`'s memory.
    /// Returns the stored size per key.
    async fn scatter(
        &self,
        worker: &Address,
        data: Vec<(TaskKey, Bytes)>,
    ) -> Result<HashMap<TaskKey, u64>, RpcError>;

    /// Fetches result payloads from `worker` back to the scheduler.
    async fn fetch(
        &self,
        worker: &Address,
        keys: Vec<TaskKey>,
    ) -> Result<HashMap<TaskKey, Bytes>, RpcError>;
}

/// Accumulates outbound messages during a stimulus and flushes them in
/// send order afterwards.
#[derive(Debug, Default)]
pub struct Outbox {
    worker_streams: HashMap<WorkerId, mpsc::UnboundedSender<WorkerMsg>>,
    client_streams: HashMap<String, mpsc::UnboundedSender<ClientMsg>>,
    pending: Vec<Envelope>,
}

#[derive(Debug)]
enum Envelope {
    Worker(WorkerId, WorkerMsg),
    Client(String, ClientMsg),
}

impl Outbox {
    /// Creates an empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches the ordered stream of a newly registered worker.
    pub fn connect_worker(&mut self, id: WorkerId, stream: mpsc::UnboundedSender<WorkerMsg>) {
        let _ = self.worker_streams.insert(id, stream);
    }

    /// Detaches a removed worker's stream. Anything still queued for it is
    /// dropped at flush time.
    pub fn disconnect_worker(&mut self, id: WorkerId) {
        let _ = self.worker_streams.remove(&id);
    }

    /// Attaches the report stream of a client.
    pub fn connect_client(&mut self, id: &str, stream: mpsc::UnboundedSender<ClientMsg>) {
        let _ = self.client_streams.insert(id.to_owned(), stream);
    }

    /// Detaches a disconnected client's stream.
    pub fn disconnect_client(&mut self, id: &str) {
        let _ = self.client_streams.remove(id);
    }

    /// Queues a message for a worker. Nothing is sent until [`Self::flush`].
    pub fn worker(&mut self, id: WorkerId, msg: WorkerMsg) {
        self.pending.push(Envelope::Worker(id, msg));
    }

    /// Queues a message for a client. Nothing is sent until [`Self::flush`].
    pub fn client(&mut self, id: &str, msg: ClientMsg) {
        self.pending.push(Envelope::Client(id.to_owned(), msg));
    }

    /// Sends everything queued so far, in order. Messages for disconnected
    /// peers are dropped silently.
    pub fn flush(&mut self) {
        for envelope in self.pending.drain(..) {
            match envelope {
                Envelope::Worker(id, msg) => {
                    if let Some(stream) = self.worker_streams.get(&id) {
                        let _ = stream.send(msg);
                    }
                }
                Envelope::Client(id, msg) => {
                    if let Some(stream) = self.client_streams.get(&id) {
                        let _ = stream.send(msg);
                    }
                }
            }
        }
    }

    /// Number of messages waiting for the next flush.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
