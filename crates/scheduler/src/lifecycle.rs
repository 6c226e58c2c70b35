// SPDX-License-Identifier: Apache-2.0

//! Lifecycle control: idle detection, adaptive sizing, restart, graceful
//! close, and the plugin hook surface.

use crate::control::{ClientMsg, StimulusId, WorkerMsg};
use crate::error::Error;
use crate::graph::TaskGraph;
use crate::occupancy::DurationEstimator;
use crate::scheduler::{Scheduler, SchedulerStatus};
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Hooks invoked on scheduler lifecycle events. All hooks run
/// synchronously on the scheduler loop; a plugin that mutates external
/// state must do so without blocking.
pub trait SchedulerPlugin {
    /// The plugin's registry name; replacing a plugin replaces by name.
    fn name(&self) -> &str;

    /// A worker joined the cluster.
    fn add_worker(&mut self, _address: &str) {}

    /// A worker left the cluster.
    fn remove_worker(&mut self, _address: &str, _stimulus_id: &StimulusId) {}

    /// A task transition committed.
    fn transition(
        &mut self,
        _key: &str,
        _start: &'static str,
        _finish: &'static str,
        _stimulus_id: &StimulusId,
    ) {
    }

    /// The scheduler restarted and the graph was emptied.
    fn restart(&mut self) {}

    /// The scheduler is closing; release external resources.
    fn close(&mut self) {}
}

/// A restart in flight, waiting for workers to come back.
#[derive(Debug)]
pub(crate) struct PendingRestart {
    pub(crate) deadline: Instant,
    pub(crate) wait_for_workers: bool,
    pub(crate) expected: usize,
    pub(crate) returned: usize,
}

impl Scheduler {
    /// Registers a plugin by name.
    ///
    /// With `idempotent`, an existing plugin of the same name is kept and
    /// the new one is discarded silently. Otherwise the new plugin
    /// replaces the old one, whose teardown hook is called.
    pub fn add_plugin(&mut self, plugin: Box<dyn SchedulerPlugin>, idempotent: bool) {
        let name = plugin.name().to_owned();
        if idempotent && self.plugins.contains_key(&name) {
            return;
        }
        if let Some(mut old) = self.plugins.insert(name, plugin) {
            old.close();
        }
    }

    /// Removes a plugin by name, calling its teardown hook.
    pub fn remove_plugin(&mut self, name: &str) {
        if let Some(mut old) = self.plugins.shift_remove(name) {
            old.close();
        }
    }

    /// Number of registered plugins.
    #[must_use]
    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    /// Records whether the scheduler is idle (no tasks, nothing
    /// processing). `idle_since` is only set once two *consecutive* checks
    /// both observed idleness, so a single quiet sample between bursts does
    /// not start the countdown. Returns the current `idle_since`.
    pub fn check_idle(&mut self, now: Instant) -> Option<Instant> {
        let busy = !self.graph.is_empty()
            || self.workers.iter().any(|(_, ws)| !ws.processing.is_empty());
        if busy {
            self.idle_observed = false;
            self.idle_since = None;
            return None;
        }
        if !self.idle_observed {
            self.idle_observed = true;
            return self.idle_since;
        }
        if self.idle_since.is_none() {
            self.idle_since = Some(now);
        }
        self.idle_since
    }

    /// Whether the configured idle timeout has elapsed; when it has, the
    /// scheduler should close.
    #[must_use]
    pub fn idle_timeout_elapsed(&self, now: Instant) -> bool {
        match (self.config.idle_timeout, self.idle_since) {
            (Some(timeout), Some(since)) => now.duration_since(since) >= timeout,
            _ => false,
        }
    }

    /// The recommended number of workers for the current workload:
    /// total occupancy divided by the target duration, never more than the
    /// number of tasks, and zero when no tasks exist.
    #[must_use]
    pub fn adaptive_target(&self, target_duration: Duration) -> usize {
        if self.graph.is_empty() {
            return 0;
        }
        let target = target_duration.as_secs_f64();
        if target <= 0.0 {
            return self.graph.len();
        }
        let wanted = (self.total_occupancy / target).ceil() as usize;
        wanted.clamp(0, self.graph.len()).max(1)
    }

    /// Begins a restart: every task is forgotten, every worker is told to
    /// close (its nanny relaunches it), and the scheduler starts waiting
    /// for re-registrations. Completion is reported by
    /// [`Self::poll_restart`].
    pub fn begin_restart(&mut self, timeout: Duration, wait_for_workers: bool) -> Result<(), Error> {
        self.ensure_accepting()?;
        let expected = self.workers.len();
        tracing::info!(expected, "restarting cluster");

        self.clear_task_state();

        let addresses: Vec<String> = self
            .workers
            .iter()
            .map(|(_, ws)| ws.address.clone())
            .collect();
        for address in addresses {
            if let Some(id) = self.workers.id_of(&address) {
                self.outbox.worker(id, WorkerMsg::Close);
                self.outbox.flush();
                self.outbox.disconnect_worker(id);
            }
            let _ = self.workers.remove_worker(&address);
        }

        let clients: Vec<String> = self.clients.iter().map(|c| c.id.clone()).collect();
        for client in clients {
            self.outbox.client(&client, ClientMsg::Restart);
        }
        self.outbox.flush();

        for plugin in self.plugins.values_mut() {
            plugin.restart();
        }
        self.pending_restart = Some(PendingRestart {
            deadline: Instant::now() + timeout,
            wait_for_workers,
            expected,
            returned: 0,
        });
        Ok(())
    }

    /// Checks whether a pending restart has finished. Returns `None` while
    /// still waiting; otherwise the number of workers that returned, or an
    /// error when the deadline expired without enough of them.
    pub fn poll_restart(&mut self, now: Instant) -> Option<Result<usize, Error>> {
        let pending = self.pending_restart.as_ref()?;
        if pending.expected == 0 {
            self.pending_restart = None;
            return Some(Ok(0));
        }
        if pending.returned >= pending.expected {
            let returned = pending.returned;
            self.pending_restart = None;
            return Some(Ok(returned));
        }
        if now < pending.deadline {
            return None;
        }
        let (returned, expected, wait) = (
            pending.returned,
            pending.expected,
            pending.wait_for_workers,
        );
        self.pending_restart = None;
        if expected > 0 && (returned == 0 || wait) && returned < expected {
            return Some(Err(Error::RestartTimeout { returned, expected }));
        }
        Some(Ok(returned))
    }

    /// Empties the graph and every task-facing index on workers and
    /// clients. Used by restart; deliberately bypasses the transition
    /// engine (there is nothing sensible to log about forgetting the
    /// whole world).
    pub(crate) fn clear_task_state(&mut self) {
        self.graph = TaskGraph::new();
        self.durations = DurationEstimator::new(&self.config);
        self.unrunnable = HashSet::new();
        self.total_occupancy = 0.0;

        let worker_ids: Vec<crate::worker::WorkerId> =
            self.workers.iter().map(|(id, _)| id).collect();
        for id in worker_ids {
            let ws = self.workers.worker_mut(id);
            ws.processing.clear();
            ws.long_running.clear();
            ws.has_what.clear();
            ws.used_resources.clear();
            ws.occupancy = 0.0;
            ws.nbytes = 0;
        }

        let clients: Vec<String> = self.clients.iter().map(|c| c.id.clone()).collect();
        for client in clients {
            let wants: Vec<crate::task::TaskId> = self
                .clients
                .get(&client)
                .map(|c| c.wants_what.iter().copied().collect())
                .unwrap_or_default();
            for task in wants {
                self.clients.unwant(&client, task);
            }
        }
    }

    /// Gracefully closes the scheduler: workers are told to shut down,
    /// plugins tear down, and no further stimuli are accepted.
    pub fn close(&mut self) {
        if matches!(self.status, SchedulerStatus::Closed) {
            return;
        }
        tracing::info!("closing scheduler");
        let worker_ids: Vec<crate::worker::WorkerId> =
            self.workers.iter().map(|(id, _)| id).collect();
        for id in worker_ids {
            self.outbox.worker(id, WorkerMsg::Close);
        }
        self.outbox.flush();
        for plugin in self.plugins.values_mut() {
            plugin.close();
        }
        self.status = SchedulerStatus::Closed;
    }
}
