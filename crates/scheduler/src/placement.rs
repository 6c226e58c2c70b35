// SPDX-License-Identifier: Apache-2.0

//! The placement policy: picking the worker a ready task should run on.
//!
//! The decision is deterministic. Restrictions narrow the candidate pool,
//! dependency holders are preferred to minimize transfers, small leaf
//! tasks with many unfinished group siblings are concentrated
//! (co-scheduled) so that their consumers find neighbouring inputs on one
//! worker, and all remaining ties break on occupancy, held bytes and
//! finally the worker address.

use crate::graph::TaskGraph;
use crate::task::{TaskId, TaskState};
use crate::worker::{WorkerId, WorkerRegistry, host_of};
use std::collections::HashSet;

/// A task is root-ish when its combined dependency payload is at most this
/// many bytes. Matches observed behavior of the co-scheduling heuristic;
/// no principled derivation exists.
const ROOTISH_MAX_DEP_BYTES: u64 = 5;

/// A root-ish task is co-scheduled only while its group still has more
/// than `factor * total_nthreads` unfinished siblings.
const ROOTISH_SIBLING_FACTOR: u64 = 2;

/// Picks the worker for a task whose dependencies are all in memory.
/// Returns `None` when no worker can take the task, which sends it to the
/// `no-worker` state.
#[must_use]
pub fn decide_worker(
    graph: &TaskGraph,
    workers: &WorkerRegistry,
    bandwidth: f64,
    task: TaskId,
) -> Option<WorkerId> {
    let ts = graph.task(task);

    let pool: Vec<WorkerId> = match restricted_pool(workers, ts) {
        Some(restricted) => {
            let running: Vec<WorkerId> = restricted
                .into_iter()
                .filter(|id| workers.worker(*id).status.accepts_tasks())
                .collect();
            if running.is_empty() {
                if !ts.loose_restrictions {
                    return None;
                }
                workers.running().collect()
            } else {
                running
            }
        }
        None => workers.running().collect(),
    };
    if pool.is_empty() {
        return None;
    }

    if is_rootish(graph, workers, ts) {
        let group = graph.group(ts.group);
        return pool.into_iter().min_by(|a, b| {
            let (wa, wb) = (workers.worker(*a), workers.worker(*b));
            group
                .occupancy_of(*a)
                .cmp(&group.occupancy_of(*b))
                .then(wa.occupancy.total_cmp(&wb.occupancy))
                .then(wa.address.cmp(&wb.address))
        });
    }

    // Prefer workers that already hold a dependency; fall back to the full
    // pool when none does.
    let holders: Vec<WorkerId> = pool
        .iter()
        .copied()
        .filter(|id| {
            ts.dependencies
                .iter()
                .any(|dep| graph.task(*dep).who_has.contains(id))
        })
        .collect();
    let candidates = if holders.is_empty() { pool } else { holders };

    candidates.into_iter().min_by(|a, b| {
        let (wa, wb) = (workers.worker(*a), workers.worker(*b));
        let score_a = wa.occupancy + transfer_cost(graph, ts, *a, bandwidth);
        let score_b = wb.occupancy + transfer_cost(graph, ts, *b, bandwidth);
        score_a
            .total_cmp(&score_b)
            .then(wa.nbytes.cmp(&wb.nbytes))
            .then(wa.address.cmp(&wb.address))
    })
}

/// The estimated seconds needed to move the missing dependencies of `ts`
/// to `worker`.
#[must_use]
pub fn transfer_cost(graph: &TaskGraph, ts: &TaskState, worker: WorkerId, bandwidth: f64) -> f64 {
    let missing: u64 = ts
        .dependencies
        .iter()
        .map(|dep| graph.task(*dep))
        .filter(|dep| !dep.who_has.contains(&worker))
        .map(TaskState::nbytes_or_zero)
        .sum();
    missing as f64 / bandwidth
}

/// The intersection of live workers satisfying the task's host, worker and
/// resource restrictions. `None` when the task is unrestricted.
fn restricted_pool(workers: &WorkerRegistry, ts: &TaskState) -> Option<Vec<WorkerId>> {
    if ts.worker_restrictions.is_none()
        && ts.host_restrictions.is_none()
        && ts.resource_restrictions.is_none()
    {
        return None;
    }

    let mut pool: Vec<WorkerId> = workers.iter().map(|(id, _)| id).collect();
    if let Some(addresses) = &ts.worker_restrictions {
        let allowed: HashSet<&str> = addresses.iter().map(String::as_str).collect();
        pool.retain(|id| allowed.contains(workers.worker(*id).address.as_str()));
    }
    if let Some(hosts) = &ts.host_restrictions {
        let allowed: HashSet<&str> = hosts.iter().map(|h| host_of(h)).collect();
        pool.retain(|id| allowed.contains(workers.worker(*id).host()));
    }
    if let Some(resources) = &ts.resource_restrictions {
        pool.retain(|id| {
            let ws = workers.worker(*id);
            resources
                .iter()
                .all(|(name, need)| ws.resources.get(name).copied().unwrap_or(0.0) >= *need)
        });
    }
    Some(pool)
}

/// Whether the task qualifies for root-task co-scheduling: nearly no
/// dependency payload and many unfinished siblings in its group.
#[must_use]
pub fn is_rootish(graph: &TaskGraph, workers: &WorkerRegistry, ts: &TaskState) -> bool {
    let dep_bytes: u64 = ts
        .dependencies
        .iter()
        .map(|dep| graph.task(*dep).nbytes_or_zero())
        .sum();
    if dep_bytes > ROOTISH_MAX_DEP_BYTES {
        return false;
    }
    let unfinished = graph.group(ts.group).states.unfinished();
    unfinished > ROOTISH_SIBLING_FACTOR * workers.total_nthreads() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskRunState;
    use crate::worker::WorkerRegistration;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::time::Instant;

    fn add_worker(registry: &mut WorkerRegistry, address: &str, nthreads: usize) -> WorkerId {
        registry
            .add_worker(
                WorkerRegistration {
                    address: address.to_owned(),
                    name: None,
                    nthreads,
                    resources: HashMap::new(),
                    memory_limit: 0,
                    versions: serde_json::Value::Null,
                },
                Instant::now(),
            )
            .expect("registration succeeds")
    }

    /// Puts a finished dependency of the given size onto a worker.
    fn dep_in_memory(
        graph: &mut TaskGraph,
        registry: &mut WorkerRegistry,
        key: &str,
        worker: WorkerId,
        nbytes: u64,
    ) -> TaskId {
        let id = graph.new_task(key, None, &[]);
        let _ = graph.set_state(id, TaskRunState::Memory);
        graph.set_nbytes(id, nbytes);
        let _ = graph.task_mut(id).who_has.insert(worker);
        let _ = registry.worker_mut(worker).has_what.insert(id);
        registry.worker_mut(worker).nbytes += nbytes;
        id
    }

    const BANDWIDTH: f64 = 100_000_000.0;

    #[test]
    fn prefers_the_worker_holding_the_dependencies() {
        let mut graph = TaskGraph::new();
        let mut registry = WorkerRegistry::new();
        let a = add_worker(&mut registry, "tcp://10.0.0.1:1", 1);
        let _b = add_worker(&mut registry, "tcp://10.0.0.2:1", 1);
        let _c = add_worker(&mut registry, "tcp://10.0.0.3:1", 1);

        let _dep = dep_in_memory(&mut graph, &mut registry, "data-1", a, 1_000_000);
        let task = graph.new_task("inc-1", None, &["data-1".to_owned()]);

        assert_eq!(decide_worker(&graph, &registry, BANDWIDTH, task), Some(a));
    }

    #[test]
    fn unsatisfiable_restrictions_yield_no_worker() {
        let mut graph = TaskGraph::new();
        let mut registry = WorkerRegistry::new();
        let _a = add_worker(&mut registry, "tcp://10.0.0.1:1", 1);

        let task = graph.new_task("inc-1", None, &[]);
        graph.task_mut(task).worker_restrictions =
            Some(["tcp://127.0.0.5:9999".to_owned()].into());

        assert_eq!(decide_worker(&graph, &registry, BANDWIDTH, task), None);
    }

    #[test]
    fn loose_restrictions_widen_to_all_running_workers() {
        let mut graph = TaskGraph::new();
        let mut registry = WorkerRegistry::new();
        let a = add_worker(&mut registry, "tcp://10.0.0.1:1", 1);

        let task = graph.new_task("inc-1", None, &[]);
        graph.task_mut(task).worker_restrictions =
            Some(["tcp://127.0.0.5:9999".to_owned()].into());
        graph.task_mut(task).loose_restrictions = true;

        assert_eq!(decide_worker(&graph, &registry, BANDWIDTH, task), Some(a));
    }

    #[test]
    fn resource_restrictions_filter_on_total_supply() {
        let mut graph = TaskGraph::new();
        let mut registry = WorkerRegistry::new();
        let _a = add_worker(&mut registry, "tcp://10.0.0.1:1", 1);
        let gpu = registry
            .add_worker(
                WorkerRegistration {
                    address: "tcp://10.0.0.2:1".to_owned(),
                    name: None,
                    nthreads: 1,
                    resources: [("gpu".to_owned(), 2.0)].into(),
                    memory_limit: 0,
                    versions: serde_json::Value::Null,
                },
                Instant::now(),
            )
            .expect("ok");

        let task = graph.new_task("train-1", None, &[]);
        graph.task_mut(task).resource_restrictions = Some([("gpu".to_owned(), 1.0)].into());

        assert_eq!(decide_worker(&graph, &registry, BANDWIDTH, task), Some(gpu));
    }

    #[test]
    fn paused_workers_are_never_chosen() {
        let mut graph = TaskGraph::new();
        let mut registry = WorkerRegistry::new();
        let a = add_worker(&mut registry, "tcp://10.0.0.1:1", 1);
        let b = add_worker(&mut registry, "tcp://10.0.0.2:1", 1);
        let _ = registry.set_status(a, crate::worker::WorkerStatus::Paused);

        // Even though the dependency lives on the paused worker, placement
        // falls back to the next-best candidate.
        let _dep = dep_in_memory(&mut graph, &mut registry, "data-1", a, 100);
        let task = graph.new_task("inc-1", None, &["data-1".to_owned()]);
        assert_eq!(decide_worker(&graph, &registry, BANDWIDTH, task), Some(b));
    }

    #[test]
    fn ties_break_on_address() {
        let mut graph = TaskGraph::new();
        let mut registry = WorkerRegistry::new();
        let a = add_worker(&mut registry, "tcp://10.0.0.1:1", 1);
        let _b = add_worker(&mut registry, "tcp://10.0.0.2:1", 1);

        let task = graph.new_task("inc-1", None, &[]);
        assert_eq!(decide_worker(&graph, &registry, BANDWIDTH, task), Some(a));
    }

    #[test]
    fn transfer_cost_counts_only_missing_dependencies() {
        let mut graph = TaskGraph::new();
        let mut registry = WorkerRegistry::new();
        let a = add_worker(&mut registry, "tcp://10.0.0.1:1", 1);
        let b = add_worker(&mut registry, "tcp://10.0.0.2:1", 1);

        let _local = dep_in_memory(&mut graph, &mut registry, "local-1", a, 400);
        let _remote = dep_in_memory(&mut graph, &mut registry, "remote-1", b, 200);
        let task = graph.new_task(
            "sum-1",
            None,
            &["local-1".to_owned(), "remote-1".to_owned()],
        );

        let ts = graph.task(task);
        assert_eq!(transfer_cost(&graph, ts, a, 100.0), 2.0);
        assert_eq!(transfer_cost(&graph, ts, b, 100.0), 4.0);
    }

    #[test]
    fn rootish_siblings_spread_by_group_occupancy() {
        let mut graph = TaskGraph::new();
        let mut registry = WorkerRegistry::new();
        let a = add_worker(&mut registry, "tcp://10.0.0.1:1", 1);
        let b = add_worker(&mut registry, "tcp://10.0.0.2:1", 1);

        // Many tiny siblings in one group: all root-ish.
        let tasks: Vec<TaskId> = (0..8)
            .map(|i| graph.new_task(&format!("leaf-{i}"), None, &[]))
            .collect();
        let first = tasks[0];
        assert!(is_rootish(&graph, &registry, graph.task(first)));

        // With three siblings already living on `a`, the next sibling goes
        // to the emptier worker despite equal occupancy.
        let group = graph.task(first).group;
        graph.group_mut(group).add_occupancy(a);
        graph.group_mut(group).add_occupancy(a);
        graph.group_mut(group).add_occupancy(a);
        assert_eq!(decide_worker(&graph, &registry, BANDWIDTH, first), Some(b));
    }

    #[test]
    fn small_groups_are_not_rootish() {
        let mut graph = TaskGraph::new();
        let mut registry = WorkerRegistry::new();
        let _a = add_worker(&mut registry, "tcp://10.0.0.1:1", 4);

        let task = graph.new_task("leaf-0", None, &[]);
        let _ = graph.new_task("leaf-1", None, &[]);
        // Two unfinished siblings <= 2 * 4 threads: not root-ish.
        assert!(!is_rootish(&graph, &registry, graph.task(task)));
    }
}
