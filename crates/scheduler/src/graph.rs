// SPDX-License-Identifier: Apache-2.0

//! The task store: owns every [`TaskState`], [`TaskPrefix`] and
//! [`TaskGroup`], and maintains the dependency/dependent relation in both
//! directions.
//!
//! Dependency edges flow only forward; dependents are derived. Both
//! directions of an edge are always inserted and removed together, so a
//! task can never observe a half-linked neighbour.

use crate::task::{
    GroupId, PrefixId, StateCounts, TaskGroup, TaskId, TaskKey, TaskPrefix, TaskRunState,
    TaskState, key_group, key_prefix,
};
use bytes::Bytes;
use slotmap::SlotMap;
use std::collections::{HashMap, HashSet};

/// Owner of all task entities.
#[derive(Debug, Default)]
pub struct TaskGraph {
    tasks: SlotMap<TaskId, TaskState>,
    by_key: HashMap<TaskKey, TaskId>,
    prefixes: SlotMap<PrefixId, TaskPrefix>,
    prefix_by_name: HashMap<String, PrefixId>,
    groups: SlotMap<GroupId, TaskGroup>,
    group_by_name: HashMap<String, GroupId>,
}

impl TaskGraph {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of known tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the store holds no tasks at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Resolves a key to its task id.
    #[must_use]
    pub fn id_of(&self, key: &str) -> Option<TaskId> {
        self.by_key.get(key).copied()
    }

    /// Immutable access to a task. Panics if the id is stale, which is a
    /// scheduler bug.
    #[must_use]
    pub fn task(&self, id: TaskId) -> &TaskState {
        &self.tasks[id]
    }

    /// Mutable access to a task. Panics if the id is stale, which is a
    /// scheduler bug.
    pub fn task_mut(&mut self, id: TaskId) -> &mut TaskState {
        &mut self.tasks[id]
    }

    /// Fallible lookup by id.
    #[must_use]
    pub fn get(&self, id: TaskId) -> Option<&TaskState> {
        self.tasks.get(id)
    }

    /// Iterates over all tasks.
    pub fn iter(&self) -> impl Iterator<Item = (TaskId, &TaskState)> {
        self.tasks.iter()
    }

    /// Iterates over all task ids.
    pub fn ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.tasks.keys()
    }

    /// Immutable access to a prefix.
    #[must_use]
    pub fn prefix(&self, id: PrefixId) -> &TaskPrefix {
        &self.prefixes[id]
    }

    /// Mutable access to a prefix.
    pub fn prefix_mut(&mut self, id: PrefixId) -> &mut TaskPrefix {
        &mut self.prefixes[id]
    }

    /// Resolves a prefix name.
    #[must_use]
    pub fn prefix_by_name(&self, name: &str) -> Option<PrefixId> {
        self.prefix_by_name.get(name).copied()
    }

    /// Immutable access to a group.
    #[must_use]
    pub fn group(&self, id: GroupId) -> &TaskGroup {
        &self.groups[id]
    }

    /// Mutable access to a group.
    pub fn group_mut(&mut self, id: GroupId) -> &mut TaskGroup {
        &mut self.groups[id]
    }

    /// Iterates over all groups.
    pub fn groups(&self) -> impl Iterator<Item = (GroupId, &TaskGroup)> {
        self.groups.iter()
    }

    fn prefix_for(&mut self, key: &str) -> PrefixId {
        let name = key_prefix(key);
        if let Some(id) = self.prefix_by_name.get(name) {
            return *id;
        }
        let id = self.prefixes.insert(TaskPrefix::new(name.to_owned()));
        let _ = self.prefix_by_name.insert(name.to_owned(), id);
        id
    }

    fn group_for(&mut self, key: &str, prefix: PrefixId) -> GroupId {
        let name = key_group(key);
        if let Some(id) = self.group_by_name.get(name) {
            return *id;
        }
        let id = self.groups.insert(TaskGroup::new(name.to_owned(), prefix));
        let _ = self.group_by_name.insert(name.to_owned(), id);
        let _ = self.prefixes[prefix].groups.insert(id);
        id
    }

    /// Creates a task in state `released` and registers it into its prefix
    /// and group. Missing dependencies are created as `released`
    /// placeholders without a run spec.
    ///
    /// Calling this for an existing key is idempotent: the run spec is
    /// filled in if it was absent and any new dependency edges are linked.
    pub fn new_task(
        &mut self,
        key: &str,
        run_spec: Option<Bytes>,
        dependencies: &[TaskKey],
    ) -> TaskId {
        let id = match self.by_key.get(key) {
            Some(id) => {
                let id = *id;
                let ts = &mut self.tasks[id];
                if ts.run_spec.is_none() {
                    ts.run_spec = run_spec;
                }
                id
            }
            None => {
                let prefix = self.prefix_for(key);
                let group = self.group_for(key, prefix);
                let ts = TaskState::new(key.to_owned(), run_spec, group, prefix);
                let id = self.tasks.insert(ts);
                let _ = self.by_key.insert(key.to_owned(), id);
                self.prefixes[prefix].states.increment(TaskRunState::Released);
                self.groups[group].states.increment(TaskRunState::Released);
                id
            }
        };

        for dep_key in dependencies {
            let dep = self.new_task(dep_key, None, &[]);
            self.link(id, dep);
        }
        id
    }

    /// Inserts the dependency edge `task -> dep` in both directions, plus
    /// the derived group edge.
    pub fn link(&mut self, task: TaskId, dep: TaskId) {
        if task == dep {
            return;
        }
        let _ = self.tasks[task].dependencies.insert(dep);
        let _ = self.tasks[dep].dependents.insert(task);
        let dep_group = self.tasks[dep].group;
        let task_group = self.tasks[task].group;
        if dep_group != task_group {
            let _ = self.groups[task_group].dependencies.insert(dep_group);
        }
    }

    /// Moves a task to a new lifecycle state, keeping the prefix and group
    /// histograms in step. Returns the previous state.
    pub fn set_state(&mut self, id: TaskId, state: TaskRunState) -> TaskRunState {
        let (prefix, group, old) = {
            let ts = &mut self.tasks[id];
            let old = ts.state;
            ts.state = state;
            (ts.prefix, ts.group, old)
        };
        self.prefixes[prefix].states.decrement(old);
        self.prefixes[prefix].states.increment(state);
        self.groups[group].states.decrement(old);
        self.groups[group].states.increment(state);
        old
    }

    /// Records the result size of a task, adjusting the prefix and group
    /// byte totals.
    pub fn set_nbytes(&mut self, id: TaskId, nbytes: u64) {
        let (prefix, group, old) = {
            let ts = &mut self.tasks[id];
            let old = ts.nbytes.unwrap_or(0);
            ts.nbytes = Some(nbytes);
            (ts.prefix, ts.group, old)
        };
        self.prefixes[prefix].nbytes_total = self.prefixes[prefix].nbytes_total - old + nbytes;
        self.groups[group].nbytes_total = self.groups[group].nbytes_total - old + nbytes;
    }

    /// State histogram summed over all prefixes.
    #[must_use]
    pub fn state_totals(&self) -> StateCounts {
        let mut totals = StateCounts::default();
        for ts in self.tasks.values() {
            totals.increment(ts.state);
        }
        totals
    }

    /// Deletes every task that is not transitively required by
    /// `keys_wanted` and not protected by `keep`. Culled tasks never enter
    /// the transition log; they simply vanish.
    ///
    /// Only tasks that are safe to drop silently are culled: `released`
    /// tasks with no replica anywhere and not currently processing.
    pub fn cull(
        &mut self,
        keys_wanted: impl IntoIterator<Item = TaskId>,
        keep: impl Fn(&TaskState) -> bool,
    ) -> Vec<TaskKey> {
        let mut required: HashSet<TaskId> = HashSet::new();
        let mut stack: Vec<TaskId> = keys_wanted.into_iter().collect();
        while let Some(id) = stack.pop() {
            if !required.insert(id) {
                continue;
            }
            if let Some(ts) = self.tasks.get(id) {
                stack.extend(ts.dependencies.iter().copied());
            }
        }

        let doomed: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|(id, ts)| {
                !required.contains(id)
                    && ts.state == TaskRunState::Released
                    && ts.who_has.is_empty()
                    && ts.processing_on.is_none()
                    && ts.dependents.iter().all(|d| !required.contains(d))
                    && !keep(ts)
            })
            .map(|(id, _)| id)
            .collect();

        let mut culled = Vec::with_capacity(doomed.len());
        for id in doomed {
            culled.push(self.tasks[id].key.clone());
            self.unlink_and_remove(id);
        }
        culled
    }

    /// Forgets a task: unlinks it from its dependencies, prefix and group,
    /// then removes it from the store.
    ///
    /// Preconditions (checked in debug builds): no replica anywhere, every
    /// dependent already forgotten, nothing processing it.
    pub fn forget(&mut self, id: TaskId) {
        debug_assert!(self.tasks[id].who_has.is_empty(), "forget with replicas");
        debug_assert!(self.tasks[id].processing_on.is_none(), "forget while processing");
        debug_assert!(
            self.tasks[id].dependents.is_empty(),
            "forget with live dependents"
        );
        let _ = self.set_state(id, TaskRunState::Forgotten);
        self.unlink_and_remove(id);
    }

    fn unlink_and_remove(&mut self, id: TaskId) {
        let dependencies: Vec<TaskId> = self.tasks[id].dependencies.iter().copied().collect();
        let dependents: Vec<TaskId> = self.tasks[id].dependents.iter().copied().collect();
        for dep in dependencies {
            if let Some(ts) = self.tasks.get_mut(dep) {
                let _ = ts.dependents.remove(&id);
            }
        }
        for dependent in dependents {
            if let Some(ts) = self.tasks.get_mut(dependent) {
                let _ = ts.dependencies.remove(&id);
            }
        }

        let Some(ts) = self.tasks.remove(id) else {
            return;
        };
        let _ = self.by_key.remove(&ts.key);

        self.prefixes[ts.prefix].states.decrement(ts.state);
        self.prefixes[ts.prefix].nbytes_total -= ts.nbytes.unwrap_or(0);
        self.groups[ts.group].states.decrement(ts.state);
        self.groups[ts.group].nbytes_total -= ts.nbytes.unwrap_or(0);

        if self.groups[ts.group].states.total() == 0 {
            let group = self
                .groups
                .remove(ts.group)
                .expect("group existed a line ago");
            let _ = self.group_by_name.remove(&group.name);
            let _ = self.prefixes[ts.prefix].groups.remove(&ts.group);
            for other in self.groups.values_mut() {
                let _ = other.dependencies.remove(&ts.group);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn graph_with_chain() -> (TaskGraph, TaskId, TaskId, TaskId) {
        let mut graph = TaskGraph::new();
        let x = graph.new_task("x-1", Some(Bytes::from_static(b"fx")), &[]);
        let y = graph.new_task("y-1", Some(Bytes::from_static(b"fy")), &["x-1".to_owned()]);
        let z = graph.new_task("z-1", Some(Bytes::from_static(b"fz")), &["y-1".to_owned()]);
        (graph, x, y, z)
    }

    #[test]
    fn dependencies_are_bidirectional() {
        let (graph, x, y, z) = graph_with_chain();
        assert!(graph.task(y).dependencies.contains(&x));
        assert!(graph.task(x).dependents.contains(&y));
        assert!(graph.task(z).dependencies.contains(&y));
        assert!(graph.task(y).dependents.contains(&z));
    }

    #[test]
    fn missing_dependencies_are_created_released() {
        let mut graph = TaskGraph::new();
        let sum = graph.new_task(
            "sum-1",
            Some(Bytes::from_static(b"f")),
            &["a-1".to_owned(), "b-1".to_owned()],
        );
        assert_eq!(graph.len(), 3);
        let a = graph.id_of("a-1").expect("placeholder exists");
        assert_eq!(graph.task(a).state, TaskRunState::Released);
        assert!(graph.task(a).run_spec.is_none());
        assert!(graph.task(sum).dependencies.contains(&a));
    }

    #[test]
    fn new_task_is_idempotent_and_fills_run_spec() {
        let mut graph = TaskGraph::new();
        let first = graph.new_task("a-1", None, &[]);
        let second = graph.new_task("a-1", Some(Bytes::from_static(b"f")), &[]);
        assert_eq!(first, second);
        assert_eq!(graph.len(), 1);
        assert!(graph.task(first).run_spec.is_some());
    }

    #[test]
    fn prefixes_and_groups_are_registered() {
        let mut graph = TaskGraph::new();
        let a0 = graph.new_task("sum-part-0", None, &[]);
        let a1 = graph.new_task("sum-part-1", None, &[]);
        assert_eq!(graph.task(a0).group, graph.task(a1).group);
        assert_eq!(graph.task(a0).prefix, graph.task(a1).prefix);
        assert_eq!(graph.group(graph.task(a0).group).name, "sum-part");
        assert_eq!(graph.prefix(graph.task(a0).prefix).name, "sum");
        assert_eq!(
            graph
                .group(graph.task(a0).group)
                .states
                .get(TaskRunState::Released),
            2
        );
    }

    #[test]
    fn set_state_keeps_histograms_in_step() {
        let (mut graph, x, _, _) = graph_with_chain();
        let prefix = graph.task(x).prefix;
        let old = graph.set_state(x, TaskRunState::Waiting);
        assert_eq!(old, TaskRunState::Released);
        assert_eq!(graph.prefix(prefix).states.get(TaskRunState::Waiting), 1);
        assert_eq!(graph.prefix(prefix).states.get(TaskRunState::Released), 0);
    }

    #[test]
    fn cull_removes_unreachable_tasks_only() {
        let (mut graph, _x, y, z) = graph_with_chain();
        let orphan = graph.new_task("orphan-1", None, &[]);
        let culled = graph.cull([z], |_| false);
        assert_eq!(culled, vec!["orphan-1".to_owned()]);
        assert!(graph.get(orphan).is_none());
        assert!(graph.get(y).is_some());
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn cull_respects_keep_predicate() {
        let (mut graph, _x, _y, z) = graph_with_chain();
        let _orphan = graph.new_task("orphan-1", None, &[]);
        let culled = graph.cull([z], |ts| ts.key.starts_with("orphan"));
        assert!(culled.is_empty());
        assert_eq!(graph.len(), 4);
    }

    #[test]
    fn forget_unlinks_and_removes_empty_groups() {
        let mut graph = TaskGraph::new();
        let a = graph.new_task("a-1", None, &[]);
        let b = graph.new_task("b-1", None, &["a-1".to_owned()]);
        graph.forget(b);
        assert!(graph.task(a).dependents.is_empty());
        assert!(graph.group_by_name.get("b").is_none());
        graph.forget(a);
        assert!(graph.is_empty());
        assert!(graph.group_by_name.is_empty());
    }

    #[test]
    fn nbytes_roll_up_into_prefix_and_group() {
        let (mut graph, x, _, _) = graph_with_chain();
        graph.set_nbytes(x, 100);
        graph.set_nbytes(x, 60);
        let ts = graph.task(x);
        assert_eq!(ts.nbytes, Some(60));
        assert_eq!(graph.prefix(ts.prefix).nbytes_total, 60);
        assert_eq!(graph.group(ts.group).nbytes_total, 60);
    }
}
