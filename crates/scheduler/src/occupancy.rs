// SPDX-License-Identifier: Apache-2.0

//! The duration model behind placement and adaptive sizing.
//!
//! Each task prefix carries an exponentially weighted moving average of
//! observed compute durations. Until the first observation arrives the
//! estimator falls back to the configured per-prefix default, then to the
//! global unknown-task duration; tasks priced by a fallback are remembered
//! so the first real observation can re-price them all at once.

use crate::graph::TaskGraph;
use crate::task::{PrefixId, TaskId};
use gridflow_config::SchedulerConfig;
use std::collections::{HashMap, HashSet};

/// Smoothing factor of the duration EWMA: equal weight to the history and
/// the newest sample.
const EWMA_ALPHA: f64 = 0.5;

/// Estimates task durations and tracks which estimates were guesses.
#[derive(Debug)]
pub struct DurationEstimator {
    defaults: HashMap<String, f64>,
    unknown_duration: f64,
    unknown_durations: HashMap<PrefixId, HashSet<TaskId>>,
}

impl DurationEstimator {
    /// Builds the estimator from the configured duration defaults.
    #[must_use]
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            defaults: config
                .default_task_durations
                .iter()
                .map(|(prefix, duration)| (prefix.clone(), duration.as_secs_f64()))
                .collect(),
            unknown_duration: config.unknown_task_duration.as_secs_f64(),
            unknown_durations: HashMap::new(),
        }
    }

    /// The estimated duration of `task`, in seconds.
    ///
    /// When neither an observation nor a configured default exists the
    /// task is recorded into the unknown-durations set of its prefix, so
    /// that the first observation can be broadcast to all pending tasks of
    /// that prefix.
    pub fn estimate(&mut self, graph: &TaskGraph, task: TaskId) -> f64 {
        let prefix_id = graph.task(task).prefix;
        let prefix = graph.prefix(prefix_id);
        if let Some(average) = prefix.duration_average {
            return average;
        }
        let _ = self
            .unknown_durations
            .entry(prefix_id)
            .or_default()
            .insert(task);
        self.defaults
            .get(&prefix.name)
            .copied()
            .unwrap_or(self.unknown_duration)
    }

    /// Records an observed duration for `task`, updating the prefix EWMA
    /// and the group total.
    ///
    /// Returns the other tasks of the prefix that had been priced by a
    /// fallback; the caller re-prices them on their workers.
    pub fn observe(&mut self, graph: &mut TaskGraph, task: TaskId, duration: f64) -> Vec<TaskId> {
        let (prefix_id, group_id) = {
            let ts = graph.task(task);
            (ts.prefix, ts.group)
        };
        let prefix = graph.prefix_mut(prefix_id);
        prefix.duration_average = Some(match prefix.duration_average {
            Some(average) => EWMA_ALPHA * duration + (1.0 - EWMA_ALPHA) * average,
            None => duration,
        });
        graph.group_mut(group_id).duration_total += duration;

        match self.unknown_durations.remove(&prefix_id) {
            Some(mut stale) => {
                let _ = stale.remove(&task);
                stale.into_iter().collect()
            }
            None => Vec::new(),
        }
    }

    /// Scrubs a task from the unknown-durations bookkeeping.
    pub fn forget_task(&mut self, graph: &TaskGraph, task: TaskId) {
        let prefix = graph.task(task).prefix;
        if let Some(stale) = self.unknown_durations.get_mut(&prefix) {
            let _ = stale.remove(&task);
            if stale.is_empty() {
                let _ = self.unknown_durations.remove(&prefix);
            }
        }
    }

    /// Number of prefixes currently priced by a fallback.
    #[must_use]
    pub fn unknown_prefixes(&self) -> usize {
        self.unknown_durations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn config_with_default(prefix: &str, duration: Duration) -> SchedulerConfig {
        let mut config = SchedulerConfig::default();
        let _ = config
            .default_task_durations
            .insert(prefix.to_owned(), duration);
        config
    }

    #[test]
    fn falls_back_to_configured_default_then_unknown() {
        let config = config_with_default("slowinc", Duration::from_secs(10));
        let mut estimator = DurationEstimator::new(&config);
        let mut graph = TaskGraph::new();
        let slow = graph.new_task("slowinc-1", None, &[]);
        let other = graph.new_task("inc-1", None, &[]);

        assert_eq!(estimator.estimate(&graph, slow), 10.0);
        assert_eq!(estimator.estimate(&graph, other), 0.5);
        assert_eq!(estimator.unknown_prefixes(), 2);
    }

    #[test]
    fn first_observation_clears_the_unknown_set() {
        let config = SchedulerConfig::default();
        let mut estimator = DurationEstimator::new(&config);
        let mut graph = TaskGraph::new();
        let a = graph.new_task("inc-a", None, &[]);
        let b = graph.new_task("inc-b", None, &[]);
        let _ = estimator.estimate(&graph, a);
        let _ = estimator.estimate(&graph, b);

        let stale = estimator.observe(&mut graph, a, 2.0);
        assert_eq!(stale, vec![b]);
        assert_eq!(estimator.unknown_prefixes(), 0);
        assert_eq!(estimator.estimate(&graph, b), 2.0);
        // The estimate above came from the EWMA, so nothing was re-recorded
        // as unknown.
        assert_eq!(estimator.unknown_prefixes(), 0);
    }

    #[test]
    fn observations_are_smoothed() {
        let config = SchedulerConfig::default();
        let mut estimator = DurationEstimator::new(&config);
        let mut graph = TaskGraph::new();
        let a = graph.new_task("inc-a", None, &[]);
        let _ = estimator.observe(&mut graph, a, 2.0);
        let _ = estimator.observe(&mut graph, a, 4.0);
        assert_eq!(estimator.estimate(&graph, a), 3.0);
        let prefix = graph.task(a).prefix;
        assert_eq!(graph.prefix(prefix).duration_average, Some(3.0));
        assert_eq!(graph.group(graph.task(a).group).duration_total, 6.0);
    }

    #[test]
    fn forget_task_drops_unknown_bookkeeping() {
        let config = SchedulerConfig::default();
        let mut estimator = DurationEstimator::new(&config);
        let mut graph = TaskGraph::new();
        let a = graph.new_task("inc-a", None, &[]);
        let _ = estimator.estimate(&graph, a);
        assert_eq!(estimator.unknown_prefixes(), 1);
        estimator.forget_task(&graph, a);
        assert_eq!(estimator.unknown_prefixes(), 0);
    }
}
