// SPDX-License-Identifier: Apache-2.0

//! Worker memory accounting.
//!
//! [`MemoryState`] is a pure value type describing the memory of one worker
//! (or, summed field-wise, of the whole cluster). The constructor massages
//! its inputs so that every derived quantity is non-negative and the
//! identities below hold by construction for arbitrary inputs:
//!
//! - `managed_in_memory + unmanaged == process`
//! - `unmanaged_old + unmanaged_recent == unmanaged`
//! - `managed_in_memory + managed_spilled == managed`
//! - `optimistic + unmanaged_recent == process`
//!
//! `managed_spilled` is taken verbatim from the worker (bytes on disk as it
//! reports them), never derived; it does not count towards `process`.

use serde::Serialize;

/// Snapshot of a worker's memory, as assembled from its most recent
/// heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryState {
    process: u64,
    managed_in_memory: u64,
    managed_spilled: u64,
    unmanaged_old: u64,
}

impl MemoryState {
    /// Builds a snapshot from raw heartbeat numbers.
    ///
    /// `managed_in_memory` is clamped to `process` (the data store cannot
    /// hold more RAM than the process uses) and `unmanaged_old` is clamped
    /// to the resulting unmanaged total.
    #[must_use]
    pub fn new(
        process: u64,
        unmanaged_old: u64,
        managed_in_memory: u64,
        managed_spilled: u64,
    ) -> Self {
        let managed_in_memory = managed_in_memory.min(process);
        let unmanaged_old = unmanaged_old.min(process - managed_in_memory);
        Self {
            process,
            managed_in_memory,
            managed_spilled,
            unmanaged_old,
        }
    }

    /// Field-wise sum over any number of snapshots.
    #[must_use]
    pub fn sum<'a>(parts: impl IntoIterator<Item = &'a Self>) -> Self {
        let mut process = 0;
        let mut managed_in_memory = 0;
        let mut managed_spilled = 0;
        let mut unmanaged_old = 0;
        for part in parts {
            process += part.process;
            managed_in_memory += part.managed_in_memory;
            managed_spilled += part.managed_spilled;
            unmanaged_old += part.unmanaged_old;
        }
        Self::new(process, unmanaged_old, managed_in_memory, managed_spilled)
    }

    /// Process memory (RSS) as sampled by the worker.
    #[must_use]
    pub const fn process(&self) -> u64 {
        self.process
    }

    /// Bytes of the worker data store currently held in RAM.
    #[must_use]
    pub const fn managed_in_memory(&self) -> u64 {
        self.managed_in_memory
    }

    /// Bytes of the worker data store spilled to disk, as reported by the
    /// worker. Zero when the data store is not a spill buffer.
    #[must_use]
    pub const fn managed_spilled(&self) -> u64 {
        self.managed_spilled
    }

    /// All bytes tracked by the worker data store, in RAM or on disk.
    #[must_use]
    pub const fn managed(&self) -> u64 {
        self.managed_in_memory + self.managed_spilled
    }

    /// Process memory not accounted for by the data store.
    #[must_use]
    pub const fn unmanaged(&self) -> u64 {
        self.process - self.managed_in_memory
    }

    /// Unmanaged memory that has been stable for a while (module heaps,
    /// long-lived buffers). This portion is unlikely to be released by
    /// moving tasks around.
    #[must_use]
    pub const fn unmanaged_old(&self) -> u64 {
        self.unmanaged_old
    }

    /// Unmanaged memory that appeared recently (task heaps in flight,
    /// garbage not yet collected).
    #[must_use]
    pub const fn unmanaged_recent(&self) -> u64 {
        self.unmanaged() - self.unmanaged_old
    }

    /// The optimistic measure: managed RAM plus stable unmanaged memory.
    /// This is what rebalancing trusts by default, since recent unmanaged
    /// memory tends to evaporate.
    #[must_use]
    pub const fn optimistic(&self) -> u64 {
        self.managed_in_memory + self.unmanaged_old
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn derived_quantities() {
        let m = MemoryState::new(100, 15, 68, 12);
        assert_eq!(m.process(), 100);
        assert_eq!(m.managed(), 80);
        assert_eq!(m.managed_in_memory(), 68);
        assert_eq!(m.managed_spilled(), 12);
        assert_eq!(m.unmanaged(), 32);
        assert_eq!(m.unmanaged_old(), 15);
        assert_eq!(m.unmanaged_recent(), 17);
        assert_eq!(m.optimistic(), 83);
    }

    #[test]
    fn sum_is_field_wise() {
        let m1 = MemoryState::new(100, 15, 68, 12);
        let m2 = MemoryState::new(80, 10, 58, 2);
        let m3 = MemoryState::sum([&m1, &m2]);
        assert_eq!(m3.process(), 180);
        assert_eq!(m3.unmanaged_old(), 25);
        assert_eq!(m3.managed(), 140);
        assert_eq!(m3.managed_spilled(), 14);
    }

    /// Inputs are massaged by the constructor so that everything adds up
    /// by construction, for every combination of small inputs.
    #[test]
    fn adds_up_for_arbitrary_inputs() {
        for process in 0..4u64 {
            for unmanaged_old in 0..4u64 {
                for managed_in_memory in 0..4u64 {
                    for managed_spilled in 0..4u64 {
                        let m = MemoryState::new(
                            process,
                            unmanaged_old,
                            managed_in_memory,
                            managed_spilled,
                        );
                        assert_eq!(m.managed_in_memory() + m.unmanaged(), m.process());
                        assert_eq!(m.managed_in_memory() + m.managed_spilled(), m.managed());
                        assert_eq!(m.unmanaged_old() + m.unmanaged_recent(), m.unmanaged());
                        assert_eq!(m.optimistic() + m.unmanaged_recent(), m.process());
                    }
                }
            }
        }
    }

    #[test]
    fn default_is_empty() {
        let m = MemoryState::default();
        assert_eq!(m.process(), 0);
        assert_eq!(m.managed(), 0);
        assert_eq!(m.optimistic(), 0);
    }
}
