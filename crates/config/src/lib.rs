// SPDX-License-Identifier: Apache-2.0

//! GridFlow scheduler configuration.
//!
//! Data model:
//! - scheduler
//!   - task-duration model (defaults, unknown fallback)
//!   - lifecycle timers (idle timeout, worker TTL, event-log retention)
//!   - handler gates (blocked handlers, pickle)
//!   - rebalance thresholds
//!
//! Every key the scheduler core reads is represented here as a typed field
//! with a serde default, so an empty document deserializes to the stock
//! configuration. [`SchedulerConfig::validate`] performs the semantic checks
//! that cannot be expressed in the type system and accumulates every
//! violation into a single [`error::Error::InvalidConfiguration`].

use byte_unit::Byte;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub mod error;

use error::Error;

/// A worker address in canonical `proto://host:port` form.
pub type Address = String;

/// The measure of worker memory used to pick rebalance senders/recipients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryMeasure {
    /// Process RSS as reported by the worker.
    Process,
    /// Managed-in-memory plus stable unmanaged memory.
    #[default]
    Optimistic,
    /// Managed memory, in RAM or spilled.
    Managed,
    /// Managed memory currently held in RAM.
    ManagedInMemory,
}

/// Thresholds driving the rebalance algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RebalanceConfig {
    /// Which memory measure the thresholds below apply to.
    #[serde(default)]
    pub measure: MemoryMeasure,

    /// Fraction of the memory limit above which a worker may donate keys.
    #[serde(default = "default_sender_min")]
    pub sender_min: f64,

    /// Fraction of the memory limit below which a worker may receive keys.
    #[serde(default = "default_recipient_max")]
    pub recipient_max: f64,

    /// Minimum fraction gap between a sender and a recipient for a move to
    /// be worthwhile.
    #[serde(default = "default_sender_recipient_gap")]
    pub sender_recipient_gap: f64,
}

fn default_sender_min() -> f64 {
    0.30
}

fn default_recipient_max() -> f64 {
    0.60
}

fn default_sender_recipient_gap() -> f64 {
    0.10
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            measure: MemoryMeasure::default(),
            sender_min: default_sender_min(),
            recipient_max: default_recipient_max(),
            sender_recipient_gap: default_sender_recipient_gap(),
        }
    }
}

/// The full configuration surface read by the scheduler core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Estimated network bandwidth between workers, used to price dependency
    /// transfers during placement. Accepts `byte-unit` strings ("100 MB").
    #[serde(default = "default_bandwidth")]
    pub bandwidth: Byte,

    /// How many times a task may appear to kill a worker before it is marked
    /// erred with a killed-worker failure.
    #[serde(default = "default_allowed_failures")]
    pub allowed_failures: u32,

    /// Whether the work-stealing extension is loaded (the extension itself
    /// lives outside the core).
    #[serde(default = "default_true")]
    pub work_stealing: bool,

    /// How long a disconnected client's event log is retained before it is
    /// dropped.
    #[serde(default = "default_events_cleanup_delay", with = "humantime_serde")]
    pub events_cleanup_delay: Duration,

    /// Maximum number of retained events per topic.
    #[serde(default = "default_events_log_length")]
    pub events_log_length: usize,

    /// Duration estimates for task prefixes that have not been observed yet.
    #[serde(default, with = "duration_map")]
    pub default_task_durations: HashMap<String, Duration>,

    /// Duration estimate for prefixes with neither an observation nor a
    /// configured default.
    #[serde(default = "default_unknown_task_duration", with = "humantime_serde")]
    pub unknown_task_duration: Duration,

    /// Shut down once the scheduler has been idle for this long. `None`
    /// disables the idle timer.
    #[serde(default, with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,

    /// Remove workers that have not heartbeated for this long. `None`
    /// disables the liveness sweep.
    #[serde(default = "default_worker_ttl", with = "humantime_serde")]
    pub worker_ttl: Option<Duration>,

    /// Ingress operations that are rejected without mutating state.
    #[serde(default)]
    pub blocked_handlers: Vec<String>,

    /// When false, inbound opaque callables for run-on-scheduler are
    /// rejected.
    #[serde(default = "default_true")]
    pub pickle: bool,

    /// Abort a transition batch once this many transitions ran in a single
    /// scheduler lifetime. `None` (the production default) disables the
    /// guard; tests enable it to catch runaway recommendation loops.
    #[serde(default)]
    pub transition_counter_max: Option<u64>,

    /// Rebalance thresholds.
    #[serde(default)]
    pub rebalance: RebalanceConfig,
}

fn default_bandwidth() -> Byte {
    Byte::from_u64(100_000_000)
}

fn default_allowed_failures() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_events_cleanup_delay() -> Duration {
    Duration::from_secs(3600)
}

fn default_events_log_length() -> usize {
    100_000
}

fn default_unknown_task_duration() -> Duration {
    Duration::from_millis(500)
}

fn default_worker_ttl() -> Option<Duration> {
    Some(Duration::from_secs(300))
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            bandwidth: default_bandwidth(),
            allowed_failures: default_allowed_failures(),
            work_stealing: true,
            events_cleanup_delay: default_events_cleanup_delay(),
            events_log_length: default_events_log_length(),
            default_task_durations: HashMap::new(),
            unknown_task_duration: default_unknown_task_duration(),
            idle_timeout: None,
            worker_ttl: default_worker_ttl(),
            blocked_handlers: Vec::new(),
            pickle: true,
            transition_counter_max: None,
            rebalance: RebalanceConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Parses a configuration from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::DeserializationError {
                format: "JSON".to_owned(),
                details: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Bandwidth in bytes per second.
    #[must_use]
    pub fn bandwidth_bytes(&self) -> u64 {
        self.bandwidth.as_u64()
    }

    /// Performs the semantic checks that the type system cannot express.
    ///
    /// All violations are accumulated; the result carries every error found,
    /// not just the first.
    pub fn validate(&self) -> Result<(), Error> {
        let mut errors = Vec::new();

        if self.bandwidth.as_u64() == 0 {
            errors.push(Error::ZeroBandwidth);
        }
        for (key, value) in [
            ("rebalance.sender-min", self.rebalance.sender_min),
            ("rebalance.recipient-max", self.rebalance.recipient_max),
            (
                "rebalance.sender-recipient-gap",
                self.rebalance.sender_recipient_gap,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                errors.push(Error::FractionOutOfRange {
                    key: key.to_owned(),
                    value,
                });
            }
        }
        if self.rebalance.sender_min > self.rebalance.recipient_max {
            errors.push(Error::RebalanceThresholds {
                sender_min: self.rebalance.sender_min,
                recipient_max: self.rebalance.recipient_max,
            });
        }
        for (prefix, duration) in &self.default_task_durations {
            if duration.is_zero() {
                errors.push(Error::ZeroTaskDuration {
                    prefix: prefix.clone(),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidConfiguration { errors })
        }
    }
}

/// Serde adapter for maps of humantime duration strings
/// (`{"inc": "10ms"}`).
mod duration_map {
    use serde::de::{self, Deserializer};
    use serde::ser::{SerializeMap, Serializer};
    use std::collections::HashMap;
    use std::time::Duration;

    pub(crate) fn serialize<S>(
        map: &HashMap<String, Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (key, value) in map {
            out.serialize_entry(key, &humantime::format_duration(*value).to_string())?;
        }
        out.end()
    }

    pub(crate) fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<HashMap<String, Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: HashMap<String, String> = serde::Deserialize::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(key, value)| {
                humantime::parse_duration(&value)
                    .map(|duration| (key, duration))
                    .map_err(de::Error::custom)
            })
            .collect()
    }
}
