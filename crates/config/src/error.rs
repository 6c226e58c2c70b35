// SPDX-License-Identifier: Apache-2.0

//! Errors for the config crate.

use miette::Diagnostic;

/// Errors that can occur while parsing or validating a scheduler
/// configuration.
#[derive(thiserror::Error, Debug, Diagnostic)]
pub enum Error {
    /// A collection of errors that occurred during validation.
    #[error("Invalid configuration: {errors:?}")]
    #[diagnostic(code(gridflow::config::invalid_configuration))]
    InvalidConfiguration {
        /// A list of errors that occurred during validation.
        #[related]
        errors: Vec<Error>,
    },

    /// An error that occurred while deserializing a configuration document.
    #[error("{format} deserialization error: {details}")]
    #[diagnostic(code(gridflow::config::deserialization_error))]
    DeserializationError {
        /// The format of the configuration document (e.g. "JSON").
        format: String,
        /// A description of the error that occurred.
        details: String,
    },

    /// The configured bandwidth is zero, which would make every transfer
    /// cost infinite.
    #[error("`bandwidth` must be greater than zero")]
    #[diagnostic(code(gridflow::config::zero_bandwidth))]
    ZeroBandwidth,

    /// A memory fraction is outside the `[0, 1]` interval.
    #[error("`{key}` must lie in [0, 1], got {value}")]
    #[diagnostic(code(gridflow::config::fraction_out_of_range))]
    FractionOutOfRange {
        /// The configuration key holding the offending value.
        key: String,
        /// The offending value.
        value: f64,
    },

    /// The rebalance sender threshold exceeds the recipient threshold, so no
    /// worker could ever be both below `recipient-max` and above
    /// `sender-min`.
    #[error("`rebalance.sender-min` ({sender_min}) must not exceed `rebalance.recipient-max` ({recipient_max})")]
    #[diagnostic(code(gridflow::config::rebalance_thresholds))]
    RebalanceThresholds {
        /// The configured sender threshold.
        sender_min: f64,
        /// The configured recipient threshold.
        recipient_max: f64,
    },

    /// A configured default task duration is zero.
    #[error("`default-task-durations` entry `{prefix}` must be non-zero")]
    #[diagnostic(code(gridflow::config::zero_task_duration))]
    ZeroTaskDuration {
        /// The task prefix with the zero duration.
        prefix: String,
    },
}
