//! Error types surfaced across the crate.

use std::fmt;

/// Fatal errors raised while constructing a [`crate::Scheduler`].
///
/// These are always construction-time mistakes in a [`crate::config::SchedulerConfig`];
/// a running scheduler never returns one.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `models` was empty.
    #[error("at least one model must be configured")]
    NoModels,

    /// `escalationOrder` named a model id that isn't in `models`.
    #[error("escalation order references unknown model `{0}`")]
    UnknownEscalationModel(String),

    /// more than one model is configured but no escalation order was given.
    #[error("escalation order is required when more than one model is configured")]
    MissingEscalationOrder,

    /// a memory policy was configured but no model declared `estimated_used_memory_kb`.
    #[error("memory policy configured but no model declares estimated_used_memory_kb")]
    MemoryPolicyWithoutEstimate,

    /// a rate-limit dimension (rpm/tpm/rpd/tpd) is set on a model without a matching
    /// per-job-type or global resource estimate.
    #[error("model `{model}` sets {dimension} but no matching estimate is configured")]
    MissingEstimateForDimension {
        /// offending model id
        model: String,
        /// the dimension requiring an estimate
        dimension: &'static str,
    },

    /// a job type's ratio configuration is invalid (e.g. outside `[0, 1]`).
    #[error("job type `{job_type}` has an invalid ratio: {reason}")]
    InvalidRatio {
        /// offending job type id
        job_type: String,
        /// human-readable reason
        reason: &'static str,
    },
}

/// Errors surfaced to the caller of [`crate::Scheduler::queue_job`].
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// every model in the escalation order rejected (or timed out on) the job.
    #[error("All models rejected by backend")]
    AdmissionRejected {
        /// models attempted, in escalation order
        models_tried: Vec<String>,
    },

    /// the user-supplied job callback returned an error.
    #[error("job execution failed: {0}")]
    JobExecution(String),

    /// `job_type_id` was given but isn't a configured job type.
    #[error("unknown job type `{0}`")]
    UnknownJobType(String),
}

/// A resource dimension, used in [`crate::OverageEvent`] and config errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// requests per minute
    RequestsPerMinute,
    /// tokens per minute
    TokensPerMinute,
    /// requests per day
    RequestsPerDay,
    /// tokens per day
    TokensPerDay,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::RequestsPerMinute => "requests_per_minute",
            ResourceKind::TokensPerMinute => "tokens_per_minute",
            ResourceKind::RequestsPerDay => "requests_per_day",
            ResourceKind::TokensPerDay => "tokens_per_day",
        };
        f.write_str(s)
    }
}
