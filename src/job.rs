//! Public job submission types: the outcome a job reports, the result a caller receives, and
//! the instance identity used throughout the coordination layer.

use std::fmt;

use rand::RngCore;

/// Tokens actually consumed by one job, broken down by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    /// input/prompt tokens
    pub input: u64,
    /// output/completion tokens
    pub output: u64,
    /// tokens served from a cache, billed separately from input
    pub cached: u64,
}

impl Usage {
    /// Total tokens across all three kinds, the figure reconciled against TPM/TPD.
    pub fn total_tokens(&self) -> u64 {
        self.input + self.output + self.cached
    }
}

/// What a job callback reports once it has actually run.
#[derive(Debug, Clone, Copy, Default)]
pub struct Outcome {
    /// actual number of provider requests this job made
    pub request_count: u64,
    /// actual token usage
    pub usage: Usage,
}

/// The result returned from [`crate::Scheduler::queue_job`] on success.
#[derive(Debug, Clone)]
pub struct JobResult {
    /// the model that ultimately admitted and ran the job
    pub model_used: String,
    /// actual request count reported by the job
    pub request_count: u64,
    /// actual usage reported by the job
    pub usage: Usage,
    /// wall-clock time the job started running, in epoch milliseconds
    pub started_at: u64,
    /// wall-clock time the job finished, in epoch milliseconds
    pub completed_at: u64,
    /// every model attempted before (and including) the one that admitted the job
    pub models_tried: Vec<String>,
}

/// Why an `onAvailableSlotsChange` notification fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotChangeReason {
    /// a local event: a release, a ratio adjustment, a memory recalculation
    Local,
    /// a distributed pool reallocation received from the coordinator
    Distributed,
    /// a window rolled over, implicitly freeing capacity
    WindowReset,
}

impl fmt::Display for SlotChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SlotChangeReason::Local => "local",
            SlotChangeReason::Distributed => "distributed",
            SlotChangeReason::WindowReset => "window-reset",
        };
        f.write_str(s)
    }
}

/// A stable identity for one running scheduler process, used to register with the backend and
/// to tag its heartbeats.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceId(String);

impl InstanceId {
    /// Generate a new random instance id, formatted `inst-<8 hex chars>`.
    pub fn generate() -> Self {
        let n = rand::thread_rng().next_u32();
        Self(format!("inst-{n:08x}"))
    }

    /// The id as a plain string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
