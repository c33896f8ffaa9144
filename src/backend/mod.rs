//! The coordination abstraction (spec §6.1): a key-value-store-with-pub/sub, abstracted as one
//! trait rather than split V1/V2 interfaces.
//!
//! `acquire`/`release` are the only methods every backend must implement — a bare,
//! single-instance deployment can get away with those two. `register`/`unregister`/`subscribe`
//! default to "no coordination": a single implicit instance, an empty pool map, and a no-op
//! subscription. A coordinated backend overrides them; [`memory::MemoryBackend`] does, and also
//! serves as the reference implementation and test harness.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::job::InstanceId;

/// The context for one admission attempt against the backend.
#[derive(Debug, Clone)]
pub struct AcquireContext {
    /// the model being reserved against
    pub model_id: String,
    /// the job type making the reservation
    pub job_type_id: String,
    /// estimated tokens this job will consume
    pub estimated_tokens: u64,
    /// estimated requests this job will consume
    pub estimated_requests: u64,
}

/// One model's distributed allocation for this instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelPool {
    /// concurrency slots allocated to this instance
    pub total_slots: Option<u64>,
    /// tokens-per-minute allocated to this instance
    pub tokens_per_minute: Option<u64>,
    /// requests-per-minute allocated to this instance
    pub requests_per_minute: Option<u64>,
    /// tokens-per-day allocated to this instance
    pub tokens_per_day: Option<u64>,
    /// requests-per-day allocated to this instance
    pub requests_per_day: Option<u64>,
}

/// The full distributed allocation snapshot handed to every subscriber.
#[derive(Debug, Clone, Default)]
pub struct AllocationInfo {
    /// number of live instances this allocation was computed over
    pub instance_count: u64,
    /// per-model pool, keyed by model id; a model absent here has received no coordinated
    /// allocation and falls back to its raw configured quota
    pub pools: HashMap<String, ModelPool>,
}

/// Invoked whenever the backend recomputes and publishes a new [`AllocationInfo`].
pub type AllocationCallback = Box<dyn Fn(AllocationInfo) + Send + Sync>;

/// Cancels a [`Backend::subscribe`] registration.
pub type Unsubscribe = Box<dyn FnOnce() + Send>;

/// The coordination backend: a shared counter store plus, for coordinated deployments, instance
/// bookkeeping and pool-change pub/sub.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Attempt to reserve `ctx`'s estimate against the backend's aggregate counters. Errors are
    /// treated as rejection (spec §7): an implementation should return `false` rather than
    /// propagate a transport error.
    async fn acquire(&self, ctx: &AcquireContext) -> bool;

    /// Undo a previous successful `acquire` for the same `ctx`. Errors are logged and
    /// swallowed — callers never see a release fail.
    async fn release(&self, ctx: &AcquireContext);

    /// Join the coordinated pool (or renew membership, on a heartbeat), returning the current
    /// allocation. `heartbeat_timeout_ms` is this instance's TTL: a coordinated backend should
    /// drop any peer whose own renewal falls silent for longer than the TTL it last announced.
    /// The default treats every instance as the sole instance: full configured quota, no
    /// division, no TTL tracking.
    async fn register(&self, _instance_id: &InstanceId, _heartbeat_timeout_ms: u64) -> AllocationInfo {
        AllocationInfo {
            instance_count: 1,
            pools: HashMap::new(),
        }
    }

    /// Leave the coordinated pool. The default is a no-op.
    async fn unregister(&self, _instance_id: &InstanceId) {}

    /// Subscribe to future allocation changes. The default never publishes, so the returned
    /// unsubscribe is a no-op.
    async fn subscribe(&self, _instance_id: &InstanceId, _on_update: AllocationCallback) -> Unsubscribe {
        Box::new(|| {})
    }
}
