//! Instance registration, heartbeat and pool-reallocation plumbing (component H).
//!
//! On every reallocation it applies the new limits to each [`ModelLimiter`], then replays
//! `try_reserve` against every (model, jobType) wait queue so anything blocked on capacity gets
//! a chance to proceed without waiting for its own next poll (spec §4.8: "wakes WaitQueues").

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::admission::AdmissionCore;
use crate::backend::{AllocationInfo, Backend, Unsubscribe};
use crate::config::{JobTypeConfig, ModelConfig};
use crate::job::{InstanceId, SlotChangeReason};
use crate::job_type::{estimate_inputs, PoolInputs};
use crate::model_limiter::{ModelLimiter, ReserveEstimate};

/// Invoked after a pool reallocation has been applied and waiters re-probed, so the caller can
/// react (e.g. surface the event to its own subscribers). Mirrors spec §6.3's
/// `onAvailableSlotsChange`.
pub type SlotChangeCallback = Box<dyn Fn(SlotChangeReason) + Send + Sync>;

/// Coordinates this instance's membership and pool allocation with the backend.
pub struct Coordinator {
    instance_id: InstanceId,
    backend: Arc<dyn Backend>,
    model_limiters: Arc<HashMap<String, Arc<ModelLimiter>>>,
    model_configs: Arc<HashMap<String, ModelConfig>>,
    job_types: Arc<HashMap<String, JobTypeConfig>>,
    admission: Arc<AdmissionCore>,
    allocation: Arc<RwLock<AllocationInfo>>,
    unsubscribe: std::sync::Mutex<Option<Unsubscribe>>,
    on_slots_changed: Arc<SlotChangeCallback>,
    heartbeat_timeout_ms: u64,
}

impl Coordinator {
    /// Build a coordinator. Does not contact the backend until [`Coordinator::start`] is called.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance_id: InstanceId,
        backend: Arc<dyn Backend>,
        model_limiters: Arc<HashMap<String, Arc<ModelLimiter>>>,
        model_configs: Arc<HashMap<String, ModelConfig>>,
        job_types: Arc<HashMap<String, JobTypeConfig>>,
        admission: Arc<AdmissionCore>,
        on_slots_changed: SlotChangeCallback,
        heartbeat_timeout_ms: u64,
    ) -> Self {
        Self {
            instance_id,
            backend,
            model_limiters,
            model_configs,
            job_types,
            admission,
            allocation: Arc::new(RwLock::new(AllocationInfo::default())),
            unsubscribe: std::sync::Mutex::new(None),
            on_slots_changed: Arc::new(on_slots_changed),
            heartbeat_timeout_ms,
        }
    }

    /// This instance's id.
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Register with the backend, apply the initial allocation, and subscribe to future
    /// reallocations.
    pub async fn start(&self) {
        let info = self
            .backend
            .register(&self.instance_id, self.heartbeat_timeout_ms)
            .await;
        info!(instance = %self.instance_id, instance_count = info.instance_count, "registered with backend");
        self.apply(info);

        let model_limiters = self.model_limiters.clone();
        let model_configs = self.model_configs.clone();
        let job_types = self.job_types.clone();
        let admission = self.admission.clone();
        let allocation = self.allocation.clone();
        let on_slots_changed = self.on_slots_changed.clone();

        let unsubscribe = self
            .backend
            .subscribe(
                &self.instance_id,
                Box::new(move |info: AllocationInfo| {
                    info!(instance_count = info.instance_count, "pool reallocated");
                    apply_allocation(&model_limiters, &info);
                    *allocation.write().expect("allocation lock poisoned") = info.clone();

                    let model_limiters = model_limiters.clone();
                    let model_configs = model_configs.clone();
                    let job_types = job_types.clone();
                    let admission = admission.clone();
                    let on_slots_changed = on_slots_changed.clone();
                    tokio::spawn(async move {
                        wake_all(&model_limiters, &model_configs, &job_types, &admission, &info).await;
                        (on_slots_changed)(SlotChangeReason::Distributed);
                    });
                }),
            )
            .await;
        *self.unsubscribe.lock().expect("unsubscribe lock poisoned") = Some(unsubscribe);
    }

    /// Renew this instance's membership. Call every `heartbeat_interval_ms`.
    pub async fn heartbeat_tick(&self) {
        let info = self
            .backend
            .register(&self.instance_id, self.heartbeat_timeout_ms)
            .await;
        self.apply(info);
    }

    /// Re-probe every wait queue and fire `on_slots_changed` with `reason`, without waiting for
    /// a backend-pushed reallocation. Used for local-only events (a release, a ratio
    /// adjustment) and for window rollovers, both of which free capacity no subscription push
    /// observes.
    pub(crate) async fn wake_and_notify(&self, reason: SlotChangeReason) {
        let allocation = self.allocation.read().expect("allocation lock poisoned").clone();
        wake_all(&self.model_limiters, &self.model_configs, &self.job_types, &self.admission, &allocation).await;
        (self.on_slots_changed)(reason);
    }

    /// Leave the backend's coordinated pool and drop the reallocation subscription.
    pub async fn stop(&self) {
        if let Some(unsub) = self.unsubscribe.lock().expect("unsubscribe lock poisoned").take() {
            unsub();
        }
        self.backend.unregister(&self.instance_id).await;
        info!(instance = %self.instance_id, "unregistered from backend");
    }

    /// The last-received allocation (spec §6.3 `getAllocation()`).
    pub fn allocation(&self) -> AllocationInfo {
        self.allocation.read().expect("allocation lock poisoned").clone()
    }

    /// Build [`PoolInputs`] for `model_id`: the coordinated pool if one has been received, else
    /// the model's raw configured quota (single-instance fallback).
    pub fn pool_inputs(&self, model_id: &str, model: &ModelConfig) -> PoolInputs {
        let allocation = self.allocation.read().expect("allocation lock poisoned");
        pool_inputs_from(&self.model_limiters, model_id, model, &allocation)
    }

    fn apply(&self, info: AllocationInfo) {
        apply_allocation(&self.model_limiters, &info);
        *self.allocation.write().expect("allocation lock poisoned") = info;
    }
}

fn apply_allocation(model_limiters: &HashMap<String, Arc<ModelLimiter>>, info: &AllocationInfo) {
    for (model_id, pool) in &info.pools {
        if let Some(limiter) = model_limiters.get(model_id) {
            limiter.set_limits(
                pool.requests_per_minute,
                pool.tokens_per_minute,
                pool.requests_per_day,
                pool.tokens_per_day,
                pool.total_slots,
            );
        }
    }
}

fn pool_inputs_from(
    model_limiters: &HashMap<String, Arc<ModelLimiter>>,
    model_id: &str,
    model: &ModelConfig,
    allocation: &AllocationInfo,
) -> PoolInputs {
    let memory_kb = model_limiters.get(model_id).and_then(|l| l.memory_allowed_kb());
    match allocation.pools.get(model_id) {
        Some(pool) => PoolInputs {
            tokens_per_minute: pool.tokens_per_minute,
            requests_per_minute: pool.requests_per_minute,
            total_slots: pool.total_slots,
            local_memory_budget_kb: memory_kb,
        },
        None => PoolInputs {
            tokens_per_minute: model.tokens_per_minute,
            requests_per_minute: model.requests_per_minute,
            total_slots: model.max_concurrent_requests,
            local_memory_budget_kb: memory_kb,
        },
    }
}

/// Re-probe every (model, jobType) wait queue against the freshly applied allocation, admitting
/// whatever now fits in strict FIFO order.
async fn wake_all(
    model_limiters: &HashMap<String, Arc<ModelLimiter>>,
    model_configs: &HashMap<String, ModelConfig>,
    job_types: &HashMap<String, JobTypeConfig>,
    admission: &Arc<AdmissionCore>,
    allocation: &AllocationInfo,
) {
    for (model_id, model_config) in model_configs {
        let Some(model_limiter) = model_limiters.get(model_id) else {
            continue;
        };
        let pool = pool_inputs_from(model_limiters, model_id, model_config, allocation);

        for job_type_id in job_types.keys() {
            let estimate = estimate_inputs(job_types, job_type_id, model_id, model_config);
            let reserve_estimate = ReserveEstimate {
                requests: estimate.estimated_requests,
                tokens: estimate.estimated_tokens,
                memory_kb: estimate.estimated_memory_kb,
            };
            let queue = admission.wait_queue_for(model_id, job_type_id);
            let admission = admission.clone();
            let model_limiter = model_limiter.clone();
            let model_id = model_id.clone();
            let job_type_id = job_type_id.clone();

            queue
                .notify_capacity_available(move || {
                    admission
                        .try_reserve(
                            &model_id,
                            &job_type_id,
                            &model_limiter,
                            &pool,
                            &estimate,
                            reserve_estimate,
                        )
                        .ok()
                })
                .await;
        }
    }
}
