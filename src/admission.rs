//! Two-layer admission: a per-(model, jobType) local slot check, then the model's global
//! reservation.
//!
//! Layer 1 is cheap and purely local — it exists so one noisy job type can't starve its
//! siblings on the same model even when the model as a whole has spare capacity. Layer 2 is
//! the actual provider-quota enforcement, shared (via the backend) across every instance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;

use crate::job_type::{EstimateInputs, JobTypeAllocator, Load, PoolInputs};
use crate::model_limiter::{Blocker, ModelLimiter, OverageEvent, ReserveEstimate};
use crate::wait_queue::WaitQueue;
use crate::window::{now_ms, WindowCounter, MINUTE_MS};

/// A successful admission, held for the job's duration and released via
/// [`AdmissionCore::release`].
pub struct AdmissionReservation {
    inner: crate::model_limiter::Reservation,
    model_id: String,
    job_type: String,
    rate_based: bool,
}

/// Local per-(model, jobType) bookkeeping used only for the layer-1 slot check.
struct LocalState {
    /// used when the winning dimension was concurrency-based
    in_flight: AtomicU64,
    /// used when the winning dimension was rate-based; a per-minute accounting counter, not
    /// itself a limit (its `limit` is always `None`)
    window: AsyncMutex<WindowCounter>,
}

impl LocalState {
    fn new() -> Self {
        Self {
            in_flight: AtomicU64::new(0),
            window: AsyncMutex::new(WindowCounter::new(MINUTE_MS, None)),
        }
    }
}

/// Translates a model pool plus job-type ratios into per-(model, jobType) admission decisions.
pub struct AdmissionCore {
    pub(crate) allocator: JobTypeAllocator,
    local: DashMap<(String, String), LocalState>,
    wait_queues: DashMap<(String, String), Arc<WaitQueue<AdmissionReservation>>>,
}

impl AdmissionCore {
    /// Build an admission core around a job-type allocator.
    pub fn new(allocator: JobTypeAllocator) -> Self {
        Self {
            allocator,
            local: DashMap::new(),
            wait_queues: DashMap::new(),
        }
    }

    /// The per-(model, jobType) wait queue, created lazily on first access.
    pub fn wait_queue_for(&self, model_id: &str, job_type: &str) -> Arc<WaitQueue<AdmissionReservation>> {
        self.wait_queues
            .entry((model_id.to_string(), job_type.to_string()))
            .or_insert_with(|| Arc::new(WaitQueue::new()))
            .clone()
    }

    /// Try to admit one job against `model_id`/`job_type`, synchronously. `None` means layer 1
    /// rejected (the job type's local slot is exhausted); `Some(Err(_))` means layer 2 (the
    /// model's global reservation) rejected, naming the blocking dimension.
    pub fn try_reserve(
        &self,
        model_id: &str,
        job_type: &str,
        model_limiter: &ModelLimiter,
        pool: &PoolInputs,
        estimate: &EstimateInputs,
        reserve_estimate: ReserveEstimate,
    ) -> Result<AdmissionReservation, Option<Blocker>> {
        let allocation = self.allocator.slots_for(job_type, pool, estimate);
        let key = (model_id.to_string(), job_type.to_string());
        let local = self.local.entry(key).or_insert_with(LocalState::new);

        let now = now_ms();
        let allocated = allocation.slots.unwrap_or(u64::MAX);

        let local_in_flight = if allocation.rate_based {
            local
                .window
                .try_lock()
                .map(|mut w| w.stats(now).current)
                .unwrap_or(u64::MAX)
        } else {
            local.in_flight.load(Ordering::SeqCst)
        };

        if local_in_flight >= allocated {
            return Err(None);
        }

        let reservation = model_limiter
            .try_reserve(reserve_estimate)
            .map_err(Some)?;

        if allocation.rate_based {
            if let Ok(mut w) = local.window.try_lock() {
                w.increment(now);
            }
        } else {
            local.in_flight.fetch_add(1, Ordering::SeqCst);
        }

        Ok(AdmissionReservation {
            inner: reservation,
            model_id: model_id.to_string(),
            job_type: job_type.to_string(),
            rate_based: allocation.rate_based,
        })
    }

    /// Release a reservation: decrements the local in-flight counter (never the window
    /// counter — that only ever resets via time) and reconciles the model-level counters.
    pub fn release(
        &self,
        model_limiter: &ModelLimiter,
        reservation: AdmissionReservation,
        actual: Option<crate::model_limiter::Actual>,
    ) -> Vec<OverageEvent> {
        if !reservation.rate_based {
            let key = (reservation.model_id.clone(), reservation.job_type.clone());
            if let Some(local) = self.local.get(&key) {
                local.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        }
        model_limiter.release(
            reservation.inner,
            actual,
            &reservation.model_id,
            &reservation.job_type,
        )
    }

    /// Current in-flight / allocated load for every known (model, jobType) pair, keyed by
    /// job type, aggregated across models — the input to
    /// [`JobTypeAllocator::adjust_ratios`].
    pub fn loads_by_job_type(
        &self,
        pools: &HashMap<String, PoolInputs>,
        estimates: &HashMap<(String, String), EstimateInputs>,
    ) -> HashMap<String, Load> {
        let mut loads: HashMap<String, Load> = HashMap::new();

        for entry in self.local.iter() {
            let (model_id, job_type) = entry.key().clone();
            let Some(pool) = pools.get(&model_id) else {
                continue;
            };
            let Some(estimate) = estimates.get(&(model_id.clone(), job_type.clone())) else {
                continue;
            };
            let allocation = self.allocator.slots_for(&job_type, pool, estimate);
            let in_flight = entry.in_flight.load(Ordering::SeqCst);

            let agg = loads.entry(job_type.clone()).or_insert(Load {
                in_flight: 0,
                allocated: Some(0),
            });
            agg.in_flight += in_flight;
            agg.allocated = match (agg.allocated, allocation.slots) {
                (Some(a), Some(b)) => Some(a + b),
                _ => None,
            };
        }

        loads
    }

    /// Drain every wait queue, resolving pending waiters as rejected. Used on shutdown.
    pub async fn stop(&self) {
        for entry in self.wait_queues.iter() {
            entry.value().clear().await;
        }
    }
}

impl AdmissionReservation {
    /// The model this reservation was admitted against.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// The job type this reservation was admitted for.
    pub fn job_type(&self) -> &str {
        &self.job_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::config::ResourceEstimate;

    fn model_cfg() -> ModelConfig {
        ModelConfig {
            requests_per_minute: Some(100),
            tokens_per_minute: Some(1_000),
            requests_per_day: None,
            tokens_per_day: None,
            max_concurrent_requests: None,
            default_estimate: ResourceEstimate {
                estimated_number_of_requests: 1,
                estimated_used_tokens: 10,
                estimated_used_memory_kb: None,
            },
        }
    }

    #[test]
    fn layer1_blocks_before_touching_the_model() {
        let allocator = JobTypeAllocator::new(&[], Default::default()).unwrap();
        let core = AdmissionCore::new(allocator);
        let model_limiter = ModelLimiter::new(&model_cfg(), None);

        let pool = PoolInputs {
            tokens_per_minute: Some(1_000),
            requests_per_minute: Some(100),
            total_slots: Some(0), // no concurrency share at all
            local_memory_budget_kb: None,
        };
        let estimate = EstimateInputs {
            estimated_tokens: 0,
            estimated_requests: 0,
            estimated_memory_kb: None,
        };

        let result = core.try_reserve(
            "alpha",
            "default",
            &model_limiter,
            &pool,
            &estimate,
            ReserveEstimate {
                requests: 1,
                tokens: 10,
                memory_kb: None,
            },
        );
        assert!(matches!(result, Err(None)));
        assert_eq!(model_limiter.in_flight(), 0, "model should never be touched");
    }

    #[test]
    fn successful_reservation_then_release_round_trips() {
        let allocator = JobTypeAllocator::new(&[], Default::default()).unwrap();
        let core = AdmissionCore::new(allocator);
        let model_limiter = ModelLimiter::new(&model_cfg(), None);

        let pool = PoolInputs {
            tokens_per_minute: Some(1_000),
            requests_per_minute: Some(100),
            total_slots: Some(10),
            local_memory_budget_kb: None,
        };
        let estimate = EstimateInputs {
            estimated_tokens: 10,
            estimated_requests: 1,
            estimated_memory_kb: None,
        };

        let reservation = core
            .try_reserve(
                "alpha",
                "default",
                &model_limiter,
                &pool,
                &estimate,
                ReserveEstimate {
                    requests: 1,
                    tokens: 10,
                    memory_kb: None,
                },
            )
            .unwrap();
        assert_eq!(model_limiter.in_flight(), 1);

        let overages = core.release(
            &model_limiter,
            reservation,
            Some(crate::model_limiter::Actual {
                requests: 1,
                tokens: 10,
            }),
        );
        assert!(overages.is_empty());
        assert_eq!(model_limiter.in_flight(), 0);
    }
}
