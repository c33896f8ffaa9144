//! Per-model aggregate of window counters, concurrency, memory and a wait queue.
//!
//! The whole-model admission check happens under one `std::sync::Mutex` — the "single mutex
//! per model-limiter" variant of the concurrency model in spec §5 — so that a reservation's
//! concurrency bump and its four counter bumps are applied atomically as one unit, the way the
//! teacher's `Limiter::record_reading` atomically swaps a single `AtomicUsize`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::config::ModelConfig;
use crate::error::ResourceKind;
use crate::memory::{MemoryGovernor, MemoryReservation};
use crate::window::{now_ms, WindowCounter, DAY_MS, MINUTE_MS};

/// Which dimension blocked a reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocker {
    /// `max_concurrent_requests` is exhausted
    Concurrency,
    /// one of the four window counters is exhausted
    Window(ResourceKind),
    /// the memory governor has no spare budget
    Memory,
}

/// The estimate used to reserve capacity for one job.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReserveEstimate {
    /// estimated requests this job will consume
    pub requests: u64,
    /// estimated tokens this job will consume
    pub tokens: u64,
    /// estimated memory this job will use, in kilobytes
    pub memory_kb: Option<u64>,
}

/// The actually-observed usage of a completed job, for reconciliation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Actual {
    /// actual requests consumed
    pub requests: u64,
    /// actual tokens consumed (input + cached + output)
    pub tokens: u64,
}

/// A window it was reserved against, captured at reservation time so a refund can be dropped
/// if the window has since rolled over.
#[derive(Debug, Clone, Copy, Default)]
struct ReservedWindows {
    rpm: u64,
    tpm: u64,
    rpd: u64,
    tpd: u64,
}

/// A successful reservation against one model's limits.
#[derive(Debug)]
pub struct Reservation {
    estimate: ReserveEstimate,
    windows: ReservedWindows,
    memory: Option<MemoryReservation>,
}

/// An overage: actual usage exceeded the estimate, so the overage always counts.
#[derive(Debug, Clone)]
pub struct OverageEvent {
    /// the model this overage was recorded against
    pub model_id: String,
    /// the job type this overage was recorded against
    pub job_type_id: String,
    /// which dimension overran
    pub resource: ResourceKind,
    /// what was reserved
    pub estimated: u64,
    /// what was actually used
    pub actual: u64,
    /// `actual - estimated`
    pub overage: u64,
    /// wall-clock time the overage was recorded, in epoch milliseconds
    pub at: u64,
}

struct Counters {
    rpm: WindowCounter,
    tpm: WindowCounter,
    rpd: WindowCounter,
    tpd: WindowCounter,
    concurrent: u64,
    concurrency_limit: Option<u64>,
}

/// The aggregate limiter for one model: four window counters, a concurrency count, an optional
/// memory binding, and a wait queue admission callers can block on.
pub struct ModelLimiter {
    counters: Mutex<Counters>,
    memory: Option<Arc<MemoryGovernor>>,
    in_flight_gauge: AtomicU64,
}

impl ModelLimiter {
    /// Build a limiter from a model's configuration. `memory` is typically shared (via `Arc`)
    /// across every model bound to the same process-local memory policy.
    pub fn new(config: &ModelConfig, memory: Option<Arc<MemoryGovernor>>) -> Self {
        let now = now_ms();
        Self {
            counters: Mutex::new(Counters {
                rpm: WindowCounter::new_at(now, MINUTE_MS, config.requests_per_minute),
                tpm: WindowCounter::new_at(now, MINUTE_MS, config.tokens_per_minute),
                rpd: WindowCounter::new_at(now, DAY_MS, config.requests_per_day),
                tpd: WindowCounter::new_at(now, DAY_MS, config.tokens_per_day),
                concurrent: 0,
                concurrency_limit: config.max_concurrent_requests,
            }),
            memory,
            in_flight_gauge: AtomicU64::new(0),
        }
    }

    /// Try to reserve capacity for one job. On success, returns a [`Reservation`] to hold for
    /// the job's duration and release via [`ModelLimiter::release`].
    pub fn try_reserve(&self, estimate: ReserveEstimate) -> Result<Reservation, Blocker> {
        let now = now_ms();
        let memory = match (&self.memory, estimate.memory_kb) {
            (Some(governor), Some(kb)) => {
                let reservation = governor.try_acquire(kb).ok_or(Blocker::Memory)?;
                Some(reservation)
            }
            _ => None,
        };

        let mut counters = self.counters.lock().expect("model limiter mutex poisoned");

        if let Some(limit) = counters.concurrency_limit {
            if counters.concurrent >= limit {
                drop(counters);
                if let Some(m) = memory {
                    self.memory.as_ref().expect("memory present").release(m);
                }
                return Err(Blocker::Concurrency);
            }
        }

        if !counters.rpm.has_capacity_for(now, estimate.requests) {
            return self.fail(counters, memory, Blocker::Window(ResourceKind::RequestsPerMinute));
        }
        if !counters.tpm.has_capacity_for(now, estimate.tokens) {
            return self.fail(counters, memory, Blocker::Window(ResourceKind::TokensPerMinute));
        }
        if !counters.rpd.has_capacity_for(now, estimate.requests) {
            return self.fail(counters, memory, Blocker::Window(ResourceKind::RequestsPerDay));
        }
        if !counters.tpd.has_capacity_for(now, estimate.tokens) {
            return self.fail(counters, memory, Blocker::Window(ResourceKind::TokensPerDay));
        }

        counters.concurrent += 1;
        let windows = ReservedWindows {
            rpm: counters.rpm.window_start(),
            tpm: counters.tpm.window_start(),
            rpd: counters.rpd.window_start(),
            tpd: counters.tpd.window_start(),
        };
        counters.rpm.add(now, estimate.requests);
        counters.tpm.add(now, estimate.tokens);
        counters.rpd.add(now, estimate.requests);
        counters.tpd.add(now, estimate.tokens);

        self.in_flight_gauge.fetch_add(1, Ordering::SeqCst);

        Ok(Reservation {
            estimate,
            windows,
            memory,
        })
    }

    fn fail(
        &self,
        counters: std::sync::MutexGuard<'_, Counters>,
        memory: Option<MemoryReservation>,
        blocker: Blocker,
    ) -> Result<Reservation, Blocker> {
        drop(counters);
        if let Some(m) = memory {
            self.memory.as_ref().expect("memory present").release(m);
        }
        Err(blocker)
    }

    /// Release a reservation, reconciling estimate against actual usage.
    ///
    /// Under-usage is refunded if the reservation's captured window is still current;
    /// over-usage always counts and is reported as an [`OverageEvent`].
    pub fn release(
        &self,
        reservation: Reservation,
        actual: Option<Actual>,
        model_id: &str,
        job_type_id: &str,
    ) -> Vec<OverageEvent> {
        let mut overages = Vec::new();
        let now = now_ms();
        let mut counters = self.counters.lock().expect("model limiter mutex poisoned");

        if let Some(actual) = actual {
            reconcile(
                &mut counters.rpm,
                reservation.windows.rpm,
                reservation.estimate.requests,
                actual.requests,
                ResourceKind::RequestsPerMinute,
                now,
                model_id,
                job_type_id,
                &mut overages,
            );
            reconcile(
                &mut counters.tpm,
                reservation.windows.tpm,
                reservation.estimate.tokens,
                actual.tokens,
                ResourceKind::TokensPerMinute,
                now,
                model_id,
                job_type_id,
                &mut overages,
            );
            reconcile(
                &mut counters.rpd,
                reservation.windows.rpd,
                reservation.estimate.requests,
                actual.requests,
                ResourceKind::RequestsPerDay,
                now,
                model_id,
                job_type_id,
                &mut overages,
            );
            reconcile(
                &mut counters.tpd,
                reservation.windows.tpd,
                reservation.estimate.tokens,
                actual.tokens,
                ResourceKind::TokensPerDay,
                now,
                model_id,
                job_type_id,
                &mut overages,
            );
        }

        counters.concurrent = counters.concurrent.saturating_sub(1);
        drop(counters);

        self.in_flight_gauge.fetch_sub(1, Ordering::SeqCst);

        if let (Some(governor), Some(m)) = (&self.memory, reservation.memory) {
            governor.release(m);
        }

        for overage in &overages {
            debug!(
                resource = %overage.resource,
                estimated = overage.estimated,
                actual = overage.actual,
                overage = overage.overage,
                "overage recorded"
            );
        }

        overages
    }

    /// Replace a window dimension's limit without resetting its count (spec §4.8: pool
    /// reallocation never clears an in-progress window).
    pub fn set_limits(
        &self,
        requests_per_minute: Option<u64>,
        tokens_per_minute: Option<u64>,
        requests_per_day: Option<u64>,
        tokens_per_day: Option<u64>,
        max_concurrent_requests: Option<u64>,
    ) {
        let mut counters = self.counters.lock().expect("model limiter mutex poisoned");
        counters.rpm.set_limit(requests_per_minute);
        counters.tpm.set_limit(tokens_per_minute);
        counters.rpd.set_limit(requests_per_day);
        counters.tpd.set_limit(tokens_per_day);
        counters.concurrency_limit = max_concurrent_requests;
        warn!("model limits updated by pool reallocation");
    }

    /// Current in-flight count, for observability and job-type slot sizing.
    pub fn in_flight(&self) -> u64 {
        self.in_flight_gauge.load(Ordering::SeqCst)
    }

    /// The process-local memory budget currently allowed for this model's jobs, if a memory
    /// policy is bound. Feeds [`crate::job_type::JobTypeAllocator::slots_for`]'s memory
    /// dimension.
    pub fn memory_allowed_kb(&self) -> Option<u64> {
        self.memory.as_ref().map(|m| m.allowed_kb())
    }

    /// Roll any of the four window counters that are due, reporting whether at least one
    /// reset just happened. Polled from the heartbeat loop to drive `SlotChangeReason::WindowReset`.
    pub fn poll_window_reset(&self) -> bool {
        let now = now_ms();
        let mut counters = self.counters.lock().expect("model limiter mutex poisoned");
        let rpm = counters.rpm.poll_reset(now);
        let tpm = counters.tpm.poll_reset(now);
        let rpd = counters.rpd.poll_reset(now);
        let tpd = counters.tpd.poll_reset(now);
        rpm || tpm || rpd || tpd
    }

    /// Snapshot stats for all four window counters.
    pub fn stats(&self) -> ModelStats {
        let now = now_ms();
        let mut counters = self.counters.lock().expect("model limiter mutex poisoned");
        ModelStats {
            rpm: counters.rpm.stats(now),
            tpm: counters.tpm.stats(now),
            rpd: counters.rpd.stats(now),
            tpd: counters.tpd.stats(now),
            concurrent: counters.concurrent,
            concurrency_limit: counters.concurrency_limit,
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn reconcile(
    counter: &mut WindowCounter,
    reserved_window_start: u64,
    estimated: u64,
    actual: u64,
    resource: ResourceKind,
    now: u64,
    model_id: &str,
    job_type_id: &str,
    overages: &mut Vec<OverageEvent>,
) {
    if actual < estimated {
        let refund = estimated - actual;
        counter.subtract_if_same_window(refund, reserved_window_start);
    } else if actual > estimated {
        let overage = actual - estimated;
        counter.add(now, overage);
        overages.push(OverageEvent {
            model_id: model_id.to_string(),
            job_type_id: job_type_id.to_string(),
            resource,
            estimated,
            actual,
            overage,
            at: now,
        });
    }
}

/// Observability snapshot of one model's counters.
#[derive(Debug, Clone, Copy)]
pub struct ModelStats {
    /// requests-per-minute counter stats
    pub rpm: crate::window::WindowStats,
    /// tokens-per-minute counter stats
    pub tpm: crate::window::WindowStats,
    /// requests-per-day counter stats
    pub rpd: crate::window::WindowStats,
    /// tokens-per-day counter stats
    pub tpd: crate::window::WindowStats,
    /// current in-flight requests
    pub concurrent: u64,
    /// configured concurrency limit, if any
    pub concurrency_limit: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(rpm: Option<u64>, tpm: Option<u64>) -> ModelConfig {
        ModelConfig {
            requests_per_minute: rpm,
            tokens_per_minute: tpm,
            requests_per_day: None,
            tokens_per_day: None,
            max_concurrent_requests: None,
            default_estimate: crate::config::ResourceEstimate {
                estimated_number_of_requests: 1,
                estimated_used_tokens: 10,
                estimated_used_memory_kb: None,
            },
        }
    }

    #[test]
    fn reserve_and_release_without_overage() {
        let limiter = ModelLimiter::new(&model(Some(10), Some(100)), None);
        let reservation = limiter
            .try_reserve(ReserveEstimate {
                requests: 1,
                tokens: 10,
                memory_kb: None,
            })
            .unwrap();
        assert_eq!(limiter.in_flight(), 1);

        let overages = limiter.release(
            reservation,
            Some(Actual {
                requests: 1,
                tokens: 10,
            }),
            "alpha",
            "default",
        );
        assert!(overages.is_empty());
        assert_eq!(limiter.in_flight(), 0);
        assert_eq!(limiter.stats().tpm.current, 10);
    }

    #[test]
    fn refund_applies_on_underuse() {
        let limiter = ModelLimiter::new(&model(Some(10), Some(100)), None);
        let reservation = limiter
            .try_reserve(ReserveEstimate {
                requests: 1,
                tokens: 50,
                memory_kb: None,
            })
            .unwrap();

        limiter.release(
            reservation,
            Some(Actual {
                requests: 1,
                tokens: 20,
            }),
            "alpha",
            "default",
        );
        assert_eq!(limiter.stats().tpm.current, 20, "30 tokens refunded");
    }

    #[test]
    fn overage_always_counts_and_is_reported() {
        let limiter = ModelLimiter::new(&model(Some(10), Some(1_000)), None);
        let reservation = limiter
            .try_reserve(ReserveEstimate {
                requests: 1,
                tokens: 10_000,
                memory_kb: None,
            })
            .unwrap();

        let overages = limiter.release(
            reservation,
            Some(Actual {
                requests: 3,
                tokens: 6_000,
            }),
            "alpha",
            "default",
        );

        // tokens: estimated 10_000, actual 6_000 -> refund, tpm counter = 6_000
        // requests: estimated 1, actual 3 -> overage of 2
        assert_eq!(limiter.stats().tpm.current, 6_000);
        assert_eq!(limiter.stats().rpm.current, 3);
        assert_eq!(overages.len(), 1);
        assert_eq!(overages[0].resource, ResourceKind::RequestsPerMinute);
        assert_eq!(overages[0].overage, 2);
        assert_eq!(overages[0].model_id, "alpha");
        assert_eq!(overages[0].job_type_id, "default");
    }

    #[test]
    fn concurrency_limit_blocks_reservation() {
        let mut cfg = model(None, None);
        cfg.max_concurrent_requests = Some(1);
        let limiter = ModelLimiter::new(&cfg, None);

        let _r1 = limiter
            .try_reserve(ReserveEstimate {
                requests: 1,
                tokens: 1,
                memory_kb: None,
            })
            .unwrap();

        let err = limiter
            .try_reserve(ReserveEstimate {
                requests: 1,
                tokens: 1,
                memory_kb: None,
            })
            .unwrap_err();
        assert_eq!(err, Blocker::Concurrency);
    }

    #[test]
    fn set_limits_does_not_reset_counters() {
        let limiter = ModelLimiter::new(&model(Some(10), Some(100)), None);
        let reservation = limiter
            .try_reserve(ReserveEstimate {
                requests: 5,
                tokens: 50,
                memory_kb: None,
            })
            .unwrap();
        limiter.release(
            reservation,
            Some(Actual {
                requests: 5,
                tokens: 50,
            }),
            "alpha",
            "default",
        );
        assert_eq!(limiter.stats().rpm.current, 5);

        limiter.set_limits(Some(3), Some(100), None, None, None);
        assert_eq!(limiter.stats().rpm.current, 5, "count untouched by set_limits");
        assert!(limiter
            .try_reserve(ReserveEstimate {
                requests: 1,
                tokens: 1,
                memory_kb: None,
            })
            .is_err());
    }
}
