//! Process-local memory capacity gate.
//!
//! Gates jobs whose `estimated_used_memory_kb` would push total reserved memory past
//! `free_memory_ratio` of system-available memory. Purely local — never shared across
//! instances, unlike every other limit in this crate.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use sysinfo::System;
use tokio::time::Instant;

use crate::config::MemoryConfig;

/// A memory budget reservation, released when the job completes.
#[derive(Debug)]
pub struct MemoryReservation {
    kb: u64,
}

/// Recomputes `allowed_concurrent_memory` on a timer and gates admission against it.
#[derive(Debug)]
pub struct MemoryGovernor {
    config: MemoryConfig,
    reserved_kb: AtomicU64,
    allowed_concurrent_kb: AtomicI64,
    last_recalc: Mutex<Instant>,
}

impl MemoryGovernor {
    /// Build a governor from config, performing an initial capacity calculation.
    pub fn new(config: MemoryConfig) -> Self {
        let allowed = Self::calculate(&config);
        Self {
            config,
            reserved_kb: AtomicU64::new(0),
            allowed_concurrent_kb: AtomicI64::new(allowed),
            last_recalc: Mutex::new(Instant::now()),
        }
    }

    /// Recompute `allowed_concurrent_memory` from real host state, clamped to
    /// `[min_capacity, max_capacity]` if configured. Runs at most once per
    /// `recalculation_interval_ms`, unless `force` is set.
    pub fn maybe_recalculate(&self, force: bool) {
        let mut last = self.last_recalc.lock().expect("memory governor mutex poisoned");
        let interval = Duration::from_millis(self.config.recalculation_interval_ms);
        if !force && last.elapsed() < interval {
            return;
        }
        let allowed = Self::calculate(&self.config);
        self.allowed_concurrent_kb.store(allowed, Ordering::SeqCst);
        *last = Instant::now();
    }

    fn calculate(config: &MemoryConfig) -> i64 {
        let mut sys = System::new();
        sys.refresh_memory();
        let available_kb = match config.max_memory_kb {
            Some(cap) => cap.min(sys.available_memory() / 1024),
            None => sys.available_memory() / 1024,
        };

        let mut allowed = (available_kb as f64 * config.free_memory_ratio) as i64;
        if let Some(min) = config.min_capacity {
            allowed = allowed.max(min as i64);
        }
        if let Some(max) = config.max_capacity {
            allowed = allowed.min(max as i64);
        }
        allowed
    }

    /// Try to acquire `kb` kilobytes of budget. Returns `None` if doing so would exceed the
    /// currently allowed concurrent memory.
    pub fn try_acquire(&self, kb: u64) -> Option<MemoryReservation> {
        self.maybe_recalculate(false);
        let allowed = self.allowed_concurrent_kb.load(Ordering::SeqCst).max(0) as u64;

        let reserved = self.reserved_kb.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
            if cur + kb <= allowed {
                Some(cur + kb)
            } else {
                None
            }
        });

        match reserved {
            Ok(_) => Some(MemoryReservation { kb }),
            Err(_) => None,
        }
    }

    /// Release a previously acquired reservation.
    pub fn release(&self, reservation: MemoryReservation) {
        self.reserved_kb.fetch_sub(reservation.kb, Ordering::SeqCst);
    }

    /// Currently reserved kilobytes, for observability.
    pub fn reserved_kb(&self) -> u64 {
        self.reserved_kb.load(Ordering::SeqCst)
    }

    /// Currently allowed concurrent kilobytes, for observability.
    pub fn allowed_kb(&self) -> u64 {
        self.allowed_concurrent_kb.load(Ordering::SeqCst).max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MemoryConfig {
        MemoryConfig {
            free_memory_ratio: 0.5,
            recalculation_interval_ms: 60_000,
            max_memory_kb: Some(1_000),
            min_capacity: None,
            max_capacity: None,
        }
    }

    #[test]
    fn acquire_and_release_round_trip() {
        let gov = MemoryGovernor::new(config());
        // 1000kb capped available * 0.5 ratio = 500kb allowed
        let r = gov.try_acquire(400).expect("should fit under allowed budget");
        assert_eq!(gov.reserved_kb(), 400);
        gov.release(r);
        assert_eq!(gov.reserved_kb(), 0);
    }

    #[test]
    fn rejects_over_budget() {
        let gov = MemoryGovernor::new(config());
        assert!(gov.try_acquire(10_000).is_none());
    }

    #[test]
    fn clamps_to_min_and_max_capacity() {
        let mut cfg = config();
        cfg.max_capacity = Some(50);
        let gov = MemoryGovernor::new(cfg);
        assert_eq!(gov.allowed_kb(), 50);
    }
}
