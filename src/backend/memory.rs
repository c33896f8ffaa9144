//! An in-process [`Backend`] backed by plain `Mutex`-guarded maps.
//!
//! Doubles as the test harness (several [`crate::Scheduler`]s can share one
//! `Arc<MemoryBackend>` to simulate N instances) and as the reference single-process
//! deployment. `acquire`/`release` enforce the *aggregate*, undivided quota directly — the
//! safety net spec.md §4.8 describes backing the reconverge-tolerant pool division every
//! instance applies locally.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use crate::job::InstanceId;
use crate::window::{now_ms, WindowCounter, DAY_MS, MINUTE_MS};

use super::{AcquireContext, AllocationCallback, AllocationInfo, Backend, ModelPool, Unsubscribe};

/// A model's configured aggregate quota, as the backend enforces it across every instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelQuota {
    /// aggregate requests per minute across all instances, or `None` for unlimited
    pub requests_per_minute: Option<u64>,
    /// aggregate tokens per minute across all instances, or `None` for unlimited
    pub tokens_per_minute: Option<u64>,
    /// aggregate requests per day across all instances, or `None` for unlimited
    pub requests_per_day: Option<u64>,
    /// aggregate tokens per day across all instances, or `None` for unlimited
    pub tokens_per_day: Option<u64>,
    /// aggregate concurrency across all instances, or `None` for unlimited
    pub total_slots: Option<u64>,
}

struct Aggregate {
    rpm: WindowCounter,
    tpm: WindowCounter,
    rpd: WindowCounter,
    tpd: WindowCounter,
    concurrent: u64,
    total_slots: Option<u64>,
}

impl Aggregate {
    fn new(quota: ModelQuota) -> Self {
        let now = now_ms();
        Self {
            rpm: WindowCounter::new_at(now, MINUTE_MS, quota.requests_per_minute),
            tpm: WindowCounter::new_at(now, MINUTE_MS, quota.tokens_per_minute),
            rpd: WindowCounter::new_at(now, DAY_MS, quota.requests_per_day),
            tpd: WindowCounter::new_at(now, DAY_MS, quota.tokens_per_day),
            concurrent: 0,
            total_slots: quota.total_slots,
        }
    }
}

struct Subscriber {
    callback: AllocationCallback,
}

/// A registered peer's last renewal time and the TTL it announced when it last renewed.
struct InstanceEntry {
    last_seen_ms: u64,
    timeout_ms: u64,
}

struct Inner {
    quotas: HashMap<String, ModelQuota>,
    aggregates: HashMap<String, Aggregate>,
    instances: HashMap<InstanceId, InstanceEntry>,
    subscribers: HashMap<InstanceId, Subscriber>,
}

/// An in-memory, single-process backend.
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    total_acquires: AtomicU64,
    total_releases: AtomicU64,
}

impl MemoryBackend {
    /// Build a backend from the aggregate quota for each model.
    pub fn new(quotas: HashMap<String, ModelQuota>) -> Self {
        let aggregates = quotas
            .iter()
            .map(|(id, q)| (id.clone(), Aggregate::new(*q)))
            .collect();
        Self {
            inner: Mutex::new(Inner {
                quotas,
                aggregates,
                instances: HashMap::new(),
                subscribers: HashMap::new(),
            }),
            total_acquires: AtomicU64::new(0),
            total_releases: AtomicU64::new(0),
        }
    }

    /// Total successful `acquire` calls, for test assertions.
    pub fn total_acquires(&self) -> u64 {
        self.total_acquires.load(Ordering::SeqCst)
    }

    /// Total `release` calls, for test assertions.
    pub fn total_releases(&self) -> u64 {
        self.total_releases.load(Ordering::SeqCst)
    }

    /// Drop any instance whose last renewal is older than the TTL it last announced (spec
    /// §4.8: "instances whose heartbeat has not renewed within TTL are removed from the peer
    /// set").
    fn prune_expired(inner: &mut Inner, now: u64) {
        let expired: Vec<InstanceId> = inner
            .instances
            .iter()
            .filter(|(_, entry)| now.saturating_sub(entry.last_seen_ms) > entry.timeout_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            inner.instances.remove(&id);
            inner.subscribers.remove(&id);
            info!(instance = %id, "instance heartbeat expired, dropped from peer set");
        }
    }

    fn compute_allocation(inner: &Inner) -> AllocationInfo {
        let instance_count = inner.instances.len().max(1) as u64;
        let mut pools = HashMap::new();
        for (model_id, quota) in &inner.quotas {
            pools.insert(
                model_id.clone(),
                ModelPool {
                    total_slots: quota.total_slots.map(|n| n / instance_count),
                    tokens_per_minute: quota.tokens_per_minute.map(|n| n / instance_count),
                    requests_per_minute: quota.requests_per_minute.map(|n| n / instance_count),
                    tokens_per_day: quota.tokens_per_day.map(|n| n / instance_count),
                    requests_per_day: quota.requests_per_day.map(|n| n / instance_count),
                },
            );
        }
        AllocationInfo {
            instance_count,
            pools,
        }
    }

    fn recompute_and_publish(inner: &mut Inner) -> AllocationInfo {
        let info = Self::compute_allocation(inner);
        info!(instance_count = info.instance_count, "pool reallocated");
        for sub in inner.subscribers.values() {
            (sub.callback)(info.clone());
        }
        info
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn acquire(&self, ctx: &AcquireContext) -> bool {
        let now = now_ms();
        let mut inner = self.inner.lock().expect("memory backend mutex poisoned");
        let Some(agg) = inner.aggregates.get_mut(&ctx.model_id) else {
            return true; // no aggregate quota configured for this model: always admit
        };

        if let Some(limit) = agg.total_slots {
            if agg.concurrent >= limit {
                return false;
            }
        }
        if !agg.rpm.has_capacity_for(now, ctx.estimated_requests) {
            return false;
        }
        if !agg.tpm.has_capacity_for(now, ctx.estimated_tokens) {
            return false;
        }
        if !agg.rpd.has_capacity_for(now, ctx.estimated_requests) {
            return false;
        }
        if !agg.tpd.has_capacity_for(now, ctx.estimated_tokens) {
            return false;
        }

        agg.rpm.add(now, ctx.estimated_requests);
        agg.tpm.add(now, ctx.estimated_tokens);
        agg.rpd.add(now, ctx.estimated_requests);
        agg.tpd.add(now, ctx.estimated_tokens);
        agg.concurrent += 1;

        self.total_acquires.fetch_add(1, Ordering::SeqCst);
        true
    }

    async fn release(&self, ctx: &AcquireContext) {
        let now = now_ms();
        let mut inner = self.inner.lock().expect("memory backend mutex poisoned");
        if let Some(agg) = inner.aggregates.get_mut(&ctx.model_id) {
            refund(&mut agg.rpm, now, ctx.estimated_requests);
            refund(&mut agg.tpm, now, ctx.estimated_tokens);
            refund(&mut agg.rpd, now, ctx.estimated_requests);
            refund(&mut agg.tpd, now, ctx.estimated_tokens);
            agg.concurrent = agg.concurrent.saturating_sub(1);
        }
        self.total_releases.fetch_add(1, Ordering::SeqCst);
    }

    async fn register(&self, instance_id: &InstanceId, heartbeat_timeout_ms: u64) -> AllocationInfo {
        let now = now_ms();
        let mut inner = self.inner.lock().expect("memory backend mutex poisoned");
        let joined = inner
            .instances
            .insert(
                instance_id.clone(),
                InstanceEntry {
                    last_seen_ms: now,
                    timeout_ms: heartbeat_timeout_ms,
                },
            )
            .is_none();
        if joined {
            info!(instance = %instance_id, "instance joined");
        }
        Self::prune_expired(&mut inner, now);
        Self::recompute_and_publish(&mut inner)
    }

    async fn unregister(&self, instance_id: &InstanceId) {
        let now = now_ms();
        let mut inner = self.inner.lock().expect("memory backend mutex poisoned");
        if inner.instances.remove(instance_id).is_some() {
            info!(instance = %instance_id, "instance left");
        }
        inner.subscribers.remove(instance_id);
        Self::prune_expired(&mut inner, now);
        Self::recompute_and_publish(&mut inner);
    }

    async fn subscribe(&self, instance_id: &InstanceId, on_update: AllocationCallback) -> Unsubscribe {
        let mut inner = self.inner.lock().expect("memory backend mutex poisoned");
        inner.subscribers.insert(
            instance_id.clone(),
            Subscriber {
                callback: on_update,
            },
        );
        drop(inner);
        Box::new(|| {})
    }
}

fn refund(counter: &mut WindowCounter, now: u64, n: u64) {
    let reserved_window_start = counter.window_start();
    counter.stats(now); // roll the window if it has since expired
    counter.subtract_if_same_window(n, reserved_window_start);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(model: &str, tokens: u64, requests: u64) -> AcquireContext {
        AcquireContext {
            model_id: model.to_string(),
            job_type_id: "default".to_string(),
            estimated_tokens: tokens,
            estimated_requests: requests,
        }
    }

    fn quotas() -> HashMap<String, ModelQuota> {
        let mut m = HashMap::new();
        m.insert(
            "alpha".to_string(),
            ModelQuota {
                requests_per_minute: Some(10),
                tokens_per_minute: Some(100),
                requests_per_day: None,
                tokens_per_day: None,
                total_slots: None,
            },
        );
        m
    }

    #[tokio::test]
    async fn two_instance_token_coordination() {
        let backend = MemoryBackend::new(quotas());
        let a = ctx("alpha", 10, 1);
        let b = ctx("alpha", 10, 1);

        assert!(backend.acquire(&a).await);
        assert!(backend.acquire(&b).await);
        assert_eq!(backend.total_acquires(), 2);

        // actual usage of 20 each means +10 overage each, applied directly via add() in a real
        // limiter; here we simulate the estimate-only release the backend sees.
        backend.release(&a).await;
        backend.release(&b).await;
        assert_eq!(backend.total_releases(), 2);
    }

    #[tokio::test]
    async fn aggregate_cap_rejects_over_budget() {
        let backend = MemoryBackend::new(quotas());
        assert!(backend.acquire(&ctx("alpha", 60, 1)).await);
        assert!(!backend.acquire(&ctx("alpha", 60, 1)).await, "60 + 60 > 100 tpm");
    }

    #[tokio::test]
    async fn register_divides_pool_by_instance_count() {
        let backend = MemoryBackend::new(quotas());
        let i1 = InstanceId::generate();
        let i2 = InstanceId::generate();

        let info1 = backend.register(&i1, 15_000).await;
        assert_eq!(info1.instance_count, 1);
        assert_eq!(info1.pools["alpha"].tokens_per_minute, Some(100));

        let info2 = backend.register(&i2, 15_000).await;
        assert_eq!(info2.instance_count, 2);
        assert_eq!(info2.pools["alpha"].tokens_per_minute, Some(50));
    }

    #[tokio::test]
    async fn stale_instance_is_pruned_on_next_register() {
        let backend = MemoryBackend::new(quotas());
        let i1 = InstanceId::generate();
        let i2 = InstanceId::generate();

        // i1 registers with a TTL of 0: it is immediately eligible for pruning.
        backend.register(&i1, 0).await;
        // give the TTL a chance to actually elapse in wall-clock time.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let info = backend.register(&i2, 15_000).await;

        assert_eq!(info.instance_count, 1, "i1's heartbeat expired and should have been pruned");
        assert_eq!(info.pools["alpha"].tokens_per_minute, Some(100));
    }
}
