//! FIFO admission queue for a single `try_reserve` predicate.
//!
//! Modelled on the teacher's waiter list in `limiter::partitioning::Scheduler`: a `Mutex`-guarded
//! list of one-shot senders, woken strictly head-first, each carrying the admitted payload
//! straight to its waiter — the same shape as the teacher handing a [`Token`] down its
//! `oneshot::Sender<Token>`. Here the payload is whatever `try_reserve` produces (typically a
//! [`crate::model_limiter::Reservation`]) rather than a semaphore permit, since admission here
//! spans several counters under one lock rather than a single semaphore.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;

struct Waiter<T> {
    id: u64,
    tx: oneshot::Sender<T>,
}

/// A FIFO queue of waiters, each with its own timeout, all blocked on the same admission
/// predicate producing a `T` (e.g. a reservation).
#[derive(Debug)]
pub struct WaitQueue<T> {
    waiters: Mutex<VecDeque<Waiter<T>>>,
    next_id: AtomicU64,
}

impl<T> Default for WaitQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WaitQueue<T> {
    /// A new, empty queue.
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Try `try_reserve` once inline; if it fails and `max_wait` is non-zero, enqueue and wait
    /// up to `max_wait` for [`WaitQueue::notify_capacity_available`] to admit us.
    ///
    /// A `max_wait` of zero never enqueues: the decision is returned synchronously.
    pub async fn wait_for_capacity<F>(&self, try_reserve: F, max_wait: Duration) -> Option<T>
    where
        F: Fn() -> Option<T>,
    {
        if max_wait.is_zero() {
            return try_reserve();
        }

        if let Some(admitted) = try_reserve() {
            return Some(admitted);
        }

        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut waiters = self.waiters.lock().await;
            waiters.push_back(Waiter { id, tx });
        }

        match timeout(max_wait, rx).await {
            // admitted by the wake path, carrying the payload it produced for us
            Ok(Ok(admitted)) => Some(admitted),
            // sender dropped without sending (e.g. `clear()`): treat as rejected
            Ok(Err(_)) => None,
            Err(_elapsed) => {
                self.remove(id).await;
                None
            }
        }
    }

    /// Wake as many head-of-line waiters as `try_reserve` admits, strictly in FIFO order.
    ///
    /// Stops at the first waiter `try_reserve` rejects — later waiters are never served ahead
    /// of an earlier one still waiting for capacity.
    pub async fn notify_capacity_available<F>(&self, mut try_reserve: F)
    where
        F: FnMut() -> Option<T>,
    {
        let mut waiters = self.waiters.lock().await;
        while let Some(front) = waiters.front() {
            if front.tx.is_closed() {
                // the waiter already gave up (timed out) and its receiver was dropped
                waiters.pop_front();
                continue;
            }
            match try_reserve() {
                Some(admitted) => {
                    if let Some(waiter) = waiters.pop_front() {
                        let _ = waiter.tx.send(admitted);
                    }
                }
                None => break,
            }
        }
    }

    /// Resolve every pending waiter as rejected and empty the queue. Used on shutdown.
    pub async fn clear(&self) {
        let mut waiters = self.waiters.lock().await;
        waiters.drain(..); // dropping each Waiter drops its sender, closing the receiver as "rejected"
    }

    async fn remove(&self, id: u64) {
        let mut waiters = self.waiters.lock().await;
        waiters.retain(|w| w.id != id);
    }

    /// Number of waiters currently queued. For observability/tests only.
    pub async fn len(&self) -> usize {
        self.waiters.lock().await.len()
    }

    /// Whether the queue is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
