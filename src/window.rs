//! Fixed-window counting for a single resource dimension (RPM, TPM, RPD or TPD).
//!
//! A [`WindowCounter`] is plain data — it does no synchronisation of its own. Callers
//! (in practice, [`crate::model_limiter::ModelLimiter`]) own the mutex that makes reads and
//! writes atomic across the several counters that make up one model's limits.

use std::time::{SystemTime, UNIX_EPOCH};

/// A minute window, in milliseconds.
pub const MINUTE_MS: u64 = 60_000;
/// A day window, in milliseconds.
pub const DAY_MS: u64 = 86_400_000;

/// Current wall-clock time in milliseconds since the epoch.
///
/// Windows are aligned to wall-clock time (not process-local monotonic time) because they
/// must agree across instances sharing a backend.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_millis()
        .try_into()
        .expect("current time overflows u64 milliseconds")
}

/// `floor(t / window_ms)`, i.e. the ordinal of the window containing `t`.
pub fn current_window_id(t: u64, window_ms: u64) -> u64 {
    t / window_ms
}

/// Point-in-time statistics for a counter, as returned by [`WindowCounter::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStats {
    /// count in the current window
    pub current: u64,
    /// configured limit, if any
    pub limit: Option<u64>,
    /// `max(0, limit - current)`, or `None` if unlimited
    pub remaining: Option<u64>,
    /// milliseconds until this window rolls over
    pub resets_in_ms: u64,
}

/// A fixed-window counter for one resource dimension.
///
/// `window_ms` is fixed at construction (60 000 for minute windows, 86 400 000 for day
/// windows). `window_start` is always a multiple of `window_ms`. All arithmetic is integer;
/// there is no floating-point accumulation.
#[derive(Debug, Clone)]
pub struct WindowCounter {
    window_ms: u64,
    window_start: u64,
    count: u64,
    limit: Option<u64>,
}

impl WindowCounter {
    /// Create a counter for the window starting now, with the given limit (`None` = unlimited).
    pub fn new(window_ms: u64, limit: Option<u64>) -> Self {
        Self::new_at(now_ms(), window_ms, limit)
    }

    /// As [`WindowCounter::new`] but pinned to a given time, for deterministic tests.
    pub fn new_at(now: u64, window_ms: u64, limit: Option<u64>) -> Self {
        assert!(window_ms > 0, "window_ms must be > 0");
        Self {
            window_ms,
            window_start: current_window_id(now, window_ms) * window_ms,
            count: 0,
            limit,
        }
    }

    /// Roll the window over if `now` falls in a later window than the one we're tracking.
    /// Reports whether a roll occurred.
    fn roll(&mut self, now: u64) -> bool {
        let start = current_window_id(now, self.window_ms) * self.window_ms;
        if start > self.window_start {
            self.window_start = start;
            self.count = 0;
            true
        } else {
            false
        }
    }

    /// Roll the window if due, reporting whether a reset just occurred. Used to drive
    /// `SlotChangeReason::WindowReset` notifications for capacity that reopens implicitly.
    pub fn poll_reset(&mut self, now: u64) -> bool {
        self.roll(now)
    }

    /// `count + n <= limit` (always true if unlimited), after rolling the window if needed.
    pub fn has_capacity_for(&mut self, now: u64, n: u64) -> bool {
        self.roll(now);
        match self.limit {
            None => true,
            Some(limit) => self.count + n <= limit,
        }
    }

    /// `has_capacity_for(now, 1)`.
    pub fn has_capacity(&mut self, now: u64) -> bool {
        self.has_capacity_for(now, 1)
    }

    /// Unconditionally increase the count by `n`, rolling the window first.
    pub fn add(&mut self, now: u64, n: u64) {
        self.roll(now);
        self.count += n;
    }

    /// `add(now, 1)`.
    pub fn increment(&mut self, now: u64) {
        self.add(now, 1);
    }

    /// Subtract `n` from the count, but only if the window hasn't rolled over since
    /// `reserved_window_start` was captured. Returns whether the refund was applied.
    ///
    /// This never rolls the window itself — an intervening roll simply means the refund is
    /// dropped, since the window that earned it is gone.
    pub fn subtract_if_same_window(&mut self, n: u64, reserved_window_start: u64) -> bool {
        if self.window_start != reserved_window_start {
            return false;
        }
        self.count = self.count.saturating_sub(n);
        true
    }

    /// Replace the limit without resetting the count.
    ///
    /// A counter may therefore temporarily sit above its new (lower) limit, blocking further
    /// admission until the window rolls over naturally. This is deliberate: see the "setLimit"
    /// open question resolved in SPEC_FULL.md.
    pub fn set_limit(&mut self, new_limit: Option<u64>) {
        self.limit = new_limit;
    }

    /// The window start this counter currently believes it's in, without rolling.
    pub fn window_start(&self) -> u64 {
        self.window_start
    }

    /// The window size in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Snapshot the counter's stats as of `now`, rolling the window if needed.
    pub fn stats(&mut self, now: u64) -> WindowStats {
        self.roll(now);
        let remaining = self.limit.map(|l| l.saturating_sub(self.count));
        let resets_in_ms = (self.window_start + self.window_ms).saturating_sub(now);
        WindowStats {
            current: self.count,
            limit: self.limit,
            remaining,
            resets_in_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_capacity_respects_limit() {
        let mut c = WindowCounter::new_at(0, MINUTE_MS, Some(2));
        assert!(c.has_capacity_for(0, 2));
        assert!(!c.has_capacity_for(0, 3));
        c.add(0, 2);
        assert!(!c.has_capacity(0));
    }

    #[test]
    fn unlimited_always_has_capacity() {
        let mut c = WindowCounter::new_at(0, MINUTE_MS, None);
        c.add(0, 1_000_000);
        assert!(c.has_capacity_for(0, u64::MAX - 1_000_000));
    }

    #[test]
    fn window_rolls_over_and_resets_count() {
        let mut c = WindowCounter::new_at(0, MINUTE_MS, Some(5));
        c.add(0, 5);
        assert!(!c.has_capacity(0));
        assert!(c.has_capacity(MINUTE_MS));
        let stats = c.stats(MINUTE_MS);
        assert_eq!(stats.current, 0);
        assert_eq!(stats.remaining, Some(5));
    }

    #[test]
    fn refund_dropped_across_window_roll() {
        let mut c = WindowCounter::new_at(0, MINUTE_MS, Some(10));
        c.add(0, 10);
        let reserved_start = c.window_start();

        // window rolls before the refund arrives
        c.has_capacity(MINUTE_MS);

        let applied = c.subtract_if_same_window(10, reserved_start);
        assert!(!applied, "refund against a stale window must be dropped");
        assert_eq!(c.stats(MINUTE_MS).current, 0);
    }

    #[test]
    fn refund_applied_within_same_window() {
        let mut c = WindowCounter::new_at(0, MINUTE_MS, Some(10));
        c.add(0, 10);
        let reserved_start = c.window_start();

        let applied = c.subtract_if_same_window(4, reserved_start);
        assert!(applied);
        assert_eq!(c.stats(0).current, 6);
    }

    #[test]
    fn subtract_never_goes_negative() {
        let mut c = WindowCounter::new_at(0, MINUTE_MS, Some(10));
        c.add(0, 2);
        let start = c.window_start();
        c.subtract_if_same_window(100, start);
        assert_eq!(c.stats(0).current, 0);
    }

    #[test]
    fn set_limit_does_not_reset_count_and_can_leave_counter_over_limit() {
        let mut c = WindowCounter::new_at(0, MINUTE_MS, Some(10));
        c.add(0, 8);
        c.set_limit(Some(5));
        assert_eq!(c.stats(0).current, 8, "count is untouched by set_limit");
        assert!(!c.has_capacity(0), "over-limit counter blocks admission");

        // only a window roll clears it
        assert!(c.has_capacity(MINUTE_MS));
    }
}
